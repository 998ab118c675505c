//! Turn the hosting CLI's refusal text into a failure class plus the command a
//! human would run next.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeFailureKind {
    Conflict,
    ChecksPending,
    ChecksFailed,
    BranchProtection,
    ReviewRequired,
    Other,
}

impl MergeFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeFailureKind::Conflict => "conflict",
            MergeFailureKind::ChecksPending => "checks_pending",
            MergeFailureKind::ChecksFailed => "checks_failed",
            MergeFailureKind::BranchProtection => "branch_protection",
            MergeFailureKind::ReviewRequired => "review_required",
            MergeFailureKind::Other => "other",
        }
    }
}

impl fmt::Display for MergeFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeFailure {
    pub number: u64,
    pub kind: MergeFailureKind,
    pub message: String,
    pub remedy: String,
}

impl MergeFailure {
    /// Classify `message` (usually stderr of `gh pr merge`).
    pub fn from_message(number: u64, message: &str, remote: &str, base: &str) -> Self {
        let kind = classify(message);
        Self::new(number, kind, message, remote, base)
    }

    pub fn new(number: u64, kind: MergeFailureKind, message: &str, remote: &str, base: &str) -> Self {
        Self {
            number,
            kind,
            message: message.trim().to_string(),
            remedy: remedy(kind, number, remote, base),
        }
    }
}

// Order matters: gh wraps policy refusals in "is not mergeable", so the
// specific classes are tried before the generic conflict pattern.
static PATTERNS: OnceLock<Vec<(MergeFailureKind, Regex)>> = OnceLock::new();

fn patterns() -> &'static [(MergeFailureKind, Regex)] {
    PATTERNS.get_or_init(|| {
        [
            (
                MergeFailureKind::ReviewRequired,
                r"(?i)review required|approving review|review_required|changes requested",
            ),
            (
                MergeFailureKind::ChecksPending,
                r"(?i)required status checks?|checks? (are|is) (still )?(pending|in progress|expected)|status checks? (have|has) not",
            ),
            (
                MergeFailureKind::BranchProtection,
                r"(?i)protected branch|branch protection|base branch policy|prohibit",
            ),
            (
                MergeFailureKind::Conflict,
                r"(?i)conflict|not mergeable|cannot be cleanly created|dirty",
            ),
        ]
        .into_iter()
        .map(|(kind, re)| (kind, Regex::new(re).unwrap()))
        .collect()
    })
}

pub fn classify(message: &str) -> MergeFailureKind {
    patterns()
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(kind, _)| *kind)
        .unwrap_or(MergeFailureKind::Other)
}

pub fn remedy(kind: MergeFailureKind, number: u64, remote: &str, base: &str) -> String {
    match kind {
        MergeFailureKind::Conflict => format!(
            "gh pr checkout {number} && git merge {remote}/{base} && git push"
        ),
        MergeFailureKind::ChecksPending => format!("gh pr checks {number} --watch"),
        MergeFailureKind::ChecksFailed => format!("gh pr checks {number}"),
        MergeFailureKind::BranchProtection => format!("gh pr merge {number} --squash --auto"),
        MergeFailureKind::ReviewRequired => format!("gh pr edit {number} --add-reviewer <reviewer>"),
        MergeFailureKind::Other => format!("gh pr view {number} --web"),
    }
}
