//! Code-hosting operations (pull requests and CI checks).
//!
//! [`GhCli`] drives the GitHub CLI with `--json` output. Errors keep the
//! CLI's stderr verbatim because merge failures are classified from it.

use crate::error::{Result, RalphError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub head_ref_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPullRequest {
    pub base: String,
    pub head: String,
    pub title: String,
    pub body: String,
}

/// One CI check as reported by `gh pr checks --json name,state,bucket`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    #[serde(default)]
    pub state: String,
    /// `pass`, `fail`, `pending`, `skipping`, or `cancel`.
    #[serde(default)]
    pub bucket: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub delete_branch: bool,
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

pub trait Host {
    fn ensure_authenticated(&self) -> Result<()>;
    fn list_open_prs(&self, base: &str) -> Result<Vec<PullRequest>>;
    fn create_pr(&self, pr: &NewPullRequest) -> Result<PullRequest>;
    /// Empty when the PR has no checks configured.
    fn checks(&self, number: u64) -> Result<Vec<CheckRun>>;
    /// Squash-merge. A refusal surfaces as `HostCommandFailed`.
    fn merge_pr(&self, number: u64, opts: MergeOptions) -> Result<()>;
}

// ---------------------------------------------------------------------------
// GhCli
// ---------------------------------------------------------------------------

/// Most PRs one listing returns. The listing is sorted oldest first, so
/// anything beyond the cap is the newest work and waits for the next run.
const LIST_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct GhCli {
    root: PathBuf,
    bin: PathBuf,
}

impl GhCli {
    pub fn detect(root: &Path) -> Result<Self> {
        let bin = which::which("gh").map_err(|_| RalphError::MissingTool("gh".to_string()))?;
        Ok(Self {
            root: root.to_path_buf(),
            bin,
        })
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, "gh");
        Ok(Command::new(&self.bin)
            .args(args)
            .current_dir(&self.root)
            .output()?)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(command_failed(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn command_failed(args: &[&str], output: &Output) -> RalphError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    // Merge refusals are matched against this text; keep the body but drop
    // arguments that may be whole PR bodies.
    let command: Vec<&str> = args.iter().take(3).copied().collect();
    RalphError::HostCommandFailed {
        command: command.join(" "),
        stderr: if stderr.is_empty() { stdout } else { stderr },
    }
}

impl Host for GhCli {
    fn ensure_authenticated(&self) -> Result<()> {
        let output = self.output(&["auth", "status"])?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(RalphError::NotAuthenticated(if stderr.is_empty() {
            "run `gh auth login`".to_string()
        } else {
            stderr
        }))
    }

    fn list_open_prs(&self, base: &str) -> Result<Vec<PullRequest>> {
        let args = list_args(base, LIST_LIMIT);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let prs: Vec<PullRequest> = serde_json::from_str(&self.run(&args)?)?;
        if prs.len() >= LIST_LIMIT {
            warn!(
                limit = LIST_LIMIT,
                "open PR listing hit its limit; newer PRs were left out of this run"
            );
        }
        Ok(prs)
    }

    fn create_pr(&self, pr: &NewPullRequest) -> Result<PullRequest> {
        let out = self.run(&[
            "pr", "create", "--base", &pr.base, "--head", &pr.head, "--title", &pr.title,
            "--body", &pr.body,
        ])?;
        let url = out
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("http"))
            .ok_or_else(|| RalphError::UnexpectedOutput(format!("gh pr create: {}", out.trim())))?;
        let number = parse_pr_number(url)
            .ok_or_else(|| RalphError::UnexpectedOutput(format!("gh pr create: {url}")))?;
        Ok(PullRequest {
            number,
            title: pr.title.clone(),
            head_ref_name: pr.head.clone(),
            url: url.to_string(),
            created_at: None,
        })
    }

    fn checks(&self, number: u64) -> Result<Vec<CheckRun>> {
        let n = number.to_string();
        let args = ["pr", "checks", n.as_str(), "--json", "name,state,bucket"];
        // `gh pr checks` exits non-zero for failing (1) and pending (8)
        // checks, so the exit status alone says nothing; look at the output.
        let output = self.output(&args)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        parse_checks(&stdout, &stderr).ok_or_else(|| command_failed(&args, &output))
    }

    fn merge_pr(&self, number: u64, opts: MergeOptions) -> Result<()> {
        let n = number.to_string();
        let mut args = vec!["pr", "merge", n.as_str(), "--squash"];
        if opts.delete_branch {
            args.push("--delete-branch");
        }
        self.run(&args).map(drop)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// `gh pr list` sorts newest first by default; the search qualifier flips it
/// so a capped listing drops the newest PRs rather than the oldest.
pub fn list_args(base: &str, limit: usize) -> Vec<String> {
    let limit = limit.to_string();
    [
        "pr",
        "list",
        "--base",
        base,
        "--state",
        "open",
        "--search",
        "sort:created-asc",
        "--limit",
        limit.as_str(),
        "--json",
        "number,title,headRefName,url,createdAt",
    ]
    .iter()
    .map(|a| a.to_string())
    .collect()
}

static PR_URL_RE: OnceLock<Regex> = OnceLock::new();

/// `https://github.com/acme/app/pull/42` → `42`.
pub fn parse_pr_number(url: &str) -> Option<u64> {
    let re = PR_URL_RE.get_or_init(|| Regex::new(r"/pull/(\d+)").unwrap());
    re.captures(url)?.get(1)?.as_str().parse().ok()
}

/// Interpret `gh pr checks --json` output. `None` means the command failed
/// for a reason other than check state.
pub fn parse_checks(stdout: &str, stderr: &str) -> Option<Vec<CheckRun>> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).ok();
    }
    if stderr.to_lowercase().contains("no checks reported") {
        return Some(Vec::new());
    }
    None
}
