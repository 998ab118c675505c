//! Merge every open PR against one base branch, oldest first.
//!
//! PRs are treated as independent: one refusal is recorded with a remedy and
//! the batch moves on to the next PR.

use crate::ci::{self, Clock, WaitOutcome, WaitPolicy};
use crate::config::Config;
use crate::error::{Result, RalphError};
use crate::host::{Host, MergeOptions, PullRequest};
use crate::merge_failure::{MergeFailure, MergeFailureKind};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeStackOptions {
    pub base: String,
    pub remote: String,
    /// Report the plan without merging or polling CI.
    pub dry_run: bool,
    /// Poll CI before each merge.
    pub wait: bool,
    pub policy: WaitPolicy,
    pub delete_branch: bool,
}

impl MergeStackOptions {
    pub fn from_config(
        config: &Config,
        base: Option<&str>,
        dry_run: bool,
        wait: bool,
        wait_timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            base: base.unwrap_or(&config.base_branch).to_string(),
            remote: config.remote.clone(),
            dry_run,
            wait,
            policy: WaitPolicy {
                timeout: Duration::from_secs(
                    wait_timeout_secs.unwrap_or(config.ci.wait_timeout_seconds),
                ),
                interval: config.ci.poll_interval(),
                require_checks: config.ci.require_checks,
            },
            delete_branch: config.merge.delete_branch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPr {
    pub number: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeStackReport {
    pub base: String,
    pub dry_run: bool,
    /// PR numbers in the order they were (or would be) merged.
    pub order: Vec<u64>,
    pub merged: Vec<u64>,
    pub failed: Vec<MergeFailure>,
    pub skipped: Vec<SkippedPr>,
    /// Open PRs against the base once the batch finished.
    pub remaining: Vec<PullRequest>,
}

impl MergeStackReport {
    /// Skips alone do not count.
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Oldest first, whatever order the host listed them in.
pub fn order_for_merge(mut prs: Vec<PullRequest>) -> Vec<PullRequest> {
    prs.sort_by_key(|p| p.number);
    prs
}

pub fn run_merge_stack(
    host: &dyn Host,
    clock: &dyn Clock,
    opts: &MergeStackOptions,
) -> Result<MergeStackReport> {
    host.ensure_authenticated()?;
    let prs = order_for_merge(host.list_open_prs(&opts.base)?);
    let mut report = MergeStackReport {
        base: opts.base.clone(),
        dry_run: opts.dry_run,
        order: prs.iter().map(|p| p.number).collect(),
        merged: Vec::new(),
        failed: Vec::new(),
        skipped: Vec::new(),
        remaining: Vec::new(),
    };
    info!(base = %opts.base, count = prs.len(), "open pull requests");

    if opts.dry_run {
        report.remaining = prs;
        return Ok(report);
    }

    for pr in &prs {
        merge_one(host, clock, opts, pr, &mut report);
    }

    report.remaining = order_for_merge(host.list_open_prs(&opts.base)?);
    Ok(report)
}

fn merge_one(
    host: &dyn Host,
    clock: &dyn Clock,
    opts: &MergeStackOptions,
    pr: &PullRequest,
    report: &mut MergeStackReport,
) {
    let number = pr.number;
    if opts.wait {
        match ci::wait_for_checks(host, number, &opts.policy, clock) {
            Ok(WaitOutcome::Ready(_)) => {}
            Ok(WaitOutcome::Failed) => {
                warn!(pr = number, "CI failed; not merging");
                report.failed.push(MergeFailure::new(
                    number,
                    MergeFailureKind::ChecksFailed,
                    "one or more checks failed",
                    &opts.remote,
                    &opts.base,
                ));
                return;
            }
            Ok(WaitOutcome::TimedOut { waited }) => {
                report.skipped.push(SkippedPr {
                    number,
                    reason: format!("CI still pending after {}s", waited.as_secs()),
                });
                return;
            }
            Err(e) => {
                report.failed.push(failure_from_error(number, e, opts));
                return;
            }
        }
    }

    let merge = MergeOptions {
        delete_branch: opts.delete_branch,
    };
    match host.merge_pr(number, merge) {
        Ok(()) => {
            info!(pr = number, title = %pr.title, "merged");
            report.merged.push(number);
        }
        Err(e) => {
            let failure = failure_from_error(number, e, opts);
            warn!(pr = number, kind = %failure.kind, "merge refused");
            report.failed.push(failure);
        }
    }
}

fn failure_from_error(number: u64, err: RalphError, opts: &MergeStackOptions) -> MergeFailure {
    let message = match err {
        RalphError::HostCommandFailed { stderr, .. } => stderr,
        other => other.to_string(),
    };
    MergeFailure::from_message(number, &message, &opts.remote, &opts.base)
}
