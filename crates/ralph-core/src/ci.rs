//! CI status classification and bounded polling.

use crate::error::Result;
use crate::host::{CheckRun, Host};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// CiStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Pass,
    Fail,
    Pending,
    /// No checks are configured for the PR.
    Unknown,
}

impl CiStatus {
    /// Any failure wins, then any pending check; an empty list is `Unknown`.
    pub fn classify(checks: &[CheckRun]) -> CiStatus {
        if checks.is_empty() {
            return CiStatus::Unknown;
        }
        let mut pending = false;
        for check in checks {
            match check.bucket.as_str() {
                "fail" | "cancel" => return CiStatus::Fail,
                "pass" | "skipping" => {}
                // Anything we do not recognise is treated as still running.
                _ => pending = true,
            }
        }
        if pending {
            CiStatus::Pending
        } else {
            CiStatus::Pass
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CiStatus::Pass => "pass",
            CiStatus::Fail => "fail",
            CiStatus::Pending => "pending",
            CiStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for polling loops.
pub trait Clock {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
    fn sleep(&self, d: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
    /// When set, a PR without checks keeps waiting instead of counting as ready.
    pub require_checks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Safe to merge: `Pass`, or `Unknown` when checks are not required.
    Ready(CiStatus),
    Failed,
    TimedOut { waited: Duration },
}

/// Poll the PR's checks until they settle or the budget runs out.
///
/// Total sleep never exceeds `policy.timeout`: each nap is clamped to the
/// remaining budget and the loop ends once the budget is spent.
pub fn wait_for_checks(
    host: &dyn Host,
    number: u64,
    policy: &WaitPolicy,
    clock: &dyn Clock,
) -> Result<WaitOutcome> {
    let start = clock.now();
    // A zero interval would spin; poll at least once a second.
    let interval = policy.interval.max(Duration::from_secs(1));
    loop {
        let status = CiStatus::classify(&host.checks(number)?);
        debug!(pr = number, %status, "ci status");
        match status {
            CiStatus::Pass => return Ok(WaitOutcome::Ready(status)),
            CiStatus::Unknown if !policy.require_checks => {
                warn!(pr = number, "no CI checks reported; treating as mergeable");
                return Ok(WaitOutcome::Ready(status));
            }
            CiStatus::Fail => return Ok(WaitOutcome::Failed),
            CiStatus::Pending | CiStatus::Unknown => {}
        }

        let waited = clock.now().saturating_sub(start);
        if waited >= policy.timeout {
            warn!(pr = number, secs = waited.as_secs(), "gave up waiting for CI");
            return Ok(WaitOutcome::TimedOut { waited });
        }
        let nap = interval.min(policy.timeout - waited);
        info!(pr = number, secs = nap.as_secs(), "CI pending; waiting");
        clock.sleep(nap);
    }
}
