//! One Ralph iteration: take the next incomplete story from the ledger and
//! carry it through to an open (optionally merged) pull request.
//!
//! ```text
//! Idle → Syncing → Branching → Scaffolding → Implementing → Verifying
//!      → Committing → Pushing → PrCreating → PrCreated [→ Merging → Merged]
//! ```
//!
//! Any phase may fall to `Failed`. Failures never retry and never roll back:
//! the story branch is left checked out for a human to inspect.

use crate::ci::{self, Clock, CiStatus, WaitOutcome, WaitPolicy};
use crate::config::Config;
use crate::error::{Result, RalphError};
use crate::gate::GateResult;
use crate::git::Git;
use crate::host::{Host, MergeOptions, NewPullRequest, PullRequest};
use crate::ledger::{Ledger, LedgerSummary, Story};
use crate::merge_failure::MergeFailure;
use crate::paths;
use crate::render;
use crate::step::{self, Collaborator, ShellStep, StepContext};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Suffixes tried after the plain branch name is taken.
const MAX_BRANCH_SUFFIX: u32 = 100;

// ---------------------------------------------------------------------------
// IterationPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationPhase {
    Idle,
    Syncing,
    Branching,
    Scaffolding,
    Implementing,
    Verifying,
    Committing,
    Pushing,
    PrCreating,
    PrCreated,
    Merging,
    Merged,
    Failed,
}

impl IterationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationPhase::Idle => "idle",
            IterationPhase::Syncing => "syncing",
            IterationPhase::Branching => "branching",
            IterationPhase::Scaffolding => "scaffolding",
            IterationPhase::Implementing => "implementing",
            IterationPhase::Verifying => "verifying",
            IterationPhase::Committing => "committing",
            IterationPhase::Pushing => "pushing",
            IterationPhase::PrCreating => "pr_creating",
            IterationPhase::PrCreated => "pr_created",
            IterationPhase::Merging => "merging",
            IterationPhase::Merged => "merged",
            IterationPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IterationPhase::Failed | IterationPhase::PrCreated | IterationPhase::Merged
        )
    }

    pub fn can_advance_to(self, next: IterationPhase) -> bool {
        use IterationPhase::*;
        match (self, next) {
            (Merged | Failed, _) => false,
            // Once the PR exists a failed auto-merge falls back, not to Failed.
            (PrCreated, Merging) => true,
            (PrCreated, _) => false,
            (Merging, Merged | PrCreated) => true,
            (Merging, _) => false,
            (_, Failed) => true,
            (Idle, Syncing)
            | (Syncing, Branching)
            | (Branching, Scaffolding)
            | (Scaffolding, Implementing)
            | (Implementing, Verifying)
            | (Verifying, Committing)
            | (Committing, Pushing)
            | (Pushing, PrCreating)
            | (PrCreating, PrCreated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IterationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Options / steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct IterationOptions {
    pub base: String,
    pub remote: String,
    pub branch_prefix: String,
    /// Wait for CI and squash-merge once the PR is open.
    pub merge: bool,
    pub wait: WaitPolicy,
    pub delete_branch: bool,
}

impl IterationOptions {
    pub fn from_config(
        config: &Config,
        base: Option<&str>,
        merge: bool,
        merge_timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            base: base.unwrap_or(&config.base_branch).to_string(),
            remote: config.remote.clone(),
            branch_prefix: config.branch_prefix.clone(),
            merge,
            wait: WaitPolicy {
                timeout: Duration::from_secs(
                    merge_timeout_secs.unwrap_or(config.ci.merge_timeout_seconds),
                ),
                interval: config.ci.poll_interval(),
                require_checks: config.ci.require_checks,
            },
            delete_branch: config.merge.delete_branch,
        }
    }
}

/// The external collaborators of an iteration.
#[derive(Default)]
pub struct Steps {
    pub scaffold: Option<Box<dyn Collaborator>>,
    pub implement: Option<Box<dyn Collaborator>>,
    pub gates: Vec<Box<dyn Collaborator>>,
}

impl Steps {
    pub fn from_config(config: &Config) -> Self {
        let shell = |name: &str, cfg: &crate::config::StepConfig| -> Box<dyn Collaborator> {
            Box::new(
                ShellStep::new(name, &cfg.command)
                    .with_timeout_secs(cfg.timeout_seconds)
                    .passthrough(true),
            )
        };
        Self {
            scaffold: config.scaffold.as_ref().map(|c| shell("scaffold", c)),
            implement: config.implement.as_ref().map(|c| shell("implement", c)),
            gates: config
                .gates
                .iter()
                .map(|g| Box::new(ShellStep::from_gate(g)) as Box<dyn Collaborator>)
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AutoMerge {
    NotRequested,
    Merged { ci: CiStatus },
    ChecksFailed,
    TimedOut { waited_secs: u64 },
    Rejected { failure: MergeFailure },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationReport {
    pub story_id: String,
    pub story_title: String,
    pub branch: String,
    pub pr: PullRequest,
    pub gates: Vec<GateResult>,
    pub auto_merge: AutoMerge,
    pub phase: IterationPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IterationOutcome {
    /// Every story already passes; nothing was touched.
    Idle { summary: LedgerSummary },
    Completed(IterationReport),
}

// ---------------------------------------------------------------------------
// IterationController
// ---------------------------------------------------------------------------

pub struct IterationController<'a> {
    root: &'a Path,
    ledger_path: PathBuf,
    progress_log: PathBuf,
    /// Controller-owned files, relative to the project root.
    owned: Vec<String>,
    git: &'a dyn Git,
    host: &'a dyn Host,
    clock: &'a dyn Clock,
    steps: Steps,
    phase: IterationPhase,
    trace: Vec<IterationPhase>,
}

impl<'a> IterationController<'a> {
    pub fn new(
        root: &'a Path,
        config: &Config,
        git: &'a dyn Git,
        host: &'a dyn Host,
        clock: &'a dyn Clock,
        steps: Steps,
    ) -> Self {
        Self {
            root,
            ledger_path: config.ledger_path(root),
            progress_log: config.progress_log_path(root),
            owned: config.controller_owned(root),
            git,
            host,
            clock,
            steps,
            phase: IterationPhase::Idle,
            trace: vec![IterationPhase::Idle],
        }
    }

    pub fn phase(&self) -> IterationPhase {
        self.phase
    }

    /// Every phase visited by the last `run`, starting with `Idle`.
    pub fn trace(&self) -> &[IterationPhase] {
        &self.trace
    }

    pub fn run(&mut self, opts: &IterationOptions) -> Result<IterationOutcome> {
        self.phase = IterationPhase::Idle;
        self.trace = vec![IterationPhase::Idle];

        let result = self.run_inner(opts);
        if result.is_err() && !self.phase.is_terminal() {
            self.phase = IterationPhase::Failed;
            self.trace.push(IterationPhase::Failed);
        }
        result
    }

    fn run_inner(&mut self, opts: &IterationOptions) -> Result<IterationOutcome> {
        let ledger = Ledger::load(&self.ledger_path)?;
        let Some(story) = ledger.next_story().cloned() else {
            info!("every story passes; nothing to do");
            return Ok(IterationOutcome::Idle {
                summary: ledger.summary(),
            });
        };
        info!(story = %story.id, title = %story.title, "starting iteration");

        self.host.ensure_authenticated()?;
        let owned = self.owned_in_worktree()?;
        self.ensure_clean(&owned)?;

        self.advance(IterationPhase::Syncing)?;
        debug!(from = %self.git.current_branch()?, base = %opts.base, "syncing base branch");
        self.git.fetch(&opts.remote, &opts.base)?;
        self.git.checkout(&opts.base)?;
        self.git
            .merge_ff_only(&format!("{}/{}", opts.remote, opts.base))?;

        self.advance(IterationPhase::Branching)?;
        let branch = self.unique_branch(&story, &opts.branch_prefix)?;
        self.git.create_branch(&branch, &opts.base)?;
        info!(%branch, "created story branch");

        let root = self.root;
        let ctx = StepContext {
            root,
            story: &story,
            branch: &branch,
            base: &opts.base,
        };

        self.advance(IterationPhase::Scaffolding)?;
        match (story.skill.as_deref(), self.steps.scaffold.as_deref()) {
            (Some(skill), Some(scaffold)) => {
                info!(skill, "scaffolding");
                run_step(scaffold, &ctx)?;
            }
            (Some(skill), None) => {
                warn!(skill, "story names a skill but no scaffold step is configured")
            }
            _ => debug!("no scaffold needed"),
        }

        self.advance(IterationPhase::Implementing)?;
        match self.steps.implement.as_deref() {
            Some(implement) => run_step(implement, &ctx)?,
            None => warn!("no implement step configured"),
        }

        self.advance(IterationPhase::Verifying)?;
        let gates = step::run_gates(&self.steps.gates, &ctx)?;
        if let Some(failed) = gates.iter().find(|g| !g.passed) {
            return Err(RalphError::VerificationFailed {
                gate: failed.gate_name.clone(),
                branch: branch.clone(),
                output: failed.output.clone(),
            });
        }

        self.advance(IterationPhase::Committing)?;
        self.git.stage_all_except(&owned)?;
        self.git.commit(&render::commit_message(&story))?;

        self.advance(IterationPhase::Pushing)?;
        self.git.push(&opts.remote, &branch)?;

        self.advance(IterationPhase::PrCreating)?;
        let pr = self.host.create_pr(&NewPullRequest {
            base: opts.base.clone(),
            head: branch.clone(),
            title: render::pr_title(&story),
            body: render::pr_body(&story, &branch),
        })?;
        info!(pr = pr.number, url = %pr.url, "opened pull request");

        let note = format!("PR #{} ({}) from branch {branch}", pr.number, pr.url);
        Ledger::update(&self.ledger_path, |l| l.mark_passed(&story.id, &note))?;
        crate::io::append_text(
            &self.progress_log,
            &render::progress_entry(&story, &branch, &pr.url, Utc::now()),
        )?;
        self.advance(IterationPhase::PrCreated)?;

        let auto_merge = if opts.merge {
            self.auto_merge(&pr, opts)?
        } else {
            AutoMerge::NotRequested
        };

        Ok(IterationOutcome::Completed(IterationReport {
            story_id: story.id.clone(),
            story_title: story.title.clone(),
            branch,
            pr,
            gates,
            auto_merge,
            phase: self.phase,
        }))
    }

    fn advance(&mut self, next: IterationPhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(RalphError::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.phase, to = %next, "iteration phase");
        self.phase = next;
        self.trace.push(next);
        Ok(())
    }

    /// Git reports paths from the worktree top level, not the project root.
    fn owned_in_worktree(&self) -> Result<Vec<String>> {
        let prefix = self.git.worktree_prefix()?;
        Ok(self.owned.iter().map(|p| format!("{prefix}{p}")).collect())
    }

    fn ensure_clean(&self, owned: &[String]) -> Result<()> {
        let dirty: Vec<String> = self
            .git
            .changed_paths()?
            .into_iter()
            .filter(|p| !owned.contains(p))
            .collect();
        if dirty.is_empty() {
            Ok(())
        } else {
            Err(RalphError::DirtyWorktree(dirty))
        }
    }

    fn unique_branch(&self, story: &Story, prefix: &str) -> Result<String> {
        let name = paths::story_branch_name(prefix, &story.id, &story.title);
        if !self.git.branch_exists(&name)? {
            return Ok(name);
        }
        for n in 2..=MAX_BRANCH_SUFFIX {
            let candidate = format!("{name}-{n}");
            if !self.git.branch_exists(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(RalphError::BranchNameExhausted(name))
    }

    /// Wait for CI and merge. Whatever happens the PR already exists, so
    /// problems are reported in the outcome instead of failing the iteration.
    fn auto_merge(&mut self, pr: &PullRequest, opts: &IterationOptions) -> Result<AutoMerge> {
        self.advance(IterationPhase::Merging)?;
        let waited = ci::wait_for_checks(self.host, pr.number, &opts.wait, self.clock);
        let outcome = match waited {
            Err(e) => AutoMerge::Error {
                message: e.to_string(),
            },
            Ok(WaitOutcome::Failed) => AutoMerge::ChecksFailed,
            Ok(WaitOutcome::TimedOut { waited }) => AutoMerge::TimedOut {
                waited_secs: waited.as_secs(),
            },
            Ok(WaitOutcome::Ready(ci)) => {
                let merge = MergeOptions {
                    delete_branch: opts.delete_branch,
                };
                match self.host.merge_pr(pr.number, merge) {
                    Ok(()) => AutoMerge::Merged { ci },
                    Err(RalphError::HostCommandFailed { stderr, .. }) => AutoMerge::Rejected {
                        failure: MergeFailure::from_message(
                            pr.number,
                            &stderr,
                            &opts.remote,
                            &opts.base,
                        ),
                    },
                    Err(e) => AutoMerge::Error {
                        message: e.to_string(),
                    },
                }
            }
        };

        if let AutoMerge::Merged { .. } = outcome {
            self.advance(IterationPhase::Merged)?;
            info!(pr = pr.number, "merged pull request");
            self.return_to_base(opts);
        } else {
            self.advance(IterationPhase::PrCreated)?;
            warn!(pr = pr.number, url = %pr.url, "pull request left open");
        }
        Ok(outcome)
    }

    fn return_to_base(&self, opts: &IterationOptions) {
        let upstream = format!("{}/{}", opts.remote, opts.base);
        let result = self
            .git
            .checkout(&opts.base)
            .and_then(|_| self.git.fetch(&opts.remote, &opts.base))
            .and_then(|_| self.git.merge_ff_only(&upstream));
        if let Err(e) = result {
            warn!(error = %e, "merged, but could not fast-forward the local base branch");
        }
    }
}

fn run_step(step: &dyn Collaborator, ctx: &StepContext<'_>) -> Result<()> {
    info!(step = step.name(), "running step");
    let outcome = step.run(ctx)?;
    if outcome.success {
        return Ok(());
    }
    Err(RalphError::StepFailed {
        step: step.name().to_string(),
        code: outcome.code_label(),
        branch: ctx.branch.to_string(),
        output: outcome.output,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge_failure::MergeFailureKind;
    use crate::git::GitCli;
    use crate::testing::{check, git_in, init_repo, FakeClock, FakeGit, FakeHost, FakeStep};
    use tempfile::TempDir;

    fn write_ledger(dir: &TempDir, stories: Vec<Story>) -> PathBuf {
        let mut ledger = Ledger::new("acme");
        ledger.user_stories = stories;
        let path = dir.path().join("prd.json");
        ledger.save(&path).unwrap();
        path
    }

    fn stories(n: usize) -> Vec<Story> {
        (1..=n)
            .map(|i| Story::new(format!("US-00{i}"), format!("Story number {i}"), i as i64))
            .collect()
    }

    fn opts(config: &Config) -> IterationOptions {
        IterationOptions::from_config(config, None, false, None)
    }

    fn passing_steps() -> Steps {
        Steps {
            scaffold: None,
            implement: Some(FakeStep::ok("implement").boxed()),
            gates: vec![FakeStep::ok("lint").boxed(), FakeStep::ok("test").boxed()],
        }
    }

    #[test]
    fn drains_ledger_one_pr_per_story() {
        let dir = TempDir::new().unwrap();
        let path = write_ledger(&dir, stories(3));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());

        for expected in ["US-001", "US-002", "US-003"] {
            match ctl.run(&opts(&config)).unwrap() {
                IterationOutcome::Completed(report) => {
                    assert_eq!(report.story_id, expected);
                    assert_eq!(report.phase, IterationPhase::PrCreated);
                    assert_eq!(report.auto_merge, AutoMerge::NotRequested);
                }
                other => panic!("expected a completed iteration, got {other:?}"),
            }
        }
        assert!(matches!(
            ctl.run(&opts(&config)).unwrap(),
            IterationOutcome::Idle { summary } if summary.passing == 3
        ));

        let ledger = Ledger::load(&path).unwrap();
        assert!(ledger.user_stories.iter().all(|s| s.passes));
        assert!(ledger.story("US-002").unwrap().notes.contains("PR #2"));
        assert_eq!(host.created.borrow().len(), 3);
        assert_eq!(git.commits.borrow().len(), 3);

        let progress = std::fs::read_to_string(dir.path().join("progress.txt")).unwrap();
        assert_eq!(progress.matches("## ").count(), 3);
    }

    #[test]
    fn happy_path_trace_and_git_calls() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());
        ctl.run(&opts(&config)).unwrap();

        use IterationPhase::*;
        assert_eq!(
            ctl.trace(),
            &[
                Idle, Syncing, Branching, Scaffolding, Implementing, Verifying, Committing,
                Pushing, PrCreating, PrCreated
            ]
        );
        assert_eq!(
            *git.calls.borrow(),
            vec![
                "status",
                "fetch origin main",
                "checkout main",
                "merge origin/main",
                "branch ralph/us-001-story-number-1 main",
                "add prd.json progress.txt",
                "commit",
                "push origin ralph/us-001-story-number-1",
            ]
        );
        let (branch, message) = git.commits.borrow()[0].clone();
        assert_eq!(branch, "ralph/us-001-story-number-1");
        assert!(message.contains("Story-Id: US-001"));

        let created = host.created.borrow();
        assert_eq!(created[0].base, "main");
        assert_eq!(created[0].title, "feat: US-001 - Story number 1");
    }

    #[test]
    fn verification_failure_leaves_ledger_and_history_untouched() {
        let dir = TempDir::new().unwrap();
        let path = write_ledger(&dir, stories(2));
        let before = std::fs::read(&path).unwrap();
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        let later_gate = FakeStep::ok("test");
        let later_runs = later_gate.counter();
        let steps = Steps {
            scaffold: None,
            implement: Some(FakeStep::ok("implement").boxed()),
            gates: vec![FakeStep::failing("lint").boxed(), later_gate.boxed()],
        };
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, steps);

        let err = ctl.run(&opts(&config)).unwrap_err();
        assert!(matches!(
            &err,
            RalphError::VerificationFailed { gate, branch, .. }
                if gate == "lint" && branch == "ralph/us-001-story-number-1"
        ));
        assert_eq!(ctl.phase(), IterationPhase::Failed);
        assert_eq!(ctl.trace()[ctl.trace().len() - 2], IterationPhase::Verifying);
        assert_eq!(later_runs.get(), 0);

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(git.commits.borrow().is_empty());
        assert!(!git.calls.borrow().iter().any(|c| c.starts_with("push")));
        assert!(host.mutating_calls().is_empty());
        // Branch stays checked out for inspection.
        assert_eq!(*git.current.borrow(), "ralph/us-001-story-number-1");
        assert!(!dir.path().join("progress.txt").exists());
    }

    #[test]
    fn implement_failure_reports_step_and_branch() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        let steps = Steps {
            implement: Some(FakeStep::failing("implement").boxed()),
            ..Steps::default()
        };
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, steps);
        let err = ctl.run(&opts(&config)).unwrap_err();
        assert!(matches!(err, RalphError::StepFailed { step, code, .. } if step == "implement" && code == "1"));
        assert!(git.commits.borrow().is_empty());
    }

    #[test]
    fn dirty_tree_is_rejected_before_sync() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        *git.dirty.borrow_mut() = vec!["src/app.ts".to_string(), "prd.json".to_string()];
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());

        let err = ctl.run(&opts(&config)).unwrap_err();
        assert!(matches!(&err, RalphError::DirtyWorktree(dirty) if dirty == &vec!["src/app.ts".to_string()]));
        assert_eq!(*git.calls.borrow(), vec!["status"]);
        assert_eq!(ctl.trace(), &[IterationPhase::Idle, IterationPhase::Failed]);
    }

    #[test]
    fn controller_owned_files_do_not_count_as_dirty() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        *git.dirty.borrow_mut() = vec!["prd.json".to_string(), "progress.txt".to_string()];
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());
        assert!(ctl.run(&opts(&config)).is_ok());
    }

    #[test]
    fn owned_files_match_worktree_paths_below_a_subdirectory_root() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        *git.prefix.borrow_mut() = "apps/web/".to_string();
        *git.dirty.borrow_mut() = vec!["apps/web/prd.json".to_string()];
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());

        ctl.run(&opts(&config)).unwrap();
        assert!(git
            .calls
            .borrow()
            .contains(&"add apps/web/prd.json apps/web/progress.txt".to_string()));
    }

    #[test]
    fn real_git_iteration_from_a_monorepo_subdirectory() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        let remote = tmp.path().join("remote.git");
        std::fs::create_dir_all(&repo).unwrap();
        if init_repo(&repo).is_none() {
            return;
        }
        git_in(tmp.path(), &["init", "-q", "--bare", "remote.git"]);
        git_in(&repo, &["remote", "add", "origin", remote.to_str().unwrap()]);
        git_in(&repo, &["push", "-q", "-u", "origin", "main"]);

        let web = repo.join("apps/web");
        std::fs::create_dir_all(&web).unwrap();
        let mut ledger = Ledger::new("web");
        ledger.user_stories = stories(1);
        ledger.save(&web.join("prd.json")).unwrap();

        let config = Config::default();
        let git = GitCli::detect(&web).unwrap();
        let (host, clock) = (FakeHost::new(), FakeClock::new());
        let steps = Steps {
            implement: Some(
                FakeStep::ok("implement")
                    .with_effect(|ctx| std::fs::write(ctx.root.join("login.tsx"), "form").unwrap())
                    .boxed(),
            ),
            ..Steps::default()
        };
        let mut ctl = IterationController::new(&web, &config, &git, &host, &clock, steps);

        let outcome = ctl.run(&opts(&config)).unwrap();
        assert!(matches!(outcome, IterationOutcome::Completed(_)));

        let committed = git_in(&repo, &["show", "--name-only", "--format=", "HEAD"]).unwrap();
        assert_eq!(committed.lines().collect::<Vec<_>>(), vec!["apps/web/login.tsx"]);
        let pushed = git_in(&remote, &["branch", "--list", "ralph/*"]).unwrap();
        assert!(pushed.contains("ralph/us-001-story-number-1"));
        assert!(Ledger::load(&web.join("prd.json")).unwrap().user_stories[0].passes);
    }

    #[test]
    fn idle_when_everything_passes() {
        let dir = TempDir::new().unwrap();
        let mut done = stories(2);
        done.iter_mut().for_each(|s| s.passes = true);
        write_ledger(&dir, done);
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());

        let outcome = ctl.run(&opts(&config)).unwrap();
        assert!(matches!(outcome, IterationOutcome::Idle { summary } if summary.remaining == 0));
        assert!(git.calls.borrow().is_empty());
        assert!(host.calls.borrow().is_empty());
        assert_eq!(ctl.phase(), IterationPhase::Idle);
    }

    #[test]
    fn unauthenticated_host_fails_fast() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        host.authenticated.set(false);
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());
        assert!(matches!(
            ctl.run(&opts(&config)),
            Err(RalphError::NotAuthenticated(_))
        ));
        assert!(git.calls.borrow().is_empty());
    }

    #[test]
    fn push_failure_is_not_retried_and_ledger_is_untouched() {
        let dir = TempDir::new().unwrap();
        let path = write_ledger(&dir, stories(1));
        let before = std::fs::read(&path).unwrap();
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        *git.fail_on.borrow_mut() = Some("push");
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());

        assert!(matches!(
            ctl.run(&opts(&config)),
            Err(RalphError::GitCommandFailed { .. })
        ));
        let pushes = git.calls.borrow().iter().filter(|c| c.starts_with("push")).count();
        assert_eq!(pushes, 1);
        assert!(host.created.borrow().is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn scaffold_runs_only_for_stories_with_a_skill() {
        let dir = TempDir::new().unwrap();
        let mut list = stories(2);
        list[1].skill = Some("nest-module".to_string());
        write_ledger(&dir, list);
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        let scaffold = FakeStep::ok("scaffold");
        let scaffold_runs = scaffold.counter();
        let steps = Steps {
            scaffold: Some(scaffold.boxed()),
            ..passing_steps()
        };
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, steps);

        ctl.run(&opts(&config)).unwrap();
        assert_eq!(scaffold_runs.get(), 0);
        ctl.run(&opts(&config)).unwrap();
        assert_eq!(scaffold_runs.get(), 1);
    }

    #[test]
    fn implement_step_sees_current_story() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        let implement = FakeStep::ok("implement").with_effect(|ctx| {
            let marker = ctx.root.join(format!("{}.txt", ctx.story.id));
            std::fs::write(marker, ctx.branch).unwrap();
        });
        let steps = Steps {
            implement: Some(implement.boxed()),
            ..Steps::default()
        };
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, steps);
        ctl.run(&opts(&config)).unwrap();
        let written = std::fs::read_to_string(dir.path().join("US-001.txt")).unwrap();
        assert_eq!(written, "ralph/us-001-story-number-1");
    }

    #[test]
    fn taken_branch_names_get_a_suffix() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        git.branches
            .borrow_mut()
            .insert("ralph/us-001-story-number-1".to_string());
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());
        match ctl.run(&opts(&config)).unwrap() {
            IterationOutcome::Completed(report) => {
                assert_eq!(report.branch, "ralph/us-001-story-number-1-2")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn auto_merge_after_ci_passes() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        host.script_checks(1, vec![vec![check("ci", "pending")], vec![check("ci", "pass")]]);
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());

        let opts = IterationOptions::from_config(&config, None, true, Some(120));
        let IterationOutcome::Completed(report) = ctl.run(&opts).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(report.auto_merge, AutoMerge::Merged { ci: CiStatus::Pass });
        assert_eq!(report.phase, IterationPhase::Merged);
        assert_eq!(*host.merged.borrow(), vec![1]);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10)]);
        assert_eq!(*git.current.borrow(), "main");
    }

    #[test]
    fn auto_merge_timeout_leaves_pr_open() {
        let dir = TempDir::new().unwrap();
        let path = write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        host.script_checks(1, vec![vec![check("ci", "pending")]]);
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());

        let opts = IterationOptions::from_config(&config, None, true, Some(30));
        let IterationOutcome::Completed(report) = ctl.run(&opts).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(report.auto_merge, AutoMerge::TimedOut { waited_secs: 30 });
        assert_eq!(report.phase, IterationPhase::PrCreated);
        assert!(host.merged.borrow().is_empty());
        assert_eq!(host.open.borrow().len(), 1);
        assert_eq!(clock.sleeps().iter().sum::<Duration>(), Duration::from_secs(30));
        // The story still passes: local checks succeeded and the PR exists.
        assert!(Ledger::load(&path).unwrap().story("US-001").unwrap().passes);
    }

    #[test]
    fn auto_merge_rejection_is_classified() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        host.script_checks(1, vec![vec![check("ci", "pass")]]);
        host.fail_merge(1, "Pull request #1 is not mergeable: the merge commit cannot be cleanly created.");
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());

        let opts = IterationOptions::from_config(&config, None, true, None);
        let IterationOutcome::Completed(report) = ctl.run(&opts).unwrap() else {
            panic!("expected completion");
        };
        match report.auto_merge {
            AutoMerge::Rejected { failure } => {
                assert_eq!(failure.kind, MergeFailureKind::Conflict);
                assert!(failure.remedy.starts_with("gh pr checkout 1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctl.phase(), IterationPhase::PrCreated);
    }

    #[test]
    fn ci_failure_skips_merge() {
        let dir = TempDir::new().unwrap();
        write_ledger(&dir, stories(1));
        let config = Config::default();
        let (git, host, clock) = (FakeGit::new(), FakeHost::new(), FakeClock::new());
        host.script_checks(1, vec![vec![check("ci", "fail")]]);
        let mut ctl = IterationController::new(dir.path(), &config, &git, &host, &clock, passing_steps());

        let opts = IterationOptions::from_config(&config, None, true, None);
        let IterationOutcome::Completed(report) = ctl.run(&opts).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(report.auto_merge, AutoMerge::ChecksFailed);
        assert!(!host.mutating_calls().iter().any(|c| c.starts_with("merge")));
    }

    #[test]
    fn base_override_wins() {
        let config = Config::default();
        let opts = IterationOptions::from_config(&config, Some("develop"), false, None);
        assert_eq!(opts.base, "develop");
        assert_eq!(opts.wait.timeout, Duration::from_secs(600));
    }

    #[test]
    fn phase_transitions() {
        use IterationPhase::*;
        assert!(Idle.can_advance_to(Syncing));
        assert!(Idle.can_advance_to(Failed));
        assert!(!Idle.can_advance_to(Committing));
        assert!(!Verifying.can_advance_to(PrCreated));
        assert!(PrCreated.can_advance_to(Merging));
        assert!(!PrCreated.can_advance_to(Failed));
        assert!(Merging.can_advance_to(PrCreated));
        assert!(!Merged.can_advance_to(Merging));
        assert!(!Failed.can_advance_to(Syncing));
    }
}
