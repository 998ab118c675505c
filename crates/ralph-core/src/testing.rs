//! In-memory `Git`, `Host`, `Clock`, and step fakes for controller tests.

use crate::ci::Clock;
use crate::error::{Result, RalphError};
use crate::git::Git;
use crate::host::{CheckRun, Host, MergeOptions, NewPullRequest, PullRequest};
use crate::step::{Collaborator, StepContext, StepOutcome};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::process::Command;
use std::rc::Rc;
use std::time::Duration;

pub fn check(name: &str, bucket: &str) -> CheckRun {
    CheckRun {
        name: name.to_string(),
        state: bucket.to_uppercase(),
        bucket: bucket.to_string(),
    }
}

pub fn pr(number: u64) -> PullRequest {
    PullRequest {
        number,
        title: format!("PR {number}"),
        head_ref_name: format!("ralph/pr-{number}"),
        url: format!("https://github.com/acme/app/pull/{number}"),
        created_at: None,
    }
}

// ---------------------------------------------------------------------------
// FakeGit
// ---------------------------------------------------------------------------

pub struct FakeGit {
    pub calls: RefCell<Vec<String>>,
    /// Project root's location inside the worktree, e.g. `apps/web/`.
    pub prefix: RefCell<String>,
    pub dirty: RefCell<Vec<String>>,
    pub branches: RefCell<HashSet<String>>,
    pub current: RefCell<String>,
    /// (branch, message)
    pub commits: RefCell<Vec<(String, String)>>,
    /// Operation name (`fetch`, `push`, ...) that should fail.
    pub fail_on: RefCell<Option<&'static str>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            prefix: RefCell::new(String::new()),
            dirty: RefCell::new(Vec::new()),
            branches: RefCell::new(["main".to_string()].into_iter().collect()),
            current: RefCell::new("main".to_string()),
            commits: RefCell::new(Vec::new()),
            fail_on: RefCell::new(None),
        }
    }

    fn record(&self, op: &'static str, detail: String) -> Result<()> {
        self.calls.borrow_mut().push(format!("{op} {detail}").trim().to_string());
        if *self.fail_on.borrow() == Some(op) {
            return Err(RalphError::GitCommandFailed {
                command: op.to_string(),
                stderr: format!("simulated {op} failure"),
            });
        }
        Ok(())
    }
}

impl Git for FakeGit {
    fn worktree_prefix(&self) -> Result<String> {
        Ok(self.prefix.borrow().clone())
    }

    fn changed_paths(&self) -> Result<Vec<String>> {
        self.record("status", String::new())?;
        Ok(self.dirty.borrow().clone())
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self.current.borrow().clone())
    }

    fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        self.record("fetch", format!("{remote} {branch}"))
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.record("checkout", branch.to_string())?;
        *self.current.borrow_mut() = branch.to_string();
        Ok(())
    }

    fn merge_ff_only(&self, upstream: &str) -> Result<()> {
        self.record("merge", upstream.to_string())
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.branches.borrow().contains(name))
    }

    fn create_branch(&self, name: &str, start: &str) -> Result<()> {
        self.record("branch", format!("{name} {start}"))?;
        self.branches.borrow_mut().insert(name.to_string());
        *self.current.borrow_mut() = name.to_string();
        Ok(())
    }

    fn stage_all_except(&self, exclude: &[String]) -> Result<()> {
        self.record("add", exclude.join(" "))
    }

    fn commit(&self, message: &str) -> Result<()> {
        self.record("commit", String::new())?;
        let branch = self.current.borrow().clone();
        self.commits.borrow_mut().push((branch, message.to_string()));
        Ok(())
    }

    fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.record("push", format!("{remote} {branch}"))
    }
}

// ---------------------------------------------------------------------------
// FakeHost
// ---------------------------------------------------------------------------

pub struct FakeHost {
    pub open: RefCell<Vec<PullRequest>>,
    pub created: RefCell<Vec<NewPullRequest>>,
    pub merged: RefCell<Vec<u64>>,
    pub calls: RefCell<Vec<String>>,
    pub authenticated: Cell<bool>,
    next_number: Cell<u64>,
    checks: RefCell<HashMap<u64, VecDeque<Vec<CheckRun>>>>,
    merge_errors: RefCell<HashMap<u64, String>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            open: RefCell::new(Vec::new()),
            created: RefCell::new(Vec::new()),
            merged: RefCell::new(Vec::new()),
            calls: RefCell::new(Vec::new()),
            authenticated: Cell::new(true),
            next_number: Cell::new(1),
            checks: RefCell::new(HashMap::new()),
            merge_errors: RefCell::new(HashMap::new()),
        }
    }

    /// Open PRs listed in exactly the given order.
    pub fn with_open_prs(numbers: &[u64]) -> Self {
        let host = Self::new();
        *host.open.borrow_mut() = numbers.iter().copied().map(pr).collect();
        let next = numbers.iter().copied().max().unwrap_or(0) + 1;
        host.next_number.set(next);
        host
    }

    /// Successive `checks` responses; the last one repeats forever.
    pub fn script_checks(&self, number: u64, responses: Vec<Vec<CheckRun>>) {
        self.checks.borrow_mut().insert(number, responses.into());
    }

    pub fn fail_merge(&self, number: u64, stderr: &str) {
        self.merge_errors.borrow_mut().insert(number, stderr.to_string());
    }

    /// Calls that would change remote state.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with("create") || c.starts_with("merge"))
            .cloned()
            .collect()
    }
}

impl Host for FakeHost {
    fn ensure_authenticated(&self) -> Result<()> {
        self.calls.borrow_mut().push("auth".to_string());
        if self.authenticated.get() {
            Ok(())
        } else {
            Err(RalphError::NotAuthenticated("not logged in".to_string()))
        }
    }

    fn list_open_prs(&self, base: &str) -> Result<Vec<PullRequest>> {
        self.calls.borrow_mut().push(format!("list {base}"));
        Ok(self.open.borrow().clone())
    }

    fn create_pr(&self, new: &NewPullRequest) -> Result<PullRequest> {
        let number = self.next_number.get();
        self.next_number.set(number + 1);
        self.calls.borrow_mut().push(format!("create {}", new.head));
        self.created.borrow_mut().push(new.clone());
        let created = PullRequest {
            number,
            title: new.title.clone(),
            head_ref_name: new.head.clone(),
            url: format!("https://github.com/acme/app/pull/{number}"),
            created_at: None,
        };
        self.open.borrow_mut().push(created.clone());
        Ok(created)
    }

    fn checks(&self, number: u64) -> Result<Vec<CheckRun>> {
        self.calls.borrow_mut().push(format!("checks {number}"));
        let mut scripts = self.checks.borrow_mut();
        let Some(queue) = scripts.get_mut(&number) else {
            return Ok(Vec::new());
        };
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap_or_default())
        } else {
            Ok(queue.front().cloned().unwrap_or_default())
        }
    }

    fn merge_pr(&self, number: u64, _opts: MergeOptions) -> Result<()> {
        self.calls.borrow_mut().push(format!("merge {number}"));
        if let Some(stderr) = self.merge_errors.borrow().get(&number) {
            return Err(RalphError::HostCommandFailed {
                command: format!("pr merge {number}"),
                stderr: stderr.clone(),
            });
        }
        self.open.borrow_mut().retain(|p| p.number != number);
        self.merged.borrow_mut().push(number);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeClock
// ---------------------------------------------------------------------------

pub struct FakeClock {
    now: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, d: Duration) {
        self.sleeps.borrow_mut().push(d);
        self.now.set(self.now.get() + d);
    }
}

// ---------------------------------------------------------------------------
// FakeStep
// ---------------------------------------------------------------------------

type Effect = Box<dyn Fn(&StepContext<'_>)>;

pub struct FakeStep {
    name: String,
    success: bool,
    runs: Rc<Cell<usize>>,
    effect: Option<Effect>,
}

impl FakeStep {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            runs: Rc::new(Cell::new(0)),
            effect: None,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            success: false,
            ..Self::ok(name)
        }
    }

    pub fn with_effect(mut self, f: impl Fn(&StepContext<'_>) + 'static) -> Self {
        self.effect = Some(Box::new(f));
        self
    }

    /// Shared counter of how many times the step ran.
    pub fn counter(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.runs)
    }

    pub fn boxed(self) -> Box<dyn Collaborator> {
        Box::new(self)
    }
}

impl Collaborator for FakeStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        self.runs.set(self.runs.get() + 1);
        if let Some(effect) = &self.effect {
            effect(ctx);
        }
        Ok(StepOutcome {
            success: self.success,
            code: Some(if self.success { 0 } else { 1 }),
            output: if self.success {
                String::new()
            } else {
                format!("{} failed", self.name)
            },
            duration_ms: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Real git repositories
// ---------------------------------------------------------------------------

/// Run git in `dir`; `None` when git is not installed.
pub fn git_in(dir: &Path, args: &[&str]) -> Option<String> {
    let bin = which::which("git").ok()?;
    let out = Command::new(bin).args(args).current_dir(dir).output().unwrap();
    assert!(
        out.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    Some(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// A repository with one commit on `main`; `None` without git.
pub fn init_repo(dir: &Path) -> Option<()> {
    git_in(dir, &["init", "-q"])?;
    git_in(dir, &["checkout", "-q", "-b", "main"])?;
    git_in(dir, &["config", "user.name", "Ralph Test"])?;
    git_in(dir, &["config", "user.email", "ralph@example.com"])?;
    git_in(dir, &["config", "commit.gpgsign", "false"])?;
    std::fs::write(dir.join("README.md"), "monorepo\n").unwrap();
    git_in(dir, &["add", "README.md"])?;
    git_in(dir, &["commit", "-q", "-m", "init"])?;
    Some(())
}
