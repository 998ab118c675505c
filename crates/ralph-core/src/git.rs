//! Source-control operations the iteration controller needs, behind a trait
//! so the controller can be driven against an in-memory fake.

use crate::error::{Result, RalphError};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Paths passed to and returned from a `Git` are relative to the worktree top
/// level, which may sit above the project root in a monorepo.
pub trait Git {
    /// Where the project root sits inside the worktree, as printed by
    /// `git rev-parse --show-prefix`: `apps/web/`, or empty at the top level.
    fn worktree_prefix(&self) -> Result<String>;
    /// Paths with staged, unstaged, or untracked changes anywhere in the worktree.
    fn changed_paths(&self) -> Result<Vec<String>>;
    fn current_branch(&self) -> Result<String>;
    fn fetch(&self, remote: &str, branch: &str) -> Result<()>;
    fn checkout(&self, branch: &str) -> Result<()>;
    /// Fast-forward the current branch to `upstream` (e.g. `origin/main`).
    fn merge_ff_only(&self, upstream: &str) -> Result<()>;
    fn branch_exists(&self, name: &str) -> Result<bool>;
    /// Create `name` at `start` and switch to it.
    fn create_branch(&self, name: &str, start: &str) -> Result<()>;
    /// Stage every change in the worktree except the given paths.
    fn stage_all_except(&self, exclude: &[String]) -> Result<()>;
    fn commit(&self, message: &str) -> Result<()>;
    fn push(&self, remote: &str, branch: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// GitCli
// ---------------------------------------------------------------------------

/// Shells out to the `git` binary in the project root.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    bin: PathBuf,
}

impl GitCli {
    /// Locate `git` on PATH.
    pub fn detect(root: &Path) -> Result<Self> {
        let bin = which::which("git").map_err(|_| RalphError::MissingTool("git".to_string()))?;
        Ok(Self {
            root: root.to_path_buf(),
            bin,
        })
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "git");
        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(&self.root)
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Err(RalphError::GitCommandFailed {
                command: args.join(" "),
                stderr: if stderr.is_empty() { stdout } else { stderr },
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Git for GitCli {
    fn worktree_prefix(&self) -> Result<String> {
        Ok(self.run(&["rev-parse", "--show-prefix"])?.trim().to_string())
    }

    fn changed_paths(&self) -> Result<Vec<String>> {
        let out = self.run(&["status", "--porcelain", "-z", "--untracked-files=all"])?;
        Ok(parse_porcelain_z(&out))
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string())
    }

    fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run(&["fetch", remote, branch]).map(drop)
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", branch]).map(drop)
    }

    fn merge_ff_only(&self, upstream: &str) -> Result<()> {
        self.run(&["merge", "--ff-only", upstream]).map(drop)
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{name}");
        let status = Command::new(&self.bin)
            .args(["show-ref", "--verify", "--quiet", &refname])
            .current_dir(&self.root)
            .status()?;
        Ok(status.success())
    }

    fn create_branch(&self, name: &str, start: &str) -> Result<()> {
        self.run(&["checkout", "-b", name, start]).map(drop)
    }

    fn stage_all_except(&self, exclude: &[String]) -> Result<()> {
        let excludes: Vec<String> = exclude
            .iter()
            .map(|p| format!(":(top,exclude){p}"))
            .collect();
        let mut args = vec!["add", "--all", "--", ":/"];
        args.extend(excludes.iter().map(String::as_str));
        self.run(&args).map(drop)
    }

    fn commit(&self, message: &str) -> Result<()> {
        self.run(&["commit", "-m", message]).map(drop)
    }

    fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run(&["push", "-u", remote, branch]).map(drop)
    }
}

/// Extract paths from `git status --porcelain -z`. Entries are NUL-terminated
/// and never quoted; a rename or copy is followed by its source path, which is
/// skipped so the destination is reported.
pub fn parse_porcelain_z(out: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut fields = out.split('\0');
    while let Some(entry) = fields.next() {
        let Some(path) = entry.get(3..).filter(|p| !p.is_empty()) else {
            continue;
        };
        if entry.starts_with(['R', 'C']) {
            fields.next();
        }
        paths.push(path.to_string());
    }
    paths
}
