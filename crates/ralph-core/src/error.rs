use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RalphError {
    #[error("story ledger not found: {}", .0.display())]
    LedgerNotFound(PathBuf),

    #[error("invalid story ledger: {0}")]
    InvalidLedger(String),

    #[error("story not found: {0}")]
    StoryNotFound(String),

    #[error("required tool '{0}' not found on PATH")]
    MissingTool(String),

    #[error("not authenticated with the hosting CLI: {0}")]
    NotAuthenticated(String),

    #[error("working tree has uncommitted changes: {}", .0.join(", "))]
    DirtyWorktree(Vec<String>),

    #[error("could not find a free branch name for '{0}'")]
    BranchNameExhausted(String),

    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("`git {command}` failed: {stderr}")]
    GitCommandFailed { command: String, stderr: String },

    #[error("`gh {command}` failed: {stderr}")]
    HostCommandFailed { command: String, stderr: String },

    #[error("failed to spawn '{step}': {reason}")]
    StepSpawnFailed { step: String, reason: String },

    #[error("{step} step failed (exit {code}) on branch '{branch}'; branch left for inspection\n{output}")]
    StepFailed {
        step: String,
        code: String,
        branch: String,
        output: String,
    },

    #[error("verification gate '{gate}' failed on branch '{branch}'; branch left for inspection\n{output}")]
    VerificationFailed {
        gate: String,
        branch: String,
        output: String,
    },

    #[error("unexpected output from {0}")]
    UnexpectedOutput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RalphError>;
