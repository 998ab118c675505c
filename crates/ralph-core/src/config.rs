use crate::error::Result;
use crate::gate::GateDefinition;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// StepConfig
// ---------------------------------------------------------------------------

/// An external command ralph runs as an opaque step (scaffold, implement).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub command: String,
    /// `0` disables the timeout.
    #[serde(default)]
    pub timeout_seconds: u64,
}

// ---------------------------------------------------------------------------
// CiConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Budget for `iterate --merge` when `--merge-timeout` is not given.
    #[serde(default = "default_merge_timeout")]
    pub merge_timeout_seconds: u64,
    /// Budget for `merge-stack --wait` per PR.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_seconds: u64,
    /// Treat a PR with no checks at all as not ready.
    #[serde(default)]
    pub require_checks: bool,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_merge_timeout() -> u64 {
    600
}

fn default_wait_timeout() -> u64 {
    300
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            merge_timeout_seconds: default_merge_timeout(),
            wait_timeout_seconds: default_wait_timeout(),
            require_checks: false,
        }
    }
}

impl CiConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_true")]
    pub delete_branch: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            delete_branch: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,
    #[serde(default = "default_progress_log")]
    pub progress_log: PathBuf,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// `{skill}` in the command is replaced with the story's skill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaffold: Option<StepConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implement: Option<StepConfig>,
    #[serde(default)]
    pub gates: Vec<GateDefinition>,
    #[serde(default)]
    pub ci: CiConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

fn default_version() -> u32 {
    1
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_ledger() -> PathBuf {
    PathBuf::from(paths::DEFAULT_LEDGER)
}

fn default_progress_log() -> PathBuf {
    PathBuf::from(paths::DEFAULT_PROGRESS_LOG)
}

fn default_branch_prefix() -> String {
    "ralph".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            base_branch: default_base_branch(),
            remote: default_remote(),
            ledger: default_ledger(),
            progress_log: default_progress_log(),
            branch_prefix: default_branch_prefix(),
            scaffold: None,
            implement: None,
            gates: Vec::new(),
            ci: CiConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl Config {
    /// Starter config written by `ralph init`.
    pub fn starter() -> Self {
        Self {
            implement: Some(StepConfig {
                command: "claude -p \"$RALPH_PROMPT\"".to_string(),
                timeout_seconds: 3600,
            }),
            gates: vec![
                GateDefinition::new("lint", "npm run lint"),
                GateDefinition::new("build", "npm run build"),
                GateDefinition::new("test", "npm test"),
            ],
            ..Self::default()
        }
    }

    /// Load `.ralph/config.yaml`, falling back to defaults when it is absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn ledger_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.ledger)
    }

    pub fn progress_log_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.progress_log)
    }

    /// Files ralph itself rewrites; never part of a story commit.
    pub fn controller_owned(&self, root: &Path) -> Vec<String> {
        [self.ledger_path(root), self.progress_log_path(root)]
            .iter()
            .filter_map(|p| paths::repo_relative(root, p))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut warn = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message });
        };

        if self.base_branch.trim().is_empty() {
            warn(WarnLevel::Error, "base_branch is empty".to_string());
        }
        if self.remote.trim().is_empty() {
            warn(WarnLevel::Error, "remote is empty".to_string());
        }

        match &self.implement {
            None => warn(
                WarnLevel::Warning,
                "no implement step configured; iterations will only run gates".to_string(),
            ),
            Some(step) if step.command.trim().is_empty() => {
                warn(WarnLevel::Error, "implement step has an empty command".to_string())
            }
            Some(_) => {}
        }

        if let Some(step) = &self.scaffold {
            if step.command.trim().is_empty() {
                warn(WarnLevel::Error, "scaffold step has an empty command".to_string());
            }
        }

        let mut names = HashSet::new();
        for gate in &self.gates {
            if gate.command.trim().is_empty() {
                warn(
                    WarnLevel::Error,
                    format!("gate '{}' has an empty command", gate.name),
                );
            }
            if !names.insert(gate.name.as_str()) {
                warn(
                    WarnLevel::Warning,
                    format!("gate '{}' is defined more than once", gate.name),
                );
            }
        }

        if self.ci.poll_interval_seconds == 0 {
            warn(
                WarnLevel::Error,
                "ci.poll_interval_seconds must be greater than 0".to_string(),
            );
        }
        for (key, timeout) in [
            ("merge_timeout_seconds", self.ci.merge_timeout_seconds),
            ("wait_timeout_seconds", self.ci.wait_timeout_seconds),
        ] {
            if timeout < self.ci.poll_interval_seconds {
                warn(
                    WarnLevel::Warning,
                    format!(
                        "ci.{key}={timeout} is shorter than the poll interval ({}s); CI will be checked at most once",
                        self.ci.poll_interval_seconds
                    ),
                );
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
