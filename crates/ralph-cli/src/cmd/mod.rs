pub mod config;
pub mod init;
pub mod iterate;
pub mod merge_stack;
pub mod story;

use anyhow::Context;
use ralph_core::config::{Config, WarnLevel};
use std::path::{Path, PathBuf};

/// Global flags that override `.ralph/config.yaml`.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub base: Option<String>,
    pub ledger: Option<PathBuf>,
}

/// Load the project config with `--base` / `--ledger` applied.
pub fn load_config(root: &Path, overrides: &Overrides) -> anyhow::Result<Config> {
    let mut config = Config::load(root).context("failed to load .ralph/config.yaml")?;
    if let Some(base) = &overrides.base {
        config.base_branch = base.clone();
    }
    if let Some(ledger) = &overrides.ledger {
        config.ledger = ledger.clone();
    }
    Ok(config)
}

/// Refuse to drive git or the hosting CLI with a config that has errors.
pub fn ensure_runnable(config: &Config) -> anyhow::Result<()> {
    let mut errors = Vec::new();
    for w in config.validate() {
        match w.level {
            WarnLevel::Error => errors.push(w.message),
            WarnLevel::Warning => tracing::warn!("{}", w.message),
        }
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid config: {}", errors.join("; "));
    }
    Ok(())
}
