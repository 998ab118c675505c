use super::{load_config, Overrides};
use anyhow::Context;
use ralph_core::{
    config::Config,
    io,
    ledger::{Ledger, Story},
    paths,
};
use std::path::Path;

pub fn run(root: &Path, overrides: &Overrides) -> anyhow::Result<()> {
    let project_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    println!("Initializing ralph in: {}", root.display());

    // 1. Config
    let config_path = paths::config_path(root);
    if !config_path.exists() {
        let mut cfg = Config::starter();
        if let Some(base) = &overrides.base {
            cfg.base_branch = base.clone();
        }
        if let Some(ledger) = &overrides.ledger {
            cfg.ledger = ledger.clone();
        }
        cfg.save(root).context("failed to write .ralph/config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    let config = load_config(root, overrides)?;

    // 2. Starter ledger
    let ledger_path = config.ledger_path(root);
    let ledger_label = paths::repo_relative(root, &ledger_path)
        .unwrap_or_else(|| ledger_path.display().to_string());
    if !ledger_path.exists() {
        starter_ledger(&project_name)
            .save(&ledger_path)
            .with_context(|| format!("failed to write {}", ledger_path.display()))?;
        println!("  created: {ledger_label}");
    } else {
        println!("  exists:  {ledger_label}");
    }

    // 3. Keep controller-owned files out of story commits
    for entry in config.controller_owned(root) {
        if io::ensure_gitignore_entry(root, &entry).context("failed to update .gitignore")? {
            println!("  ignored: {entry}");
        }
    }

    println!("\nEdit {} and {ledger_label}, then run `ralph iterate`.", paths::CONFIG_FILE);
    Ok(())
}

fn starter_ledger(project: &str) -> Ledger {
    let mut story = Story::new("US-001", "Replace this example story", 1);
    story.description = "Describe one small, independently shippable change.".to_string();
    story.acceptance_criteria = vec![
        "A test covers the new behaviour".to_string(),
        "lint, build, and test gates pass".to_string(),
    ];
    let mut ledger = Ledger::new(project);
    ledger.user_stories.push(story);
    ledger
}
