use super::{ensure_runnable, load_config, Overrides};
use crate::output::print_json;
use anyhow::Context;
use ralph_core::{
    ci::SystemClock,
    config::Config,
    git::GitCli,
    host::GhCli,
    iteration::{
        AutoMerge, IterationController, IterationOptions, IterationOutcome, IterationReport, Steps,
    },
    ledger::{Ledger, LedgerSummary},
};
use serde::Serialize;
use std::path::Path;

pub fn run(
    root: &Path,
    overrides: &Overrides,
    merge: bool,
    merge_timeout: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(root, overrides)?;
    let outcome = match idle_outcome(root, &config)? {
        Some(idle) => idle,
        None => {
            let opts = IterationOptions::from_config(&config, None, merge, merge_timeout);
            let tools = Tools::detect(root)?;
            let mut ctl = tools.controller(root, &config);
            ctl.run(&opts)?
        }
    };

    if json {
        print_json(&outcome)?;
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

#[derive(Serialize)]
struct LoopSummary {
    iterations: Vec<IterationReport>,
    summary: LedgerSummary,
    drained: bool,
}

pub fn run_loop(
    root: &Path,
    overrides: &Overrides,
    max_iterations: Option<usize>,
    merge: bool,
    merge_timeout: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(root, overrides)?;
    let mut iterations = Vec::new();

    if idle_outcome(root, &config)?.is_none() {
        let opts = IterationOptions::from_config(&config, None, merge, merge_timeout);
        let tools = Tools::detect(root)?;
        let mut ctl = tools.controller(root, &config);
        let limit = max_iterations.unwrap_or(usize::MAX);

        while iterations.len() < limit {
            let n = iterations.len() + 1;
            match ctl.run(&opts).with_context(|| format!("iteration {n} failed"))? {
                IterationOutcome::Idle { .. } => break,
                IterationOutcome::Completed(report) => {
                    if !json {
                        print_report(&report);
                        println!();
                    }
                    iterations.push(report);
                }
            }
        }
    }

    let summary = Ledger::load(&config.ledger_path(root))?.summary();
    let drained = summary.remaining == 0;
    if json {
        print_json(&LoopSummary {
            iterations,
            summary,
            drained,
        })?;
    } else if drained {
        println!(
            "Ledger drained: {} iteration(s), {}/{} stories pass.",
            iterations.len(),
            summary.passing,
            summary.total
        );
    } else {
        println!(
            "Stopped after {} iteration(s); {} of {} stories remain.",
            iterations.len(),
            summary.remaining,
            summary.total
        );
    }
    Ok(())
}

/// `Some` when nothing is left to do, so a drained ledger never needs git or
/// gh on PATH.
fn idle_outcome(root: &Path, config: &Config) -> anyhow::Result<Option<IterationOutcome>> {
    let ledger_path = config.ledger_path(root);
    let ledger = Ledger::load(&ledger_path)
        .with_context(|| format!("failed to load {}", ledger_path.display()))?;
    if ledger.next_story().is_some() {
        ensure_runnable(config)?;
        return Ok(None);
    }
    Ok(Some(IterationOutcome::Idle {
        summary: ledger.summary(),
    }))
}

struct Tools {
    git: GitCli,
    gh: GhCli,
    clock: SystemClock,
}

impl Tools {
    fn detect(root: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            git: GitCli::detect(root)?,
            gh: GhCli::detect(root)?,
            clock: SystemClock::new(),
        })
    }

    fn controller<'a>(&'a self, root: &'a Path, config: &Config) -> IterationController<'a> {
        IterationController::new(
            root,
            config,
            &self.git,
            &self.gh,
            &self.clock,
            Steps::from_config(config),
        )
    }
}

fn print_outcome(outcome: &IterationOutcome) {
    match outcome {
        IterationOutcome::Idle { summary } => {
            println!("Nothing to do: all {} stories pass.", summary.total)
        }
        IterationOutcome::Completed(report) => print_report(report),
    }
}

fn print_report(report: &IterationReport) {
    println!("{}: {}", report.story_id, report.story_title);
    println!("  branch: {}", report.branch);
    println!("  pr:     #{} {}", report.pr.number, report.pr.url);
    if !report.gates.is_empty() {
        let gates: Vec<String> = report
            .gates
            .iter()
            .map(|g| format!("{} ({}ms)", g.gate_name, g.duration_ms))
            .collect();
        println!("  gates:  {}", gates.join(", "));
    }
    let merge = match &report.auto_merge {
        AutoMerge::NotRequested => "not requested".to_string(),
        AutoMerge::Merged { ci } => format!("merged (ci: {ci})"),
        AutoMerge::ChecksFailed => "CI failed; PR left open".to_string(),
        AutoMerge::TimedOut { waited_secs } => {
            format!("CI still pending after {waited_secs}s; PR left open")
        }
        AutoMerge::Rejected { failure } => format!(
            "refused ({}): {}\n          next: {}",
            failure.kind, failure.message, failure.remedy
        ),
        AutoMerge::Error { message } => format!("not merged: {message}"),
    };
    println!("  merge:  {merge}");
}
