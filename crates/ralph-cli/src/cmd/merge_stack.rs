use super::{load_config, Overrides};
use crate::output::{print_json, print_table};
use ralph_core::{
    ci::SystemClock,
    host::GhCli,
    merge_stack::{run_merge_stack, MergeStackOptions, MergeStackReport},
};
use std::path::Path;

pub fn run(
    root: &Path,
    overrides: &Overrides,
    dry_run: bool,
    wait: bool,
    wait_timeout: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(root, overrides)?;
    let opts = MergeStackOptions::from_config(&config, None, dry_run, wait, wait_timeout);
    let gh = GhCli::detect(root)?;
    let report = run_merge_stack(&gh, &SystemClock::new(), &opts)?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    if report.has_failures() {
        anyhow::bail!("{} pull request(s) could not be merged", report.failed.len());
    }
    Ok(())
}

fn print_report(report: &MergeStackReport) {
    if report.order.is_empty() {
        println!("No open pull requests against {}.", report.base);
        return;
    }

    if report.dry_run {
        println!("Dry run: would merge into {} in this order:", report.base);
        let rows = report
            .remaining
            .iter()
            .map(|pr| vec![format!("#{}", pr.number), pr.head_ref_name.clone(), pr.title.clone()])
            .collect();
        print_table(&["PR", "BRANCH", "TITLE"], rows);
        return;
    }

    let rows = report
        .order
        .iter()
        .map(|n| {
            let result = if report.merged.contains(n) {
                "merged".to_string()
            } else if let Some(f) = report.failed.iter().find(|f| f.number == *n) {
                format!("failed: {}", f.kind)
            } else if let Some(s) = report.skipped.iter().find(|s| s.number == *n) {
                format!("skipped: {}", s.reason)
            } else {
                "-".to_string()
            };
            vec![format!("#{n}"), result]
        })
        .collect();
    print_table(&["PR", "RESULT"], rows);

    if !report.failed.is_empty() {
        println!("\nTo fix:");
        for f in &report.failed {
            println!("  #{} {}", f.number, f.message.lines().next().unwrap_or(""));
            println!("     {}", f.remedy);
        }
    }

    if report.remaining.is_empty() {
        println!("\nNo open pull requests remain against {}.", report.base);
    } else {
        println!("\nStill open against {}:", report.base);
        for pr in &report.remaining {
            println!("  #{} {} ({})", pr.number, pr.title, pr.url);
        }
    }
}
