use super::{load_config, Overrides};
use crate::output::{print_json, print_table, yes_no};
use anyhow::Context;
use clap::Subcommand;
use ralph_core::{
    ledger::{Ledger, Story},
    render,
};
use std::path::Path;

#[derive(Subcommand)]
pub enum StorySubcommand {
    /// List every story in priority order
    List,
    /// Show the story the next iteration would pick
    Next,
    /// Show one story, including the prompt handed to the implement step
    Show { id: String },
    /// Mark a story as not passing so it is picked up again
    Reset { id: String },
    /// Count passing and remaining stories
    Status,
}

pub fn run(
    root: &Path,
    overrides: &Overrides,
    subcmd: StorySubcommand,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(root, overrides)?;
    let path = config.ledger_path(root);
    match subcmd {
        StorySubcommand::List => list(&path, json),
        StorySubcommand::Next => next(&path, json),
        StorySubcommand::Show { id } => show(&path, &id, json),
        StorySubcommand::Reset { id } => reset(&path, &id, json),
        StorySubcommand::Status => status(&path, json),
    }
}

fn load(path: &Path) -> anyhow::Result<Ledger> {
    Ledger::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn list(path: &Path, json: bool) -> anyhow::Result<()> {
    let ledger = load(path)?;
    let mut stories: Vec<&Story> = ledger.user_stories.iter().collect();
    stories.sort_by_key(|s| s.priority);

    if json {
        return print_json(&stories);
    }
    if stories.is_empty() {
        println!("No stories.");
        return Ok(());
    }
    let rows = stories
        .iter()
        .map(|s| {
            vec![
                s.id.clone(),
                s.priority.to_string(),
                yes_no(s.passes),
                s.skill.clone().unwrap_or_default(),
                s.title.clone(),
            ]
        })
        .collect();
    print_table(&["ID", "PRIORITY", "PASSES", "SKILL", "TITLE"], rows);
    Ok(())
}

fn next(path: &Path, json: bool) -> anyhow::Result<()> {
    let ledger = load(path)?;
    let next = ledger.next_story();
    if json {
        return print_json(&serde_json::json!({ "next": next }));
    }
    match next {
        Some(s) => println!("{} (priority {}): {}", s.id, s.priority, s.title),
        None => println!("All stories pass."),
    }
    Ok(())
}

fn show(path: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let ledger = load(path)?;
    let story = ledger.story(id)?;
    if json {
        return print_json(story);
    }

    println!("{}: {}", story.id, story.title);
    println!("priority: {}", story.priority);
    println!("passes:   {}", yes_no(story.passes));
    if let Some(skill) = &story.skill {
        println!("skill:    {skill}");
    }
    println!("\n--- prompt ---\n{}", render::story_prompt(story));
    if !story.notes.trim().is_empty() {
        println!("--- notes ---\n{}", story.notes.trim_end());
    }
    Ok(())
}

fn reset(path: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    Ledger::update(path, |ledger| ledger.reset(id))
        .with_context(|| format!("failed to reset story '{id}'"))?;
    if json {
        print_json(&serde_json::json!({ "id": id, "passes": false }))?;
    } else {
        println!("Reset {id}; the next iteration may pick it up again.");
    }
    Ok(())
}

fn status(path: &Path, json: bool) -> anyhow::Result<()> {
    let ledger = load(path)?;
    let summary = ledger.summary();
    if json {
        return print_json(&summary);
    }
    println!(
        "{}: {}/{} stories pass, {} remaining",
        ledger.project, summary.passing, summary.total, summary.remaining
    );
    if let Some(next) = ledger.next_story() {
        println!("next: {} {}", next.id, next.title);
    }
    Ok(())
}
