//! Text ralph hands to git, the hosting CLI, and the implementation agent.

use crate::ledger::Story;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write;

pub fn pr_title(story: &Story) -> String {
    format!("feat: {} - {}", story.id, story.title)
}

/// Commit message with the story metadata as trailers so `git log` alone can
/// answer which story a commit belongs to.
pub fn commit_message(story: &Story) -> String {
    let mut msg = pr_title(story);
    msg.push_str("\n\n");
    if !story.description.trim().is_empty() {
        msg.push_str(story.description.trim());
        msg.push_str("\n\n");
    }
    if !story.acceptance_criteria.is_empty() {
        msg.push_str("Acceptance criteria:\n");
        for criterion in &story.acceptance_criteria {
            let _ = writeln!(msg, "- {criterion}");
        }
        msg.push('\n');
    }
    let _ = writeln!(msg, "Story-Id: {}", story.id);
    let _ = writeln!(msg, "Story-Priority: {}", story.priority);
    if let Some(skill) = &story.skill {
        let _ = writeln!(msg, "Story-Skill: {skill}");
    }
    for file in &story.files {
        let _ = writeln!(msg, "Story-File: {file}");
    }
    msg.trim_end().to_string()
}

pub fn pr_body(story: &Story, branch: &str) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "## {}: {}\n", story.id, story.title);
    if !story.description.trim().is_empty() {
        let _ = writeln!(body, "{}\n", story.description.trim());
    }
    if !story.acceptance_criteria.is_empty() {
        body.push_str("### Acceptance criteria\n\n");
        for criterion in &story.acceptance_criteria {
            let _ = writeln!(body, "- [x] {criterion}");
        }
        body.push('\n');
    }
    if !story.files.is_empty() {
        body.push_str("### Files\n\n");
        for file in &story.files {
            let _ = writeln!(body, "- `{file}`");
        }
        body.push('\n');
    }
    let _ = writeln!(
        body,
        "Priority {} · branch `{branch}` · local gates passed before push.",
        story.priority
    );
    body
}

/// Instructions for the implementation agent, exported as `RALPH_PROMPT`.
pub fn story_prompt(story: &Story) -> String {
    let mut prompt = format!("Implement story {}: {}\n", story.id, story.title);
    if !story.description.trim().is_empty() {
        let _ = write!(prompt, "\n{}\n", story.description.trim());
    }
    if !story.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for criterion in &story.acceptance_criteria {
            let _ = writeln!(prompt, "- {criterion}");
        }
    }
    if !story.files.is_empty() {
        prompt.push_str("\nFiles to create:\n");
        for file in &story.files {
            let _ = writeln!(prompt, "- {file}");
        }
    }
    prompt.push_str(
        "\nWork test-first: write a failing test, make it pass, then refactor. \
         Do not commit; ralph verifies and commits after you finish.\n",
    );
    prompt
}

pub fn progress_entry(story: &Story, branch: &str, pr_url: &str, at: DateTime<Utc>) -> String {
    format!(
        "## {} - {}: {}\n- branch: {branch}\n- pr: {pr_url}\n\n",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        story.id,
        story.title
    )
}
