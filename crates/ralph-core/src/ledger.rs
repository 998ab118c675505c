//! The Story Ledger: the JSON backlog (`prd.json`) the iteration controller
//! drains one story at a time.
//!
//! The file is owned by whoever authored the backlog; ralph only reads it and
//! flips `passes` / appends `notes`. Fields ralph does not know about are kept
//! on rewrite.

use crate::error::{Result, RalphError};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// Story
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lower numbers are picked first.
    #[serde(default)]
    pub priority: i64,
    /// Files the story is expected to create.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    /// Scaffold skill to run before implementation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority,
            files: Vec::new(),
            passes: false,
            notes: String::new(),
            skill: None,
            extra: serde_json::Map::new(),
        }
    }

    fn append_note(&mut self, note: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        if !self.notes.is_empty() && !self.notes.ends_with('\n') {
            self.notes.push('\n');
        }
        self.notes.push_str(&format!("[{stamp}] {note}"));
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    #[serde(default)]
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub user_stories: Vec<Story>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub passing: usize,
    pub remaining: usize,
}

impl Ledger {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            branch_name: None,
            description: None,
            user_stories: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RalphError::LedgerNotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        let ledger: Ledger = serde_json::from_str(&data)?;
        ledger.validate()?;
        Ok(ledger)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let mut data = serde_json::to_string_pretty(self)?;
        data.push('\n');
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Read-modify-write in one step: reload from disk, apply `f`, write back.
    ///
    /// Every ledger mutation goes through here so a stale in-memory copy can
    /// never overwrite a newer file. If `f` fails nothing is written.
    pub fn update<T>(path: &Path, f: impl FnOnce(&mut Ledger) -> Result<T>) -> Result<T> {
        let mut ledger = Ledger::load(path)?;
        let out = f(&mut ledger)?;
        ledger.save(path)?;
        Ok(out)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (i, story) in self.user_stories.iter().enumerate() {
            if story.id.trim().is_empty() {
                return Err(RalphError::InvalidLedger(format!(
                    "story #{} has an empty id",
                    i + 1
                )));
            }
            if story.title.trim().is_empty() {
                return Err(RalphError::InvalidLedger(format!(
                    "story '{}' has an empty title",
                    story.id
                )));
            }
            if !seen.insert(story.id.as_str()) {
                return Err(RalphError::InvalidLedger(format!(
                    "duplicate story id '{}'",
                    story.id
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The incomplete story with the lowest priority; ledger order breaks ties.
    pub fn next_story(&self) -> Option<&Story> {
        self.user_stories
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.passes)
            .min_by_key(|(i, s)| (s.priority, *i))
            .map(|(_, s)| s)
    }

    pub fn story(&self, id: &str) -> Result<&Story> {
        self.user_stories
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| RalphError::StoryNotFound(id.to_string()))
    }

    pub fn story_mut(&mut self, id: &str) -> Result<&mut Story> {
        self.user_stories
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RalphError::StoryNotFound(id.to_string()))
    }

    pub fn summary(&self) -> LedgerSummary {
        let total = self.user_stories.len();
        let passing = self.user_stories.iter().filter(|s| s.passes).count();
        LedgerSummary {
            total,
            passing,
            remaining: total - passing,
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn mark_passed(&mut self, id: &str, note: &str) -> Result<()> {
        let story = self.story_mut(id)?;
        story.passes = true;
        if !note.is_empty() {
            story.append_note(note);
        }
        Ok(())
    }

    pub fn reset(&mut self, id: &str) -> Result<()> {
        let story = self.story_mut(id)?;
        story.passes = false;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
