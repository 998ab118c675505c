use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const RALPH_DIR: &str = ".ralph";
pub const CONFIG_FILE: &str = ".ralph/config.yaml";

pub const DEFAULT_LEDGER: &str = "prd.json";
pub const DEFAULT_PROGRESS_LOG: &str = "progress.txt";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve a configured path against the project root. Absolute paths are kept.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

/// Express `path` relative to `root` with forward slashes, the form git
/// prints in `status --porcelain`. `None` when `path` lives outside `root`.
pub fn repo_relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

// ---------------------------------------------------------------------------
// Branch slugs
// ---------------------------------------------------------------------------

static NON_SLUG_RE: OnceLock<Regex> = OnceLock::new();

fn non_slug_re() -> &'static Regex {
    NON_SLUG_RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap())
}

/// Lowercase, collapse runs of non-alphanumerics into `-`, trim dashes, cap at
/// `max_len` without leaving a trailing dash.
pub fn slugify(input: &str, max_len: usize) -> String {
    let lower = input.to_lowercase();
    let dashed = non_slug_re().replace_all(&lower, "-");
    let trimmed = dashed.trim_matches('-');
    let mut slug: String = trimmed.chars().take(max_len).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// `<prefix>/<story-id>-<title-slug>`, e.g. `ralph/us-001-add-login-form`.
pub fn story_branch_name(prefix: &str, story_id: &str, title: &str) -> String {
    let id = slugify(story_id, 32);
    let title = slugify(title, 40);
    let leaf = match (id.is_empty(), title.is_empty()) {
        (false, false) => format!("{id}-{title}"),
        (false, true) => id,
        (true, false) => title,
        (true, true) => "story".to_string(),
    };
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        leaf
    } else {
        format!("{prefix}/{leaf}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
