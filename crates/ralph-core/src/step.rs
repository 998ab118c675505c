//! Opaque external steps: scaffold, implement, and quality gates.
//!
//! The controller only cares whether a step succeeded, so every step sits
//! behind [`Collaborator`]. [`ShellStep`] is the production implementation;
//! tests substitute in-memory fakes.

use crate::error::{Result, RalphError};
use crate::gate::{GateDefinition, GateResult};
use crate::ledger::Story;
use crate::render;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cap on captured output kept per step (the tail is kept).
const MAX_OUTPUT: usize = 10 * 1024;

// ---------------------------------------------------------------------------
// Context / outcome
// ---------------------------------------------------------------------------

/// What a step gets to see about the current iteration.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub root: &'a Path,
    pub story: &'a Story,
    pub branch: &'a str,
    pub base: &'a str,
}

impl StepContext<'_> {
    /// Environment exported to shell steps.
    pub fn env(&self) -> Vec<(String, String)> {
        let story = self.story;
        let mut env = vec![
            ("RALPH_STORY_ID".to_string(), story.id.clone()),
            ("RALPH_STORY_TITLE".to_string(), story.title.clone()),
            ("RALPH_STORY_PRIORITY".to_string(), story.priority.to_string()),
            ("RALPH_STORY_FILES".to_string(), story.files.join("\n")),
            (
                "RALPH_STORY_JSON".to_string(),
                serde_json::to_string(story).unwrap_or_default(),
            ),
            ("RALPH_BRANCH".to_string(), self.branch.to_string()),
            ("RALPH_BASE_BRANCH".to_string(), self.base.to_string()),
            ("RALPH_PROMPT".to_string(), render::story_prompt(story)),
        ];
        if let Some(skill) = &story.skill {
            env.push(("RALPH_SKILL".to_string(), skill.clone()));
        }
        env
    }

    /// Substitute `{skill}`, `{story_id}`, `{branch}`, and `{base}` in a
    /// configured command.
    pub fn expand(&self, command: &str) -> String {
        command
            .replace("{skill}", self.story.skill.as_deref().unwrap_or(""))
            .replace("{story_id}", &self.story.id)
            .replace("{branch}", self.branch)
            .replace("{base}", self.base)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub success: bool,
    /// `None` when the process was killed (signal or timeout).
    pub code: Option<i32>,
    pub output: String,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn code_label(&self) -> String {
        self.code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string())
    }
}

// ---------------------------------------------------------------------------
// Collaborator
// ---------------------------------------------------------------------------

pub trait Collaborator {
    fn name(&self) -> &str;
    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome>;
}

/// Run gates in order, stopping at the first failure.
pub fn run_gates(gates: &[Box<dyn Collaborator>], ctx: &StepContext<'_>) -> Result<Vec<GateResult>> {
    let mut results = Vec::with_capacity(gates.len());
    for gate in gates {
        info!(gate = gate.name(), "running verification gate");
        let outcome = gate.run(ctx)?;
        let passed = outcome.success;
        results.push(GateResult {
            gate_name: gate.name().to_string(),
            passed,
            output: outcome.output,
            duration_ms: outcome.duration_ms,
        });
        if !passed {
            warn!(gate = gate.name(), "verification gate failed");
            break;
        }
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// ShellStep
// ---------------------------------------------------------------------------

/// `sh -c <command>` in the project root with the story exported as `RALPH_*`.
#[derive(Debug, Clone)]
pub struct ShellStep {
    name: String,
    command: String,
    timeout: Option<Duration>,
    passthrough: bool,
}

impl ShellStep {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout: None,
            passthrough: false,
        }
    }

    /// `0` means no timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    /// Stream output to the terminal instead of capturing it.
    pub fn passthrough(mut self, on: bool) -> Self {
        self.passthrough = on;
        self
    }

    pub fn from_gate(gate: &GateDefinition) -> Self {
        Self::new(&gate.name, &gate.command).with_timeout_secs(gate.timeout_seconds)
    }
}

impl Collaborator for ShellStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        if self.command.trim().is_empty() {
            return Ok(StepOutcome {
                success: false,
                code: None,
                output: format!("{} command is empty", self.name),
                duration_ms: 0,
            });
        }
        let command = ctx.expand(&self.command);
        debug!(step = %self.name, %command, "spawning step");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(ctx.root)
            .envs(ctx.env())
            .stdin(Stdio::null());
        if self.passthrough {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        execute(&self.name, cmd, self.timeout)
    }
}

/// Spawn `cmd`, wait with an optional timeout, and collect its output.
///
/// Stdout/stderr are drained on their own threads so a chatty child cannot
/// fill the pipe and deadlock. The wait itself happens on a waiter thread so
/// the timeout is a `recv_timeout`, not a busy loop.
fn execute(name: &str, mut cmd: Command, timeout: Option<Duration>) -> Result<StepOutcome> {
    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| RalphError::StepSpawnFailed {
        step: name.to_string(),
        reason: e.to_string(),
    })?;
    let child_pid = child.id();

    let stdout_thread = spawn_reader(child.stdout.take());
    let stderr_thread = spawn_reader(child.stderr.take());

    let wait_result = match timeout {
        None => child.wait(),
        Some(limit) => {
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(child.wait());
            });
            match rx.recv_timeout(limit) {
                Ok(result) => result,
                Err(_) => {
                    kill_process(child_pid);
                    warn!(step = name, secs = limit.as_secs(), "step timed out");
                    return Ok(StepOutcome {
                        success: false,
                        code: None,
                        output: format!("timed out after {}s", limit.as_secs()),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();
    let status = wait_result?;

    Ok(StepOutcome {
        success: status.success(),
        code: status.code(),
        output: combine_output(&stdout, &stderr),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    handle: Option<R>,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = handle {
            let _ = r.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Join stdout/stderr and keep at most the last `MAX_OUTPUT` bytes.
fn combine_output(stdout: &str, stderr: &str) -> String {
    let output = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (_, true) => stdout.trim().to_string(),
        (true, false) => stderr.trim().to_string(),
        (false, false) => format!("{}\n{}", stdout.trim(), stderr.trim()),
    };
    if output.len() <= MAX_OUTPUT {
        return output;
    }
    let mut cut = output.len() - MAX_OUTPUT;
    while !output.is_char_boundary(cut) {
        cut += 1;
    }
    output[cut..].to_string()
}

/// SIGKILL by PID. Best-effort.
fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
