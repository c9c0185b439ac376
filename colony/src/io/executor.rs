//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the scheduler from the agent backend
//! (an AI coding CLI reading a prompt on stdin). Tests use scripted executors
//! that return predetermined text without spawning processes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentType;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Set on every executor child so `colony task add` can attribute tasks.
pub const AGENT_ID_ENV: &str = "COLONY_AGENT_ID";

/// Parameters for one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Identity the invocation runs under; names the log file.
    pub agent_id: String,
    pub role: AgentType,
    /// Task a worker is executing.
    pub task_id: Option<String>,
    /// Role instruction document.
    pub instructions: String,
    /// Rendered state for this invocation.
    pub context: String,
    /// Working directory for the executor process.
    pub workdir: PathBuf,
    /// Where to append executor stdout/stderr.
    pub log_path: PathBuf,
    /// Maximum time to wait for the executor to complete.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl ExecRequest {
    /// Instructions and context joined into one stdin document.
    pub fn prompt(&self) -> String {
        format!(
            "{}\n\n---\n\n{}\n",
            self.instructions.trim_end(),
            self.context.trim_end()
        )
    }
}

/// Abstraction over agent execution backends.
///
/// Returns the agent's final text; the caller extracts the signal. A timeout,
/// spawn failure or non-zero exit is an `Err`.
pub trait Executor: Send + Sync {
    fn exec(&self, request: &ExecRequest) -> Result<String>;
}

/// Built-in executor backends selectable from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutorKind {
    /// `claude -p` (Claude Code, non-interactive).
    Claude,
    /// `codex exec -` (Codex CLI).
    Codex,
    /// `executor.command` from colony.toml.
    Custom,
}

/// Executor that spawns a CLI tool and feeds it the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Resolve a CLI selection. `custom` requires a non-empty `command`.
    pub fn from_kind(kind: ExecutorKind, command: &[String]) -> Result<Self> {
        match kind {
            ExecutorKind::Claude => Ok(Self::new(
                "claude",
                vec!["-p".into(), "--dangerously-skip-permissions".into()],
            )),
            ExecutorKind::Codex => Ok(Self::new(
                "codex",
                vec![
                    "exec".into(),
                    "--skip-git-repo-check".into(),
                    "--sandbox".into(),
                    "danger-full-access".into(),
                    "-".into(),
                ],
            )),
            ExecutorKind::Custom => {
                let (program, args) = command.split_first().ok_or_else(|| {
                    anyhow!("--executor custom requires executor.command in colony.toml")
                })?;
                if program.trim().is_empty() {
                    return Err(anyhow!("executor.command program must be non-empty"));
                }
                Ok(Self::new(program.clone(), args.to_vec()))
            }
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(agent_id = %request.agent_id, role = %request.role, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<String> {
        info!(program = %self.program, task_id = ?request.task_id, "starting executor");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&request.workdir)
            .env(AGENT_ID_ENV, &request.agent_id);
        let prompt = request.prompt();
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run {}", self.program))?;

        write_executor_log(request, &output)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "executor timed out");
            return Err(anyhow!(
                "{} timed out after {:?}",
                self.program,
                request.timeout
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "executor failed");
            return Err(anyhow!(
                "{} failed with status {:?}",
                self.program,
                output.status.code()
            ));
        }

        debug!(bytes = output.stdout.len(), "executor completed successfully");
        Ok(output.stdout_lossy())
    }
}

/// Append one invocation's output to the agent's log.
fn write_executor_log(request: &ExecRequest, output: &CommandOutput) -> Result<()> {
    let path: &Path = &request.log_path;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str(&format!(
        "=== {} {} task={} exit={:?} ===\n",
        chrono::Utc::now().to_rfc3339(),
        request.role,
        request.task_id.as_deref().unwrap_or("-"),
        output.status.code()
    ));
    buf.push_str("--- stdout ---\n");
    buf.push_str(&output.stdout_lossy());
    buf.push_str(&output.truncated_notice("stdout"));
    buf.push_str("\n--- stderr ---\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.truncated_notice("stderr"));
    if output.timed_out {
        buf.push_str("\n[executor timed out]\n");
    }
    buf.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open executor log {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write executor log {}", path.display()))
}
