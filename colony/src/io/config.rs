//! Project configuration stored in `colony.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;

/// Project configuration (TOML).
///
/// Edited by humans; every section is optional and missing fields fall back
/// to the defaults below. Only `project.goal` has no usable default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ColonyConfig {
    pub project: ProjectConfig,
    pub scheduler: SchedulerSettings,
    pub tasks: TaskDefaults,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProjectConfig {
    /// What the run is trying to achieve. Fed to every role's context.
    pub goal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Concurrent worker units per cycle.
    pub max_workers: usize,
    /// Run the executive every `exec_interval` cycles (and on cycle 1).
    pub exec_interval: u32,
    /// Cycle budget before the run ends as exhausted.
    pub max_cycles: u32,
    /// Pause between cycles.
    pub cycle_delay_secs: u64,
    /// Heartbeat silence after which an active agent is considered dead.
    pub stale_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_workers: 3,
            exec_interval: 5,
            max_cycles: 50,
            cycle_delay_secs: 5,
            stale_timeout_secs: 45 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskDefaults {
    /// `max_attempts` for tasks created without an explicit budget.
    pub max_attempts_default: u32,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            max_attempts_default: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Wall-clock limit for one executor invocation.
    pub timeout_secs: u64,
    /// Truncate per-agent executor logs beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Program and arguments for the `custom` executor; the prompt goes to stdin.
    pub command: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            command: Vec::new(),
        }
    }
}

impl ColonyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.project.goal.trim().is_empty() {
            return Err(anyhow!("project.goal must be non-empty"));
        }
        if self.scheduler.max_workers == 0 {
            return Err(anyhow!("scheduler.max_workers must be > 0"));
        }
        if self.scheduler.exec_interval == 0 {
            return Err(anyhow!("scheduler.exec_interval must be > 0"));
        }
        if self.scheduler.max_cycles == 0 {
            return Err(anyhow!("scheduler.max_cycles must be > 0"));
        }
        if self.tasks.max_attempts_default == 0 {
            return Err(anyhow!("tasks.max_attempts_default must be > 0"));
        }
        if self.executor.timeout_secs == 0 {
            return Err(anyhow!("executor.timeout_secs must be > 0"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        // A live invocation never heartbeats mid-call, so it must finish (or be
        // killed) before the sweep may declare its agent dead.
        if self.scheduler.stale_timeout_secs <= self.executor.timeout_secs {
            return Err(anyhow!(
                "scheduler.stale_timeout_secs ({}) must exceed executor.timeout_secs ({})",
                self.scheduler.stale_timeout_secs,
                self.executor.timeout_secs
            ));
        }
        Ok(())
    }
}

/// Load and validate config from a TOML file. A missing file is an error.
pub fn load_config(path: &Path) -> Result<ColonyConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "missing config {} (run `colony init`)",
            path.display()
        ));
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ColonyConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ColonyConfig) -> Result<()> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
