//! Append-only progress log (`.colony/progress.md`).
//!
//! Human-facing record of what the run achieved. Separate from tracing
//! output and never rewritten.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};

use crate::io::init::PROGRESS_HEADER;

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn task_completed(&self, task_id: &str, title: &str, agent_id: &str) -> Result<()> {
        self.append(&format!("completed {task_id} ({title}) by {agent_id}"))
    }

    pub fn task_failed(&self, task_id: &str, title: &str, reason: &str) -> Result<()> {
        self.append(&format!(
            "FAILED {task_id} ({title}) permanently: {}",
            one_line(reason)
        ))
    }

    pub fn clarification(&self, agent_id: &str, question: &str) -> Result<()> {
        self.append(&format!("QUESTION from {agent_id}: {}", one_line(question)))
    }

    pub fn note(&self, message: &str) -> Result<()> {
        self.append(message)
    }

    /// One entry per call, written with a single `write_all` on an append
    /// handle so concurrent writers never interleave within a line.
    fn append(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let mut entry = String::new();
        if file
            .metadata()
            .with_context(|| format!("stat {}", self.path.display()))?
            .len()
            == 0
        {
            entry.push_str(PROGRESS_HEADER);
        }
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        entry.push_str(&format!("- {stamp} {message}\n"));
        file.write_all(entry.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
