use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Claimed or in progress: an agent owns the task.
    pub fn is_assigned(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "claimed" => Ok(TaskStatus::Claimed),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(anyhow!("unknown task status '{other}'")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub assigned_to: Option<String>,
    pub created_by: String,
    pub dependencies: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub branch: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Failed with the retry budget spent; never claimed again.
    pub fn is_exhausted(&self) -> bool {
        self.status == TaskStatus::Failed && self.attempts >= self.max_attempts
    }
}

/// Caller-supplied fields for `TaskStore::create`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub created_by: String,
    pub dependencies: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub branch: Option<String>,
    pub max_attempts: u32,
}

impl NewTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            priority: 0,
            created_by: "operator".to_string(),
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            branch: None,
            max_attempts: 3,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Materialize a fresh pending record.
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        let branch = self
            .branch
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| format!("task/{}", self.id.to_lowercase()));
        Task {
            id: self.id,
            title: self.title,
            description: self.description,
            status: TaskStatus::Pending,
            priority: self.priority,
            assigned_to: None,
            created_by: self.created_by,
            dependencies: self.dependencies,
            acceptance_criteria: self.acceptance_criteria,
            branch,
            attempts: 0,
            max_attempts: self.max_attempts,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub claimed: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Claimed => counts.claimed += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.in_progress + self.completed + self.failed
    }

    /// Tasks currently owned by an agent.
    pub fn active(&self) -> usize {
        self.claimed + self.in_progress
    }

    /// True iff nothing is pending, claimed or in progress.
    pub fn all_terminal(&self) -> bool {
        self.pending == 0 && self.active() == 0
    }
}

impl fmt::Display for TaskCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending={} claimed={} in_progress={} completed={} failed={}",
            self.pending, self.claimed, self.in_progress, self.completed, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"claimed\"").expect("parse");
        assert_eq!(parsed, TaskStatus::Claimed);
    }

    #[test]
    fn status_parses_cli_names() {
        assert_eq!(
            "in_progress".parse::<TaskStatus>().expect("parse"),
            TaskStatus::InProgress
        );
        assert!("done".parse::<TaskStatus>().is_err());
        assert_eq!(format!("{:<9}|", TaskStatus::Failed), "failed   |");
    }

    #[test]
    fn new_task_defaults_branch_from_id() {
        let task = NewTask::new("TASK-001", "Set up").into_task(Utc::now());
        assert_eq!(task.branch, "task/task-001");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.assigned_to.is_none());
    }

    #[test]
    fn counts_with_no_tasks_are_terminal() {
        let counts = TaskCounts::from_tasks(std::iter::empty());
        assert_eq!(counts.total(), 0);
        assert!(counts.all_terminal());
    }
}
