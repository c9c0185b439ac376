//! Task persistence: the [`TaskStore`] seam and its file-backed implementation.
//!
//! Layout: one pretty JSON record per task at `<dir>/<id>.json`. Every
//! read-modify-write runs under the task's `<dir>/<id>.lock`, and records are
//! replaced atomically, so concurrent processes never observe partial writes
//! and never double-claim a task.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::eligibility::claim_candidates;
use crate::core::invariants::{cycle_through, validate_id, validate_new_task};
use crate::core::transitions::{
    ReleaseOutcome, apply_claim, apply_release, apply_release_held, apply_status,
};
use crate::error::StoreError;
use crate::io::atomic::{read_json, write_json_atomic};
use crate::io::record_lock::{DEFAULT_LOCK_WAIT, RecordLock};
use crate::task::{NewTask, Task, TaskCounts, TaskStatus};

/// Held across `create`. Ids cannot start with `.`, so this never names a task.
const CREATE_LOCK: &str = ".create.lock";

/// Result of [`TaskStore::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub task: Task,
    pub outcome: ReleaseOutcome,
}

/// Persistent task queue shared by every agent.
///
/// `claim` and `release` never fail because of contention: losing a race is a
/// `None` claim, releasing an unassigned task is [`ReleaseOutcome::Unchanged`].
pub trait TaskStore: Send + Sync {
    /// Add a pending task. Fails with [`StoreError::AlreadyExists`] on a duplicate id.
    fn create(&self, task: NewTask) -> Result<Task>;

    /// Claim the first eligible pending task for `agent_id`.
    fn claim(&self, agent_id: &str) -> Result<Option<String>>;

    fn update_status(&self, id: &str, status: TaskStatus, error: Option<&str>) -> Result<Task>;

    /// Give an assigned task back: pending if attempts remain, failed otherwise.
    fn release(&self, id: &str, error: Option<&str>) -> Result<Released>;

    /// [`TaskStore::release`], but only while `owner` still holds the task.
    /// Anything else is [`ReleaseOutcome::Unchanged`].
    fn release_held(&self, id: &str, owner: &str, error: Option<&str>) -> Result<Released>;

    fn get(&self, id: &str) -> Result<Task>;

    /// All tasks sorted by id, optionally filtered by status.
    fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>>;

    fn counts(&self) -> Result<TaskCounts> {
        Ok(TaskCounts::from_tasks(&self.list(None)?))
    }

    /// True iff no task is pending, claimed or in progress.
    fn all_terminal(&self) -> Result<bool> {
        Ok(self.counts()?.all_terminal())
    }
}

/// File-backed [`TaskStore`].
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    dir: PathBuf,
    lock_wait: Duration,
}

impl FileTaskStore {
    /// Open (creating if needed) the task directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create task directory {}", dir.display()))?;
        Ok(Self {
            dir,
            lock_wait: DEFAULT_LOCK_WAIT,
        })
    }

    /// How long mutations wait for a held record lock.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id).map_err(|_| StoreError::NotFound(id.to_string()))?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    fn load(&self, id: &str) -> Result<Task> {
        let path = self.record_path(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()).into());
        }
        read_json(&path).with_context(|| format!("load task {id}"))
    }

    fn store(&self, task: &Task) -> Result<()> {
        let path = self.record_path(&task.id)?;
        write_json_atomic(&path, task).with_context(|| format!("store task {}", task.id))
    }

    /// Load, mutate and persist one record under its lock.
    fn modify<T>(&self, id: &str, f: impl FnOnce(&mut Task) -> Result<T>) -> Result<(Task, T)> {
        self.record_path(id)?;
        let _lock = RecordLock::acquire(&self.lock_path(id), self.lock_wait)?;
        let mut task = self.load(id)?;
        let value = f(&mut task)?;
        self.store(&task)?;
        Ok((task, value))
    }
}

impl TaskStore for FileTaskStore {
    /// Creates are serialized on a directory lock: the cycle check reads the
    /// whole graph, and two concurrent creates (`a -> b`, `b -> a`) must not
    /// both pass it.
    #[instrument(skip_all, fields(task_id = %new.id))]
    fn create(&self, new: NewTask) -> Result<Task> {
        validate_new_task(&new)?;
        let path = self.record_path(&new.id)?;
        let _graph = RecordLock::acquire(&self.dir.join(CREATE_LOCK), self.lock_wait)?;
        let _lock = RecordLock::acquire(&self.lock_path(&new.id), self.lock_wait)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists(new.id).into());
        }

        let task = new.into_task(Utc::now());
        let existing = self.list(None)?;
        if let Some(cycle) = cycle_through(&existing, &task) {
            return Err(StoreError::DependencyCycle {
                id: task.id,
                cycle,
            }
            .into());
        }

        self.store(&task)?;
        info!(deps = task.dependencies.len(), priority = task.priority, "task created");
        Ok(task)
    }

    #[instrument(skip(self))]
    fn claim(&self, agent_id: &str) -> Result<Option<String>> {
        let tasks = self.list(None)?;
        for candidate in claim_candidates(&tasks) {
            let Some(_lock) = RecordLock::try_acquire(&self.lock_path(&candidate.id))? else {
                debug!(task_id = %candidate.id, "lost claim race");
                continue;
            };
            // The scan may be stale; only the locked re-read counts. Completed
            // dependencies stay completed, so eligibility cannot regress.
            let mut task = self.load(&candidate.id)?;
            if task.status != TaskStatus::Pending || task.attempts >= task.max_attempts {
                debug!(task_id = %task.id, status = %task.status, "candidate changed under scan");
                continue;
            }
            apply_claim(&mut task, agent_id, Utc::now())?;
            self.store(&task)?;
            info!(task_id = %task.id, attempt = task.attempts, "task claimed");
            return Ok(Some(task.id));
        }
        debug!(scanned = tasks.len(), "no eligible task");
        Ok(None)
    }

    #[instrument(skip(self, error))]
    fn update_status(&self, id: &str, status: TaskStatus, error: Option<&str>) -> Result<Task> {
        let (task, ()) = self.modify(id, |task| {
            apply_status(task, status, error, Utc::now())?;
            Ok(())
        })?;
        info!("task status updated");
        Ok(task)
    }

    #[instrument(skip(self, error))]
    fn release(&self, id: &str, error: Option<&str>) -> Result<Released> {
        let (task, outcome) =
            self.modify(id, |task| Ok(apply_release(task, error, Utc::now())))?;
        Ok(log_release(task, outcome))
    }

    #[instrument(skip(self, error))]
    fn release_held(&self, id: &str, owner: &str, error: Option<&str>) -> Result<Released> {
        let (task, outcome) = self.modify(id, |task| {
            Ok(apply_release_held(task, owner, error, Utc::now()))
        })?;
        Ok(log_release(task, outcome))
    }

    fn get(&self, id: &str) -> Result<Task> {
        self.load(id)
    }

    fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.dir.display()));
            }
        };
        let mut tasks = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("read entry in {}", self.dir.display()))?
                .path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let task: Task = read_json(&path)?;
            if status.is_none_or(|s| s == task.status) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }
}

fn log_release(task: Task, outcome: ReleaseOutcome) -> Released {
    match outcome {
        ReleaseOutcome::Requeued => info!(attempts = task.attempts, "task requeued"),
        ReleaseOutcome::Exhausted => {
            warn!(attempts = task.attempts, "task failed after exhausting attempts");
        }
        ReleaseOutcome::Unchanged => debug!(status = %task.status, "release ignored"),
    }
    Released { task, outcome }
}
