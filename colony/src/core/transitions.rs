//! Record transitions shared by every store implementation.
//!
//! Stores load a record, apply one of these functions and persist the result;
//! they never mutate status fields directly.

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::task::{Task, TaskStatus};

/// What `release` did to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Back to pending for another attempt.
    Requeued,
    /// Attempt budget spent; the task is terminally failed.
    Exhausted,
    /// Task was not assigned; nothing changed.
    Unchanged,
}

/// Transfer a pending task to `agent_id`.
pub fn apply_claim(task: &mut Task, agent_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
    if task.status != TaskStatus::Pending {
        return Err(invalid(task, TaskStatus::Claimed));
    }
    task.status = TaskStatus::Claimed;
    task.assigned_to = Some(agent_id.to_string());
    task.attempts += 1;
    task.updated_at = now;
    Ok(())
}

/// Apply an `update_status` request.
///
/// Only `claimed -> in_progress` and `claimed|in_progress -> completed|failed`
/// are allowed; the owner is cleared when the task leaves the assigned states.
pub fn apply_status(
    task: &mut Task,
    status: TaskStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let allowed = match status {
        TaskStatus::InProgress => {
            matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress)
        }
        TaskStatus::Completed | TaskStatus::Failed => task.status.is_assigned(),
        TaskStatus::Pending | TaskStatus::Claimed => false,
    };
    if !allowed {
        return Err(invalid(task, status));
    }
    task.status = status;
    if !status.is_assigned() {
        task.assigned_to = None;
    }
    match status {
        TaskStatus::Completed => task.error = None,
        _ => {
            if let Some(error) = error {
                task.error = Some(error.to_string());
            }
        }
    }
    task.updated_at = now;
    Ok(())
}

/// Give an assigned task back, enforcing the retry budget.
pub fn apply_release(task: &mut Task, error: Option<&str>, now: DateTime<Utc>) -> ReleaseOutcome {
    if !task.status.is_assigned() {
        return ReleaseOutcome::Unchanged;
    }
    let outcome = if task.attempts >= task.max_attempts {
        task.status = TaskStatus::Failed;
        ReleaseOutcome::Exhausted
    } else {
        task.status = TaskStatus::Pending;
        ReleaseOutcome::Requeued
    };
    task.assigned_to = None;
    if let Some(error) = error {
        task.error = Some(error.to_string());
    }
    task.updated_at = now;
    outcome
}

/// [`apply_release`] on behalf of `owner`; a task held by anyone else is left alone.
pub fn apply_release_held(
    task: &mut Task,
    owner: &str,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> ReleaseOutcome {
    if task.assigned_to.as_deref() != Some(owner) {
        return ReleaseOutcome::Unchanged;
    }
    apply_release(task, error, now)
}

fn invalid(task: &Task, to: TaskStatus) -> StoreError {
    StoreError::InvalidTransition {
        id: task.id.clone(),
        from: task.status,
        to,
    }
}
