//! Typed store errors that callers need to tell apart.
//!
//! Stores return `anyhow::Result`; these variants travel inside the `anyhow`
//! chain and are recovered with `err.downcast_ref::<StoreError>()`.

use thiserror::Error;

use crate::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record '{0}' already exists")]
    AlreadyExists(String),

    #[error("record '{0}' not found")]
    NotFound(String),

    #[error("task '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task '{id}' would close a dependency cycle: {}", .cycle.join(" -> "))]
    DependencyCycle { id: String, cycle: Vec<String> },

    #[error("invalid task '{id}': {reason}")]
    InvalidTask { id: String, reason: String },

    #[error("timed out waiting for lock on '{0}'")]
    Locked(String),
}

/// True if `err` carries a [`StoreError::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_)))
}

/// True if `err` carries a [`StoreError::AlreadyExists`].
pub fn is_already_exists(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::AlreadyExists(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_survive_anyhow_context() {
        let err = anyhow::Error::new(StoreError::NotFound("TASK-1".to_string()))
            .context("load task TASK-1");
        assert!(is_not_found(&err));
        assert!(!is_already_exists(&err));
    }

    #[test]
    fn cycle_message_lists_path() {
        let err = StoreError::DependencyCycle {
            id: "a".to_string(),
            cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "task 'a' would close a dependency cycle: a -> b -> a"
        );
    }
}
