//! Dependency-aware claim eligibility.

use std::collections::HashMap;

use crate::task::{Task, TaskStatus};

/// Status lookup keyed by task id.
pub fn status_index(tasks: &[Task]) -> HashMap<&str, TaskStatus> {
    tasks
        .iter()
        .map(|task| (task.id.as_str(), task.status))
        .collect()
}

/// True if `task` may be claimed right now.
///
/// Pending, below its attempt budget, and every dependency completed. A
/// dependency on an unknown id blocks the task.
pub fn is_eligible(task: &Task, statuses: &HashMap<&str, TaskStatus>) -> bool {
    task.status == TaskStatus::Pending
        && task.attempts < task.max_attempts
        && task
            .dependencies
            .iter()
            .all(|dep| statuses.get(dep.as_str()) == Some(&TaskStatus::Completed))
}

/// Dependencies of `task` that are not completed yet, in declaration order.
pub fn blocking_dependencies<'a>(
    task: &'a Task,
    statuses: &HashMap<&str, TaskStatus>,
) -> Vec<&'a str> {
    task.dependencies
        .iter()
        .filter(|dep| statuses.get(dep.as_str()) != Some(&TaskStatus::Completed))
        .map(String::as_str)
        .collect()
}

/// Eligible tasks in claim order: `(priority, id)` ascending.
pub fn claim_candidates(tasks: &[Task]) -> Vec<&Task> {
    let statuses = status_index(tasks);
    let mut candidates: Vec<&Task> = tasks
        .iter()
        .filter(|task| is_eligible(task, &statuses))
        .collect();
    candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{task, task_with_deps};

    fn ids<'a>(tasks: &[&'a Task]) -> Vec<&'a str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn dependency_must_be_completed() {
        let mut first = task("TASK-001");
        let second = task_with_deps("TASK-002", &["TASK-001"]);

        let tasks = vec![first.clone(), second.clone()];
        assert_eq!(ids(&claim_candidates(&tasks)), vec!["TASK-001"]);

        first.status = TaskStatus::InProgress;
        let tasks = vec![first.clone(), second.clone()];
        assert!(claim_candidates(&tasks).is_empty());

        first.status = TaskStatus::Completed;
        let tasks = vec![first, second];
        assert_eq!(ids(&claim_candidates(&tasks)), vec!["TASK-002"]);
    }

    #[test]
    fn unknown_dependency_blocks() {
        let tasks = vec![task_with_deps("TASK-002", &["TASK-404"])];
        assert!(claim_candidates(&tasks).is_empty());

        let statuses = status_index(&tasks);
        assert_eq!(blocking_dependencies(&tasks[0], &statuses), vec!["TASK-404"]);
    }

    #[test]
    fn failed_dependency_blocks_forever() {
        let mut dep = task("TASK-001");
        dep.status = TaskStatus::Failed;
        let tasks = vec![dep, task_with_deps("TASK-002", &["TASK-001"])];
        assert!(claim_candidates(&tasks).is_empty());
    }

    #[test]
    fn candidates_sorted_by_priority_then_id() {
        let mut low = task("TASK-003");
        low.priority = -1;
        let tasks = vec![task("TASK-002"), task("TASK-001"), low];
        assert_eq!(
            ids(&claim_candidates(&tasks)),
            vec!["TASK-003", "TASK-001", "TASK-002"]
        );
    }

    #[test]
    fn exhausted_pending_task_is_not_eligible() {
        let mut spent = task("TASK-001");
        spent.attempts = 3;
        spent.max_attempts = 3;
        assert!(claim_candidates(&[spent]).is_empty());
    }
}
