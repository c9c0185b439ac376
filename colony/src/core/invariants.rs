//! Record invariants and dependency-graph checks.

use std::collections::{BTreeMap, HashSet};

use crate::error::StoreError;
use crate::task::{NewTask, Task};

/// Ids name files on disk, so keep them to a conservative alphabet.
pub fn validate_id(id: &str) -> Result<(), String> {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return Err("id must be non-empty".to_string());
    };
    if !first.is_ascii_alphanumeric() {
        return Err(format!("id '{id}' must start with an ASCII letter or digit"));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(format!("id '{id}' contains invalid character '{bad}'"));
    }
    Ok(())
}

/// Field checks for a task about to be created.
pub fn validate_new_task(task: &NewTask) -> Result<(), StoreError> {
    let invalid = |reason: String| StoreError::InvalidTask {
        id: task.id.clone(),
        reason,
    };
    validate_id(&task.id).map_err(invalid)?;
    if task.title.trim().is_empty() {
        return Err(invalid("title must be non-empty".to_string()));
    }
    if task.max_attempts == 0 {
        return Err(invalid("max_attempts must be > 0".to_string()));
    }
    if task.dependencies.iter().any(|dep| dep == &task.id) {
        return Err(invalid("task cannot depend on itself".to_string()));
    }
    Ok(())
}

/// Find a dependency cycle, returned as a closed path (`a -> b -> a`).
///
/// Dependencies on unknown ids are ignored here; they only block claiming.
pub fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let graph: BTreeMap<&str, Vec<&str>> = tasks
        .iter()
        .map(|task| {
            let deps = task.dependencies.iter().map(String::as_str).collect();
            (task.id.as_str(), deps)
        })
        .collect();

    let mut done: HashSet<&str> = HashSet::new();
    for &start in graph.keys() {
        let mut stack = Vec::new();
        if let Some(cycle) = visit(start, &graph, &mut stack, &mut done) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    graph: &BTreeMap<&'a str, Vec<&'a str>>,
    stack: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Option<Vec<String>> {
    if done.contains(id) {
        return None;
    }
    if let Some(pos) = stack.iter().position(|&on_stack| on_stack == id) {
        let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
        cycle.push(id.to_string());
        return Some(cycle);
    }
    let deps = graph.get(id)?;
    stack.push(id);
    for &dep in deps {
        if let Some(cycle) = visit(dep, graph, stack, done) {
            return Some(cycle);
        }
    }
    stack.pop();
    done.insert(id);
    None
}

/// Cycle that `candidate` would close if added next to `existing`.
///
/// Walks the existing graph from the candidate's dependencies looking for a
/// path back to the candidate's id; returns it as `candidate -> ... -> candidate`.
pub fn cycle_through(existing: &[Task], candidate: &Task) -> Option<Vec<String>> {
    let graph: BTreeMap<&str, &[String]> = existing
        .iter()
        .map(|task| (task.id.as_str(), task.dependencies.as_slice()))
        .collect();
    let target = candidate.id.as_str();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut path = vec![target];
    for dep in &candidate.dependencies {
        if reaches(dep, target, &graph, &mut seen, &mut path) {
            let mut cycle: Vec<String> = path.iter().map(|s| s.to_string()).collect();
            cycle.push(target.to_string());
            return Some(cycle);
        }
    }
    None
}

fn reaches<'a>(
    id: &'a str,
    target: &str,
    graph: &BTreeMap<&'a str, &'a [String]>,
    seen: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    if id == target {
        return true;
    }
    if !seen.insert(id) {
        return false;
    }
    path.push(id);
    if let Some(&deps) = graph.get(id) {
        for dep in deps {
            if reaches(dep, target, graph, seen, path) {
                return true;
            }
        }
    }
    path.pop();
    false
}

/// Check stored records against the data-model invariants:
/// - `assigned_to` set iff claimed/in_progress
/// - `max_attempts > 0`
/// - `attempts <= max_attempts` unless failed
/// - dependencies form a DAG
pub fn validate_invariants(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    for task in tasks {
        if task.status.is_assigned() != task.assigned_to.is_some() {
            errors.push(format!(
                "{}: status {} inconsistent with assigned_to {:?}",
                task.id, task.status, task.assigned_to
            ));
        }
        if task.max_attempts == 0 {
            errors.push(format!("{}: max_attempts must be > 0", task.id));
        }
        if !task.is_exhausted() && task.attempts > task.max_attempts {
            errors.push(format!(
                "{}: attempts {} exceeds max_attempts {}",
                task.id, task.attempts, task.max_attempts
            ));
        }
    }
    if let Some(cycle) = find_cycle(tasks) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use crate::test_support::{task, task_with_deps};

    #[test]
    fn ids_are_restricted_to_file_safe_characters() {
        assert!(validate_id("TASK-001").is_ok());
        assert!(validate_id("api.v2_setup").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id(".hidden").is_err());
    }

    #[test]
    fn new_task_rejects_self_dependency_and_zero_budget() {
        let looped = NewTask::new("a", "A").with_dependencies(["a"]);
        assert!(matches!(
            validate_new_task(&looped),
            Err(StoreError::InvalidTask { .. })
        ));

        let unbounded = NewTask::new("a", "A").with_max_attempts(0);
        assert!(validate_new_task(&unbounded).is_err());
    }

    #[test]
    fn finds_cycle_through_three_tasks() {
        let tasks = vec![
            task_with_deps("a", &["b"]),
            task_with_deps("b", &["c"]),
            task_with_deps("c", &["a"]),
        ];
        let cycle = find_cycle(&tasks).expect("cycle");
        assert_eq!(cycle, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let tasks = vec![
            task("root"),
            task_with_deps("left", &["root"]),
            task_with_deps("right", &["root"]),
            task_with_deps("join", &["left", "right", "missing"]),
        ];
        assert!(find_cycle(&tasks).is_none());
    }

    #[test]
    fn candidate_closing_a_loop_is_detected() {
        // b depends on a missing `a`; adding `a -> b` closes the loop.
        let existing = vec![task_with_deps("b", &["a"]), task("c")];
        let candidate = task_with_deps("a", &["c", "b"]);
        let cycle = cycle_through(&existing, &candidate).expect("cycle");
        assert_eq!(cycle, vec!["a", "b", "a"]);

        let harmless = task_with_deps("d", &["b", "c"]);
        assert!(cycle_through(&existing, &harmless).is_none());
    }

    #[test]
    fn reports_assignment_mismatch() {
        let mut orphan = task("TASK-001");
        orphan.status = TaskStatus::InProgress;
        let errors = validate_invariants(&[orphan]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("inconsistent with assigned_to"));
    }
}
