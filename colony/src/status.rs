//! `colony status`: a snapshot of tasks, live agents and record health.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use serde::Serialize;

use crate::agent::Agent;
use crate::core::eligibility::{blocking_dependencies, is_eligible, status_index};
use crate::core::invariants::validate_invariants;
use crate::io::agent_registry::AgentRegistry;
use crate::io::task_store::TaskStore;
use crate::task::{Task, TaskCounts, TaskStatus};

#[derive(Debug, Clone, Serialize)]
pub struct TaskLine {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub assigned_to: Option<String>,
    /// Pending and claimable right now.
    pub eligible: bool,
    /// Dependencies not completed yet.
    pub blocked_on: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub counts: TaskCounts,
    pub tasks: Vec<TaskLine>,
    pub active_agents: Vec<Agent>,
    /// Invariant violations found in stored records.
    pub violations: Vec<String>,
}

pub fn collect_status(tasks: &dyn TaskStore, agents: &dyn AgentRegistry) -> Result<StatusReport> {
    let all = tasks.list(None)?;
    let statuses = status_index(&all);
    let lines = all
        .iter()
        .map(|task| TaskLine {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            priority: task.priority,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            assigned_to: task.assigned_to.clone(),
            eligible: is_eligible(task, &statuses),
            blocked_on: blocked_on(task, &statuses),
            error: task.error.clone(),
        })
        .collect();
    let active_agents = agents
        .list(None)?
        .into_iter()
        .filter(Agent::is_active)
        .collect();
    Ok(StatusReport {
        counts: TaskCounts::from_tasks(&all),
        tasks: lines,
        active_agents,
        violations: validate_invariants(&all),
    })
}

fn blocked_on(task: &Task, statuses: &HashMap<&str, TaskStatus>) -> Vec<String> {
    if task.status != TaskStatus::Pending {
        return Vec::new();
    }
    blocking_dependencies(task, statuses)
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tasks: {} ({})", self.counts.total(), self.counts)?;
        for task in &self.tasks {
            write!(
                f,
                "  {:<12} {:<11} p{:<3} {}/{} {}",
                task.id, task.status, task.priority, task.attempts, task.max_attempts, task.title
            )?;
            if let Some(agent) = &task.assigned_to {
                write!(f, " [{agent}]")?;
            }
            if task.eligible {
                write!(f, " (ready)")?;
            } else if !task.blocked_on.is_empty() {
                write!(f, " (waiting on {})", task.blocked_on.join(", "))?;
            }
            writeln!(f)?;
            if let Some(error) = &task.error {
                writeln!(f, "               last error: {error}")?;
            }
        }
        writeln!(f, "active agents: {}", self.active_agents.len())?;
        for agent in &self.active_agents {
            write!(f, "  {} ({})", agent.id, agent.agent_type)?;
            if let Some(task) = &agent.current_task {
                write!(f, " on {task}")?;
            }
            writeln!(f, ", heartbeat {}", agent.last_heartbeat.to_rfc3339())?;
        }
        if !self.violations.is_empty() {
            writeln!(f, "invariant violations:")?;
            for violation in &self.violations {
                writeln!(f, "  - {violation}")?;
            }
        }
        Ok(())
    }
}
