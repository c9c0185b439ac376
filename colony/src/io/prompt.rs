//! Role instructions and rendered context documents for executor input.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::agent::{Agent, AgentType};
use crate::io::agent_registry::AgentRegistry;
use crate::io::task_store::TaskStore;
use crate::task::{Task, TaskCounts, TaskStatus};

const EXECUTIVE_INSTRUCTIONS: &str = include_str!("prompts/executive.md");
const PLANNER_INSTRUCTIONS: &str = include_str!("prompts/planner.md");
const WORKER_INSTRUCTIONS: &str = include_str!("prompts/worker.md");

const EXECUTIVE_CONTEXT: &str = include_str!("prompts/context_executive.md");
const PLANNER_CONTEXT: &str = include_str!("prompts/context_planner.md");
const WORKER_CONTEXT: &str = include_str!("prompts/context_worker.md");

/// Instruction document for a role. Static; the per-invocation part is the context.
pub fn instructions(role: AgentType) -> &'static str {
    match role {
        AgentType::Executive => EXECUTIVE_INSTRUCTIONS,
        AgentType::Planner => PLANNER_INSTRUCTIONS,
        AgentType::Worker => WORKER_INSTRUCTIONS,
    }
}

/// Point-in-time view of the colony fed to executive and planner templates.
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub goal: String,
    pub root: String,
    pub counts: TaskCounts,
    pub tasks: Vec<Task>,
    /// Active agents only; stopped identities pile up across cycles.
    pub agents: Vec<Agent>,
}

impl StateView {
    pub fn capture(
        goal: &str,
        root: &Path,
        tasks: &dyn TaskStore,
        agents: &dyn AgentRegistry,
    ) -> Result<Self> {
        let tasks = tasks.list(None).context("list tasks for context")?;
        let agents = agents
            .list(None)
            .context("list agents for context")?
            .into_iter()
            .filter(Agent::is_active)
            .collect();
        Ok(Self {
            goal: goal.trim().to_string(),
            root: root.display().to_string(),
            counts: TaskCounts::from_tasks(&tasks),
            tasks,
            agents,
        })
    }
}

/// Template engine wrapper around minijinja.
#[derive(Debug)]
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("executive", EXECUTIVE_CONTEXT)
            .context("executive context template")?;
        env.add_template("planner", PLANNER_CONTEXT)
            .context("planner context template")?;
        env.add_template("worker", WORKER_CONTEXT)
            .context("worker context template")?;
        Ok(Self { env })
    }

    pub fn render_executive(
        &self,
        state: &StateView,
        cycle: u32,
        max_cycles: u32,
    ) -> Result<String> {
        let rendered = self.env.get_template("executive")?.render(context! {
            cycle,
            max_cycles,
            goal => state.goal,
            total => state.counts.total(),
            counts => state.counts,
            tasks => state.tasks,
            agents => state.agents,
        })?;
        debug!(bytes = rendered.len(), "rendered executive context");
        Ok(rendered)
    }

    pub fn render_planner(&self, state: &StateView, area: Option<&str>) -> Result<String> {
        let rendered = self.env.get_template("planner")?.render(context! {
            area,
            root => state.root,
            goal => state.goal,
            tasks => state.tasks,
        })?;
        debug!(bytes = rendered.len(), "rendered planner context");
        Ok(rendered)
    }

    /// Worker context: the claimed task plus its (completed) dependencies.
    pub fn render_worker(&self, goal: &str, task: &Task, all_tasks: &[Task]) -> Result<String> {
        let dependencies: Vec<&Task> = task
            .dependencies
            .iter()
            .filter_map(|dep| all_tasks.iter().find(|t| &t.id == dep))
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        let rendered = self.env.get_template("worker")?.render(context! {
            task,
            dependencies,
            goal => goal.trim(),
        })?;
        debug!(task_id = %task.id, bytes = rendered.len(), "rendered worker context");
        Ok(rendered)
    }
}
