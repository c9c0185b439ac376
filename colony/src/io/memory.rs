//! In-memory stores with the same semantics as the file-backed ones.
//!
//! A single mutex stands in for the per-record lock files. Used by unit and
//! scheduler tests that don't care about persistence.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use crate::agent::{Agent, AgentStatus, AgentType, format_id, parse_sequence};
use crate::core::eligibility::claim_candidates;
use crate::core::invariants::{cycle_through, validate_new_task};
use crate::core::staleness::is_stale;
use crate::core::transitions::{apply_claim, apply_release, apply_release_held, apply_status};
use crate::error::StoreError;
use crate::io::agent_registry::AgentRegistry;
use crate::io::task_store::{Released, TaskStore};
use crate::task::{NewTask, Task, TaskStatus};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("store mutex poisoned"))
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<BTreeMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn create(&self, new: NewTask) -> Result<Task> {
        validate_new_task(&new)?;
        let mut tasks = lock(&self.tasks)?;
        if tasks.contains_key(&new.id) {
            return Err(StoreError::AlreadyExists(new.id).into());
        }
        let task = new.into_task(Utc::now());
        let existing: Vec<Task> = tasks.values().cloned().collect();
        if let Some(cycle) = cycle_through(&existing, &task) {
            return Err(StoreError::DependencyCycle {
                id: task.id,
                cycle,
            }
            .into());
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn claim(&self, agent_id: &str) -> Result<Option<String>> {
        let mut tasks = lock(&self.tasks)?;
        let snapshot: Vec<Task> = tasks.values().cloned().collect();
        let Some(id) = claim_candidates(&snapshot).first().map(|t| t.id.clone()) else {
            return Ok(None);
        };
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        apply_claim(task, agent_id, Utc::now())?;
        Ok(Some(id))
    }

    fn update_status(&self, id: &str, status: TaskStatus, error: Option<&str>) -> Result<Task> {
        let mut tasks = lock(&self.tasks)?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_status(task, status, error, Utc::now())?;
        Ok(task.clone())
    }

    fn release(&self, id: &str, error: Option<&str>) -> Result<Released> {
        let mut tasks = lock(&self.tasks)?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let outcome = apply_release(task, error, Utc::now());
        Ok(Released {
            task: task.clone(),
            outcome,
        })
    }

    fn release_held(&self, id: &str, owner: &str, error: Option<&str>) -> Result<Released> {
        let mut tasks = lock(&self.tasks)?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let outcome = apply_release_held(task, owner, error, Utc::now());
        Ok(Released {
            task: task.clone(),
            outcome,
        })
    }

    fn get(&self, id: &str) -> Result<Task> {
        lock(&self.tasks)?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()).into())
    }

    fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        Ok(lock(&self.tasks)?
            .values()
            .filter(|t| status.is_none_or(|s| s == t.status))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAgentRegistry {
    agents: Mutex<BTreeMap<String, Agent>>,
}

impl MemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut Agent)) -> Result<Agent> {
        let mut agents = lock(&self.agents)?;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(agent);
        Ok(agent.clone())
    }

    /// Overwrite a record as-is. Lets tests age heartbeats.
    pub fn put(&self, agent: Agent) -> Result<()> {
        lock(&self.agents)?.insert(agent.id.clone(), agent);
        Ok(())
    }
}

impl AgentRegistry for MemoryAgentRegistry {
    fn register(&self, agent_type: AgentType, id: &str, area: Option<&str>) -> Result<Agent> {
        let mut agents = lock(&self.agents)?;
        if agents.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()).into());
        }
        let agent = Agent::new(agent_type, id, area, Utc::now());
        agents.insert(id.to_string(), agent.clone());
        Ok(agent)
    }

    fn heartbeat(&self, id: &str) -> Result<Agent> {
        self.modify(id, |agent| agent.last_heartbeat = Utc::now())
    }

    fn set_current_task(&self, id: &str, task_id: Option<&str>) -> Result<Agent> {
        self.modify(id, |agent| {
            agent.current_task = task_id.map(str::to_string);
            agent.last_heartbeat = Utc::now();
        })
    }

    fn mark_completed(&self, id: &str) -> Result<Agent> {
        self.modify(id, |agent| {
            agent.tasks_completed += 1;
            agent.current_task = None;
            agent.last_heartbeat = Utc::now();
        })
    }

    fn mark_failed(&self, id: &str) -> Result<Agent> {
        self.modify(id, |agent| {
            agent.tasks_failed += 1;
            agent.current_task = None;
            agent.last_heartbeat = Utc::now();
        })
    }

    fn deregister(&self, id: &str) -> Result<Agent> {
        self.modify(id, |agent| {
            if agent.is_active() {
                agent.status = AgentStatus::Stopped;
                agent.current_task = None;
            }
        })
    }

    fn get(&self, id: &str) -> Result<Agent> {
        lock(&self.agents)?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()).into())
    }

    fn list(&self, agent_type: Option<AgentType>) -> Result<Vec<Agent>> {
        Ok(lock(&self.agents)?
            .values()
            .filter(|a| agent_type.is_none_or(|t| t == a.agent_type))
            .cloned()
            .collect())
    }

    fn next_id(&self, agent_type: AgentType) -> Result<String> {
        let agents = lock(&self.agents)?;
        let max = agents
            .keys()
            .filter_map(|id| parse_sequence(agent_type, id))
            .max()
            .unwrap_or(0);
        Ok(format_id(agent_type, max + 1))
    }

    fn mark_stale_if_expired(
        &self,
        id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Agent>> {
        let mut agents = lock(&self.agents)?;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !is_stale(agent, now, timeout) {
            return Ok(None);
        }
        let before = agent.clone();
        agent.status = AgentStatus::Stale;
        agent.current_task = None;
        Ok(Some(before))
    }
}
