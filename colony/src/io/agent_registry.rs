//! Agent liveness: the [`AgentRegistry`] seam, its file-backed implementation,
//! and the staleness sweep that recovers orphaned tasks.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, AgentStatus, AgentType, format_id, parse_sequence};
use crate::core::invariants::validate_id;
use crate::core::staleness::is_stale;
use crate::error::{StoreError, is_already_exists};
use crate::io::atomic::{read_json, write_json_atomic};
use crate::io::record_lock::{DEFAULT_LOCK_WAIT, RecordLock};
use crate::io::task_store::TaskStore;

const REGISTER_RETRIES: usize = 16;

/// Persistent registry of agent identities.
pub trait AgentRegistry: Send + Sync {
    /// Create an active record. Fails with [`StoreError::AlreadyExists`].
    fn register(&self, agent_type: AgentType, id: &str, area: Option<&str>) -> Result<Agent>;

    fn heartbeat(&self, id: &str) -> Result<Agent>;

    /// Record (or clear) the task an agent is working on. Also a heartbeat.
    fn set_current_task(&self, id: &str, task_id: Option<&str>) -> Result<Agent>;

    fn mark_completed(&self, id: &str) -> Result<Agent>;

    fn mark_failed(&self, id: &str) -> Result<Agent>;

    /// Active -> stopped. A record that is already stopped or stale is left alone.
    fn deregister(&self, id: &str) -> Result<Agent>;

    fn get(&self, id: &str) -> Result<Agent>;

    /// All agents sorted by id, optionally filtered by type.
    fn list(&self, agent_type: Option<AgentType>) -> Result<Vec<Agent>>;

    /// Next unused `<type>-<n>`: one past the highest sequence ever registered.
    fn next_id(&self, agent_type: AgentType) -> Result<String>;

    /// Atomically mark `id` stale if it is active with an expired heartbeat.
    ///
    /// Returns the record as it was before the transition (so the caller can
    /// see which task it held), or `None` if nothing changed.
    fn mark_stale_if_expired(
        &self,
        id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Agent>>;

    fn count_active(&self, agent_type: AgentType) -> Result<usize> {
        Ok(self
            .list(Some(agent_type))?
            .iter()
            .filter(|a| a.is_active())
            .count())
    }

    /// Register under a fresh id, retrying if a concurrent caller took it.
    fn register_next(&self, agent_type: AgentType, area: Option<&str>) -> Result<Agent> {
        for _ in 0..REGISTER_RETRIES {
            let id = self.next_id(agent_type)?;
            match self.register(agent_type, &id, area) {
                Ok(agent) => return Ok(agent),
                Err(err) if is_already_exists(&err) => {
                    debug!(agent_id = %id, "id taken concurrently, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(anyhow!(
            "could not allocate a {agent_type} id after {REGISTER_RETRIES} attempts"
        ))
    }

    /// Staleness sweep against the wall clock.
    fn cleanup(&self, timeout: Duration, tasks: &dyn TaskStore) -> Result<Vec<Agent>> {
        self.cleanup_at(timeout, tasks, Utc::now())
    }

    /// Mark every expired active agent stale, then release every task still
    /// assigned to an agent that is no longer active.
    ///
    /// Recovery reads the task records, not `current_task`: a task is only
    /// released on behalf of the agent it is assigned to, so a live owner is
    /// never robbed, and a release that fails is picked up by the next sweep.
    /// Returns the agents marked stale by this call.
    fn cleanup_at(
        &self,
        timeout: Duration,
        tasks: &dyn TaskStore,
        now: DateTime<Utc>,
    ) -> Result<Vec<Agent>> {
        let mut marked = Vec::new();
        for agent in self.list(None)? {
            if !is_stale(&agent, now, timeout) {
                continue;
            }
            match self.mark_stale_if_expired(&agent.id, timeout, now) {
                Ok(Some(before)) => {
                    let silent_secs = (now - before.last_heartbeat).num_seconds();
                    warn!(agent_id = %before.id, silent_secs, "agent marked stale");
                    let mut stale = before;
                    stale.status = AgentStatus::Stale;
                    marked.push(stale);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(agent_id = %agent.id, err = %format!("{err:#}"), "cannot mark agent stale");
                }
            }
        }

        let owners: HashMap<String, Agent> = self
            .list(None)?
            .into_iter()
            .map(|agent| (agent.id.clone(), agent))
            .collect();
        for task in tasks.list(None)? {
            if !task.status.is_assigned() {
                continue;
            }
            // Claims by ids with no agent record are not ours to recover.
            let Some(owner) = task.assigned_to.as_deref().and_then(|id| owners.get(id)) else {
                continue;
            };
            if owner.is_active() {
                continue;
            }
            let reason = orphan_reason(owner, now);
            match tasks.release_held(&task.id, &owner.id, Some(&reason)) {
                Ok(released) => info!(
                    agent_id = %owner.id,
                    task_id = %task.id,
                    outcome = ?released.outcome,
                    "recovered task from inactive agent"
                ),
                Err(err) => warn!(
                    agent_id = %owner.id,
                    task_id = %task.id,
                    err = %format!("{err:#}"),
                    "cannot release orphaned task, leaving it for the next sweep"
                ),
            }
        }
        Ok(marked)
    }
}

fn orphan_reason(owner: &Agent, now: DateTime<Utc>) -> String {
    match owner.status {
        AgentStatus::Stale => format!(
            "agent {} went stale (no heartbeat for {}s)",
            owner.id,
            (now - owner.last_heartbeat).num_seconds()
        ),
        status => format!("agent {} is {status} but still held the task", owner.id),
    }
}

/// File-backed [`AgentRegistry`]: `<dir>/<id>.json` guarded by `<dir>/<id>.lock`.
#[derive(Debug, Clone)]
pub struct FileAgentRegistry {
    dir: PathBuf,
    lock_wait: Duration,
}

impl FileAgentRegistry {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create agent directory {}", dir.display()))?;
        Ok(Self {
            dir,
            lock_wait: DEFAULT_LOCK_WAIT,
        })
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

    fn load(&self, id: &str) -> Result<Agent> {
        let path = self.record_path(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()).into());
        }
        read_json(&path).with_context(|| format!("load agent {id}"))
    }

    fn store(&self, agent: &Agent) -> Result<()> {
        let path = self.record_path(&agent.id)?;
        write_json_atomic(&path, agent).with_context(|| format!("store agent {}", agent.id))
    }

    fn modify<T>(&self, id: &str, f: impl FnOnce(&mut Agent) -> T) -> Result<(Agent, T)> {
        self.record_path(id)?;
        let _lock = RecordLock::acquire(&self.lock_path(id), self.lock_wait)?;
        let mut agent = self.load(id)?;
        let value = f(&mut agent);
        self.store(&agent)?;
        Ok((agent, value))
    }

    fn touch(&self, id: &str, f: impl FnOnce(&mut Agent)) -> Result<Agent> {
        let (agent, ()) = self.modify(id, |agent| {
            f(agent);
            agent.last_heartbeat = Utc::now();
        })?;
        Ok(agent)
    }
}

impl AgentRegistry for FileAgentRegistry {
    #[instrument(skip(self))]
    fn register(&self, agent_type: AgentType, id: &str, area: Option<&str>) -> Result<Agent> {
        let path = self.record_path(id)?;
        let _lock = RecordLock::acquire(&self.lock_path(id), self.lock_wait)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists(id.to_string()).into());
        }
        let agent = Agent::new(agent_type, id, area, Utc::now());
        self.store(&agent)?;
        debug!("agent registered");
        Ok(agent)
    }

    fn heartbeat(&self, id: &str) -> Result<Agent> {
        self.touch(id, |_| {})
    }

    fn set_current_task(&self, id: &str, task_id: Option<&str>) -> Result<Agent> {
        self.touch(id, |agent| agent.current_task = task_id.map(str::to_string))
    }

    fn mark_completed(&self, id: &str) -> Result<Agent> {
        self.touch(id, |agent| {
            agent.tasks_completed += 1;
            agent.current_task = None;
        })
    }

    fn mark_failed(&self, id: &str) -> Result<Agent> {
        self.touch(id, |agent| {
            agent.tasks_failed += 1;
            agent.current_task = None;
        })
    }

    #[instrument(skip(self))]
    fn deregister(&self, id: &str) -> Result<Agent> {
        let (agent, changed) = self.modify(id, |agent| {
            if !agent.is_active() {
                return false;
            }
            agent.status = AgentStatus::Stopped;
            agent.current_task = None;
            true
        })?;
        if changed {
            debug!("agent stopped");
        } else {
            debug!(status = %agent.status, "deregister ignored");
        }
        Ok(agent)
    }

    fn get(&self, id: &str) -> Result<Agent> {
        self.load(id)
    }

    fn list(&self, agent_type: Option<AgentType>) -> Result<Vec<Agent>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.dir.display()));
            }
        };
        let mut agents = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("read entry in {}", self.dir.display()))?
                .path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let agent: Agent = read_json(&path)?;
            if agent_type.is_none_or(|t| t == agent.agent_type) {
                agents.push(agent);
            }
        }
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    fn next_id(&self, agent_type: AgentType) -> Result<String> {
        // Scan file names rather than records: ids are never reused, even
        // when a record is unreadable.
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(format_id(agent_type, 1));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.dir.display()));
            }
        };
        let mut max = 0;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", self.dir.display()))?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(seq) = parse_sequence(agent_type, id) {
                max = max.max(seq);
            }
        }
        Ok(format_id(agent_type, max + 1))
    }

    fn mark_stale_if_expired(
        &self,
        id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Agent>> {
        // Re-check under the lock: a heartbeat or a concurrent sweep may have
        // landed since the caller's scan.
        let (_, before) = self.modify(id, |agent| {
            if !is_stale(agent, now, timeout) {
                return None;
            }
            let before = agent.clone();
            agent.status = AgentStatus::Stale;
            agent.current_task = None;
            Some(before)
        })?;
        Ok(before)
    }
}
