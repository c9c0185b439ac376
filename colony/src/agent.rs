use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role an agent identity plays. Doubles as the executor role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Executive,
    Planner,
    Worker,
}

impl AgentType {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Executive => "executive",
            AgentType::Planner => "planner",
            AgentType::Worker => "worker",
        }
    }

    /// Prefix used for agent ids (`worker-7`).
    pub fn id_prefix(self) -> String {
        format!("{}-", self.as_str())
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "executive" => Ok(AgentType::Executive),
            "planner" => Ok(AgentType::Planner),
            "worker" => Ok(AgentType::Worker),
            other => Err(anyhow!("unknown agent type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Stopped,
    Stale,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Active => "active",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Stale => "stale",
        };
        f.pad(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub area: Option<String>,
    /// Lookup-only reference; the task record is the source of truth.
    pub current_task: Option<String>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub pid: u32,
}

impl Agent {
    pub fn new(agent_type: AgentType, id: &str, area: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            agent_type,
            status: AgentStatus::Active,
            area: area.map(str::to_string),
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            started_at: now,
            last_heartbeat: now,
            pid: std::process::id(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Parse the sequence number out of `<type>-<n>`.
pub fn parse_sequence(agent_type: AgentType, id: &str) -> Option<u64> {
    id.strip_prefix(&agent_type.id_prefix())?.parse().ok()
}

pub fn format_id(agent_type: AgentType, sequence: u64) -> String {
    format!("{}{}", agent_type.id_prefix(), sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_round_trips_through_id() {
        let id = format_id(AgentType::Worker, 12);
        assert_eq!(id, "worker-12");
        assert_eq!(parse_sequence(AgentType::Worker, &id), Some(12));
        assert_eq!(parse_sequence(AgentType::Planner, &id), None);
        assert_eq!(parse_sequence(AgentType::Worker, "worker-x"), None);
    }

    #[test]
    fn agent_type_parses_lowercase_names() {
        assert_eq!(
            "planner".parse::<AgentType>().expect("parse"),
            AgentType::Planner
        );
        assert!("boss".parse::<AgentType>().is_err());
    }
}
