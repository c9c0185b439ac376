//! One executor invocation per role, composed from the stores and the executor.
//!
//! Each role run registers its own agent identity, invokes the executor once,
//! interprets the signal and deregisters. The scheduler decides when roles run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::agent::AgentType;
use crate::io::agent_registry::{AgentRegistry, FileAgentRegistry};
use crate::io::config::ColonyConfig;
use crate::io::executor::{ExecRequest, Executor};
use crate::io::init::ColonyPaths;
use crate::io::progress_log::ProgressLog;
use crate::io::prompt::{PromptEngine, instructions};
use crate::io::task_store::{FileTaskStore, TaskStore};

pub mod executive;
pub mod planner;
pub mod worker;

/// Per-invocation settings shared by every role.
#[derive(Debug, Clone)]
pub struct InvocationSettings {
    pub goal: String,
    /// Project root; the executor's working directory.
    pub workdir: PathBuf,
    pub logs_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl InvocationSettings {
    pub fn from_config(paths: &ColonyPaths, config: &ColonyConfig) -> Self {
        Self {
            goal: config.project.goal.clone(),
            workdir: paths.root.clone(),
            logs_dir: paths.logs_dir.clone(),
            timeout: Duration::from_secs(config.executor.timeout_secs),
            output_limit_bytes: config.executor.output_limit_bytes,
        }
    }
}

/// Everything a role needs. Cheap to clone into worker and planner threads.
#[derive(Clone)]
pub struct Services {
    pub tasks: Arc<dyn TaskStore>,
    pub agents: Arc<dyn AgentRegistry>,
    pub executor: Arc<dyn Executor>,
    pub prompts: Arc<PromptEngine>,
    pub progress: ProgressLog,
    pub settings: InvocationSettings,
}

impl Services {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        agents: Arc<dyn AgentRegistry>,
        executor: Arc<dyn Executor>,
        progress: ProgressLog,
        settings: InvocationSettings,
    ) -> Result<Self> {
        Ok(Self {
            tasks,
            agents,
            executor,
            prompts: Arc::new(PromptEngine::new()?),
            progress,
            settings,
        })
    }

    /// File-backed stores under `paths`.
    pub fn open(
        paths: &ColonyPaths,
        config: &ColonyConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        paths.ensure_dirs()?;
        Self::new(
            Arc::new(FileTaskStore::open(&paths.tasks_dir)?),
            Arc::new(FileAgentRegistry::open(&paths.agents_dir)?),
            executor,
            ProgressLog::new(&paths.progress_path),
            InvocationSettings::from_config(paths, config),
        )
    }

    pub(crate) fn request(
        &self,
        agent_id: &str,
        role: AgentType,
        task_id: Option<&str>,
        context: String,
    ) -> ExecRequest {
        ExecRequest {
            agent_id: agent_id.to_string(),
            role,
            task_id: task_id.map(str::to_string),
            instructions: instructions(role).to_string(),
            context,
            workdir: self.settings.workdir.clone(),
            log_path: self.settings.logs_dir.join(format!("{agent_id}.log")),
            timeout: self.settings.timeout,
            output_limit_bytes: self.settings.output_limit_bytes,
        }
    }
}
