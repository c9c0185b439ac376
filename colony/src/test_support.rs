//! Test-only helpers: record builders, scripted executors, store fixtures.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::agent::AgentType;
use crate::io::executor::{ExecRequest, Executor};
use crate::io::memory::{MemoryAgentRegistry, MemoryTaskStore};
use crate::io::progress_log::ProgressLog;
use crate::roles::{InvocationSettings, Services};
use crate::task::{NewTask, Task};

/// A pending task with deterministic defaults (`max_attempts = 3`).
pub fn task(id: &str) -> Task {
    NewTask::new(id, format!("{id} title")).into_task(Utc::now())
}

/// A pending task depending on `deps`.
pub fn task_with_deps(id: &str, deps: &[&str]) -> Task {
    let mut task = task(id);
    task.dependencies = deps.iter().map(|d| d.to_string()).collect();
    task
}

type Handler = dyn Fn(&ExecRequest) -> Result<String> + Send + Sync;

/// Executor that answers from a closure and records every request.
#[derive(Clone)]
pub struct ScriptedExecutor {
    handler: Arc<Handler>,
    calls: Arc<Mutex<Vec<ExecRequest>>>,
}

impl ScriptedExecutor {
    pub fn with_handler(
        handler: impl Fn(&ExecRequest) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reply with `replies` in order, regardless of role; error once exhausted.
    pub fn replying<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue: Mutex<VecDeque<String>> =
            Mutex::new(replies.into_iter().map(Into::into).collect());
        Self::with_handler(move |request| {
            queue
                .lock()
                .map_err(|_| anyhow!("reply queue poisoned"))?
                .pop_front()
                .ok_or_else(|| anyhow!("no scripted reply left for {}", request.agent_id))
        })
    }

    /// Fail every invocation with `message`.
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::with_handler(move |_| Err(anyhow!(message.clone())))
    }

    /// Requests seen so far, in call order.
    pub fn calls(&self) -> Vec<ExecRequest> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Requests seen so far for one role.
    pub fn calls_for(&self, role: AgentType) -> Vec<ExecRequest> {
        self.calls()
            .into_iter()
            .filter(|call| call.role == role)
            .collect()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<String> {
        self.calls.lock().expect("calls lock").push(request.clone());
        (self.handler)(request)
    }
}

/// Invocation settings rooted at `root`.
pub fn settings(root: &Path) -> InvocationSettings {
    InvocationSettings {
        goal: "Build a todo CLI".to_string(),
        workdir: root.to_path_buf(),
        logs_dir: root.join(".colony").join("logs"),
        timeout: Duration::from_secs(5),
        output_limit_bytes: 10_000,
    }
}

/// In-memory stores plus a progress log in a temp dir.
pub fn memory_services(executor: impl Executor + 'static) -> (TempDir, Services) {
    let temp = tempfile::tempdir().expect("tempdir");
    let services = Services::new(
        Arc::new(MemoryTaskStore::new()),
        Arc::new(MemoryAgentRegistry::new()),
        Arc::new(executor),
        ProgressLog::new(temp.path().join(".colony").join("progress.md")),
        settings(temp.path()),
    )
    .expect("services");
    (temp, services)
}
