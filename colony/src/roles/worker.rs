//! One worker unit: claim a task, execute it, commit the outcome.

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::agent::AgentType;
use crate::core::signal::{WorkerSignal, parse_worker_signal};
use crate::core::transitions::ReleaseOutcome;
use crate::roles::Services;
use crate::task::{Task, TaskStatus};

/// How a worker unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Nothing was eligible to claim.
    Idle,
    Completed { task_id: String },
    /// The executor reported failure; the task was released.
    Failed {
        task_id: String,
        outcome: ReleaseOutcome,
    },
    /// No usable completion signal; the task was released.
    Released {
        task_id: String,
        outcome: ReleaseOutcome,
        reason: String,
    },
    /// The task was taken away (staleness sweep) before the unit could commit.
    Abandoned { task_id: String },
}

/// Run one worker unit under a fresh identity.
#[instrument(skip_all)]
pub fn run_worker(services: &Services) -> Result<WorkerOutcome> {
    let agent = services
        .agents
        .register_next(AgentType::Worker, None)
        .context("register worker")?;
    let result = claim_and_work(services, &agent.id);
    if let Err(err) = services.agents.deregister(&agent.id) {
        warn!(agent_id = %agent.id, err = %format!("{err:#}"), "failed to deregister worker");
    }
    result
}

fn claim_and_work(services: &Services, agent_id: &str) -> Result<WorkerOutcome> {
    let Some(task_id) = services.tasks.claim(agent_id)? else {
        debug!(agent_id, "no eligible task");
        return Ok(WorkerOutcome::Idle);
    };
    match work(services, agent_id, &task_id) {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            error!(agent_id, task_id = %task_id, err = %format!("{err:#}"), "worker error");
            // Never leave a claimed task behind on an unexpected error; the
            // identity is about to be deregistered and would escape the sweep.
            if owns(services, &task_id, agent_id).unwrap_or(false) {
                let reason = format!("worker error: {err:#}");
                if let Err(release_err) = services.tasks.release(&task_id, Some(&reason)) {
                    error!(task_id = %task_id, err = %format!("{release_err:#}"), "release after error failed");
                }
            }
            Err(err)
        }
    }
}

fn work(services: &Services, agent_id: &str, task_id: &str) -> Result<WorkerOutcome> {
    services.agents.set_current_task(agent_id, Some(task_id))?;
    let task = services
        .tasks
        .update_status(task_id, TaskStatus::InProgress, None)?;
    info!(agent_id, task_id, attempt = task.attempts, "working on task");

    let all_tasks = services.tasks.list(None)?;
    let context = services
        .prompts
        .render_worker(&services.settings.goal, &task, &all_tasks)?;
    let request = services.request(agent_id, AgentType::Worker, Some(task_id), context);
    let signal = match services.executor.exec(&request) {
        Ok(text) => parse_worker_signal(&text),
        Err(err) => {
            warn!(agent_id, task_id, err = %format!("{err:#}"), "executor error");
            let reason = format!("executor error: {err:#}");
            return release(services, agent_id, &task, reason);
        }
    };

    // The sweep may have recovered the task while the executor ran.
    if !owns(services, task_id, agent_id)? {
        warn!(agent_id, task_id, "task no longer assigned to this worker, not committing");
        return Ok(WorkerOutcome::Abandoned {
            task_id: task_id.to_string(),
        });
    }

    match signal {
        WorkerSignal::Complete { task_id: done } if done == task.id => {
            services
                .tasks
                .update_status(task_id, TaskStatus::Completed, None)?;
            services.agents.mark_completed(agent_id)?;
            services
                .progress
                .task_completed(&task.id, &task.title, agent_id)?;
            info!(agent_id, task_id, "task completed");
            Ok(WorkerOutcome::Completed {
                task_id: task.id.clone(),
            })
        }
        WorkerSignal::Failed {
            task_id: failed,
            reason,
        } if failed == task.id => {
            services.agents.mark_failed(agent_id)?;
            let released = services.tasks.release(task_id, Some(&reason))?;
            if released.outcome == ReleaseOutcome::Exhausted {
                services
                    .progress
                    .task_failed(&task.id, &task.title, &reason)?;
            }
            info!(agent_id, task_id, reason = %reason, outcome = ?released.outcome, "task attempt failed");
            Ok(WorkerOutcome::Failed {
                task_id: task.id.clone(),
                outcome: released.outcome,
            })
        }
        other => {
            let reason = match other {
                WorkerSignal::NoTasks => "executor reported NO_TASKS".to_string(),
                WorkerSignal::Complete { task_id: wrong }
                | WorkerSignal::Failed { task_id: wrong, .. } => {
                    format!("executor signalled task {wrong} while working on {}", task.id)
                }
                WorkerSignal::Unrecognized => "no completion signal in executor output".to_string(),
            };
            warn!(agent_id, task_id, reason = %reason, "releasing task");
            release(services, agent_id, &task, reason)
        }
    }
}

fn release(
    services: &Services,
    agent_id: &str,
    task: &Task,
    reason: String,
) -> Result<WorkerOutcome> {
    if !owns(services, &task.id, agent_id)? {
        return Ok(WorkerOutcome::Abandoned {
            task_id: task.id.clone(),
        });
    }
    let released = services.tasks.release(&task.id, Some(&reason))?;
    services.agents.set_current_task(agent_id, None)?;
    if released.outcome == ReleaseOutcome::Exhausted {
        services
            .progress
            .task_failed(&task.id, &task.title, &reason)?;
    }
    Ok(WorkerOutcome::Released {
        task_id: task.id.clone(),
        outcome: released.outcome,
        reason,
    })
}

/// True while `task_id` is still assigned to `agent_id`.
///
/// Check-then-act: a sweep landing between this check and the commit can
/// still slip through. The stale timeout is validated to exceed the executor
/// timeout, so that needs a worker silent for longer than any invocation.
fn owns(services: &Services, task_id: &str, agent_id: &str) -> Result<bool> {
    let task = services.tasks.get(task_id)?;
    Ok(task.status.is_assigned() && task.assigned_to.as_deref() == Some(agent_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::task::NewTask;
    use crate::test_support::{ScriptedExecutor, memory_services};

    /// Verifies a completion signal commits the task and the progress entry.
    #[test]
    fn completion_commits_task() {
        let executor = ScriptedExecutor::replying(["Done.\nTASK_COMPLETE:TASK-001"]);
        let (_temp, services) = memory_services(executor.clone());
        services
            .tasks
            .create(NewTask::new("TASK-001", "Scaffold"))
            .expect("create");

        let outcome = run_worker(&services).expect("worker");
        assert_eq!(
            outcome,
            WorkerOutcome::Completed {
                task_id: "TASK-001".to_string()
            }
        );
        let task = services.tasks.get("TASK-001").expect("get");
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.assigned_to.is_none());

        let agent = services.agents.get("worker-1").expect("agent");
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert_eq!(agent.tasks_completed, 1);

        let progress = std::fs::read_to_string(services.progress.path()).expect("progress");
        assert!(progress.contains("completed TASK-001 (Scaffold) by worker-1"));

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].role, AgentType::Worker);
        assert_eq!(calls[0].task_id.as_deref(), Some("TASK-001"));
    }

    /// Verifies a failure signal consumes an attempt and requeues.
    #[test]
    fn failure_signal_requeues_with_reason() {
        let executor = ScriptedExecutor::replying(["TASK_FAILED:TASK-001:build broke"]);
        let (_temp, services) = memory_services(executor);
        services
            .tasks
            .create(NewTask::new("TASK-001", "Scaffold"))
            .expect("create");

        let outcome = run_worker(&services).expect("worker");
        assert_eq!(
            outcome,
            WorkerOutcome::Failed {
                task_id: "TASK-001".to_string(),
                outcome: ReleaseOutcome::Requeued,
            }
        );
        let task = services.tasks.get("TASK-001").expect("get");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.error.as_deref(), Some("build broke"));
        assert_eq!(
            services.agents.get("worker-1").expect("agent").tasks_failed,
            1
        );
    }

    /// Verifies output naming another task is treated as a release.
    #[test]
    fn signal_for_other_task_releases() {
        let executor = ScriptedExecutor::replying(["TASK_COMPLETE:TASK-999"]);
        let (_temp, services) = memory_services(executor);
        services
            .tasks
            .create(NewTask::new("TASK-001", "Scaffold"))
            .expect("create");

        let outcome = run_worker(&services).expect("worker");
        let WorkerOutcome::Released { reason, outcome, .. } = outcome else {
            panic!("expected release, got {outcome:?}");
        };
        assert_eq!(outcome, ReleaseOutcome::Requeued);
        assert!(reason.contains("TASK-999"));
        assert_eq!(
            services.tasks.get("TASK-001").expect("get").status,
            TaskStatus::Pending
        );
    }

    /// Verifies an executor error on the last attempt fails the task for good.
    #[test]
    fn executor_error_on_last_attempt_is_permanent() {
        let executor = ScriptedExecutor::failing("spawn claude: not found");
        let (_temp, services) = memory_services(executor);
        services
            .tasks
            .create(NewTask::new("TASK-001", "Scaffold").with_max_attempts(1))
            .expect("create");

        let outcome = run_worker(&services).expect("worker");
        assert!(matches!(
            outcome,
            WorkerOutcome::Released {
                outcome: ReleaseOutcome::Exhausted,
                ..
            }
        ));
        let task = services.tasks.get("TASK-001").expect("get");
        assert!(task.is_exhausted());
        let progress = std::fs::read_to_string(services.progress.path()).expect("progress");
        assert!(progress.contains("FAILED TASK-001"));
    }

    /// Verifies a worker with nothing to claim leaves no active identity.
    #[test]
    fn idle_worker_deregisters() {
        let executor = ScriptedExecutor::replying(Vec::<String>::new());
        let (_temp, services) = memory_services(executor.clone());

        assert_eq!(run_worker(&services).expect("worker"), WorkerOutcome::Idle);
        assert_eq!(
            services
                .agents
                .count_active(AgentType::Worker)
                .expect("count"),
            0
        );
        assert!(executor.calls().is_empty());
    }

    /// Verifies a worker whose task was recovered mid-run does not commit.
    #[test]
    fn recovered_task_is_not_committed() {
        let (_temp, services) = memory_services(ScriptedExecutor::replying(Vec::<String>::new()));
        let tasks = std::sync::Arc::clone(&services.tasks);
        let executor = ScriptedExecutor::with_handler(move |_| {
            // Simulate the sweep releasing the task and another worker taking it.
            tasks
                .release("TASK-001", Some("agent went stale"))
                .expect("release");
            tasks.claim("worker-77").expect("claim");
            Ok("TASK_COMPLETE:TASK-001".to_string())
        });
        let services = Services {
            executor: std::sync::Arc::new(executor),
            ..services
        };
        services
            .tasks
            .create(NewTask::new("TASK-001", "Scaffold"))
            .expect("create");

        let outcome = run_worker(&services).expect("worker");
        assert_eq!(
            outcome,
            WorkerOutcome::Abandoned {
                task_id: "TASK-001".to_string()
            }
        );
        let task = services.tasks.get("TASK-001").expect("get");
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.assigned_to.as_deref(), Some("worker-77"));
    }
}
