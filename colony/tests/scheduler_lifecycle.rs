//! Full `colony run` scenarios against file-backed stores and a scripted executor.
//!
//! The executor answers by role: the executive decides, planners create tasks
//! through their own store handle (as the real CLI would), workers report on
//! the task they were handed.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use colony::agent::{Agent, AgentStatus, AgentType};
use colony::io::agent_registry::AgentRegistry;
use colony::io::config::load_config;
use colony::io::executor::ExecRequest;
use colony::io::init::{ColonyPaths, InitOptions, init_colony};
use colony::io::task_store::{FileTaskStore, TaskStore};
use colony::roles::Services;
use colony::scheduler::{RunStop, Scheduler, SchedulerConfig};
use colony::task::{NewTask, TaskStatus};
use colony::test_support::ScriptedExecutor;
use tempfile::TempDir;

fn colony_dir() -> (TempDir, ColonyPaths) {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_colony(
        temp.path(),
        &InitOptions {
            force: false,
            goal: Some("Build a todo CLI".to_string()),
        },
    )
    .expect("init");
    (temp, paths)
}

fn scheduler_config(max_workers: usize, exec_interval: u32, max_cycles: u32) -> SchedulerConfig {
    SchedulerConfig {
        max_workers,
        exec_interval,
        max_cycles,
        cycle_delay: Duration::ZERO,
        stale_timeout: Duration::from_secs(60),
    }
}

fn services(paths: &ColonyPaths, executor: &ScriptedExecutor) -> Services {
    let config = load_config(&paths.config_path).expect("config");
    Services::open(paths, &config, Arc::new(executor.clone())).expect("services")
}

fn complete_assigned(request: &ExecRequest) -> anyhow::Result<String> {
    let task_id = request
        .task_id
        .as_deref()
        .ok_or_else(|| anyhow!("worker without a task"))?;
    Ok(format!("All tests pass.\nTASK_COMPLETE:{task_id}"))
}

fn progress(paths: &ColonyPaths) -> String {
    fs::read_to_string(&paths.progress_path).expect("progress log")
}

/// Verifies an empty colony plans first, then works the graph to completion.
#[test]
fn plans_then_completes_dependency_chain() {
    let (_temp, paths) = colony_dir();
    let planner_store = FileTaskStore::open(&paths.tasks_dir).expect("planner store");
    let executor = ScriptedExecutor::with_handler(move |request| match request.role {
        AgentType::Executive => Ok("State looks fine.\nCONTINUE".to_string()),
        AgentType::Planner => {
            planner_store.create(NewTask::new("TASK-001", "Data model"))?;
            planner_store
                .create(NewTask::new("TASK-002", "CLI commands").with_dependencies(["TASK-001"]))?;
            Ok("PLANNING_DONE".to_string())
        }
        AgentType::Worker => complete_assigned(request),
    });
    let services = services(&paths, &executor);

    let outcome = Scheduler::new(services.clone(), scheduler_config(2, 5, 10))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::Success);
    assert_eq!(outcome.stop.exit_code(), 0);
    assert!(outcome.cycles_run <= 3);
    assert_eq!(outcome.tasks.completed, 2);
    assert_eq!(executor.calls_for(AgentType::Planner).len(), 1);
    assert_eq!(executor.calls_for(AgentType::Executive).len(), 1);

    let worked: Vec<String> = executor
        .calls_for(AgentType::Worker)
        .into_iter()
        .filter_map(|call| call.task_id)
        .collect();
    assert_eq!(worked, vec!["TASK-001", "TASK-002"]);

    let log = progress(&paths);
    assert!(log.contains("completed TASK-001 (Data model)"));
    assert!(log.contains("completed TASK-002 (CLI commands)"));
    assert!(log.contains("goals achieved"));
    assert_eq!(
        services
            .agents
            .count_active(AgentType::Worker)
            .expect("count"),
        0
    );
}

/// Verifies a STUCK decision ends the run at once with the stuck exit code.
#[test]
fn executive_stuck_stops_run() {
    let (_temp, paths) = colony_dir();
    let executor = ScriptedExecutor::with_handler(|request| match request.role {
        AgentType::Executive => Ok("Nothing can move.\nSTUCK".to_string()),
        AgentType::Planner => Ok("PLANNING_DONE".to_string()),
        AgentType::Worker => Err(anyhow!("no worker expected")),
    });
    let services = services(&paths, &executor);

    let outcome = Scheduler::new(services, scheduler_config(3, 5, 10))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::Stuck);
    assert_eq!(outcome.stop.exit_code(), 2);
    assert_eq!(outcome.cycles_run, 1);
    assert!(executor.calls_for(AgentType::Worker).is_empty());
}

/// Verifies workers that never signal keep requeueing until the cycle budget runs out.
#[test]
fn budget_exhausted_with_silent_workers() {
    let (_temp, paths) = colony_dir();
    let executor = ScriptedExecutor::with_handler(|request| match request.role {
        AgentType::Executive => Ok("CONTINUE".to_string()),
        AgentType::Planner => Ok("PLANNING_DONE".to_string()),
        AgentType::Worker => Ok("I made some progress but ran out of time.".to_string()),
    });
    let services = services(&paths, &executor);
    services
        .tasks
        .create(NewTask::new("TASK-001", "Endless").with_max_attempts(10))
        .expect("create");

    let outcome = Scheduler::new(services.clone(), scheduler_config(1, 5, 3))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::BudgetExhausted);
    assert_eq!(outcome.stop.exit_code(), 1);
    assert_eq!(outcome.cycles_run, 3);

    let task = services.tasks.get("TASK-001").expect("get");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.assigned_to, None);
    assert_eq!(
        task.error.as_deref(),
        Some("no completion signal in executor output")
    );
    assert!(progress(&paths).contains("cycle budget exhausted"));
}

/// Verifies repeated TASK_FAILED reports exhaust the task and the run still terminates.
#[test]
fn failing_task_is_exhausted_and_recorded() {
    let (_temp, paths) = colony_dir();
    let executor = ScriptedExecutor::with_handler(|request| match request.role {
        AgentType::Executive => Ok("CONTINUE".to_string()),
        AgentType::Planner => Ok("PLANNING_DONE".to_string()),
        AgentType::Worker => Ok(format!(
            "TASK_FAILED:{}:migrations do not apply",
            request.task_id.as_deref().unwrap_or_default()
        )),
    });
    let services = services(&paths, &executor);
    services
        .tasks
        .create(NewTask::new("DB-001", "Schema").with_max_attempts(2))
        .expect("create");

    let outcome = Scheduler::new(services.clone(), scheduler_config(1, 5, 10))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::Success);
    assert_eq!(outcome.tasks.failed, 1);
    assert_eq!(executor.calls_for(AgentType::Worker).len(), 2);

    let task = services.tasks.get("DB-001").expect("get");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.error.as_deref(), Some("migrations do not apply"));
    assert!(progress(&paths).contains("FAILED DB-001 (Schema) permanently: migrations do not apply"));

    let failures: u32 = services
        .agents
        .list(Some(AgentType::Worker))
        .expect("workers")
        .iter()
        .map(|agent| agent.tasks_failed)
        .sum();
    assert_eq!(failures, 2);
}

/// Verifies an executor error releases the claimed task instead of leaving it assigned.
#[test]
fn executor_error_releases_task() {
    let (_temp, paths) = colony_dir();
    let executor = ScriptedExecutor::with_handler(|request| match request.role {
        AgentType::Worker => Err(anyhow!("codex exited with status 1")),
        _ => Ok("CONTINUE".to_string()),
    });
    let services = services(&paths, &executor);
    services
        .tasks
        .create(NewTask::new("TASK-001", "Flaky backend").with_max_attempts(5))
        .expect("create");

    let outcome = Scheduler::new(services.clone(), scheduler_config(1, 5, 1))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::BudgetExhausted);
    let task = services.tasks.get("TASK-001").expect("get");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.assigned_to, None);
    assert!(
        task.error
            .as_deref()
            .is_some_and(|e| e.starts_with("executor error:"))
    );
}

/// Verifies a planner spawned for an area runs in the background and is joined before exit.
#[test]
fn spawned_planner_is_reaped() {
    let (_temp, paths) = colony_dir();
    let planner_store = FileTaskStore::open(&paths.tasks_dir).expect("planner store");
    let decisions = AtomicUsize::new(0);
    let executor = ScriptedExecutor::with_handler(move |request| match request.role {
        AgentType::Executive => {
            if decisions.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok("The API needs a breakdown.\nSPAWN_PLANNER:api".to_string())
            } else {
                Ok("COMPLETE".to_string())
            }
        }
        AgentType::Planner => {
            planner_store.create(NewTask::new("API-001", "Health route"))?;
            Ok("AREA_COMPLETE".to_string())
        }
        AgentType::Worker => complete_assigned(request),
    });
    let services = services(&paths, &executor);
    services
        .tasks
        .create(NewTask::new("SEED-001", "Project skeleton"))
        .expect("create");

    let outcome = Scheduler::new(services.clone(), scheduler_config(1, 1, 10))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::Success);
    assert_eq!(outcome.cycles_run, 2);
    assert_eq!(executor.calls_for(AgentType::Planner).len(), 1);
    assert!(services.tasks.get("API-001").is_ok());

    let planners = services
        .agents
        .list(Some(AgentType::Planner))
        .expect("planners");
    assert_eq!(planners.len(), 1);
    assert_eq!(planners[0].area.as_deref(), Some("api"));
    assert_eq!(planners[0].status, AgentStatus::Stopped);
}

/// Verifies a planner can be stopped by the executive while it runs and is still joined.
#[test]
fn terminated_planner_is_stopped_and_reaped() {
    let (_temp, paths) = colony_dir();
    let released = Arc::new(AtomicBool::new(false));
    let planner_returned = Arc::new(AtomicBool::new(false));
    let decisions = AtomicUsize::new(0);
    let executor = {
        let released = Arc::clone(&released);
        let planner_returned = Arc::clone(&planner_returned);
        ScriptedExecutor::with_handler(move |request| match request.role {
            AgentType::Executive => match decisions.fetch_add(1, Ordering::SeqCst) {
                0 => Ok("SPAWN_PLANNER:api".to_string()),
                1 => Ok(
                    "The api planner is going in circles.\nTERMINATE_PLANNER:planner-1".to_string(),
                ),
                2 => {
                    released.store(true, Ordering::SeqCst);
                    Ok("TERMINATE_PLANNER:planner-9".to_string())
                }
                _ => Ok("COMPLETE".to_string()),
            },
            AgentType::Planner => {
                // Stay in flight until the executive has had its say.
                let deadline = Instant::now() + Duration::from_secs(10);
                while !released.load(Ordering::SeqCst) && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(5));
                }
                planner_returned.store(true, Ordering::SeqCst);
                Ok("AREA_COMPLETE".to_string())
            }
            AgentType::Worker => complete_assigned(request),
        })
    };
    let services = services(&paths, &executor);
    services
        .tasks
        .create(NewTask::new("SEED-001", "Project skeleton"))
        .expect("create");

    let outcome = Scheduler::new(services.clone(), scheduler_config(1, 1, 10))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::Success);
    assert_eq!(outcome.cycles_run, 4);
    assert!(planner_returned.load(Ordering::SeqCst));
    assert_eq!(executor.calls_for(AgentType::Planner).len(), 1);

    let planner = services.agents.get("planner-1").expect("planner");
    assert_eq!(planner.status, AgentStatus::Stopped);
    assert_eq!(planner.area.as_deref(), Some("api"));
    assert!(services.agents.get("planner-9").is_err());
}

/// Verifies a cycle that had to plan leaves the new work for the next cycle.
#[test]
fn planning_cycle_spawns_no_workers() {
    let (_temp, paths) = colony_dir();
    let planner_store = FileTaskStore::open(&paths.tasks_dir).expect("planner store");
    let passes = AtomicUsize::new(0);
    let executor = ScriptedExecutor::with_handler(move |request| match request.role {
        AgentType::Executive => Ok("CONTINUE".to_string()),
        AgentType::Planner => {
            // The startup pass comes up empty; the first cycle's pass plans.
            if passes.fetch_add(1, Ordering::SeqCst) == 1 {
                planner_store.create(NewTask::new("TASK-001", "Data model"))?;
            }
            Ok("PLANNING_DONE".to_string())
        }
        AgentType::Worker => complete_assigned(request),
    });
    let services = services(&paths, &executor);

    let outcome = Scheduler::new(services.clone(), scheduler_config(2, 5, 1))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::BudgetExhausted);
    assert_eq!(executor.calls_for(AgentType::Planner).len(), 2);
    assert!(executor.calls_for(AgentType::Worker).is_empty());
    let task = services.tasks.get("TASK-001").expect("get");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
}

/// Verifies three replies without a decision in a row are noted in the progress log.
#[test]
fn unrecognized_executive_streak_is_noted() {
    let (_temp, paths) = colony_dir();
    let executor = ScriptedExecutor::with_handler(|request| match request.role {
        AgentType::Executive => Ok("Let me think about this some more.".to_string()),
        AgentType::Planner => Ok("PLANNING_DONE".to_string()),
        AgentType::Worker => Err(anyhow!("no worker expected")),
    });
    let services = services(&paths, &executor);

    let outcome = Scheduler::new(services, scheduler_config(1, 1, 3))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::BudgetExhausted);
    assert_eq!(executor.calls_for(AgentType::Executive).len(), 3);
    // Zero tasks: the startup pass plus one per cycle.
    assert_eq!(executor.calls_for(AgentType::Planner).len(), 4);
    assert!(progress(&paths).contains("no recognizable decision 3 times in a row"));
}

/// Verifies the startup sweep recovers a task orphaned by a crashed run.
#[test]
fn startup_sweep_recovers_orphaned_task() {
    let (_temp, paths) = colony_dir();
    let executor = ScriptedExecutor::with_handler(|request| match request.role {
        AgentType::Executive => Ok("CONTINUE".to_string()),
        AgentType::Planner => Ok("PLANNING_DONE".to_string()),
        AgentType::Worker => complete_assigned(request),
    });
    let services = services(&paths, &executor);
    services
        .tasks
        .create(NewTask::new("TASK-001", "Left behind"))
        .expect("create");
    assert_eq!(
        services.tasks.claim("worker-7").expect("claim").as_deref(),
        Some("TASK-001")
    );

    let crashed = Utc::now() - chrono::Duration::hours(2);
    let mut orphan = Agent::new(AgentType::Worker, "worker-7", None, crashed);
    orphan.current_task = Some("TASK-001".to_string());
    fs::write(
        paths.agents_dir.join("worker-7.json"),
        serde_json::to_string_pretty(&orphan).expect("serialize"),
    )
    .expect("write orphan");

    let outcome = Scheduler::new(services.clone(), scheduler_config(1, 5, 5))
        .run()
        .expect("run");

    assert_eq!(outcome.stop, RunStop::Success);
    let task = services.tasks.get("TASK-001").expect("get");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 2);
    assert_eq!(
        services.agents.get("worker-7").expect("orphan").status,
        AgentStatus::Stale
    );
    let worker = executor.calls_for(AgentType::Worker);
    assert_eq!(worker.len(), 1);
    assert_eq!(worker[0].agent_id, "worker-8");
}
