//! Cycle loop: periodic executive check, bounded worker fan-out, staleness sweep.

use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, error, info, info_span, instrument, warn};

use crate::core::signal::ExecutiveSignal;
use crate::exit_codes;
use crate::io::config::SchedulerSettings;
use crate::roles::Services;
use crate::roles::executive::run_executive;
use crate::roles::planner::{PlannerHandle, run_planner, spawn_planner};
use crate::roles::worker::{WorkerOutcome, run_worker};
use crate::task::TaskCounts;

/// Consecutive unrecognized executive replies before the stall is recorded.
const UNRECOGNIZED_STREAK_NOTE: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub exec_interval: u32,
    pub max_cycles: u32,
    pub cycle_delay: Duration,
    pub stale_timeout: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            max_workers: settings.max_workers,
            exec_interval: settings.exec_interval,
            max_cycles: settings.max_cycles,
            cycle_delay: Duration::from_secs(settings.cycle_delay_secs),
            stale_timeout: Duration::from_secs(settings.stale_timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(anyhow!("workers must be > 0"));
        }
        if self.exec_interval == 0 {
            return Err(anyhow!("exec interval must be > 0"));
        }
        if self.max_cycles == 0 {
            return Err(anyhow!("max cycles must be > 0"));
        }
        Ok(())
    }

    fn executive_due(&self, cycle: u32) -> bool {
        cycle == 1 || cycle % self.exec_interval == 0
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// Executive declared completion, or every task is terminal.
    Success,
    /// Executive declared the colony stuck.
    Stuck,
    /// `max_cycles` ran out first.
    BudgetExhausted,
}

impl RunStop {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStop::Success => exit_codes::SUCCESS,
            RunStop::BudgetExhausted => exit_codes::BUDGET_EXHAUSTED,
            RunStop::Stuck => exit_codes::STUCK,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            RunStop::Success => "goals achieved",
            RunStop::Stuck => "stuck",
            RunStop::BudgetExhausted => "cycle budget exhausted",
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub cycles_run: u32,
    pub stop: RunStop,
    pub tasks: TaskCounts,
}

/// Drives cycles until a terminal decision or the cycle budget.
pub struct Scheduler {
    services: Services,
    config: SchedulerConfig,
    planners: Vec<PlannerHandle>,
    unrecognized_streak: u32,
}

impl Scheduler {
    pub fn new(services: Services, config: SchedulerConfig) -> Self {
        Self {
            services,
            config,
            planners: Vec::new(),
            unrecognized_streak: 0,
        }
    }

    #[instrument(skip_all, fields(max_cycles = self.config.max_cycles, max_workers = self.config.max_workers))]
    pub fn run(mut self) -> Result<RunOutcome> {
        self.config.validate()?;
        info!("run starting");

        // Work orphaned by a previous crashed run.
        self.sweep();
        if self.services.tasks.counts()?.total() == 0 {
            info!("no tasks yet, running initial planning pass");
            self.plan_now();
        }

        let mut cycles_run = 0;
        for cycle in 1..=self.config.max_cycles {
            cycles_run = cycle;
            let span = info_span!("cycle", cycle);
            let _enter = span.enter();
            if let Some(stop) = self.cycle(cycle)? {
                return self.finish(cycles_run, stop);
            }
            if cycle < self.config.max_cycles && !self.config.cycle_delay.is_zero() {
                thread::sleep(self.config.cycle_delay);
            }
        }
        self.finish(cycles_run, RunStop::BudgetExhausted)
    }

    fn cycle(&mut self, cycle: u32) -> Result<Option<RunStop>> {
        self.reap_planners(false);

        if self.config.executive_due(cycle) {
            let signal = run_executive(&self.services, cycle, self.config.max_cycles)?;
            if let Some(stop) = self.apply_executive(signal)? {
                return Ok(Some(stop));
            }
        }

        let counts = self.services.tasks.counts()?;
        debug!(%counts, "task counts");
        if counts.pending == 0 && counts.active() == 0 {
            if !self.planners.is_empty() {
                info!(planners = self.planners.len(), "waiting for background planners");
            } else if counts.total() == 0 {
                // Work created by this pass is picked up next cycle.
                info!("still no tasks, planning again");
                self.plan_now();
            } else {
                info!(%counts, "every task is terminal");
                return Ok(Some(RunStop::Success));
            }
            self.sweep();
            return Ok(None);
        }

        let workers = self.config.max_workers.min(counts.pending);
        if workers > 0 {
            self.fan_out(workers);
        }
        self.sweep();
        Ok(None)
    }

    fn apply_executive(&mut self, signal: ExecutiveSignal) -> Result<Option<RunStop>> {
        if signal != ExecutiveSignal::Unrecognized {
            self.unrecognized_streak = 0;
        }
        match signal {
            ExecutiveSignal::Complete => return Ok(Some(RunStop::Success)),
            ExecutiveSignal::Stuck => return Ok(Some(RunStop::Stuck)),
            ExecutiveSignal::Continue => {}
            ExecutiveSignal::SpawnPlanner { area } => {
                if let Some(running) = self.planners.iter().find(|p| p.area == area) {
                    info!(
                        area = %area,
                        agent_id = %running.agent_id,
                        "planner already running for area"
                    );
                } else {
                    let handle = spawn_planner(&self.services, &area)?;
                    self.planners.push(handle);
                }
            }
            ExecutiveSignal::TerminatePlanner { agent_id } => {
                // The running invocation cannot be cancelled; its handle is
                // reaped once it returns.
                match self.services.agents.deregister(&agent_id) {
                    Ok(agent) => {
                        info!(agent_id = %agent_id, status = %agent.status, "planner terminated");
                    }
                    Err(err) => {
                        warn!(agent_id = %agent_id, err = %format!("{err:#}"), "cannot terminate planner");
                    }
                }
            }
            ExecutiveSignal::Unrecognized => {
                self.unrecognized_streak += 1;
                warn!(
                    streak = self.unrecognized_streak,
                    "executive reply carried no signal, continuing"
                );
                if self.unrecognized_streak == UNRECOGNIZED_STREAK_NOTE {
                    self.services.progress.note(&format!(
                        "executive gave no recognizable decision {UNRECOGNIZED_STREAK_NOTE} times in a row; the run may be stalled"
                    ))?;
                }
            }
        }
        Ok(None)
    }

    /// Run `n` worker units concurrently and wait for all of them.
    fn fan_out(&self, n: usize) {
        info!(workers = n, "fanning out workers");
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..n)
                .map(|_| scope.spawn(|| run_worker(&self.services)))
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });
        for result in results {
            match result {
                Ok(Ok(WorkerOutcome::Idle)) => debug!("worker idle"),
                Ok(Ok(outcome)) => info!(outcome = ?outcome, "worker finished"),
                Ok(Err(err)) => error!(err = %format!("{err:#}"), "worker failed"),
                Err(_) => error!("worker thread panicked"),
            }
        }
    }

    fn plan_now(&self) {
        match run_planner(&self.services, None) {
            Ok(signal) => info!(signal = ?signal, "planning pass finished"),
            Err(err) => warn!(err = %format!("{err:#}"), "planning pass failed"),
        }
    }

    /// Join planners that finished. With `wait`, join every planner.
    fn reap_planners(&mut self, wait: bool) {
        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.planners)
            .into_iter()
            .partition(|p| wait || p.is_finished());
        self.planners = running;
        for planner in done {
            let agent_id = planner.agent_id.clone();
            match planner.join() {
                Ok(signal) => info!(agent_id = %agent_id, signal = ?signal, "planner reaped"),
                Err(err) => warn!(agent_id = %agent_id, err = %format!("{err:#}"), "planner failed"),
            }
        }
    }

    fn sweep(&self) {
        match self
            .services
            .agents
            .cleanup(self.config.stale_timeout, self.services.tasks.as_ref())
        {
            Ok(stale) if stale.is_empty() => debug!("no stale agents"),
            Ok(stale) => warn!(count = stale.len(), "recovered stale agents"),
            Err(err) => error!(err = %format!("{err:#}"), "staleness sweep failed"),
        }
    }

    fn finish(mut self, cycles_run: u32, stop: RunStop) -> Result<RunOutcome> {
        if !self.planners.is_empty() {
            info!(planners = self.planners.len(), "waiting for background planners before exit");
            self.reap_planners(true);
        }
        let tasks = self.services.tasks.counts()?;
        self.services.progress.note(&format!(
            "run ended after {cycles_run} cycles: {} ({tasks})",
            stop.describe()
        ))?;
        info!(cycles_run, stop = ?stop, %tasks, "run finished");
        Ok(RunOutcome {
            cycles_run,
            stop,
            tasks,
        })
    }
}
