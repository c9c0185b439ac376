//! Planning passes: synchronous (initial breakdown) or tracked background threads.

use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::agent::{Agent, AgentType};
use crate::core::signal::{PlannerSignal, parse_planner_signal};
use crate::io::prompt::StateView;
use crate::roles::Services;

/// Run a planning pass on the calling thread.
#[instrument(skip(services))]
pub fn run_planner(services: &Services, area: Option<&str>) -> Result<PlannerSignal> {
    let agent = services
        .agents
        .register_next(AgentType::Planner, area)
        .context("register planner")?;
    plan_as(services, &agent)
}

/// A planner running on its own thread.
#[derive(Debug)]
pub struct PlannerHandle {
    pub agent_id: String,
    pub area: String,
    handle: JoinHandle<Result<PlannerSignal>>,
}

impl PlannerHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the planner thread and return its result.
    pub fn join(self) -> Result<PlannerSignal> {
        self.handle
            .join()
            .map_err(|_| anyhow!("planner thread {} panicked", self.agent_id))?
    }
}

/// Start a planner for `area` on a named thread.
///
/// The identity is registered before the thread starts so the executive can
/// address it (`TERMINATE_PLANNER:<id>`) right away.
pub fn spawn_planner(services: &Services, area: &str) -> Result<PlannerHandle> {
    let agent = services
        .agents
        .register_next(AgentType::Planner, Some(area))
        .context("register planner")?;
    let agent_id = agent.id.clone();
    let thread_services = services.clone();
    let handle = thread::Builder::new()
        .name(agent_id.clone())
        .spawn(move || plan_as(&thread_services, &agent))
        .with_context(|| format!("spawn planner thread {agent_id}"))?;
    info!(agent_id = %agent_id, area, "planner started");
    Ok(PlannerHandle {
        agent_id,
        area: area.to_string(),
        handle,
    })
}

fn plan_as(services: &Services, agent: &Agent) -> Result<PlannerSignal> {
    let result = plan(services, agent);
    if let Err(err) = services.agents.deregister(&agent.id) {
        warn!(agent_id = %agent.id, err = %format!("{err:#}"), "failed to deregister planner");
    }
    result
}

fn plan(services: &Services, agent: &Agent) -> Result<PlannerSignal> {
    let state = StateView::capture(
        &services.settings.goal,
        &services.settings.workdir,
        services.tasks.as_ref(),
        services.agents.as_ref(),
    )?;
    let context = services
        .prompts
        .render_planner(&state, agent.area.as_deref())?;
    let request = services.request(&agent.id, AgentType::Planner, None, context);
    let text = services
        .executor
        .exec(&request)
        .with_context(|| format!("planner {} invocation", agent.id))?;

    let signal = parse_planner_signal(&text);
    match &signal {
        PlannerSignal::NeedClarification { question } => {
            warn!(agent_id = %agent.id, question = %question, "planner needs clarification");
            services.progress.clarification(&agent.id, question)?;
        }
        PlannerSignal::Unrecognized => {
            warn!(agent_id = %agent.id, "planner output carried no signal");
        }
        PlannerSignal::PlanningDone | PlannerSignal::AreaComplete => {
            info!(agent_id = %agent.id, signal = ?signal, "planner finished");
        }
    }
    Ok(signal)
}
