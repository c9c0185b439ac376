//! The periodic strategic check.

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::agent::AgentType;
use crate::core::signal::{ExecutiveSignal, parse_executive_signal};
use crate::io::prompt::StateView;
use crate::roles::Services;

/// Run one executive invocation and return its decision.
///
/// An executor failure is logged and reported as `Unrecognized`: a flaky
/// supervisor must not end the run. Store failures propagate.
#[instrument(skip(services))]
pub fn run_executive(services: &Services, cycle: u32, max_cycles: u32) -> Result<ExecutiveSignal> {
    let agent = services
        .agents
        .register_next(AgentType::Executive, None)
        .context("register executive")?;
    let result = decide(services, &agent.id, cycle, max_cycles);
    if let Err(err) = services.agents.deregister(&agent.id) {
        warn!(agent_id = %agent.id, err = %format!("{err:#}"), "failed to deregister executive");
    }
    result
}

fn decide(
    services: &Services,
    agent_id: &str,
    cycle: u32,
    max_cycles: u32,
) -> Result<ExecutiveSignal> {
    let state = StateView::capture(
        &services.settings.goal,
        &services.settings.workdir,
        services.tasks.as_ref(),
        services.agents.as_ref(),
    )?;
    let context = services
        .prompts
        .render_executive(&state, cycle, max_cycles)?;
    let request = services.request(agent_id, AgentType::Executive, None, context);
    let signal = match services.executor.exec(&request) {
        Ok(text) => parse_executive_signal(&text),
        Err(err) => {
            warn!(agent_id, err = %format!("{err:#}"), "executive invocation failed");
            ExecutiveSignal::Unrecognized
        }
    };
    info!(agent_id, signal = ?signal, "executive decided");
    Ok(signal)
}
