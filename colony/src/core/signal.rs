//! Signal tokens extracted from free-form executor output.
//!
//! Executor output is untrusted text. Each parser looks for its role's tokens
//! anywhere in the text; when several appear, the last one wins (agents tend
//! to restate the protocol before answering). The executive's bare decision
//! words only count on a line of their own, so prose like "not yet COMPLETE"
//! is not a decision. No token at all maps to `Unrecognized`, which callers
//! must handle explicitly.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSignal {
    Complete { task_id: String },
    Failed { task_id: String, reason: String },
    NoTasks,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutiveSignal {
    Continue,
    Complete,
    Stuck,
    SpawnPlanner { area: String },
    TerminatePlanner { agent_id: String },
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerSignal {
    PlanningDone,
    AreaComplete,
    NeedClarification { question: String },
    Unrecognized,
}

static WORKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:TASK_COMPLETE:(?P<done>[A-Za-z0-9][\w.-]*)|TASK_FAILED:(?P<failed>[A-Za-z0-9][\w.-]*):(?P<reason>[^\r\n]*)|(?P<none>NO_TASKS)\b)",
    )
    .expect("worker signal regex")
});

static EXECUTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)\b(?:SPAWN_PLANNER:(?P<area>[\w./-]+)|TERMINATE_PLANNER:(?P<agent>[\w.-]+))|^[ \t]*(?P<word>CONTINUE|COMPLETE|STUCK)[ \t]*\.?[ \t]*\r?$",
    )
    .expect("executive signal regex")
});

static PLANNER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:NEED_CLARIFICATION:(?P<question>[^\r\n]+)|(?P<word>PLANNING_DONE|AREA_COMPLETE)\b)",
    )
    .expect("planner signal regex")
});

pub fn parse_worker_signal(text: &str) -> WorkerSignal {
    let Some(caps) = WORKER_RE.captures_iter(text).last() else {
        return WorkerSignal::Unrecognized;
    };
    if let Some(id) = caps.name("done") {
        return WorkerSignal::Complete {
            task_id: trim_token(id.as_str()),
        };
    }
    if let Some(id) = caps.name("failed") {
        let reason = caps
            .name("reason")
            .map(|m| m.as_str().trim())
            .filter(|r| !r.is_empty())
            .unwrap_or("no reason given");
        return WorkerSignal::Failed {
            task_id: id.as_str().to_string(),
            reason: reason.to_string(),
        };
    }
    if caps.name("none").is_some() {
        return WorkerSignal::NoTasks;
    }
    WorkerSignal::Unrecognized
}

pub fn parse_executive_signal(text: &str) -> ExecutiveSignal {
    let Some(caps) = EXECUTIVE_RE.captures_iter(text).last() else {
        return ExecutiveSignal::Unrecognized;
    };
    if let Some(area) = caps.name("area") {
        return ExecutiveSignal::SpawnPlanner {
            area: trim_token(area.as_str()),
        };
    }
    if let Some(agent) = caps.name("agent") {
        return ExecutiveSignal::TerminatePlanner {
            agent_id: trim_token(agent.as_str()),
        };
    }
    match caps.name("word").map(|m| m.as_str()) {
        Some("CONTINUE") => ExecutiveSignal::Continue,
        Some("COMPLETE") => ExecutiveSignal::Complete,
        Some("STUCK") => ExecutiveSignal::Stuck,
        _ => ExecutiveSignal::Unrecognized,
    }
}

pub fn parse_planner_signal(text: &str) -> PlannerSignal {
    let Some(caps) = PLANNER_RE.captures_iter(text).last() else {
        return PlannerSignal::Unrecognized;
    };
    if let Some(question) = caps.name("question") {
        let question = question.as_str().trim();
        if !question.is_empty() {
            return PlannerSignal::NeedClarification {
                question: question.to_string(),
            };
        }
    }
    match caps.name("word").map(|m| m.as_str()) {
        Some("PLANNING_DONE") => PlannerSignal::PlanningDone,
        Some("AREA_COMPLETE") => PlannerSignal::AreaComplete,
        _ => PlannerSignal::Unrecognized,
    }
}

/// Drop sentence punctuation glued to a token (`TASK_COMPLETE:T-1.`).
fn trim_token(raw: &str) -> String {
    raw.trim_end_matches('.').to_string()
}
