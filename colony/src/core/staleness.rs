//! Heartbeat staleness rule.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::agent::Agent;

/// True if `now - last_heartbeat` exceeds `timeout`.
///
/// A heartbeat from the future (clock skew between processes) is never stale.
pub fn heartbeat_expired(
    last_heartbeat: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(last_heartbeat) > timeout
}

/// Active agents whose heartbeat has expired.
pub fn is_stale(agent: &Agent, now: DateTime<Utc>, timeout: Duration) -> bool {
    agent.is_active() && heartbeat_expired(agent.last_heartbeat, now, timeout)
}
