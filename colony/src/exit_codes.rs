//! Stable exit codes for colony CLI commands.

/// Run reached its goals, or a non-run command succeeded.
pub const SUCCESS: i32 = 0;
/// `colony run` used up `max_cycles` without a terminal decision.
pub const BUDGET_EXHAUSTED: i32 = 1;
/// The executive declared the colony stuck.
pub const STUCK: i32 = 2;
/// Invalid config, invalid input, or a runtime error.
pub const INVALID: i32 = 3;
