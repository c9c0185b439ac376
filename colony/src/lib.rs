//! File-backed coordination for a colony of short-lived coding agents.
//!
//! Many independent executor invocations make progress on a shared task graph
//! without a central lock manager. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (eligibility, transitions,
//!   invariants, signal parsing, staleness). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (record stores, lock files, process
//!   execution, prompts, progress log). Isolated behind traits for tests.
//!
//! [`roles`] and [`scheduler`] compose the two into `colony run`.

pub mod agent;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod roles;
pub mod scheduler;
pub mod status;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
