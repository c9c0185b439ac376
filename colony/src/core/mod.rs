//! Deterministic, pure logic shared by the stores and the scheduler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests.

pub mod eligibility;
pub mod invariants;
pub mod signal;
pub mod staleness;
pub mod transitions;
