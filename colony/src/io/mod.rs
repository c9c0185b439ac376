//! Side-effecting layer: records on disk, child processes, prompts.

pub mod agent_registry;
pub mod atomic;
pub mod config;
pub mod executor;
pub mod init;
pub mod memory;
pub mod process;
pub mod progress_log;
pub mod prompt;
pub mod record_lock;
pub mod task_store;
