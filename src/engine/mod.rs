//! Execution engine: the ptrace sandbox and the executors built on it.

pub mod executor;
pub mod sandbox;
