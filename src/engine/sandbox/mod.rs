//! Sandbox: spawns and supervises untrusted processes.
//!
//! On Linux x86-64 the supervisor is ptrace-based ([`tracer`]). Other hosts
//! get a [`Sandbox`] whose every run fails with [`SandboxError::Unsupported`].

pub mod config;
pub mod outcome;
pub mod policy;
pub mod syscalls;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod tracer;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use config::{get_config, init_config, SandboxConfig};
pub use outcome::{
    LimitKind, ProcessOutput, RunLimits, RunOutcome, RunRequest, Stdin, SyscallViolation,
};
pub use policy::{PolicyFragment, ProcessCeiling, ResourcePolicy, SyscallRule};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use tracer::{kill_all, Sandbox};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn sandboxed process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ptrace failure: {0}")]
    Trace(#[from] nix::errno::Errno),

    #[error("sandboxing is not supported on this host")]
    Unsupported,

    #[error("invalid run request: {0}")]
    InvalidArgument(String),

    #[error("unknown syscall {0:?}")]
    UnknownSyscall(String),

    #[error("invalid filesystem pattern {0}")]
    InvalidPattern(String),

    #[error("sandbox worker failed: {0}")]
    Worker(String),
}

/// Something that can execute a [`RunRequest`] under a policy.
///
/// The checker bridge and executors only see this trait, so tests can swap
/// in a fake.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn execute(
        &self,
        request: RunRequest,
        policy: Arc<ResourcePolicy>,
    ) -> Result<ProcessOutput, SandboxError>;
}

#[async_trait]
impl Runner for Sandbox {
    async fn execute(
        &self,
        request: RunRequest,
        policy: Arc<ResourcePolicy>,
    ) -> Result<ProcessOutput, SandboxError> {
        let sandbox = self.clone();
        tokio::task::spawn_blocking(move || sandbox.run_blocking(&request, &policy))
            .await
            .map_err(|e| SandboxError::Worker(e.to_string()))?
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod unsupported {
    use super::{ProcessOutput, ResourcePolicy, RunRequest, SandboxError};

    #[derive(Debug, Clone, Default)]
    pub struct Sandbox;

    impl Sandbox {
        pub fn new() -> Self {
            Self
        }

        pub fn run_blocking(
            &self,
            _request: &RunRequest,
            _policy: &ResourcePolicy,
        ) -> Result<ProcessOutput, SandboxError> {
            Err(SandboxError::Unsupported)
        }
    }

    pub fn kill_all() -> usize {
        0
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub use unsupported::{kill_all, Sandbox};
