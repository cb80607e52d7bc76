//! Request and outcome types for one sandboxed run.

use std::path::PathBuf;
use std::time::Duration;

/// User-facing resource limits, before any grace is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    pub time: Duration,
    /// Memory limit in KB (0 disables the memory ceiling)
    pub memory_kb: u64,
}

impl RunLimits {
    pub fn new(time: Duration, memory_kb: u64) -> Self {
        Self { time, memory_kb }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(1),
            memory_kb: 262144,
        }
    }
}

/// Where the child's standard input comes from.
#[derive(Debug, Clone, Default)]
pub enum Stdin {
    #[default]
    Null,
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// One invocation; built fresh for every run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// argv[0] must be an absolute path; no PATH search happens in the child.
    pub argv: Vec<String>,
    /// Complete environment of the child (nothing is inherited)
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub stdin: Stdin,
    pub limits: RunLimits,
}

impl RunRequest {
    pub fn new(argv: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            env: Vec::new(),
            cwd: cwd.into(),
            stdin: Stdin::Null,
            limits: RunLimits::default(),
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env = env.into_iter().collect();
        self
    }

    pub fn with_stdin(mut self, stdin: Stdin) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Ceiling that caused the sandbox to stop the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    CpuTime,
    WallTime,
    Memory,
    Output,
    Processes,
}

/// Syscall that was not granted by the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallViolation {
    pub id: i64,
    pub name: String,
}

/// Raw result of one sandboxed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub peak_memory_kb: u64,
    pub policy_violation: Option<SyscallViolation>,
    pub limit_exceeded: Option<LimitKind>,
}

impl RunOutcome {
    /// Exited normally with status 0 and no ceiling or policy involvement.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && self.policy_violation.is_none() && self.limit_exceeded.is_none()
    }
}

/// Outcome plus everything the child wrote.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub outcome: RunOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}
