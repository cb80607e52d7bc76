//! Result model: verdict flags and their derivation from a sandboxed run.
//!
//! Every flag a submission ends up with is assigned here, either by
//! [`derive`] from a [`RunOutcome`] or by merging a comparison or checker
//! answer into an existing [`CaseResult`].

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::ops::BitOr;

use nix::sys::signal::Signal;

use crate::engine::sandbox::{LimitKind, RunLimits, RunOutcome};

/// Set of result flags. An empty set means accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ResultFlags(u16);

impl ResultFlags {
    pub const AC: Self = Self(0);
    pub const WA: Self = Self(1 << 0);
    pub const PE: Self = Self(1 << 1);
    pub const RE: Self = Self(1 << 2);
    pub const TLE: Self = Self(1 << 3);
    pub const MLE: Self = Self(1 << 4);
    pub const IR: Self = Self(1 << 5);
    pub const OLE: Self = Self(1 << 6);
    pub const IE: Self = Self(1 << 7);

    /// Flags ordered from most to least severe, with their short codes.
    const PRIORITY: [(Self, &'static str); 8] = [
        (Self::IE, "IE"),
        (Self::TLE, "TLE"),
        (Self::MLE, "MLE"),
        (Self::OLE, "OLE"),
        (Self::RE, "RE"),
        (Self::IR, "IR"),
        (Self::PE, "PE"),
        (Self::WA, "WA"),
    ];

    pub fn is_accepted(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Short codes of every flag in the set, most severe first.
    pub fn codes(self) -> Vec<&'static str> {
        if self.is_accepted() {
            return vec!["AC"];
        }
        Self::PRIORITY
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, code)| *code)
            .collect()
    }

    /// The single verdict shown for this flag set.
    pub fn verdict(self) -> Verdict {
        let top = Self::PRIORITY
            .iter()
            .map(|(flag, _)| *flag)
            .find(|flag| self.contains(*flag));

        match top {
            None => Verdict::Accepted,
            Some(Self::IE) => Verdict::SystemError,
            Some(Self::TLE) => Verdict::TimeLimitExceeded,
            Some(Self::MLE) => Verdict::MemoryLimitExceeded,
            Some(Self::OLE) => Verdict::OutputLimitExceeded,
            Some(Self::RE) | Some(Self::IR) => Verdict::RuntimeError,
            Some(Self::PE) => Verdict::PresentationError,
            Some(_) => Verdict::WrongAnswer,
        }
    }
}

impl BitOr for ResultFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Serialize for ResultFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.codes())
    }
}

/// Verdict from judging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    PresentationError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    SystemError,
    CompileError,
    Skipped,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::PresentationError => "presentation_error",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
            Verdict::MemoryLimitExceeded => "memory_limit_exceeded",
            Verdict::OutputLimitExceeded => "output_limit_exceeded",
            Verdict::RuntimeError => "runtime_error",
            Verdict::SystemError => "system_error",
            Verdict::CompileError => "compile_error",
            Verdict::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// What a language runtime's standard error says about a crash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StderrReport {
    /// The runtime died because it could not allocate memory.
    pub memory_exhausted: bool,
    /// Short diagnostic for the submitter (e.g. an exception type name).
    pub feedback: Option<String>,
}

/// Per-language inspection of captured standard error after a crash.
pub type StderrInspector = fn(&[u8]) -> StderrReport;

/// Answer of a checker program, already decoded from its exit status.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerResult {
    pub passed: bool,
    pub presentation_error: bool,
    pub points: f64,
    pub feedback: String,
}

/// Outcome of one run (or one test case), never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseResult {
    flags: ResultFlags,
    points: Option<f64>,
    feedback: Option<String>,
    time_ms: u64,
    memory_kb: u64,
}

impl CaseResult {
    pub fn flags(&self) -> ResultFlags {
        self.flags
    }

    pub fn points(&self) -> Option<f64> {
        self.points
    }

    pub fn feedback(&self) -> Option<&str> {
        self.feedback.as_deref()
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    pub fn memory_kb(&self) -> u64 {
        self.memory_kb
    }

    pub fn verdict(&self) -> Verdict {
        self.flags.verdict()
    }

    pub fn is_accepted(&self) -> bool {
        self.flags.is_accepted()
    }

    /// Result for a case whose judging was aborted by a judge-side defect.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            flags: ResultFlags::IE,
            points: Some(0.0),
            feedback: Some(message.into()),
            time_ms: 0,
            memory_kb: 0,
        }
    }

    /// Merge the standard comparator's answer into a clean run.
    pub fn with_comparison(self, matched: bool, point_value: f64) -> Self {
        if !self.is_accepted() {
            return self;
        }
        let (flags, points) = if matched {
            (ResultFlags::AC, point_value)
        } else {
            (ResultFlags::WA, 0.0)
        };
        Self {
            flags,
            points: Some(points),
            ..self
        }
    }

    /// Merge a checker's answer into a clean run.
    pub fn with_checker(self, checker: &CheckerResult) -> Self {
        if !self.is_accepted() {
            return self;
        }
        let flags = match (checker.passed, checker.presentation_error) {
            (true, _) => ResultFlags::AC,
            (false, true) => ResultFlags::WA | ResultFlags::PE,
            (false, false) => ResultFlags::WA,
        };
        let feedback = if checker.feedback.is_empty() {
            None
        } else {
            Some(checker.feedback.clone())
        };
        Self {
            flags,
            points: Some(checker.points),
            feedback,
            ..self
        }
    }
}

/// Derive result flags from a finished run.
///
/// `limits` are the user-facing limits (without grace); exceeding them is a
/// limit verdict even when the sandbox let the process finish inside its
/// grace margin.
pub fn derive(
    outcome: &RunOutcome,
    limits: &RunLimits,
    stderr: &[u8],
    inspector: Option<StderrInspector>,
) -> CaseResult {
    let mut flags = ResultFlags::AC;
    let mut feedback = None;

    match outcome.limit_exceeded {
        Some(LimitKind::CpuTime) | Some(LimitKind::WallTime) => flags = flags | ResultFlags::TLE,
        Some(LimitKind::Memory) => flags = flags | ResultFlags::MLE,
        Some(LimitKind::Output) => flags = flags | ResultFlags::OLE,
        Some(LimitKind::Processes) => {
            flags = flags | ResultFlags::RE;
            feedback = Some("process limit exceeded".to_string());
        }
        None => {}
    }

    if outcome.cpu_time > limits.time {
        flags = flags | ResultFlags::TLE;
    }
    if limits.memory_kb > 0 && outcome.peak_memory_kb > limits.memory_kb {
        flags = flags | ResultFlags::MLE;
    }

    let limited = flags.intersects(ResultFlags::TLE | ResultFlags::MLE | ResultFlags::OLE);

    if let Some(violation) = &outcome.policy_violation {
        flags = flags | ResultFlags::RE;
        feedback = Some(format!("{} syscall disallowed", violation.name));
    } else if let Some(signal) = outcome.signal {
        if !limited {
            flags = flags | ResultFlags::RE;
            feedback.get_or_insert_with(|| signal_name(signal));
        }
    }

    if matches!(outcome.exit_code, Some(code) if code != 0) {
        flags = flags | ResultFlags::IR;
    }

    let crashed = flags.intersects(ResultFlags::RE | ResultFlags::IR);
    if let Some(inspect) = inspector {
        if crashed && !limited {
            let report = inspect(stderr);
            if report.memory_exhausted {
                flags = flags | ResultFlags::MLE;
            }
            if feedback.is_none() {
                feedback = report.feedback;
            }
        }
    }

    CaseResult {
        flags,
        points: None,
        feedback,
        time_ms: outcome.cpu_time.as_millis() as u64,
        memory_kb: outcome.peak_memory_kb,
    }
}

fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {}", signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sandbox::SyscallViolation;
    use std::time::Duration;

    fn limits() -> RunLimits {
        RunLimits::new(Duration::from_secs(1), 65536)
    }

    fn clean_exit(code: i32) -> RunOutcome {
        RunOutcome {
            exit_code: Some(code),
            cpu_time: Duration::from_millis(120),
            peak_memory_kb: 4096,
            ..RunOutcome::default()
        }
    }

    fn gc_inspector(stderr: &[u8]) -> StderrReport {
        StderrReport {
            memory_exhausted: stderr.starts_with(b"oom"),
            feedback: Some("Boom".to_string()),
        }
    }

    #[test]
    fn test_clean_run_is_accepted() {
        let result = derive(&clean_exit(0), &limits(), b"", None);
        assert!(result.is_accepted());
        assert_eq!(result.verdict(), Verdict::Accepted);
        assert_eq!(result.time_ms(), 120);
    }

    #[test]
    fn test_nonzero_exit_is_invalid_return() {
        let result = derive(&clean_exit(3), &limits(), b"", None);
        assert_eq!(result.flags(), ResultFlags::IR);
        assert_eq!(result.verdict(), Verdict::RuntimeError);
    }

    #[test]
    fn test_enforced_kill_maps_to_limit_not_crash() {
        let outcome = RunOutcome {
            signal: Some(9),
            limit_exceeded: Some(LimitKind::WallTime),
            ..RunOutcome::default()
        };
        let result = derive(&outcome, &limits(), b"", None);
        assert_eq!(result.flags(), ResultFlags::TLE);
    }

    #[test]
    fn test_unenforced_signal_is_runtime_error() {
        let outcome = RunOutcome {
            signal: Some(11),
            ..RunOutcome::default()
        };
        let result = derive(&outcome, &limits(), b"", None);
        assert_eq!(result.flags(), ResultFlags::RE);
        assert_eq!(result.feedback(), Some("SIGSEGV"));
    }

    #[test]
    fn test_policy_violation_records_syscall() {
        let outcome = RunOutcome {
            signal: Some(9),
            policy_violation: Some(SyscallViolation {
                id: 57,
                name: "fork".to_string(),
            }),
            ..RunOutcome::default()
        };
        let result = derive(&outcome, &limits(), b"", None);
        assert!(result.flags().contains(ResultFlags::RE));
        assert_eq!(result.feedback(), Some("fork syscall disallowed"));
    }

    #[test]
    fn test_user_limits_checked_after_grace() {
        let outcome = RunOutcome {
            exit_code: Some(0),
            cpu_time: Duration::from_millis(1100),
            peak_memory_kb: 70000,
            ..RunOutcome::default()
        };
        let result = derive(&outcome, &limits(), b"", None);
        assert!(result.flags().contains(ResultFlags::TLE));
        assert!(result.flags().contains(ResultFlags::MLE));
        assert_eq!(result.verdict(), Verdict::TimeLimitExceeded);
    }

    #[test]
    fn test_inspector_reclassifies_crash_as_mle() {
        let result = derive(&clean_exit(1), &limits(), b"oom in gc", Some(gc_inspector));
        assert!(result.flags().contains(ResultFlags::MLE));
        assert_eq!(result.verdict(), Verdict::MemoryLimitExceeded);
        assert_eq!(result.feedback(), Some("Boom"));
    }

    #[test]
    fn test_inspector_ignored_for_clean_run() {
        let result = derive(&clean_exit(0), &limits(), b"oom", Some(gc_inspector));
        assert!(result.is_accepted());
        assert_eq!(result.feedback(), None);
    }

    #[test]
    fn test_checker_merge_presentation_error() {
        let run = derive(&clean_exit(0), &limits(), b"", None);
        let merged = run.with_checker(&CheckerResult {
            passed: false,
            presentation_error: true,
            points: 0.0,
            feedback: "Presentation Error".to_string(),
        });
        assert_eq!(merged.verdict(), Verdict::PresentationError);
        assert_eq!(merged.flags().codes(), vec!["PE", "WA"]);
        assert_eq!(merged.points(), Some(0.0));
        assert_eq!(merged.feedback(), Some("Presentation Error"));
    }

    #[test]
    fn test_checker_not_consulted_after_crash() {
        let run = derive(&clean_exit(2), &limits(), b"", None);
        let merged = run.clone().with_checker(&CheckerResult {
            passed: true,
            presentation_error: false,
            points: 10.0,
            feedback: String::new(),
        });
        assert_eq!(merged, run);
    }

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Accepted.to_string(), "accepted");
        assert_eq!(Verdict::WrongAnswer.to_string(), "wrong_answer");
        assert_eq!(
            Verdict::TimeLimitExceeded.to_string(),
            "time_limit_exceeded"
        );
    }
}
