//! C# on Mono
//!
//! Mono handles out-of-memory badly: it often prints an assertion to stderr
//! and exits with status 0. Data-segment grace keeps the eventual failure
//! above the user's limit so the peak-memory check still flags MLE, and the
//! stderr inspector catches the garbage-collector message when it does crash.

use std::sync::OnceLock;

use nix::errno::Errno;
use regex::Regex;

use crate::config::RuntimeTable;
use crate::core::utils::utf8_text;
use crate::core::StderrReport;
use crate::engine::executor::{ExecutorKind, LanguageSpec};
use crate::engine::sandbox::{PolicyFragment, ProcessCeiling};

const ECHO: &str = r#"using System;

class Program {
    static void Main() {
        Console.Write(Console.In.ReadToEnd());
    }
}
"#;

pub static MONOCS: LanguageSpec = LanguageSpec {
    name: "MONOCS",
    aliases: &["CS", "C#"],
    extension: "cs",
    kind: ExecutorKind::Compiled {
        compile: &["{compiler}", "{flags}", "-out:{executable}", "{sources}"],
        executable: "main.exe",
    },
    run: &["{runtime:mono}", "{executable}"],
    runtime: "mcs",
    extra_runtimes: &["mono"],
    flags: &["-optimize+", "-define:ONLINE_JUDGE"],
    env: &[
        // Keeps Mono away from /dev/shm.
        ("MONO_DISABLE_SHARED_AREA", "1"),
        ("MONO_CRASH_NOFILE", "1"),
    ],
    test_program: Some(ECHO),
    fragment,
    inspect_stderr: Some(inspect_stderr),
    ..LanguageSpec::DEFAULT
};

fn fragment(_: &RuntimeTable) -> PolicyFragment {
    PolicyFragment::new()
        .allow("sched_setscheduler")
        .allow("wait4")
        .allow("rt_sigsuspend")
        .allow("msync")
        .allow("fadvise64")
        // Crash dumps fork, and carry on when that fails.
        .fail("fork", Errno::EAGAIN)
        .fs(r"/etc/mono/")
        .memory_grace_kb(65536)
        .address_space_grace_kb(262144)
        .processes(ProcessCeiling::Unlimited)
}

pub fn inspect_stderr(stderr: &[u8]) -> StderrReport {
    const GC_FAILURE: &[u8] = b"Garbage collector could not allocate";
    if stderr.windows(GC_FAILURE.len()).any(|w| w == GC_FAILURE) {
        return StderrReport {
            memory_exhausted: true,
            feedback: None,
        };
    }

    static EXCEPTION: OnceLock<Regex> = OnceLock::new();
    let re = EXCEPTION
        .get_or_init(|| Regex::new(r"\bFATAL UNHANDLED EXCEPTION: (.*?):").expect("static pattern"));
    let text = utf8_text(stderr);
    StderrReport {
        memory_exhausted: false,
        feedback: re
            .captures_iter(&text)
            .last()
            .map(|caps| caps[1].to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::verdict::derive;
    use crate::core::ResultFlags;
    use crate::engine::sandbox::{RunLimits, RunOutcome};

    #[test]
    fn test_gc_failure_is_memory_exhaustion() {
        let report = inspect_stderr(b"* Assertion: should not be reached\nError: Garbage collector could not allocate 16384 bytes of memory for major heap section.\n");
        assert!(report.memory_exhausted);
        assert_eq!(report.feedback, None);
    }

    #[test]
    fn test_last_unhandled_exception_wins() {
        let stderr = b"[ERROR] FATAL UNHANDLED EXCEPTION: System.FormatException: bad\n\
                       [ERROR] FATAL UNHANDLED EXCEPTION: System.IndexOutOfRangeException: Index was outside\n";
        let report = inspect_stderr(stderr);
        assert!(!report.memory_exhausted);
        assert_eq!(report.feedback.as_deref(), Some("System.IndexOutOfRangeException"));
    }

    #[test]
    fn test_nothing_recognised() {
        let report = inspect_stderr(b"Segmentation fault\n");
        assert_eq!(report, StderrReport::default());
    }

    #[test]
    fn test_crash_reclassified_as_mle() {
        let outcome = RunOutcome {
            exit_code: Some(1),
            peak_memory_kb: 1024,
            ..RunOutcome::default()
        };
        let result = derive(
            &outcome,
            &RunLimits::default(),
            b"Garbage collector could not allocate 4096 bytes",
            Some(inspect_stderr),
        );
        assert!(result.flags().contains(ResultFlags::MLE));
    }
}
