//! Grading loop
//!
//! Runs a prepared submission against a problem's test cases in order and
//! merges each run's verdict with the standard comparator or the problem's
//! checker. Grading stops at the first case that is not accepted; the
//! remaining cases are reported as skipped.

use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checker::{CheckerBridge, CheckerConfig};
use crate::core::{CaseResult, JudgeError, Result, Verdict};
use crate::engine::executor::ExecutorInstance;
use crate::engine::sandbox::{RunLimits, Stdin};

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub id: String,
    pub input: Vec<u8>,
    pub expected: Vec<u8>,
    pub points: f64,
}

/// Checker to consult instead of the standard comparator.
#[derive(Clone, Copy)]
pub struct CheckerRef<'a> {
    pub bridge: &'a CheckerBridge,
    pub config: &'a CheckerConfig,
    pub problem_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    pub case_id: String,
    pub verdict: Verdict,
    /// Absent for skipped cases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CaseResult>,
}

/// Grade `instance` on `cases`. A broken checker aborts grading with an
/// internal error instead of producing a verdict.
pub async fn grade(
    instance: &ExecutorInstance,
    cases: &[TestCase],
    limits: &RunLimits,
    checker: Option<CheckerRef<'_>>,
) -> Result<Vec<CaseReport>> {
    let mut reports = Vec::with_capacity(cases.len());

    for case in cases {
        let output = instance
            .launch(&[], limits.clone(), Stdin::Bytes(case.input.clone()))
            .await?;
        let run = instance.classify(&output, limits);

        let result = if !run.is_accepted() {
            run
        } else if let Some(checker) = checker {
            let answer = checker
                .bridge
                .check(
                    &output.stdout,
                    &case.expected,
                    &case.input,
                    checker.config,
                    checker.problem_id,
                    case.points,
                )
                .await
                .map_err(|e| match e {
                    JudgeError::Compile(message) => {
                        JudgeError::internal(format!("Checker failed to compile: {}", message))
                    }
                    other => other,
                })?;
            run.with_checker(&answer)
        } else {
            run.with_comparison(compare_output(&output.stdout, &case.expected), case.points)
        };

        debug!(
            case = %case.id,
            verdict = %result.verdict(),
            time_ms = result.time_ms(),
            memory_kb = result.memory_kb(),
            "Case finished"
        );
        let accepted = result.is_accepted();
        reports.push(CaseReport {
            case_id: case.id.clone(),
            verdict: result.verdict(),
            result: Some(result),
        });
        if !accepted {
            break;
        }
    }

    for case in &cases[reports.len()..] {
        reports.push(CaseReport {
            case_id: case.id.clone(),
            verdict: Verdict::Skipped,
            result: None,
        });
    }

    info!(
        language = instance.descriptor().name(),
        verdict = %overall(&reports),
        cases = cases.len(),
        "Grading finished"
    );
    Ok(reports)
}

/// First verdict that is not accepted, or accepted when every case passed.
pub fn overall(reports: &[CaseReport]) -> Verdict {
    reports
        .iter()
        .map(|r| r.verdict.clone())
        .find(|v| *v != Verdict::Accepted)
        .unwrap_or(Verdict::Accepted)
}

/// Equality ignoring trailing whitespace on each line and trailing blank
/// lines.
pub fn compare_output(actual: &[u8], expected: &[u8]) -> bool {
    fn normalize(bytes: &[u8]) -> Vec<&[u8]> {
        let mut lines: Vec<&[u8]> = bytes.split(|&b| b == b'\n').map(|l| l.trim_ascii_end()).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
    }
    normalize(actual) == normalize(expected)
}

/// Load `<name>.in`/`<name>.out` pairs from `dir`, sorted by name. Every
/// case is worth `points`.
pub fn load_cases(dir: &Path, points: f64) -> anyhow::Result<Vec<TestCase>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "in") {
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().into_owned());
            }
        }
    }
    names.sort();

    let mut cases = Vec::with_capacity(names.len());
    for name in names {
        let input_path = dir.join(format!("{}.in", name));
        let output_path = dir.join(format!("{}.out", name));
        if !output_path.exists() {
            warn!("Skipping {}: no matching .out file", input_path.display());
            continue;
        }
        cases.push(TestCase {
            input: std::fs::read(&input_path)
                .with_context(|| format!("Failed to read testcase input: {}", input_path.display()))?,
            expected: std::fs::read(&output_path)
                .with_context(|| format!("Failed to read testcase output: {}", output_path.display()))?,
            id: name,
            points,
        });
    }
    Ok(cases)
}
