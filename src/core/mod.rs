//! Vocabulary shared by every layer: verdicts, errors, text helpers.

pub mod error;
pub mod utils;
pub mod verdict;

pub use error::{JudgeError, Result};
pub use verdict::{CaseResult, CheckerResult, ResultFlags, StderrReport, Verdict};
