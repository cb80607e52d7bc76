//! Error taxonomy shared by the executor, checker and grader layers.
//!
//! Policy violations and resource-limit kills are *not* errors: they come back
//! as flags on a [`CaseResult`](crate::core::verdict::CaseResult).

use thiserror::Error;

use crate::engine::sandbox::SandboxError;

#[derive(Debug, Error)]
pub enum JudgeError {
    /// Source was rejected before or during compilation. The message is safe
    /// to show to the submitter (control sequences already removed).
    #[error("compile error: {0}")]
    Compile(String),

    /// Operator or problem-author defect: broken checker, unknown language,
    /// unreadable files. Never reported as a submission verdict.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl JudgeError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile(crate::core::utils::strip_ansi(&message.into()))
    }

    pub fn is_internal(&self) -> bool {
        !matches!(self, Self::Compile(_))
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;
