//! Sandboxed execution and verdict core for a programming-contest judge.
//!
//! - [`engine::sandbox`] runs one untrusted process under a syscall and
//!   filesystem policy with resource limits.
//! - [`engine::executor`] and [`languages`] turn source files into
//!   launchable programs.
//! - [`checker`] delegates answer checking to problem-supplied programs.
//! - [`grader`] runs test cases and merges the verdicts.

pub mod checker;
pub mod config;
pub mod core;
pub mod engine;
pub mod grader;
pub mod languages;
