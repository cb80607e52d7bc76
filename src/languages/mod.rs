//! Language catalog
//!
//! Maps executor names (and aliases) to descriptors resolved against the
//! host's runtimes. Languages whose runtime is missing are left out.

pub mod c_family;
pub mod go;
pub mod mono;
pub mod python;
pub mod ruby;

use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RuntimeTable;
use crate::core::utils::utf8_text;
use crate::core::{JudgeError, Result};
use crate::engine::executor::{
    ExecutorConfig, ExecutorDescriptor, ExecutorInstance, LanguageSpec, SourceFile,
};
use crate::engine::sandbox::{RunLimits, Runner, Stdin};

/// Every language this judge knows about.
pub static LANGUAGES: &[&LanguageSpec] = &[
    &c_family::C,
    &c_family::CPP,
    &go::GO,
    &mono::MONOCS,
    &ruby::RUBY,
    &python::PY3,
];

const SELF_TEST_INPUT: &[u8] = b"echo: Hello, World!\n";

pub struct ExecutorCatalog {
    descriptors: Vec<Arc<ExecutorDescriptor>>,
    runner: Arc<dyn Runner>,
}

impl ExecutorCatalog {
    /// Resolve every known language against `runtimes`.
    pub fn load(runtimes: &RuntimeTable, runner: Arc<dyn Runner>) -> Self {
        Self::from_specs(LANGUAGES, runtimes, runner)
    }

    pub fn from_specs(
        specs: &[&'static LanguageSpec],
        runtimes: &RuntimeTable,
        runner: Arc<dyn Runner>,
    ) -> Self {
        let mut descriptors = Vec::new();
        for spec in specs {
            match ExecutorDescriptor::resolve(spec, runtimes) {
                Some(descriptor) => {
                    debug!(language = spec.name, command = %descriptor.command().display(), "Executor available");
                    descriptors.push(Arc::new(descriptor));
                }
                None => debug!(language = spec.name, "Runtime not found, executor disabled"),
            }
        }
        info!("Loaded {} executors", descriptors.len());
        Self {
            descriptors,
            runner,
        }
    }

    /// Look up by name or alias, case-insensitively.
    pub fn get(&self, name: &str) -> Option<Arc<ExecutorDescriptor>> {
        self.descriptors
            .iter()
            .find(|d| d.spec().answers_to(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.iter().map(|d| d.name()).collect()
    }

    pub fn runner(&self) -> Arc<dyn Runner> {
        Arc::clone(&self.runner)
    }

    fn require(&self, name: &str) -> Result<Arc<ExecutorDescriptor>> {
        self.get(name)
            .ok_or_else(|| JudgeError::internal(format!("Could not find an executor for language \"{}\"", name)))
    }

    /// Prepare a single-file submission.
    pub async fn prepare(
        &self,
        name: &str,
        source: &[u8],
        config: &ExecutorConfig,
    ) -> Result<ExecutorInstance> {
        let descriptor = self.require(name)?;
        let file = SourceFile::new(descriptor.source_name(), source);
        ExecutorInstance::prepare(descriptor, vec![file], config, self.runner()).await
    }

    /// First line the runtime prints for its version flags. Runs outside
    /// the sandbox: the runtime is trusted and nothing judges the output.
    pub async fn version(&self, name: &str) -> Result<String> {
        let descriptor = self.require(name)?;
        let output = Command::new(descriptor.command())
            .args(descriptor.version_args())
            .output()
            .await?;

        let text = if output.stdout.is_empty() {
            utf8_text(&output.stderr)
        } else {
            utf8_text(&output.stdout)
        };
        text.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| JudgeError::internal(format!("{} printed no version", descriptor.name())))
    }

    /// Build and run the language's echo program. `Ok(false)` means it ran
    /// but misbehaved; compile failures surface as errors.
    pub async fn self_test(&self, name: &str) -> Result<bool> {
        let descriptor = self.require(name)?;
        let Some(program) = descriptor.test_program() else {
            warn!(language = descriptor.name(), "No self-test program");
            return Ok(false);
        };

        let instance = self
            .prepare(name, program.as_bytes(), &ExecutorConfig::default())
            .await?;
        let limits = RunLimits::default();
        let output = instance
            .launch(&[], limits.clone(), Stdin::Bytes(SELF_TEST_INPUT.to_vec()))
            .await?;
        let result = instance.classify(&output, &limits);

        let passed = result.is_accepted() && output.stdout == SELF_TEST_INPUT;
        if !passed {
            warn!(
                language = descriptor.name(),
                verdict = %result.verdict(),
                stdout = %utf8_text(&output.stdout),
                stderr = %utf8_text(&output.stderr),
                "Self-test failed"
            );
        }
        Ok(passed)
    }
}
