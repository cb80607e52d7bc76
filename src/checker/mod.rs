//! Checker bridge
//!
//! Delegates the correctness decision for a test case to a problem-supplied
//! checker program. The checker is built once per configuration (see
//! [`cache`]) and launched with three file arguments:
//! `<judge_input> <submission_output> <expected_output>`.

pub mod cache;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::JudgeEnv;
use crate::core::utils::{preview, utf8_text};
use crate::core::{CheckerResult, JudgeError, Result};
use crate::engine::executor::{ExecutorConfig, ExecutorInstance, SourceFile};
use crate::engine::sandbox::policy::dir_pattern;
use crate::engine::sandbox::{PolicyFragment, ProcessOutput, RunLimits, Stdin};
use crate::languages::c_family::is_c_family_source;
use crate::languages::ExecutorCatalog;
use cache::KeyedCache;

/// testlib.h exit codes. Checkers in the wild depend on these exact values.
mod exit_codes {
    pub const OK: i32 = 0;
    pub const WRONG_ANSWER: i32 = 1;
    pub const PRESENTATION_ERROR: i32 = 2;
    pub const FAIL: i32 = 3;
}

#[cfg(unix)]
const HOST_DEFINES: &[&str] = &["-DLINUX_JUDGE"];
#[cfg(windows)]
const HOST_DEFINES: &[&str] = &["-DWINDOWS_JUDGE", "-DWIN32"];

/// `files` may be a single name or a list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FileList {
    One(String),
    Many(Vec<String>),
}

impl FileList {
    fn into_vec(self) -> Vec<String> {
        match self {
            FileList::One(name) => vec![name],
            FileList::Many(names) => names,
        }
    }
}

/// Checker options as written in a problem's configuration. Times are in
/// milliseconds, memory in KB.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CheckerSettings {
    pub files: Option<FileList>,
    pub lang: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    pub time_limit: Option<u64>,
    pub memory_limit: Option<u64>,
    pub compiler_time_limit: Option<u64>,
    pub feedback: Option<bool>,
}

/// Checker configuration with every default filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerConfig {
    pub files: Vec<String>,
    pub lang: String,
    pub flags: Vec<String>,
    pub time_limit: Duration,
    pub memory_limit_kb: u64,
    pub compiler_time_limit: Duration,
    pub feedback: bool,
}

impl CheckerConfig {
    pub fn resolve(settings: &CheckerSettings, env: &JudgeEnv) -> Result<Self> {
        let files = settings
            .files
            .clone()
            .map(FileList::into_vec)
            .filter(|files| !files.is_empty())
            .ok_or_else(|| JudgeError::internal("No checker file[s] specified!"))?;
        let lang = settings
            .lang
            .clone()
            .ok_or_else(|| JudgeError::internal("Language not specified for checker!"))?;

        Ok(Self {
            files,
            lang,
            flags: settings.flags.clone(),
            time_limit: settings
                .time_limit
                .map(Duration::from_millis)
                .unwrap_or(env.generator_time_limit),
            memory_limit_kb: settings.memory_limit.unwrap_or(env.generator_memory_limit_kb),
            compiler_time_limit: settings
                .compiler_time_limit
                .map(Duration::from_millis)
                .unwrap_or(env.compiler_time_limit),
            feedback: settings.feedback.unwrap_or(true),
        })
    }
}

/// Identity of a built checker: language, flags, and every source's name
/// and content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckerKey {
    lang: String,
    flags: Vec<String>,
    sources: Vec<(String, [u8; 32])>,
}

impl CheckerKey {
    fn new(lang: &str, flags: &[String], sources: &[SourceFile]) -> Self {
        Self {
            lang: lang.to_string(),
            flags: flags.to_vec(),
            sources: sources
                .iter()
                .map(|s| (s.name.clone(), Sha256::digest(&s.content).into()))
                .collect(),
        }
    }
}

/// The three argument files, deleted when dropped.
struct CheckerFiles {
    input: NamedTempFile,
    output: NamedTempFile,
    expected: NamedTempFile,
}

impl CheckerFiles {
    fn create(judge_input: &[u8], submission_output: &[u8], expected_output: &[u8]) -> Result<Self> {
        let dir = temp_root();
        Ok(Self {
            input: temp_with(&dir, judge_input)?,
            output: temp_with(&dir, submission_output)?,
            expected: temp_with(&dir, expected_output)?,
        })
    }

    fn args(&self) -> Vec<String> {
        [&self.input, &self.output, &self.expected]
            .iter()
            .map(|f| f.path().display().to_string())
            .collect()
    }
}

/// The temp directory with symlinks resolved, as the checker's allow-list
/// sees it.
fn temp_root() -> PathBuf {
    let temp = std::env::temp_dir();
    std::fs::canonicalize(&temp).unwrap_or(temp)
}

fn temp_with(dir: &Path, data: &[u8]) -> Result<NamedTempFile> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    // Readable by the checker even when it runs as the sandbox user.
    let mut file = tempfile::Builder::new()
        .prefix("judgebox_chk")
        .permissions(std::fs::Permissions::from_mode(0o644))
        .tempfile_in(dir)?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}

/// Builds, caches and runs checkers for a judging session.
pub struct CheckerBridge {
    catalog: Arc<ExecutorCatalog>,
    env: Arc<JudgeEnv>,
    cache: KeyedCache<CheckerKey, ExecutorInstance>,
}

impl CheckerBridge {
    pub fn new(catalog: Arc<ExecutorCatalog>, env: Arc<JudgeEnv>) -> Self {
        Self {
            catalog,
            env,
            cache: KeyedCache::new(),
        }
    }

    /// Number of distinct checkers built so far.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Resolve the checker executor for `config`, building it at most once
    /// per distinct configuration.
    pub async fn executor(&self, config: &CheckerConfig, problem_id: &str) -> Result<Arc<ExecutorInstance>> {
        let root = self.env.problem_dir(problem_id);
        let mut sources = Vec::with_capacity(config.files.len());
        for file in &config.files {
            let path = root.join(file);
            let content = tokio::fs::read(&path).await.map_err(|e| {
                warn!("Failed to read checker source {}: {}", path.display(), e);
                JudgeError::internal("Could not read checker source!")
            })?;
            let name = Path::new(file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.clone());
            sources.push(SourceFile::new(name, content));
        }

        let use_c_family = config.files.iter().any(|f| is_c_family_source(f));
        let descriptor = self.catalog.get(&config.lang).ok_or_else(|| {
            JudgeError::internal(format!("Could not find an executor for language \"{}\"", config.lang))
        })?;
        if !use_c_family && sources.len() > 1 {
            return Err(JudgeError::internal("non-C/C++ checker cannot be multi-file"));
        }

        // A new list every time; the descriptor's defaults are never touched.
        let mut flags = config.flags.clone();
        if matches!(descriptor.extension(), "c" | "cpp") {
            flags.extend(HOST_DEFINES.iter().map(|d| d.to_string()));
        }
        flags.extend(descriptor.default_flags());

        let temp = temp_root();
        let exec_config = ExecutorConfig {
            flags: Some(flags.clone()),
            compiler_time_limit: Some(config.compiler_time_limit),
            deployment: PolicyFragment::new().fs(dir_pattern(&temp)),
            cached: use_c_family,
        };

        let key = CheckerKey::new(descriptor.name(), &flags, &sources);
        let runner = self.catalog.runner();
        self.cache
            .get_or_build(key, || async move {
                info!(language = descriptor.name(), problem = problem_id, "Building checker");
                ExecutorInstance::prepare(descriptor, sources, &exec_config, runner).await
            })
            .await
    }

    /// Run the checker on one test case.
    pub async fn check(
        &self,
        submission_output: &[u8],
        expected_output: &[u8],
        judge_input: &[u8],
        config: &CheckerConfig,
        problem_id: &str,
        point_value: f64,
    ) -> Result<CheckerResult> {
        let executor = self.executor(config, problem_id).await?;

        let files = CheckerFiles::create(judge_input, submission_output, expected_output)?;
        let limits = RunLimits::new(config.time_limit, config.memory_limit_kb);
        let output = executor.launch(&files.args(), limits.clone(), Stdin::Null).await?;
        drop(files);

        let crashed = executor.classify(&output, &limits);
        if output.outcome.signal.is_some()
            || output.outcome.limit_exceeded.is_some()
            || output.outcome.policy_violation.is_some()
        {
            warn!(verdict = %crashed.verdict(), "Checker did not exit normally");
            return Err(JudgeError::internal(format!(
                "Checker failed with {}: {}",
                crashed.verdict(),
                crashed.feedback().unwrap_or("no details")
            )));
        }

        interpret(&output, config.feedback, point_value)
    }
}

/// Map a checker's exit status onto a [`CheckerResult`].
pub fn interpret(output: &ProcessOutput, feedback: bool, point_value: f64) -> Result<CheckerResult> {
    let stdout = utf8_text(&output.stdout);
    let code = output
        .outcome
        .exit_code
        .ok_or_else(|| JudgeError::internal("Checker exited without a status"))?;
    debug!(code, stdout = %preview(&stdout, 200), "Checker finished");

    let shown = |fallback: &str| if feedback { stdout.clone() } else { fallback.to_string() };
    match code {
        exit_codes::OK => Ok(CheckerResult {
            passed: true,
            presentation_error: false,
            points: point_value,
            feedback: shown(""),
        }),
        exit_codes::WRONG_ANSWER => Ok(CheckerResult {
            passed: false,
            presentation_error: false,
            points: 0.0,
            feedback: shown(""),
        }),
        exit_codes::PRESENTATION_ERROR => Ok(CheckerResult {
            passed: false,
            presentation_error: true,
            points: 0.0,
            feedback: shown("Presentation Error"),
        }),
        exit_codes::FAIL => Err(JudgeError::internal(format!(
            "Checker failed assertion with message {}",
            stdout
        ))),
        other => Err(JudgeError::internal(format!(
            "Checker returned unexpected return code {} with stderr {}",
            other,
            utf8_text(&output.stderr)
        ))),
    }
}
