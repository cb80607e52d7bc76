//! Judge environment
//!
//! Host-level settings read once at start-up: where language runtimes live,
//! where problem packages are stored, and the default limits used for
//! checkers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

/// Paths of language runtimes, keyed by runtime name (`gcc`, `ruby_home`, ...).
#[derive(Debug, Clone, Default)]
pub struct RuntimeTable {
    entries: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawRuntimeFile {
    #[serde(default)]
    runtimes: BTreeMap<String, PathBuf>,
}

impl RuntimeTable {
    pub fn new(entries: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Parse a `[runtimes]` TOML table.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let raw: RawRuntimeFile = toml::from_str(content).context("Invalid runtime table")?;
        Ok(Self {
            entries: raw.runtimes,
        })
    }

    /// Load from a file; a missing file yields an empty table.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No runtime table at {}, relying on PATH", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Configured entry only, without PATH lookup.
    pub fn get(&self, key: &str) -> Option<&Path> {
        self.entries.get(key).map(PathBuf::as_path)
    }

    /// Configured entry, else the first `key` executable on PATH.
    pub fn find(&self, key: &str) -> Option<PathBuf> {
        if let Some(path) = self.get(key) {
            return Some(path.to_path_buf());
        }
        which::which(key).ok()
    }
}

/// Judge-wide settings.
#[derive(Debug, Clone)]
pub struct JudgeEnv {
    pub runtimes: RuntimeTable,
    pub problem_root: PathBuf,
    pub compiler_time_limit: Duration,
    pub generator_time_limit: Duration,
    pub generator_memory_limit_kb: u64,
}

impl Default for JudgeEnv {
    fn default() -> Self {
        Self {
            runtimes: RuntimeTable::default(),
            problem_root: PathBuf::from("./problems"),
            compiler_time_limit: Duration::from_millis(10_000),
            generator_time_limit: Duration::from_millis(20_000),
            generator_memory_limit_kb: 524_288,
        }
    }
}

impl JudgeEnv {
    /// Read `JUDGE_*` environment variables, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let runtimes_path = std::env::var("JUDGE_RUNTIMES")
            .unwrap_or_else(|_| "./files/runtimes.toml".to_string());
        let runtimes = RuntimeTable::load(Path::new(&runtimes_path))?;

        let problem_root = std::env::var("JUDGE_PROBLEM_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.problem_root);

        let compiler_time_limit = env_number("JUDGE_COMPILER_TIME_LIMIT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.compiler_time_limit);
        let generator_time_limit = env_number("JUDGE_GENERATOR_TIME_LIMIT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.generator_time_limit);
        let generator_memory_limit_kb = env_number("JUDGE_GENERATOR_MEMORY_LIMIT_KB")?
            .unwrap_or(defaults.generator_memory_limit_kb);

        Ok(Self {
            runtimes,
            problem_root,
            compiler_time_limit,
            generator_time_limit,
            generator_memory_limit_kb,
        })
    }

    /// Directory holding the files of one problem.
    pub fn problem_dir(&self, problem_id: &str) -> PathBuf {
        self.problem_root.join(problem_id)
    }
}

fn env_number<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid {}: {}", key, value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => {
            warn!("Ignoring {}: {}", key, e);
            Ok(None)
        }
    }
}
