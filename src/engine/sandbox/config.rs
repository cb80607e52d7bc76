//! Sandbox configuration
//!
//! Host-wide ceilings for the sandbox, set once at start-up.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use nix::unistd::geteuid;
use tracing::warn;

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Compile time limit (default: 10s), used when an executor sets none
    pub compile_time_limit: Duration,
    /// Compile memory limit in KB (default: 2GB)
    pub compile_memory_limit_kb: u64,
    /// Largest file a sandboxed program may write, stdout included (default: 256MB)
    pub output_limit_kb: u64,
    /// Maximum open files
    pub open_files: u64,
    /// On-disk cache for compiled artifacts; must be private to the judge
    pub artifact_cache_dir: PathBuf,
    /// uid/gid traced runs switch to before exec (default: nobody when the
    /// judge runs as root, unchanged otherwise)
    pub run_as: Option<(u32, u32)>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            compile_time_limit: Duration::from_secs(10),
            compile_memory_limit_kb: 2048 * 1024,
            output_limit_kb: 262144,
            open_files: 256,
            artifact_cache_dir: default_cache_dir(),
            run_as: geteuid().is_root().then_some((NOBODY, NOBODY)),
        }
    }
}

const NOBODY: u32 = 65534;

/// `$XDG_CACHE_HOME/judgebox/artifacts`, then `~/.cache/...`, then a
/// per-user directory under the temp dir.
fn default_cache_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")));
    match base {
        Some(base) => base.join("judgebox").join("artifacts"),
        None => std::env::temp_dir().join(format!("judgebox_artifacts-{}", geteuid())),
    }
}

/// Global sandbox configuration
static SANDBOX_CONFIG: OnceLock<SandboxConfig> = OnceLock::new();

/// Install the sandbox configuration; only the first call wins.
pub fn init_config(config: SandboxConfig) -> anyhow::Result<()> {
    SANDBOX_CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Sandbox configuration already initialized"))?;

    Ok(())
}

/// Get sandbox configuration
pub fn get_config() -> &'static SandboxConfig {
    SANDBOX_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<SandboxConfig> = OnceLock::new();

        DEFAULT.get_or_init(|| {
            warn!("Sandbox configuration not initialized, using default");
            SandboxConfig::default()
        })
    })
}
