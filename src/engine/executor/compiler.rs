//! Compile step
//!
//! Compilers are trusted tooling: they run under
//! [`ResourcePolicy::unrestricted`], with the compile time limit and the
//! host's compile memory ceiling. When an instance asks for caching, the
//! resulting executable is stored on disk under a key derived from the
//! language, the flags and every source file, and later builds with the
//! same key copy it instead of invoking the compiler.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::unistd::geteuid;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::template::{self, TemplateContext};
use super::{expand_env, ExecutorConfig, ExecutorDescriptor, SourceFile};
use crate::core::utils::utf8_text;
use crate::core::{JudgeError, Result};
use crate::engine::sandbox::{get_config, LimitKind, ResourcePolicy, RunLimits, RunRequest, Runner};

pub(crate) async fn compile(
    descriptor: &ExecutorDescriptor,
    template: &[&str],
    ctx: &TemplateContext<'_>,
    sources: &[SourceFile],
    config: &ExecutorConfig,
    runner: &dyn Runner,
) -> Result<()> {
    let cached = if config.cached {
        let key = artifact_key(descriptor.name(), ctx.flags, sources);
        let root = &get_config().artifact_cache_dir;
        match ensure_private_dir(root).await {
            Ok(()) => Some(cache_path(root, &key, ctx.executable)),
            Err(e) => {
                warn!("Artifact cache disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    if let Some(path) = &cached {
        if tokio::fs::metadata(path).await.is_ok() {
            tokio::fs::copy(path, ctx.executable).await?;
            info!(language = descriptor.name(), "Using cached artifact {}", path.display());
            return Ok(());
        }
    }

    let argv = template::expand(template, ctx)?;
    let mut env = host_env();
    env.extend(expand_env(descriptor.spec().compile_env, ctx)?);

    let sandbox = get_config();
    let limits = RunLimits::new(
        config.compiler_time_limit.unwrap_or(sandbox.compile_time_limit),
        sandbox.compile_memory_limit_kb,
    );
    let request = RunRequest::new(argv, ctx.workdir)
        .with_env(env)
        .with_limits(limits);

    debug!(language = descriptor.name(), argv = ?request.argv, "Compiling");
    let output = runner
        .execute(request, Arc::new(ResourcePolicy::unrestricted()))
        .await?;
    let outcome = &output.outcome;

    if matches!(outcome.limit_exceeded, Some(LimitKind::CpuTime | LimitKind::WallTime)) {
        return Err(JudgeError::compile("Compilation timed out"));
    }
    if !outcome.is_success() {
        let message = if !output.stderr.is_empty() {
            utf8_text(&output.stderr)
        } else if !output.stdout.is_empty() {
            utf8_text(&output.stdout)
        } else if let Some(code) = outcome.exit_code {
            format!("Compiler exited with code {}", code)
        } else {
            "Compiler crashed".to_string()
        };
        return Err(JudgeError::compile(message));
    }
    if tokio::fs::metadata(ctx.executable).await.is_err() {
        return Err(JudgeError::compile("Compiler produced no executable"));
    }
    info!(language = descriptor.name(), "Compiled in {:?}", outcome.wall_time);

    if let Some(path) = &cached {
        if let Err(e) = store(ctx.executable, path).await {
            warn!("Failed to cache artifact at {}: {}", path.display(), e);
        }
    }
    Ok(())
}

/// Content key: language, flags, and each source's name and digest.
pub fn artifact_key(language: &str, flags: &[String], sources: &[SourceFile]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(language.as_bytes());
    hasher.update([0]);
    for flag in flags {
        hasher.update(flag.as_bytes());
        hasher.update([0]);
    }
    for source in sources {
        hasher.update(source.name.as_bytes());
        hasher.update([0]);
        hasher.update(Sha256::digest(&source.content));
    }
    format!("{:x}", hasher.finalize())
}

fn cache_path(root: &Path, key: &str, executable: &Path) -> PathBuf {
    let file = executable.file_name().unwrap_or(executable.as_os_str());
    root.join(key).join(file)
}

/// Create `dir` owner-only if missing, and refuse one that is not a real
/// directory owned by us or that others can write to. Anything found in the
/// cache is executed, so the cache must not be plantable.
pub(crate) async fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .await?;
    let meta = tokio::fs::symlink_metadata(dir).await?;
    if !meta.is_dir() || meta.uid() != geteuid().as_raw() || meta.mode() & 0o022 != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("{} is not a private directory", dir.display()),
        ));
    }
    Ok(())
}

/// Copy into the cache through a temporary name so readers never see a
/// partial file.
async fn store(executable: &Path, target: &Path) -> std::io::Result<()> {
    let dir = target.parent().unwrap_or(Path::new("."));
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .await?;
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let partial = dir.join(format!(
        ".partial-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::copy(executable, &partial).await?;
    tokio::fs::rename(&partial, target).await
}

/// Compilers find their helpers on PATH and keep caches under HOME.
fn host_env() -> Vec<(String, String)> {
    let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());
    let mut env = vec![("PATH".to_string(), path)];
    if let Ok(home) = std::env::var("HOME") {
        env.push(("HOME".to_string(), home));
    }
    env
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::config::RuntimeTable;
    use crate::engine::executor::testing::FakeRunner;
    use crate::engine::executor::{ExecutorInstance, ExecutorKind, LanguageSpec};
    use crate::engine::sandbox::{ProcessOutput, RunOutcome};

    static FAKE_C: LanguageSpec = LanguageSpec {
        name: "FAKEC",
        extension: "c",
        kind: ExecutorKind::Compiled {
            compile: &["{compiler}", "{flags}", "-o", "{executable}", "{sources}"],
            executable: "main",
        },
        run: &["{executable}"],
        runtime: "cc",
        flags: &["-O2"],
        ..LanguageSpec::DEFAULT
    };

    fn descriptor() -> Arc<ExecutorDescriptor> {
        let table = RuntimeTable::new([("cc".to_string(), PathBuf::from("/usr/bin/cc"))]);
        Arc::new(ExecutorDescriptor::resolve(&FAKE_C, &table).unwrap())
    }

    /// Pretends to compile by writing the `-o` target.
    fn compiling_runner() -> FakeRunner {
        FakeRunner::new(|request| {
            let out = request.argv.iter().position(|a| a == "-o").map(|i| &request.argv[i + 1]);
            if let Some(out) = out {
                std::fs::write(out, b"binary").unwrap();
            }
            ProcessOutput {
                outcome: RunOutcome {
                    exit_code: Some(0),
                    ..RunOutcome::default()
                },
                ..ProcessOutput::default()
            }
        })
    }

    #[test]
    fn test_artifact_key_depends_on_content_and_flags() {
        let a = vec![SourceFile::new("checker.cpp", "int main(){}")];
        let b = vec![SourceFile::new("checker.cpp", "int main(){return 1;}")];
        let flags = vec!["-O2".to_string()];

        assert_eq!(artifact_key("CPP17", &flags, &a), artifact_key("CPP17", &flags, &a));
        assert_ne!(artifact_key("CPP17", &flags, &a), artifact_key("CPP17", &flags, &b));
        assert_ne!(artifact_key("CPP17", &flags, &a), artifact_key("CPP17", &[], &a));
        assert_ne!(artifact_key("CPP17", &flags, &a), artifact_key("C11", &flags, &a));
    }

    #[tokio::test]
    async fn test_compile_passes_flags_and_sources() {
        let runner = Arc::new(compiling_runner());
        let instance = ExecutorInstance::prepare(
            descriptor(),
            vec![SourceFile::new("main.c", "int main(){}"), SourceFile::new("util.c", "")],
            &ExecutorConfig::default(),
            runner.clone(),
        )
        .await
        .unwrap();

        let requests = runner.requests.lock().unwrap();
        let (compile, policy) = &requests[0];
        let root = instance.workdir();
        assert_eq!(
            compile.argv,
            vec![
                "/usr/bin/cc".to_string(),
                "-O2".to_string(),
                "-o".to_string(),
                root.join("main").display().to_string(),
                root.join("main.c").display().to_string(),
                root.join("util.c").display().to_string(),
            ]
        );
        assert!(!policy.is_traced());
        assert_eq!(instance.program(), &[root.join("main").display().to_string()]);
    }

    #[tokio::test]
    async fn test_compile_error_is_ansi_stripped() {
        let runner: Arc<dyn Runner> =
            Arc::new(FakeRunner::exiting(1, "", "\x1b[01;31m\x1b[Kerror: \x1b[m\x1b[Kboom"));
        let err = ExecutorInstance::prepare(
            descriptor(),
            vec![SourceFile::new("main.c", "")],
            &ExecutorConfig::default(),
            runner,
        )
        .await
        .unwrap_err();

        match err {
            JudgeError::Compile(message) => assert_eq!(message, "error: boom"),
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compile_timeout() {
        let runner: Arc<dyn Runner> = Arc::new(FakeRunner::new(|_| ProcessOutput {
            outcome: RunOutcome {
                signal: Some(9),
                limit_exceeded: Some(LimitKind::WallTime),
                ..RunOutcome::default()
            },
            ..ProcessOutput::default()
        }));
        let err = ExecutorInstance::prepare(
            descriptor(),
            vec![SourceFile::new("main.c", "")],
            &ExecutorConfig::default(),
            runner,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, JudgeError::Compile(ref m) if m == "Compilation timed out"));
    }

    #[tokio::test]
    async fn test_cache_dir_created_private() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("artifacts");
        ensure_private_dir(&dir).await.unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        // Idempotent on our own directory.
        ensure_private_dir(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_dir_rejects_shared_or_linked() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join("shared");
        std::fs::create_dir(&shared).unwrap();
        std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o777)).unwrap();
        let err = ensure_private_dir(&shared).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);

        let private = root.path().join("private");
        ensure_private_dir(&private).await.unwrap();
        let link = root.path().join("link");
        std::os::unix::fs::symlink(&private, &link).unwrap();
        assert!(ensure_private_dir(&link).await.is_err());
    }

    #[tokio::test]
    async fn test_cached_build_skips_second_compile() {
        let runner = Arc::new(compiling_runner());
        let unique = format!("int main(){{}} // {:?}", std::time::SystemTime::now());
        let config = ExecutorConfig {
            cached: true,
            ..ExecutorConfig::default()
        };

        for _ in 0..2 {
            let instance = ExecutorInstance::prepare(
                descriptor(),
                vec![SourceFile::new("main.c", unique.clone())],
                &config,
                runner.clone(),
            )
            .await
            .unwrap();
            assert!(instance.workdir().join("main").exists());
        }
        assert_eq!(runner.calls(), 1);
    }
}
