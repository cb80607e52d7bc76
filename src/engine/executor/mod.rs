//! Executors: turn source text into something the sandbox can run.
//!
//! A language is described by a static [`LanguageSpec`]. Resolving it
//! against the host's [`RuntimeTable`] yields an [`ExecutorDescriptor`],
//! which lives for the judge's uptime. Every submission or checker gets its
//! own [`ExecutorInstance`] built by [`ExecutorInstance::prepare`].

pub mod compiler;
pub mod template;

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::debug;

use crate::config::RuntimeTable;
use crate::core::verdict::{self, CaseResult, StderrInspector};
use crate::core::{JudgeError, Result};
use crate::engine::sandbox::policy::{dir_pattern, exact_pattern};
use crate::engine::sandbox::{
    PolicyFragment, ProcessOutput, ResourcePolicy, RunLimits, RunRequest, Runner, Stdin,
};
use template::TemplateContext;

/// Pre-compile check of the source; an `Err` is reported as a compile error.
pub type Validator = fn(&[u8]) -> Result<()>;

#[derive(Debug, Clone, Copy)]
pub enum ExecutorKind {
    /// `compile` is expanded and run in the work directory; it must leave
    /// `executable` (a file name inside the work directory) behind.
    Compiled {
        compile: &'static [&'static str],
        executable: &'static str,
    },
    /// The interpreter runs the first source file directly.
    Scripted,
}

/// Static description of one language.
#[derive(Debug)]
pub struct LanguageSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub extension: &'static str,
    pub kind: ExecutorKind,
    pub run: &'static [&'static str],
    /// Runtime-table key of the compiler or interpreter.
    pub runtime: &'static str,
    /// Further runtimes referenced as `{runtime:KEY}` in templates.
    pub extra_runtimes: &'static [&'static str],
    pub flags: &'static [&'static str],
    pub compile_env: &'static [(&'static str, &'static str)],
    pub env: &'static [(&'static str, &'static str)],
    pub version_args: &'static [&'static str],
    /// Program that echoes its standard input, for self-tests.
    pub test_program: Option<&'static str>,
    pub locate: fn(&RuntimeTable, &str) -> Option<PathBuf>,
    pub fragment: fn(&RuntimeTable) -> PolicyFragment,
    pub validate: Option<Validator>,
    pub inspect_stderr: Option<StderrInspector>,
}

fn locate_on_table(runtimes: &RuntimeTable, key: &str) -> Option<PathBuf> {
    runtimes.find(key)
}

fn no_fragment(_: &RuntimeTable) -> PolicyFragment {
    PolicyFragment::new()
}

impl LanguageSpec {
    /// Field defaults for `..LanguageSpec::DEFAULT`.
    pub const DEFAULT: LanguageSpec = LanguageSpec {
        name: "",
        aliases: &[],
        extension: "",
        kind: ExecutorKind::Scripted,
        run: &["{runtime}", "{source}"],
        runtime: "",
        extra_runtimes: &[],
        flags: &[],
        compile_env: &[],
        env: &[],
        version_args: &["--version"],
        test_program: None,
        locate: locate_on_table,
        fragment: no_fragment,
        validate: None,
        inspect_stderr: None,
    };

    pub fn is_compiled(&self) -> bool {
        matches!(self.kind, ExecutorKind::Compiled { .. })
    }

    pub fn answers_to(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// A language resolved against this host's runtimes.
#[derive(Debug, Clone)]
pub struct ExecutorDescriptor {
    spec: &'static LanguageSpec,
    command: PathBuf,
    runtimes: BTreeMap<String, PathBuf>,
    fragment: PolicyFragment,
}

impl ExecutorDescriptor {
    /// `None` when the language's runtime is not installed.
    pub fn resolve(spec: &'static LanguageSpec, table: &RuntimeTable) -> Option<Self> {
        let command = (spec.locate)(table, spec.runtime)?;
        let mut runtimes = BTreeMap::new();
        for key in spec.extra_runtimes {
            runtimes.insert(key.to_string(), table.find(key)?);
        }

        let mut fragment = (spec.fragment)(table);
        fragment.fs.push(exact_pattern(&command));
        for path in runtimes.values() {
            fragment.fs.push(exact_pattern(path));
        }

        Some(Self {
            spec,
            command,
            runtimes,
            fragment,
        })
    }

    pub fn spec(&self) -> &'static LanguageSpec {
        self.spec
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn extension(&self) -> &'static str {
        self.spec.extension
    }

    pub fn is_compiled(&self) -> bool {
        self.spec.is_compiled()
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    pub fn fragment(&self) -> &PolicyFragment {
        &self.fragment
    }

    pub fn default_flags(&self) -> Vec<String> {
        self.spec.flags.iter().map(|f| f.to_string()).collect()
    }

    pub fn version_args(&self) -> &'static [&'static str] {
        self.spec.version_args
    }

    pub fn test_program(&self) -> Option<&'static str> {
        self.spec.test_program
    }

    /// Conventional file name for a single-file submission.
    pub fn source_name(&self) -> String {
        format!("main.{}", self.spec.extension)
    }
}

/// One source file to materialise in the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Per-instance settings, composed by value and never written back into
/// the descriptor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Full flag list; `None` uses the descriptor's defaults.
    pub flags: Option<Vec<String>>,
    pub compiler_time_limit: Option<Duration>,
    /// Deployment-specific policy additions.
    pub deployment: PolicyFragment,
    /// Reuse compiled artifacts across instances with identical sources.
    pub cached: bool,
}

/// A prepared program, ready to launch any number of times.
pub struct ExecutorInstance {
    descriptor: Arc<ExecutorDescriptor>,
    // Owns the work directory; dropping the instance removes it.
    _workdir: TempDir,
    root: PathBuf,
    program: Vec<String>,
    env: Vec<(String, String)>,
    policy: Arc<ResourcePolicy>,
    runner: Arc<dyn Runner>,
}

impl std::fmt::Debug for ExecutorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorInstance")
            .field("language", &self.descriptor.name())
            .field("workdir", &self.root)
            .field("program", &self.program)
            .finish()
    }
}

impl ExecutorInstance {
    /// Validate, write and (for compiled languages) build `sources`. The first
    /// source is the entry point for scripted languages.
    pub async fn prepare(
        descriptor: Arc<ExecutorDescriptor>,
        sources: Vec<SourceFile>,
        config: &ExecutorConfig,
        runner: Arc<dyn Runner>,
    ) -> Result<Self> {
        let spec = descriptor.spec();
        let entry = sources
            .first()
            .ok_or_else(|| JudgeError::internal("No source files given"))?;
        if let Some(validate) = spec.validate {
            validate(&entry.content)?;
        }

        let workdir = tempfile::Builder::new().prefix("judgebox_").tempdir()?;
        let root = tokio::fs::canonicalize(workdir.path()).await?;
        // Traced runs may execute as another user; it may enter but not list.
        tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o711)).await?;

        let mut paths = Vec::with_capacity(sources.len());
        for source in &sources {
            if source.name.is_empty() || source.name.contains('/') || source.name.starts_with('.') {
                return Err(JudgeError::internal(format!("Invalid source file name {:?}", source.name)));
            }
            let path = root.join(&source.name);
            tokio::fs::write(&path, &source.content).await?;
            paths.push(path);
        }

        let flags = config.flags.clone().unwrap_or_else(|| descriptor.default_flags());
        let executable = match spec.kind {
            ExecutorKind::Compiled { executable, .. } => root.join(executable),
            ExecutorKind::Scripted => paths[0].clone(),
        };
        // Headers and other auxiliary files are written but not handed to
        // the compiler.
        let mut inputs: Vec<PathBuf> = paths
            .iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == spec.extension))
            .cloned()
            .collect();
        if inputs.is_empty() {
            inputs = paths.clone();
        }
        let ctx = TemplateContext {
            command: descriptor.command(),
            runtimes: &descriptor.runtimes,
            sources: &inputs,
            executable: &executable,
            flags: &flags,
            workdir: &root,
        };

        if let ExecutorKind::Compiled { compile, .. } = spec.kind {
            compiler::compile(&descriptor, compile, &ctx, &sources, config, runner.as_ref()).await?;
        }

        let program = template::expand(spec.run, &ctx)?;
        let env = expand_env(spec.env, &ctx)?;

        let policy = ResourcePolicy::base()?
            .compose(descriptor.fragment())?
            .compose(&config.deployment)?
            .compose(&PolicyFragment::new().fs(dir_pattern(&root)))?;

        debug!(language = descriptor.name(), program = ?program, "Executor prepared");

        Ok(Self {
            descriptor,
            _workdir: workdir,
            root,
            program,
            env,
            policy: Arc::new(policy),
            runner,
        })
    }

    /// Run the prepared program with extra arguments.
    pub async fn launch(&self, args: &[String], limits: RunLimits, stdin: Stdin) -> Result<ProcessOutput> {
        let mut argv = self.program.clone();
        argv.extend(args.iter().cloned());

        let request = RunRequest::new(argv, &self.root)
            .with_env(self.env.clone())
            .with_stdin(stdin)
            .with_limits(limits);

        Ok(self.runner.execute(request, Arc::clone(&self.policy)).await?)
    }

    /// Derive the verdict flags of a finished run, applying the language's
    /// stderr inspection.
    pub fn classify(&self, output: &ProcessOutput, limits: &RunLimits) -> CaseResult {
        verdict::derive(
            &output.outcome,
            limits,
            &output.stderr,
            self.descriptor.spec().inspect_stderr,
        )
    }

    pub fn descriptor(&self) -> &ExecutorDescriptor {
        &self.descriptor
    }

    pub fn policy(&self) -> &ResourcePolicy {
        &self.policy
    }

    /// Canonical path of the work directory.
    pub fn workdir(&self) -> &Path {
        &self.root
    }

    pub fn program(&self) -> &[String] {
        &self.program
    }
}

pub(crate) fn expand_env(
    env: &[(&'static str, &'static str)],
    ctx: &TemplateContext<'_>,
) -> Result<Vec<(String, String)>> {
    env.iter()
        .map(|(key, value)| Ok((key.to_string(), template::substitute(value, ctx)?)))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! A [`Runner`] that never spawns anything.

    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::sandbox::{RunOutcome, SandboxError};

    type Respond = Box<dyn Fn(&RunRequest) -> ProcessOutput + Send + Sync>;

    pub struct FakeRunner {
        pub requests: Mutex<Vec<(RunRequest, Arc<ResourcePolicy>)>>,
        respond: Respond,
    }

    impl FakeRunner {
        pub fn new(respond: impl Fn(&RunRequest) -> ProcessOutput + Send + Sync + 'static) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        /// Always exit with `code` and the given stdout/stderr.
        pub fn exiting(code: i32, stdout: &str, stderr: &str) -> Self {
            let (stdout, stderr) = (stdout.as_bytes().to_vec(), stderr.as_bytes().to_vec());
            Self::new(move |_| ProcessOutput {
                outcome: RunOutcome {
                    exit_code: Some(code),
                    ..RunOutcome::default()
                },
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            })
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Runner for FakeRunner {
        async fn execute(
            &self,
            request: RunRequest,
            policy: Arc<ResourcePolicy>,
        ) -> std::result::Result<ProcessOutput, SandboxError> {
            let output = (self.respond)(&request);
            self.requests.lock().unwrap().push((request, policy));
            Ok(output)
        }
    }
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod tests {
    use super::testing::FakeRunner;
    use super::*;
    use crate::core::ResultFlags;
    use crate::engine::sandbox::RunOutcome;

    static SCRIPT: LanguageSpec = LanguageSpec {
        name: "SH",
        extension: "sh",
        runtime: "sh",
        ..LanguageSpec::DEFAULT
    };

    fn descriptor() -> Arc<ExecutorDescriptor> {
        let table = RuntimeTable::new([("sh".to_string(), PathBuf::from("/bin/sh"))]);
        Arc::new(ExecutorDescriptor::resolve(&SCRIPT, &table).unwrap())
    }

    #[tokio::test]
    async fn test_scripted_prepare_and_launch() {
        let runner = Arc::new(FakeRunner::exiting(0, "hi\n", ""));
        let instance = ExecutorInstance::prepare(
            descriptor(),
            vec![SourceFile::new("main.sh", "echo hi")],
            &ExecutorConfig::default(),
            runner.clone(),
        )
        .await
        .unwrap();

        let source = instance.workdir().join("main.sh");
        assert_eq!(std::fs::read_to_string(&source).unwrap(), "echo hi");
        assert_eq!(instance.program()[0], "/bin/sh");

        let output = instance
            .launch(&["x".to_string()], RunLimits::default(), Stdin::Null)
            .await
            .unwrap();
        assert_eq!(output.stdout, b"hi\n");

        let requests = runner.requests.lock().unwrap();
        let (request, policy) = &requests[0];
        assert_eq!(request.argv.last().map(String::as_str), Some("x"));
        assert!(policy.allows_path(&source));
        assert!(policy.allows_path(Path::new("/bin/sh")));
        assert!(!policy.allows_write(&source));
        assert!(!policy.allows_write(&instance.workdir().join("scratch")));

        let mode = std::fs::metadata(instance.workdir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o711);
    }

    #[tokio::test]
    async fn test_deployment_fragment_stays_per_instance() {
        let runner: Arc<dyn Runner> = Arc::new(FakeRunner::exiting(0, "", ""));
        let with_tmp = ExecutorConfig {
            deployment: PolicyFragment::new().fs(dir_pattern(Path::new("/srv/shared"))),
            ..ExecutorConfig::default()
        };

        let first = ExecutorInstance::prepare(descriptor(), vec![SourceFile::new("a.sh", "")], &with_tmp, runner.clone())
            .await
            .unwrap();
        let second = ExecutorInstance::prepare(
            descriptor(),
            vec![SourceFile::new("a.sh", "")],
            &ExecutorConfig::default(),
            runner,
        )
        .await
        .unwrap();

        assert!(first.policy().allows_path(Path::new("/srv/shared/x")));
        assert!(!second.policy().allows_path(Path::new("/srv/shared/x")));
        assert!(!second.policy().allows_path(first.workdir()));
    }

    #[tokio::test]
    async fn test_workdir_removed_on_drop() {
        let runner: Arc<dyn Runner> = Arc::new(FakeRunner::exiting(0, "", ""));
        let instance = ExecutorInstance::prepare(
            descriptor(),
            vec![SourceFile::new("main.sh", "")],
            &ExecutorConfig::default(),
            runner,
        )
        .await
        .unwrap();
        let dir = instance.workdir().to_path_buf();
        assert!(dir.exists());
        drop(instance);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_rejects_path_in_source_name() {
        let runner: Arc<dyn Runner> = Arc::new(FakeRunner::exiting(0, "", ""));
        let err = ExecutorInstance::prepare(
            descriptor(),
            vec![SourceFile::new("../escape.sh", "")],
            &ExecutorConfig::default(),
            runner,
        )
        .await
        .unwrap_err();
        assert!(err.is_internal());
    }

    #[tokio::test]
    async fn test_classify_uses_raw_limits() {
        let runner: Arc<dyn Runner> = Arc::new(FakeRunner::exiting(0, "", ""));
        let instance = ExecutorInstance::prepare(
            descriptor(),
            vec![SourceFile::new("main.sh", "")],
            &ExecutorConfig::default(),
            runner,
        )
        .await
        .unwrap();
        let output = ProcessOutput {
            outcome: RunOutcome {
                exit_code: Some(0),
                peak_memory_kb: 300_000,
                ..RunOutcome::default()
            },
            ..ProcessOutput::default()
        };
        let result = instance.classify(&output, &RunLimits::new(Duration::from_secs(1), 262_144));
        assert!(result.flags().contains(ResultFlags::MLE));
    }
}
