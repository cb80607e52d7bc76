use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use judgebox::checker::{CheckerBridge, CheckerConfig, CheckerSettings};
use judgebox::config::JudgeEnv;
use judgebox::core::utils::utf8_text;
use judgebox::core::{JudgeError, Verdict};
use judgebox::engine::executor::ExecutorConfig;
use judgebox::engine::sandbox::{self, init_config, RunLimits, Sandbox, SandboxConfig, Stdin};
use judgebox::grader::{self, CaseReport, CheckerRef};
use judgebox::languages::ExecutorCatalog;

#[derive(Debug, Parser)]
#[command(name = "judgebox", version, about = "Sandboxed judge for contest submissions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print runtime versions and run each language's echo program
    Selftest {
        /// Languages to test (default: every available one)
        languages: Vec<String>,
    },
    /// Build and run one program
    Run {
        #[arg(short, long)]
        lang: String,
        source: PathBuf,
        /// File fed to standard input
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(long, default_value_t = 2000)]
        time_ms: u64,
        #[arg(long, default_value_t = 262144)]
        memory_kb: u64,
    },
    /// Judge a submission against a problem package
    Judge {
        #[arg(short, long)]
        lang: String,
        source: PathBuf,
        /// Directory name under the problem root
        #[arg(short, long)]
        problem: String,
    },
}

/// `problem.toml` at the root of a problem package.
#[derive(Debug, Deserialize)]
struct ProblemFile {
    /// Milliseconds
    #[serde(default = "default_time_limit")]
    time_limit: u64,
    /// KB
    #[serde(default = "default_memory_limit")]
    memory_limit: u64,
    #[serde(default = "default_points")]
    points: f64,
    checker: Option<CheckerSettings>,
}

fn default_time_limit() -> u64 {
    2000
}

fn default_memory_limit() -> u64 {
    262144
}

fn default_points() -> f64 {
    1.0
}

#[derive(Debug, Serialize)]
struct JudgeReport {
    verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    testcase_results: Vec<CaseReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("judgebox=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let env = Arc::new(JudgeEnv::from_env()?);
    let mut sandbox_config = SandboxConfig {
        compile_time_limit: env.compiler_time_limit,
        ..SandboxConfig::default()
    };
    if let Ok(dir) = std::env::var("ARTIFACT_CACHE_DIR") {
        sandbox_config.artifact_cache_dir = PathBuf::from(dir);
    }
    if let (Ok(uid), Ok(gid)) = (std::env::var("SANDBOX_UID"), std::env::var("SANDBOX_GID")) {
        sandbox_config.run_as = Some((
            uid.parse().context("Invalid SANDBOX_UID")?,
            gid.parse().context("Invalid SANDBOX_GID")?,
        ));
    }
    init_config(sandbox_config)?;

    // Children live in their own process groups; take them down with us.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, killing sandboxed processes");
            sandbox::kill_all();
            std::process::exit(130);
        }
    });

    let catalog = Arc::new(ExecutorCatalog::load(&env.runtimes, Arc::new(Sandbox::new())));
    info!("Available executors: {}", catalog.names().join(", "));

    match cli.command {
        Command::Selftest { languages } => selftest(&catalog, languages).await,
        Command::Run {
            lang,
            source,
            input,
            time_ms,
            memory_kb,
        } => run(&catalog, &lang, &source, input, RunLimits::new(Duration::from_millis(time_ms), memory_kb)).await,
        Command::Judge { lang, source, problem } => judge(catalog, env, &lang, &source, &problem).await,
    }
}

async fn selftest(catalog: &ExecutorCatalog, languages: Vec<String>) -> Result<()> {
    let languages = if languages.is_empty() {
        catalog.names().into_iter().map(str::to_string).collect()
    } else {
        languages
    };

    let mut failed = 0;
    for name in &languages {
        let version = match catalog.version(name).await {
            Ok(version) => version,
            Err(e) => {
                warn!("{}: version probe failed: {}", name, e);
                "unknown version".to_string()
            }
        };
        match catalog.self_test(name).await {
            Ok(true) => println!("{:<8} OK    {}", name, version),
            Ok(false) => {
                failed += 1;
                println!("{:<8} FAIL  {}", name, version);
            }
            Err(e) => {
                failed += 1;
                println!("{:<8} ERROR {}", name, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} executors failed their self-test", failed, languages.len());
    }
    Ok(())
}

async fn run(
    catalog: &ExecutorCatalog,
    lang: &str,
    source: &Path,
    input: Option<PathBuf>,
    limits: RunLimits,
) -> Result<()> {
    let code = tokio::fs::read(source)
        .await
        .with_context(|| format!("Failed to read {}", source.display()))?;
    let stdin = match input {
        Some(path) => Stdin::File(path),
        None => Stdin::Null,
    };

    let instance = match catalog.prepare(lang, &code, &ExecutorConfig::default()).await {
        Ok(instance) => instance,
        Err(JudgeError::Compile(message)) => {
            eprintln!("{}", message);
            println!("{}", Verdict::CompileError);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let output = instance.launch(&[], limits.clone(), stdin).await?;
    let result = instance.classify(&output, &limits);

    print!("{}", utf8_text(&output.stdout));
    eprint!("{}", utf8_text(&output.stderr));
    eprintln!("{}", serde_json::to_string(&result)?);
    println!("{}", result.verdict());
    Ok(())
}

async fn judge(
    catalog: Arc<ExecutorCatalog>,
    env: Arc<JudgeEnv>,
    lang: &str,
    source: &Path,
    problem_id: &str,
) -> Result<()> {
    let problem_dir = env.problem_dir(problem_id);
    let problem: ProblemFile = match std::fs::read_to_string(problem_dir.join("problem.toml")) {
        Ok(content) => toml::from_str(&content).context("Invalid problem.toml")?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::from_str("")?,
        Err(e) => return Err(e).context("Failed to read problem.toml"),
    };
    let cases = grader::load_cases(&problem_dir.join("tests"), problem.points)?;
    let limits = RunLimits::new(Duration::from_millis(problem.time_limit), problem.memory_limit);
    let code = tokio::fs::read(source)
        .await
        .with_context(|| format!("Failed to read {}", source.display()))?;

    info!(problem = problem_id, language = lang, cases = cases.len(), "Judging");

    let report = match catalog.prepare(lang, &code, &ExecutorConfig::default()).await {
        Err(JudgeError::Compile(message)) => JudgeReport {
            verdict: Verdict::CompileError,
            error_message: Some(message),
            testcase_results: Vec::new(),
        },
        Err(e) => return Err(e).context("Failed to prepare submission"),
        Ok(instance) => {
            let checker_config = problem
                .checker
                .as_ref()
                .map(|settings| CheckerConfig::resolve(settings, &env))
                .transpose()?;
            let bridge = CheckerBridge::new(Arc::clone(&catalog), Arc::clone(&env));
            let checker = checker_config.as_ref().map(|config| CheckerRef {
                bridge: &bridge,
                config,
                problem_id,
            });

            match grader::grade(&instance, &cases, &limits, checker).await {
                Ok(reports) => JudgeReport {
                    verdict: grader::overall(&reports),
                    error_message: None,
                    testcase_results: reports,
                },
                Err(e) => {
                    error!("Judging {} failed: {}", problem_id, e);
                    JudgeReport {
                        verdict: Verdict::SystemError,
                        error_message: Some(e.to_string()),
                        testcase_results: Vec::new(),
                    }
                }
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
