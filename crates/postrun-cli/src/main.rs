#![warn(missing_docs)]

//! postrun: run post-response API test scripts in a sandbox.

mod store;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use postrun_config::PostrunConfig;
use postrun_sandbox::audit::{AuditLogger, JsonLinesAuditLogger, TracingAuditLogger};
use postrun_sandbox::{ResponseView, SandboxConfig, ScriptExecutor, ScriptPolicy};
use tracing_subscriber::EnvFilter;

use crate::store::FileEnvironmentStore;

#[derive(Parser)]
#[command(name = "postrun", author, version, about, long_about = None)]
struct Cli {
    /// Override the configured script policy (strict or trusted).
    #[arg(long, global = true)]
    policy: Option<ScriptPolicy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a script against the active policy without running it.
    Check {
        /// Path to the script file.
        #[arg(long)]
        script: PathBuf,
    },
    /// Run a script against a recorded response.
    Run {
        /// Path to the script file.
        #[arg(long)]
        script: PathBuf,
        /// JSON file with `status`, `headers` and `body`.
        #[arg(long)]
        response: PathBuf,
        /// JSON file with `id`, optional `name` and `variables`.
        #[arg(long)]
        environment: Option<PathBuf>,
        /// Write the merged variables back to the environment file.
        #[arg(long, requires = "environment")]
        write_back: bool,
    },
}

/// Locate the config file.
///
/// Search order:
/// 1. `POSTRUN_CONFIG` environment variable
/// 2. `./postrun.toml` in the current directory
/// 3. None (defaults apply)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("POSTRUN_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
        tracing::warn!(path = %p.display(), "POSTRUN_CONFIG points at a missing file, ignoring");
    }

    let cwd = PathBuf::from("postrun.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config() -> Result<PostrunConfig> {
    match find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            PostrunConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(PostrunConfig::default())
        }
    }
}

/// Resolve the sandbox configuration, with the CLI policy taking precedence.
fn build_sandbox_config(config: &PostrunConfig, policy: Option<ScriptPolicy>) -> Result<SandboxConfig> {
    let mut sandbox = config.to_sandbox_config()?;
    if let Some(policy) = policy {
        sandbox.policy = policy;
    }
    Ok(sandbox)
}

async fn build_audit_logger(config: &PostrunConfig) -> Result<Arc<dyn AuditLogger>> {
    match &config.audit.jsonl_path {
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("failed to open audit log {}", path.display()))?;
            tracing::info!(path = %path.display(), "writing audit entries as JSON lines");
            Ok(Arc::new(JsonLinesAuditLogger::new(file)))
        }
        None => Ok(Arc::new(TracingAuditLogger)),
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))
}

fn read_response(path: &Path) -> Result<ResponseView> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read response {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid response file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config()?;
    let sandbox_config = build_sandbox_config(&config, cli.policy)?;

    match cli.command {
        Commands::Check { script } => {
            let script = read_script(&script)?;
            let executor = ScriptExecutor::new(sandbox_config);
            match executor.validate(&script) {
                Ok(()) => {
                    println!("ok");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("{e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Run {
            script,
            response,
            environment,
            write_back,
        } => {
            let script = read_script(&script)?;
            let response = read_response(&response)?;
            let store = environment.map(FileEnvironmentStore::new);
            let snapshot = match &store {
                Some(store) => Some(store.load().context("failed to load environment")?),
                None => None,
            };

            let executor =
                ScriptExecutor::with_audit_logger(sandbox_config, build_audit_logger(&config).await?);

            let result = match (&store, write_back) {
                (Some(store), true) => {
                    executor
                        .execute_and_persist(&script, &response, snapshot.as_ref(), store)
                        .await
                }
                _ => executor.execute(&script, &response, snapshot.as_ref()).await,
            };

            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
