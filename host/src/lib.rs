//! Process wiring for the scheduler: command line, config files, logging,
//! and construction of the engine against its collaborator interfaces.
//! This binary wires the in-process reference collaborators (in-memory
//! store, scriptable backend, fed-in repo mirror); a deployment substitutes
//! its own implementations of the same traits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use conveyor_core::{Blacklist, InMemoryCfgCache, InMemoryRepo, TasksCfgProvider};
use conveyor_lib::TasksCfg;
use conveyor_schedactor::{
    DiagnosticsSink, FileDiagnostics, InMemoryDiagnostics, MockBackend, Scheduler, SchedulerConfig,
};
use conveyor_taskdb::InMemoryDb;
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{Builder, Rotation},
};
use tracing_subscriber::FmtSubscriber;
use url::Url;

fn default_config_path() -> PathBuf {
    PathBuf::from("host/config/scheduler.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Parser, Default, Clone, Serialize, Deserialize, Debug)]
#[command(name = "conveyor", about = "CI task scheduler", long_about = None)]
#[serde(default)]
pub struct Cli {
    #[arg(long, require_equals = true, default_value = "host/config/scheduler.json")]
    #[serde(default = "default_config_path")]
    /// Path to a JSON file holding the scheduler knobs. Command line
    /// flags take precedence over its contents.
    pub config_path: PathBuf,

    #[arg(long, require_equals = true)]
    /// Path to a JSON task/job graph applied to every tracked repo.
    pub tasks_cfg_path: Option<PathBuf>,

    #[arg(long, require_equals = true)]
    /// Repo URLs to track.
    pub repo: Vec<String>,

    #[arg(long, require_equals = true)]
    /// Directory for per-tick diagnostics JSON; in-memory when unset.
    pub diagnostics_dir: Option<PathBuf>,

    #[arg(long, require_equals = true)]
    /// Log to rolling files in this directory instead of stderr.
    pub log_path: Option<PathBuf>,

    #[arg(long, require_equals = true, default_value = "7")]
    /// How many rolled log files to keep.
    pub max_log: usize,

    #[arg(long, require_equals = true, env = "RUST_LOG", default_value = "info")]
    #[serde(default = "default_log_level")]
    /// Log filter, e.g. "info" or "conveyor_schedactor=debug".
    pub log_level: String,
}

/// The knobs file: scheduler configuration, nothing else.
#[derive(Default, Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct FileConfig {
    pub scheduler: SchedulerConfig,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Install the log subscriber; JSON to rolling files when a log path is
/// given, human-readable stderr otherwise.
pub fn subscribe_log(
    log_path: &Option<PathBuf>,
    log_level: &str,
    max_log: usize,
) -> Option<WorkerGuard> {
    let builder = FmtSubscriber::builder().with_env_filter(log_level);
    match log_path {
        Some(log_path) => {
            let file_appender = Builder::new()
                .rotation(Rotation::DAILY)
                .filename_prefix("conveyor.log")
                .max_log_files(max_log)
                .build(log_path)
                .expect("initializing rolling file appender failed");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let subscriber = builder.json().with_writer(non_blocking).finish();
            tracing::subscriber::set_global_default(subscriber).unwrap();
            Some(guard)
        }
        None => {
            let subscriber = builder.finish();
            tracing::subscriber::set_global_default(subscriber).unwrap();
            None
        }
    }
}

/// Everything the running process holds onto.
pub struct SchedulerProcess {
    pub scheduler: Scheduler,
    pub repos: Vec<Arc<InMemoryRepo>>,
    pub backend: Arc<MockBackend>,
}

/// Build the engine from the CLI and config file.
pub async fn build(cli: &Cli) -> Result<SchedulerProcess> {
    let file_config = if cli.config_path.exists() {
        FileConfig::from_file(&cli.config_path)?
    } else {
        tracing::warn!(
            "config file {} not found, using defaults",
            cli.config_path.display()
        );
        FileConfig::default()
    };

    let cfgs = Arc::new(InMemoryCfgCache::new());
    if let Some(path) = &cli.tasks_cfg_path {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading tasks cfg {}", path.display()))?;
        let cfg: TasksCfg = serde_json::from_str(&raw)
            .with_context(|| format!("parsing tasks cfg {}", path.display()))?;
        for repo in &cli.repo {
            cfgs.insert_repo_fallback(repo, cfg.clone())
                .with_context(|| format!("invalid tasks cfg for {repo}"))?;
        }
    }

    let mut repos: Vec<Arc<InMemoryRepo>> = Vec::new();
    for repo in &cli.repo {
        Url::parse(repo).with_context(|| format!("invalid repo url {repo:?}"))?;
        repos.push(Arc::new(InMemoryRepo::new(repo)));
    }

    let diagnostics: Arc<dyn DiagnosticsSink> = match &cli.diagnostics_dir {
        Some(dir) => Arc::new(FileDiagnostics::new(dir.clone())?),
        None => Arc::new(InMemoryDiagnostics::new()),
    };

    let backend = Arc::new(MockBackend::new());
    let scheduler = Scheduler::new(
        file_config.scheduler,
        Arc::new(InMemoryDb::new()),
        backend.clone(),
        cfgs.clone() as Arc<dyn TasksCfgProvider>,
        repos
            .iter()
            .map(|r| r.clone() as Arc<dyn conveyor_core::RepoMirror>)
            .collect(),
        Arc::new(Blacklist::default()),
        diagnostics,
    )
    .await?;

    Ok(SchedulerProcess {
        scheduler,
        repos,
        backend,
    })
}
