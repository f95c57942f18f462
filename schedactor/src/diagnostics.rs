use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use conveyor_core::{FilterReason, MatchDiagnostics, TaskCandidate};
use conveyor_lib::TaskKey;
use serde::Serialize;

/// One scored candidate as it stood at the end of queue regeneration.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    pub task_key: String,
    pub score: f64,
    pub attempt: u32,
    pub blamelist_len: usize,
    pub stealing_from: Option<String>,
    pub num_jobs: usize,
}

impl From<&TaskCandidate> for CandidateRecord {
    fn from(c: &TaskCandidate) -> Self {
        Self {
            task_key: c.key.to_string(),
            score: c.score,
            attempt: c.attempt,
            blamelist_len: c.commits.len(),
            stealing_from: c.stealing_from.as_ref().map(|t| t.id.clone()),
            num_jobs: c.jobs.len(),
        }
    }
}

/// A candidate the filter removed, and why.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRecord {
    pub task_key: String,
    pub reason: FilterReason,
}

impl From<&(TaskKey, FilterReason)> for RejectedRecord {
    fn from((key, reason): &(TaskKey, FilterReason)) -> Self {
        Self {
            task_key: key.to_string(),
            reason: reason.clone(),
        }
    }
}

/// The per-tick diagnostics artifact, written as one JSON object per tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickDiagnostics {
    pub timestamp: DateTime<Utc>,
    pub num_unfinished_jobs: usize,
    pub num_bots: usize,
    pub num_busy_bots: usize,
    pub candidates: Vec<CandidateRecord>,
    pub rejected: Vec<RejectedRecord>,
    pub matches: Vec<MatchDiagnostics>,
    pub dispatched_task_ids: Vec<String>,
    pub errors: Vec<String>,
}

/// Where tick diagnostics go. Failures to record diagnostics never fail
/// the tick.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, diagnostics: &TickDiagnostics) -> std::io::Result<()>;
}

/// Keeps every tick in memory; what the test suites read.
#[derive(Default)]
pub struct InMemoryDiagnostics {
    ticks: Mutex<Vec<TickDiagnostics>>,
}

impl InMemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticks(&self) -> Vec<TickDiagnostics> {
        self.ticks.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<TickDiagnostics> {
        self.ticks.lock().unwrap().last().cloned()
    }
}

impl DiagnosticsSink for InMemoryDiagnostics {
    fn record(&self, diagnostics: &TickDiagnostics) -> std::io::Result<()> {
        self.ticks.lock().unwrap().push(diagnostics.clone());
        Ok(())
    }
}

/// Writes one `tick-<timestamp>.json` per tick into a directory.
pub struct FileDiagnostics {
    dir: PathBuf,
}

impl FileDiagnostics {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl DiagnosticsSink for FileDiagnostics {
    fn record(&self, diagnostics: &TickDiagnostics) -> std::io::Result<()> {
        let name = format!("tick-{}.json", diagnostics.timestamp.timestamp_millis());
        let path = self.dir.join(name);
        let json = serde_json::to_vec_pretty(diagnostics)?;
        std::fs::write(path, json)
    }
}
