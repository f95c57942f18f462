use chrono::{DateTime, Duration, Utc};
use conveyor_core::ScoreConfig;
use serde::{Deserialize, Serialize};

/// The recognized scheduler knobs. Everything here is surfaced by the host
/// as flags and config-file fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduling ticks.
    pub tick_period_secs: u64,
    /// Hard deadline for one tick; in-flight I/O is cancelled past it.
    pub tick_timeout_secs: u64,
    /// Commits older than this never enter a blamelist or produce jobs.
    pub scheduling_window_hours: i64,
    pub max_blamelist_commits: usize,
    /// Matched pairs dispatched at once.
    pub dispatch_concurrency: usize,
    /// Store CAS retries per dispatched pair.
    pub retry_cas_attempts: usize,
    /// Worker pool this scheduler drives.
    pub pool: String,
    /// Branch names jobs are created for.
    pub branches: Vec<String>,
    /// The branch `main-only` job specs react to.
    pub main_branch: String,
    pub score: ScoreConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_period_secs: 5,
            tick_timeout_secs: 300,
            scheduling_window_hours: 4 * 24,
            max_blamelist_commits: 500,
            dispatch_concurrency: 8,
            retry_cas_attempts: 5,
            pool: "Skia".to_string(),
            branches: vec!["main".to_string()],
            main_branch: "main".to_string(),
            score: ScoreConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(self.scheduling_window_hours)
    }

    pub fn tracks_branch(&self, branch: &str) -> bool {
        self.branches.iter().any(|b| b == branch)
    }
}
