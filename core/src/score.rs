use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candidates::TaskCandidate;

/// Tuning knobs for candidate scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    /// Base score for try-job candidates; dominates everything else.
    pub try_job_score: f64,
    /// Base score for force-run candidates; dominates regular work.
    pub force_run_score: f64,
    /// Applied once per attempt to regular retries.
    pub retry_multiplier: f64,
    /// Applied once per attempt to try-job retries.
    pub try_retry_multiplier: f64,
    /// What fraction of its score a job keeps after 24 hours.
    pub decay_24h_amount: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            try_job_score: 1e9,
            force_run_score: 1e6,
            retry_multiplier: 0.75,
            try_retry_multiplier: 0.5,
            decay_24h_amount: 0.9,
        }
    }
}

/// Testedness of a task covering `n` commits: 1 for the first commit plus
/// a diminishing share for each additional one. Broader coverage is worth
/// more, but less per commit.
pub fn testedness(n: i64) -> f64 {
    if n <= 0 {
        0.0
    } else {
        1.0 + (n - 1) as f64 / n as f64
    }
}

/// Testedness gained by replacing a prior blamelist of `b_prior` commits
/// with a new task covering `b_new` of them (the prior task keeps
/// `b_prior - b_new`).
///
/// With no prior coverage the gain counts every newly covered commit. A
/// same-size replacement is a pure retry and gains nothing. A bisect or
/// backfill splits the prior range and may even be negative when the split
/// is lopsided.
pub fn testedness_increase(b_new: i64, b_prior: i64) -> f64 {
    if b_prior == 0 {
        b_new as f64 + testedness(b_new)
    } else if b_prior == b_new {
        0.0
    } else {
        2.0 * testedness(b_prior - b_new) - testedness(b_prior)
    }
}

#[derive(Debug, Clone)]
pub struct Scorer {
    config: ScoreConfig,
}

impl Scorer {
    pub fn new(config: ScoreConfig) -> Self {
        Self { config }
    }

    /// Score decay for one job: linear in the job's age, scaled so that a
    /// 24-hour-old job keeps `decay_24h_amount` of its score, floored at
    /// zero.
    fn time_decay(&self, now: DateTime<Utc>, created: DateTime<Utc>) -> f64 {
        let hours = (now - created).num_milliseconds() as f64 / 3_600_000.0;
        if hours <= 0.0 {
            return 1.0;
        }
        (1.0 - (hours / 24.0) * (1.0 - self.config.decay_24h_amount)).max(0.0)
    }

    /// Combined priority of all jobs depending on a candidate. Each extra
    /// job raises the aggregate, asymptotically approaching 1.
    fn priority_aggregate(candidate: &TaskCandidate) -> f64 {
        1.0 - candidate
            .jobs
            .iter()
            .map(|j| 1.0 - j.priority)
            .product::<f64>()
    }

    /// Attach a score to the candidate. Try-jobs and force-runs sit above
    /// all regular work by construction; regular candidates are valued by
    /// the testedness they add, decayed by job age.
    pub fn score(&self, candidate: &mut TaskCandidate, now: DateTime<Utc>) {
        let aggregate = Self::priority_aggregate(candidate);
        let blamelist_len = candidate.commits.len() as i64;

        let mut score = if candidate.is_try_job() {
            // Try-jobs carry no blamelist.
            candidate.commits.clear();
            candidate.stealing_from = None;
            (self.config.try_job_score + 1.0) * aggregate
        } else if candidate.is_force_run() {
            (self.config.force_run_score + blamelist_len as f64) * aggregate
        } else {
            let prior_len = match (&candidate.stealing_from, &candidate.retry_of) {
                // A retry takes back its own blamelist; score it as if the
                // commits were untested rather than crediting the steal.
                (Some(prev), Some(retry_of)) if &prev.id == retry_of => 0,
                (Some(prev), _) => prev.commits.len() as i64,
                (None, _) => 0,
            };
            let decay = candidate
                .jobs
                .iter()
                .map(|j| self.time_decay(now, j.created))
                .fold(0.0, f64::max);
            testedness_increase(blamelist_len, prior_len) * aggregate * decay
        };

        if candidate.attempt > 0 {
            let multiplier = if candidate.is_try_job() {
                self.config.try_retry_multiplier
            } else {
                self.config.retry_multiplier
            };
            score *= multiplier.powi(candidate.attempt as i32);
        }

        candidate.score = score;
    }
}
