use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conveyor_lib::{Job, TaskKey};

use crate::blacklist::Blacklist;
use crate::blamelist::{compute_blamelist, ViewOracle};
use crate::candidates::{
    filter_candidates, generate_candidates, CandidateError, FilterReason, TaskCandidate, TaskView,
};
use crate::cfg_cache::TasksCfgProvider;
use crate::repograph::RepoGraph;
use crate::score::{ScoreConfig, Scorer};

/// Everything the queue regeneration reads. All of it is a per-tick
/// snapshot; nothing here is mutated.
pub struct QueueInputs<'a> {
    pub repos: &'a HashMap<String, Arc<RepoGraph>>,
    pub cfgs: &'a dyn TasksCfgProvider,
    pub tasks: &'a dyn TaskView,
    pub blacklist: &'a Blacklist,
    pub score: &'a ScoreConfig,
    /// Commits older than this are never attributed or scheduled.
    pub window_start: DateTime<Utc>,
    pub max_blamelist_commits: usize,
    pub now: DateTime<Utc>,
}

/// The immutable, ordered result of one queue regeneration.
#[derive(Debug, Default)]
pub struct TickQueue {
    /// Scored candidates, best first. This order is the total order used
    /// for matching.
    pub candidates: Vec<TaskCandidate>,
    /// Candidates the filter removed, with the reason.
    pub rejected: Vec<(TaskKey, FilterReason)>,
    /// Permanent per-job errors from candidate generation.
    pub errors: Vec<CandidateError>,
}

/// Run generate, filter, blamelist and scoring over the unfinished jobs
/// and publish the sorted queue for the matcher.
pub fn regenerate_queue(jobs: &[Job], inputs: &QueueInputs<'_>) -> TickQueue {
    let (set, errors) = generate_candidates(jobs, inputs.cfgs, inputs.repos);
    let generated = set.len();
    let (grouped, rejected) = filter_candidates(set, inputs.tasks, inputs.blacklist);

    let scorer = Scorer::new(inputs.score.clone());
    let mut candidates: Vec<TaskCandidate> = Vec::new();
    for ((repo, name), group) in grouped {
        let Some(graph) = inputs.repos.get(&repo) else {
            continue;
        };
        let oracle = ViewOracle::new(inputs.cfgs, inputs.tasks, &repo, &name);
        for mut candidate in group {
            if !candidate.is_try_job() {
                match compute_blamelist(
                    graph,
                    &oracle,
                    inputs.window_start,
                    inputs.max_blamelist_commits,
                    *candidate.key.revision(),
                ) {
                    Ok(blamelist) => {
                        candidate.commits = blamelist.commits;
                        candidate.stealing_from = blamelist.stole_from;
                    }
                    Err(err) => {
                        tracing::warn!(
                            "dropping candidate {}: blamelist failed: {err}",
                            candidate.key
                        );
                        continue;
                    }
                }
            }
            scorer.score(&mut candidate, inputs.now);
            // Regular work must earn a positive score; user-requested work
            // runs regardless.
            if candidate.score > 0.0 || candidate.is_try_job() || candidate.is_force_run() {
                candidates.push(candidate);
            }
        }
    }

    candidates.sort_by(compare_candidates);
    tracing::debug!(
        "queue regenerated: {} candidates of {} generated, {} rejected",
        candidates.len(),
        generated,
        rejected.len(),
    );

    TickQueue {
        candidates,
        rejected,
        errors,
    }
}

/// Descending score; ties broken by `(repo, name, revision)` so the queue
/// order is reproducible.
fn compare_candidates(a: &TaskCandidate, b: &TaskCandidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            (a.key.repo(), a.key.name(), a.key.revision().to_string()).cmp(&(
                b.key.repo(),
                b.key.name(),
                b.key.revision().to_string(),
            ))
        })
}
