use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use conveyor_lib::{CommitHash, Job, Task, TaskKey, TaskSpec};
use serde::Serialize;

use crate::blacklist::Blacklist;
use crate::cfg_cache::{CfgCacheError, TasksCfgProvider};
use crate::repograph::RepoGraph;

/// Read view over recorded tasks; backed by the task cache in production
/// and by plain maps in tests.
pub trait TaskView {
    /// The highest-attempt recorded task at a key.
    fn latest_attempt(&self, key: &TaskKey) -> Option<Task>;

    /// The recorded task for `(repo, name)` whose blamelist contains the
    /// commit.
    fn task_for_commit(&self, repo: &str, name: &str, commit: &CommitHash) -> Option<Task>;
}

/// A task instance that might be dispatched this tick. Lives for exactly
/// one pass through filter, scoring and matching.
#[derive(Debug, Clone)]
pub struct TaskCandidate {
    pub key: TaskKey,
    pub spec: TaskSpec,
    /// Jobs that need this task, ordered by `(created, id)` so downstream
    /// priority aggregation is reproducible.
    pub jobs: Vec<Job>,
    pub attempt: u32,
    pub retry_of: Option<String>,
    pub forced_job_id: Option<String>,
    /// Ids of the successful dependency tasks, filled by the filter.
    pub parent_task_ids: Vec<String>,
    pub score: f64,
    /// The blamelist; empty until scored, and always empty for try-jobs.
    pub commits: Vec<CommitHash>,
    /// The prior task whose blamelist this candidate would truncate.
    pub stealing_from: Option<Task>,
}

impl TaskCandidate {
    fn new(key: TaskKey, spec: TaskSpec) -> Self {
        Self {
            key,
            spec,
            jobs: Vec::new(),
            attempt: 0,
            retry_of: None,
            forced_job_id: None,
            parent_task_ids: Vec::new(),
            score: 0.0,
            commits: Vec::new(),
            stealing_from: None,
        }
    }

    pub fn is_try_job(&self) -> bool {
        self.key.is_try_job()
    }

    pub fn is_force_run(&self) -> bool {
        self.forced_job_id.is_some()
    }
}

/// Candidates of one tick, keyed for dedup.
pub type CandidateSet = BTreeMap<TaskKey, TaskCandidate>;

/// Permanent per-job problems found while generating candidates. The jobs
/// involved produce no candidates; an external collaborator may cancel
/// them.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CandidateError {
    #[error("job {job_id}: task spec {task:?} is not defined at {repo_state}")]
    MissingTaskSpec {
        job_id: String,
        task: String,
        repo_state: String,
    },
    #[error("job {job_id}: {err}")]
    Cfg {
        job_id: String,
        #[source]
        err: CfgCacheError,
    },
}

/// Why the filter removed a candidate; recorded in the tick diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FilterReason {
    AlreadyScheduled { superseded_by_task: String },
    RetriesExhausted { last_attempt_task: String },
    MissingDependencies { missing: Vec<String> },
    Blacklisted { rule: String },
}

/// Walk the dependency graphs of the unfinished jobs and produce the
/// de-duplicated candidate set, plus any permanent per-job errors.
///
/// A job whose revision is absent from its repo produces nothing, silently:
/// the mirror may simply not have caught up yet.
pub fn generate_candidates(
    jobs: &[Job],
    cfgs: &dyn TasksCfgProvider,
    repos: &HashMap<String, Arc<RepoGraph>>,
) -> (CandidateSet, Vec<CandidateError>) {
    let mut sorted: Vec<&Job> = jobs.iter().filter(|j| !j.done()).collect();
    sorted.sort_by(|a, b| (a.created, &a.id).cmp(&(b.created, &b.id)));

    let mut set = CandidateSet::new();
    let mut errors = Vec::new();

    'jobs: for job in sorted {
        let Some(graph) = repos.get(job.repo_state.repo()) else {
            tracing::debug!("job {} names untracked repo {}", job.id, job.repo_state.repo());
            continue;
        };
        if !graph.contains(job.repo_state.revision()) {
            continue;
        }
        let cfg = match cfgs.get(&job.repo_state) {
            Ok(cfg) => cfg,
            Err(err) => {
                errors.push(CandidateError::Cfg {
                    job_id: job.id.clone(),
                    err,
                });
                continue;
            }
        };
        // Make sure the whole graph resolves before emitting any of it.
        for name in job.task_names() {
            if !cfg.tasks.contains_key(name) {
                errors.push(CandidateError::MissingTaskSpec {
                    job_id: job.id.clone(),
                    task: name.to_string(),
                    repo_state: job.repo_state.to_string(),
                });
                continue 'jobs;
            }
        }
        for name in job.task_names() {
            let key = job.task_key(name);
            let candidate = set
                .entry(key.clone())
                .or_insert_with(|| TaskCandidate::new(key, cfg.tasks[name].clone()));
            candidate.jobs.push(job.clone());
            if job.is_force && candidate.forced_job_id.is_none() {
                candidate.forced_job_id = Some(job.id.clone());
            }
        }
    }
    (set, errors)
}

/// Candidates that survived the filter, grouped by `(repo, task name)` for
/// the blamelist and scoring stage.
pub type GroupedCandidates = BTreeMap<(String, String), Vec<TaskCandidate>>;

/// Remove candidates that are already satisfied, missing dependencies, or
/// blacklisted; promote retries of failed tasks. Returns the survivors
/// grouped by `(repo, task name)` alongside the rejections.
pub fn filter_candidates(
    set: CandidateSet,
    tasks: &dyn TaskView,
    blacklist: &Blacklist,
) -> (GroupedCandidates, Vec<(TaskKey, FilterReason)>) {
    let mut grouped = GroupedCandidates::new();
    let mut rejected = Vec::new();

    'candidates: for (key, mut candidate) in set {
        if let Some(prev) = tasks.latest_attempt(&key) {
            if prev.satisfies_rerun() && !candidate.is_force_run() {
                rejected.push((
                    key,
                    FilterReason::AlreadyScheduled {
                        superseded_by_task: prev.id,
                    },
                ));
                continue;
            }
            if prev.status.is_failed() {
                if !prev.retryable() && !candidate.is_force_run() {
                    rejected.push((
                        key,
                        FilterReason::RetriesExhausted {
                            last_attempt_task: prev.id,
                        },
                    ));
                    continue;
                }
                if !candidate.is_force_run() {
                    candidate.attempt = prev.attempt + 1;
                    candidate.retry_of = Some(prev.id);
                }
            }
        }

        let mut missing = Vec::new();
        for dep in &candidate.spec.dependencies {
            let dep_key = TaskKey::new(key.repo_state().clone(), dep.clone());
            match tasks.latest_attempt(&dep_key) {
                Some(dep_task) if dep_task.status.is_success() => {
                    candidate.parent_task_ids.push(dep_task.id);
                }
                _ => missing.push(dep.clone()),
            }
        }
        if !missing.is_empty() {
            rejected.push((key, FilterReason::MissingDependencies { missing }));
            continue 'candidates;
        }

        if let Some(rule) = blacklist.first_match(key.name(), key.repo(), key.revision()) {
            rejected.push((key, FilterReason::Blacklisted { rule }));
            continue;
        }

        grouped
            .entry((key.repo().to_string(), key.name().clone()))
            .or_default()
            .push(candidate);
    }
    (grouped, rejected)
}
