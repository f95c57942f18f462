use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conveyor_core::{
    compute_blamelist, RepoError, RepoGraph, TaskCandidate, TasksCfgProvider, ViewOracle,
};
use conveyor_lib::{CommitHash, Task, TaskStatus};
use conveyor_taskdb::{Db, TaskCache, TaskDbError};
use tracing::{info, warn};

use crate::backend::{
    BackendError, ExecutionBackend, TaskRequest, TAG_ATTEMPT, TAG_DIM_POOL, TAG_FORCED_JOB_ID,
    TAG_ID, TAG_NAME, TAG_REPO, TAG_RETRY_OF, TAG_REVISION,
};

/// Everything one dispatch needs; cloned into each per-pair future.
#[derive(Clone)]
pub struct DispatchCtx {
    pub db: Arc<dyn Db>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub tasks: Arc<TaskCache>,
    pub cfgs: Arc<dyn TasksCfgProvider>,
    pub graphs: HashMap<String, Arc<RepoGraph>>,
    pub window_start: DateTime<Utc>,
    pub max_blamelist_commits: usize,
    pub retry_cas_attempts: usize,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Task inserted pending and submitted to the backend.
    Dispatched { task_id: String },
    /// The backend served a cached result; the task is recorded as already
    /// successful.
    Deduplicated { task_id: String },
    /// The submission failed permanently; a mishap task records it.
    Mishap { task_id: String },
}

impl DispatchOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            DispatchOutcome::Dispatched { task_id }
            | DispatchOutcome::Deduplicated { task_id }
            | DispatchOutcome::Mishap { task_id } => task_id,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    /// The pair is abandoned for this tick; the candidate will come back
    /// next tick.
    #[error("transient backend failure for {key}: {err}")]
    Transient { key: String, err: BackendError },
    #[error("gave up on {key} after {attempts} store conflicts")]
    CasExhausted { key: String, attempts: usize },
    #[error("store failure for {key}: {err}")]
    Db { key: String, err: TaskDbError },
    #[error("repo graph failure for {key}: {err}")]
    Repo { key: String, err: RepoError },
    #[error("no graph for repo {0}")]
    UnknownRepo(String),
}

/// Dispatch one matched pair: compute the final blamelist, submit to the
/// backend, and persist the new task together with any truncated
/// predecessor in a single compare-and-swap. A conflict means someone
/// re-partitioned under us; the blamelist is recomputed from the refreshed
/// cache and the write retried, bounded by `retry_cas_attempts`.
pub async fn dispatch_one(
    ctx: &DispatchCtx,
    candidate: &TaskCandidate,
    bot_id: &str,
) -> Result<DispatchOutcome, DispatchError> {
    let key = candidate.key.to_string();
    let repo = candidate.key.repo();
    let graph = ctx
        .graphs
        .get(repo)
        .ok_or_else(|| DispatchError::UnknownRepo(repo.to_string()))?
        .clone();

    let task_id = ctx
        .db
        .assign_task_id()
        .await
        .map_err(|err| DispatchError::Db {
            key: key.clone(),
            err,
        })?;

    let request = build_request(candidate, &task_id);
    let (status, backend_task_id, output_ref, finished, failure_reason) =
        match ctx.backend.submit_task(&request).await {
            Ok(meta) if meta.dedup => {
                info!("task {task_id} ({key}) deduplicated by the backend");
                (
                    TaskStatus::Success,
                    Some(meta.backend_id),
                    meta.output_ref,
                    Some(ctx.now),
                    None,
                )
            }
            Ok(meta) => (TaskStatus::Pending, Some(meta.backend_id), None, None, None),
            Err(err) if err.is_permanent() => {
                warn!("permanent submit failure for {key}: {err}");
                (
                    TaskStatus::Mishap,
                    None,
                    None,
                    Some(ctx.now),
                    Some(err.to_string()),
                )
            }
            Err(err) => {
                return Err(DispatchError::Transient { key, err });
            }
        };

    let mut attempts = 0;
    loop {
        attempts += 1;

        // Pick up sibling dispatches and concurrent re-partitions before
        // computing; within one `(repo, name)` group dispatches run
        // sequentially, so earlier inserts are visible here.
        ctx.tasks.update().await.map_err(|err| DispatchError::Db {
            key: key.clone(),
            err,
        })?;

        // Final blamelist against the latest cache snapshot.
        let (commits, stole_from) = if candidate.is_try_job() {
            (Vec::new(), None)
        } else {
            let oracle = ViewOracle::new(
                ctx.cfgs.as_ref(),
                ctx.tasks.as_ref(),
                repo,
                candidate.key.name(),
            );
            let blamelist = compute_blamelist(
                &graph,
                &oracle,
                ctx.window_start,
                ctx.max_blamelist_commits,
                *candidate.key.revision(),
            )
            .map_err(|err| DispatchError::Repo {
                key: key.clone(),
                err,
            })?;
            (blamelist.commits, blamelist.stole_from)
        };

        let task = Task {
            id: task_id.clone(),
            name: candidate.key.name().clone(),
            repo_state: candidate.key.repo_state().clone(),
            commits: commits.clone(),
            status,
            attempt: candidate.attempt,
            retry_of: candidate.retry_of.clone(),
            parent_task_ids: candidate.parent_task_ids.clone(),
            forced_job_id: candidate.forced_job_id.clone(),
            backend_task_id: backend_task_id.clone(),
            created: ctx.now,
            started: None,
            finished,
            output_ref: output_ref.clone(),
            failure_reason: failure_reason.clone(),
            max_attempts: candidate.spec.effective_max_attempts(),
            db_modified: ctx.now,
        };

        let mut batch = vec![task];
        if let Some(mut predecessor) = stole_from {
            let stolen: Vec<CommitHash> = commits.clone();
            predecessor.commits.retain(|c| !stolen.contains(c));
            batch.push(predecessor);
        }

        match ctx.db.put_tasks(&mut batch).await {
            Ok(()) => {
                info!("dispatched {key} as task {task_id} on bot {bot_id}");
                return Ok(match status {
                    TaskStatus::Success => DispatchOutcome::Deduplicated { task_id },
                    TaskStatus::Mishap => DispatchOutcome::Mishap { task_id },
                    _ => DispatchOutcome::Dispatched { task_id },
                });
            }
            Err(TaskDbError::Conflict { id, .. }) if attempts < ctx.retry_cas_attempts => {
                warn!("store conflict on {id} while persisting {key}, recomputing blamelist");
            }
            Err(TaskDbError::Conflict { .. }) => {
                return Err(DispatchError::CasExhausted { key, attempts });
            }
            Err(err) => {
                return Err(DispatchError::Db { key, err });
            }
        }
    }
}

fn build_request(candidate: &TaskCandidate, task_id: &str) -> TaskRequest {
    let mut tags = BTreeMap::new();
    tags.insert(TAG_ID.to_string(), task_id.to_string());
    tags.insert(TAG_NAME.to_string(), candidate.key.name().clone());
    tags.insert(TAG_REPO.to_string(), candidate.key.repo().to_string());
    tags.insert(
        TAG_REVISION.to_string(),
        candidate.key.revision().to_string(),
    );
    tags.insert(TAG_ATTEMPT.to_string(), candidate.attempt.to_string());
    tags.insert(
        TAG_RETRY_OF.to_string(),
        candidate.retry_of.clone().unwrap_or_default(),
    );
    tags.insert(
        TAG_FORCED_JOB_ID.to_string(),
        candidate.forced_job_id.clone().unwrap_or_default(),
    );
    tags.insert(
        TAG_DIM_POOL.to_string(),
        candidate.spec.dimensions.pool().unwrap_or_default().to_string(),
    );

    TaskRequest {
        name: candidate.key.name().clone(),
        dimensions: candidate.spec.dimensions.clone(),
        tags,
        execution_timeout: candidate.spec.execution_timeout,
        io_timeout: candidate.spec.io_timeout,
        expiration: candidate.spec.expiration,
        extra_inputs: candidate.spec.extra_inputs.clone(),
    }
}
