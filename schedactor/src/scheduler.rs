use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conveyor_core::{
    match_bots, regenerate_queue, Blacklist, BlacklistRule, BusyBots, QueueInputs, RepoError,
    RepoGraph, RepoMirror, TaskView, TasksCfgProvider,
};
use conveyor_lib::{Job, JobStatus, Task, TaskKey, Trigger};
use conveyor_taskdb::{Db, JobCache, TaskCache, TaskDbError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ExecutionBackend};
use crate::config::SchedulerConfig;
use crate::diagnostics::{CandidateRecord, DiagnosticsSink, RejectedRecord, TickDiagnostics};
use crate::dispatcher::{dispatch_one, DispatchCtx, DispatchOutcome};
use crate::gatherer::{gather_new_jobs, trigger_periodic_jobs};

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("repo refresh failed: {0}")]
    Repo(#[from] RepoError),
    #[error("store failure: {0}")]
    Db(#[from] TaskDbError),
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),
    #[error("no such job {0}")]
    UnknownJob(String),
}

/// What one tick did; the run loop logs it, the tests assert on it.
#[derive(Debug, Default, Clone)]
pub struct TickSummary {
    pub new_jobs: usize,
    pub candidates: usize,
    pub matched: usize,
    pub dispatched: usize,
    pub deduplicated: usize,
    pub mishaps: usize,
    /// Candidates left unmatched after this tick.
    pub queue_remaining: usize,
    pub errors: Vec<String>,
}

/// The scheduling engine: owns the in-memory queue and busy-bot set, and
/// drives candidates from unfinished jobs onto workers every tick.
pub struct Scheduler {
    config: SchedulerConfig,
    db: Arc<dyn Db>,
    backend: Arc<dyn ExecutionBackend>,
    cfgs: Arc<dyn TasksCfgProvider>,
    mirrors: Vec<Arc<dyn RepoMirror>>,
    blacklist: Arc<Blacklist>,
    tasks: Arc<TaskCache>,
    jobs: Arc<JobCache>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    /// Latest graph snapshot per repo url; replaced wholesale on refresh.
    graphs: Mutex<HashMap<String, Arc<RepoGraph>>>,
}

impl Scheduler {
    pub async fn new(
        config: SchedulerConfig,
        db: Arc<dyn Db>,
        backend: Arc<dyn ExecutionBackend>,
        cfgs: Arc<dyn TasksCfgProvider>,
        mirrors: Vec<Arc<dyn RepoMirror>>,
        blacklist: Arc<Blacklist>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self, SchedulerError> {
        // Cache a margin past the window so tasks anchoring older
        // blamelists are still visible.
        let since = config.window_start(Utc::now()) - chrono::Duration::days(2);
        let tasks = Arc::new(TaskCache::new(db.clone(), since).await?);
        let jobs = Arc::new(JobCache::new(db.clone(), since).await?);
        Ok(Self {
            config,
            db,
            backend,
            cfgs,
            mirrors,
            blacklist,
            tasks,
            jobs,
            diagnostics,
            graphs: Mutex::new(HashMap::new()),
        })
    }

    /// The periodic driver. Runs ticks at the configured period until
    /// cancelled; a failed or timed-out tick is logged and the next one
    /// starts from the persisted state.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_period_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let deadline = Duration::from_secs(self.config.tick_timeout_secs.max(1));
        info!(
            "scheduler running: tick every {}s, pool {:?}",
            self.config.tick_period_secs, self.config.pool
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }
            conveyor_metrics::TICK_COUNT.inc();
            let started = Instant::now();
            match tokio::time::timeout(deadline, self.tick(Utc::now())).await {
                Ok(Ok(summary)) => {
                    debug!(
                        "tick done in {:?}: {} matched, {} queued, {} errors",
                        started.elapsed(),
                        summary.matched,
                        summary.queue_remaining,
                        summary.errors.len()
                    );
                }
                Ok(Err(err)) => {
                    conveyor_metrics::TICK_FAILURE_COUNT.inc();
                    warn!("tick failed: {err}");
                }
                Err(_) => {
                    conveyor_metrics::TICK_FAILURE_COUNT.inc();
                    warn!("tick exceeded {deadline:?}, aborted; partial work stands");
                }
            }
            conveyor_metrics::observe_tick_duration(started.elapsed());
        }
    }

    /// One scheduling tick. Public so tests and the trigger surface can
    /// drive the engine at a logical time.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary, SchedulerError> {
        let mut summary = TickSummary::default();

        // Ingest writes from the previous tick.
        self.tasks.update().await?;
        self.jobs.update().await?;

        // Refresh repos and materialize jobs for new commits; a repo that
        // cannot advance fails the whole tick.
        summary.new_jobs = self.refresh_repos(now, &mut summary.errors).await?;
        self.jobs.update().await?;

        // Poll the backend for every unfinished task.
        self.refresh_task_statuses(&mut summary.errors).await;
        self.tasks.update().await?;

        // Worker state: everything alive minus whatever is already spoken
        // for by pending backend tasks.
        let bots = self.backend.list_bots(&self.config.pool).await?;
        let pending = self.backend.list_pending_tasks(&self.config.pool).await?;
        let pending_dims: Vec<_> = pending
            .iter()
            .map(|t| t.dimensions_requested.clone())
            .collect();
        let mut busy = BusyBots::new();
        busy.mark_pending(&bots, &pending_dims);
        let busy_before_match = busy.len();

        // Regenerate the queue from scratch.
        let graphs = self.graphs.lock().unwrap().clone();
        let unfinished_jobs = self.jobs.unfinished();
        let inputs = QueueInputs {
            repos: &graphs,
            cfgs: self.cfgs.as_ref(),
            tasks: self.tasks.as_ref(),
            blacklist: self.blacklist.as_ref(),
            score: &self.config.score,
            window_start: self.config.window_start(now),
            max_blamelist_commits: self.config.max_blamelist_commits,
            now,
        };
        let queue = regenerate_queue(&unfinished_jobs, &inputs);
        summary.candidates = queue.candidates.len();
        summary
            .errors
            .extend(queue.errors.iter().map(|e| e.to_string()));
        conveyor_metrics::CANDIDATE_COUNT
            .with_label_values(&["scored"])
            .inc_by(queue.candidates.len() as f64);
        conveyor_metrics::CANDIDATE_COUNT
            .with_label_values(&["rejected"])
            .inc_by(queue.rejected.len() as f64);

        let candidate_records: Vec<CandidateRecord> =
            queue.candidates.iter().map(CandidateRecord::from).collect();
        let rejected_records: Vec<RejectedRecord> =
            queue.rejected.iter().map(RejectedRecord::from).collect();

        // Match and dispatch.
        let (matches, unmatched, match_diags) = match_bots(queue.candidates, &bots, &mut busy);
        summary.matched = matches.len();
        summary.queue_remaining = unmatched.len();
        conveyor_metrics::QUEUE_SIZE.set(unmatched.len() as i64);

        let dispatched_ids = self
            .dispatch_matches(matches, &graphs, now, &mut busy, &mut summary)
            .await;

        // Derive job completion from the refreshed task state.
        self.tasks.update().await?;
        self.update_job_statuses(now, &mut summary.errors).await;
        self.jobs.update().await?;

        let diagnostics = TickDiagnostics {
            timestamp: now,
            num_unfinished_jobs: unfinished_jobs.len(),
            num_bots: bots.len(),
            num_busy_bots: busy_before_match,
            candidates: candidate_records,
            rejected: rejected_records,
            matches: match_diags,
            dispatched_task_ids: dispatched_ids,
            errors: summary.errors.clone(),
        };
        if let Err(err) = self.diagnostics.record(&diagnostics) {
            warn!("failed to record tick diagnostics: {err}");
        }

        Ok(summary)
    }

    /// Update every mirror, publish fresh graph snapshots, and create jobs
    /// for new commits on tracked branches.
    async fn refresh_repos(
        &self,
        now: DateTime<Utc>,
        errors: &mut Vec<String>,
    ) -> Result<usize, SchedulerError> {
        let mut created = 0;
        for mirror in &self.mirrors {
            let update = mirror.update().await?;
            let (new_jobs, gather_errors) = gather_new_jobs(
                &update,
                &self.config,
                self.cfgs.as_ref(),
                self.jobs.as_ref(),
                self.db.as_ref(),
                now,
            )
            .await?;
            created += new_jobs;
            errors.extend(gather_errors);
            self.graphs
                .lock()
                .unwrap()
                .insert(update.graph.repo().to_string(), update.graph.clone());
        }
        if created > 0 {
            conveyor_metrics::JOB_CREATED_COUNT
                .with_label_values(&["commit"])
                .inc_by(created as f64);
        }
        Ok(created)
    }

    /// Poll the backend for every cached task in a non-terminal state and
    /// persist whatever changed. Per-task failures are partial; the tick
    /// carries on.
    async fn refresh_task_statuses(&self, errors: &mut Vec<String>) {
        for mut task in self.tasks.unfinished() {
            let Some(backend_id) = task.backend_task_id.clone() else {
                continue;
            };
            let result = match self.backend.get_task(&backend_id).await {
                Ok(result) => result,
                Err(err) => {
                    errors.push(format!("poll {backend_id}: {err}"));
                    continue;
                }
            };
            let status = result.status();
            if status == task.status {
                continue;
            }
            debug!("task {} {} -> {}", task.id, task.status, status);
            task.status = status;
            task.started = result.started_ts.or(task.started);
            task.finished = result.completed_ts.or(result.abandoned_ts);
            task.output_ref = result.output_ref.or(task.output_ref);
            if status.is_failed() && task.failure_reason.is_none() {
                task.failure_reason = Some(format!("backend state {:?}", result.state));
            }
            if let Err(err) = self.db.put_task(&mut task).await {
                // A conflict just means someone else got there; the next
                // tick sees the winning version.
                warn!("failed to persist status of {}: {err}", task.id);
                errors.push(format!("persist {}: {err}", task.id));
            }
        }
    }

    /// Fan dispatch out over the matched pairs under the configured
    /// concurrency limit. Transient failures release the worker
    /// reservation and surface in the tick errors.
    async fn dispatch_matches(
        &self,
        matches: Vec<conveyor_core::Match>,
        graphs: &HashMap<String, Arc<RepoGraph>>,
        now: DateTime<Utc>,
        busy: &mut BusyBots,
        summary: &mut TickSummary,
    ) -> Vec<String> {
        if matches.is_empty() {
            return Vec::new();
        }
        let ctx = DispatchCtx {
            db: self.db.clone(),
            backend: self.backend.clone(),
            tasks: self.tasks.clone(),
            cfgs: self.cfgs.clone(),
            graphs: graphs.clone(),
            window_start: self.config.window_start(now),
            max_blamelist_commits: self.config.max_blamelist_commits,
            retry_cas_attempts: self.config.retry_cas_attempts,
            now,
        };
        // Pairs for the same `(repo, task name)` re-partition the same
        // blamelists, so they run in queue order within one group; groups
        // fan out under the concurrency limit.
        let mut groups: HashMap<(String, String), Vec<conveyor_core::Match>> = HashMap::new();
        for matched in matches {
            let group = (
                matched.candidate.key.repo().to_string(),
                matched.candidate.key.name().clone(),
            );
            groups.entry(group).or_default().push(matched);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.dispatch_concurrency.max(1)));
        let mut join_set = JoinSet::new();
        for (_, group) in groups {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let mut results = Vec::with_capacity(group.len());
                for matched in group {
                    let _permit = semaphore.acquire().await.expect("semaphore open");
                    let outcome = dispatch_one(&ctx, &matched.candidate, &matched.bot_id).await;
                    results.push((matched, outcome));
                }
                results
            });
        }

        let mut dispatched_ids = Vec::new();
        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(group_results) => results.extend(group_results),
                Err(join_err) => {
                    conveyor_metrics::DISPATCH_COUNT
                        .with_label_values(&["failed"])
                        .inc();
                    summary.errors.push(format!("dispatch task panicked: {join_err}"));
                }
            }
        }
        for (matched, outcome) in results {
            match outcome {
                Ok(outcome) => {
                    let label = match &outcome {
                        DispatchOutcome::Dispatched { .. } => {
                            summary.dispatched += 1;
                            "dispatched"
                        }
                        DispatchOutcome::Deduplicated { .. } => {
                            summary.deduplicated += 1;
                            "deduplicated"
                        }
                        DispatchOutcome::Mishap { .. } => {
                            summary.mishaps += 1;
                            "mishap"
                        }
                    };
                    conveyor_metrics::DISPATCH_COUNT
                        .with_label_values(&[label])
                        .inc();
                    dispatched_ids.push(outcome.task_id().to_string());
                }
                Err(err) => {
                    busy.release(&matched.bot_id);
                    conveyor_metrics::DISPATCH_COUNT
                        .with_label_values(&["failed"])
                        .inc();
                    warn!("dispatch failed: {err}");
                    summary.errors.push(err.to_string());
                }
            }
        }
        dispatched_ids.sort();
        dispatched_ids
    }

    /// Derive the status of unfinished jobs from their tasks and persist
    /// transitions.
    async fn update_job_statuses(&self, now: DateTime<Utc>, errors: &mut Vec<String>) {
        for mut job in self.jobs.unfinished() {
            let mut all_succeeded = true;
            let mut failed = false;
            for name in job.dependencies.keys() {
                let key = TaskKey::new(job.repo_state.clone(), name.clone());
                match self.tasks.latest_attempt(&key) {
                    Some(task) if task.status.is_success() => {}
                    Some(task) if task.status.is_failed() && !task.retryable() => {
                        failed = true;
                        all_succeeded = false;
                    }
                    _ => all_succeeded = false,
                }
            }
            let next = if failed {
                JobStatus::Failure
            } else if all_succeeded {
                JobStatus::Success
            } else {
                continue;
            };
            info!("job {} -> {next:?}", job.id);
            job.status = next;
            job.finished = Some(now);
            if let Err(err) = self.db.put_job(&mut job).await {
                warn!("failed to persist job {}: {err}", job.id);
                errors.push(format!("persist job {}: {err}", job.id));
            }
        }
    }

    /// Materialize jobs for a periodic trigger (nightly, weekly) at the
    /// tip of every tracked branch.
    pub async fn maybe_trigger_periodic_jobs(
        &self,
        trigger: Trigger,
    ) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        self.jobs.update().await?;
        let mut graphs = self.graphs.lock().unwrap().clone();
        if graphs.is_empty() {
            // Before the first tick there is no snapshot yet.
            let mut errors = Vec::new();
            self.refresh_repos(now, &mut errors).await?;
            for err in errors {
                warn!("{err}");
            }
            graphs = self.graphs.lock().unwrap().clone();
        }
        let (created, errors) = trigger_periodic_jobs(
            trigger,
            &graphs,
            &self.config,
            self.cfgs.as_ref(),
            self.jobs.as_ref(),
            self.db.as_ref(),
            now,
        )
        .await?;
        for err in errors {
            warn!("periodic trigger: {err}");
        }
        if created > 0 {
            conveyor_metrics::JOB_CREATED_COUNT
                .with_label_values(&["periodic"])
                .inc_by(created as f64);
        }
        self.jobs.update().await?;
        Ok(created)
    }

    /// Every recorded task attempt belonging to the job's graph.
    pub async fn tasks_for_job(&self, job_id: &str) -> Result<Vec<Task>, SchedulerError> {
        let job: Job = match self.jobs.get(job_id) {
            Some(job) => job,
            None => self
                .db
                .get_job(job_id)
                .await?
                .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?,
        };
        let mut tasks = Vec::new();
        for name in job.dependencies.keys() {
            let key = TaskKey::new(job.repo_state.clone(), name.clone());
            tasks.extend(self.db.get_tasks_by_key(&key).await?);
        }
        Ok(tasks)
    }

    /// The active blacklist rules.
    pub fn blacklist(&self) -> Vec<BlacklistRule> {
        self.blacklist.rules()
    }
}
