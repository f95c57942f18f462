use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use conveyor_core::{RepoGraph, RepoUpdate, TasksCfgProvider};
use conveyor_lib::{Job, JobStatus, RepoState, Trigger};
use conveyor_taskdb::{Db, JobCache, TaskDbResult};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;

/// Materialize jobs for commits that just arrived on tracked branches.
/// Returns the number of jobs created plus permanent per-state errors.
pub(crate) async fn gather_new_jobs(
    update: &RepoUpdate,
    config: &SchedulerConfig,
    cfgs: &dyn TasksCfgProvider,
    jobs: &JobCache,
    db: &dyn Db,
    now: DateTime<Utc>,
) -> TaskDbResult<(usize, Vec<String>)> {
    let window_start = config.window_start(now);
    let mut created = 0;
    let mut errors = Vec::new();
    // Dedup within this batch: a commit can arrive on several branches.
    let mut seen: HashSet<(RepoState, String)> = HashSet::new();

    for news in &update.new_commits {
        if !config.tracks_branch(&news.branch) {
            debug!("ignoring {} commits on untracked branch {}", news.commits.len(), news.branch);
            continue;
        }
        for hash in &news.commits {
            let Some(commit) = update.graph.get(hash) else {
                continue;
            };
            if commit.timestamp() < window_start {
                continue;
            }
            let repo_state = RepoState::new(update.graph.repo().to_string(), *hash);
            let cfg = match cfgs.get(&repo_state) {
                Ok(cfg) => cfg,
                Err(err) => {
                    errors.push(err.to_string());
                    continue;
                }
            };
            for (name, spec) in &cfg.jobs {
                let wanted = match spec.trigger {
                    Trigger::AnyCommit => true,
                    Trigger::MainOnly => news.branch == config.main_branch,
                    Trigger::Nightly | Trigger::Weekly => false,
                };
                if !wanted {
                    continue;
                }
                if !seen.insert((repo_state.clone(), name.clone())) {
                    continue;
                }
                if !jobs.jobs_at(&repo_state, name).is_empty() {
                    continue;
                }
                match make_job(db, cfgs, &repo_state, name, spec.priority, now).await
                {
                    Ok(()) => created += 1,
                    Err(err) => errors.push(err),
                }
            }
        }
    }
    if created > 0 {
        info!("created {created} jobs for new commits in {}", update.graph.repo());
    }
    Ok((created, errors))
}

/// Materialize jobs for a periodic trigger at the tip of each tracked
/// branch. Skips `(branch tip, job)` pairs already materialized within the
/// trigger's natural period.
pub(crate) async fn trigger_periodic_jobs(
    trigger: Trigger,
    graphs: &HashMap<String, Arc<RepoGraph>>,
    config: &SchedulerConfig,
    cfgs: &dyn TasksCfgProvider,
    jobs: &JobCache,
    db: &dyn Db,
    now: DateTime<Utc>,
) -> TaskDbResult<(usize, Vec<String>)> {
    let Some(period) = trigger.period() else {
        warn!("trigger {trigger} is not periodic, nothing to do");
        return Ok((0, Vec::new()));
    };
    let period = Duration::from_std(period).expect("trigger period fits");
    let mut created = 0;
    let mut errors = Vec::new();

    for graph in graphs.values() {
        for (branch, tip) in graph.branches() {
            if !config.tracks_branch(branch) {
                continue;
            }
            let repo_state = RepoState::new(graph.repo().to_string(), *tip);
            let cfg = match cfgs.get(&repo_state) {
                Ok(cfg) => cfg,
                Err(err) => {
                    errors.push(err.to_string());
                    continue;
                }
            };
            for (name, spec) in &cfg.jobs {
                if spec.trigger != trigger {
                    continue;
                }
                let recent = jobs
                    .jobs_at(&repo_state, name)
                    .into_iter()
                    .any(|j| now - j.created < period);
                if recent {
                    debug!("{name} at {} already triggered this period", tip.short());
                    continue;
                }
                match make_job(db, cfgs, &repo_state, name, spec.priority, now).await
                {
                    Ok(()) => created += 1,
                    Err(err) => errors.push(err),
                }
            }
        }
    }
    if created > 0 {
        info!("created {created} jobs for trigger {trigger}");
    }
    Ok((created, errors))
}

async fn make_job(
    db: &dyn Db,
    cfgs: &dyn TasksCfgProvider,
    repo_state: &RepoState,
    name: &str,
    priority: f64,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let cfg = cfgs.get(repo_state).map_err(|e| e.to_string())?;
    let dependencies = cfg.expand_job(name).map_err(|e| e.to_string())?;
    let id = db.assign_job_id().await.map_err(|e| e.to_string())?;
    let mut job = Job {
        id,
        name: name.to_string(),
        repo_state: repo_state.clone(),
        created: now,
        priority,
        dependencies,
        status: JobStatus::InProgress,
        finished: None,
        is_force: false,
        db_modified: now,
    };
    db.put_job(&mut job).await.map_err(|e| e.to_string())?;
    debug!("created job {} ({name} at {repo_state})", job.id);
    Ok(())
}
