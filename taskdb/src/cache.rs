use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use conveyor_lib::{CommitHash, Job, RepoState, Task, TaskKey};
use conveyor_core::TaskView;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

use crate::{Db, DbEvent, TaskDbResult};

fn far_future() -> DateTime<Utc> {
    Utc::now() + Duration::days(3650)
}

/// In-memory view of the recorded tasks the scheduler cares about: the
/// scheduling window plus anything unfinished. Fed by the store's change
/// stream; falls back to a full reload when the stream lags.
pub struct TaskCache {
    db: Arc<dyn Db>,
    rx: Mutex<broadcast::Receiver<DbEvent>>,
    since: DateTime<Utc>,
    tasks: DashMap<String, Task>,
    by_key: DashMap<TaskKey, Vec<String>>,
    /// `(repo, task name)` to blamelist-commit ownership.
    by_commit: DashMap<(String, String), HashMap<CommitHash, String>>,
}

impl TaskCache {
    pub async fn new(db: Arc<dyn Db>, since: DateTime<Utc>) -> TaskDbResult<Self> {
        // Subscribe before the initial read so no write can fall between.
        let rx = db.subscribe();
        let cache = Self {
            db,
            rx: Mutex::new(rx),
            since,
            tasks: DashMap::new(),
            by_key: DashMap::new(),
            by_commit: DashMap::new(),
        };
        cache.reload().await?;
        Ok(cache)
    }

    async fn reload(&self) -> TaskDbResult<()> {
        self.tasks.clear();
        self.by_key.clear();
        self.by_commit.clear();
        let mut tasks = self.db.tasks_in_date_range(self.since, far_future()).await?;
        // Long-running work from before the window still matters.
        tasks.extend(self.db.unfinished_tasks().await?);
        for task in tasks {
            self.apply(&task);
        }
        Ok(())
    }

    /// Drain pending change notifications into the cache. Called once at
    /// the top of each tick.
    pub async fn update(&self) -> TaskDbResult<()> {
        loop {
            let event = self.rx.lock().unwrap().try_recv();
            match event {
                Ok(DbEvent::TasksModified(tasks)) => {
                    for task in &tasks {
                        self.apply(task);
                    }
                }
                Ok(DbEvent::JobsModified(_)) => {}
                Err(broadcast::error::TryRecvError::Empty) => return Ok(()),
                Err(broadcast::error::TryRecvError::Closed) => return Ok(()),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("task cache lagged {n} events behind, reloading");
                    return self.reload().await;
                }
            }
        }
    }

    fn apply(&self, task: &Task) {
        let previous = self.tasks.get(&task.id).map(|t| t.clone());
        match &previous {
            Some(old) => {
                // Drop commit ownership the new version no longer claims.
                let group = (old.repo_state.repo().to_string(), old.name.clone());
                if let Some(mut index) = self.by_commit.get_mut(&group) {
                    for commit in &old.commits {
                        if index.get(commit) == Some(&old.id) {
                            index.remove(commit);
                        }
                    }
                }
            }
            None => {
                let mut ids = self.by_key.entry(task.key()).or_default();
                if !ids.contains(&task.id) {
                    ids.push(task.id.clone());
                }
            }
        }
        let group = (task.repo_state.repo().to_string(), task.name.clone());
        let mut index = self.by_commit.entry(group).or_default();
        for commit in &task.commits {
            index.insert(*commit, task.id.clone());
        }
        drop(index);
        self.tasks.insert(task.id.clone(), task.clone());
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).map(|t| t.clone())
    }

    pub fn unfinished(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| !t.done())
            .map(|t| t.clone())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn tasks_by_key(&self, key: &TaskKey) -> Vec<Task> {
        let Some(ids) = self.by_key.get(key) else {
            return Vec::new();
        };
        let mut tasks: Vec<Task> = ids.iter().filter_map(|id| self.get(id)).collect();
        tasks.sort_by(|a, b| a.attempt.cmp(&b.attempt).then(a.id.cmp(&b.id)));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskView for TaskCache {
    fn latest_attempt(&self, key: &TaskKey) -> Option<Task> {
        self.tasks_by_key(key).into_iter().last()
    }

    fn task_for_commit(&self, repo: &str, name: &str, commit: &CommitHash) -> Option<Task> {
        let group = (repo.to_string(), name.to_string());
        let index = self.by_commit.get(&group)?;
        let id = index.get(commit)?;
        self.get(id)
    }
}

/// In-memory view of jobs, maintained like [`TaskCache`].
pub struct JobCache {
    db: Arc<dyn Db>,
    rx: Mutex<broadcast::Receiver<DbEvent>>,
    since: DateTime<Utc>,
    jobs: DashMap<String, Job>,
    by_state_name: DashMap<(RepoState, String), Vec<String>>,
}

impl JobCache {
    pub async fn new(db: Arc<dyn Db>, since: DateTime<Utc>) -> TaskDbResult<Self> {
        let rx = db.subscribe();
        let cache = Self {
            db,
            rx: Mutex::new(rx),
            since,
            jobs: DashMap::new(),
            by_state_name: DashMap::new(),
        };
        cache.reload().await?;
        Ok(cache)
    }

    async fn reload(&self) -> TaskDbResult<()> {
        self.jobs.clear();
        self.by_state_name.clear();
        let mut jobs = self.db.jobs_in_date_range(self.since, far_future()).await?;
        jobs.extend(self.db.unfinished_jobs().await?);
        for job in jobs {
            self.apply(&job);
        }
        Ok(())
    }

    pub async fn update(&self) -> TaskDbResult<()> {
        loop {
            let event = self.rx.lock().unwrap().try_recv();
            match event {
                Ok(DbEvent::JobsModified(jobs)) => {
                    for job in &jobs {
                        self.apply(job);
                    }
                }
                Ok(DbEvent::TasksModified(_)) => {}
                Err(broadcast::error::TryRecvError::Empty) => return Ok(()),
                Err(broadcast::error::TryRecvError::Closed) => return Ok(()),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("job cache lagged {n} events behind, reloading");
                    return self.reload().await;
                }
            }
        }
    }

    fn apply(&self, job: &Job) {
        if !self.jobs.contains_key(&job.id) {
            let mut ids = self
                .by_state_name
                .entry((job.repo_state.clone(), job.name.clone()))
                .or_default();
            if !ids.contains(&job.id) {
                ids.push(job.id.clone());
            }
        }
        self.jobs.insert(job.id.clone(), job.clone());
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|j| j.clone())
    }

    pub fn unfinished(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| !j.done())
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| (a.created, &a.id).cmp(&(b.created, &b.id)));
        jobs
    }

    /// Jobs with the given name at the given RepoState, any status. The
    /// periodic trigger uses this for idempotence, the gatherer for dedup.
    pub fn jobs_at(&self, repo_state: &RepoState, name: &str) -> Vec<Job> {
        let Some(ids) = self
            .by_state_name
            .get(&(repo_state.clone(), name.to_string()))
        else {
            return Vec::new();
        };
        let mut jobs: Vec<Job> = ids.iter().filter_map(|id| self.get(id)).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
