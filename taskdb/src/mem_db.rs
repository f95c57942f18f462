use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use conveyor_lib::{CommitHash, Job, RepoState, Task, TaskKey};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{Db, DbEvent, JobDb, TaskDb, TaskDbError, TaskDbResult};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Reference store implementation backed by process memory. Single mutex
/// over both tables keeps multi-record writes atomic; fine for the write
/// rates a scheduler produces.
pub struct InMemoryDb {
    state: Mutex<State>,
    events: broadcast::Sender<DbEvent>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<String, Task>,
    jobs: HashMap<String, Job>,
    next_task_id: u64,
    next_job_id: u64,
}

impl Default for InMemoryDb {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: DbEvent) {
        // No subscribers is fine; nothing to notify.
        let _ = self.events.send(event);
    }
}

/// A token strictly greater than the record's previous one, so CAS never
/// accepts the same value twice even within one clock tick.
fn next_token(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + Duration::microseconds(1)
    }
}

fn check_and_stamp_task(state: &State, task: &Task) -> TaskDbResult<DateTime<Utc>> {
    if task.id.is_empty() {
        return Err(TaskDbError::MissingId(format!("task {}", task.name)));
    }
    match state.tasks.get(&task.id) {
        Some(stored) if stored.db_modified != task.db_modified => Err(TaskDbError::Conflict {
            id: task.id.clone(),
            stored: stored.db_modified,
            caller: task.db_modified,
        }),
        Some(stored) => Ok(next_token(stored.db_modified)),
        None => Ok(next_token(task.db_modified)),
    }
}

fn check_and_stamp_job(state: &State, job: &Job) -> TaskDbResult<DateTime<Utc>> {
    if job.id.is_empty() {
        return Err(TaskDbError::MissingId(format!("job {}", job.name)));
    }
    match state.jobs.get(&job.id) {
        Some(stored) if stored.db_modified != job.db_modified => Err(TaskDbError::Conflict {
            id: job.id.clone(),
            stored: stored.db_modified,
            caller: job.db_modified,
        }),
        Some(stored) => Ok(next_token(stored.db_modified)),
        None => Ok(next_token(job.db_modified)),
    }
}

#[async_trait::async_trait]
impl TaskDb for InMemoryDb {
    async fn assign_task_id(&self) -> TaskDbResult<String> {
        let mut state = self.state.lock().unwrap();
        state.next_task_id += 1;
        Ok(format!("task-{:08}", state.next_task_id))
    }

    async fn get_task(&self, id: &str) -> TaskDbResult<Option<Task>> {
        Ok(self.state.lock().unwrap().tasks.get(id).cloned())
    }

    async fn get_tasks_by_key(&self, key: &TaskKey) -> TaskDbResult<Vec<Task>> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| &t.key() == key)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.attempt.cmp(&b.attempt).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn get_tasks_for_commits(
        &self,
        repo: &str,
        commits: &[CommitHash],
    ) -> TaskDbResult<Vec<Task>> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| {
                t.repo_state.repo() == repo && commits.iter().any(|c| t.commits.contains(c))
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn unfinished_tasks(&self) -> TaskDbResult<Vec<Task>> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| !t.done())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn tasks_in_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TaskDbResult<Vec<Task>> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.created >= from && t.created < to)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn put_task(&self, task: &mut Task) -> TaskDbResult<()> {
        self.put_tasks(std::slice::from_mut(task)).await
    }

    async fn put_tasks(&self, tasks: &mut [Task]) -> TaskDbResult<()> {
        let mut state = self.state.lock().unwrap();
        // Validate every CAS before committing anything.
        let mut stamps = Vec::with_capacity(tasks.len());
        for task in tasks.iter() {
            stamps.push(check_and_stamp_task(&state, task)?);
        }
        for (task, stamp) in tasks.iter_mut().zip(stamps) {
            task.db_modified = stamp;
            debug!("put task {} status {}", task.id, task.status);
            state.tasks.insert(task.id.clone(), task.clone());
        }
        drop(state);
        self.emit(DbEvent::TasksModified(tasks.to_vec()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobDb for InMemoryDb {
    async fn assign_job_id(&self) -> TaskDbResult<String> {
        let mut state = self.state.lock().unwrap();
        state.next_job_id += 1;
        Ok(format!("job-{:08}", state.next_job_id))
    }

    async fn get_job(&self, id: &str) -> TaskDbResult<Option<Job>> {
        Ok(self.state.lock().unwrap().jobs.get(id).cloned())
    }

    async fn get_jobs_at(&self, repo_state: &RepoState, name: &str) -> TaskDbResult<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| &j.repo_state == repo_state && j.name == name)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn unfinished_jobs(&self) -> TaskDbResult<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state.jobs.values().filter(|j| !j.done()).cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn jobs_in_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TaskDbResult<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.created >= from && j.created < to)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn put_job(&self, job: &mut Job) -> TaskDbResult<()> {
        self.put_jobs(std::slice::from_mut(job)).await
    }

    async fn put_jobs(&self, jobs: &mut [Job]) -> TaskDbResult<()> {
        let mut state = self.state.lock().unwrap();
        let mut stamps = Vec::with_capacity(jobs.len());
        for job in jobs.iter() {
            stamps.push(check_and_stamp_job(&state, job)?);
        }
        for (job, stamp) in jobs.iter_mut().zip(stamps) {
            job.db_modified = stamp;
            debug!("put job {} status {:?}", job.id, job.status);
            state.jobs.insert(job.id.clone(), job.clone());
        }
        drop(state);
        self.emit(DbEvent::JobsModified(jobs.to_vec()));
        Ok(())
    }
}

impl Db for InMemoryDb {
    fn subscribe(&self) -> broadcast::Receiver<DbEvent> {
        self.events.subscribe()
    }
}
