//! The task/job store interface and its in-memory implementation, plus the
//! caches the scheduler reads. Writes go through compare-and-swap on the
//! `db_modified` token; readers are fed through a change stream so the
//! caches never poll full tables.

mod cache;
mod mem_db;

pub use cache::{JobCache, TaskCache};
pub use mem_db::InMemoryDb;

use chrono::{DateTime, Utc};
use conveyor_lib::{CommitHash, Job, RepoState, Task, TaskKey};
use tokio::sync::broadcast;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskDbError {
    #[error("no such record: {0}")]
    NotFound(String),
    #[error("concurrent update of {id}: stored {stored}, caller had {caller}")]
    Conflict {
        id: String,
        stored: DateTime<Utc>,
        caller: DateTime<Utc>,
    },
    #[error("record {0} has no assigned id")]
    MissingId(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type TaskDbResult<T> = Result<T, TaskDbError>;

/// Change notifications for cache maintenance. One event per successful
/// write batch.
#[derive(Debug, Clone)]
pub enum DbEvent {
    TasksModified(Vec<Task>),
    JobsModified(Vec<Job>),
}

/// Read/write interface for tasks. Writes compare the record's
/// `db_modified` against the stored value and reject stale callers; on
/// success the store stamps a fresh token into the given record.
#[async_trait::async_trait]
pub trait TaskDb: Send + Sync {
    async fn assign_task_id(&self) -> TaskDbResult<String>;

    async fn get_task(&self, id: &str) -> TaskDbResult<Option<Task>>;

    /// Every recorded attempt at the key.
    async fn get_tasks_by_key(&self, key: &TaskKey) -> TaskDbResult<Vec<Task>>;

    /// Tasks whose blamelists contain any of the commits.
    async fn get_tasks_for_commits(
        &self,
        repo: &str,
        commits: &[CommitHash],
    ) -> TaskDbResult<Vec<Task>>;

    async fn unfinished_tasks(&self) -> TaskDbResult<Vec<Task>>;

    async fn tasks_in_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TaskDbResult<Vec<Task>>;

    async fn put_task(&self, task: &mut Task) -> TaskDbResult<()>;

    /// Write several tasks atomically: either every CAS passes and all are
    /// stored, or none are. The dispatcher relies on this to re-partition
    /// blamelists without a reader ever seeing a commit in two of them.
    async fn put_tasks(&self, tasks: &mut [Task]) -> TaskDbResult<()>;
}

/// Read/write interface for jobs; same CAS discipline as tasks.
#[async_trait::async_trait]
pub trait JobDb: Send + Sync {
    async fn assign_job_id(&self) -> TaskDbResult<String>;

    async fn get_job(&self, id: &str) -> TaskDbResult<Option<Job>>;

    /// Jobs with the given name at the given RepoState, any status.
    async fn get_jobs_at(&self, repo_state: &RepoState, name: &str) -> TaskDbResult<Vec<Job>>;

    async fn unfinished_jobs(&self) -> TaskDbResult<Vec<Job>>;

    async fn jobs_in_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TaskDbResult<Vec<Job>>;

    async fn put_job(&self, job: &mut Job) -> TaskDbResult<()>;

    async fn put_jobs(&self, jobs: &mut [Job]) -> TaskDbResult<()>;
}

/// The full store surface the scheduler wires against.
pub trait Db: TaskDb + JobDb {
    /// Subscribe to modification events. Subscribers that fall behind see
    /// a lag error and should reload.
    fn subscribe(&self) -> broadcast::Receiver<DbEvent>;
}
