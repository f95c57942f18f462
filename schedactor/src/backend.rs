use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_core::BotInfo;
use conveyor_lib::{Dimensions, TaskStatus};

// Tags submitted with every backend task; downstream observability keys
// off these names.
pub const TAG_ID: &str = "sk_id";
pub const TAG_NAME: &str = "sk_name";
pub const TAG_REPO: &str = "sk_repo";
pub const TAG_REVISION: &str = "sk_revision";
pub const TAG_ATTEMPT: &str = "sk_attempt";
pub const TAG_RETRY_OF: &str = "sk_retry_of";
pub const TAG_FORCED_JOB_ID: &str = "sk_forced_job_id";
pub const TAG_DIM_POOL: &str = "sk_dim_pool";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Worth retrying next tick: timeouts, throttling, connectivity.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// Never going to work: bad input digest, malformed dimensions.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, BackendError::Permanent(_))
    }
}

/// A task submission handed to the backend.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub name: String,
    pub dimensions: Dimensions,
    pub tags: BTreeMap<String, String>,
    pub execution_timeout: Duration,
    pub io_timeout: Duration,
    pub expiration: Duration,
    pub extra_inputs: Vec<String>,
}

/// What the backend answers to a submission.
#[derive(Debug, Clone)]
pub struct TaskRequestMetadata {
    pub backend_id: String,
    /// The backend recognized identical inputs and served a finished
    /// result instead of running anything.
    pub dedup: bool,
    pub output_ref: Option<String>,
}

/// Task state as the backend reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTaskState {
    Pending,
    Running,
    Completed,
    BotDied,
    Expired,
    Canceled,
    TimedOut,
}

/// One task's state on the backend.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub backend_id: String,
    pub state: BackendTaskState,
    /// Only meaningful with `state == Completed`.
    pub failure: bool,
    pub started_ts: Option<DateTime<Utc>>,
    pub completed_ts: Option<DateTime<Utc>>,
    pub abandoned_ts: Option<DateTime<Utc>>,
    pub output_ref: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// The dimensions the submission asked for; the busy-bot accounting
    /// reads these off the pending listing.
    pub dimensions_requested: Dimensions,
}

impl TaskResult {
    /// Map the backend's state onto the task lifecycle.
    pub fn status(&self) -> TaskStatus {
        match self.state {
            BackendTaskState::Pending => TaskStatus::Pending,
            BackendTaskState::Running => TaskStatus::Running,
            BackendTaskState::Completed => {
                if self.failure {
                    TaskStatus::Failure
                } else {
                    TaskStatus::Success
                }
            }
            BackendTaskState::BotDied
            | BackendTaskState::Expired
            | BackendTaskState::Canceled
            | BackendTaskState::TimedOut => TaskStatus::Mishap,
        }
    }
}

/// The worker execution service, as far as the scheduler is concerned:
/// submit work, poll work, list workers.
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn list_bots(&self, pool: &str) -> Result<Vec<BotInfo>, BackendError>;

    async fn list_pending_tasks(&self, pool: &str) -> Result<Vec<TaskResult>, BackendError>;

    async fn submit_task(&self, request: &TaskRequest) -> Result<TaskRequestMetadata, BackendError>;

    async fn get_task(&self, backend_id: &str) -> Result<TaskResult, BackendError>;
}

/// Scriptable backend for the test suites: bots and task outcomes are set
/// by hand, submissions can be made to fail or dedup.
#[derive(Default)]
pub struct MockBackend {
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    bots: Vec<BotInfo>,
    tasks: HashMap<String, TaskResult>,
    next_id: u64,
    fail_next_submit: Option<BackendError>,
    dedup_next_submit: Option<String>,
    submitted: Vec<TaskRequest>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bot(&self, id: &str, dimensions: &[(&str, &str)]) {
        let mut inner = self.inner.lock().unwrap();
        inner.bots.push(BotInfo {
            id: id.to_string(),
            dimensions: dimensions
                .iter()
                .map(|(k, v)| (k.to_string(), std::iter::once(v.to_string()).collect()))
                .collect(),
        });
    }

    pub fn remove_bot(&self, id: &str) {
        self.inner.lock().unwrap().bots.retain(|b| b.id != id);
    }

    /// Script the next submission to fail with the given classification.
    pub fn fail_next_submit(&self, err: BackendError) {
        self.inner.lock().unwrap().fail_next_submit = Some(err);
    }

    /// Script the next submission to be deduplicated against a cached
    /// result.
    pub fn dedup_next_submit(&self, output_ref: &str) {
        self.inner.lock().unwrap().dedup_next_submit = Some(output_ref.to_string());
    }

    /// Drive a backend task to a new state.
    pub fn set_task_state(&self, backend_id: &str, state: BackendTaskState, failure: bool) {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(backend_id)
            .unwrap_or_else(|| panic!("unknown backend task {backend_id}"));
        task.state = state;
        task.failure = failure;
        let now = Utc::now();
        match state {
            BackendTaskState::Running => task.started_ts = Some(now),
            BackendTaskState::Completed => {
                task.completed_ts = Some(now);
                if !failure {
                    task.output_ref = Some(format!("out/{backend_id}"));
                }
            }
            BackendTaskState::BotDied
            | BackendTaskState::Expired
            | BackendTaskState::Canceled
            | BackendTaskState::TimedOut => task.abandoned_ts = Some(now),
            BackendTaskState::Pending => {}
        }
    }

    /// Every request submitted so far, in order.
    pub fn submitted(&self) -> Vec<TaskRequest> {
        self.inner.lock().unwrap().submitted.clone()
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for MockBackend {
    async fn list_bots(&self, _pool: &str) -> Result<Vec<BotInfo>, BackendError> {
        Ok(self.inner.lock().unwrap().bots.clone())
    }

    async fn list_pending_tasks(&self, _pool: &str) -> Result<Vec<TaskResult>, BackendError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.state == BackendTaskState::Pending)
            .cloned()
            .collect())
    }

    async fn submit_task(&self, request: &TaskRequest) -> Result<TaskRequestMetadata, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.fail_next_submit.take() {
            return Err(err);
        }
        inner.submitted.push(request.clone());
        inner.next_id += 1;
        let backend_id = format!("backend-{:08}", inner.next_id);
        if let Some(output_ref) = inner.dedup_next_submit.take() {
            return Ok(TaskRequestMetadata {
                backend_id,
                dedup: true,
                output_ref: Some(output_ref),
            });
        }
        inner.tasks.insert(
            backend_id.clone(),
            TaskResult {
                backend_id: backend_id.clone(),
                state: BackendTaskState::Pending,
                failure: false,
                started_ts: None,
                completed_ts: None,
                abandoned_ts: None,
                output_ref: None,
                tags: request.tags.clone(),
                dimensions_requested: request.dimensions.clone(),
            },
        );
        Ok(TaskRequestMetadata {
            backend_id,
            dedup: false,
            output_ref: None,
        })
    }

    async fn get_task(&self, backend_id: &str) -> Result<TaskResult, BackendError> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .get(backend_id)
            .cloned()
            .ok_or_else(|| BackendError::Permanent(format!("unknown backend task {backend_id}")))
    }
}
