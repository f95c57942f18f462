//! The scheduling driver: the execution-backend interface, the dispatcher
//! that turns matched candidates into persisted and submitted tasks, job
//! materialization from new commits and periodic triggers, per-tick
//! diagnostics, and the main loop tying it all together.

mod backend;
mod config;
mod diagnostics;
mod dispatcher;
mod gatherer;
mod scheduler;

// Re-export
pub use backend::{
    BackendError, BackendTaskState, ExecutionBackend, MockBackend, TaskRequest,
    TaskRequestMetadata, TaskResult, TAG_ATTEMPT, TAG_DIM_POOL, TAG_FORCED_JOB_ID, TAG_ID,
    TAG_NAME, TAG_REPO, TAG_RETRY_OF, TAG_REVISION,
};
pub use config::SchedulerConfig;
pub use diagnostics::{
    CandidateRecord, DiagnosticsSink, FileDiagnostics, InMemoryDiagnostics, RejectedRecord,
    TickDiagnostics,
};
pub use dispatcher::{DispatchCtx, DispatchError, DispatchOutcome};
pub use scheduler::{Scheduler, SchedulerError, TickSummary};
