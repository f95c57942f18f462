use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{impl_display_using_json, CommitHash, RepoState, TaskKey, TaskStatus};

/// A persistent task instance: one attempt of one task name at one
/// RepoState. Tasks are inserted by the dispatcher, mutated by the backend
/// status refresh and by blamelist stealing, and never deleted.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned identifier.
    pub id: String,
    pub name: String,
    pub repo_state: RepoState,

    /// The blamelist: the ordered commits this task is considered to cover.
    /// Empty for try-jobs.
    pub commits: Vec<CommitHash>,

    pub status: TaskStatus,

    /// Zero-based attempt counter; > 0 on retries.
    pub attempt: u32,
    /// Id of the failed task this one retries, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    /// Ids of the successful dependency tasks this one builds on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_task_ids: Vec<String>,
    /// Id of the forced job that requested this task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_job_id: Option<String>,

    /// Identifier of the task on the execution backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_task_id: Option<String>,

    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,

    /// Reference to the task's output on the backend, set on completion or
    /// backend-side dedup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    pub max_attempts: u32,

    /// Compare-and-swap token; bumped by the store on every successful
    /// write.
    pub db_modified: DateTime<Utc>,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.repo_state.clone(), self.name.clone())
    }

    pub fn done(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the retry policy may produce a successor for this task.
    pub fn retryable(&self) -> bool {
        self.status.is_failed() && self.attempt + 1 < self.max_attempts
    }

    /// Whether a candidate at the same key is satisfied by this task: it is
    /// outstanding, or it succeeded and left an output behind.
    pub fn satisfies_rerun(&self) -> bool {
        match self.status {
            TaskStatus::Pending | TaskStatus::Running => true,
            TaskStatus::Success => self.output_ref.is_some(),
            _ => false,
        }
    }
}

impl_display_using_json!(Task);

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus, attempt: u32, max_attempts: u32) -> Task {
        Task {
            id: "t1".into(),
            name: "Build".into(),
            repo_state: RepoState::new("repo".into(), CommitHash::new([1; 20])),
            commits: vec![],
            status,
            attempt,
            retry_of: None,
            parent_task_ids: vec![],
            forced_job_id: None,
            backend_task_id: None,
            created: Utc::now(),
            started: None,
            finished: None,
            output_ref: None,
            failure_reason: None,
            max_attempts,
            db_modified: Utc::now(),
        }
    }

    #[test]
    fn test_retryable() {
        assert!(task(TaskStatus::Failure, 0, 2).retryable());
        assert!(task(TaskStatus::Mishap, 0, 2).retryable());
        // Attempts exhausted.
        assert!(!task(TaskStatus::Failure, 1, 2).retryable());
        assert!(!task(TaskStatus::Success, 0, 2).retryable());
        assert!(!task(TaskStatus::Running, 0, 2).retryable());
    }

    #[test]
    fn test_satisfies_rerun() {
        assert!(task(TaskStatus::Pending, 0, 2).satisfies_rerun());
        assert!(task(TaskStatus::Running, 0, 2).satisfies_rerun());
        // Success without an output does not satisfy dependents.
        assert!(!task(TaskStatus::Success, 0, 2).satisfies_rerun());
        let mut t = task(TaskStatus::Success, 0, 2);
        t.output_ref = Some("out/abc".into());
        assert!(t.satisfies_rerun());
        assert!(!task(TaskStatus::Failure, 0, 2).satisfies_rerun());
    }
}
