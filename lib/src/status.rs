use serde::{Deserialize, Serialize};

/// The lifecycle state of a task instance.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Inserted and submitted, not yet picked up by a worker.
    Pending,
    /// A worker is executing the task.
    Running,
    /// Terminal: the task ran and passed.
    Success,
    /// Terminal: the task ran and failed.
    Failure,
    /// Terminal: the task did not run to completion (worker died, expired,
    /// timed out).
    Mishap,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Mishap
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success)
    }

    /// Terminal and unsuccessful; the states the retry policy reacts to.
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failure | TaskStatus::Mishap)
    }
}

impl From<TaskStatus> for i32 {
    fn from(status: TaskStatus) -> i32 {
        match status {
            TaskStatus::Pending => 1000,
            TaskStatus::Running => 2000,
            TaskStatus::Success => 0,
            TaskStatus::Failure => -1000,
            TaskStatus::Mishap => -2000,
        }
    }
}

impl From<i32> for TaskStatus {
    fn from(value: i32) -> TaskStatus {
        match value {
            1000 => TaskStatus::Pending,
            2000 => TaskStatus::Running,
            0 => TaskStatus::Success,
            -1000 => TaskStatus::Failure,
            _ => TaskStatus::Mishap,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Mishap => "mishap",
        };
        write!(f, "{s}")
    }
}
