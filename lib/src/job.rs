use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{impl_display_using_json, RepoState, TaskKey};

/// The lifecycle state of a job.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Success,
    Failure,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

/// An instance of a job spec at one RepoState: the unit of work a commit,
/// try request or periodic trigger asks for. A job is finished once every
/// task in its dependency graph reaches a terminal state.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned identifier.
    pub id: String,
    /// The job spec name.
    pub name: String,
    pub repo_state: RepoState,

    pub created: DateTime<Utc>,
    pub priority: f64,

    /// The expanded dependency graph: every task name this job needs,
    /// mapped to its direct dependency names.
    pub dependencies: BTreeMap<String, Vec<String>>,

    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,

    /// Set when the job was created by an explicit rerun request rather
    /// than a commit or trigger.
    #[serde(default)]
    pub is_force: bool,

    /// Compare-and-swap token; bumped by the store on every successful
    /// write.
    pub db_modified: DateTime<Utc>,
}

impl Job {
    pub fn done(&self) -> bool {
        self.status.is_terminal()
    }

    /// Every task name in the job's graph.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    pub fn task_key(&self, name: &str) -> TaskKey {
        TaskKey::new(self.repo_state.clone(), name.to_string())
    }
}

impl_display_using_json!(Job);
