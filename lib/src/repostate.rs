use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::{impl_display_using_json, CommitHash};

/// A patchset applied on top of a base revision, as handed over by the
/// try-request intake.
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Serialize, Deserialize, Getters,
)]
pub struct Patch {
    /// The code-review server hosting the change.
    server: String,
    /// The change / issue identifier.
    issue: String,
    /// The patchset number within the issue.
    patchset: String,
    /// The repo the patch applies to, when different from the base repo.
    patch_repo: String,
}

impl Patch {
    pub fn new(server: String, issue: String, patchset: String, patch_repo: String) -> Self {
        Self {
            server,
            issue,
            patchset,
            patch_repo,
        }
    }
}

/// The tuple that uniquely locates one evaluation of the task graph: a repo,
/// a revision, and optionally a patch. A state with a patch is a try-job
/// state; without, a regular state.
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Serialize, Deserialize, Getters,
)]
pub struct RepoState {
    repo: String,
    revision: CommitHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patch: Option<Patch>,
}

impl RepoState {
    pub fn new(repo: String, revision: CommitHash) -> Self {
        Self {
            repo,
            revision,
            patch: None,
        }
    }

    pub fn new_try(repo: String, revision: CommitHash, patch: Patch) -> Self {
        Self {
            repo,
            revision,
            patch: Some(patch),
        }
    }

    pub fn is_try_job(&self) -> bool {
        self.patch.is_some()
    }

    /// The same location without the patch applied.
    pub fn without_patch(&self) -> RepoState {
        RepoState::new(self.repo.clone(), self.revision)
    }

    /// The same repo and patch at a different revision.
    pub fn at_revision(&self, revision: CommitHash) -> RepoState {
        Self {
            repo: self.repo.clone(),
            revision,
            patch: self.patch.clone(),
        }
    }
}

/// Identity of a task instance: one task name at one RepoState. At most one
/// pending-or-running task may exist per key.
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Serialize, Deserialize, Getters,
)]
pub struct TaskKey {
    repo_state: RepoState,
    name: String,
}

impl TaskKey {
    pub fn new(repo_state: RepoState, name: String) -> Self {
        Self { repo_state, name }
    }

    pub fn repo(&self) -> &str {
        self.repo_state.repo()
    }

    pub fn revision(&self) -> &CommitHash {
        self.repo_state.revision()
    }

    pub fn is_try_job(&self) -> bool {
        self.repo_state.is_try_job()
    }
}

impl_display_using_json!(Patch);
impl_display_using_json!(RepoState);
impl_display_using_json!(TaskKey);

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(b: u8) -> CommitHash {
        CommitHash::new([b; 20])
    }

    #[test]
    fn test_try_state_differs_from_regular() {
        let regular = RepoState::new("https://repo.example/skia.git".into(), rev(1));
        let tried = RepoState::new_try(
            "https://repo.example/skia.git".into(),
            rev(1),
            Patch::new("review.example".into(), "12345".into(), "2".into(), String::new()),
        );
        assert!(!regular.is_try_job());
        assert!(tried.is_try_job());
        // Same name and revision, but the keys must not collide.
        let k1 = TaskKey::new(regular.clone(), "Build".into());
        let k2 = TaskKey::new(tried.clone(), "Build".into());
        assert_ne!(k1, k2);
        assert_eq!(tried.without_patch(), regular);
    }
}
