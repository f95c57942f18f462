use chrono::{DateTime, Utc};
use conveyor_lib::{CommitHash, Task};

use crate::repograph::{RepoError, RepoGraph};

/// Prior state the blamelist computation consults: the config cache's
/// added-at metadata and the recorded-task index for one `(repo, name)`.
pub trait BlamelistOracle {
    /// Whether the task name existed in the task graph at this commit.
    fn defined_at(&self, commit: &CommitHash) -> bool;

    /// The recorded task, same name and repo, whose blamelist contains
    /// this commit. Blamelists of recorded tasks are pairwise disjoint, so
    /// there is at most one.
    fn owner_of(&self, commit: &CommitHash) -> Option<Task>;
}

/// Oracle over the live config cache and task view, scoped to one
/// `(repo, task name)`.
pub struct ViewOracle<'a> {
    cfgs: &'a dyn crate::cfg_cache::TasksCfgProvider,
    tasks: &'a dyn crate::candidates::TaskView,
    repo: &'a str,
    name: &'a str,
}

impl<'a> ViewOracle<'a> {
    pub fn new(
        cfgs: &'a dyn crate::cfg_cache::TasksCfgProvider,
        tasks: &'a dyn crate::candidates::TaskView,
        repo: &'a str,
        name: &'a str,
    ) -> Self {
        Self {
            cfgs,
            tasks,
            repo,
            name,
        }
    }
}

impl BlamelistOracle for ViewOracle<'_> {
    fn defined_at(&self, commit: &CommitHash) -> bool {
        self.cfgs.task_defined_at(self.repo, commit, self.name)
    }

    fn owner_of(&self, commit: &CommitHash) -> Option<Task> {
        self.tasks.task_for_commit(self.repo, self.name, commit)
    }
}

/// Result of a blamelist computation.
#[derive(Debug, Clone, PartialEq)]
pub struct Blamelist {
    /// The commits the new task will cover, in traversal order (the target
    /// revision first).
    pub commits: Vec<CommitHash>,
    /// The prior task whose blamelist overlapped; the listed commits must
    /// be removed from it when the new task is persisted.
    pub stole_from: Option<Task>,
}

/// Compute the set of commits a new task at `revision` will be responsible
/// for, possibly stealing commits from one previously recorded task.
///
/// The walk visits children before their parents, parents in the repo's
/// recorded order, and claims a commit unless it is outside the scheduling
/// window, predates the task name, or belongs to a prior task's blamelist.
/// An owned commit reached at the target revision itself starts stealing
/// from its owner; an owned commit reached further down is the boundary of
/// previous coverage and ends the walk on that line. Commits are never
/// stolen from two predecessors in one operation.
///
/// Pure over its inputs: the same graph, oracle and revision always yield
/// the same blamelist.
pub fn compute_blamelist(
    graph: &RepoGraph,
    oracle: &dyn BlamelistOracle,
    window_start: DateTime<Utc>,
    max_commits: usize,
    revision: CommitHash,
) -> Result<Blamelist, RepoError> {
    if !graph.contains(&revision) {
        return Err(RepoError::UnknownCommit(revision));
    }

    let mut commits: Vec<CommitHash> = Vec::new();
    let mut stole_from: Option<Task> = None;
    let mut worklist: Vec<CommitHash> = vec![revision];
    let mut visited: std::collections::HashSet<CommitHash> = std::collections::HashSet::new();
    let mut truncated = false;

    'walk: while let Some(hash) = worklist.pop() {
        if !visited.insert(hash) {
            continue;
        }

        let commit = match graph.get(&hash) {
            Some(c) => c,
            None => continue,
        };
        if commit.timestamp() < window_start {
            continue;
        }
        if !oracle.defined_at(&hash) {
            continue;
        }

        let traverse_parents = match oracle.owner_of(&hash) {
            None => {
                commits.push(hash);
                true
            }
            Some(owner) => match &stole_from {
                Some(stolen) if stolen.id == owner.id => {
                    // Continue taking the contiguous region of the task we
                    // are already stealing from.
                    commits.push(hash);
                    true
                }
                Some(_) => false,
                None if hash == revision => {
                    // The target itself is covered: this computation steals
                    // from its owner. A task that covered exactly this
                    // commit is taken over wholesale; there is nothing
                    // further to attribute.
                    let keep_walking = owner.commits.len() > 1;
                    stole_from = Some(owner);
                    commits.push(hash);
                    keep_walking
                }
                // A covered commit reached below the target is the boundary
                // of previous coverage.
                None => false,
            },
        };

        if commits.len() > max_commits {
            truncated = true;
            break 'walk;
        }

        if traverse_parents {
            // Reverse push so the first recorded parent is visited first.
            let parents: Vec<CommitHash> = commit.parents().map(|p| p.hash()).collect();
            for parent in parents.into_iter().rev() {
                worklist.push(parent);
            }
        }
    }

    if truncated {
        tracing::debug!(
            "blamelist for {} exceeds {} commits, truncating to the revision itself",
            revision.short(),
            max_commits
        );
        commits = vec![revision];
        // Stealing only ever starts at the target revision, so the stolen
        // task still owns the single remaining commit.
    }

    Ok(Blamelist {
        commits,
        stole_from,
    })
}
