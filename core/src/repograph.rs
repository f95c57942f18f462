use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use conveyor_lib::CommitHash;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RepoError {
    #[error("commit {0} already recorded")]
    DuplicateCommit(CommitHash),
    #[error("parent {parent} of commit {child} is unknown")]
    UnknownParent { child: CommitHash, parent: CommitHash },
    #[error("commit {0} is unknown")]
    UnknownCommit(CommitHash),
    #[error("branch {0:?} is unknown")]
    UnknownBranch(String),
    #[error("repo update failed: {0}")]
    UpdateFailed(String),
}

#[derive(Clone, Debug)]
struct CommitNode {
    hash: CommitHash,
    /// Parents by arena index, in the repo's recorded order.
    parents: Vec<u32>,
    timestamp: DateTime<Utc>,
}

/// An immutable view of one repo's commit DAG. Commits live in an arena and
/// refer to their parents by index, so graph walks are cheap and their
/// iteration order is fixed by insertion.
#[derive(Clone, Debug)]
pub struct RepoGraph {
    repo: String,
    nodes: Vec<CommitNode>,
    index: HashMap<CommitHash, u32>,
    branches: BTreeMap<String, CommitHash>,
}

/// A borrowed commit inside a [`RepoGraph`].
#[derive(Clone, Copy)]
pub struct Commit<'a> {
    graph: &'a RepoGraph,
    idx: u32,
}

impl<'a> Commit<'a> {
    pub fn hash(&self) -> CommitHash {
        self.graph.nodes[self.idx as usize].hash
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.graph.nodes[self.idx as usize].timestamp
    }

    /// Parents in recorded order.
    pub fn parents(&self) -> impl Iterator<Item = Commit<'a>> + '_ {
        let graph = self.graph;
        self.graph.nodes[self.idx as usize]
            .parents
            .iter()
            .map(move |&idx| Commit { graph, idx })
    }
}

impl RepoGraph {
    pub fn new(repo: String) -> Self {
        Self {
            repo,
            nodes: Vec::new(),
            index: HashMap::new(),
            branches: BTreeMap::new(),
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Record a commit. Parents must already be present; history is fed in
    /// topological order, oldest first.
    pub fn add_commit(
        &mut self,
        hash: CommitHash,
        parents: &[CommitHash],
        timestamp: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        if self.index.contains_key(&hash) {
            return Err(RepoError::DuplicateCommit(hash));
        }
        let mut parent_idx = Vec::with_capacity(parents.len());
        for parent in parents {
            let idx = self
                .index
                .get(parent)
                .copied()
                .ok_or(RepoError::UnknownParent {
                    child: hash,
                    parent: *parent,
                })?;
            parent_idx.push(idx);
        }
        let idx = self.nodes.len() as u32;
        self.nodes.push(CommitNode {
            hash,
            parents: parent_idx,
            timestamp,
        });
        self.index.insert(hash, idx);
        Ok(())
    }

    pub fn set_branch(&mut self, name: &str, tip: CommitHash) -> Result<(), RepoError> {
        if !self.index.contains_key(&tip) {
            return Err(RepoError::UnknownCommit(tip));
        }
        self.branches.insert(name.to_string(), tip);
        Ok(())
    }

    pub fn branches(&self) -> &BTreeMap<String, CommitHash> {
        &self.branches
    }

    pub fn branch_tip(&self, name: &str) -> Result<CommitHash, RepoError> {
        self.branches
            .get(name)
            .copied()
            .ok_or_else(|| RepoError::UnknownBranch(name.to_string()))
    }

    pub fn contains(&self, hash: &CommitHash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn get(&self, hash: &CommitHash) -> Option<Commit<'_>> {
        self.index.get(hash).map(|&idx| Commit { graph: self, idx })
    }

    /// Commits reachable from `to` but not from `from`, children before
    /// parents. `from = None` lists the full ancestry of `to`.
    pub fn rev_list(
        &self,
        from: Option<&CommitHash>,
        to: &CommitHash,
    ) -> Result<Vec<CommitHash>, RepoError> {
        let to_idx = *self.index.get(to).ok_or(RepoError::UnknownCommit(*to))?;
        let mut excluded = HashSet::new();
        if let Some(from) = from {
            let from_idx = *self.index.get(from).ok_or(RepoError::UnknownCommit(*from))?;
            let mut worklist = vec![from_idx];
            while let Some(idx) = worklist.pop() {
                if excluded.insert(idx) {
                    worklist.extend(&self.nodes[idx as usize].parents);
                }
            }
        }
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut worklist = vec![to_idx];
        while let Some(idx) = worklist.pop() {
            if excluded.contains(&idx) || !seen.insert(idx) {
                continue;
            }
            out.push(self.nodes[idx as usize].hash);
            worklist.extend(&self.nodes[idx as usize].parents);
        }
        Ok(out)
    }
}

/// New commits observed on one branch by a mirror refresh, newest first.
#[derive(Debug, Clone)]
pub struct NewCommits {
    pub branch: String,
    pub commits: Vec<CommitHash>,
}

/// The result of refreshing a mirror: the current graph snapshot and
/// whatever arrived since the previous refresh.
#[derive(Clone)]
pub struct RepoUpdate {
    pub graph: Arc<RepoGraph>,
    pub new_commits: Vec<NewCommits>,
}

/// The local mirror of one tracked repository.
#[async_trait::async_trait]
pub trait RepoMirror: Send + Sync {
    fn url(&self) -> &str;

    /// Fetch from the remote and return a fresh snapshot. The scheduler
    /// only ever reads snapshots; a failed update fails the whole tick.
    async fn update(&self) -> Result<RepoUpdate, RepoError>;
}

/// A mirror whose history is fed in directly. Backs the test suites and
/// any wiring that does not talk to a real git remote.
pub struct InMemoryRepo {
    url: String,
    inner: Mutex<InMemoryRepoInner>,
}

struct InMemoryRepoInner {
    graph: RepoGraph,
    /// Commits staged since the last update, per branch, oldest first.
    staged: Vec<(String, CommitHash)>,
}

impl InMemoryRepo {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            inner: Mutex::new(InMemoryRepoInner {
                graph: RepoGraph::new(url.to_string()),
                staged: Vec::new(),
            }),
        }
    }

    /// Stage a commit on a branch; it becomes visible at the next update.
    pub fn commit(
        &self,
        branch: &str,
        hash: CommitHash,
        parents: &[CommitHash],
        timestamp: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let mut inner = self.inner.lock().unwrap();
        inner.graph.add_commit(hash, parents, timestamp)?;
        inner.graph.set_branch(branch, hash)?;
        inner.staged.push((branch.to_string(), hash));
        Ok(())
    }
}

#[async_trait::async_trait]
impl RepoMirror for InMemoryRepo {
    fn url(&self) -> &str {
        &self.url
    }

    async fn update(&self) -> Result<RepoUpdate, RepoError> {
        let mut inner = self.inner.lock().unwrap();
        let graph = Arc::new(inner.graph.clone());
        let mut per_branch: BTreeMap<String, Vec<CommitHash>> = BTreeMap::new();
        for (branch, hash) in inner.staged.drain(..) {
            // Newest first within a branch.
            per_branch.entry(branch).or_default().insert(0, hash);
        }
        let new_commits = per_branch
            .into_iter()
            .map(|(branch, commits)| NewCommits { branch, commits })
            .collect();
        Ok(RepoUpdate { graph, new_commits })
    }
}
