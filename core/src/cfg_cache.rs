use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use conveyor_lib::{CfgError, CommitHash, RepoState, TasksCfg};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CfgCacheError {
    #[error("no task config for {0}")]
    NotFound(RepoState),
    #[error("invalid task config for {repo_state}: {err}")]
    Invalid { repo_state: RepoState, err: CfgError },
}

/// Read side of the task-graph configuration cache. Implementations are
/// refreshed out-of-band; within one tick the view is stable.
pub trait TasksCfgProvider: Send + Sync {
    /// The validated task graph at a RepoState. A config that failed ingest
    /// validation reports [`CfgCacheError::Invalid`] here, permanently.
    fn get(&self, repo_state: &RepoState) -> Result<Arc<TasksCfg>, CfgCacheError>;

    /// Whether the task name exists in the graph at this plain commit. The
    /// blamelist engine uses this to avoid attributing commits that predate
    /// the task's introduction.
    fn task_defined_at(&self, repo: &str, commit: &CommitHash, name: &str) -> bool {
        self.get(&RepoState::new(repo.to_string(), *commit))
            .map(|cfg| cfg.tasks.contains_key(name))
            .unwrap_or(false)
    }
}

/// Config cache backed by explicit inserts: exact RepoState entries first,
/// then a per-repo fallback used for every revision that has no entry of
/// its own.
#[derive(Default)]
pub struct InMemoryCfgCache {
    inner: RwLock<InMemoryCfgCacheInner>,
}

#[derive(Default)]
struct InMemoryCfgCacheInner {
    exact: HashMap<RepoState, Result<Arc<TasksCfg>, CfgError>>,
    fallback: HashMap<String, Arc<TasksCfg>>,
}

impl InMemoryCfgCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a config for one exact RepoState. Validation failures are
    /// remembered and reported on every subsequent lookup.
    pub fn insert(&self, repo_state: RepoState, cfg: TasksCfg) -> Result<(), CfgError> {
        let entry = match cfg.validate() {
            Ok(()) => Ok(Arc::new(cfg)),
            Err(err) => {
                tracing::warn!("rejecting task config for {repo_state}: {err}");
                Err(err)
            }
        };
        let result = entry.as_ref().map(|_| ()).map_err(|e| e.clone());
        self.inner.write().unwrap().exact.insert(repo_state, entry);
        result
    }

    /// Ingest the fallback config used for every revision of a repo that
    /// has no exact entry.
    pub fn insert_repo_fallback(&self, repo: &str, cfg: TasksCfg) -> Result<(), CfgError> {
        cfg.validate()?;
        self.inner
            .write()
            .unwrap()
            .fallback
            .insert(repo.to_string(), Arc::new(cfg));
        Ok(())
    }
}

impl TasksCfgProvider for InMemoryCfgCache {
    fn get(&self, repo_state: &RepoState) -> Result<Arc<TasksCfg>, CfgCacheError> {
        let inner = self.inner.read().unwrap();
        if let Some(entry) = inner.exact.get(repo_state) {
            return match entry {
                Ok(cfg) => Ok(cfg.clone()),
                Err(err) => Err(CfgCacheError::Invalid {
                    repo_state: repo_state.clone(),
                    err: err.clone(),
                }),
            };
        }
        // A try state without its own entry evaluates at its base revision.
        if repo_state.is_try_job() {
            if let Some(entry) = inner.exact.get(&repo_state.without_patch()) {
                return match entry {
                    Ok(cfg) => Ok(cfg.clone()),
                    Err(err) => Err(CfgCacheError::Invalid {
                        repo_state: repo_state.clone(),
                        err: err.clone(),
                    }),
                };
            }
        }
        inner
            .fallback
            .get(repo_state.repo())
            .cloned()
            .ok_or_else(|| CfgCacheError::NotFound(repo_state.clone()))
    }
}
