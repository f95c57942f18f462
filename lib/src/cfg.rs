use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use crate::Dimensions;

/// Fallback when a task spec does not declare its own attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

fn default_execution_timeout() -> Duration {
    Duration::from_secs(4 * 60 * 60)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(40 * 60)
}

fn default_expiration() -> Duration {
    Duration::from_secs(9 * 60 * 60)
}

/// When a job spec's jobs are materialized.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    /// On every new commit of any tracked branch.
    #[default]
    AnyCommit,
    /// On every new commit of the main branch only.
    MainOnly,
    /// Only when the nightly trigger fires.
    Nightly,
    /// Only when the weekly trigger fires.
    Weekly,
}

impl Trigger {
    pub fn is_periodic(&self) -> bool {
        matches!(self, Trigger::Nightly | Trigger::Weekly)
    }

    /// The natural period of a periodic trigger, used for idempotence.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Trigger::Nightly => Some(Duration::from_secs(24 * 60 * 60)),
            Trigger::Weekly => Some(Duration::from_secs(7 * 24 * 60 * 60)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::AnyCommit => "any-commit",
            Trigger::MainOnly => "main-only",
            Trigger::Nightly => "nightly",
            Trigger::Weekly => "weekly",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Trigger {
    type Err = CfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any-commit" => Ok(Trigger::AnyCommit),
            "main-only" => Ok(Trigger::MainOnly),
            "nightly" => Ok(Trigger::Nightly),
            "weekly" => Ok(Trigger::Weekly),
            other => Err(CfgError::UnknownTrigger(other.to_string())),
        }
    }
}

/// Static declaration of one task kind, consumed from the per-revision
/// task-graph configuration.
#[serde_as]
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    /// `key:value` capability requirements a worker must satisfy.
    pub dimensions: Dimensions,
    /// Names of task specs that must succeed first, at the same RepoState.
    pub dependencies: Vec<String>,
    /// In (0, 1]; aggregated across depending jobs during scoring.
    pub priority: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub execution_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub io_timeout: Duration,
    /// How long the request may sit unmatched on the backend.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub expiration: Duration,
    /// Attempt budget including the first run; 0 means the default.
    pub max_attempts: u32,
    /// Opaque extra inputs forwarded to the backend request.
    pub extra_inputs: Vec<String>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            dimensions: Dimensions::default(),
            dependencies: Vec::new(),
            priority: 0.5,
            execution_timeout: default_execution_timeout(),
            io_timeout: default_io_timeout(),
            expiration: default_expiration(),
            max_attempts: 0,
            extra_inputs: Vec::new(),
        }
    }
}

impl TaskSpec {
    pub fn effective_max_attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            DEFAULT_MAX_ATTEMPTS
        } else {
            self.max_attempts
        }
    }
}

/// Named root of a dependency graph: the tasks a job asks for, plus
/// scheduling hints.
#[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    /// Roots of the job's graph; dependencies are pulled in transitively.
    pub task_specs: Vec<String>,
    /// In (0, 1].
    pub priority: f64,
    pub trigger: Trigger,
}

/// The validated task/job graph for one RepoState, as returned by the
/// config cache.
#[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksCfg {
    pub tasks: BTreeMap<String, TaskSpec>,
    pub jobs: BTreeMap<String, JobSpec>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CfgError {
    #[error("job {0:?} is not defined")]
    UnknownJob(String),
    #[error("task {task:?} wanted by {wanted_by:?} is not defined")]
    UnknownTask { task: String, wanted_by: String },
    #[error("dependency cycle through task {0:?}")]
    Cycle(String),
    #[error("task {task:?} priority {priority} is outside (0, 1]")]
    BadPriority { task: String, priority: String },
    #[error("task {task:?} declares no pool dimension")]
    MissingPool { task: String },
    #[error("unknown trigger {0:?}")]
    UnknownTrigger(String),
}

impl TasksCfg {
    /// Validation run on ingest by the config cache. A config that fails
    /// here never reaches the scheduler.
    pub fn validate(&self) -> Result<(), CfgError> {
        for (name, spec) in &self.tasks {
            if !(spec.priority > 0.0 && spec.priority <= 1.0) {
                return Err(CfgError::BadPriority {
                    task: name.clone(),
                    priority: spec.priority.to_string(),
                });
            }
            if spec.dimensions.pool().is_none() {
                return Err(CfgError::MissingPool { task: name.clone() });
            }
            for dep in &spec.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(CfgError::UnknownTask {
                        task: dep.clone(),
                        wanted_by: name.clone(),
                    });
                }
            }
        }
        for (name, job) in &self.jobs {
            if !(job.priority > 0.0 && job.priority <= 1.0) {
                return Err(CfgError::BadPriority {
                    task: name.clone(),
                    priority: job.priority.to_string(),
                });
            }
            for task in &job.task_specs {
                if !self.tasks.contains_key(task) {
                    return Err(CfgError::UnknownTask {
                        task: task.clone(),
                        wanted_by: name.clone(),
                    });
                }
            }
        }
        self.check_acyclic()
    }

    /// Depth-first back-edge detection over the task dependency graph.
    /// Iterative: config graphs are author-controlled and may be deep.
    fn check_acyclic(&self) -> Result<(), CfgError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        for root in self.tasks.keys() {
            if marks.contains_key(root.as_str()) {
                continue;
            }
            // (name, child cursor) frames.
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            marks.insert(root.as_str(), Mark::InProgress);
            while let Some((name, cursor)) = stack.pop() {
                let deps = &self.tasks[name].dependencies;
                if cursor < deps.len() {
                    stack.push((name, cursor + 1));
                    let dep = deps[cursor].as_str();
                    match marks.get(dep) {
                        Some(Mark::InProgress) => return Err(CfgError::Cycle(dep.to_string())),
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(dep, Mark::InProgress);
                            stack.push((dep, 0));
                        }
                    }
                } else {
                    marks.insert(name, Mark::Done);
                }
            }
        }
        Ok(())
    }

    /// The transitive dependency graph of one job: every reachable task
    /// name mapped to its direct dependencies. Assumes `validate` passed.
    pub fn expand_job(&self, job_name: &str) -> Result<BTreeMap<String, Vec<String>>, CfgError> {
        let job = self
            .jobs
            .get(job_name)
            .ok_or_else(|| CfgError::UnknownJob(job_name.to_string()))?;
        let mut graph = BTreeMap::new();
        let mut worklist: Vec<&str> = job.task_specs.iter().map(String::as_str).collect();
        let mut seen: BTreeSet<&str> = worklist.iter().copied().collect();
        while let Some(name) = worklist.pop() {
            let spec = self.tasks.get(name).ok_or_else(|| CfgError::UnknownTask {
                task: name.to_string(),
                wanted_by: job_name.to_string(),
            })?;
            graph.insert(name.to_string(), spec.dependencies.clone());
            for dep in &spec.dependencies {
                if seen.insert(dep.as_str()) {
                    worklist.push(dep.as_str());
                }
            }
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(deps: &[&str]) -> TaskSpec {
        TaskSpec {
            dimensions: Dimensions::parse(&["pool:Skia", "os:Ubuntu"]).unwrap(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn cfg(tasks: &[(&str, &[&str])], jobs: &[(&str, &[&str])]) -> TasksCfg {
        TasksCfg {
            tasks: tasks
                .iter()
                .map(|(name, deps)| (name.to_string(), spec(deps)))
                .collect(),
            jobs: jobs
                .iter()
                .map(|(name, roots)| {
                    (
                        name.to_string(),
                        JobSpec {
                            task_specs: roots.iter().map(|s| s.to_string()).collect(),
                            priority: 0.5,
                            trigger: Trigger::AnyCommit,
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_validate_ok() {
        let c = cfg(
            &[("Build", &[]), ("Test", &["Build"]), ("Perf", &["Build"])],
            &[("Test-Job", &["Test"]), ("Perf-Job", &["Perf"])],
        );
        c.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let c = cfg(
            &[("A", &["B"]), ("B", &["C"]), ("C", &["A"])],
            &[("J", &["A"])],
        );
        assert!(matches!(c.validate(), Err(CfgError::Cycle(_))));
    }

    #[test]
    fn test_validate_rejects_self_cycle() {
        let c = cfg(&[("A", &["A"])], &[]);
        assert!(matches!(c.validate(), Err(CfgError::Cycle(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let c = cfg(&[("Test", &["Build"])], &[]);
        assert_eq!(
            c.validate(),
            Err(CfgError::UnknownTask {
                task: "Build".into(),
                wanted_by: "Test".into()
            })
        );
    }

    #[test]
    fn test_validate_rejects_bad_priority() {
        let mut c = cfg(&[("Build", &[])], &[]);
        c.tasks.get_mut("Build").unwrap().priority = 1.5;
        assert!(matches!(c.validate(), Err(CfgError::BadPriority { .. })));
        c.tasks.get_mut("Build").unwrap().priority = 0.0;
        assert!(matches!(c.validate(), Err(CfgError::BadPriority { .. })));
    }

    #[test]
    fn test_validate_requires_pool() {
        let mut c = cfg(&[("Build", &[])], &[]);
        c.tasks.get_mut("Build").unwrap().dimensions =
            Dimensions::parse(&["os:Ubuntu"]).unwrap();
        assert_eq!(
            c.validate(),
            Err(CfgError::MissingPool {
                task: "Build".into()
            })
        );
    }

    #[test]
    fn test_expand_job_transitive() {
        let c = cfg(
            &[
                ("Compile", &[]),
                ("Build", &["Compile"]),
                ("Test", &["Build"]),
                ("Unrelated", &[]),
            ],
            &[("Test-Job", &["Test"])],
        );
        let graph = c.expand_job("Test-Job").unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph["Test"], vec!["Build".to_string()]);
        assert_eq!(graph["Build"], vec!["Compile".to_string()]);
        assert!(graph["Compile"].is_empty());
        assert!(!graph.contains_key("Unrelated"));
    }

    #[test]
    fn test_expand_unknown_job() {
        let c = cfg(&[], &[]);
        assert_eq!(
            c.expand_job("nope"),
            Err(CfgError::UnknownJob("nope".into()))
        );
    }
}
