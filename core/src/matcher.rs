use std::collections::HashSet;

use conveyor_lib::{BotDimensions, Dimensions};
use serde::Serialize;

use crate::candidates::TaskCandidate;

/// An idle-capable worker as reported by the execution backend.
#[derive(Debug, Clone)]
pub struct BotInfo {
    pub id: String,
    pub dimensions: BotDimensions,
}

/// Workers committed to a pending task, so one worker is never promised to
/// two tasks in a single tick. Rebuilt from scratch every tick.
#[derive(Debug, Default)]
pub struct BusyBots {
    busy: HashSet<String>,
}

impl BusyBots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark workers busy for tasks already pending on the backend: each
    /// pending request claims the first worker, by id, able to run it.
    /// This mirrors the matcher's own policy so the two agree about which
    /// workers are spoken for.
    pub fn mark_pending(&mut self, bots: &[BotInfo], pending: &[Dimensions]) {
        let mut bots: Vec<&BotInfo> = bots.iter().collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        for dims in pending {
            let claimed = bots
                .iter()
                .find(|bot| !self.busy.contains(&bot.id) && dims.satisfied_by(&bot.dimensions));
            if let Some(bot) = claimed {
                tracing::debug!("bot {} is busy with a pending task", bot.id);
                self.busy.insert(bot.id.clone());
            }
        }
    }

    /// Reserve a worker; false when something already claimed it.
    pub fn reserve(&mut self, bot_id: &str) -> bool {
        self.busy.insert(bot_id.to_string())
    }

    /// Give a reservation back, e.g. after a failed dispatch.
    pub fn release(&mut self, bot_id: &str) {
        self.busy.remove(bot_id);
    }

    pub fn is_busy(&self, bot_id: &str) -> bool {
        self.busy.contains(bot_id)
    }

    pub fn len(&self) -> usize {
        self.busy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.busy.is_empty()
    }
}

/// A candidate paired with the worker that will run it.
#[derive(Debug, Clone)]
pub struct Match {
    pub candidate: TaskCandidate,
    pub bot_id: String,
}

/// Why and how each candidate matched, for the tick diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct MatchDiagnostics {
    pub task_key: String,
    pub score: f64,
    /// Ids of idle workers able to run the candidate.
    pub matching_bots: Vec<String>,
    pub chosen_bot: Option<String>,
}

/// Walk the queue in order and greedily pair each candidate with the first
/// idle worker, by id, whose dimensions are a superset of the candidate's.
///
/// Greedy first-fit is deliberately simple: a low-requirement candidate may
/// claim a highly capable worker a later candidate needed. The queue order
/// by score is authoritative, so that loss is accepted.
pub fn match_bots(
    queue: Vec<TaskCandidate>,
    bots: &[BotInfo],
    busy: &mut BusyBots,
) -> (Vec<Match>, Vec<TaskCandidate>, Vec<MatchDiagnostics>) {
    let mut bots: Vec<&BotInfo> = bots.iter().collect();
    bots.sort_by(|a, b| a.id.cmp(&b.id));

    let mut matches = Vec::new();
    let mut unmatched = Vec::new();
    let mut diagnostics = Vec::new();

    for candidate in queue {
        let matching: Vec<&str> = bots
            .iter()
            .filter(|bot| candidate.spec.dimensions.satisfied_by(&bot.dimensions))
            .map(|bot| bot.id.as_str())
            .collect();
        let chosen = matching.iter().find(|id| !busy.is_busy(id)).copied();
        diagnostics.push(MatchDiagnostics {
            task_key: candidate.key.to_string(),
            score: candidate.score,
            matching_bots: matching.iter().map(|s| s.to_string()).collect(),
            chosen_bot: chosen.map(String::from),
        });
        match chosen {
            Some(bot_id) => {
                busy.reserve(bot_id);
                matches.push(Match {
                    bot_id: bot_id.to_string(),
                    candidate,
                });
            }
            None => unmatched.push(candidate),
        }
    }
    (matches, unmatched, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_lib::{CommitHash, RepoState, TaskKey, TaskSpec};
    use std::collections::BTreeSet;

    fn bot(id: &str, dims: &[(&str, &[&str])]) -> BotInfo {
        BotInfo {
            id: id.into(),
            dimensions: dims
                .iter()
                .map(|(k, vs)| {
                    (
                        k.to_string(),
                        vs.iter().map(|v| v.to_string()).collect::<BTreeSet<_>>(),
                    )
                })
                .collect(),
        }
    }

    fn candidate(name: &str, score: f64, dims: &[&str]) -> TaskCandidate {
        TaskCandidate {
            key: TaskKey::new(
                RepoState::new("repo".into(), CommitHash::new([1; 20])),
                name.into(),
            ),
            spec: TaskSpec {
                dimensions: Dimensions::parse(dims).unwrap(),
                ..Default::default()
            },
            jobs: vec![],
            attempt: 0,
            retry_of: None,
            forced_job_id: None,
            parent_task_ids: vec![],
            score,
            commits: vec![],
            stealing_from: None,
        }
    }

    #[test]
    fn test_first_fit_by_bot_id() {
        let bots = vec![
            bot("b2", &[("pool", &["Skia"]), ("os", &["Ubuntu"])]),
            bot("b1", &[("pool", &["Skia"]), ("os", &["Ubuntu"])]),
        ];
        let queue = vec![candidate("Build", 2.0, &["pool:Skia", "os:Ubuntu"])];
        let mut busy = BusyBots::new();
        let (matches, unmatched, diags) = match_bots(queue, &bots, &mut busy);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].bot_id, "b1");
        assert!(unmatched.is_empty());
        assert_eq!(diags[0].matching_bots, vec!["b1", "b2"]);
    }

    #[test]
    fn test_no_double_booking() {
        let bots = vec![bot("b1", &[("pool", &["Skia"]), ("os", &["Ubuntu"])])];
        let queue = vec![
            candidate("Build", 2.0, &["pool:Skia"]),
            candidate("Test", 1.0, &["pool:Skia"]),
        ];
        let mut busy = BusyBots::new();
        let (matches, unmatched, _) = match_bots(queue, &bots, &mut busy);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].candidate.key.name(), "Build");
        assert_eq!(unmatched.len(), 1);
        assert!(busy.is_busy("b1"));
    }

    #[test]
    fn test_dimension_subset_required() {
        let bots = vec![bot("b1", &[("pool", &["Skia"])])];
        let queue = vec![candidate("Build", 2.0, &["pool:Skia", "gpu:nvidia"])];
        let mut busy = BusyBots::new();
        let (matches, unmatched, diags) = match_bots(queue, &bots, &mut busy);
        assert!(matches.is_empty());
        assert_eq!(unmatched.len(), 1);
        assert!(diags[0].matching_bots.is_empty());
    }

    #[test]
    fn test_greedy_accepts_suboptimal_assignment() {
        // The capable bot sorts first and is taken by the low-requirement
        // candidate; the picky candidate goes unmatched.
        let bots = vec![
            bot("b1", &[("pool", &["Skia"]), ("gpu", &["nvidia"])]),
            bot("b2", &[("pool", &["Skia"])]),
        ];
        let queue = vec![
            candidate("Anything", 5.0, &["pool:Skia"]),
            candidate("NeedsGpu", 4.0, &["pool:Skia", "gpu:nvidia"]),
        ];
        let mut busy = BusyBots::new();
        let (matches, unmatched, _) = match_bots(queue, &bots, &mut busy);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].bot_id, "b1");
        assert_eq!(unmatched[0].key.name(), "NeedsGpu");
    }

    #[test]
    fn test_busy_from_pending_tasks() {
        let bots = vec![
            bot("b1", &[("pool", &["Skia"]), ("os", &["Ubuntu"])]),
            bot("b2", &[("pool", &["Skia"]), ("os", &["Ubuntu"])]),
        ];
        let pending = vec![Dimensions::parse(&["pool:Skia", "os:Ubuntu"]).unwrap()];
        let mut busy = BusyBots::new();
        busy.mark_pending(&bots, &pending);
        assert!(busy.is_busy("b1"));
        assert!(!busy.is_busy("b2"));

        // The matcher then only sees b2.
        let queue = vec![candidate("Build", 2.0, &["pool:Skia"])];
        let (matches, _, _) = match_bots(queue, &bots, &mut busy);
        assert_eq!(matches[0].bot_id, "b2");
    }
}
