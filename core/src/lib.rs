//! The scheduling algorithms: repo graphs, blamelist computation with
//! commit stealing, candidate generation and filtering, scoring, queue
//! regeneration and bot matching. Everything here is synchronous and pure
//! over the snapshots handed in by the driver; I/O stays in the driver and
//! store crates.

mod blacklist;
mod blamelist;
mod candidates;
mod cfg_cache;
mod matcher;
mod queue;
mod repograph;
mod score;

// Re-export
pub use blacklist::{Blacklist, BlacklistRule};
pub use blamelist::{compute_blamelist, Blamelist, BlamelistOracle, ViewOracle};
pub use candidates::{
    filter_candidates, generate_candidates, CandidateError, CandidateSet, FilterReason,
    GroupedCandidates, TaskCandidate, TaskView,
};
pub use cfg_cache::{CfgCacheError, InMemoryCfgCache, TasksCfgProvider};
pub use matcher::{match_bots, BotInfo, BusyBots, Match, MatchDiagnostics};
pub use queue::{regenerate_queue, QueueInputs, TickQueue};
pub use repograph::{
    Commit, InMemoryRepo, NewCommits, RepoError, RepoGraph, RepoMirror, RepoUpdate,
};
pub use score::{testedness, testedness_increase, ScoreConfig, Scorer};
