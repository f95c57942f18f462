use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use conveyor_core::{Blacklist, InMemoryCfgCache, InMemoryRepo, RepoMirror};
use conveyor_lib::{
    CommitHash, Dimensions, Job, JobSpec, JobStatus, Patch, RepoState, Task, TaskKey, TaskSpec,
    TaskStatus, TasksCfg, Trigger,
};
use conveyor_schedactor::{
    BackendError, BackendTaskState, InMemoryDiagnostics, MockBackend, Scheduler, SchedulerConfig,
    TAG_NAME, TAG_REVISION,
};
use conveyor_taskdb::{InMemoryDb, JobDb, TaskDb};

const REPO: &str = "https://example.com/repos/skia.git";

fn hash(b: u8) -> CommitHash {
    CommitHash::new([b; 20])
}

fn dims() -> Dimensions {
    Dimensions::parse(&["pool:Skia", "os:Ubuntu"]).unwrap()
}

fn build_spec(deps: &[&str], max_attempts: u32) -> TaskSpec {
    TaskSpec {
        dimensions: dims(),
        dependencies: deps.iter().map(|s| s.to_string()).collect(),
        max_attempts,
        ..Default::default()
    }
}

/// Config with a Build task and a Build-Job firing on every commit.
fn single_task_cfg() -> TasksCfg {
    let mut cfg = TasksCfg::default();
    cfg.tasks.insert("Build".into(), build_spec(&[], 0));
    cfg.jobs.insert(
        "Build-Job".into(),
        JobSpec {
            task_specs: vec!["Build".into()],
            priority: 0.5,
            trigger: Trigger::AnyCommit,
        },
    );
    cfg
}

/// Tasks only, no job specs: tests drive job creation by hand.
fn tasks_only_cfg(names: &[(&str, &[&str])]) -> TasksCfg {
    let mut cfg = TasksCfg::default();
    for (name, deps) in names {
        cfg.tasks.insert(name.to_string(), build_spec(deps, 0));
    }
    cfg
}

struct Fixture {
    db: Arc<InMemoryDb>,
    backend: Arc<MockBackend>,
    repo: Arc<InMemoryRepo>,
    diagnostics: Arc<InMemoryDiagnostics>,
    scheduler: Scheduler,
    now: DateTime<Utc>,
}

impl Fixture {
    async fn new(cfg: TasksCfg) -> Self {
        let db = Arc::new(InMemoryDb::new());
        let backend = Arc::new(MockBackend::new());
        let cfgs = Arc::new(InMemoryCfgCache::new());
        cfgs.insert_repo_fallback(REPO, cfg).unwrap();
        let repo = Arc::new(InMemoryRepo::new(REPO));
        let diagnostics = Arc::new(InMemoryDiagnostics::new());
        let config = SchedulerConfig {
            branches: vec!["main".into(), "B".into()],
            ..Default::default()
        };
        let scheduler = Scheduler::new(
            config,
            db.clone(),
            backend.clone(),
            cfgs.clone(),
            vec![repo.clone() as Arc<dyn RepoMirror>],
            Arc::new(Blacklist::default()),
            diagnostics.clone(),
        )
        .await
        .unwrap();
        Self {
            db,
            backend,
            repo,
            diagnostics,
            scheduler,
            now: Utc::now(),
        }
    }

    /// Stage a linear run of commits c(from)..=c(to) on a branch.
    fn commits(&self, branch: &str, from: u8, to: u8, parent: Option<u8>) {
        let mut prev = parent;
        for i in from..=to {
            let parents: Vec<CommitHash> = prev.map(hash).into_iter().collect();
            self.repo
                .commit(
                    branch,
                    hash(i),
                    &parents,
                    self.now - Duration::minutes((to - i) as i64 + 1),
                )
                .unwrap();
            prev = Some(i);
        }
    }

    async fn insert_job(&self, repo_state: RepoState, deps: &[(&str, &[&str])]) -> Job {
        let dependencies: BTreeMap<String, Vec<String>> = deps
            .iter()
            .map(|(name, d)| {
                (
                    name.to_string(),
                    d.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect();
        let mut job = Job {
            id: self.db.assign_job_id().await.unwrap(),
            name: "Manual-Job".into(),
            repo_state,
            created: self.now,
            priority: 0.5,
            dependencies,
            status: JobStatus::InProgress,
            finished: None,
            is_force: false,
            db_modified: self.now,
        };
        self.db.put_job(&mut job).await.unwrap();
        job
    }

    async fn insert_task(
        &self,
        id: &str,
        name: &str,
        revision: u8,
        commits: &[u8],
        status: TaskStatus,
    ) -> Task {
        let mut task = Task {
            id: id.into(),
            name: name.into(),
            repo_state: RepoState::new(REPO.into(), hash(revision)),
            commits: commits.iter().map(|&b| hash(b)).collect(),
            status,
            attempt: 0,
            retry_of: None,
            parent_task_ids: vec![],
            forced_job_id: None,
            backend_task_id: None,
            created: self.now - Duration::hours(1),
            started: None,
            finished: status.is_terminal().then(|| self.now - Duration::hours(1)),
            output_ref: status.is_success().then(|| format!("out/{id}")),
            failure_reason: None,
            max_attempts: 2,
            db_modified: self.now,
        };
        self.db.put_task(&mut task).await.unwrap();
        task
    }

    async fn all_tasks_named(&self, name: &str) -> Vec<Task> {
        self.db
            .tasks_in_date_range(self.now - Duration::days(30), self.now + Duration::days(1))
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.name == name)
            .collect()
    }
}

/// S1: two commits, one task spec, no workers, then one worker.
#[tokio::test]
async fn test_single_bot_single_task() {
    let f = Fixture::new(single_task_cfg()).await;
    f.commits("main", 1, 2, None);

    // No bots: both candidates stay queued, nothing is created.
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.new_jobs, 2);
    assert_eq!(summary.candidates, 2);
    assert_eq!(summary.matched, 0);
    assert_eq!(summary.queue_remaining, 2);
    assert!(f.db.unfinished_tasks().await.unwrap().is_empty());

    // One matching bot: the newest candidate wins and covers both commits.
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.queue_remaining, 1);

    let tasks = f.db.unfinished_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.repo_state.revision(), &hash(2));
    assert_eq!(task.commits, vec![hash(2), hash(1)]);
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.backend_task_id.is_some());

    // The submission carried the identifying tags.
    let submitted = f.backend.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].tags[TAG_NAME], "Build");
    assert_eq!(submitted[0].tags[TAG_REVISION], hash(2).to_string());
}

/// N bots and N matching candidates trigger exactly N tasks in one tick.
#[tokio::test]
async fn test_n_bots_n_candidates() {
    let f = Fixture::new(single_task_cfg()).await;
    f.commits("main", 1, 3, None);
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);
    f.backend.add_bot("b2", &[("pool", "Skia"), ("os", "Ubuntu")]);

    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.matched, 2);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.queue_remaining, 1);
    assert_eq!(f.db.unfinished_tasks().await.unwrap().len(), 2);
}

/// S2: a new task in the middle of a prior blamelist steals from it, and
/// the union of blamelists stays a disjoint cover.
#[tokio::test]
async fn test_blamelist_stealing() {
    let f = Fixture::new(tasks_only_cfg(&[("Build", &[])])).await;
    f.commits("main", 1, 5, None);
    f.insert_task("t1", "Build", 1, &[1], TaskStatus::Success).await;
    f.insert_task("t5", "Build", 5, &[5, 4, 3, 2], TaskStatus::Success)
        .await;
    f.insert_job(RepoState::new(REPO.into(), hash(3)), &[("Build", &[])])
        .await;
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);

    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 1);

    let tasks = f.all_tasks_named("Build").await;
    assert_eq!(tasks.len(), 3);
    let by_id: BTreeMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let new_task = tasks
        .iter()
        .find(|t| t.id != "t1" && t.id != "t5")
        .expect("new task");
    assert_eq!(new_task.commits, vec![hash(3), hash(2)]);
    assert_eq!(by_id["t5"].commits, vec![hash(5), hash(4)]);
    assert_eq!(by_id["t1"].commits, vec![hash(1)]);

    // Disjoint cover of c1..c5.
    let mut seen = HashSet::new();
    for t in &tasks {
        for c in &t.commits {
            assert!(seen.insert(*c), "{c} in two blamelists");
        }
    }
    assert_eq!(seen, (1..=5).map(hash).collect());
}

/// S3: blamelists across a branch and its merge point.
#[tokio::test]
async fn test_merge_point_blamelist() {
    let f = Fixture::new(tasks_only_cfg(&[("Build", &[])])).await;
    // main: c1 c2 c3 c4 c6; branch B: h1 h2 off c3; c7 merges (c6, h2).
    f.commits("main", 1, 4, None);
    f.repo
        .commit("B", hash(0x11), &[hash(3)], f.now - Duration::minutes(40))
        .unwrap();
    f.repo
        .commit("B", hash(0x12), &[hash(0x11)], f.now - Duration::minutes(39))
        .unwrap();
    f.repo
        .commit("main", hash(6), &[hash(4)], f.now - Duration::minutes(30))
        .unwrap();
    f.repo
        .commit(
            "main",
            hash(7),
            &[hash(6), hash(0x12)],
            f.now - Duration::minutes(20),
        )
        .unwrap();
    f.insert_task("t3", "Build", 3, &[3, 2, 1], TaskStatus::Success)
        .await;
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);

    // First task on the branch covers only the branch commits.
    f.insert_job(
        RepoState::new(REPO.into(), hash(0x12)),
        &[("Build", &[])],
    )
    .await;
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 1);
    let branch_task = f
        .all_tasks_named("Build")
        .await
        .into_iter()
        .find(|t| t.repo_state.revision() == &hash(0x12))
        .unwrap();
    assert_eq!(branch_task.commits, vec![hash(0x12), hash(0x11)]);

    // The merge task covers the mainline only; branch commits are already
    // attributed.
    f.insert_job(RepoState::new(REPO.into(), hash(7)), &[("Build", &[])])
        .await;
    f.backend
        .set_task_state(branch_task.backend_task_id.as_deref().unwrap(), BackendTaskState::Completed, false);
    f.backend.add_bot("b2", &[("pool", "Skia"), ("os", "Ubuntu")]);
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 1);
    let merge_task = f
        .all_tasks_named("Build")
        .await
        .into_iter()
        .find(|t| t.repo_state.revision() == &hash(7))
        .unwrap();
    assert_eq!(merge_task.commits, vec![hash(7), hash(6), hash(4)]);
}

/// S4: failures retry with a decayed score until max_attempts.
#[tokio::test]
async fn test_retry_on_failure() {
    let mut cfg = single_task_cfg();
    cfg.tasks.get_mut("Build").unwrap().max_attempts = 3;
    let f = Fixture::new(cfg).await;
    f.commits("main", 1, 2, None);
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);

    // First attempt runs at c2 and fails.
    f.scheduler.tick(f.now).await.unwrap();
    let first = f
        .all_tasks_named("Build")
        .await
        .into_iter()
        .find(|t| t.repo_state.revision() == &hash(2))
        .unwrap();
    let first_score = f
        .diagnostics
        .last()
        .unwrap()
        .candidates
        .iter()
        .find(|c| c.task_key.contains(&hash(2).to_string()))
        .unwrap()
        .score;
    f.backend.set_task_state(
        first.backend_task_id.as_deref().unwrap(),
        BackendTaskState::Completed,
        true,
    );

    // Second attempt: same revision, attempt 1, score multiplied down.
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 1);
    let retry = f
        .all_tasks_named("Build")
        .await
        .into_iter()
        .find(|t| t.attempt == 1)
        .expect("retry task");
    assert_eq!(retry.repo_state.revision(), &hash(2));
    assert_eq!(retry.retry_of.as_deref(), Some(first.id.as_str()));
    let retry_score = f
        .diagnostics
        .last()
        .unwrap()
        .candidates
        .iter()
        .find(|c| c.attempt == 1)
        .unwrap()
        .score;
    assert!((retry_score - first_score * 0.75).abs() < 1e-9);

    // Third failure exhausts the attempt budget; no further retry.
    f.backend.set_task_state(
        retry.backend_task_id.as_deref().unwrap(),
        BackendTaskState::Completed,
        true,
    );
    f.scheduler.tick(f.now).await.unwrap();
    let final_attempt = f
        .all_tasks_named("Build")
        .await
        .into_iter()
        .find(|t| t.attempt == 2)
        .expect("final attempt");
    f.backend.set_task_state(
        final_attempt.backend_task_id.as_deref().unwrap(),
        BackendTaskState::Completed,
        true,
    );
    f.scheduler.tick(f.now).await.unwrap();
    let attempts: Vec<Task> = f
        .all_tasks_named("Build")
        .await
        .into_iter()
        .filter(|t| t.repo_state.revision() == &hash(2))
        .collect();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|t| t.status == TaskStatus::Failure));
}

/// S5: a try-job's dependencies are never satisfied by patchless tasks.
#[tokio::test]
async fn test_try_job_isolation() {
    let f = Fixture::new(tasks_only_cfg(&[("Build", &[]), ("Test", &["Build"])])).await;
    f.commits("main", 1, 2, None);
    // A regular Build already succeeded at c2.
    f.insert_task("t-build", "Build", 2, &[2, 1], TaskStatus::Success)
        .await;

    let patch = Patch::new("review.example".into(), "12345".into(), "2".into(), String::new());
    let try_state = RepoState::new_try(REPO.into(), hash(2), patch);
    f.insert_job(try_state.clone(), &[("Build", &[]), ("Test", &["Build"])])
        .await;
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);

    // The try-job gets its own Build first; Test stays blocked.
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 1);
    let tasks = f.all_tasks_named("Build").await;
    let try_build = tasks
        .iter()
        .find(|t| t.repo_state.is_try_job())
        .expect("try build");
    assert!(try_build.commits.is_empty());
    assert!(f.all_tasks_named("Test").await.is_empty());

    // Once the try Build succeeds, the try Test runs with it as parent.
    f.backend.set_task_state(
        try_build.backend_task_id.as_deref().unwrap(),
        BackendTaskState::Completed,
        false,
    );
    f.backend.add_bot("b2", &[("pool", "Skia"), ("os", "Ubuntu")]);
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 1);
    let try_test = f
        .all_tasks_named("Test")
        .await
        .into_iter()
        .next()
        .expect("try test");
    assert!(try_test.repo_state.is_try_job());
    assert_eq!(try_test.parent_task_ids, vec![try_build.id.clone()]);
}

/// S6: a backend dedup persists an already-successful task and unblocks
/// dependents on the next tick.
#[tokio::test]
async fn test_backend_dedup() {
    let mut cfg = tasks_only_cfg(&[("Build", &[]), ("Test", &["Build"])]);
    cfg.jobs.insert(
        "Test-Job".into(),
        JobSpec {
            task_specs: vec!["Test".into()],
            priority: 0.5,
            trigger: Trigger::AnyCommit,
        },
    );
    let f = Fixture::new(cfg).await;
    f.commits("main", 1, 2, None);
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);
    f.backend.dedup_next_submit("out/cached-42");

    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.deduplicated, 1);
    assert_eq!(summary.dispatched, 0);
    let build = f
        .all_tasks_named("Build")
        .await
        .into_iter()
        .find(|t| t.repo_state.revision() == &hash(2))
        .unwrap();
    assert_eq!(build.status, TaskStatus::Success);
    assert_eq!(build.output_ref.as_deref(), Some("out/cached-42"));
    assert_eq!(build.finished, Some(f.now));

    // The dependent becomes eligible right away.
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 1);
    let test_task = f
        .all_tasks_named("Test")
        .await
        .into_iter()
        .find(|t| t.repo_state.revision() == &hash(2))
        .unwrap();
    assert_eq!(test_task.parent_task_ids, vec![build.id]);
}

/// A permanent submit failure records a mishap and the loop continues; a
/// transient one abandons the pair for the tick.
#[tokio::test]
async fn test_submit_failures() {
    let f = Fixture::new(single_task_cfg()).await;
    f.commits("main", 1, 1, None);
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);

    f.backend
        .fail_next_submit(BackendError::Permanent("bad input digest".into()));
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.mishaps, 1);
    let task = &f.all_tasks_named("Build").await[0];
    assert_eq!(task.status, TaskStatus::Mishap);
    assert!(task.failure_reason.as_deref().unwrap().contains("bad input"));

    // The mishap counts as an attempt; the retry hits a transient failure
    // and nothing is persisted for it.
    f.backend
        .fail_next_submit(BackendError::Transient("503".into()));
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(f.all_tasks_named("Build").await.len(), 1);

    // Next tick the retry goes through.
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 1);
    let retry = f
        .all_tasks_named("Build")
        .await
        .into_iter()
        .find(|t| t.attempt == 1)
        .unwrap();
    assert_eq!(retry.status, TaskStatus::Pending);
}

/// Forced jobs rerun tasks that already succeeded and outrank regular
/// work.
#[tokio::test]
async fn test_force_run() {
    let f = Fixture::new(tasks_only_cfg(&[("Build", &[])])).await;
    f.commits("main", 1, 2, None);
    f.insert_task("t-old", "Build", 2, &[2, 1], TaskStatus::Success)
        .await;
    let mut job = f
        .insert_job(RepoState::new(REPO.into(), hash(2)), &[("Build", &[])])
        .await;
    job.is_force = true;
    f.db.put_job(&mut job).await.unwrap();
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);

    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.dispatched, 1);
    let forced = f
        .all_tasks_named("Build")
        .await
        .into_iter()
        .find(|t| t.forced_job_id.is_some())
        .expect("forced task");
    assert_eq!(forced.forced_job_id.as_deref(), Some(job.id.as_str()));
    let record = f.diagnostics.last().unwrap();
    assert!(record.candidates[0].score >= 1e5);
}

/// Periodic triggers materialize jobs at branch tips, once per period.
#[tokio::test]
async fn test_periodic_trigger() {
    let mut cfg = single_task_cfg();
    cfg.jobs.insert(
        "Nightly-Job".into(),
        JobSpec {
            task_specs: vec!["Build".into()],
            priority: 0.8,
            trigger: Trigger::Nightly,
        },
    );
    let f = Fixture::new(cfg).await;
    f.commits("main", 1, 2, None);

    // Regular tick: only the any-commit jobs appear.
    let summary = f.scheduler.tick(f.now).await.unwrap();
    assert_eq!(summary.new_jobs, 2);

    // The nightly trigger creates one job at the tip, idempotently.
    let created = f
        .scheduler
        .maybe_trigger_periodic_jobs(Trigger::Nightly)
        .await
        .unwrap();
    assert_eq!(created, 1);
    let created = f
        .scheduler
        .maybe_trigger_periodic_jobs(Trigger::Nightly)
        .await
        .unwrap();
    assert_eq!(created, 0);

    let nightly_jobs = f
        .db
        .get_jobs_at(&RepoState::new(REPO.into(), hash(2)), "Nightly-Job")
        .await
        .unwrap();
    assert_eq!(nightly_jobs.len(), 1);
    assert_eq!(nightly_jobs[0].priority, 0.8);
}

/// Jobs complete once every task in their graph is terminal, and the
/// diagnostics artifact records each tick.
#[tokio::test]
async fn test_job_completion_and_diagnostics() {
    let f = Fixture::new(single_task_cfg()).await;
    f.commits("main", 2, 2, None);
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);

    f.scheduler.tick(f.now).await.unwrap();
    let task = &f.db.unfinished_tasks().await.unwrap()[0];
    f.backend.set_task_state(
        task.backend_task_id.as_deref().unwrap(),
        BackendTaskState::Completed,
        false,
    );
    f.scheduler.tick(f.now).await.unwrap();

    let jobs = f
        .db
        .get_jobs_at(&RepoState::new(REPO.into(), hash(2)), "Build-Job")
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Success);
    assert!(jobs[0].finished.is_some());

    let ticks = f.diagnostics.ticks();
    assert_eq!(ticks.len(), 2);
    assert_eq!(ticks[0].num_bots, 1);
    assert_eq!(ticks[0].dispatched_task_ids.len(), 1);
    assert!(ticks[0].matches.iter().any(|m| m.chosen_bot.is_some()));

    // tasks_for_job surfaces the recorded attempt.
    let tasks = f.scheduler.tasks_for_job(&jobs[0].id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Success);
}

/// At most one outstanding task per key, across consecutive ticks.
#[tokio::test]
async fn test_no_duplicate_outstanding_tasks() {
    let f = Fixture::new(single_task_cfg()).await;
    f.commits("main", 1, 2, None);
    f.backend.add_bot("b1", &[("pool", "Skia"), ("os", "Ubuntu")]);
    f.backend.add_bot("b2", &[("pool", "Skia"), ("os", "Ubuntu")]);

    f.scheduler.tick(f.now).await.unwrap();
    f.scheduler.tick(f.now).await.unwrap();
    f.scheduler.tick(f.now).await.unwrap();

    let tasks = f
        .db
        .tasks_in_date_range(f.now - Duration::days(1), f.now + Duration::days(1))
        .await
        .unwrap();
    let mut outstanding: BTreeMap<TaskKey, usize> = BTreeMap::new();
    for t in &tasks {
        if !t.done() {
            *outstanding.entry(t.key()).or_default() += 1;
        }
    }
    assert!(outstanding.values().all(|&n| n <= 1), "{outstanding:?}");

    // Blamelists recorded in one tick still partition the history.
    let mut seen = HashSet::new();
    for t in &tasks {
        for c in &t.commits {
            assert!(seen.insert(*c), "{c} in two blamelists");
        }
    }
}
