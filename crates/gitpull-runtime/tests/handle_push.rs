use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use gitpull_runtime::events::{
    CoordinatorConfig, GitProcessor, InMemoryPullEventRepository, LineageKey, NewPullEvent,
    ProcessingError, PullEvent, PullEventCoordinator, PullEventId, PullEventRepository,
    PullEventStatus, PushNotification, ResolverConfig, SyncPlan,
};
use gitpull_runtime::PullEventError;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn push_to(branch: &str, commit: &str, secs: i64) -> PushNotification {
    PushNotification {
        provider: "github".into(),
        repository_owner: "acme".into(),
        repository_name: "widgets".into(),
        branch: branch.into(),
        commit: commit.into(),
        pushed_at: Utc.timestamp_opt(secs, 0).single().unwrap(),
    }
}

fn main_lineage() -> LineageKey {
    LineageKey::new("github", "acme", "widgets", "main")
}

/// Holds every processing run until the gate is open.
struct GatedProcessor {
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl GitProcessor for GatedProcessor {
    async fn process(&self, _: &PullEvent, _: &SyncPlan) -> Result<(), ProcessingError> {
        let mut gate = self.gate.clone();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(ProcessingError::new("gate dropped"));
        }
        Ok(())
    }
}

type Coordinator = PullEventCoordinator<InMemoryPullEventRepository, GatedProcessor>;

fn gated(open: bool) -> (Arc<Coordinator>, Arc<InMemoryPullEventRepository>, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(open);
    let repo = Arc::new(InMemoryPullEventRepository::new());
    let coordinator = PullEventCoordinator::new(
        Arc::clone(&repo),
        GatedProcessor { gate: rx },
        ResolverConfig::default(),
        CoordinatorConfig::default(),
    );
    (Arc::new(coordinator), repo, tx)
}

async fn wait_for_statuses(
    repo: &InMemoryPullEventRepository,
    lineage: &LineageKey,
    status: PullEventStatus,
    count: usize,
) {
    for _ in 0..500 {
        let matching = repo
            .list_lineage(lineage, 100)
            .unwrap()
            .into_iter()
            .filter(|e| e.status == status)
            .count();
        if matching >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {count} {status} events");
}

#[tokio::test]
async fn ready_t20_is_chosen_over_ready_t10() {
    init_logging();
    let (coordinator, _, _gate) = gated(true);

    coordinator.handle_push(push_to("main", "t10", 10)).await.unwrap();
    let t20 = coordinator.handle_push(push_to("main", "t20", 20)).await.unwrap();
    let t30 = coordinator.handle_push(push_to("main", "t30", 30)).await.unwrap();

    assert_eq!(
        t30.plan,
        SyncPlan::Incremental {
            base_event: t20.event.id,
            base_commit: "t20".into()
        }
    );
}

#[tokio::test]
async fn out_of_order_arrival_resolves_by_push_time() {
    init_logging();
    let (coordinator, _, _gate) = gated(true);

    let late = coordinator.handle_push(push_to("main", "late", 50)).await.unwrap();
    assert_eq!(late.plan, SyncPlan::FullClone);

    // Arrives second but was pushed first: nothing precedes it.
    let early = coordinator.handle_push(push_to("main", "early", 40)).await.unwrap();
    assert_eq!(early.plan, SyncPlan::FullClone);

    let newest = coordinator.handle_push(push_to("main", "newest", 60)).await.unwrap();
    assert_eq!(
        newest.plan,
        SyncPlan::Incremental {
            base_event: late.event.id,
            base_commit: "late".into()
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_pushes_create_independent_records() {
    init_logging();
    let (coordinator, repo, gate) = gated(true);
    let lineage = main_lineage();

    let base = coordinator.handle_push(push_to("main", "base", 5)).await.unwrap();
    gate.send(false).unwrap();

    let first = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_push(push_to("main", "dup", 10)).await }
    });
    let second = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_push(push_to("main", "dup", 10)).await }
    });
    wait_for_statuses(&repo, &lineage, PullEventStatus::Running, 2).await;
    gate.send(true).unwrap();

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_ne!(first.event.id, second.event.id);
    let expected = SyncPlan::Incremental {
        base_event: base.event.id,
        base_commit: "base".into(),
    };
    assert_eq!(first.plan, expected);
    assert_eq!(second.plan, expected);

    let dups: Vec<_> = coordinator
        .history(&lineage, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.commit == "dup")
        .collect();
    assert_eq!(dups.len(), 2);
    assert!(dups.iter().all(PullEvent::is_ready));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_predecessor_is_not_a_diff_base() {
    init_logging();
    let (coordinator, repo, gate) = gated(true);
    let lineage = main_lineage();

    let base = coordinator.handle_push(push_to("main", "base", 1)).await.unwrap();
    gate.send(false).unwrap();
    let slow = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_push(push_to("main", "slow", 2)).await }
    });
    wait_for_statuses(&repo, &lineage, PullEventStatus::Running, 1).await;

    let fast = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_push(push_to("main", "fast", 3)).await }
    });
    wait_for_statuses(&repo, &lineage, PullEventStatus::Running, 2).await;
    gate.send(true).unwrap();

    assert!(slow.await.unwrap().is_ok());
    let fast = fast.await.unwrap().unwrap();
    assert_eq!(
        fast.plan,
        SyncPlan::Incremental {
            base_event: base.event.id,
            base_commit: "base".into()
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lineages_progress_in_parallel() {
    init_logging();
    let (coordinator, _, _gate) = gated(true);

    let mut handles = Vec::new();
    for branch in ["main", "dev", "release"] {
        for secs in 1..=5 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator
                    .handle_push(push_to(branch, &format!("{branch}-{secs}"), secs))
                    .await
            }));
        }
    }
    for outcome in futures::future::join_all(handles).await {
        let outcome = outcome.unwrap().unwrap();
        if let SyncPlan::Incremental { base_commit, .. } = &outcome.plan {
            let branch = &outcome.event.lineage.branch;
            assert!(base_commit.starts_with(branch.as_str()), "{base_commit} in {branch}");
        }
    }

    for branch in ["main", "dev", "release"] {
        let lineage = LineageKey::new("github", "acme", "widgets", branch);
        let latest = coordinator.latest_ready(&lineage).await.unwrap().unwrap();
        assert_eq!(latest.commit, format!("{branch}-5"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_push_leaves_event_failed() {
    init_logging();
    let (coordinator, repo, _gate) = gated(false);
    let lineage = main_lineage();

    let handle = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_push(push_to("main", "abandoned", 1)).await }
    });
    wait_for_statuses(&repo, &lineage, PullEventStatus::Running, 1).await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    wait_for_statuses(&repo, &lineage, PullEventStatus::Failed, 1).await;
    let history = repo.list_lineage(&lineage, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PullEventStatus::Failed);
}

/// Ledger whose inserts take a while to land.
struct SlowAppend {
    inner: Arc<InMemoryPullEventRepository>,
    delay: Duration,
}

impl PullEventRepository for SlowAppend {
    fn append(&self, event: &NewPullEvent) -> Result<PullEvent, PullEventError> {
        std::thread::sleep(self.delay);
        self.inner.append(event)
    }

    fn set_status(
        &self,
        id: PullEventId,
        status: PullEventStatus,
    ) -> Result<PullEvent, PullEventError> {
        self.inner.set_status(id, status)
    }

    fn most_recent_ready(
        &self,
        lineage: Option<&LineageKey>,
    ) -> Result<Option<PullEvent>, PullEventError> {
        self.inner.most_recent_ready(lineage)
    }

    fn find_before(
        &self,
        lineage: &LineageKey,
        before: DateTime<Utc>,
        skip: usize,
    ) -> Result<Option<PullEvent>, PullEventError> {
        self.inner.find_before(lineage, before, skip)
    }

    fn get(&self, id: PullEventId) -> Result<Option<PullEvent>, PullEventError> {
        self.inner.get(id)
    }

    fn list_lineage(
        &self,
        lineage: &LineageKey,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        self.inner.list_lineage(lineage, limit)
    }

    fn list_stale_running(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        self.inner.list_stale_running(updated_before, limit)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_cancelled_during_insert_still_fails_event() {
    init_logging();
    let inner = Arc::new(InMemoryPullEventRepository::new());
    let (_gate, rx) = watch::channel(true);
    let coordinator = Arc::new(PullEventCoordinator::new(
        Arc::new(SlowAppend {
            inner: Arc::clone(&inner),
            delay: Duration::from_millis(200),
        }),
        GatedProcessor { gate: rx },
        ResolverConfig::default(),
        CoordinatorConfig::default(),
    ));
    let lineage = main_lineage();

    let handle = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_push(push_to("main", "mid-insert", 1)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(inner.list_lineage(&lineage, 10).unwrap().is_empty());
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    wait_for_statuses(&inner, &lineage, PullEventStatus::Failed, 1).await;
    let history = inner.list_lineage(&lineage, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PullEventStatus::Failed);
}
