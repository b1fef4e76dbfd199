//! Storage façade for the pull event ledger.

use chrono::{DateTime, Utc};

use crate::error::PullEventError;

use super::models::{LineageKey, NewPullEvent, PullEvent, PullEventId};
use super::status::PullEventStatus;

/// Ledger contract used by the resolver, the coordinator and the sweeper.
///
/// Implementations are synchronous; async callers go through
/// `tokio::task::spawn_blocking`. Records are never deleted.
pub trait PullEventRepository: Send + Sync {
    /// Insert a new event in `Pending` and return the stored record.
    fn append(&self, event: &NewPullEvent) -> Result<PullEvent, PullEventError>;

    /// Move an event to `status`.
    ///
    /// The transition is checked against the current stored status and written
    /// with a compare-and-set on that status, so of two racing writers at most
    /// one succeeds; the loser gets `InvalidTransition`.
    fn set_status(
        &self,
        id: PullEventId,
        status: PullEventStatus,
    ) -> Result<PullEvent, PullEventError>;

    /// Most recently pushed `Ready` event, within `lineage` when given,
    /// across the whole ledger otherwise.
    fn most_recent_ready(
        &self,
        lineage: Option<&LineageKey>,
    ) -> Result<Option<PullEvent>, PullEventError>;

    /// The `skip`-th newest event of `lineage` pushed strictly before `before`.
    ///
    /// Ordering is `pushed_at` desc, then `id` desc.
    fn find_before(
        &self,
        lineage: &LineageKey,
        before: DateTime<Utc>,
        skip: usize,
    ) -> Result<Option<PullEvent>, PullEventError>;

    fn get(&self, id: PullEventId) -> Result<Option<PullEvent>, PullEventError>;

    /// Newest-first history of a lineage.
    fn list_lineage(
        &self,
        lineage: &LineageKey,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError>;

    /// `Running` events whose last status write is older than `updated_before`.
    fn list_stale_running(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError>;
}

macro_rules! forward_repository {
    ($($wrapper:ty),+) => {$(
        impl<R: PullEventRepository + ?Sized> PullEventRepository for $wrapper {
            fn append(&self, event: &NewPullEvent) -> Result<PullEvent, PullEventError> {
                (**self).append(event)
            }

            fn set_status(
                &self,
                id: PullEventId,
                status: PullEventStatus,
            ) -> Result<PullEvent, PullEventError> {
                (**self).set_status(id, status)
            }

            fn most_recent_ready(
                &self,
                lineage: Option<&LineageKey>,
            ) -> Result<Option<PullEvent>, PullEventError> {
                (**self).most_recent_ready(lineage)
            }

            fn find_before(
                &self,
                lineage: &LineageKey,
                before: DateTime<Utc>,
                skip: usize,
            ) -> Result<Option<PullEvent>, PullEventError> {
                (**self).find_before(lineage, before, skip)
            }

            fn get(&self, id: PullEventId) -> Result<Option<PullEvent>, PullEventError> {
                (**self).get(id)
            }

            fn list_lineage(
                &self,
                lineage: &LineageKey,
                limit: usize,
            ) -> Result<Vec<PullEvent>, PullEventError> {
                (**self).list_lineage(lineage, limit)
            }

            fn list_stale_running(
                &self,
                updated_before: DateTime<Utc>,
                limit: usize,
            ) -> Result<Vec<PullEvent>, PullEventError> {
                (**self).list_stale_running(updated_before, limit)
            }
        }
    )+};
}

forward_repository!(&R, std::sync::Arc<R>, Box<R>);

/// Column-level image of a stored event shared by the SQL backends.
#[cfg(any(feature = "sqlite-persistence", feature = "postgres"))]
pub(crate) struct PullEventRow {
    pub id: i64,
    pub provider: String,
    pub repository_owner: String,
    pub repository_name: String,
    pub branch: String,
    pub commit: String,
    pub status: String,
    pub pushed_at_ms: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[cfg(any(feature = "sqlite-persistence", feature = "postgres"))]
impl PullEventRow {
    /// Column list matching the field order above.
    pub const COLUMNS: &'static str = "id, provider, repository_owner, repository_name, branch, \
         commit_sha, status, pushed_at_ms, created_at_ms, updated_at_ms";

    pub fn into_event(self) -> Result<PullEvent, PullEventError> {
        let status = PullEventStatus::parse(&self.status).ok_or_else(|| {
            PullEventError::Persistence(format!(
                "unknown status {:?} stored for pull event {}",
                self.status, self.id
            ))
        })?;
        Ok(PullEvent {
            id: self.id,
            lineage: LineageKey {
                provider: self.provider,
                repository_owner: self.repository_owner,
                repository_name: self.repository_name,
                branch: self.branch,
            },
            commit: self.commit,
            status,
            pushed_at: ms_to_dt(self.pushed_at_ms)?,
            created_at: ms_to_dt(self.created_at_ms)?,
            updated_at: ms_to_dt(self.updated_at_ms)?,
        })
    }
}

#[cfg(any(feature = "sqlite-persistence", feature = "postgres"))]
pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[cfg(any(feature = "sqlite-persistence", feature = "postgres"))]
pub(crate) fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, PullEventError> {
    use chrono::TimeZone;

    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| PullEventError::Persistence(format!("timestamp out of range: {ms}")))
}

/// Backend-independent checks every repository implementation must pass.
#[cfg(test)]
pub(crate) mod contract {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    pub(crate) fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().expect("valid millis")
    }

    pub(crate) fn lineage(branch: &str) -> LineageKey {
        LineageKey::new("github", "acme", "widgets", branch)
    }

    pub(crate) fn new_event(lineage: &LineageKey, commit: &str, ms: i64) -> NewPullEvent {
        NewPullEvent::new(lineage.clone(), commit, at(ms)).expect("valid event")
    }

    fn ready<R: PullEventRepository>(
        repo: &R,
        lineage: &LineageKey,
        commit: &str,
        ms: i64,
    ) -> PullEvent {
        let event = repo.append(&new_event(lineage, commit, ms)).expect("append");
        repo.set_status(event.id, PullEventStatus::Running)
            .expect("to running");
        repo.set_status(event.id, PullEventStatus::Ready)
            .expect("to ready")
    }

    pub(crate) fn assert_ledger_contract<R: PullEventRepository>(repo: &R) {
        let main = lineage("main");
        let dev = lineage("dev");

        let first = repo.append(&new_event(&main, "c1", 10)).expect("append c1");
        assert_eq!(first.status, PullEventStatus::Pending);
        assert_eq!(first.commit, "c1");
        assert_eq!(first.lineage, main);
        assert_eq!(first.pushed_at, at(10));
        assert_eq!(repo.get(first.id).expect("get"), Some(first.clone()));

        // Ready -> Pending and Pending -> Ready are both outside the table.
        let skipped = repo.set_status(first.id, PullEventStatus::Ready);
        assert!(matches!(
            skipped,
            Err(PullEventError::InvalidTransition {
                from: PullEventStatus::Pending,
                to: PullEventStatus::Ready,
                ..
            })
        ));
        let running = repo
            .set_status(first.id, PullEventStatus::Running)
            .expect("to running");
        assert_eq!(running.status, PullEventStatus::Running);
        assert!(running.updated_at >= first.updated_at);
        let done = repo
            .set_status(first.id, PullEventStatus::Ready)
            .expect("to ready");
        assert_eq!(done.status, PullEventStatus::Ready);
        assert!(matches!(
            repo.set_status(first.id, PullEventStatus::Pending),
            Err(PullEventError::InvalidTransition { .. })
        ));

        assert!(matches!(
            repo.set_status(9_999_999, PullEventStatus::Running),
            Err(PullEventError::NotFound(9_999_999))
        ));
        assert_eq!(repo.get(9_999_999).expect("get missing"), None);

        let second = ready(repo, &main, "c2", 20);
        let failed = repo.append(&new_event(&main, "c3", 30)).expect("append c3");
        repo.set_status(failed.id, PullEventStatus::Failed)
            .expect("pending to failed");
        let other = ready(repo, &dev, "d1", 40);

        // Strictly before, newest first, skip walks backwards.
        let newest = repo.find_before(&main, at(100), 0).expect("find");
        assert_eq!(newest.map(|e| e.commit), Some("c3".to_string()));
        let next = repo.find_before(&main, at(100), 1).expect("find");
        assert_eq!(next.map(|e| e.id), Some(second.id));
        let last = repo.find_before(&main, at(100), 2).expect("find");
        assert_eq!(last.map(|e| e.id), Some(first.id));
        assert_eq!(repo.find_before(&main, at(100), 3).expect("find"), None);
        assert_eq!(
            repo.find_before(&main, at(20), 0).expect("find").map(|e| e.id),
            Some(first.id)
        );
        assert_eq!(repo.find_before(&main, at(10), 0).expect("find"), None);

        let scoped = repo.most_recent_ready(Some(&main)).expect("scoped ready");
        assert_eq!(scoped.map(|e| e.id), Some(second.id));
        let global = repo.most_recent_ready(None).expect("global ready");
        assert_eq!(global.map(|e| e.id), Some(other.id));
        assert_eq!(
            repo.most_recent_ready(Some(&lineage("nope")))
                .expect("missing lineage"),
            None
        );

        let history = repo.list_lineage(&main, 10).expect("history");
        let commits: Vec<_> = history.iter().map(|e| e.commit.as_str()).collect();
        assert_eq!(commits, vec!["c3", "c2", "c1"]);
        assert_eq!(repo.list_lineage(&main, 2).expect("history").len(), 2);

        // Equal pushed_at: the later insert sorts first.
        let tie_a = repo.append(&new_event(&dev, "t1", 50)).expect("tie a");
        let tie_b = repo.append(&new_event(&dev, "t2", 50)).expect("tie b");
        assert_eq!(
            repo.find_before(&dev, at(60), 0).expect("tie").map(|e| e.id),
            Some(tie_b.id)
        );
        assert_eq!(
            repo.find_before(&dev, at(60), 1).expect("tie").map(|e| e.id),
            Some(tie_a.id)
        );

        let stuck = repo.append(&new_event(&dev, "s1", 70)).expect("stuck");
        repo.set_status(stuck.id, PullEventStatus::Running)
            .expect("stuck running");
        let stale = repo
            .list_stale_running(Utc::now() + Duration::hours(1), 10)
            .expect("stale");
        assert_eq!(stale.iter().map(|e| e.id).collect::<Vec<_>>(), vec![stuck.id]);
        assert!(repo
            .list_stale_running(Utc::now() - Duration::hours(1), 10)
            .expect("fresh")
            .is_empty());
    }
}
