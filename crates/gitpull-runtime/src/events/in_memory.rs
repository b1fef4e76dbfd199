//! In-memory pull event ledger. Used by tests and single-process deployments.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::PullEventError;

use super::models::{LineageKey, NewPullEvent, PullEvent, PullEventId};
use super::repository::PullEventRepository;
use super::status::{validate_transition, PullEventStatus};

#[derive(Default)]
struct Ledger {
    next_id: PullEventId,
    events: Vec<PullEvent>,
}

impl Ledger {
    /// Newest first: `pushed_at` desc, then `id` desc.
    fn sorted(&self, keep: impl Fn(&PullEvent) -> bool) -> Vec<&PullEvent> {
        let mut matches: Vec<&PullEvent> = self.events.iter().filter(|e| keep(e)).collect();
        matches.sort_by(|a, b| b.pushed_at.cmp(&a.pushed_at).then(b.id.cmp(&a.id)));
        matches
    }
}

#[derive(Default)]
pub struct InMemoryPullEventRepository {
    inner: Mutex<Ledger>,
}

impl InMemoryPullEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Ledger>, PullEventError> {
        self.inner
            .lock()
            .map_err(|e| PullEventError::Persistence(format!("ledger lock poisoned: {e}")))
    }
}

impl PullEventRepository for InMemoryPullEventRepository {
    fn append(&self, event: &NewPullEvent) -> Result<PullEvent, PullEventError> {
        let mut ledger = self.lock()?;
        ledger.next_id += 1;
        let now = Utc::now();
        let stored = PullEvent {
            id: ledger.next_id,
            lineage: event.lineage().clone(),
            commit: event.commit().to_string(),
            status: PullEventStatus::Pending,
            pushed_at: event.pushed_at(),
            created_at: now,
            updated_at: now,
        };
        ledger.events.push(stored.clone());
        Ok(stored)
    }

    fn set_status(
        &self,
        id: PullEventId,
        status: PullEventStatus,
    ) -> Result<PullEvent, PullEventError> {
        // Read, validate and write under one lock: the compare-and-set.
        let mut ledger = self.lock()?;
        let event = ledger
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(PullEventError::NotFound(id))?;
        validate_transition(id, event.status, status)?;
        event.status = status;
        event.updated_at = Utc::now();
        Ok(event.clone())
    }

    fn most_recent_ready(
        &self,
        lineage: Option<&LineageKey>,
    ) -> Result<Option<PullEvent>, PullEventError> {
        let ledger = self.lock()?;
        Ok(ledger
            .sorted(|e| e.is_ready() && lineage.map_or(true, |l| &e.lineage == l))
            .first()
            .map(|e| (*e).clone()))
    }

    fn find_before(
        &self,
        lineage: &LineageKey,
        before: DateTime<Utc>,
        skip: usize,
    ) -> Result<Option<PullEvent>, PullEventError> {
        let ledger = self.lock()?;
        Ok(ledger
            .sorted(|e| &e.lineage == lineage && e.pushed_at < before)
            .get(skip)
            .map(|e| (*e).clone()))
    }

    fn get(&self, id: PullEventId) -> Result<Option<PullEvent>, PullEventError> {
        let ledger = self.lock()?;
        Ok(ledger.events.iter().find(|e| e.id == id).cloned())
    }

    fn list_lineage(
        &self,
        lineage: &LineageKey,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        let ledger = self.lock()?;
        Ok(ledger
            .sorted(|e| &e.lineage == lineage)
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    fn list_stale_running(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        let ledger = self.lock()?;
        Ok(ledger
            .events
            .iter()
            .filter(|e| e.status == PullEventStatus::Running && e.updated_at < updated_before)
            .take(limit)
            .cloned()
            .collect())
    }
}
