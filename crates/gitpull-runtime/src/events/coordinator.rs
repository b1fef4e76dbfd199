//! Pull event lifecycle: record, resolve, process, settle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{map_driver_err, PullEventError};

use super::models::{LineageKey, NewPullEvent, PullEvent, PullEventId, PushNotification};
use super::repository::PullEventRepository;
use super::resolver::{LineageResolver, ResolverConfig, SyncPlan};
use super::status::PullEventStatus;

/// Failure reported by the git-processing collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Performs the actual fetch for an event according to its plan.
#[async_trait]
pub trait GitProcessor: Send + Sync {
    async fn process(&self, event: &PullEvent, plan: &SyncPlan) -> Result<(), ProcessingError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Upper bound for one processing run. `None` leaves the bound to the
    /// collaborator.
    pub processing_timeout_secs: Option<u64>,
}

impl CoordinatorConfig {
    pub fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout_secs.map(Duration::from_secs)
    }
}

/// Final stored record of a successful push plus the plan it ran with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullOutcome {
    pub event: PullEvent,
    pub plan: SyncPlan,
}

/// Runs a ledger call on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, PullEventError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PullEventError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| map_driver_err("ledger task", e))?
}

/// Fails the event if `handle_push` is dropped before it settles.
struct SettleGuard<R: PullEventRepository + 'static> {
    repository: Arc<R>,
    id: PullEventId,
    armed: bool,
}

impl<R: PullEventRepository + 'static> SettleGuard<R> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<R: PullEventRepository + 'static> Drop for SettleGuard<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let repository = Arc::clone(&self.repository);
        let id = self.id;
        let fail = move || match repository.set_status(id, PullEventStatus::Failed) {
            Ok(_) => log::warn!("pull event {id} abandoned before settling; marked failed"),
            Err(err) => log::warn!("pull event {id} abandoned; could not mark failed: {err}"),
        };
        // The write is handed to the blocking pool and is lost if the runtime is
        // already shutting down. A `Running` event left behind that way is
        // reclaimed by `StaleEventSweeper`; a `Pending` one stays until an
        // operator fails it.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(fail);
            }
            Err(_) => fail(),
        }
    }
}

/// Entry point for inbound push notifications.
pub struct PullEventCoordinator<R, P>
where
    R: PullEventRepository + 'static,
    P: GitProcessor,
{
    repository: Arc<R>,
    resolver: Arc<LineageResolver<Arc<R>>>,
    processor: P,
    config: CoordinatorConfig,
}

impl<R, P> PullEventCoordinator<R, P>
where
    R: PullEventRepository + 'static,
    P: GitProcessor,
{
    pub fn new(
        repository: Arc<R>,
        processor: P,
        resolver_config: ResolverConfig,
        config: CoordinatorConfig,
    ) -> Self {
        let resolver = Arc::new(LineageResolver::new(Arc::clone(&repository), resolver_config));
        Self {
            repository,
            resolver,
            processor,
            config,
        }
    }

    async fn transition(
        &self,
        id: PullEventId,
        status: PullEventStatus,
    ) -> Result<PullEvent, PullEventError> {
        let repository = Arc::clone(&self.repository);
        let event = run_blocking(move || repository.set_status(id, status)).await?;
        log::info!("pull event {id} -> {status}");
        Ok(event)
    }

    /// Marks the guarded event `Failed` and returns `cause`.
    ///
    /// When the write itself fails the guard stays armed and retries on drop;
    /// the caller still gets `cause`.
    async fn settle_failed(
        &self,
        guard: &mut SettleGuard<R>,
        cause: PullEventError,
    ) -> PullEventError {
        match self.transition(guard.id, PullEventStatus::Failed).await {
            Ok(_) => guard.disarm(),
            Err(err) => log::warn!(
                "pull event {} could not be marked failed after {cause}: {err}",
                guard.id
            ),
        }
        cause
    }

    /// Records the push, picks a plan, runs the collaborator and settles the
    /// event as `Ready` or `Failed`.
    ///
    /// Processing is never retried here. A processing failure is returned after
    /// the event has been marked `Failed`.
    pub async fn handle_push(&self, push: PushNotification) -> Result<PullOutcome, PullEventError> {
        let new_event = NewPullEvent::try_from(push)?;
        // The guard is armed on the blocking pool right after the insert. If this
        // future is dropped while the insert runs, the task output is discarded
        // and the guard fails the event from there.
        let repository = Arc::clone(&self.repository);
        let (event, mut guard) = run_blocking(move || {
            let event = repository.append(&new_event)?;
            let guard = SettleGuard {
                repository,
                id: event.id,
                armed: true,
            };
            Ok((event, guard))
        })
        .await?;
        let id = event.id;
        log::info!(
            "pull event {id} recorded for {} at commit {} (pushed {})",
            event.lineage,
            event.commit,
            event.pushed_at
        );

        let resolver = Arc::clone(&self.resolver);
        let lineage = event.lineage.clone();
        let pushed_at = event.pushed_at;
        let plan = match run_blocking(move || resolver.plan(&lineage, pushed_at)).await {
            Ok(plan) => plan,
            Err(err) => {
                log::warn!("pull event {id} could not resolve a predecessor: {err}");
                return Err(self.settle_failed(&mut guard, err).await);
            }
        };
        match &plan {
            SyncPlan::FullClone => log::info!("pull event {id} will full clone"),
            SyncPlan::Incremental {
                base_event,
                base_commit,
            } => log::info!("pull event {id} will diff against {base_commit} (event {base_event})"),
        }

        let running = self.transition(id, PullEventStatus::Running).await?;
        let processing = self.processor.process(&running, &plan);
        let processed = match self.config.processing_timeout() {
            Some(limit) => match tokio::time::timeout(limit, processing).await {
                Ok(result) => result.map_err(|e| PullEventError::Processing {
                    id,
                    message: e.to_string(),
                }),
                Err(_) => Err(PullEventError::ProcessingTimeout { id }),
            },
            None => processing.await.map_err(|e| PullEventError::Processing {
                id,
                message: e.to_string(),
            }),
        };

        match processed {
            Ok(()) => {
                let ready = self.transition(id, PullEventStatus::Ready).await?;
                guard.disarm();
                Ok(PullOutcome { event: ready, plan })
            }
            Err(err) => {
                log::warn!("pull event {id} failed: {err}");
                Err(self.settle_failed(&mut guard, err).await)
            }
        }
    }

    pub async fn event(&self, id: PullEventId) -> Result<Option<PullEvent>, PullEventError> {
        let repository = Arc::clone(&self.repository);
        run_blocking(move || repository.get(id)).await
    }

    /// Newest-first history of a lineage, failures included.
    pub async fn history(
        &self,
        lineage: &LineageKey,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        let repository = Arc::clone(&self.repository);
        let lineage = lineage.clone();
        run_blocking(move || repository.list_lineage(&lineage, limit)).await
    }

    pub async fn latest_ready(
        &self,
        lineage: &LineageKey,
    ) -> Result<Option<PullEvent>, PullEventError> {
        let resolver = Arc::clone(&self.resolver);
        let lineage = lineage.clone();
        run_blocking(move || resolver.latest_ready(&lineage)).await
    }
}
