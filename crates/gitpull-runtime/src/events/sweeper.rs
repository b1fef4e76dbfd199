//! Reclaims `Running` events that stopped making progress.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PullEventError;

use super::repository::PullEventRepository;
use super::status::PullEventStatus;

/// Sweep tuning knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// A `Running` event untouched for longer than this is considered stuck.
    pub stale_after_secs: u64,
    /// Maximum events failed per tick.
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30 * 60,
            batch_size: 100,
        }
    }
}

impl SweepConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::seconds(i64::try_from(self.stale_after_secs).unwrap_or(i64::MAX / 1_000))
    }
}

/// Result of a periodic sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepTickResult {
    pub inspected: u64,
    pub failed: u64,
}

pub trait StaleEventSweeper: Send + Sync {
    fn tick(&self, now: DateTime<Utc>) -> Result<SweepTickResult, PullEventError>;
}

pub struct RepositoryStaleSweeper<R: PullEventRepository> {
    repository: R,
    config: SweepConfig,
}

impl<R: PullEventRepository> RepositoryStaleSweeper<R> {
    pub fn new(repository: R, config: SweepConfig) -> Self {
        Self { repository, config }
    }
}

impl<R: PullEventRepository> StaleEventSweeper for RepositoryStaleSweeper<R> {
    fn tick(&self, now: DateTime<Utc>) -> Result<SweepTickResult, PullEventError> {
        let cutoff = now - self.config.stale_after();
        let stale = self
            .repository
            .list_stale_running(cutoff, self.config.batch_size)?;

        let mut result = SweepTickResult {
            inspected: stale.len() as u64,
            failed: 0,
        };
        for event in stale {
            match self.repository.set_status(event.id, PullEventStatus::Failed) {
                Ok(_) => {
                    log::warn!(
                        "pull event {} for {} stuck running since {}; marked failed",
                        event.id,
                        event.lineage,
                        event.updated_at
                    );
                    result.failed += 1;
                }
                // Settled by its coordinator between the listing and now.
                Err(PullEventError::InvalidTransition { .. }) => {
                    log::debug!("pull event {} settled before sweep", event.id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(result)
    }
}
