//! Predecessor resolution for incremental pulls.
//!
//! `pushed_at` is not a reliable total order under concurrent pushes, so the
//! resolver never trusts the single prior row: it walks the lineage backwards
//! from the new event's push time, skipping anything that is not `Ready`,
//! until it finds a usable diff base, runs out of history, or hits the cap.
//! The answer is recomputed every time; no predecessor pointer is stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PullEventError;

use super::models::{LineageKey, PullEvent, PullEventId};
use super::repository::PullEventRepository;

/// Resolver tuning knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Upper bound on candidate predecessors inspected per resolution.
    pub max_attempts: usize,
    /// Restrict the bootstrap "any ready event" check to the lineage being
    /// resolved. When false the check spans the whole ledger.
    pub scope_bootstrap_to_lineage: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            scope_bootstrap_to_lineage: true,
        }
    }
}

/// Outcome of a completed walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// A `Ready` event to diff against.
    Predecessor { id: PullEventId, commit: String },
    /// History is exhausted without a `Ready` event. Full clone.
    NoPredecessor,
}

/// How the git-processing collaborator should fetch the commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncPlan {
    FullClone,
    Incremental {
        base_event: PullEventId,
        base_commit: String,
    },
}

impl SyncPlan {
    /// Maps a resolver result onto a plan. An exhausted walk is a safe
    /// fallback, not a failure; every other error is passed through.
    pub fn from_resolution(
        resolution: Result<Resolution, PullEventError>,
    ) -> Result<SyncPlan, PullEventError> {
        match resolution {
            Ok(Resolution::Predecessor { id, commit }) => Ok(SyncPlan::Incremental {
                base_event: id,
                base_commit: commit,
            }),
            Ok(Resolution::NoPredecessor) => Ok(SyncPlan::FullClone),
            Err(err) if err.is_fallback() => Ok(SyncPlan::FullClone),
            Err(err) => Err(err),
        }
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self, SyncPlan::Incremental { .. })
    }
}

pub struct LineageResolver<R: PullEventRepository> {
    repository: R,
    config: ResolverConfig,
}

impl<R: PullEventRepository> LineageResolver<R> {
    /// A `max_attempts` of zero is raised to one so an empty lineage still
    /// resolves to [Resolution::NoPredecessor].
    pub fn new(repository: R, mut config: ResolverConfig) -> Self {
        if config.max_attempts == 0 {
            log::warn!("resolver max_attempts is 0; using 1");
            config.max_attempts = 1;
        }
        Self { repository, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Finds the newest `Ready` event of `lineage` pushed strictly before
    /// `pushed_at`.
    ///
    /// Inspects at most `max_attempts` candidates and returns
    /// [PullEventError::ResolutionExhausted] past that.
    pub fn resolve(
        &self,
        lineage: &LineageKey,
        pushed_at: DateTime<Utc>,
    ) -> Result<Resolution, PullEventError> {
        for skip in 0..self.config.max_attempts {
            let Some(candidate) = self.repository.find_before(lineage, pushed_at, skip)? else {
                log::debug!("no predecessor for {lineage} before {pushed_at}");
                return Ok(Resolution::NoPredecessor);
            };
            if candidate.is_ready() {
                log::debug!(
                    "resolved predecessor {} ({}) for {lineage}",
                    candidate.id,
                    candidate.commit
                );
                return Ok(Resolution::Predecessor {
                    id: candidate.id,
                    commit: candidate.commit,
                });
            }
            log::debug!(
                "skipping {} candidate {} ({}) for {lineage}",
                candidate.status,
                candidate.id,
                candidate.commit
            );
        }

        log::warn!(
            "predecessor walk for {lineage} exhausted after {} candidates",
            self.config.max_attempts
        );
        Err(PullEventError::ResolutionExhausted {
            lineage: lineage.clone(),
            attempts: self.config.max_attempts,
        })
    }

    /// Resolves straight to a [SyncPlan].
    pub fn plan(
        &self,
        lineage: &LineageKey,
        pushed_at: DateTime<Utc>,
    ) -> Result<SyncPlan, PullEventError> {
        SyncPlan::from_resolution(self.resolve(lineage, pushed_at))
    }

    /// Whether any `Ready` event exists. Used to detect the very first sync.
    pub fn has_ready_event(&self, lineage: &LineageKey) -> Result<bool, PullEventError> {
        Ok(self.latest_ready(lineage)?.is_some())
    }

    /// The bootstrap lookup, scoped per [ResolverConfig::scope_bootstrap_to_lineage].
    pub fn latest_ready(&self, lineage: &LineageKey) -> Result<Option<PullEvent>, PullEventError> {
        let scope = self.config.scope_bootstrap_to_lineage.then_some(lineage);
        self.repository.most_recent_ready(scope)
    }
}
