//! Error type shared by the ledger, the resolver and the coordinator.

use thiserror::Error;

use crate::events::{LineageKey, PullEventId, PullEventStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PullEventError {
    /// Store unreachable or write rejected. Never retried inside the core.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("pull event not found: {0}")]
    NotFound(PullEventId),

    /// The state machine rejected the change, or a concurrent writer moved the
    /// record before our compare-and-set landed.
    #[error("invalid status transition for pull event {id}: {from} -> {to}")]
    InvalidTransition {
        id: PullEventId,
        from: PullEventStatus,
        to: PullEventStatus,
    },

    /// The predecessor walk hit its cap. Callers fall back to a full clone.
    #[error("predecessor resolution exhausted for {lineage} after {attempts} candidates")]
    ResolutionExhausted { lineage: LineageKey, attempts: usize },

    #[error("invalid pull event: {0}")]
    InvalidEvent(String),

    #[error("processing failed for pull event {id}: {message}")]
    Processing { id: PullEventId, message: String },

    #[error("processing timed out for pull event {id}")]
    ProcessingTimeout { id: PullEventId },

    #[error("config error: {0}")]
    Config(String),
}

impl PullEventError {
    /// Whether this error still leaves a usable sync plan (full clone).
    pub fn is_fallback(&self) -> bool {
        matches!(self, PullEventError::ResolutionExhausted { .. })
    }
}

/// Maps a backend driver error into [PullEventError::Persistence].
pub(crate) fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> PullEventError {
    PullEventError::Persistence(format!("{prefix}: {e}"))
}
