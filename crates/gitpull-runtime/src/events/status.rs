//! Pull event status lifecycle.
//!
//! ```text
//! Pending ──> Running ──> Ready
//!    │           │
//!    └───────────┴──────> Failed
//! ```
//!
//! `Ready` and `Failed` are terminal. Every status write in the ledger goes
//! through [validate_transition] before the compare-and-set is attempted.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::PullEventError;

use super::models::PullEventId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PullEventStatus {
    Pending,
    Running,
    Ready,
    Failed,
}

impl PullEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullEventStatus::Pending => "pending",
            PullEventStatus::Running => "running",
            PullEventStatus::Ready => "ready",
            PullEventStatus::Failed => "failed",
        }
    }

    /// Parses the persisted form. Unknown values are `None`; backends surface
    /// them as persistence errors rather than guessing.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PullEventStatus::Pending),
            "running" => Some(PullEventStatus::Running),
            "ready" => Some(PullEventStatus::Ready),
            "failed" => Some(PullEventStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PullEventStatus::Ready | PullEventStatus::Failed)
    }

    pub fn can_transition_to(&self, to: PullEventStatus) -> bool {
        matches!(
            (self, to),
            (PullEventStatus::Pending, PullEventStatus::Running)
                | (PullEventStatus::Running, PullEventStatus::Ready)
                | (PullEventStatus::Running, PullEventStatus::Failed)
                | (PullEventStatus::Pending, PullEventStatus::Failed)
        )
    }
}

impl fmt::Display for PullEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks `from -> to` against the transition table.
pub fn validate_transition(
    id: PullEventId,
    from: PullEventStatus,
    to: PullEventStatus,
) -> Result<(), PullEventError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(PullEventError::InvalidTransition { id, from, to })
    }
}
