//! Pull event records and the validated inputs that create them.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::PullEventError;

use super::status::PullEventStatus;

/// Store-assigned event identifier.
pub type PullEventId = i64;

/// Identifies one independent synchronization stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct LineageKey {
    pub provider: String,
    pub repository_owner: String,
    pub repository_name: String,
    pub branch: String,
}

impl LineageKey {
    pub fn new(
        provider: impl Into<String>,
        repository_owner: impl Into<String>,
        repository_name: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            repository_owner: repository_owner.into(),
            repository_name: repository_name.into(),
            branch: branch.into(),
        }
    }

    fn validate(&self) -> Result<(), PullEventError> {
        check_field("provider", &self.provider)?;
        check_field("repository_owner", &self.repository_owner)?;
        check_field("repository_name", &self.repository_name)?;
        check_field("branch", &self.branch)
    }
}

impl fmt::Display for LineageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}@{}",
            self.provider, self.repository_owner, self.repository_name, self.branch
        )
    }
}

/// One stored attempt to synchronize a commit of a lineage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PullEvent {
    pub id: PullEventId,
    pub lineage: LineageKey,
    pub commit: String,
    pub status: PullEventStatus,
    /// Upstream push time; the only ordering key for predecessor lookups.
    pub pushed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Moves on every status write. Drives stale `Running` detection.
    pub updated_at: DateTime<Utc>,
}

impl PullEvent {
    pub fn is_ready(&self) -> bool {
        self.status == PullEventStatus::Ready
    }
}

/// Raw push notification as delivered by the upstream notifier.
///
/// Nothing here is trusted; convert with [NewPullEvent::try_from] before it
/// reaches the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PushNotification {
    pub provider: String,
    pub repository_owner: String,
    pub repository_name: String,
    pub branch: String,
    pub commit: String,
    pub pushed_at: DateTime<Utc>,
}

/// Validated creation input for [super::PullEventRepository::append].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPullEvent {
    lineage: LineageKey,
    commit: String,
    pushed_at: DateTime<Utc>,
}

impl NewPullEvent {
    pub fn new(
        lineage: LineageKey,
        commit: impl Into<String>,
        pushed_at: DateTime<Utc>,
    ) -> Result<Self, PullEventError> {
        let commit = commit.into();
        lineage.validate()?;
        check_field("commit", &commit)?;
        if commit.chars().any(char::is_whitespace) {
            return Err(PullEventError::InvalidEvent(
                "commit must not contain whitespace".to_string(),
            ));
        }
        Ok(Self {
            lineage,
            commit,
            pushed_at,
        })
    }

    pub fn lineage(&self) -> &LineageKey {
        &self.lineage
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn pushed_at(&self) -> DateTime<Utc> {
        self.pushed_at
    }
}

impl TryFrom<PushNotification> for NewPullEvent {
    type Error = PullEventError;

    fn try_from(push: PushNotification) -> Result<Self, Self::Error> {
        let lineage = LineageKey::new(
            push.provider,
            push.repository_owner,
            push.repository_name,
            push.branch,
        );
        NewPullEvent::new(lineage, push.commit, push.pushed_at)
    }
}

fn check_field(name: &str, value: &str) -> Result<(), PullEventError> {
    if value.trim().is_empty() {
        return Err(PullEventError::InvalidEvent(format!("{name} must not be empty")));
    }
    if value.trim() != value {
        return Err(PullEventError::InvalidEvent(format!(
            "{name} must not have surrounding whitespace"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(PullEventError::InvalidEvent(format!(
            "{name} must not contain control characters"
        )));
    }
    Ok(())
}

/// JSON Schemas of the records handed to presentation layers, keyed by type
/// name.
pub fn record_schemas() -> serde_json::Value {
    serde_json::json!({
        "PullEvent": schemars::schema_for!(PullEvent),
        "PushNotification": schemars::schema_for!(PushNotification),
    })
}
