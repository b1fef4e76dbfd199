//! Pull-event ledger and lineage resolution for incremental git synchronization.
//!
//! Every push that reaches the system becomes a [PullEvent](events::PullEvent) in a
//! ledger scoped by lineage (provider, owner, repository, branch). Before the
//! commit is fetched, the [LineageResolver](events::LineageResolver) walks the
//! lineage history backwards to find the most recent `Ready` event to diff
//! against; when there is none the plan falls back to a full clone.
//!
//! The [PullEventCoordinator](events::PullEventCoordinator) ties the pieces
//! together and is the single entry point for inbound push notifications.

pub mod config;
pub mod error;
pub mod events;

pub use config::{DatabaseConfig, PullEventsConfig};
pub use error::PullEventError;
pub use events::{
    CoordinatorConfig, GitProcessor, InMemoryPullEventRepository, LineageKey, LineageResolver,
    NewPullEvent, ProcessingError, PullEvent, PullEventCoordinator, PullEventId,
    PullEventRepository, PullEventStatus, PullOutcome, PushNotification, RepositoryStaleSweeper,
    Resolution, ResolverConfig, StaleEventSweeper, SweepConfig, SweepTickResult, SyncPlan,
};
