//! Pull event ledger, status lifecycle, lineage resolution and coordination.
//!
//! The ledger ([PullEventRepository]) is the source of truth. The resolver and
//! the sweeper only read it and write through its compare-and-set; the
//! coordinator is the only component that creates events.

pub mod coordinator;
pub mod in_memory;
pub mod models;
pub mod postgres_repository;
pub mod repository;
pub mod resolver;
pub mod sqlite_repository;
pub mod status;
pub mod sweeper;

pub use coordinator::{
    CoordinatorConfig, GitProcessor, ProcessingError, PullEventCoordinator, PullOutcome,
};
pub use in_memory::InMemoryPullEventRepository;
pub use models::{
    record_schemas, LineageKey, NewPullEvent, PullEvent, PullEventId, PushNotification,
};
#[cfg(feature = "postgres")]
pub use postgres_repository::PostgresPullEventRepository;
pub use repository::PullEventRepository;
pub use resolver::{LineageResolver, Resolution, ResolverConfig, SyncPlan};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_repository::SqlitePullEventRepository;
pub use status::{validate_transition, PullEventStatus};
pub use sweeper::{RepositoryStaleSweeper, StaleEventSweeper, SweepConfig, SweepTickResult};
