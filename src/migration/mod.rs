//! Shard migration between storage nodes.
//!
//! A destination node pulls fine tokens from a source node in two rounds,
//! or in one round during resync.
//!
//! ```text
//!   destination                                   source
//!   ───────────                                   ──────
//!   MigrationCoordinator                          MigrationCoordinator
//!     └─ MigrationExecutor (shard, source)          └─ MigrationClient (executor id)
//!
//!   snapshot shard
//!   filter set per token   ───────────────────▶   accept / decline / not ready
//!                          ◀───────────────────   round 1 delta sets (full objects)
//!   second rebalance       ───────────────────▶   snapshot again, diff
//!                          ◀───────────────────   round 2 delta sets (diffs)
//!                          ◀ ─ ─ ─ ─ ─ ─ ─ ─ ─    live requests mirrored
//!   tokens Ready                                   (until the table closes)
//!
//!   executor fails round   ◀───────────────────   migration abort (client failed)
//! ```
//!
//! Live writes for tokens in flight are mirrored from the source to the
//! destination between the round 1 snapshot and the ownership table close,
//! so nothing written after the snapshot is lost.

pub mod client;
pub mod coordinator;
pub mod executor;
pub mod io_tracker;
pub mod messages;
pub mod policy;
pub mod store;
pub mod transport;

pub use client::{ClientFailureSink, ClientState, MigrationClient};
pub use coordinator::{
    FineTokenState, MigrationCallback, MigrationCoordinator, MigrationKind, MigrationPlan,
    MigrationState,
};
pub use executor::{ExecutorState, MigrationExecutor, MigrationRound, RoundOutcome, RoundReport};
pub use io_tracker::{IoGuard, IoTracker};
pub use messages::{
    DeltaObject, DeltaPayload, ForwardedRequest, IoRequest, MetadataSnapshot, ObjectMetadata,
    PeerMessage, RebalanceDeltaSet, RebalanceFilterSet, SecondRebalanceRequest, SourceResponse,
};
pub use policy::{AbortOnError, ErrorPolicy, FailureAction, SkipFailedTokens};
pub use store::{InMemoryObjectStore, ObjectStore};
pub use transport::{LocalNetwork, LocalTransport, RebalanceTransport};
