//! Shard placement and migration for a content-addressed object storage node.
//!
//! This crate provides two pieces of a storage node:
//! - **Placement record**: a checksummed on-disk record, replicated on every
//!   local disk, that maps shards to disks and tracks token state
//! - **Migration**: a two-round protocol that moves fine tokens between nodes
//!   when ownership changes, plus a one-round resync after a restart
//!
//! # Keyspace
//!
//! An object id hashes to a fine token (the top `token_bits` bits of its
//! prefix). The low 8 bits of the fine token select one of 256 shards.
//!
//! # Example
//!
//! ```rust,no_run
//! use sm_migration::{
//!     InMemoryObjectStore, LocalNetwork, MigrationConfig, MigrationCoordinator,
//!     MigrationKind, MigrationPlan,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = LocalNetwork::new();
//!     let node = 2 << 32;
//!     let coordinator = MigrationCoordinator::new(
//!         node,
//!         MigrationConfig::default(),
//!         Arc::new(InMemoryObjectStore::new()),
//!         network.transport(node),
//!     );
//!     network.register(&coordinator);
//!
//!     // Pull tokens 1..=4 from node 1 toward ownership version 2.
//!     let plan = MigrationPlan::new(2, 8).with_tokens(1 << 32, 1..=4);
//!     coordinator.start_migration(
//!         plan,
//!         MigrationKind::Rebalance,
//!         false,
//!         Box::new(|result| println!("migration finished: {:?}", result)),
//!     )?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Orchestrator / IO path               │
//! └─────────────────────────────────────────────┘
//!          │ ownership tables        │ live requests
//!          ▼                         ▼
//! ┌──────────────────┐     ┌──────────────────────┐
//! │ PlacementManager │     │ MigrationCoordinator │◀──▶ peers
//! │ record per disk  │     │ executors / clients  │
//! └──────────────────┘     └──────────────────────┘
//!                                    │
//!                                    ▼
//!                              ObjectStore
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod migration;
pub mod ownership;
pub mod placement;
pub mod types;

// Re-export main types for convenience
pub use config::{DiskConfig, MigrationConfig, NodeConfig, PlacementConfig};
pub use error::{
    CoordinationError, Error, FormatError, PlacementError, Result, StoreError, TransportError,
};
pub use types::{
    DataTier, DiskId, ExecutorId, FineToken, NodeId, ObjectId, OwnershipVersion, ShardId,
    VolumeId,
};

pub use ownership::OwnershipTable;

// Re-export placement types
pub use placement::{
    DiskChange, LoadOutcome, ObjectLocationTable, OwnershipUpdate, PlacementManager,
    PlacementRecord, TokenStateTable,
};

// Re-export migration types
pub use migration::{
    ErrorPolicy, FineTokenState, InMemoryObjectStore, LocalNetwork, MigrationCallback,
    MigrationCoordinator, MigrationKind, MigrationPlan, MigrationState, ObjectStore,
    RebalanceTransport,
};

// Re-export metrics types
pub use metrics::{
    Counter, Gauge, Histogram, HistogramSnapshot, LabeledCounter, MigrationMetrics,
    MigrationMetricsSnapshot, PlacementMetrics,
};
