//! Placement record: where this node's shards live and which it owns.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    PlacementManager                       │
//! │   RwLock<record + disk map>                               │
//! │                                                           │
//! │   ┌──────────────┐ ┌──────────────────┐ ┌──────────────┐  │
//! │   │ OLT          │ │ TokenStateTable  │ │ version,     │  │
//! │   │ shard -> disk│ │ valid/compaction │ │ resync flag  │  │
//! │   └──────────────┘ └──────────────────┘ └──────────────┘  │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ seal + write (tmp, fsync, rename)
//!      ┌──────────┼──────────┬──────────┐
//!      ▼          ▼          ▼          ▼
//!   disk 1     disk 2     disk 3     disk N     one copy per disk
//! ```
//!
//! Copies are reconciled by majority on load. A record that fails its
//! checksum or header check is treated as corrupt, never migrated.

pub mod format;
pub mod manager;
pub mod olt;
pub mod record_file;
pub mod token_table;

pub use format::{PlacementRecord, RecordHeader};
pub use manager::{DiskChange, DiskChangeHandler, LoadOutcome, OwnershipUpdate, PlacementManager};
pub use olt::{ObjectLocationTable, ShardMove, INVALID_DISK_ID};
pub use token_table::{TokenCheck, TokenDescriptor, TokenStateTable};
