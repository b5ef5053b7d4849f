//! Error types for placement and migration.

use crate::types::{DiskId, ExecutorId, NodeId, OwnershipVersion, ShardId};
use std::io;
use thiserror::Error;

pub use crate::placement::format::FormatError;

/// Result type alias for placement and migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Migration coordination errors. Returned synchronously, never fatal.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Placement record management errors.
    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    /// Placement record encoding errors.
    #[error("record format error: {0}")]
    Format(#[from] FormatError),

    /// Peer transport errors.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Object store errors.
    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the source node could not be reached,
    /// which resync routes through the source replacement hook.
    pub fn is_source_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::Transport(TransportError::SourceUnreachable(_))
                | Error::Transport(TransportError::Timeout)
        )
    }

    /// Copy of this error for handing to several waiters.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Coordination(e) => Error::Coordination(e.clone()),
            Error::Placement(e) => Error::Placement(e.clone()),
            Error::Transport(e) => Error::Transport(e.clone()),
            Error::Store(e) => Error::Store(e.clone()),
            Error::Config(s) => Error::Config(s.clone()),
            Error::Cancelled => Error::Cancelled,
            Error::Timeout => Error::Timeout,
            other => Error::Internal(other.to_string()),
        }
    }
}

/// Migration coordination errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// A migration toward a different target version is in flight.
    #[error("not ready: migration to version {in_flight} in progress, requested {requested}")]
    NotReady {
        in_flight: OwnershipVersion,
        requested: OwnershipVersion,
    },

    /// The ownership table version was already applied.
    #[error("duplicate ownership version {0}")]
    DuplicateVersion(OwnershipVersion),

    /// The migration was already aborted.
    #[error("migration already aborted")]
    AlreadyAborted,

    /// The migration was aborted with a reason.
    #[error("migration aborted: {0}")]
    Aborted(String),

    /// No active executor has this id.
    #[error("unknown executor {0:#x}")]
    UnknownExecutor(ExecutorId),

    /// A message for an existing client disagreed with its identity.
    #[error("executor {executor_id:#x} is bound to shard {expected}, message names shard {actual}")]
    ExecutorMismatch {
        executor_id: ExecutorId,
        expected: ShardId,
        actual: ShardId,
    },

    /// An executor or client is in a sticky error state.
    #[error("migration task {0:#x} is in error state")]
    TaskInError(ExecutorId),

    /// A delta set arrived out of protocol order.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Placement record management errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// Record file could not be read.
    #[error("failed to read placement record on disk {disk}: {reason}")]
    ReadFailed { disk: DiskId, reason: String },

    /// Record file could not be written.
    #[error("failed to write placement record on disk {disk}: {reason}")]
    WriteFailed { disk: DiskId, reason: String },

    /// Record file does not exist.
    #[error("placement record missing on disk {0}")]
    MissingFile(DiskId),

    /// Too few good copies to reconcile.
    #[error("cannot reconcile placement record: {good} good copies, {bad} bad")]
    CannotReconcile { good: usize, bad: usize },

    /// Persisted token state disagrees with the ownership table.
    #[error("placement record inconsistent: shard {shard} should be valid but is invalid")]
    Inconsistent { shard: ShardId },

    /// No disks were supplied.
    #[error("no disks available")]
    NoDisks,

    /// Disk is not part of the disk map.
    #[error("unknown disk {0}")]
    UnknownDisk(DiskId),
}

/// Peer transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The source node could not be reached.
    #[error("source node {0} unreachable")]
    SourceUnreachable(NodeId),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,

    /// Failed to send.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Object store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Snapshot capture failed.
    #[error("snapshot of shard {shard} failed: {reason}")]
    SnapshotFailed { shard: ShardId, reason: String },

    /// Object data could not be read.
    #[error("object {0} not found")]
    ObjectNotFound(String),

    /// Applying a rebalanced object failed.
    #[error("apply failed: {0}")]
    ApplyFailed(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Transport(TransportError::Serialization(e.to_string()))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
