//! What the coordinator does when an executor fails.

use super::coordinator::MigrationKind;
use crate::error::Error;
use crate::types::{FineToken, NodeId, ShardId};
use std::collections::BTreeSet;

/// Reaction to a failed executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Abort the whole migration on this node.
    Abort,
    /// Ask [`ErrorPolicy::replace_source`] for another source.
    ReplaceSource,
    /// Leave the executor in error and carry on with the rest.
    Skip,
}

/// Decides how executor failures are handled.
pub trait ErrorPolicy: Send + Sync + std::fmt::Debug {
    /// Action for an executor that failed with `error`.
    fn on_error(&self, error: &Error, kind: MigrationKind) -> FailureAction;

    /// Another source for `tokens` of `shard` after `failed_source` became
    /// unreachable. `None` leaves the executor done-with-error.
    fn replace_source(
        &self,
        shard: ShardId,
        failed_source: NodeId,
        tokens: &BTreeSet<FineToken>,
    ) -> Option<NodeId> {
        let _ = (shard, failed_source, tokens);
        None
    }
}

/// Abort the migration on any error. During resync an unreachable source is
/// routed through the replacement hook first.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnError;

impl ErrorPolicy for AbortOnError {
    fn on_error(&self, error: &Error, kind: MigrationKind) -> FailureAction {
        if kind == MigrationKind::Resync && error.is_source_unavailable() {
            FailureAction::ReplaceSource
        } else {
            FailureAction::Abort
        }
    }
}

/// Keep going past failed executors; their tokens stay MigratingIn until the
/// next ownership change.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipFailedTokens;

impl ErrorPolicy for SkipFailedTokens {
    fn on_error(&self, _error: &Error, _kind: MigrationKind) -> FailureAction {
        FailureAction::Skip
    }
}
