//! Per (shard, tier) token state: ownership validity and compaction state.

use crate::types::{DataTier, ShardId, SHARD_COUNT};
use std::collections::BTreeSet;

/// Write file id every shard starts with.
pub const INITIAL_FILE_ID: u16 = 1;

/// State of one shard on one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenDescriptor {
    /// This node owns the shard.
    pub valid: bool,
    /// Garbage collection is rewriting the shard's token file.
    pub compaction_in_progress: bool,
    /// Token file currently receiving writes.
    pub write_file_id: u16,
}

impl Default for TokenDescriptor {
    fn default() -> Self {
        Self {
            valid: false,
            compaction_in_progress: false,
            write_file_id: INITIAL_FILE_ID,
        }
    }
}

/// Result of checking persisted token state against an ownership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCheck {
    /// Persisted state matches.
    Consistent,
    /// Some owned shards are persisted invalid.
    Inconsistent(BTreeSet<ShardId>),
    /// Some shards persisted valid are no longer owned.
    Lost(BTreeSet<ShardId>),
}

/// Token state of every shard on every tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStateTable {
    table: [[TokenDescriptor; SHARD_COUNT]; 2],
}

impl Default for TokenStateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStateTable {
    /// Create a table with every shard invalid.
    pub fn new() -> Self {
        Self {
            table: [[TokenDescriptor::default(); SHARD_COUNT]; 2],
        }
    }

    /// Descriptor of a shard on a tier.
    pub fn descriptor(&self, shard: ShardId, tier: DataTier) -> TokenDescriptor {
        self.table[tier.index()]
            .get(shard as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Replace the descriptor of a shard on a tier.
    pub fn set_descriptor(&mut self, shard: ShardId, tier: DataTier, desc: TokenDescriptor) {
        if let Some(slot) = self.table[tier.index()].get_mut(shard as usize) {
            *slot = desc;
        }
    }

    fn update(&mut self, shard: ShardId, tier: DataTier, f: impl FnOnce(&mut TokenDescriptor)) {
        if let Some(slot) = self.table[tier.index()].get_mut(shard as usize) {
            f(slot);
        }
    }

    /// Whether the shard is valid on any tier.
    pub fn is_valid(&self, shard: ShardId) -> bool {
        DataTier::ALL
            .iter()
            .any(|tier| self.descriptor(shard, *tier).valid)
    }

    /// Mark a shard valid or invalid on every tier.
    pub fn set_valid(&mut self, shard: ShardId, valid: bool) {
        for tier in DataTier::ALL {
            self.update(shard, tier, |d| d.valid = valid);
        }
    }

    /// Shards valid on any tier.
    pub fn valid_shards(&self) -> BTreeSet<ShardId> {
        (0..SHARD_COUNT as ShardId)
            .filter(|s| self.is_valid(*s))
            .collect()
    }

    /// Mark `shards` valid. Returns true if at least one was invalid before.
    pub fn initialize(&mut self, shards: &BTreeSet<ShardId>) -> bool {
        let mut gained = false;
        for shard in shards {
            if !self.is_valid(*shard) {
                gained = true;
                for tier in DataTier::ALL {
                    self.set_descriptor(
                        *shard,
                        tier,
                        TokenDescriptor {
                            valid: true,
                            ..TokenDescriptor::default()
                        },
                    );
                }
            }
        }
        gained
    }

    /// Mark `shards` invalid. Returns the ones that were valid.
    pub fn invalidate(&mut self, shards: &BTreeSet<ShardId>) -> BTreeSet<ShardId> {
        let mut changed = BTreeSet::new();
        for shard in shards {
            if self.is_valid(*shard) {
                self.set_valid(*shard, false);
                changed.insert(*shard);
            }
        }
        changed
    }

    /// Compare persisted validity against the set of shards that must be owned.
    pub fn check(&self, owned: &BTreeSet<ShardId>) -> TokenCheck {
        let mut missing = BTreeSet::new();
        let mut lost = BTreeSet::new();
        for shard in 0..SHARD_COUNT as ShardId {
            match (owned.contains(&shard), self.is_valid(shard)) {
                (true, false) => {
                    missing.insert(shard);
                }
                (false, true) => {
                    lost.insert(shard);
                }
                _ => {}
            }
        }
        if !missing.is_empty() {
            TokenCheck::Inconsistent(missing)
        } else if !lost.is_empty() {
            TokenCheck::Lost(lost)
        } else {
            TokenCheck::Consistent
        }
    }

    /// Whether compaction is rewriting a shard on a tier.
    pub fn compaction_in_progress(&self, shard: ShardId, tier: DataTier) -> bool {
        self.descriptor(shard, tier).compaction_in_progress
    }

    /// Set the compaction flag of a shard on a tier.
    pub fn set_compaction_state(&mut self, shard: ShardId, tier: DataTier, in_progress: bool) {
        self.update(shard, tier, |d| d.compaction_in_progress = in_progress);
    }

    /// Token file receiving writes for a shard on a tier.
    pub fn write_file_id(&self, shard: ShardId, tier: DataTier) -> u16 {
        self.descriptor(shard, tier).write_file_id
    }

    /// Switch the write file of a shard on a tier.
    pub fn set_write_file_id(&mut self, shard: ShardId, tier: DataTier, file_id: u16) {
        self.update(shard, tier, |d| d.write_file_id = file_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_reports_gain_once() {
        let mut table = TokenStateTable::new();
        let shards = BTreeSet::from([1, 2]);

        assert!(table.initialize(&shards));
        assert!(!table.initialize(&shards));
        assert_eq!(table.valid_shards(), shards);
    }

    #[test]
    fn test_invalidate_returns_changed_subset() {
        let mut table = TokenStateTable::new();
        table.initialize(&BTreeSet::from([1, 2]));

        let changed = table.invalidate(&BTreeSet::from([2, 3]));
        assert_eq!(changed, BTreeSet::from([2]));
        assert_eq!(table.valid_shards(), BTreeSet::from([1]));
    }

    #[test]
    fn test_check() {
        let mut table = TokenStateTable::new();
        table.initialize(&BTreeSet::from([1, 2]));

        assert_eq!(table.check(&BTreeSet::from([1, 2])), TokenCheck::Consistent);
        assert_eq!(
            table.check(&BTreeSet::from([1])),
            TokenCheck::Lost(BTreeSet::from([2]))
        );
        assert_eq!(
            table.check(&BTreeSet::from([1, 2, 3])),
            TokenCheck::Inconsistent(BTreeSet::from([3]))
        );
    }

    #[test]
    fn test_compaction_state() {
        let mut table = TokenStateTable::new();
        assert_eq!(table.write_file_id(4, DataTier::Hdd), INITIAL_FILE_ID);

        table.set_compaction_state(4, DataTier::Hdd, true);
        table.set_write_file_id(4, DataTier::Hdd, 2);

        assert!(table.compaction_in_progress(4, DataTier::Hdd));
        assert!(!table.compaction_in_progress(4, DataTier::Ssd));
        assert_eq!(table.write_file_id(4, DataTier::Hdd), 2);
    }
}
