//! Object location table: (shard, tier) -> disk.
//!
//! Placement is deterministic: shard `s` of a tier with sorted disks
//! `[d0, d1, ..]` initially lands on `d(s mod n)`. When disks come and go the
//! table is recomputed with as few moved shards as possible:
//!
//! - shards on a removed (or never assigned) disk go to the least loaded live disk
//! - each added disk then takes shards from the most loaded disks until it
//!   holds `SHARD_COUNT / n` of them

use crate::types::{DataTier, DiskId, ShardId, SHARD_COUNT};
use std::collections::{BTreeMap, BTreeSet};

/// Disk id meaning "no disk".
pub const INVALID_DISK_ID: DiskId = 0xffff;

/// A shard whose disk changed during a recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardMove {
    /// Shard being moved.
    pub shard: ShardId,
    /// Tier of both disks.
    pub tier: DataTier,
    /// Previous disk, if any.
    pub from: Option<DiskId>,
    /// New disk, if any.
    pub to: Option<DiskId>,
}

/// Placement of every shard on every tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocationTable {
    table: [[DiskId; SHARD_COUNT]; 2],
}

impl Default for ObjectLocationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectLocationTable {
    /// Create a table with every shard unassigned.
    pub fn new() -> Self {
        Self {
            table: [[INVALID_DISK_ID; SHARD_COUNT]; 2],
        }
    }

    /// Even placement over the given disks.
    pub fn compute(hdds: &BTreeSet<DiskId>, ssds: &BTreeSet<DiskId>) -> Self {
        let mut olt = Self::new();
        for (tier, disks) in [(DataTier::Hdd, hdds), (DataTier::Ssd, ssds)] {
            let disks: Vec<DiskId> = disks.iter().copied().collect();
            if disks.is_empty() {
                continue;
            }
            for shard in 0..SHARD_COUNT {
                olt.table[tier.index()][shard] = disks[shard % disks.len()];
            }
        }
        olt
    }

    /// Disk holding a shard on a tier.
    pub fn disk_id(&self, shard: ShardId, tier: DataTier) -> DiskId {
        self.table[tier.index()]
            .get(shard as usize)
            .copied()
            .unwrap_or(INVALID_DISK_ID)
    }

    /// Place a shard on a disk.
    pub fn set_disk_id(&mut self, shard: ShardId, tier: DataTier, disk: DiskId) {
        if let Some(slot) = self.table[tier.index()].get_mut(shard as usize) {
            *slot = disk;
        }
    }

    /// Disks referenced on a tier.
    pub fn disks(&self, tier: DataTier) -> BTreeSet<DiskId> {
        self.table[tier.index()]
            .iter()
            .copied()
            .filter(|d| *d != INVALID_DISK_ID)
            .collect()
    }

    /// Shards placed on a disk, on any tier.
    pub fn shards_on_disk(&self, disk: DiskId) -> BTreeSet<ShardId> {
        let mut shards = BTreeSet::new();
        for row in &self.table {
            for (shard, d) in row.iter().enumerate() {
                if *d == disk {
                    shards.insert(shard as ShardId);
                }
            }
        }
        shards
    }

    /// Recompute one tier so that it only references `live` disks.
    ///
    /// Returns every shard that changed disk.
    pub fn recompute(&mut self, tier: DataTier, live: &BTreeSet<DiskId>) -> Vec<ShardMove> {
        let row = tier.index();
        let mut moves = Vec::new();

        if live.is_empty() {
            for shard in 0..SHARD_COUNT {
                let from = self.table[row][shard];
                if from != INVALID_DISK_ID {
                    self.table[row][shard] = INVALID_DISK_ID;
                    moves.push(ShardMove {
                        shard: shard as ShardId,
                        tier,
                        from: Some(from),
                        to: None,
                    });
                }
            }
            return moves;
        }

        let previous = self.disks(tier);
        let mut load: BTreeMap<DiskId, Vec<ShardId>> =
            live.iter().map(|d| (*d, Vec::new())).collect();
        let mut orphans = Vec::new();
        for shard in 0..SHARD_COUNT {
            let disk = self.table[row][shard];
            match load.get_mut(&disk) {
                Some(shards) => shards.push(shard as ShardId),
                None => orphans.push(shard as ShardId),
            }
        }

        for shard in orphans {
            let Some(target) = least_loaded(&load) else {
                break;
            };
            let from = self.table[row][shard as usize];
            self.table[row][shard as usize] = target;
            if let Some(shards) = load.get_mut(&target) {
                shards.push(shard);
            }
            moves.push(ShardMove {
                shard,
                tier,
                from: (from != INVALID_DISK_ID).then_some(from),
                to: Some(target),
            });
        }

        let floor = SHARD_COUNT / live.len();
        for added in live.difference(&previous) {
            loop {
                let have = load.get(added).map_or(0, Vec::len);
                if have >= floor {
                    break;
                }
                let Some(donor) = most_loaded(&load, *added) else {
                    break;
                };
                let Some(shard) = load.get_mut(&donor).and_then(Vec::pop) else {
                    break;
                };
                self.table[row][shard as usize] = *added;
                if let Some(shards) = load.get_mut(added) {
                    shards.push(shard);
                }
                moves.push(ShardMove {
                    shard,
                    tier,
                    from: Some(donor),
                    to: Some(*added),
                });
            }
        }

        moves
    }
}

fn least_loaded(load: &BTreeMap<DiskId, Vec<ShardId>>) -> Option<DiskId> {
    load.iter()
        .min_by_key(|(disk, shards)| (shards.len(), **disk))
        .map(|(disk, _)| *disk)
}

/// Most loaded disk other than `exclude`, if it holds more than the
/// excluded disk plus one (otherwise moving would not improve balance).
fn most_loaded(load: &BTreeMap<DiskId, Vec<ShardId>>, exclude: DiskId) -> Option<DiskId> {
    let floor = load.get(&exclude).map_or(0, Vec::len);
    load.iter()
        .filter(|(disk, _)| **disk != exclude)
        .max_by_key(|(disk, shards)| (shards.len(), std::cmp::Reverse(**disk)))
        .filter(|(_, shards)| shards.len() > floor + 1)
        .map(|(disk, _)| *disk)
}
