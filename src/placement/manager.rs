//! Placement manager: the authoritative in-memory placement record and its
//! copies on every local disk.
//!
//! # Load
//!
//! ```text
//!             any record file on any disk?
//!               │no                    │yes
//!               ▼                      ▼
//!     fresh record, even OLT      reconcile: read every disk
//!     sync to every disk              │
//!                                     ├─ good <= bad ─▶ CannotReconcile (nothing written)
//!                                     ├─ one checksum ─▶ adopt, rewrite bad disks
//!                                     └─ N checksums ─▶ adopt newest mtime group,
//!                                                       rewrite every other disk
//!                                     ▼
//!                               disk topology check (recompute OLT if disks changed)
//! ```
//!
//! All state lives behind one `RwLock`. Queries take the read lock; every
//! mutation holds the write lock through the multi-disk sync that follows it.

use super::format::PlacementRecord;
use super::olt::ObjectLocationTable;
use super::record_file::{read_record, record_mtime, record_path, record_present, write_record};
use super::token_table::TokenCheck;
use crate::config::{DiskConfig, PlacementConfig};
use crate::error::{CoordinationError, Error, FormatError, PlacementError, Result};
use crate::metrics::PlacementMetrics;
use crate::ownership::OwnershipTable;
use crate::types::{DataTier, DiskId, NodeId, OwnershipVersion, ShardId, INVALID_VERSION};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// What `load` found on the disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No disk had a record; a fresh one was written.
    Pristine,
    /// An existing record was reconciled and adopted.
    Recovered,
}

/// Result of applying an ownership table version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipUpdate {
    /// Version persisted, no shard became valid.
    Applied,
    /// Version persisted and at least one shard went invalid -> valid; data
    /// for it must be migrated in.
    GainedTokens,
    /// First table after restart: persisted state holds shards this node no
    /// longer owns. The caller invalidates them.
    LostTokens(BTreeSet<ShardId>),
    /// First table after restart matched the persisted state; owned data
    /// should be re-synced from peers.
    NeedResync,
}

/// A disk joined or left one of the tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskChange {
    /// The disk is gone; `shards` lived on it.
    Removed {
        disk: DiskId,
        tier: DataTier,
        shards: BTreeSet<ShardId>,
    },
    /// The disk is new; `shards` were moved onto it.
    Added {
        disk: DiskId,
        tier: DataTier,
        shards: BTreeSet<ShardId>,
    },
}

/// Called for every disk change while the manager's write lock is held.
///
/// Handlers must not call back into the [`PlacementManager`].
pub type DiskChangeHandler = Arc<dyn Fn(&DiskChange) + Send + Sync>;

#[derive(Debug, Clone)]
struct DiskEntry {
    tier: DataTier,
    path: PathBuf,
    healthy: bool,
}

struct ManagerState {
    record: PlacementRecord,
    disks: BTreeMap<DiskId, DiskEntry>,
    /// No ownership table has been applied since this process started.
    first_update_since_start: bool,
}

/// Owns the placement record of this node.
pub struct PlacementManager {
    config: PlacementConfig,
    state: RwLock<ManagerState>,
    disk_change_handler: Option<DiskChangeHandler>,
    metrics: PlacementMetrics,
}

impl PlacementManager {
    /// Create a manager with no disks loaded.
    pub fn new(config: PlacementConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ManagerState {
                record: PlacementRecord::new(),
                disks: BTreeMap::new(),
                first_update_since_start: true,
            }),
            disk_change_handler: None,
            metrics: PlacementMetrics::new(),
        }
    }

    /// Set the handler invoked on disk topology changes.
    pub fn with_disk_change_handler(mut self, handler: DiskChangeHandler) -> Self {
        self.disk_change_handler = Some(handler);
        self
    }

    /// Placement metrics.
    pub fn metrics(&self) -> &PlacementMetrics {
        &self.metrics
    }

    /// Load the placement record from `disks`.
    ///
    /// Fails if the copies on disk cannot be reconciled; the node must not
    /// start on a placement it cannot trust.
    pub fn load(&self, disks: &BTreeMap<DiskId, DiskConfig>) -> Result<LoadOutcome> {
        if disks.is_empty() {
            return Err(PlacementError::NoDisks.into());
        }

        let mut state = self.state.write();
        state.disks = disks
            .iter()
            .map(|(id, disk)| {
                (
                    *id,
                    DiskEntry {
                        tier: disk.tier,
                        path: disk.path.clone(),
                        healthy: true,
                    },
                )
            })
            .collect();
        state.first_update_since_start = true;

        let pristine = state.disks.values().all(|disk| {
            !record_present(&record_path(&disk.path, &self.config.record_file_name))
        });

        if pristine {
            let (hdds, ssds) = live_disks(&state.disks);
            tracing::info!(
                hdds = hdds.len(),
                ssds = ssds.len(),
                "No placement record found, initializing pristine state"
            );
            let mut record = PlacementRecord::new();
            record.olt = ObjectLocationTable::compute(&hdds, &ssds);
            record.resync_pending = true;
            state.record = record;
            self.sync_locked(&mut state)?;
            return Ok(LoadOutcome::Pristine);
        }

        self.reconcile_locked(&mut state)?;
        for (id, disk) in state.disks.iter_mut() {
            if !disk.path.is_dir() {
                tracing::warn!(disk = id, path = %disk.path.display(), "Disk not accessible");
                disk.healthy = false;
            }
        }
        let (hdds, ssds) = live_disks(&state.disks);
        self.check_disk_topology_locked(&mut state, &hdds, &ssds)?;
        Ok(LoadOutcome::Recovered)
    }

    /// Re-elect the placement record from the copies on every disk and
    /// rewrite the copies that disagree with it.
    pub fn reconcile(&self) -> Result<()> {
        let mut state = self.state.write();
        self.reconcile_locked(&mut state)
    }

    fn reconcile_locked(&self, state: &mut ManagerState) -> Result<()> {
        self.metrics.reconciles.inc();

        let mut groups: BTreeMap<u32, (PlacementRecord, Vec<(DiskId, SystemTime)>)> =
            BTreeMap::new();
        let mut bad = BTreeSet::new();

        for (id, disk) in &state.disks {
            let path = record_path(&disk.path, &self.config.record_file_name);
            match read_record(&path) {
                Ok(record) => {
                    let mtime = record_mtime(&path).unwrap_or(SystemTime::UNIX_EPOCH);
                    groups
                        .entry(record.checksum)
                        .or_insert_with(|| (record, Vec::new()))
                        .1
                        .push((*id, mtime));
                }
                Err(FormatError::Io(e)) => {
                    tracing::warn!(disk = id, error = %e, "Placement record unreadable");
                    bad.insert(*id);
                }
                Err(e) => {
                    tracing::warn!(disk = id, error = %e, "Placement record corrupt");
                    bad.insert(*id);
                }
            }
        }

        let good: usize = groups.values().map(|(_, disks)| disks.len()).sum();
        if good <= bad.len() {
            tracing::error!(good, bad = bad.len(), "Cannot reconcile placement record");
            return Err(PlacementError::CannotReconcile {
                good,
                bad: bad.len(),
            }
            .into());
        }

        if groups.len() > 2 {
            tracing::warn!(
                groups = groups.len(),
                "More than two distinct placement records on disk"
            );
        }

        let newest = |disks: &Vec<(DiskId, SystemTime)>| {
            disks
                .iter()
                .map(|(_, mtime)| *mtime)
                .max()
                .unwrap_or(SystemTime::UNIX_EPOCH)
        };
        let Some(checksum) = groups
            .iter()
            .max_by_key(|(checksum, (_, disks))| (newest(disks), disks.len(), **checksum))
            .map(|(checksum, _)| *checksum)
        else {
            return Err(PlacementError::CannotReconcile { good, bad: bad.len() }.into());
        };
        let Some((record, adopted)) = groups.remove(&checksum) else {
            return Err(Error::Internal("adopted record group vanished".to_string()));
        };

        let stale: BTreeSet<DiskId> = groups
            .values()
            .flat_map(|(_, disks)| disks.iter().map(|(id, _)| *id))
            .chain(bad)
            .collect();
        tracing::info!(
            checksum = format_args!("{:#010x}", checksum),
            adopted = adopted.len(),
            rewrite = stale.len(),
            version = record.version,
            "Adopted placement record"
        );
        state.record = record;

        for id in stale {
            let Some(disk) = state.disks.get_mut(&id) else {
                continue;
            };
            let path = record_path(&disk.path, &self.config.record_file_name);
            match write_record(&path, &state.record) {
                Ok(()) => self.metrics.reconcile_rewrites.inc(),
                Err(e) => {
                    tracing::warn!(disk = id, error = %e, "Failed to rewrite placement record");
                    disk.healthy = false;
                }
            }
        }
        Ok(())
    }

    /// Apply a new disk topology.
    pub fn on_disk_topology_change(&self, disks: &BTreeMap<DiskId, DiskConfig>) -> Result<()> {
        let mut state = self.state.write();
        for (id, disk) in disks {
            state.disks.entry(*id).or_insert_with(|| DiskEntry {
                tier: disk.tier,
                path: disk.path.clone(),
                healthy: true,
            });
        }
        let hdds = tier_ids(disks, DataTier::Hdd);
        let ssds = tier_ids(disks, DataTier::Ssd);
        self.check_disk_topology_locked(&mut state, &hdds, &ssds)
    }

    fn check_disk_topology_locked(
        &self,
        state: &mut ManagerState,
        hdds: &BTreeSet<DiskId>,
        ssds: &BTreeSet<DiskId>,
    ) -> Result<()> {
        let mut changed = false;
        let mut removed_all = Vec::new();

        for (tier, live) in [(DataTier::Hdd, hdds), (DataTier::Ssd, ssds)] {
            let persisted = state.record.olt.disks(tier);
            let removed: Vec<DiskId> = persisted.difference(live).copied().collect();
            let added: Vec<DiskId> = live.difference(&persisted).copied().collect();
            if removed.is_empty() && added.is_empty() {
                continue;
            }
            tracing::info!(
                %tier,
                removed = ?removed,
                added = ?added,
                "Disk topology changed"
            );
            changed = true;
            if !removed.is_empty() {
                state.record.resync_pending = true;
            }

            for disk in &removed {
                let shards: BTreeSet<ShardId> = state
                    .record
                    .olt
                    .shards_on_disk(*disk)
                    .into_iter()
                    .filter(|s| state.record.olt.disk_id(*s, tier) == *disk)
                    .collect();
                for shard in &shards {
                    state.record.tokens.set_compaction_state(*shard, tier, false);
                }
                self.notify_disk_change(&DiskChange::Removed {
                    disk: *disk,
                    tier,
                    shards,
                });
            }

            let moves = state.record.olt.recompute(tier, live);
            for disk in &added {
                let shards = moves
                    .iter()
                    .filter(|m| m.to == Some(*disk))
                    .map(|m| m.shard)
                    .collect();
                self.notify_disk_change(&DiskChange::Added {
                    disk: *disk,
                    tier,
                    shards,
                });
            }
            removed_all.extend(removed);
        }

        if !changed {
            return Ok(());
        }
        self.metrics.topology_changes.inc();
        for disk in removed_all {
            state.disks.remove(&disk);
        }
        self.sync_locked(state)
    }

    fn notify_disk_change(&self, change: &DiskChange) {
        if let Some(handler) = &self.disk_change_handler {
            handler(change);
        }
    }

    /// Persist ownership of `owned` shards under ownership table `version`.
    pub fn update_ownership(
        &self,
        owned: &BTreeSet<ShardId>,
        version: OwnershipVersion,
    ) -> Result<OwnershipUpdate> {
        if version == INVALID_VERSION {
            return Err(Error::Config("ownership version 0 is reserved".to_string()));
        }
        let mut state = self.state.write();
        let persisted = state.record.version;
        let first = state.first_update_since_start;
        state.first_update_since_start = false;

        if version == persisted || (persisted != INVALID_VERSION && first) {
            if !first {
                tracing::info!(version, "Ownership version already applied");
                return Err(CoordinationError::DuplicateVersion(version).into());
            }
            if version != persisted {
                tracing::info!(
                    version,
                    persisted,
                    "First ownership table after restart differs from persisted version"
                );
            }

            let outcome = match state.record.tokens.check(owned) {
                TokenCheck::Inconsistent(shards) => {
                    tracing::error!(
                        version,
                        shards = ?shards,
                        "Owned shards are marked invalid in the placement record"
                    );
                    let shard = shards.first().copied().unwrap_or_default();
                    return Err(PlacementError::Inconsistent { shard }.into());
                }
                TokenCheck::Lost(shards) => {
                    tracing::info!(
                        version,
                        shards = ?shards,
                        "Placement record holds shards no longer owned"
                    );
                    OwnershipUpdate::LostTokens(shards)
                }
                TokenCheck::Consistent => OwnershipUpdate::NeedResync,
            };
            if version != persisted {
                state.record.version = version;
                self.sync_locked(&mut state)?;
            }
            return Ok(outcome);
        }

        let gained = state.record.tokens.initialize(owned);
        state.record.version = version;
        self.sync_locked(&mut state)?;
        tracing::debug!(version, gained, "Persisted shard ownership");
        Ok(if gained {
            OwnershipUpdate::GainedTokens
        } else {
            OwnershipUpdate::Applied
        })
    }

    /// Persist the shards `node` owns under `table`.
    pub fn apply_ownership_table(
        &self,
        table: &OwnershipTable,
        node: NodeId,
    ) -> Result<OwnershipUpdate> {
        self.update_ownership(&table.shards_for_node(node), table.version())
    }

    /// Invalidate shards this node no longer owns. Returns the ones that
    /// were valid.
    pub fn mark_tokens_removed(
        &self,
        not_owned: &BTreeSet<ShardId>,
        version: OwnershipVersion,
    ) -> Result<BTreeSet<ShardId>> {
        let mut state = self.state.write();
        if version != state.record.version {
            tracing::warn!(
                version,
                persisted = state.record.version,
                "Removing shards under a version that was not applied"
            );
        }
        let changed = state.record.tokens.invalidate(not_owned);
        self.sync_locked(&mut state)?;
        Ok(changed)
    }

    /// Disk holding a shard on a tier.
    pub fn disk_for_shard(&self, shard: ShardId, tier: DataTier) -> DiskId {
        self.state.read().record.olt.disk_id(shard, tier)
    }

    /// Shards placed on a disk.
    pub fn shards_on_disk(&self, disk: DiskId) -> BTreeSet<ShardId> {
        self.state.read().record.olt.shards_on_disk(disk)
    }

    /// Token file receiving writes for a shard.
    pub fn write_file_id(&self, shard: ShardId, tier: DataTier) -> u16 {
        self.state.read().record.tokens.write_file_id(shard, tier)
    }

    /// Whether garbage collection is rewriting a shard.
    pub fn is_compaction_in_progress(&self, shard: ShardId, tier: DataTier) -> bool {
        self.state
            .read()
            .record
            .tokens
            .compaction_in_progress(shard, tier)
    }

    /// Start or finish compaction of a shard. Starting switches writes to
    /// `new_file_id`.
    pub fn change_compaction_state(
        &self,
        shard: ShardId,
        tier: DataTier,
        in_progress: bool,
        new_file_id: u16,
    ) -> Result<()> {
        let mut state = self.state.write();
        state
            .record
            .tokens
            .set_compaction_state(shard, tier, in_progress);
        if in_progress {
            state.record.tokens.set_write_file_id(shard, tier, new_file_id);
        }
        self.sync_locked(&mut state)
    }

    /// Shards this node owns.
    pub fn owned_shards(&self) -> BTreeSet<ShardId> {
        self.state.read().record.tokens.valid_shards()
    }

    /// Last applied ownership version.
    pub fn version(&self) -> OwnershipVersion {
        self.state.read().record.version
    }

    /// Persist an ownership version without touching shard state.
    pub fn set_version(&self, version: OwnershipVersion) -> Result<()> {
        let mut state = self.state.write();
        state.record.version = version;
        self.sync_locked(&mut state)
    }

    /// Whether owned data must be re-synced from peers.
    pub fn needs_resync(&self) -> bool {
        self.state.read().record.resync_pending
    }

    /// Persist that a resync is pending.
    pub fn set_resync(&self) -> Result<()> {
        self.persist_resync_flag(true)
    }

    /// Persist that no resync is pending.
    pub fn reset_resync(&self) -> Result<()> {
        self.persist_resync_flag(false)
    }

    fn persist_resync_flag(&self, pending: bool) -> Result<()> {
        let mut state = self.state.write();
        state.record.resync_pending = pending;
        self.sync_locked(&mut state)
    }

    /// Whether a disk is known and has not failed.
    pub fn is_disk_healthy(&self, disk: DiskId) -> bool {
        self.state
            .read()
            .disks
            .get(&disk)
            .is_some_and(|d| d.healthy)
    }

    /// Stop writing the record to a disk.
    pub fn mark_disk_bad(&self, disk: DiskId) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .disks
            .get_mut(&disk)
            .ok_or(PlacementError::UnknownDisk(disk))?;
        entry.healthy = false;
        tracing::warn!(disk, "Disk marked bad");
        Ok(())
    }

    /// Copy of the in-memory record.
    pub fn record(&self) -> PlacementRecord {
        self.state.read().record.clone()
    }

    /// Seal the record and write it to every healthy disk.
    ///
    /// A failed disk is marked bad. The sync fails only if no more than
    /// half of the attempted disks took the write.
    fn sync_locked(&self, state: &mut ManagerState) -> Result<()> {
        let start = Instant::now();
        self.metrics.record_syncs.inc();
        state.record.seal();

        let mut attempted = 0usize;
        let mut written = 0usize;
        let mut last_error = None;
        for (id, disk) in state.disks.iter_mut().filter(|(_, d)| d.healthy) {
            attempted += 1;
            let path = record_path(&disk.path, &self.config.record_file_name);
            match write_record(&path, &state.record) {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::error!(disk = id, error = %e, "Placement record sync failed");
                    self.metrics.sync_failures.inc();
                    disk.healthy = false;
                    last_error = Some(PlacementError::WriteFailed {
                        disk: *id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        self.metrics.sync_latency.observe_duration(start.elapsed());

        if attempted == 0 {
            return Err(PlacementError::NoDisks.into());
        }
        if written * 2 <= attempted {
            return Err(last_error.unwrap_or(PlacementError::NoDisks).into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for PlacementManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("PlacementManager")
            .field("version", &state.record.version)
            .field("disks", &state.disks.len())
            .finish()
    }
}

fn live_disks(disks: &BTreeMap<DiskId, DiskEntry>) -> (BTreeSet<DiskId>, BTreeSet<DiskId>) {
    let of_tier = |tier: DataTier| {
        disks
            .iter()
            .filter(|(_, d)| d.healthy && d.tier == tier)
            .map(|(id, _)| *id)
            .collect()
    };
    (of_tier(DataTier::Hdd), of_tier(DataTier::Ssd))
}

fn tier_ids(disks: &BTreeMap<DiskId, DiskConfig>, tier: DataTier) -> BTreeSet<DiskId> {
    disks
        .iter()
        .filter(|(_, d)| d.tier == tier)
        .map(|(id, _)| *id)
        .collect()
}
