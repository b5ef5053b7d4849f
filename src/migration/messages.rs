//! Peer-to-peer migration messages.
//!
//! ```text
//!   destination (executor)                    source (client)
//!   ──────────────────────                    ───────────────
//!   RebalanceFilterSet  (per token) ────────▶
//!                                   ◀──────── SourceResponse
//!                                   ◀──────── RebalanceDeltaSet* (round 1)
//!   SecondRebalanceRequest ─────────────────▶
//!                                   ◀──────── RebalanceDeltaSet* (round 2)
//!                                   ◀──────── ForwardedRequest*  (live IO, once armed)
//!   FinishResync (resync only) ─────────────▶
//! ```

use crate::error::Result;
use crate::types::{ExecutorId, FineToken, ObjectId, OwnershipVersion, ShardId, VolumeId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata of one stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Total references across volumes.
    pub ref_count: u64,
    /// Data size in bytes.
    pub size: u32,
    /// Data failed verification; never migrated.
    pub corrupted: bool,
    /// References per volume.
    pub volume_refs: BTreeMap<VolumeId, u64>,
}

impl ObjectMetadata {
    /// Metadata of a freshly written object with one reference from `volume`.
    pub fn new(size: u32, volume: VolumeId) -> Self {
        Self {
            ref_count: 1,
            size,
            corrupted: false,
            volume_refs: BTreeMap::from([(volume, 1)]),
        }
    }

    /// Reference count changes that turn `old` into `self`.
    pub fn diff_from(&self, old: &ObjectMetadata) -> DeltaPayload {
        let mut volume_ref_deltas = BTreeMap::new();
        for (volume, count) in &self.volume_refs {
            let before = old.volume_refs.get(volume).copied().unwrap_or(0);
            if *count != before {
                volume_ref_deltas.insert(*volume, *count as i64 - before as i64);
            }
        }
        for (volume, before) in &old.volume_refs {
            if !self.volume_refs.contains_key(volume) {
                volume_ref_deltas.insert(*volume, -(*before as i64));
            }
        }
        DeltaPayload::MetadataDiff {
            ref_count_delta: self.ref_count as i64 - old.ref_count as i64,
            volume_ref_deltas,
        }
    }

    /// Apply reference count changes. Counts saturate at zero.
    pub fn apply_diff(&mut self, ref_count_delta: i64, volume_ref_deltas: &BTreeMap<VolumeId, i64>) {
        self.ref_count = self.ref_count.saturating_add_signed(ref_count_delta);
        for (volume, delta) in volume_ref_deltas {
            let count = self.volume_refs.entry(*volume).or_insert(0);
            *count = count.saturating_add_signed(*delta);
            if *count == 0 {
                self.volume_refs.remove(volume);
            }
        }
    }
}

/// Point-in-time metadata of one shard.
pub type MetadataSnapshot = BTreeMap<ObjectId, ObjectMetadata>;

/// What the destination already holds for one fine token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceFilterSet {
    pub executor_id: ExecutorId,
    pub shard: ShardId,
    pub token: FineToken,
    /// Object -> reference count at the destination.
    pub objects: BTreeMap<ObjectId, u64>,
    pub seq_num: u64,
    pub last_set: bool,
    pub one_phase: bool,
    pub target_version: OwnershipVersion,
}

/// Change to one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaPayload {
    /// Overwrite metadata and data.
    Full { metadata: ObjectMetadata, data: Bytes },
    /// Reconcile reference counts into the existing object.
    MetadataDiff {
        ref_count_delta: i64,
        volume_ref_deltas: BTreeMap<VolumeId, i64>,
    },
}

/// One object in a delta set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaObject {
    pub object_id: ObjectId,
    pub payload: DeltaPayload,
}

/// A batch of object changes from source to destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceDeltaSet {
    pub executor_id: ExecutorId,
    pub seq_num: u64,
    pub last_set: bool,
    pub objects: Vec<DeltaObject>,
}

/// Ask the source for everything that changed since round 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondRebalanceRequest {
    pub executor_id: ExecutorId,
}

/// Live request on the IO path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoRequest {
    PutObject {
        object_id: ObjectId,
        volume: VolumeId,
        data: Bytes,
    },
    DeleteObject {
        object_id: ObjectId,
        volume: VolumeId,
    },
    /// Objects from `src_volume` gain a reference from `dst_volume`.
    AddObjectRef {
        src_volume: VolumeId,
        dst_volume: VolumeId,
        object_ids: Vec<ObjectId>,
    },
}

/// A live request mirrored to a destination during migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedRequest {
    pub executor_id: ExecutorId,
    pub request: IoRequest,
}

/// Source answer to a filter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceResponse {
    /// The source will serve the token.
    Accepted,
    /// The destination should treat the token as already in sync.
    Declined,
    /// The source cannot serve yet; retry later.
    NotReady,
}

/// Envelope for every peer message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    FilterSet(RebalanceFilterSet),
    FilterSetResponse(SourceResponse),
    DeltaSet(RebalanceDeltaSet),
    SecondRebalance(SecondRebalanceRequest),
    FinishResync { executor_id: ExecutorId },
    /// The source stopped serving an executor.
    MigrationAbort { executor_id: ExecutorId, reason: String },
    Forwarded(ForwardedRequest),
}

impl PeerMessage {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_and_apply() {
        let mut old = ObjectMetadata::new(10, 1);
        old.ref_count = 3;
        old.volume_refs.insert(2, 2);

        let mut new = old.clone();
        new.ref_count = 2;
        new.volume_refs.remove(&2);
        new.volume_refs.insert(1, 1);
        new.volume_refs.insert(3, 1);

        let DeltaPayload::MetadataDiff {
            ref_count_delta,
            volume_ref_deltas,
        } = new.diff_from(&old)
        else {
            panic!("expected a metadata diff");
        };
        assert_eq!(ref_count_delta, -1);
        assert_eq!(volume_ref_deltas, BTreeMap::from([(2, -2), (3, 1)]));

        let mut applied = old.clone();
        applied.apply_diff(ref_count_delta, &volume_ref_deltas);
        assert_eq!(applied, new);
    }

    #[test]
    fn test_delta_set_envelope() {
        let id = ObjectId::for_content(b"payload");
        let msg = PeerMessage::DeltaSet(RebalanceDeltaSet {
            executor_id: 0xabcd_0000_0000_0001,
            seq_num: 4,
            last_set: true,
            objects: vec![DeltaObject {
                object_id: id,
                payload: DeltaPayload::Full {
                    metadata: ObjectMetadata::new(7, 1),
                    data: Bytes::from_static(b"payload"),
                },
            }],
        });

        let decoded = PeerMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(PeerMessage::from_bytes(&[0xff; 3]).is_err());
    }
}
