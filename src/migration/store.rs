//! Object store seam used by executors and clients.
//!
//! Migration never touches object files directly. Snapshots, reads and
//! applied deltas all go through [`ObjectStore`], which the IO engine
//! implements. [`InMemoryObjectStore`] backs tests and single-process setups.

use super::messages::{DeltaObject, DeltaPayload, IoRequest, MetadataSnapshot, ObjectMetadata};
use crate::error::{Result, StoreError};
use crate::types::{fine_token, shard_for_token, ObjectId, ShardId, VolumeId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Storage operations required by the migration protocol.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Consistent metadata snapshot of every object in `shard`, including
    /// objects whose reference count dropped to zero.
    async fn snapshot(&self, shard: ShardId, token_bits: u32) -> Result<MetadataSnapshot>;

    /// Read the data of one object.
    async fn read_object_data(&self, object_id: &ObjectId) -> Result<Bytes>;

    /// Apply one rebalanced object.
    async fn apply_delta_object(&self, object: &DeltaObject) -> Result<()>;

    /// Apply a live request mirrored from a source.
    async fn apply_forwarded(&self, request: &IoRequest) -> Result<()>;
}

type ObjectEntry = (ObjectMetadata, Bytes);

/// Object store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<ObjectId, ObjectEntry>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an object, or add a reference if it already exists.
    pub fn put(&self, object_id: ObjectId, volume: VolumeId, data: Bytes) {
        let mut objects = self.objects.write();
        match objects.get_mut(&object_id) {
            Some((meta, stored)) => {
                meta.ref_count += 1;
                *meta.volume_refs.entry(volume).or_insert(0) += 1;
                if stored.is_empty() {
                    *stored = data;
                }
            }
            None => {
                let meta = ObjectMetadata::new(data.len() as u32, volume);
                objects.insert(object_id, (meta, data));
            }
        }
    }

    /// Drop one reference. The entry is kept at zero so a later snapshot
    /// still reports the object.
    pub fn delete(&self, object_id: &ObjectId, volume: VolumeId) {
        if let Some((meta, _)) = self.objects.write().get_mut(object_id) {
            meta.apply_diff(-1, &BTreeMap::from([(volume, -1)]));
        }
    }

    /// Add a reference from `dst_volume` to objects already present.
    pub fn add_ref(&self, object_ids: &[ObjectId], dst_volume: VolumeId) {
        let mut objects = self.objects.write();
        for id in object_ids {
            if let Some((meta, _)) = objects.get_mut(id) {
                meta.ref_count += 1;
                *meta.volume_refs.entry(dst_volume).or_insert(0) += 1;
            }
        }
    }

    /// Flag an object's data as corrupted.
    pub fn mark_corrupted(&self, object_id: &ObjectId) {
        if let Some((meta, _)) = self.objects.write().get_mut(object_id) {
            meta.corrupted = true;
        }
    }

    pub fn metadata(&self, object_id: &ObjectId) -> Option<ObjectMetadata> {
        self.objects.read().get(object_id).map(|(m, _)| m.clone())
    }

    pub fn data(&self, object_id: &ObjectId) -> Option<Bytes> {
        self.objects.read().get(object_id).map(|(_, d)| d.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Objects with at least one reference.
    pub fn live_objects(&self) -> BTreeMap<ObjectId, u64> {
        self.objects
            .read()
            .iter()
            .filter(|(_, (m, _))| m.ref_count > 0)
            .map(|(id, (m, _))| (*id, m.ref_count))
            .collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn snapshot(&self, shard: ShardId, token_bits: u32) -> Result<MetadataSnapshot> {
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|(id, _)| shard_for_token(fine_token(id, token_bits)) == shard)
            .map(|(id, (meta, _))| (*id, meta.clone()))
            .collect())
    }

    async fn read_object_data(&self, object_id: &ObjectId) -> Result<Bytes> {
        self.data(object_id)
            .ok_or_else(|| StoreError::ObjectNotFound(object_id.to_string()).into())
    }

    async fn apply_delta_object(&self, object: &DeltaObject) -> Result<()> {
        let mut objects = self.objects.write();
        match &object.payload {
            DeltaPayload::Full { metadata, data } => {
                objects.insert(object.object_id, (metadata.clone(), data.clone()));
                Ok(())
            }
            DeltaPayload::MetadataDiff {
                ref_count_delta,
                volume_ref_deltas,
            } => match objects.get_mut(&object.object_id) {
                Some((meta, _)) => {
                    meta.apply_diff(*ref_count_delta, volume_ref_deltas);
                    Ok(())
                }
                None => Err(StoreError::ApplyFailed(format!(
                    "metadata diff for missing object {}",
                    object.object_id
                ))
                .into()),
            },
        }
    }

    async fn apply_forwarded(&self, request: &IoRequest) -> Result<()> {
        match request {
            IoRequest::PutObject {
                object_id,
                volume,
                data,
            } => self.put(*object_id, *volume, data.clone()),
            IoRequest::DeleteObject { object_id, volume } => self.delete(object_id, *volume),
            IoRequest::AddObjectRef {
                dst_volume,
                object_ids,
                ..
            } => self.add_ref(object_ids, *dst_volume),
        }
        Ok(())
    }
}
