//! Core types shared by the placement and migration layers.
//!
//! # Keyspace
//!
//! ```text
//!   ObjectId (16 bytes, content address)
//!      │  top `token_bits` bits of the first 8 bytes
//!      ▼
//!   FineToken  ──(owned by)──▶  OwnershipTable: [node, node, ...] (priority order)
//!      │  token & 0xff
//!      ▼
//!   ShardId (SM token, 0..256)  ──▶  ObjectLocationTable: (shard, tier) -> DiskId
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Fine-grained keyspace partition, the unit of ownership.
pub type FineToken = u32;

/// Coarse group of fine tokens (SM token), the unit of migration
/// scheduling and of disk placement.
pub type ShardId = u32;

/// Local disk identifier.
pub type DiskId = u16;

/// Version of the cluster-wide ownership table.
pub type OwnershipVersion = u64;

/// Volume identifier carried in object reference counts.
pub type VolumeId = u64;

/// Identity of a migration executor, shared with its remote client.
pub type ExecutorId = u64;

/// Number of shards in the keyspace.
pub const SHARD_COUNT: usize = 256;

/// Mask extracting the shard from a fine token.
pub const SHARD_MASK: u32 = 0xff;

/// Version value meaning "no ownership table".
pub const INVALID_VERSION: OwnershipVersion = 0;

/// Upper bound on the token bit width of an ownership table.
pub const MAX_TOKEN_BITS: u32 = 24;

/// Get the shard a fine token belongs to.
pub fn shard_for_token(token: FineToken) -> ShardId {
    token & SHARD_MASK
}

/// Get the fine token of an object for a table with `token_bits` bits.
pub fn fine_token(object_id: &ObjectId, token_bits: u32) -> FineToken {
    if token_bits == 0 {
        return 0;
    }
    let bits = token_bits.min(MAX_TOKEN_BITS);
    (object_id.prefix_u64() >> (64 - bits)) as FineToken
}

/// Compose a cluster-unique executor id from the node id and a node-local counter.
///
/// The high 32 bits of the node id are kept so ids from different nodes
/// never collide on a shared client map.
pub fn executor_id(node_id: NodeId, local_id: u32) -> ExecutorId {
    (node_id & 0xFFFF_FFFF_0000_0000) | u64::from(local_id)
}

/// Storage tier of a local disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataTier {
    /// Rotational disks.
    Hdd,
    /// Flash disks.
    Ssd,
}

impl DataTier {
    /// All tiers, in on-disk table order.
    pub const ALL: [DataTier; 2] = [DataTier::Hdd, DataTier::Ssd];

    /// Row index of this tier in the placement tables.
    pub fn index(self) -> usize {
        match self {
            DataTier::Hdd => 0,
            DataTier::Ssd => 1,
        }
    }
}

impl fmt::Display for DataTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataTier::Hdd => write!(f, "hdd"),
            DataTier::Ssd => write!(f, "ssd"),
        }
    }
}

/// Content address of an object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 16]);

impl ObjectId {
    /// Size of an object id in bytes.
    pub const LEN: usize = 16;

    /// Wrap raw id bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive the content address of an object's data.
    pub fn for_content(data: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        for (lane, seed) in [0u64, 0x9e37_79b9_7f4a_7c15].iter().enumerate() {
            let mut hasher = XxHash64::with_seed(*seed);
            hasher.write(data);
            let digest = hasher.finish().to_be_bytes();
            bytes[lane * 8..lane * 8 + 8].copy_from_slice(&digest);
        }
        Self(bytes)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    fn prefix_u64(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(prefix)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fine_token_uses_top_bits() {
        let mut raw = [0u8; 16];
        raw[0] = 0xab;
        raw[1] = 0xcd;
        let id = ObjectId::from_bytes(raw);

        assert_eq!(fine_token(&id, 8), 0xab);
        assert_eq!(fine_token(&id, 12), 0xabc);
        assert_eq!(fine_token(&id, 16), 0xabcd);
        assert_eq!(fine_token(&id, 0), 0);
    }

    #[test]
    fn test_shard_for_token() {
        assert_eq!(shard_for_token(5), 5);
        assert_eq!(shard_for_token(0x105), 5);
        assert_eq!(shard_for_token(0xabcd), 0xcd);
    }

    #[test]
    fn test_executor_id_keeps_node_high_bits() {
        let node: NodeId = 0x1234_5678_9abc_def0;
        let id = executor_id(node, 7);
        assert_eq!(id >> 32, 0x1234_5678);
        assert_eq!(id & 0xFFFF_FFFF, 7);
    }

    #[test]
    fn test_content_address_is_stable() {
        let a = ObjectId::for_content(b"hello");
        let b = ObjectId::for_content(b"hello");
        let c = ObjectId::for_content(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 32);
    }
}
