//! Cluster ownership table: fine token -> ordered list of responsible nodes.
//!
//! The table is computed and distributed by the cluster orchestrator. This
//! node only reads it: to find the tokens it owns, to pick resync sources, and
//! to break ties between two peers that are each other's source.
//!
//! ```text
//!  token │ nodes (priority order)
//!  ──────┼────────────────────────
//!      0 │ [n3, n1, n2]
//!      1 │ [n1, n2, n3]
//!    ... │ ...
//! ```

use crate::error::{Error, Result};
use crate::types::{shard_for_token, FineToken, NodeId, OwnershipVersion, ShardId, MAX_TOKEN_BITS};
use std::collections::BTreeSet;

/// Versioned mapping from fine tokens to responsible nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipTable {
    version: OwnershipVersion,
    token_bits: u32,
    nodes: Vec<Vec<NodeId>>,
}

impl OwnershipTable {
    /// Create an empty table with `2^token_bits` fine tokens.
    pub fn new(version: OwnershipVersion, token_bits: u32) -> Result<Self> {
        if token_bits == 0 || token_bits > MAX_TOKEN_BITS {
            return Err(Error::Config(format!(
                "token bits must be in 1..={}, got {}",
                MAX_TOKEN_BITS, token_bits
            )));
        }
        Ok(Self {
            version,
            token_bits,
            nodes: vec![Vec::new(); 1usize << token_bits],
        })
    }

    /// Build a table that assigns `replicas` consecutive nodes to each token,
    /// rotating the starting node per token.
    #[cfg(test)]
    pub(crate) fn round_robin(
        version: OwnershipVersion,
        token_bits: u32,
        nodes: &[NodeId],
        replicas: usize,
    ) -> Result<Self> {
        let mut table = Self::new(version, token_bits)?;
        if nodes.is_empty() {
            return Ok(table);
        }
        let replicas = replicas.clamp(1, nodes.len());
        for (token, list) in table.nodes.iter_mut().enumerate() {
            *list = (0..replicas)
                .map(|r| nodes[(token + r) % nodes.len()])
                .collect();
        }
        Ok(table)
    }

    /// Replace the node list of one token.
    pub fn set_token_nodes(&mut self, token: FineToken, nodes: Vec<NodeId>) -> Result<()> {
        let slot = self
            .nodes
            .get_mut(token as usize)
            .ok_or_else(|| Error::Config(format!("token {} out of range", token)))?;
        *slot = nodes;
        Ok(())
    }

    /// Table version.
    pub fn version(&self) -> OwnershipVersion {
        self.version
    }

    /// Token bit width.
    pub fn token_bits(&self) -> u32 {
        self.token_bits
    }

    /// Number of fine tokens.
    pub fn token_count(&self) -> usize {
        self.nodes.len()
    }

    /// Responsible nodes of a token, highest priority first.
    pub fn nodes_for_token(&self, token: FineToken) -> &[NodeId] {
        self.nodes
            .get(token as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Primary node of a token.
    pub fn primary_for_token(&self, token: FineToken) -> Option<NodeId> {
        self.nodes_for_token(token).first().copied()
    }

    /// Position of `node` in the token's priority list.
    pub fn priority_of(&self, token: FineToken, node: NodeId) -> Option<usize> {
        self.nodes_for_token(token).iter().position(|n| *n == node)
    }

    /// Which of `a` and `b` appears first in the token's priority list.
    ///
    /// Returns `None` when neither is responsible for the token.
    pub fn prefers(&self, token: FineToken, a: NodeId, b: NodeId) -> Option<NodeId> {
        self.nodes_for_token(token)
            .iter()
            .find(|n| **n == a || **n == b)
            .copied()
    }

    /// All fine tokens `node` is responsible for.
    pub fn tokens_for_node(&self, node: NodeId) -> BTreeSet<FineToken> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, list)| list.contains(&node))
            .map(|(token, _)| token as FineToken)
            .collect()
    }

    /// Shards containing at least one fine token `node` is responsible for.
    pub fn shards_for_node(&self, node: NodeId) -> BTreeSet<ShardId> {
        self.tokens_for_node(node)
            .into_iter()
            .map(shard_for_token)
            .collect()
    }

    /// Highest-priority node other than `node` for a token.
    pub fn best_peer(&self, token: FineToken, node: NodeId) -> Option<NodeId> {
        self.nodes_for_token(token)
            .iter()
            .find(|n| **n != node)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_assignment() {
        let table = OwnershipTable::round_robin(1, 4, &[1, 2, 3], 2).unwrap();
        assert_eq!(table.token_count(), 16);
        assert_eq!(table.nodes_for_token(0), &[1, 2]);
        assert_eq!(table.nodes_for_token(1), &[2, 3]);
        assert_eq!(table.nodes_for_token(2), &[3, 1]);
        assert_eq!(table.primary_for_token(3), Some(1));
    }

    #[test]
    fn test_tokens_and_shards_for_node() {
        let table = OwnershipTable::round_robin(1, 2, &[1, 2], 1).unwrap();
        assert_eq!(table.tokens_for_node(1), BTreeSet::from([0, 2]));
        assert_eq!(table.tokens_for_node(2), BTreeSet::from([1, 3]));
        assert_eq!(table.shards_for_node(1), BTreeSet::from([0, 2]));
        assert_eq!(table.priority_of(0, 1), Some(0));
        assert_eq!(table.priority_of(0, 2), None);

        // Tokens 0x001 and 0x101 share shard 1.
        let mut wide = OwnershipTable::new(2, 10).unwrap();
        wide.set_token_nodes(0x001, vec![5]).unwrap();
        wide.set_token_nodes(0x101, vec![5]).unwrap();
        wide.set_token_nodes(0x0ff, vec![6, 5]).unwrap();
        assert_eq!(wide.shards_for_node(5), BTreeSet::from([1, 0xff]));
        assert!(wide.shards_for_node(7).is_empty());
    }

    #[test]
    fn test_prefers_is_pure_priority_order() {
        let mut table = OwnershipTable::new(3, 2).unwrap();
        table.set_token_nodes(1, vec![9, 4, 7]).unwrap();

        assert_eq!(table.prefers(1, 4, 7), Some(4));
        assert_eq!(table.prefers(1, 7, 4), Some(4));
        assert_eq!(table.prefers(1, 7, 9), Some(9));
        assert_eq!(table.prefers(1, 5, 6), None);
        assert_eq!(table.best_peer(1, 9), Some(4));
        assert_eq!(table.best_peer(1, 4), Some(9));
    }

    #[test]
    fn test_invalid_token_bits() {
        assert!(OwnershipTable::new(1, 0).is_err());
        assert!(OwnershipTable::new(1, 25).is_err());
        let mut table = OwnershipTable::new(1, 2).unwrap();
        assert!(table.set_token_nodes(4, vec![1]).is_err());
    }
}
