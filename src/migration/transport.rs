//! Peer transport seam.
//!
//! Filter sets, second-round requests, delta sets and the finish-resync and
//! abort notices are request/response.
//! Forwarded live requests are fire-and-forget: [`RebalanceTransport::forward`]
//! only enqueues and never blocks the IO path.
//!
//! [`LocalNetwork`] wires coordinators in one process. Every message is
//! encoded to bytes and decoded on the receiving side, as it would be on a
//! real link.

use super::coordinator::MigrationCoordinator;
use super::messages::{
    ForwardedRequest, PeerMessage, RebalanceDeltaSet, RebalanceFilterSet, SecondRebalanceRequest,
    SourceResponse,
};
use crate::error::{Result, TransportError};
use crate::types::{ExecutorId, NodeId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

/// Messages a node sends to its migration peers.
#[async_trait]
pub trait RebalanceTransport: Send + Sync + std::fmt::Debug {
    /// Send one filter set to the source and wait for its answer.
    async fn send_filter_set(
        &self,
        source: NodeId,
        filter_set: RebalanceFilterSet,
    ) -> Result<SourceResponse>;

    /// Ask the source to start the second round.
    async fn send_second_rebalance_request(
        &self,
        source: NodeId,
        request: SecondRebalanceRequest,
    ) -> Result<()>;

    /// Deliver a delta set to the destination. Returns once it was applied.
    async fn send_delta_set(&self, destination: NodeId, delta_set: RebalanceDeltaSet)
        -> Result<()>;

    /// Tell the source a resync executor finished with it.
    async fn send_finish_resync(&self, source: NodeId, executor_id: ExecutorId) -> Result<()>;

    /// Tell the destination its source gave up on `executor_id`.
    async fn send_migration_abort(
        &self,
        destination: NodeId,
        executor_id: ExecutorId,
        reason: String,
    ) -> Result<()>;

    /// Enqueue a mirrored live request. Must not block.
    fn forward(&self, destination: NodeId, request: ForwardedRequest) -> Result<()>;
}

/// In-process registry of coordinators, keyed by node id.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    nodes: DashMap<NodeId, Weak<MigrationCoordinator>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a coordinator reachable under its node id.
    pub fn register(&self, coordinator: &Arc<MigrationCoordinator>) {
        self.nodes
            .insert(coordinator.node_id(), Arc::downgrade(coordinator));
    }

    /// Make a node unreachable.
    pub fn disconnect(&self, node: NodeId) {
        self.nodes.remove(&node);
    }

    /// Transport sending from `node`.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node,
            network: Arc::clone(self),
        })
    }

    fn lookup(&self, node: NodeId) -> Result<Arc<MigrationCoordinator>> {
        self.nodes
            .get(&node)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| TransportError::SourceUnreachable(node).into())
    }
}

/// One node's view of a [`LocalNetwork`].
#[derive(Debug)]
pub struct LocalTransport {
    node: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

fn over_the_wire(msg: PeerMessage) -> Result<PeerMessage> {
    PeerMessage::from_bytes(&msg.to_bytes()?)
}

fn unexpected(msg: &PeerMessage) -> crate::error::Error {
    TransportError::SendFailed(format!("unexpected message {:?}", msg)).into()
}

#[async_trait]
impl RebalanceTransport for LocalTransport {
    async fn send_filter_set(
        &self,
        source: NodeId,
        filter_set: RebalanceFilterSet,
    ) -> Result<SourceResponse> {
        let peer = self.network.lookup(source)?;
        let PeerMessage::FilterSet(filter_set) = over_the_wire(PeerMessage::FilterSet(filter_set))?
        else {
            return Err(TransportError::Serialization("filter set".into()).into());
        };
        let response = peer.start_object_rebalance(filter_set, self.node)?;
        match over_the_wire(PeerMessage::FilterSetResponse(response))? {
            PeerMessage::FilterSetResponse(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    async fn send_second_rebalance_request(
        &self,
        source: NodeId,
        request: SecondRebalanceRequest,
    ) -> Result<()> {
        let peer = self.network.lookup(source)?;
        match over_the_wire(PeerMessage::SecondRebalance(request))? {
            PeerMessage::SecondRebalance(request) => {
                peer.start_second_object_rebalance(request, self.node)
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn send_delta_set(
        &self,
        destination: NodeId,
        delta_set: RebalanceDeltaSet,
    ) -> Result<()> {
        let peer = self.network.lookup(destination)?;
        match over_the_wire(PeerMessage::DeltaSet(delta_set))? {
            PeerMessage::DeltaSet(delta_set) => peer.on_delta_set_received(delta_set).await,
            other => Err(unexpected(&other)),
        }
    }

    async fn send_finish_resync(&self, source: NodeId, executor_id: ExecutorId) -> Result<()> {
        let peer = self.network.lookup(source)?;
        match over_the_wire(PeerMessage::FinishResync { executor_id })? {
            PeerMessage::FinishResync { executor_id } => {
                peer.finish_client_resync(executor_id).await;
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn send_migration_abort(
        &self,
        destination: NodeId,
        executor_id: ExecutorId,
        reason: String,
    ) -> Result<()> {
        let peer = self.network.lookup(destination)?;
        match over_the_wire(PeerMessage::MigrationAbort {
            executor_id,
            reason,
        })? {
            PeerMessage::MigrationAbort {
                executor_id,
                reason,
            } => peer.on_source_aborted(executor_id, &reason),
            other => Err(unexpected(&other)),
        }
    }

    fn forward(&self, destination: NodeId, request: ForwardedRequest) -> Result<()> {
        let peer = self.network.lookup(destination)?;
        let bytes = PeerMessage::Forwarded(request).to_bytes()?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        handle.spawn(async move {
            let request = match PeerMessage::from_bytes(&bytes) {
                Ok(PeerMessage::Forwarded(request)) => request,
                Ok(other) => {
                    tracing::error!(message = ?other, "Unexpected forwarded message");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to decode forwarded request");
                    return;
                }
            };
            if let Err(e) = peer.on_forwarded_request(request).await {
                tracing::warn!(error = %e, "Failed to apply forwarded request");
            }
        });
        Ok(())
    }
}
