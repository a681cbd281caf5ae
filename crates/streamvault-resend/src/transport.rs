//! Contracts with the peer transport and the tracker.

use std::sync::Arc;

use async_trait::async_trait;
use streamvault_core::{NodeId, ResendRequest, ResendResponse, StreamPartKey, UnicastMessage};
use tokio::sync::broadcast;

use crate::TransportError;

/// Inbound traffic relevant to proxied resends.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    UnicastReceived {
        from: NodeId,
        message: UnicastMessage,
    },
    ResendResponse {
        from: NodeId,
        response: ResendResponse,
    },
    NodeDisconnected(NodeId),
}

/// Node-to-node messaging.
///
/// Events are delivered to every subscriber; a subscriber only sees events
/// published after it subscribed.
#[async_trait]
pub trait NodeToNode: Send + Sync + 'static {
    /// Forwards a resend request. `Ok` means the peer accepted it.
    async fn send(&self, node: &NodeId, request: &ResendRequest) -> Result<(), TransportError>;

    /// Opens (or reuses) a connection and returns the connected node's id.
    async fn connect_to_node(&self, node: &NodeId) -> Result<NodeId, TransportError>;

    async fn disconnect_from_node(&self, node: &NodeId, reason: &str);

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent>;
}

/// Tracker answer listing the nodes that store a stream-part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageNodesResponse {
    pub stream_part: StreamPartKey,
    pub nodes: Vec<NodeId>,
}

/// Client of the topology service. Answers arrive asynchronously on
/// `subscribe`, correlated by stream-part.
#[async_trait]
pub trait TrackerClient: Send + Sync + 'static {
    async fn send_storage_nodes_request(&self, key: &StreamPartKey) -> Result<(), TransportError>;

    fn subscribe(&self) -> broadcast::Receiver<StorageNodesResponse>;
}

/// Candidate neighbors for a stream-part. Re-evaluated on every failover.
pub type NeighborSource = Arc<dyn Fn(&StreamPartKey) -> Vec<NodeId> + Send + Sync>;

/// Whether this node still holds a subscription through `node`.
pub type SubscriptionCheck = Arc<dyn Fn(&NodeId) -> bool + Send + Sync>;
