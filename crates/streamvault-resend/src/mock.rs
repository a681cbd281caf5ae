//! Scriptable transport and tracker for unit tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use streamvault_core::{
    MessageId, NodeId, ResendRequest, StreamMessage, StreamPartKey, UnicastMessage,
};
use tokio::sync::broadcast;

use crate::transport::{NodeEvent, NodeToNode, StorageNodesResponse, TrackerClient};
use crate::TransportError;

pub fn envelope(request_id: &str, timestamp: i64) -> UnicastMessage {
    UnicastMessage::new(
        request_id,
        StreamMessage::new(
            MessageId {
                stream_id: "s".into(),
                partition: 0,
                timestamp,
                sequence_no: 0,
                publisher_id: "p".into(),
                msg_chain_id: "c".into(),
            },
            None,
            json!({}),
        ),
    )
}

/// Records sends and replays scripted events when a node is asked.
pub struct MockTransport {
    events: broadcast::Sender<NodeEvent>,
    scripts: Mutex<HashMap<NodeId, Vec<NodeEvent>>>,
    failing_sends: Mutex<HashSet<NodeId>>,
    unreachable: Mutex<HashSet<NodeId>>,
    sent: Mutex<Vec<(NodeId, ResendRequest)>>,
    connected: Mutex<Vec<NodeId>>,
    disconnected: Mutex<Vec<NodeId>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            scripts: Mutex::new(HashMap::new()),
            failing_sends: Mutex::new(HashSet::new()),
            unreachable: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            connected: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        }
    }

    /// Events emitted as soon as `node` is sent a request.
    pub fn script(&self, node: &NodeId, events: Vec<NodeEvent>) {
        self.scripts.lock().insert(node.clone(), events);
    }

    pub fn fail_sends_to(&self, node: &NodeId) {
        self.failing_sends.lock().insert(node.clone());
    }

    pub fn make_unreachable(&self, node: &NodeId) {
        self.unreachable.lock().insert(node.clone());
    }

    pub fn sends_to(&self, node: &NodeId) -> usize {
        self.sent.lock().iter().filter(|(to, _)| to == node).count()
    }

    pub fn total_sends(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn connected(&self) -> Vec<NodeId> {
        self.connected.lock().clone()
    }

    pub fn disconnected(&self) -> Vec<NodeId> {
        self.disconnected.lock().clone()
    }
}

#[async_trait]
impl NodeToNode for MockTransport {
    async fn send(&self, node: &NodeId, request: &ResendRequest) -> Result<(), TransportError> {
        self.sent.lock().push((node.clone(), request.clone()));
        if self.failing_sends.lock().contains(node) {
            return Err(TransportError::SendFailed {
                node: node.clone(),
                reason: "scripted failure".into(),
            });
        }
        let scripted = self.scripts.lock().get(node).cloned().unwrap_or_default();
        for event in scripted {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn connect_to_node(&self, node: &NodeId) -> Result<NodeId, TransportError> {
        if self.unreachable.lock().contains(node) {
            return Err(TransportError::ConnectFailed {
                node: node.clone(),
                reason: "scripted failure".into(),
            });
        }
        self.connected.lock().push(node.clone());
        Ok(node.clone())
    }

    async fn disconnect_from_node(&self, node: &NodeId, _reason: &str) {
        self.disconnected.lock().push(node.clone());
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}

/// Tracker that answers only when told to.
pub struct MockTracker {
    responses: broadcast::Sender<StorageNodesResponse>,
    requests: Mutex<Vec<StreamPartKey>>,
    fail_requests: Mutex<bool>,
}

impl MockTracker {
    pub fn new() -> Self {
        let (responses, _) = broadcast::channel(16);
        Self {
            responses,
            requests: Mutex::new(Vec::new()),
            fail_requests: Mutex::new(false),
        }
    }

    pub fn answer(&self, key: StreamPartKey, nodes: &[&str]) {
        let _ = self.responses.send(StorageNodesResponse {
            stream_part: key,
            nodes: nodes.iter().map(|id| NodeId::from(*id)).collect(),
        });
    }

    pub fn fail_requests(&self) {
        *self.fail_requests.lock() = true;
    }

    pub fn requests(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl TrackerClient for MockTracker {
    async fn send_storage_nodes_request(&self, key: &StreamPartKey) -> Result<(), TransportError> {
        self.requests.lock().push(key.clone());
        if *self.fail_requests.lock() {
            return Err(TransportError::NoTracker(key.to_string()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageNodesResponse> {
        self.responses.subscribe()
    }
}
