//! Shared fixtures for node-level integration tests
//!
//! Provides:
//! - message builders for a single stream-part
//! - a node configuration with small buckets and short timers
//! - `PeerNetwork`, a scripted peer transport
//! - `Tracker`, a tracker that answers only when told to
//! - helpers to drain a resend into a readable transcript

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use streamvault::Node;
use streamvault_config::RuntimeConfig;
use streamvault_core::{
    MessageId, NodeId, ResendRequest, ResendResponse, ResendResponseKind, StreamMessage,
    StreamPartKey, UnicastMessage,
};
use streamvault_resend::{
    NodeEvent, NodeToNode, ResendOutput, ResendOutputStream, StorageNodesResponse, TrackerClient,
    TransportError,
};
use streamvault_storage::MemoryBackend;
use tokio::sync::broadcast;

pub const STREAM: &str = "sensor-readings";

pub fn stream_part() -> StreamPartKey {
    StreamPartKey::new(STREAM, 0)
}

pub fn message(timestamp: i64, sequence_no: u32, publisher: &str) -> StreamMessage {
    StreamMessage::new(
        MessageId {
            stream_id: STREAM.into(),
            partition: 0,
            timestamp,
            sequence_no,
            publisher_id: publisher.into(),
            msg_chain_id: "chain".into(),
        },
        None,
        json!({ "reading": timestamp, "seq": sequence_no }),
    )
}

/// One record per bucket, so every write after the first rolls over.
pub fn node_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.node.node_id = "node-under-test".into();
    config.bucket.max_bucket_records = 1;
    config.bucket.almost_full_percent = 100;
    config.bucket.check_full_interval_ms = 100;
    config.bucket.store_interval_ms = 100;
    config.batch.close_timeout_ms = 50;
    config.storage.write_retry_interval_ms = 50;
    config.resend.neighbor_timeout_ms = 1_000;
    config.resend.tracker_timeout_ms = 2_000;
    config
}

pub fn standalone_node() -> (Arc<MemoryBackend>, Node) {
    standalone_node_with(node_config())
}

pub fn standalone_node_with(config: RuntimeConfig) -> (Arc<MemoryBackend>, Node) {
    let backend = Arc::new(MemoryBackend::new());
    let node = Node::builder(config, backend.clone())
        .build()
        .expect("standalone node builds");
    (backend, node)
}

/// Writes each message and waits until buckets counters are persisted.
pub async fn write_all(node: &Node, messages: &[StreamMessage]) {
    for message in messages {
        node.write(message.clone()).await.expect("write lands");
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// Polls `condition` on virtual time until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Kinds and timestamps in delivery order, e.g. `["Resending", "1000", "Resent"]`.
pub async fn transcript(stream: ResendOutputStream) -> Vec<String> {
    stream
        .map(|output| match output {
            ResendOutput::Response(response) => format!("{:?}", response.kind),
            ResendOutput::Unicast(unicast) => unicast.message.timestamp().to_string(),
        })
        .collect()
        .await
}

/// What a peer answers when asked for a request.
#[derive(Clone)]
pub enum PeerReply {
    Messages(Vec<i64>),
    Nothing,
    Silent,
}

/// Peers that answer resend requests from a script.
pub struct PeerNetwork {
    events: broadcast::Sender<NodeEvent>,
    replies: Mutex<HashMap<NodeId, PeerReply>>,
    unreachable: Mutex<Vec<NodeId>>,
    asked: Mutex<Vec<(NodeId, String)>>,
    disconnected: Mutex<Vec<NodeId>>,
}

impl PeerNetwork {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            events,
            replies: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(Vec::new()),
            asked: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        })
    }

    pub fn reply(&self, node: &str, reply: PeerReply) {
        self.replies.lock().insert(NodeId::from(node), reply);
    }

    pub fn make_unreachable(&self, node: &str) {
        self.unreachable.lock().push(NodeId::from(node));
    }

    /// Nodes asked, in order.
    pub fn asked(&self) -> Vec<String> {
        self.asked
            .lock()
            .iter()
            .map(|(node, _)| node.to_string())
            .collect()
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected
            .lock()
            .iter()
            .map(NodeId::to_string)
            .collect()
    }

    pub fn announce_disconnect(&self, node: &str) {
        let _ = self
            .events
            .send(NodeEvent::NodeDisconnected(NodeId::from(node)));
    }
}

#[async_trait]
impl NodeToNode for PeerNetwork {
    async fn send(&self, node: &NodeId, request: &ResendRequest) -> Result<(), TransportError> {
        self.asked
            .lock()
            .push((node.clone(), request.request_id.clone()));
        let reply = self.replies.lock().get(node).cloned();
        let respond = |kind| NodeEvent::ResendResponse {
            from: node.clone(),
            response: ResendResponse::for_request(kind, request),
        };

        match reply {
            Some(PeerReply::Messages(timestamps)) => {
                let _ = self.events.send(respond(ResendResponseKind::Resending));
                for ts in timestamps {
                    let _ = self.events.send(NodeEvent::UnicastReceived {
                        from: node.clone(),
                        message: UnicastMessage::new(
                            request.request_id.clone(),
                            message(ts, 0, "remote"),
                        ),
                    });
                }
                let _ = self.events.send(respond(ResendResponseKind::Resent));
            }
            Some(PeerReply::Nothing) => {
                let _ = self.events.send(respond(ResendResponseKind::NoResend));
            }
            Some(PeerReply::Silent) => {}
            None => {
                return Err(TransportError::NotConnected(node.clone()));
            }
        }
        Ok(())
    }

    async fn connect_to_node(&self, node: &NodeId) -> Result<NodeId, TransportError> {
        if self.unreachable.lock().contains(node) {
            return Err(TransportError::ConnectFailed {
                node: node.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(node.clone())
    }

    async fn disconnect_from_node(&self, node: &NodeId, _reason: &str) {
        self.disconnected.lock().push(node.clone());
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}

pub struct Tracker {
    responses: broadcast::Sender<StorageNodesResponse>,
    requests: Mutex<Vec<StreamPartKey>>,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        let (responses, _) = broadcast::channel(64);
        Arc::new(Self {
            responses,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn answer(&self, nodes: &[&str]) {
        let _ = self.responses.send(StorageNodesResponse {
            stream_part: stream_part(),
            nodes: nodes.iter().map(|node| NodeId::from(*node)).collect(),
        });
    }
}

#[async_trait]
impl TrackerClient for Tracker {
    async fn send_storage_nodes_request(&self, key: &StreamPartKey) -> Result<(), TransportError> {
        self.requests.lock().push(key.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageNodesResponse> {
        self.responses.subscribe()
    }
}
