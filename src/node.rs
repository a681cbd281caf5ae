// Storage node wiring: store plus resend strategies

use std::sync::Arc;

use anyhow::{bail, Result};
use streamvault_config::RuntimeConfig;
use streamvault_core::{NodeId, ResendRequest, StreamMessage};
use streamvault_resend::{
    AskNeighborsResendStrategy, ForeignResendStrategy, LocalResendStrategy, NeighborSource,
    NodeToNode, ProxiedConfig, ResendError, ResendHandler, ResendOutputStream, ResendStrategy,
    SubscriptionCheck, TrackerClient,
};
use streamvault_storage::{
    BackingStore, BatchConfig, BatchMetrics, BucketConfig, QueryConfig, Store, StoreConfig,
    WriteHandle,
};
use tracing::info;

/// Translate the file/env configuration into the storage layer's settings
pub fn store_config(config: &RuntimeConfig) -> StoreConfig {
    StoreConfig {
        write_retry_interval: config.storage.write_retry_interval(),
        max_write_retries: config.storage.max_write_retries,
        bucket: BucketConfig {
            max_bucket_bytes: config.bucket.max_bucket_bytes,
            max_bucket_records: config.bucket.max_bucket_records,
            almost_full_percent: config.bucket.almost_full_percent,
            keep_alive: config.bucket.keep_alive(),
            check_full_interval: config.bucket.check_full_interval(),
            store_interval: config.bucket.store_interval(),
        },
        batch: BatchConfig {
            max_bytes: config.batch.max_bytes,
            max_records: config.batch.max_records,
            close_timeout: config.batch.close_timeout(),
            max_retries: config.batch.max_retries,
            retry_interval: config.batch.retry_interval(),
        },
        query: QueryConfig {
            max_resend_last: config.query.max_resend_last,
            last_bucket_window: config.query.last_bucket_window,
            throttle_rows: config.query.throttle_rows,
            page_size: config.query.page_size,
            channel_capacity: config.query.channel_capacity,
        },
    }
}

/// A storage node: accepts writes and answers resend requests.
pub struct Node {
    id: NodeId,
    store: Store,
    handler: ResendHandler,
}

impl Node {
    pub fn builder(config: RuntimeConfig, backend: Arc<dyn BackingStore>) -> NodeBuilder {
        NodeBuilder {
            config,
            backend,
            peers: None,
            tracker: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn write(&self, message: StreamMessage) -> WriteHandle {
        self.store.write(message)
    }

    /// `source` is the peer that relayed the request, `None` for local clients
    pub fn resend(
        &self,
        request: ResendRequest,
        source: Option<NodeId>,
    ) -> Result<ResendOutputStream, ResendError> {
        self.handler.handle_request(request, source)
    }

    /// Cancels resends requested by a peer that went away
    pub fn on_node_disconnected(&self, node: &NodeId) -> usize {
        self.handler.cancel_resends_of_node(node)
    }

    pub fn metrics(&self) -> BatchMetrics {
        self.store.metrics()
    }

    /// Stops resends, then closes the store
    pub fn shutdown(&self) {
        self.handler.stop();
        self.store.close();
        info!(node_id = %self.id, "Node stopped");
    }
}

pub struct NodeBuilder {
    config: RuntimeConfig,
    backend: Arc<dyn BackingStore>,
    peers: Option<(Arc<dyn NodeToNode>, NeighborSource)>,
    tracker: Option<(Arc<dyn TrackerClient>, SubscriptionCheck)>,
}

impl NodeBuilder {
    /// Enables asking stream neighbors for data this node lacks
    pub fn peers(mut self, transport: Arc<dyn NodeToNode>, neighbors: NeighborSource) -> Self {
        self.peers = Some((transport, neighbors));
        self
    }

    /// Enables locating storage nodes through the tracker; requires `peers`
    pub fn tracker(
        mut self,
        tracker: Arc<dyn TrackerClient>,
        is_subscribed_to: SubscriptionCheck,
    ) -> Self {
        self.tracker = Some((tracker, is_subscribed_to));
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Node> {
        let config = &self.config;
        let store = Store::new(self.backend, store_config(config));

        let mut strategies: Vec<Arc<dyn ResendStrategy>> =
            vec![Arc::new(LocalResendStrategy::new(store.clone()))];

        match (self.peers, self.tracker) {
            (None, Some(_)) => bail!("tracker lookups require a peer transport"),
            (None, None) => {}
            (Some((transport, neighbors)), tracker) => {
                strategies.push(Arc::new(AskNeighborsResendStrategy::new(
                    Arc::clone(&transport),
                    neighbors,
                    ProxiedConfig {
                        max_tries: config.resend.max_neighbor_tries,
                        timeout: config.resend.neighbor_timeout(),
                    },
                )));
                if let Some((tracker, is_subscribed_to)) = tracker {
                    strategies.push(Arc::new(ForeignResendStrategy::new(
                        tracker,
                        transport,
                        is_subscribed_to,
                        config.resend.tracker_timeout(),
                    )));
                }
            }
        }

        let names: Vec<&str> = strategies.iter().map(|s| s.name()).collect();
        info!(node_id = %config.node.node_id, strategies = ?names, "Node started");

        Ok(Node {
            id: NodeId::new(config.node.node_id.clone()),
            store,
            handler: ResendHandler::new(strategies),
        })
    }
}
