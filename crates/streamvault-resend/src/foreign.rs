//! Resends served by storage nodes located through the tracker.
//!
//! A locally-originated request is parked until the tracker names the
//! storage nodes of its stream-part. The first node that accepts a
//! connection then serves every parked request for that stream-part through
//! a single-try proxied session. A connection opened only for resends is
//! closed after its last session, unless a subscription still uses it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use streamvault_core::{NodeId, ResendRequest, StreamPartKey};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bookkeeper::PendingTrackerLookups;
use crate::proxied::{ProxiedConfig, ProxiedResend};
use crate::transport::{NodeToNode, StorageNodesResponse, SubscriptionCheck, TrackerClient};
use crate::response::RELAY_BUFFER;
use crate::{ResendError, ResendStrategy, ResponseStream};

pub struct ForeignResendStrategy {
    inner: Arc<ForeignInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct ForeignInner {
    tracker: Arc<dyn TrackerClient>,
    transport: Arc<dyn NodeToNode>,
    is_subscribed_to: SubscriptionCheck,
    config: ProxiedConfig,
    pending: PendingTrackerLookups,
    /// Proxied sessions per storage node
    sessions: Mutex<HashMap<NodeId, HashMap<u64, ProxiedResend>>>,
    next_session: AtomicU64,
}

impl ForeignResendStrategy {
    /// Starts listening for tracker answers. Must be called from within a
    /// tokio runtime.
    ///
    /// `timeout` bounds both the tracker lookup and the silence tolerated
    /// from the chosen storage node.
    pub fn new(
        tracker: Arc<dyn TrackerClient>,
        transport: Arc<dyn NodeToNode>,
        is_subscribed_to: SubscriptionCheck,
        timeout: std::time::Duration,
    ) -> Self {
        let mut answers = tracker.subscribe();
        let inner = Arc::new(ForeignInner {
            tracker,
            transport,
            is_subscribed_to,
            config: ProxiedConfig {
                max_tries: 1,
                timeout,
            },
            pending: PendingTrackerLookups::new(timeout),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        let listener = tokio::spawn(async move {
            loop {
                match answers.recv().await {
                    Ok(answer) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        ForeignInner::on_storage_nodes(&inner, answer).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed storage node answers from tracker");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            inner,
            listener: Mutex::new(Some(listener)),
        }
    }

    pub fn pending_lookups(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().values().map(HashMap::len).sum()
    }
}

impl ResendStrategy for ForeignResendStrategy {
    fn name(&self) -> &'static str {
        "foreign"
    }

    fn serve(
        &self,
        request: &ResendRequest,
        source: Option<&NodeId>,
    ) -> Result<ResponseStream, ResendError> {
        // Only requests originating here; relayed ones would loop
        if source.is_some() {
            return Ok(ResponseStream::empty());
        }

        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        let key = request.stream_part();
        let entry = self.inner.pending.add(request.clone(), tx);

        let inner = Arc::clone(&self.inner);
        let request_id = request.request_id.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.tracker.send_storage_nodes_request(&key).await {
                warn!(stream_part = %key, request_id = %request_id, error = %e, "Failed to ask tracker for storage nodes");
                inner.pending.remove(&key, entry);
            }
        });

        Ok(ResponseStream::from_channel(rx))
    }

    fn stop(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        // Drained sessions no longer reach `session_done`, so their
        // resend-only connections are closed here
        let drained: Vec<(NodeId, HashMap<u64, ProxiedResend>)> =
            self.inner.sessions.lock().drain().collect();
        let mut cancelled = 0;
        for (node, sessions) in drained {
            for session in sessions.values() {
                session.cancel();
                cancelled += 1;
            }
            if !(self.inner.is_subscribed_to)(&node) {
                let transport = Arc::clone(&self.inner.transport);
                tokio::spawn(async move {
                    transport.disconnect_from_node(&node, "resend stopped").await;
                });
            }
        }
        self.inner.pending.clear_all();
        info!(cancelled, "Foreign resend strategy stopped");
    }
}

impl Drop for ForeignResendStrategy {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

impl ForeignInner {
    async fn on_storage_nodes(this: &Arc<Self>, answer: StorageNodesResponse) {
        let entries = this.pending.pop(&answer.stream_part);
        if entries.is_empty() {
            return;
        }

        let mut storage_node = None;
        for candidate in &answer.nodes {
            match this.transport.connect_to_node(candidate).await {
                Ok(connected) => {
                    storage_node = Some(connected);
                    break;
                }
                Err(e) => {
                    debug!(node = %candidate, error = %e, "Storage node unreachable");
                }
            }
        }

        let Some(node) = storage_node else {
            warn!(
                stream_part = %answer.stream_part,
                candidates = answer.nodes.len(),
                requests = entries.len(),
                "No storage node reachable"
            );
            return;
        };

        let mut sessions = this.sessions.lock();
        for (request, sink) in entries {
            let id = this.next_session.fetch_add(1, Ordering::Relaxed);
            let single = node.clone();
            let done_node = node.clone();
            let weak = Arc::downgrade(this);
            let session = ProxiedResend::start(
                request,
                sink,
                Arc::clone(&this.transport),
                Arc::new(move |_: &StreamPartKey| vec![single.clone()]),
                this.config,
                move |_| session_done(weak, done_node, id),
            );
            sessions.entry(node.clone()).or_default().insert(id, session);
        }
    }
}

fn session_done(inner: Weak<ForeignInner>, node: NodeId, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let idle = {
        let mut sessions = inner.sessions.lock();
        let Some(of_node) = sessions.get_mut(&node) else {
            return;
        };
        of_node.remove(&id);
        let idle = of_node.is_empty();
        if idle {
            sessions.remove(&node);
        }
        idle
    };

    if idle && !(inner.is_subscribed_to)(&node) {
        let transport = Arc::clone(&inner.transport);
        tokio::spawn(async move {
            transport.disconnect_from_node(&node, "resend done").await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use streamvault_core::{ResendResponse, ResendResponseKind};

    use super::*;
    use crate::mock::{envelope, MockTracker, MockTransport};
    use crate::transport::NodeEvent;

    fn key() -> StreamPartKey {
        StreamPartKey::new("s", 0)
    }

    fn strategy(
        tracker: &Arc<MockTracker>,
        transport: &Arc<MockTransport>,
        subscribed: bool,
    ) -> ForeignResendStrategy {
        ForeignResendStrategy::new(
            tracker.clone(),
            transport.clone(),
            Arc::new(move |_: &NodeId| subscribed),
            Duration::from_secs(20),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn relayed_requests_get_empty_response() {
        let (tracker, transport) = (Arc::new(MockTracker::new()), Arc::new(MockTransport::new()));
        let strategy = strategy(&tracker, &transport, false);

        let received: Vec<_> = strategy
            .serve(&ResendRequest::last("s", 0, "req", 1), Some(&NodeId::from("peer")))
            .unwrap()
            .collect()
            .await;
        assert!(received.is_empty());
        settle().await;
        assert_eq!(tracker.requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_answer_proxies_to_first_reachable_node() {
        let (tracker, transport) = (Arc::new(MockTracker::new()), Arc::new(MockTransport::new()));
        let request = ResendRequest::last("s", 0, "req", 3);
        let storage = NodeId::from("storage-2");
        transport.make_unreachable(&NodeId::from("storage-1"));
        transport.script(
            &storage,
            vec![
                NodeEvent::UnicastReceived {
                    from: storage.clone(),
                    message: envelope("req", 5),
                },
                NodeEvent::ResendResponse {
                    from: storage.clone(),
                    response: ResendResponse::for_request(ResendResponseKind::Resent, &request),
                },
            ],
        );
        let strategy = strategy(&tracker, &transport, false);

        let stream = strategy.serve(&request, None).unwrap();
        settle().await;
        assert_eq!(tracker.requests(), 1);
        assert_eq!(strategy.pending_lookups(), 1);

        tracker.answer(key(), &["storage-1", "storage-2"]);
        let received: Vec<_> = stream.collect().await;
        assert_eq!(received.len(), 1);
        assert_eq!(strategy.pending_lookups(), 0);

        settle().await;
        assert_eq!(strategy.active_sessions(), 0);
        assert_eq!(transport.connected(), vec![storage.clone()]);
        assert_eq!(transport.disconnected(), vec![storage]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribed_node_stays_connected() {
        let (tracker, transport) = (Arc::new(MockTracker::new()), Arc::new(MockTransport::new()));
        let request = ResendRequest::last("s", 0, "req", 3);
        let storage = NodeId::from("storage");
        transport.script(
            &storage,
            vec![NodeEvent::ResendResponse {
                from: storage.clone(),
                response: ResendResponse::for_request(ResendResponseKind::Resent, &request),
            }],
        );
        let strategy = strategy(&tracker, &transport, true);

        let stream = strategy.serve(&request, None).unwrap();
        settle().await;
        tracker.answer(key(), &["storage"]);
        let _: Vec<_> = stream.collect().await;

        settle().await;
        assert!(transport.disconnected().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_nodes_end_responses_empty() {
        let (tracker, transport) = (Arc::new(MockTracker::new()), Arc::new(MockTransport::new()));
        transport.make_unreachable(&NodeId::from("storage"));
        let strategy = strategy(&tracker, &transport, false);

        let first = strategy.serve(&ResendRequest::last("s", 0, "a", 1), None).unwrap();
        let second = strategy.serve(&ResendRequest::last("s", 0, "b", 1), None).unwrap();
        settle().await;
        tracker.answer(key(), &["storage"]);

        assert!(first.collect::<Vec<_>>().await.is_empty());
        assert!(second.collect::<Vec<_>>().await.is_empty());
        assert_eq!(transport.total_sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_tracker_times_out() {
        let (tracker, transport) = (Arc::new(MockTracker::new()), Arc::new(MockTransport::new()));
        let strategy = strategy(&tracker, &transport, false);

        let stream = strategy.serve(&ResendRequest::last("s", 0, "req", 1), None).unwrap();
        assert!(stream.collect::<Vec<_>>().await.is_empty());
        assert_eq!(strategy.pending_lookups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tracker_request_ends_response() {
        let (tracker, transport) = (Arc::new(MockTracker::new()), Arc::new(MockTransport::new()));
        tracker.fail_requests();
        let strategy = strategy(&tracker, &transport, false);

        let stream = strategy.serve(&ResendRequest::last("s", 0, "req", 1), None).unwrap();
        assert!(stream.collect::<Vec<_>>().await.is_empty());
        assert_eq!(strategy.pending_lookups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_lookups_and_sessions() {
        let (tracker, transport) = (Arc::new(MockTracker::new()), Arc::new(MockTransport::new()));
        let strategy = strategy(&tracker, &transport, false);

        let waiting = strategy.serve(&ResendRequest::last("s", 0, "a", 1), None).unwrap();
        let proxied = strategy
            .serve(&ResendRequest::last("other", 0, "b", 1), None)
            .unwrap();
        settle().await;
        tracker.answer(StreamPartKey::new("other", 0), &["storage"]);
        settle().await;
        assert_eq!(strategy.active_sessions(), 1);
        assert_eq!(strategy.pending_lookups(), 1);

        strategy.stop();
        assert!(waiting.collect::<Vec<_>>().await.is_empty());
        assert!(proxied.collect::<Vec<_>>().await.is_empty());
        assert_eq!(strategy.pending_lookups(), 0);
        settle().await;
        assert_eq!(strategy.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_disconnects_resend_only_node() {
        let (tracker, transport) = (Arc::new(MockTracker::new()), Arc::new(MockTransport::new()));
        let strategy = strategy(&tracker, &transport, false);

        let stream = strategy.serve(&ResendRequest::last("s", 0, "req", 1), None).unwrap();
        settle().await;
        tracker.answer(key(), &["storage"]);
        settle().await;
        assert_eq!(strategy.active_sessions(), 1);

        strategy.stop();
        assert!(stream.collect::<Vec<_>>().await.is_empty());
        settle().await;
        assert_eq!(transport.disconnected(), vec![NodeId::from("storage")]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_subscribed_node_connected() {
        let (tracker, transport) = (Arc::new(MockTracker::new()), Arc::new(MockTransport::new()));
        let strategy = strategy(&tracker, &transport, true);

        let stream = strategy.serve(&ResendRequest::last("s", 0, "req", 1), None).unwrap();
        settle().await;
        tracker.answer(key(), &["storage"]);
        settle().await;

        strategy.stop();
        assert!(stream.collect::<Vec<_>>().await.is_empty());
        settle().await;
        assert!(transport.disconnected().is_empty());
    }
}
