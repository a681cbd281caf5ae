use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use streamvault_core::{NodeId, ResendRequest};
use tokio::sync::mpsc;
use tracing::debug;

use crate::proxied::{ProxiedConfig, ProxiedResend};
use crate::transport::{NeighborSource, NodeToNode};
use crate::response::RELAY_BUFFER;
use crate::{ResendError, ResendStrategy, ResponseStream};

/// Proxies locally-originated resends through neighbors of the stream.
/// Requests relayed by other nodes are not forwarded again.
pub struct AskNeighborsResendStrategy {
    transport: Arc<dyn NodeToNode>,
    neighbors: NeighborSource,
    config: ProxiedConfig,
    sessions: Arc<Mutex<HashMap<u64, ProxiedResend>>>,
    next_session: AtomicU64,
}

impl AskNeighborsResendStrategy {
    pub fn new(
        transport: Arc<dyn NodeToNode>,
        neighbors: NeighborSource,
        config: ProxiedConfig,
    ) -> Self {
        Self {
            transport,
            neighbors,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session: AtomicU64::new(0),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl ResendStrategy for AskNeighborsResendStrategy {
    fn name(&self) -> &'static str {
        "ask_neighbors"
    }

    fn serve(
        &self,
        request: &ResendRequest,
        source: Option<&NodeId>,
    ) -> Result<ResponseStream, ResendError> {
        if source.is_some() {
            return Ok(ResponseStream::empty());
        }

        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        // Held across start so an immediate finish cannot run before insert
        let mut sessions = self.sessions.lock();
        let registry = Arc::downgrade(&self.sessions);
        let session = ProxiedResend::start(
            request.clone(),
            tx,
            Arc::clone(&self.transport),
            Arc::clone(&self.neighbors),
            self.config,
            move |_| {
                if let Some(registry) = registry.upgrade() {
                    registry.lock().remove(&id);
                }
            },
        );
        sessions.insert(id, session);
        debug!(request_id = %request.request_id, session = id, "Asking neighbors");
        Ok(ResponseStream::from_channel(rx))
    }

    fn stop(&self) {
        let sessions: Vec<ProxiedResend> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use streamvault_core::{ResendResponse, ResendResponseKind, StreamPartKey};

    use super::*;
    use crate::mock::{envelope, MockTransport};
    use crate::transport::NodeEvent;

    fn strategy(transport: Arc<MockTransport>) -> AskNeighborsResendStrategy {
        AskNeighborsResendStrategy::new(
            transport,
            Arc::new(|_: &StreamPartKey| vec![NodeId::from("n1"), NodeId::from("n2")]),
            ProxiedConfig {
                max_tries: 3,
                timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn relayed_requests_are_not_forwarded() {
        let transport = Arc::new(MockTransport::new());
        let strategy = strategy(transport.clone());
        let request = ResendRequest::last("s", 0, "req", 5);

        let received: Vec<_> = strategy
            .serve(&request, Some(&NodeId::from("peer")))
            .unwrap()
            .collect()
            .await;
        assert!(received.is_empty());
        assert_eq!(transport.total_sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn local_request_is_proxied_and_session_released() {
        let transport = Arc::new(MockTransport::new());
        let n1 = NodeId::from("n1");
        let request = ResendRequest::last("s", 0, "req", 5);
        transport.script(
            &n1,
            vec![
                NodeEvent::UnicastReceived {
                    from: n1.clone(),
                    message: envelope("req", 42),
                },
                NodeEvent::ResendResponse {
                    from: n1.clone(),
                    response: ResendResponse::for_request(ResendResponseKind::Resent, &request),
                },
            ],
        );
        let strategy = strategy(transport.clone());

        let received: Vec<_> = strategy.serve(&request, None).unwrap().collect().await;
        assert_eq!(received.len(), 1);
        tokio::task::yield_now().await;
        assert_eq!(strategy.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_sessions() {
        let transport = Arc::new(MockTransport::new());
        let strategy = strategy(transport.clone());
        let stream = strategy
            .serve(&ResendRequest::last("s", 0, "req", 5), None)
            .unwrap();
        assert_eq!(strategy.active_sessions(), 1);

        strategy.stop();
        let received: Vec<_> = stream.collect().await;
        assert!(received.is_empty());
        assert_eq!(strategy.active_sessions(), 0);
        assert!(transport.total_sends() <= 1);
    }
}
