//! Relays one resend request through neighbors, one at a time.
//!
//! A session asks the first untried candidate and forwards its data
//! downstream until it acknowledges completion. "Nothing to resend", a
//! disconnect or a silent timeout move the session on to the next candidate.
//! It ends when a neighbor completes, candidates or `max_tries` run out, the
//! downstream consumer goes away, or it is cancelled. The whole session runs
//! in a single task, so completion is observed exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use streamvault_core::{NodeId, ResendRequest, ResendResponseKind, UnicastMessage};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::transport::{NeighborSource, NodeEvent, NodeToNode};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxiedOutcome {
    /// A neighbor sent everything and acknowledged completion
    Completed,
    /// Candidates or tries ran out
    Exhausted,
    /// Cancelled, or the downstream consumer went away
    Cancelled,
}

impl ProxiedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxiedConfig {
    pub max_tries: usize,
    /// Silence tolerated from the current neighbor
    pub timeout: Duration,
}

/// Handle to a running session.
pub struct ProxiedResend {
    cancel: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ProxiedResend {
    /// Starts a session. Received envelopes go to `sink`, which is dropped
    /// when the session ends. `on_done` runs once, after the session has
    /// stopped listening for events.
    pub fn start<F>(
        request: ResendRequest,
        sink: mpsc::Sender<UnicastMessage>,
        transport: Arc<dyn NodeToNode>,
        neighbors: NeighborSource,
        config: ProxiedConfig,
        on_done: F,
    ) -> Self
    where
        F: FnOnce(ProxiedOutcome) + Send + 'static,
    {
        let cancel = Arc::new(Notify::new());
        // Subscribe before the first request goes out
        let events = transport.subscribe();
        let session = Session {
            request,
            sink,
            transport,
            neighbors,
            config,
            asked: HashSet::new(),
            current: None,
        };
        let task = tokio::spawn(session.run(events, Arc::clone(&cancel), on_done));
        Self { cancel, task }
    }

    /// Ends the session. Idempotent; a no-op once it has finished.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Session {
    request: ResendRequest,
    sink: mpsc::Sender<UnicastMessage>,
    transport: Arc<dyn NodeToNode>,
    neighbors: NeighborSource,
    config: ProxiedConfig,
    asked: HashSet<NodeId>,
    current: Option<NodeId>,
}

impl Session {
    async fn run<F>(
        mut self,
        mut events: broadcast::Receiver<NodeEvent>,
        cancel: Arc<Notify>,
        on_done: F,
    ) where
        F: FnOnce(ProxiedOutcome),
    {
        let outcome = self.drive(&mut events, &cancel).await;
        drop(events);
        let request_id = self.request.request_id.clone();
        // Ends the downstream sequence
        drop(self);

        counter!("resend.proxied.completed", 1, "outcome" => outcome.as_str());
        debug!(request_id = %request_id, outcome = outcome.as_str(), "Proxied resend finished");
        on_done(outcome);
    }

    async fn drive(
        &mut self,
        events: &mut broadcast::Receiver<NodeEvent>,
        cancel: &Notify,
    ) -> ProxiedOutcome {
        let mut deadline = tokio::select! {
            biased;
            _ = cancel.notified() => return ProxiedOutcome::Cancelled,
            asked = self.ask_next_neighbor() => match asked {
                Some(deadline) => deadline,
                None => return ProxiedOutcome::Exhausted,
            },
        };

        loop {
            let advance = tokio::select! {
                biased;
                _ = cancel.notified() => return ProxiedOutcome::Cancelled,
                _ = self.sink.closed() => return ProxiedOutcome::Cancelled,
                _ = time::sleep_until(deadline) => {
                    warn!(
                        request_id = %self.request.request_id,
                        neighbor = ?self.current,
                        "Neighbor timed out"
                    );
                    true
                }
                event = events.recv() => match event {
                    Ok(event) => match self.on_event(event) {
                        EventAction::Ignore => false,
                        EventAction::Forward(message) => {
                            // Waits while the consumer's buffer is full
                            tokio::select! {
                                biased;
                                _ = cancel.notified() => return ProxiedOutcome::Cancelled,
                                sent = self.sink.send(message) => {
                                    if sent.is_err() {
                                        return ProxiedOutcome::Cancelled;
                                    }
                                }
                            }
                            deadline = Instant::now() + self.config.timeout;
                            false
                        }
                        EventAction::ResetTimeout => {
                            deadline = Instant::now() + self.config.timeout;
                            false
                        }
                        EventAction::AskNext => true,
                        EventAction::Complete => return ProxiedOutcome::Completed,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(request_id = %self.request.request_id, skipped, "Proxied resend lagged behind transport events");
                        false
                    }
                    Err(RecvError::Closed) => return ProxiedOutcome::Exhausted,
                },
            };

            if advance {
                deadline = tokio::select! {
                    biased;
                    _ = cancel.notified() => return ProxiedOutcome::Cancelled,
                    asked = self.ask_next_neighbor() => match asked {
                        Some(deadline) => deadline,
                        None => return ProxiedOutcome::Exhausted,
                    },
                };
            }
        }
    }

    fn on_event(&mut self, event: NodeEvent) -> EventAction {
        match event {
            NodeEvent::UnicastReceived { from, message }
                if self.is_current(&from) && message.request_id == self.request.request_id =>
            {
                EventAction::Forward(message)
            }
            NodeEvent::ResendResponse { from, response }
                if self.is_current(&from) && response.request_id == self.request.request_id =>
            {
                match response.kind {
                    ResendResponseKind::Resent => EventAction::Complete,
                    ResendResponseKind::NoResend => EventAction::AskNext,
                    ResendResponseKind::Resending => EventAction::ResetTimeout,
                }
            }
            NodeEvent::NodeDisconnected(node) if self.is_current(&node) => {
                debug!(request_id = %self.request.request_id, neighbor = %node, "Neighbor disconnected");
                EventAction::AskNext
            }
            _ => EventAction::Ignore,
        }
    }

    fn is_current(&self, node: &NodeId) -> bool {
        self.current.as_ref() == Some(node)
    }

    /// Forwards the request to the next untried candidate that accepts it.
    /// Returns the new timeout deadline, or `None` when nothing is left.
    async fn ask_next_neighbor(&mut self) -> Option<Instant> {
        self.current = None;
        loop {
            if self.asked.len() >= self.config.max_tries {
                return None;
            }
            let key = self.request.stream_part();
            let candidate = (self.neighbors)(&key)
                .into_iter()
                .find(|node| !self.asked.contains(node))?;
            self.asked.insert(candidate.clone());

            match self.transport.send(&candidate, &self.request).await {
                Ok(()) => {
                    debug!(request_id = %self.request.request_id, neighbor = %candidate, "Asked neighbor");
                    self.current = Some(candidate);
                    return Some(Instant::now() + self.config.timeout);
                }
                Err(e) => {
                    warn!(request_id = %self.request.request_id, neighbor = %candidate, error = %e, "Failed to ask neighbor");
                }
            }
        }
    }
}

enum EventAction {
    Ignore,
    Forward(UnicastMessage),
    ResetTimeout,
    AskNext,
    Complete,
}
