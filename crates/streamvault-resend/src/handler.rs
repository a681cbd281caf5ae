//! Runs resend requests through an ordered list of strategies.
//!
//! The first strategy whose response yields any envelope serves the request:
//! its envelopes are framed by `Resending` and `Resent`. If no strategy has
//! data the requester gets a single `NoResend`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use streamvault_core::{NodeId, ResendRequest, ResendResponse, ResendResponseKind, UnicastMessage};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::{ResendError, ResendStrategy};

const OUTPUT_CAPACITY: usize = 256;

/// What the requester receives, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ResendOutput {
    Response(ResendResponse),
    Unicast(UnicastMessage),
}

struct Ongoing {
    source: Option<NodeId>,
    cancel: Arc<Notify>,
}

#[derive(Default)]
struct Registry {
    ongoing: Mutex<HashMap<u64, Ongoing>>,
    next_id: AtomicU64,
}

pub struct ResendHandler {
    strategies: Arc<Vec<Arc<dyn ResendStrategy>>>,
    registry: Arc<Registry>,
    stopped: AtomicBool,
}

impl ResendHandler {
    pub fn new(strategies: Vec<Arc<dyn ResendStrategy>>) -> Self {
        Self {
            strategies: Arc::new(strategies),
            registry: Arc::new(Registry::default()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starts serving `request`; malformed requests are rejected here.
    /// `source` is the requesting peer, `None` for local requests.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle_request(
        &self,
        request: ResendRequest,
        source: Option<NodeId>,
    ) -> Result<ResendOutputStream, ResendError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ResendError::Stopped);
        }
        request.validate()?;

        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());
        self.registry.ongoing.lock().insert(
            id,
            Ongoing {
                source: source.clone(),
                cancel: Arc::clone(&cancel),
            },
        );

        let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);
        let strategies = Arc::clone(&self.strategies);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let run = Run {
                request,
                source,
                tx,
                cancel,
            };
            run.serve(&strategies).await;
            registry.ongoing.lock().remove(&id);
        });

        Ok(ResendOutputStream { rx })
    }

    /// Cancels every resend requested by `node`.
    pub fn cancel_resends_of_node(&self, node: &NodeId) -> usize {
        let ongoing = self.registry.ongoing.lock();
        let mut cancelled = 0;
        for entry in ongoing.values() {
            if entry.source.as_ref() == Some(node) {
                entry.cancel.notify_one();
                cancelled += 1;
            }
        }
        debug!(node = %node, cancelled, "Cancelled resends of node");
        cancelled
    }

    pub fn ongoing(&self) -> usize {
        self.registry.ongoing.lock().len()
    }

    /// Cancels every resend and stops the strategies. Later requests are
    /// rejected.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = {
            let ongoing = self.registry.ongoing.lock();
            for entry in ongoing.values() {
                entry.cancel.notify_one();
            }
            ongoing.len()
        };
        for strategy in self.strategies.iter() {
            strategy.stop();
        }
        info!(cancelled, "Resend handler stopped");
    }
}

struct Run {
    request: ResendRequest,
    source: Option<NodeId>,
    tx: mpsc::Sender<ResendOutput>,
    cancel: Arc<Notify>,
}

enum Flow {
    Continue,
    Stop,
}

impl Run {
    async fn serve(&self, strategies: &[Arc<dyn ResendStrategy>]) {
        let request_id = &self.request.request_id;
        for strategy in strategies {
            let mut response = match strategy.serve(&self.request, self.source.as_ref()) {
                Ok(response) => response,
                Err(e) => {
                    warn!(request_id = %request_id, strategy = strategy.name(), error = %e, "Resend strategy failed");
                    continue;
                }
            };

            let first = tokio::select! {
                biased;
                _ = self.cancel.notified() => return,
                _ = self.tx.closed() => return,
                first = response.next() => first,
            };
            let Some(first) = first else {
                debug!(request_id = %request_id, strategy = strategy.name(), "Strategy had nothing to resend");
                continue;
            };

            debug!(request_id = %request_id, strategy = strategy.name(), "Resending");
            if let Flow::Stop = self.emit(self.response(ResendResponseKind::Resending)).await {
                return;
            }
            if let Flow::Stop = self.emit(ResendOutput::Unicast(first)).await {
                return;
            }
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.notified() => return,
                    _ = self.tx.closed() => return,
                    next = response.next() => next,
                };
                let Some(next) = next else {
                    break;
                };
                if let Flow::Stop = self.emit(ResendOutput::Unicast(next)).await {
                    return;
                }
            }
            self.emit(self.response(ResendResponseKind::Resent)).await;
            return;
        }

        debug!(request_id = %request_id, "No strategy could resend");
        self.emit(self.response(ResendResponseKind::NoResend)).await;
    }

    fn response(&self, kind: ResendResponseKind) -> ResendOutput {
        ResendOutput::Response(ResendResponse::for_request(kind, &self.request))
    }

    async fn emit(&self, output: ResendOutput) -> Flow {
        tokio::select! {
            biased;
            _ = self.cancel.notified() => Flow::Stop,
            sent = self.tx.send(output) => match sent {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Stop,
            },
        }
    }
}

/// Output of one handled request. Dropping it cancels the resend.
pub struct ResendOutputStream {
    rx: mpsc::Receiver<ResendOutput>,
}

impl Stream for ResendOutputStream {
    type Item = ResendOutput;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
