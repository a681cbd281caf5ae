//! Resend requests waiting for the tracker to name storage nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use streamvault_core::{ResendRequest, StreamPartKey, UnicastMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

pub(crate) type ResponseSink = mpsc::Sender<UnicastMessage>;

struct PendingEntry {
    request: ResendRequest,
    sink: ResponseSink,
    timer: JoinHandle<()>,
}

type PendingMap = HashMap<StreamPartKey, HashMap<u64, PendingEntry>>;

/// Entries are keyed by stream-part. Each one expires on its own timer;
/// an expired or cleared entry drops its sink, ending its response with no
/// data.
pub(crate) struct PendingTrackerLookups {
    pending: Arc<Mutex<PendingMap>>,
    timeout: Duration,
    next_entry: AtomicU64,
}

impl PendingTrackerLookups {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            next_entry: AtomicU64::new(0),
        }
    }

    /// Registers a lookup and returns its entry id.
    pub(crate) fn add(&self, request: ResendRequest, sink: ResponseSink) -> u64 {
        let key = request.stream_part();
        let id = self.next_entry.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();

        let weak = Arc::downgrade(&self.pending);
        let timeout = self.timeout;
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            time::sleep(timeout).await;
            let Some(pending) = weak.upgrade() else {
                return;
            };
            let expired = remove_entry(&mut pending.lock(), &timer_key, id);
            if let Some(entry) = expired {
                counter!("resend.tracker.timeout", 1);
                debug!(stream_part = %timer_key, request_id = %entry.request.request_id, "Tracker lookup timed out");
            }
        });

        pending.entry(key).or_default().insert(
            id,
            PendingEntry {
                request,
                sink,
                timer,
            },
        );
        id
    }

    /// Drops one entry, ending its response.
    pub(crate) fn remove(&self, key: &StreamPartKey, id: u64) {
        if let Some(entry) = remove_entry(&mut self.pending.lock(), key, id) {
            entry.timer.abort();
        }
    }

    /// Takes every entry waiting on `key`, cancelling their timers.
    pub(crate) fn pop(&self, key: &StreamPartKey) -> Vec<(ResendRequest, ResponseSink)> {
        let entries = self.pending.lock().remove(key).unwrap_or_default();
        entries
            .into_values()
            .map(|entry| {
                entry.timer.abort();
                (entry.request, entry.sink)
            })
            .collect()
    }

    /// Ends every pending response with no data.
    pub(crate) fn clear_all(&self) {
        let drained: Vec<PendingEntry> = self
            .pending
            .lock()
            .drain()
            .flat_map(|(_, entries)| entries.into_values())
            .collect();
        for entry in drained {
            entry.timer.abort();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().values().map(HashMap::len).sum()
    }
}

fn remove_entry(pending: &mut PendingMap, key: &StreamPartKey, id: u64) -> Option<PendingEntry> {
    let entries = pending.get_mut(key)?;
    let entry = entries.remove(&id);
    if entries.is_empty() {
        pending.remove(key);
    }
    entry
}
