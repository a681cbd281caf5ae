//! Storage façade: buffered writes, ordered reads and per-stream stats.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use streamvault_core::{StreamMessage, StreamPartKey};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accumulator::{BatchAccumulator, BatchConfig, BatchMetrics};
use crate::backend::{BackingStore, RowOrder, RowQuery, StoredRow, TimestampBound};
use crate::batch::WriteWaiter;
use crate::bucket::Bucket;
use crate::directory::{BucketConfig, BucketDirectory};
use crate::stream::{QueryConfig, ReadError};
use crate::{Result, StoreError};

const READ_ERROR_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Delay before re-resolving a write that found no bucket
    pub write_retry_interval: Duration,
    /// `None` retries until a bucket appears or the store closes
    pub max_write_retries: Option<u32>,
    pub bucket: BucketConfig,
    pub batch: BatchConfig,
    pub query: QueryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_retry_interval: Duration::from_millis(500),
            max_write_retries: None,
            bucket: BucketConfig::default(),
            batch: BatchConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

/// Aggregate view of one stream-part across its persisted buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub first_message_timestamp: Option<i64>,
    pub last_message_timestamp: Option<i64>,
    pub message_count: u64,
    pub total_bytes: u64,
}

pub(crate) struct StoreInner {
    pub(crate) backend: Arc<dyn BackingStore>,
    pub(crate) directory: BucketDirectory,
    accumulator: BatchAccumulator,
    pub(crate) config: StoreConfig,
    pending_writes: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    closed: AtomicBool,
    pub(crate) read_errors: broadcast::Sender<ReadError>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl StoreInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Handle to the message store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Creates the store and starts bucket maintenance.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(backend: Arc<dyn BackingStore>, config: StoreConfig) -> Self {
        let directory = BucketDirectory::new(Arc::clone(&backend), config.bucket.clone());
        let accumulator = BatchAccumulator::new(Arc::clone(&backend), config.batch.clone());
        let (read_errors, _) = broadcast::channel(READ_ERROR_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        directory.spawn_maintenance();

        info!(
            max_bucket_bytes = config.bucket.max_bucket_bytes,
            max_bucket_records = config.bucket.max_bucket_records,
            batch_max_records = config.batch.max_records,
            "Store started"
        );

        Self {
            inner: Arc::new(StoreInner {
                backend,
                directory,
                accumulator,
                config,
                pending_writes: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                read_errors,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn directory(&self) -> &BucketDirectory {
        &self.inner.directory
    }

    /// Queues `message` for durable storage.
    ///
    /// Returns immediately; the handle resolves once the message's batch is
    /// inserted, or with the error that ended its write. Must be called from
    /// within a tokio runtime.
    pub fn write(&self, message: StreamMessage) -> WriteHandle {
        let (tx, rx) = oneshot::channel();
        write_attempt(&self.inner, message, 0, tx);
        WriteHandle { rx }
    }

    /// Writes still waiting for a bucket.
    pub fn pending_writes(&self) -> usize {
        self.inner.pending_writes.lock().len()
    }

    pub fn metrics(&self) -> BatchMetrics {
        self.inner.accumulator.metrics()
    }

    /// Failures observed by read pipelines after they were handed out.
    pub fn read_errors(&self) -> broadcast::Receiver<ReadError> {
        self.inner.read_errors.subscribe()
    }

    /// Message count and byte totals from bucket counters; first and last
    /// timestamps from the oldest and newest bucket.
    pub async fn stream_stats(&self, key: &StreamPartKey) -> Result<StreamStats> {
        let buckets = self.inner.directory.all_buckets(key).await?;
        let (Some(newest), Some(oldest)) = (buckets.first(), buckets.last()) else {
            return Ok(StreamStats::default());
        };

        let (first, last) = tokio::join!(
            self.edge_timestamp(oldest, RowOrder::Ascending),
            self.edge_timestamp(newest, RowOrder::Descending),
        );
        Ok(StreamStats {
            first_message_timestamp: first?,
            last_message_timestamp: last?,
            message_count: buckets.iter().map(|b| b.records).sum(),
            total_bytes: buckets.iter().map(|b| b.size).sum(),
        })
    }

    async fn edge_timestamp(&self, bucket: &Bucket, order: RowOrder) -> Result<Option<i64>> {
        let mut cursor = self
            .inner
            .backend
            .open_cursor(RowQuery {
                stream_part: bucket.stream_part.clone(),
                buckets: vec![bucket.id],
                bound: TimestampBound::Any,
                publisher_id: None,
                msg_chain_id: None,
                order,
                limit: Some(1),
                page_size: 1,
            })
            .await?;
        let page = cursor.next_page().await;
        cursor.close().await;
        Ok(page?.first().map(|row| row.timestamp))
    }

    /// Stops maintenance, cancels writes waiting for a bucket, abandons
    /// buffered batches and ends active reads. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled: Vec<JoinHandle<()>> = self
            .inner
            .pending_writes
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &cancelled {
            handle.abort();
        }
        self.inner.shutdown.send_replace(true);
        self.inner.directory.stop();
        self.inner.accumulator.stop();
        info!(cancelled_writes = cancelled.len(), "Store closed");
    }
}

fn write_attempt(inner: &Arc<StoreInner>, message: StreamMessage, attempt: u32, waiter: WriteWaiter) {
    if inner.is_closed() {
        let _ = waiter.send(Err(StoreError::closed()));
        return;
    }

    let payload = match message.encode() {
        Ok(payload) => payload,
        Err(e) => {
            let _ = waiter.send(Err(StoreError::encoding(e)));
            return;
        }
    };

    let key = message.id.stream_part();
    let Some(bucket_id) = inner.directory.resolve_bucket(&key, message.timestamp()) else {
        schedule_write_retry(inner, message, attempt, waiter);
        return;
    };

    if !inner.directory.record_write(bucket_id, payload.len() as u64) {
        // Evicted between resolve and record
        schedule_write_retry(inner, message, attempt, waiter);
        return;
    }
    let row = StoredRow::new(bucket_id, &message, payload);
    inner.accumulator.store_with(bucket_id, row, waiter);
}

fn schedule_write_retry(
    inner: &Arc<StoreInner>,
    message: StreamMessage,
    attempt: u32,
    waiter: WriteWaiter,
) {
    if let Some(max) = inner.config.max_write_retries {
        if attempt >= max {
            let key = message.id.stream_part();
            warn!(stream_part = %key, timestamp = message.timestamp(), attempts = attempt + 1, "No bucket for write, giving up");
            let _ = waiter.send(Err(StoreError::bucket_unavailable(
                key,
                message.timestamp(),
                attempt + 1,
            )));
            return;
        }
    }

    let token = Uuid::new_v4();
    let interval = inner.config.write_retry_interval;
    let retry = Arc::clone(inner);
    let mut pending = inner.pending_writes.lock();
    pending.insert(
        token,
        tokio::spawn(async move {
            time::sleep(interval).await;
            retry.pending_writes.lock().remove(&token);
            debug!(attempt = attempt + 1, "Retrying write");
            write_attempt(&retry, message, attempt + 1, waiter);
        }),
    );
}

/// Completion of one [`Store::write`].
#[must_use = "dropping the handle does not cancel the write"]
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for WriteHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(StoreError::closed())))
    }
}
