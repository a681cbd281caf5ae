//! Batch accumulator: turns per-message stores into bounded bulk inserts.
//!
//! One OPEN batch exists per bucket. A batch locks as soon as it reaches
//! `max_bytes` or `max_records`, or when `close_timeout` has elapsed since it
//! was opened, and is then inserted by its own task. Failed inserts are
//! retried at a fixed interval, `max_retries` times, before the batch is
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::backend::{BackingStore, StoredRow};
use crate::batch::{Batch, WriteWaiter};
use crate::bucket::BucketId;
use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_bytes: usize,
    pub max_records: usize,
    pub close_timeout: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_bytes: 8_000 * 300,
            max_records: 8_000,
            close_timeout: Duration::from_millis(1_000),
            max_retries: 64,
            retry_interval: Duration::from_millis(1_000),
        }
    }
}

/// Accumulator health snapshot, computed over batches awaiting insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchMetrics {
    pub open_batches: usize,
    pub total_batches: usize,
    pub mean_batch_age_ms: f64,
    pub mean_batch_retries: f64,
    pub batches_with_five_or_more_retries: usize,
    pub batches_with_ten_or_more_retries: usize,
    pub batches_with_hundred_or_more_retries: usize,
    pub inserted_batches: u64,
    pub dropped_batches: u64,
}

struct PendingBatch {
    created_at: Instant,
    retries: u32,
}

struct AccumulatorInner {
    backend: Arc<dyn BackingStore>,
    config: BatchConfig,
    open: Mutex<HashMap<BucketId, Batch>>,
    pending: Mutex<HashMap<Uuid, PendingBatch>>,
    tasks: Mutex<JoinSet<()>>,
    stopped: AtomicBool,
    inserted: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct BatchAccumulator {
    inner: Arc<AccumulatorInner>,
}

impl BatchAccumulator {
    pub fn new(backend: Arc<dyn BackingStore>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(AccumulatorInner {
                backend,
                config,
                open: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                stopped: AtomicBool::new(false),
                inserted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Buffers `row` for `bucket_id`. The receiver resolves once the row's
    /// batch is inserted or dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn store(
        &self,
        bucket_id: BucketId,
        row: StoredRow,
    ) -> oneshot::Receiver<Result<(), StoreError>> {
        let (tx, rx) = oneshot::channel();
        self.store_with(bucket_id, row, tx);
        rx
    }

    pub(crate) fn store_with(&self, bucket_id: BucketId, row: StoredRow, waiter: WriteWaiter) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            let _ = waiter.send(Err(StoreError::closed()));
            return;
        }

        let config = &self.inner.config;
        let mut open = self.inner.open.lock();
        let opened = !open.contains_key(&bucket_id);
        let batch = open
            .entry(bucket_id)
            .or_insert_with(|| Batch::new(bucket_id));
        batch.push(row, waiter);

        if batch.is_full(config.max_bytes, config.max_records) {
            if let Some(full) = open.remove(&bucket_id) {
                drop(open);
                debug!(bucket_id = %bucket_id, batch_id = %full.id, records = full.rows.len(), "Batch full");
                self.schedule_insert(full);
            }
        } else if opened {
            let batch_id = batch.id;
            drop(open);
            self.schedule_close(bucket_id, batch_id);
        }
    }

    fn schedule_close(&self, bucket_id: BucketId, batch_id: Uuid) {
        let this = self.clone();
        let close_timeout = self.inner.config.close_timeout;
        self.spawn(async move {
            time::sleep(close_timeout).await;
            let expired = {
                let mut open = this.inner.open.lock();
                match open.get(&bucket_id) {
                    Some(batch) if batch.id == batch_id => open.remove(&bucket_id),
                    _ => None,
                }
            };
            if let Some(batch) = expired {
                debug!(bucket_id = %bucket_id, batch_id = %batch_id, records = batch.rows.len(), "Batch close timeout");
                this.schedule_insert(batch);
            }
        });
    }

    fn schedule_insert(&self, mut batch: Batch) {
        batch.lock();
        self.inner.pending.lock().insert(
            batch.id,
            PendingBatch {
                created_at: batch.created_at,
                retries: 0,
            },
        );
        let this = self.clone();
        self.spawn(async move { this.insert(batch).await });
    }

    async fn insert(&self, mut batch: Batch) {
        let config = &self.inner.config;
        loop {
            batch.begin_insert();
            let result = self.inner.backend.insert_rows(&batch.rows).await;
            match result {
                Ok(()) => {
                    self.inner.pending.lock().remove(&batch.id);
                    self.inner.inserted.fetch_add(1, Ordering::Relaxed);
                    counter!("storage.batch.inserted", 1);
                    counter!("storage.write.count", batch.rows.len() as u64);
                    counter!("storage.write.bytes", batch.size as u64);
                    histogram!("storage.batch.rows", batch.rows.len() as f64);
                    debug!(
                        batch_id = %batch.id,
                        bucket_id = %batch.bucket_id,
                        records = batch.rows.len(),
                        retries = batch.retries,
                        "Batch inserted"
                    );
                    batch.complete();
                    return;
                }
                Err(e) if batch.retries >= config.max_retries => {
                    self.inner.pending.lock().remove(&batch.id);
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("storage.batch.dropped", 1);
                    error!(
                        batch_id = %batch.id,
                        bucket_id = %batch.bucket_id,
                        records = batch.rows.len(),
                        retries = batch.retries,
                        error = %e,
                        "Dropping batch after max retries"
                    );
                    batch.drop_batch();
                    return;
                }
                Err(e) => {
                    batch.retries += 1;
                    if let Some(pending) = self.inner.pending.lock().get_mut(&batch.id) {
                        pending.retries = batch.retries;
                    }
                    counter!("storage.batch.retried", 1);
                    warn!(
                        batch_id = %batch.id,
                        bucket_id = %batch.bucket_id,
                        retries = batch.retries,
                        error = %e,
                        "Batch insert failed, retrying"
                    );
                    time::sleep(config.retry_interval).await;
                }
            }
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    pub fn metrics(&self) -> BatchMetrics {
        let open_batches = self.inner.open.lock().len();
        let pending = self.inner.pending.lock();
        let total_batches = pending.len();

        let mut metrics = BatchMetrics {
            open_batches,
            total_batches,
            inserted_batches: self.inner.inserted.load(Ordering::Relaxed),
            dropped_batches: self.inner.dropped.load(Ordering::Relaxed),
            ..BatchMetrics::default()
        };
        if total_batches == 0 {
            return metrics;
        }

        let mut total_age_ms = 0.0;
        let mut total_retries = 0u64;
        for batch in pending.values() {
            total_age_ms += batch.created_at.elapsed().as_secs_f64() * 1_000.0;
            total_retries += u64::from(batch.retries);
            if batch.retries >= 5 {
                metrics.batches_with_five_or_more_retries += 1;
            }
            if batch.retries >= 10 {
                metrics.batches_with_ten_or_more_retries += 1;
            }
            if batch.retries >= 100 {
                metrics.batches_with_hundred_or_more_retries += 1;
            }
        }
        metrics.mean_batch_age_ms = total_age_ms / total_batches as f64;
        metrics.mean_batch_retries = total_retries as f64 / total_batches as f64;
        metrics
    }

    /// Abandons every open and pending batch. Their writers observe
    /// `StoreError::Closed`.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.tasks.lock().abort_all();
        let abandoned: Vec<Batch> = self.inner.open.lock().drain().map(|(_, b)| b).collect();
        let count = abandoned.len();
        for batch in abandoned {
            batch.abandon();
        }
        self.inner.pending.lock().clear();
        debug!(abandoned = count, "Batch accumulator stopped");
    }
}
