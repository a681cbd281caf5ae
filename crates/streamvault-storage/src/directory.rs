//! Bucket directory: maps `(stream, partition, time)` to buckets.
//!
//! Resolution is answered from memory only. Streams whose writes could not be
//! placed remember the earliest unplaced timestamp; the periodic
//! `check_full_buckets` pass then adopts a bucket from the backing store or
//! creates a new one at that timestamp. `store_buckets` persists counters and
//! evicts buckets that have been idle past their keep-alive.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use streamvault_core::StreamPartKey;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::backend::{BackingStore, BucketQuery, BucketTimeFilter};
use crate::bucket::{Bucket, BucketId, BucketLimits};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    pub max_bucket_bytes: u64,
    pub max_bucket_records: u64,
    pub almost_full_percent: u8,
    pub keep_alive: Duration,
    pub check_full_interval: Duration,
    pub store_interval: Duration,
}

impl BucketConfig {
    fn limits(&self) -> BucketLimits {
        BucketLimits {
            max_size: self.max_bucket_bytes,
            max_records: self.max_bucket_records,
            almost_full_percent: self.almost_full_percent,
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            max_bucket_bytes: 100 * 1024 * 1024,
            max_bucket_records: 500_000,
            almost_full_percent: 70,
            keep_alive: Duration::from_secs(60),
            check_full_interval: Duration::from_millis(1_000),
            store_interval: Duration::from_millis(500),
        }
    }
}

struct TrackedBucket {
    bucket: Bucket,
    stored: bool,
    last_write: Instant,
}

#[derive(Default)]
struct StreamState {
    /// Newest first by `date_create`
    ids: Vec<BucketId>,
    min_timestamp: Option<i64>,
}

#[derive(Default)]
struct DirectoryState {
    buckets: HashMap<BucketId, TrackedBucket>,
    streams: HashMap<StreamPartKey, StreamState>,
}

impl DirectoryState {
    fn find_bucket(
        &self,
        key: &StreamPartKey,
        timestamp: i64,
        limits: &BucketLimits,
    ) -> Option<BucketId> {
        let stream = self.streams.get(key)?;
        let latest = stream.ids.first().and_then(|id| self.buckets.get(id))?;

        if !limits.is_full(&latest.bucket) && latest.bucket.date_create <= timestamp {
            return Some(latest.bucket.id);
        }

        if latest.bucket.date_create > timestamp {
            // Write in the past: any older bucket created at or before it
            return stream
                .ids
                .iter()
                .skip(1)
                .filter_map(|id| self.buckets.get(id))
                .find(|tracked| tracked.bucket.date_create <= timestamp)
                .map(|tracked| tracked.bucket.id);
        }

        None
    }

    fn latest_is_full(&self, key: &StreamPartKey, limits: &BucketLimits) -> Option<bool> {
        let stream = self.streams.get(key)?;
        stream
            .ids
            .first()
            .and_then(|id| self.buckets.get(id))
            .map(|tracked| limits.is_full(&tracked.bucket))
    }

    fn track(&mut self, bucket: Bucket, stored: bool) {
        let stream = self.streams.entry(bucket.stream_part.clone()).or_default();
        let buckets = &self.buckets;
        let position = stream
            .ids
            .iter()
            .position(|id| {
                buckets
                    .get(id)
                    .map_or(true, |tracked| tracked.bucket.date_create < bucket.date_create)
            })
            .unwrap_or(stream.ids.len());
        stream.ids.insert(position, bucket.id);
        stream.min_timestamp = None;
        self.buckets.insert(
            bucket.id,
            TrackedBucket {
                bucket,
                stored,
                last_write: Instant::now(),
            },
        );
    }

    fn remove(&mut self, id: &BucketId) {
        if let Some(tracked) = self.buckets.remove(id) {
            if let Some(stream) = self.streams.get_mut(&tracked.bucket.stream_part) {
                stream.ids.retain(|other| other != id);
            }
        }
    }
}

/// Shared handle to the bucket directory.
#[derive(Clone)]
pub struct BucketDirectory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    backend: Arc<dyn BackingStore>,
    config: BucketConfig,
    limits: BucketLimits,
    state: Mutex<DirectoryState>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl BucketDirectory {
    pub fn new(backend: Arc<dyn BackingStore>, config: BucketConfig) -> Self {
        let limits = config.limits();
        Self {
            inner: Arc::new(DirectoryInner {
                backend,
                config,
                limits,
                state: Mutex::new(DirectoryState::default()),
                maintenance: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.inner.config
    }

    /// Bucket that should receive a write at `timestamp`, if one is known.
    ///
    /// `None` means "retry later": the timestamp is remembered so the next
    /// maintenance pass creates or adopts a bucket for it.
    pub fn resolve_bucket(&self, key: &StreamPartKey, timestamp: i64) -> Option<BucketId> {
        let mut state = self.inner.state.lock();
        let found = state.find_bucket(key, timestamp, &self.inner.limits);
        if found.is_none() {
            let stream = state.streams.entry(key.clone()).or_default();
            stream.min_timestamp = Some(
                stream
                    .min_timestamp
                    .map_or(timestamp, |current| current.min(timestamp)),
            );
            trace!(stream_part = %key, timestamp, "no bucket for write");
        }
        found
    }

    /// Adds one record of `bytes` to the bucket. Returns false if the bucket
    /// is no longer tracked.
    pub fn record_write(&self, bucket_id: BucketId, bytes: u64) -> bool {
        let mut state = self.inner.state.lock();
        match state.buckets.get_mut(&bucket_id) {
            Some(tracked) => {
                tracked.bucket.size += bytes;
                tracked.bucket.records += 1;
                tracked.stored = false;
                tracked.last_write = Instant::now();
                true
            }
            None => {
                warn!(bucket_id = %bucket_id, "Failed to record write, bucket not tracked");
                false
            }
        }
    }

    /// Snapshot of an in-memory bucket.
    pub fn bucket(&self, bucket_id: BucketId) -> Option<Bucket> {
        self.inner
            .state
            .lock()
            .buckets
            .get(&bucket_id)
            .map(|tracked| tracked.bucket.clone())
    }

    /// Up to `limit` most recent persisted buckets, optionally only those
    /// created at or before `before`. Newest first; empty on failure.
    pub async fn last_buckets(
        &self,
        key: &StreamPartKey,
        limit: usize,
        before: Option<i64>,
    ) -> Vec<Bucket> {
        let query = BucketQuery {
            stream_part: key.clone(),
            filter: before.map_or(BucketTimeFilter::Any, BucketTimeFilter::AtOrBefore),
            limit: Some(limit),
        };
        match self.inner.backend.query_buckets(&query).await {
            Ok(buckets) => buckets,
            Err(e) => {
                warn!(stream_part = %key, error = %e, "Failed to load last buckets");
                Vec::new()
            }
        }
    }

    /// Persisted buckets whose time span intersects `[from, to]`, newest first.
    ///
    /// The bucket holding `from` is the newest one created at or before it;
    /// the rest were created after `from` (and not after `to`).
    pub async fn buckets_in_range(
        &self,
        key: &StreamPartKey,
        from: i64,
        to: Option<i64>,
    ) -> Vec<Bucket> {
        let backend = &self.inner.backend;
        let first = BucketQuery {
            stream_part: key.clone(),
            filter: BucketTimeFilter::AtOrBefore(from),
            limit: Some(1),
        };
        let rest = BucketQuery {
            stream_part: key.clone(),
            filter: BucketTimeFilter::After { from, to },
            limit: None,
        };

        let (first, rest) = tokio::join!(backend.query_buckets(&first), backend.query_buckets(&rest));
        match (first, rest) {
            (Ok(first), Ok(mut rest)) => {
                rest.extend(first);
                rest
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(stream_part = %key, from, ?to, error = %e, "Failed to load buckets for range");
                Vec::new()
            }
        }
    }

    /// Every persisted bucket of the stream-part, newest first.
    pub async fn all_buckets(&self, key: &StreamPartKey) -> crate::Result<Vec<Bucket>> {
        let query = BucketQuery {
            stream_part: key.clone(),
            filter: BucketTimeFilter::Any,
            limit: None,
        };
        Ok(self.inner.backend.query_buckets(&query).await?)
    }

    /// Creates or adopts buckets for streams with unplaced writes.
    pub async fn check_full_buckets(&self) {
        let limits = self.inner.limits;
        let waiting: Vec<(StreamPartKey, i64)> = {
            let state = self.inner.state.lock();
            state
                .streams
                .iter()
                .filter_map(|(key, stream)| stream.min_timestamp.map(|ts| (key.clone(), ts)))
                .collect()
        };

        for (key, min_timestamp) in waiting {
            let latest_full = self.inner.state.lock().latest_is_full(&key, &limits);
            let mut insert_new = latest_full.unwrap_or(false);

            if latest_full != Some(false) {
                let found = self.last_buckets(&key, 1, None).await;
                insert_new = !self.adopt(found);
            }

            let unresolved = !insert_new
                && self
                    .inner
                    .state
                    .lock()
                    .find_bucket(&key, min_timestamp, &limits)
                    .is_none();
            if unresolved {
                let found = self.last_buckets(&key, 1, Some(min_timestamp)).await;
                insert_new = !self.adopt(found);
            }

            if insert_new {
                let bucket = Bucket::new(
                    BucketId::from_timestamp(min_timestamp),
                    key.clone(),
                    min_timestamp,
                );
                debug!(stream_part = %key, bucket_id = %bucket.id, date_create = min_timestamp, "Created bucket");
                self.inner.state.lock().track(bucket, false);
            }
        }
    }

    fn adopt(&self, found: Vec<Bucket>) -> bool {
        let Some(bucket) = found.into_iter().next() else {
            return false;
        };
        let mut state = self.inner.state.lock();
        if state.buckets.contains_key(&bucket.id) {
            return false;
        }
        debug!(stream_part = %bucket.stream_part, bucket_id = %bucket.id, "Adopted persisted bucket");
        state.track(bucket, true);
        true
    }

    /// Persists changed bucket counters and evicts idle stored buckets.
    pub async fn store_buckets(&self) {
        let unstored: Vec<Bucket> = {
            let state = self.inner.state.lock();
            state
                .buckets
                .values()
                .filter(|tracked| !tracked.stored)
                .map(|tracked| tracked.bucket.clone())
                .collect()
        };

        let backend = &self.inner.backend;
        let results = join_all(unstored.iter().map(|bucket| backend.upsert_bucket(bucket))).await;

        let keep_alive = self.inner.config.keep_alive;
        let mut state = self.inner.state.lock();
        for (bucket, result) in unstored.iter().zip(results) {
            match result {
                Ok(()) => {
                    if let Some(tracked) = state.buckets.get_mut(&bucket.id) {
                        // Writes that landed during the upsert keep it dirty
                        if tracked.bucket.records == bucket.records {
                            tracked.stored = true;
                        }
                    }
                }
                Err(e) => {
                    warn!(bucket_id = %bucket.id, error = %e, "Failed to store bucket");
                }
            }
        }

        let expired: Vec<BucketId> = state
            .buckets
            .values()
            .filter(|tracked| tracked.stored && tracked.last_write.elapsed() >= keep_alive)
            .map(|tracked| tracked.bucket.id)
            .collect();
        for id in expired {
            trace!(bucket_id = %id, "Evicting idle bucket");
            state.remove(&id);
        }
    }

    /// Starts the periodic check/store passes. Idempotent.
    pub fn spawn_maintenance(&self) {
        let mut handles = self.inner.maintenance.lock();
        if !handles.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        handles.push(tokio::spawn(maintenance_loop(
            weak.clone(),
            self.inner.config.check_full_interval,
            MaintenancePass::CheckFull,
        )));
        handles.push(tokio::spawn(maintenance_loop(
            weak,
            self.inner.config.store_interval,
            MaintenancePass::Store,
        )));
    }

    pub fn stop(&self) {
        for handle in self.inner.maintenance.lock().drain(..) {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn tracked_ids(&self, key: &StreamPartKey) -> Vec<BucketId> {
        self.inner
            .state
            .lock()
            .streams
            .get(key)
            .map(|stream| stream.ids.clone())
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy)]
enum MaintenancePass {
    CheckFull,
    Store,
}

async fn maintenance_loop(inner: Weak<DirectoryInner>, period: Duration, pass: MaintenancePass) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let directory = BucketDirectory { inner };
        match pass {
            MaintenancePass::CheckFull => directory.check_full_buckets().await,
            MaintenancePass::Store => directory.store_buckets().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn key() -> StreamPartKey {
        StreamPartKey::new("stream", 0)
    }

    fn directory(backend: Arc<MemoryBackend>, max_records: u64) -> BucketDirectory {
        BucketDirectory::new(
            backend,
            BucketConfig {
                max_bucket_records: max_records,
                almost_full_percent: 100,
                ..BucketConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn unresolved_write_creates_bucket_on_check() {
        let backend = Arc::new(MemoryBackend::new());
        let directory = directory(backend.clone(), 10);

        assert!(directory.resolve_bucket(&key(), 5_000).is_none());
        assert!(directory.resolve_bucket(&key(), 3_000).is_none());
        directory.check_full_buckets().await;

        let id = directory.resolve_bucket(&key(), 5_000).unwrap();
        assert_eq!(directory.bucket(id).unwrap().date_create, 3_000);
        assert_eq!(directory.resolve_bucket(&key(), 3_000), Some(id));
        assert!(directory.resolve_bucket(&key(), 2_999).is_none());
    }

    #[tokio::test]
    async fn full_bucket_rolls_over() {
        let backend = Arc::new(MemoryBackend::new());
        let directory = directory(backend.clone(), 2);

        directory.resolve_bucket(&key(), 1_000);
        directory.check_full_buckets().await;
        let first = directory.resolve_bucket(&key(), 1_000).unwrap();
        assert!(directory.record_write(first, 10));
        assert!(directory.record_write(first, 10));

        assert!(directory.resolve_bucket(&key(), 2_000).is_none());
        directory.store_buckets().await;
        directory.check_full_buckets().await;

        let second = directory.resolve_bucket(&key(), 2_000).unwrap();
        assert_ne!(first, second);
        assert_eq!(directory.tracked_ids(&key()), vec![second, first]);
        // older writes still land in the old bucket
        assert_eq!(directory.resolve_bucket(&key(), 1_500), Some(first));
    }

    #[tokio::test]
    async fn persisted_bucket_is_adopted() {
        let backend = Arc::new(MemoryBackend::new());
        let persisted = Bucket::new(BucketId::from_timestamp(500), key(), 500);
        backend.put_bucket(persisted.clone());
        let directory = directory(backend.clone(), 10);

        assert!(directory.resolve_bucket(&key(), 1_000).is_none());
        directory.check_full_buckets().await;
        assert_eq!(directory.resolve_bucket(&key(), 1_000), Some(persisted.id));
    }

    #[tokio::test(start_paused = true)]
    async fn stored_idle_buckets_are_evicted() {
        let backend = Arc::new(MemoryBackend::new());
        let directory = BucketDirectory::new(
            backend.clone(),
            BucketConfig {
                keep_alive: Duration::from_secs(60),
                ..BucketConfig::default()
            },
        );

        directory.resolve_bucket(&key(), 1_000);
        directory.check_full_buckets().await;
        let id = directory.resolve_bucket(&key(), 1_000).unwrap();
        directory.record_write(id, 100);

        directory.store_buckets().await;
        let stored = backend.buckets();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].records, 1);
        assert_eq!(stored[0].size, 100);
        assert!(directory.bucket(id).is_some());

        time::advance(Duration::from_secs(61)).await;
        directory.store_buckets().await;
        assert!(directory.bucket(id).is_none());
    }

    #[tokio::test]
    async fn range_lookup_includes_bucket_holding_start() {
        let backend = Arc::new(MemoryBackend::new());
        let ids: Vec<Bucket> = [1_000, 2_000, 3_000, 4_000]
            .into_iter()
            .map(|ts| Bucket::new(BucketId::from_timestamp(ts), key(), ts))
            .collect();
        for bucket in &ids {
            backend.put_bucket(bucket.clone());
        }
        let directory = directory(backend, 10);

        let found: Vec<i64> = directory
            .buckets_in_range(&key(), 2_500, Some(3_500))
            .await
            .iter()
            .map(|b| b.date_create)
            .collect();
        assert_eq!(found, vec![3_000, 2_000]);

        let open_ended: Vec<i64> = directory
            .buckets_in_range(&key(), 2_000, None)
            .await
            .iter()
            .map(|b| b.date_create)
            .collect();
        assert_eq!(open_ended, vec![4_000, 3_000, 2_000]);

        let last = directory.last_buckets(&key(), 2, Some(3_000)).await;
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].date_create, 3_000);
    }
}
