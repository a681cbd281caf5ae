use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    BackendError, BackendResult, BackingStore, BucketQuery, BucketTimeFilter, RowCursor,
    RowOrder, RowQuery, StoredRow,
};
use crate::bucket::{Bucket, BucketId};

const FAIL_FOREVER: u32 = u32::MAX;

/// In-process backing store.
///
/// Used by the binary when no external store is configured and by tests,
/// which can inject insert failures and watch cursor bookkeeping.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    open_cursors: Arc<AtomicUsize>,
    failing_inserts: AtomicU32,
    insert_calls: AtomicUsize,
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<StoredRow>,
    buckets: HashMap<BucketId, Bucket>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` bulk inserts fail.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Every bulk insert fails until `heal` is called.
    pub fn fail_all_inserts(&self) {
        self.failing_inserts.store(FAIL_FOREVER, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failing_inserts.store(0, Ordering::SeqCst);
    }

    /// Number of bulk insert attempts, successful or not.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Cursors opened but not yet closed or dropped.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn rows(&self) -> Vec<StoredRow> {
        self.state.lock().rows.clone()
    }

    pub fn buckets(&self) -> Vec<Bucket> {
        self.state.lock().buckets.values().cloned().collect()
    }

    /// Writes a row directly, bypassing failure injection.
    pub fn put_row(&self, row: StoredRow) {
        self.state.lock().rows.push(row);
    }

    pub fn put_bucket(&self, bucket: Bucket) {
        self.state.lock().buckets.insert(bucket.id, bucket);
    }

    fn take_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                FAIL_FOREVER => Some(FAIL_FOREVER),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl BackingStore for MemoryBackend {
    async fn insert_rows(&self, rows: &[StoredRow]) -> BackendResult<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(BackendError::Unavailable(
                "injected insert failure".to_string(),
            ));
        }
        self.state.lock().rows.extend_from_slice(rows);
        Ok(())
    }

    async fn upsert_bucket(&self, bucket: &Bucket) -> BackendResult<()> {
        self.state.lock().buckets.insert(bucket.id, bucket.clone());
        Ok(())
    }

    async fn query_buckets(&self, query: &BucketQuery) -> BackendResult<Vec<Bucket>> {
        let state = self.state.lock();
        let mut found: Vec<Bucket> = state
            .buckets
            .values()
            .filter(|b| b.stream_part == query.stream_part)
            .filter(|b| match query.filter {
                BucketTimeFilter::Any => true,
                BucketTimeFilter::AtOrBefore(ts) => b.date_create <= ts,
                BucketTimeFilter::After { from, to } => {
                    b.date_create > from && to.map_or(true, |to| b.date_create <= to)
                }
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.date_create.cmp(&a.date_create));
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn open_cursor(&self, query: RowQuery) -> BackendResult<Box<dyn RowCursor>> {
        let mut rows: Vec<StoredRow> = self
            .state
            .lock()
            .rows
            .iter()
            .filter(|row| query.matches(row))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.message_ref());
        if query.order == RowOrder::Descending {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCursor {
            rows: rows.into(),
            page_size: query.page_size.max(1),
            open_cursors: Arc::clone(&self.open_cursors),
            closed: false,
        }))
    }
}

struct MemoryCursor {
    rows: VecDeque<StoredRow>,
    page_size: usize,
    open_cursors: Arc<AtomicUsize>,
    closed: bool,
}

impl MemoryCursor {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RowCursor for MemoryCursor {
    async fn next_page(&mut self) -> BackendResult<Vec<StoredRow>> {
        if self.closed {
            return Err(BackendError::CursorClosed);
        }
        let take = self.page_size.min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.release();
    }
}
