//! Contract with the durable column store.
//!
//! The store is expected to provide parameterized inserts and selects, a bulk
//! write primitive, and a paginated cursor that must be closed explicitly
//! because it holds server-side resources.

use async_trait::async_trait;
use bytes::Bytes;
use streamvault_core::{MessageRef, StreamMessage, StreamPartKey};
use thiserror::Error;

use crate::bucket::{Bucket, BucketId};

mod memory;

pub use memory::MemoryBackend;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("cursor already closed")]
    CursorClosed,
}

/// One row of the message table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub stream_part: StreamPartKey,
    pub bucket_id: BucketId,
    pub timestamp: i64,
    pub sequence_no: u32,
    pub publisher_id: String,
    pub msg_chain_id: String,
    pub payload: Bytes,
}

impl StoredRow {
    pub fn new(bucket_id: BucketId, message: &StreamMessage, payload: Bytes) -> Self {
        Self {
            stream_part: message.id.stream_part(),
            bucket_id,
            timestamp: message.timestamp(),
            sequence_no: message.sequence_no(),
            publisher_id: message.publisher_id().to_string(),
            msg_chain_id: message.msg_chain_id().to_string(),
            payload,
        }
    }

    pub fn message_ref(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_no)
    }
}

/// Which creation dates a bucket lookup accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketTimeFilter {
    Any,
    /// `date_create <= ts`
    AtOrBefore(i64),
    /// `date_create > from` and, if set, `date_create <= to`
    After { from: i64, to: Option<i64> },
}

/// Bucket lookup. Results are always ordered newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketQuery {
    pub stream_part: StreamPartKey,
    pub filter: BucketTimeFilter,
    pub limit: Option<usize>,
}

/// Timestamp and sequence predicate of a row query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampBound {
    Any,
    /// `ts >= from`
    AtLeast(i64),
    /// `ts > from`
    After(i64),
    /// `from <= ts <= to`
    Between { from: i64, to: i64 },
    /// `from < ts < to`
    Exclusive { from: i64, to: i64 },
    /// `ts == at.timestamp && seq >= at.sequence_no`
    AtSequenceFloor(MessageRef),
    /// `ts == at.timestamp && seq <= at.sequence_no`
    AtSequenceCeiling(MessageRef),
    /// `ts == timestamp && from <= seq <= to`
    AtSequenceBetween { timestamp: i64, from: u32, to: u32 },
}

impl TimestampBound {
    pub fn contains(&self, at: MessageRef) -> bool {
        let ts = at.timestamp;
        let seq = at.sequence_no;
        match *self {
            TimestampBound::Any => true,
            TimestampBound::AtLeast(from) => ts >= from,
            TimestampBound::After(from) => ts > from,
            TimestampBound::Between { from, to } => from <= ts && ts <= to,
            TimestampBound::Exclusive { from, to } => from < ts && ts < to,
            TimestampBound::AtSequenceFloor(floor) => {
                ts == floor.timestamp && seq >= floor.sequence_no
            }
            TimestampBound::AtSequenceCeiling(ceiling) => {
                ts == ceiling.timestamp && seq <= ceiling.sequence_no
            }
            TimestampBound::AtSequenceBetween {
                timestamp,
                from,
                to,
            } => ts == timestamp && from <= seq && seq <= to,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrder {
    Ascending,
    Descending,
}

/// Row selection within a set of buckets, ordered by `(timestamp, sequence_no)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    pub stream_part: StreamPartKey,
    pub buckets: Vec<BucketId>,
    pub bound: TimestampBound,
    pub publisher_id: Option<String>,
    pub msg_chain_id: Option<String>,
    pub order: RowOrder,
    pub limit: Option<usize>,
    pub page_size: usize,
}

impl RowQuery {
    pub fn matches(&self, row: &StoredRow) -> bool {
        row.stream_part == self.stream_part
            && self.buckets.contains(&row.bucket_id)
            && self.bound.contains(row.message_ref())
            && self
                .publisher_id
                .as_deref()
                .map_or(true, |p| p == row.publisher_id)
            && self
                .msg_chain_id
                .as_deref()
                .map_or(true, |c| c == row.msg_chain_id)
    }
}

/// Paginated result set. `close` must be called once the consumer is done.
#[async_trait]
pub trait RowCursor: Send {
    /// Returns the next page; an empty page means the cursor is exhausted.
    async fn next_page(&mut self) -> BackendResult<Vec<StoredRow>>;

    async fn close(&mut self);
}

/// The durable store behind buckets and message rows.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Bulk insert of one batch.
    async fn insert_rows(&self, rows: &[StoredRow]) -> BackendResult<()>;

    /// Insert or update a bucket's counters.
    async fn upsert_bucket(&self, bucket: &Bucket) -> BackendResult<()>;

    async fn query_buckets(&self, query: &BucketQuery) -> BackendResult<Vec<Bucket>>;

    async fn open_cursor(&self, query: RowQuery) -> BackendResult<Box<dyn RowCursor>>;
}
