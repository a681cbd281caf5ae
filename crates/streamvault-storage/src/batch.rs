use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::StoredRow;
use crate::bucket::BucketId;
use crate::StoreError;

/// Completion signal for one buffered write.
pub(crate) type WriteWaiter = oneshot::Sender<Result<(), StoreError>>;

/// Batch lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchState {
    Open,
    Locked,
    PendingInsert,
    Inserted,
    Dropped,
}

/// Messages buffered for one bulk insert into one bucket.
pub(crate) struct Batch {
    pub(crate) id: Uuid,
    pub(crate) bucket_id: BucketId,
    pub(crate) rows: Vec<StoredRow>,
    pub(crate) size: usize,
    pub(crate) retries: u32,
    pub(crate) created_at: Instant,
    state: BatchState,
    waiters: Vec<WriteWaiter>,
}

impl Batch {
    pub(crate) fn new(bucket_id: BucketId) -> Self {
        Self {
            id: Uuid::new_v4(),
            bucket_id,
            rows: Vec::new(),
            size: 0,
            retries: 0,
            created_at: Instant::now(),
            state: BatchState::Open,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> BatchState {
        self.state
    }

    pub(crate) fn push(&mut self, row: StoredRow, waiter: WriteWaiter) {
        debug_assert_eq!(self.state(), BatchState::Open);
        self.size += row.payload.len();
        self.rows.push(row);
        self.waiters.push(waiter);
    }

    pub(crate) fn is_full(&self, max_bytes: usize, max_records: usize) -> bool {
        self.size >= max_bytes || self.rows.len() >= max_records
    }

    pub(crate) fn lock(&mut self) {
        self.advance(BatchState::Locked);
    }

    pub(crate) fn begin_insert(&mut self) {
        self.advance(BatchState::PendingInsert);
    }

    fn advance(&mut self, next: BatchState) {
        // Retries re-enter PendingInsert from PendingInsert
        debug_assert!(next >= self.state, "batch {} moved backwards", self.id);
        self.state = next;
    }

    /// Resolves every waiter with success.
    pub(crate) fn complete(mut self) {
        self.advance(BatchState::Inserted);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Resolves every waiter with `Closed`; the rows are never written.
    pub(crate) fn abandon(mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(StoreError::closed()));
        }
    }

    /// Resolves every waiter with `BatchDropped`.
    pub(crate) fn drop_batch(mut self) {
        self.advance(BatchState::Dropped);
        let attempts = self.retries + 1;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(StoreError::batch_dropped(self.id, attempts)));
        }
    }
}
