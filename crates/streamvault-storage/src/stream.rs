//! Read pipeline: cursors over the backing store, merged into one ordered,
//! lazily decoded message sequence.
//!
//! Each read runs in its own driver task that owns the cursors. Rows flow to
//! the consumer through a bounded channel, so a slow consumer stalls the
//! cursors instead of buffering the result set. When the consumer drops the
//! stream or the store closes, the driver stops and closes every cursor.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::Stream;
use metrics::counter;
use streamvault_core::{MessageRef, StreamMessage, StreamPartKey};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::backend::{BackendError, BackingStore, RowCursor, RowQuery, StoredRow};
use crate::bucket::BucketId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Upper bound for "last N" requests
    pub max_resend_last: u64,
    /// Buckets consulted by a "last N" request
    pub last_bucket_window: usize,
    /// Rows emitted between cooperative yields
    pub throttle_rows: usize,
    pub page_size: usize,
    /// Rows buffered between a driver and its consumer
    pub channel_capacity: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_resend_last: 10_000,
            last_bucket_window: 100,
            throttle_rows: 1_000,
            page_size: 5_000,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorKind {
    /// A stored payload could not be decoded; the row was skipped
    Decode,
    /// The backing store failed mid-read; the sequence ended early
    Backend,
}

/// Failure observed after a read sequence was handed to its consumer.
#[derive(Debug, Clone)]
pub struct ReadError {
    pub stream_part: StreamPartKey,
    pub kind: ReadErrorKind,
    pub bucket_id: Option<BucketId>,
    pub message_ref: Option<MessageRef>,
    pub reason: String,
}

/// How a driver turns queries into one ordered sequence.
pub(crate) enum ReadPlan {
    /// One descending query, reversed before emitting
    Newest(RowQuery),
    /// Ascending queries merged by `(timestamp, sequence_no)`
    Merge(Vec<RowQuery>),
}

pub(crate) struct ReadContext {
    pub(crate) backend: Arc<dyn BackingStore>,
    pub(crate) stream_part: StreamPartKey,
    pub(crate) errors: broadcast::Sender<ReadError>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) throttle_rows: usize,
    pub(crate) channel_capacity: usize,
}

/// Ordered messages of one read. Ends when every matching row was emitted,
/// the store closed, or the backing store failed.
pub struct MessageStream {
    rows: mpsc::Receiver<StoredRow>,
    stream_part: StreamPartKey,
    errors: Option<broadcast::Sender<ReadError>>,
}

impl MessageStream {
    /// A sequence with no messages.
    pub fn empty(stream_part: StreamPartKey) -> Self {
        let (_, rows) = mpsc::channel(1);
        Self {
            rows,
            stream_part,
            errors: None,
        }
    }

    pub fn stream_part(&self) -> &StreamPartKey {
        &self.stream_part
    }

    /// Starts a driver that awaits `plan` and then streams its rows.
    /// A plan of `None` yields an empty sequence.
    pub(crate) fn spawn(ctx: ReadContext, plan: BoxFuture<'static, Option<ReadPlan>>) -> Self {
        let (tx, rows) = mpsc::channel(ctx.channel_capacity.max(1));
        let stream_part = ctx.stream_part.clone();
        let errors = Some(ctx.errors.clone());
        tokio::spawn(async move {
            if let Some(plan) = plan.await {
                let mut driver = Driver { ctx, tx, sent: 0 };
                driver.run(plan).await;
            }
        });
        Self {
            rows,
            stream_part,
            errors,
        }
    }

    fn report_decode_failure(&self, row: &StoredRow, reason: String) {
        counter!("storage.row.decode_failed", 1);
        warn!(
            stream_part = %self.stream_part,
            bucket_id = %row.bucket_id,
            timestamp = row.timestamp,
            sequence_no = row.sequence_no,
            error = %reason,
            "Skipping undecodable row"
        );
        if let Some(errors) = &self.errors {
            let _ = errors.send(ReadError {
                stream_part: self.stream_part.clone(),
                kind: ReadErrorKind::Decode,
                bucket_id: Some(row.bucket_id),
                message_ref: Some(row.message_ref()),
                reason,
            });
        }
    }
}

impl Stream for MessageStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let row = match self.rows.poll_recv(cx) {
                Poll::Ready(Some(row)) => row,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            match StreamMessage::decode(&row.payload) {
                Ok(message) => {
                    counter!("storage.read.count", 1);
                    counter!("storage.read.bytes", row.payload.len() as u64);
                    return Poll::Ready(Some(message));
                }
                Err(e) => self.report_decode_failure(&row, e.to_string()),
            }
        }
    }
}

enum Step<T> {
    Ready(T),
    Failed(BackendError),
    Stopped,
}

struct Source {
    cursor: Box<dyn RowCursor>,
    buffered: VecDeque<StoredRow>,
    exhausted: bool,
}

struct Driver {
    ctx: ReadContext,
    tx: mpsc::Sender<StoredRow>,
    sent: usize,
}

impl Driver {
    async fn run(&mut self, plan: ReadPlan) {
        let queries = match &plan {
            ReadPlan::Newest(query) => vec![query.clone()],
            ReadPlan::Merge(queries) => queries.clone(),
        };

        let mut sources = Vec::with_capacity(queries.len());
        for query in queries {
            match self.ctx.backend.open_cursor(query).await {
                Ok(cursor) => sources.push(Source {
                    cursor,
                    buffered: VecDeque::new(),
                    exhausted: false,
                }),
                Err(e) => {
                    self.fail(e);
                    close_all(&mut sources).await;
                    return;
                }
            }
        }

        let outcome = match plan {
            ReadPlan::Newest(_) => self.emit_newest(&mut sources).await,
            ReadPlan::Merge(_) => self.emit_merged(&mut sources).await,
        };
        if let Step::Failed(e) = outcome {
            self.fail(e);
        }
        close_all(&mut sources).await;
        debug!(stream_part = %self.ctx.stream_part, rows = self.sent, "Read finished");
    }

    /// Drains the single descending source, then emits it oldest first.
    async fn emit_newest(&mut self, sources: &mut [Source]) -> Step<()> {
        let Some(source) = sources.first_mut() else {
            return Step::Ready(());
        };
        let mut rows = Vec::new();
        loop {
            match self.fill(source).await {
                Step::Ready(()) => {}
                other => return other,
            }
            if source.buffered.is_empty() {
                break;
            }
            rows.extend(source.buffered.drain(..));
        }

        for row in rows.into_iter().rev() {
            match self.send(row).await {
                Step::Ready(()) => {}
                other => return other,
            }
        }
        Step::Ready(())
    }

    /// k-way merge of ascending sources.
    async fn emit_merged(&mut self, sources: &mut [Source]) -> Step<()> {
        let mut heads = BinaryHeap::with_capacity(sources.len());
        for (index, source) in sources.iter_mut().enumerate() {
            match self.fill(source).await {
                Step::Ready(()) => {}
                other => return other,
            }
            if let Some(row) = source.buffered.front() {
                heads.push(Reverse((row.message_ref(), index)));
            }
        }

        while let Some(Reverse((_, index))) = heads.pop() {
            let source = &mut sources[index];
            let Some(row) = source.buffered.pop_front() else {
                continue;
            };
            if source.buffered.is_empty() {
                match self.fill(source).await {
                    Step::Ready(()) => {}
                    other => return other,
                }
            }
            if let Some(next) = source.buffered.front() {
                heads.push(Reverse((next.message_ref(), index)));
            }
            match self.send(row).await {
                Step::Ready(()) => {}
                other => return other,
            }
        }
        Step::Ready(())
    }

    /// Fetches the next page into `source` unless it is exhausted.
    async fn fill(&mut self, source: &mut Source) -> Step<()> {
        if source.exhausted {
            return Step::Ready(());
        }
        let page = tokio::select! {
            biased;
            _ = self.tx.closed() => return Step::Stopped,
            _ = shutdown_signalled(&mut self.ctx.shutdown) => return Step::Stopped,
            page = source.cursor.next_page() => page,
        };
        match page {
            Ok(rows) if rows.is_empty() => {
                source.exhausted = true;
                Step::Ready(())
            }
            Ok(rows) => {
                source.buffered.extend(rows);
                Step::Ready(())
            }
            Err(e) => Step::Failed(e),
        }
    }

    async fn send(&mut self, row: StoredRow) -> Step<()> {
        let sent = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut self.ctx.shutdown) => return Step::Stopped,
            sent = self.tx.send(row) => sent,
        };
        if sent.is_err() {
            return Step::Stopped;
        }
        self.sent += 1;
        if self.ctx.throttle_rows > 0 && self.sent % self.ctx.throttle_rows == 0 {
            tokio::task::yield_now().await;
        }
        Step::Ready(())
    }

    fn fail(&self, e: BackendError) {
        warn!(stream_part = %self.ctx.stream_part, error = %e, rows = self.sent, "Read failed");
        let _ = self.ctx.errors.send(ReadError {
            stream_part: self.ctx.stream_part.clone(),
            kind: ReadErrorKind::Backend,
            bucket_id: None,
            message_ref: None,
            reason: e.to_string(),
        });
    }
}

async fn close_all(sources: &mut [Source]) {
    for source in sources.iter_mut() {
        source.cursor.close().await;
    }
}

/// Resolves once the store signals shutdown or drops its sender.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
