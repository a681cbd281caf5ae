//! Read requests: "last N", "from" and "range".
//!
//! With a publisher filter a lower or upper bound is a full message
//! reference, so the boundary timestamps are queried separately with a
//! sequence condition and the strictly-inside part with a plain timestamp
//! condition. Without one, a single timestamp query suffices.

use std::sync::Arc;

use futures::FutureExt;
use streamvault_core::{CoreError, MessageRef, ResendMode, ResendRequest, StreamPartKey};
use tracing::debug;

use crate::backend::{RowOrder, RowQuery, TimestampBound};
use crate::bucket::{Bucket, BucketId};
use crate::store::Store;
use crate::stream::{MessageStream, ReadContext, ReadPlan};
use crate::{Result, StoreError};

impl Store {
    /// The newest `count` messages, oldest first. `count` is clamped to the
    /// configured maximum.
    pub fn request_last(&self, key: &StreamPartKey, count: u64) -> MessageStream {
        let limit = count.min(self.inner.config.query.max_resend_last);
        if limit == 0 || self.inner.is_closed() {
            return MessageStream::empty(key.clone());
        }

        let directory = self.inner.directory.clone();
        let window = self.inner.config.query.last_bucket_window;
        let template = self.query_template(key);
        let lookup_key = key.clone();
        self.spawn_read(
            key,
            async move {
                let buckets = directory.last_buckets(&lookup_key, window, None).await;
                if buckets.is_empty() {
                    debug!(stream_part = %lookup_key, "No buckets for last request");
                    return None;
                }
                Some(ReadPlan::Newest(RowQuery {
                    buckets: bucket_ids(&buckets),
                    order: RowOrder::Descending,
                    limit: Some(limit as usize),
                    ..template
                }))
            }
            .boxed(),
        )
    }

    /// Messages at or after `from`, in order. `request_id` labels a
    /// rejected filter combination.
    pub fn request_from(
        &self,
        key: &StreamPartKey,
        request_id: &str,
        from: MessageRef,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> Result<MessageStream> {
        let mode = ResendMode::From {
            from,
            publisher_id: publisher_id.map(str::to_string),
            msg_chain_id: msg_chain_id.map(str::to_string),
        };
        check(request_id, &mode)?;

        let bounds = match publisher_id {
            Some(_) => vec![
                TimestampBound::AtSequenceFloor(from),
                TimestampBound::After(from.timestamp),
            ],
            None => vec![TimestampBound::AtLeast(from.timestamp)],
        };
        Ok(self.merged_read(key, from.timestamp, None, bounds, publisher_id, msg_chain_id))
    }

    /// Messages between `from` and `to` inclusive, in order.
    pub fn request_range(
        &self,
        key: &StreamPartKey,
        request_id: &str,
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> Result<MessageStream> {
        let mode = ResendMode::Range {
            from,
            to,
            publisher_id: publisher_id.map(str::to_string),
            msg_chain_id: msg_chain_id.map(str::to_string),
        };
        check(request_id, &mode)?;

        let bounds = match publisher_id {
            Some(_) if from.timestamp == to.timestamp => vec![TimestampBound::AtSequenceBetween {
                timestamp: from.timestamp,
                from: from.sequence_no,
                to: to.sequence_no,
            }],
            Some(_) => vec![
                TimestampBound::AtSequenceFloor(from),
                TimestampBound::Exclusive {
                    from: from.timestamp,
                    to: to.timestamp,
                },
                TimestampBound::AtSequenceCeiling(to),
            ],
            None => vec![TimestampBound::Between {
                from: from.timestamp,
                to: to.timestamp,
            }],
        };
        Ok(self.merged_read(
            key,
            from.timestamp,
            Some(to.timestamp),
            bounds,
            publisher_id,
            msg_chain_id,
        ))
    }

    /// Serves a resend request from local storage.
    pub fn resend(&self, request: &ResendRequest) -> Result<MessageStream> {
        request.validate().map_err(StoreError::invalid_request)?;
        let key = request.stream_part();
        match &request.mode {
            ResendMode::Last { count } => Ok(self.request_last(&key, *count)),
            ResendMode::From {
                from,
                publisher_id,
                msg_chain_id,
            } => self.request_from(
                &key,
                &request.request_id,
                *from,
                publisher_id.as_deref(),
                msg_chain_id.as_deref(),
            ),
            ResendMode::Range {
                from,
                to,
                publisher_id,
                msg_chain_id,
            } => self.request_range(
                &key,
                &request.request_id,
                *from,
                *to,
                publisher_id.as_deref(),
                msg_chain_id.as_deref(),
            ),
        }
    }

    fn merged_read(
        &self,
        key: &StreamPartKey,
        from: i64,
        to: Option<i64>,
        bounds: Vec<TimestampBound>,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> MessageStream {
        if self.inner.is_closed() {
            return MessageStream::empty(key.clone());
        }

        let directory = self.inner.directory.clone();
        let template = RowQuery {
            publisher_id: publisher_id.map(str::to_string),
            msg_chain_id: msg_chain_id.map(str::to_string),
            ..self.query_template(key)
        };
        let lookup_key = key.clone();
        self.spawn_read(
            key,
            async move {
                let buckets = directory.buckets_in_range(&lookup_key, from, to).await;
                if buckets.is_empty() {
                    debug!(stream_part = %lookup_key, from, ?to, "No buckets for read");
                    return None;
                }
                let ids = bucket_ids(&buckets);
                let queries = bounds
                    .into_iter()
                    .map(|bound| RowQuery {
                        buckets: ids.clone(),
                        bound,
                        ..template.clone()
                    })
                    .collect();
                Some(ReadPlan::Merge(queries))
            }
            .boxed(),
        )
    }

    fn query_template(&self, key: &StreamPartKey) -> RowQuery {
        RowQuery {
            stream_part: key.clone(),
            buckets: Vec::new(),
            bound: TimestampBound::Any,
            publisher_id: None,
            msg_chain_id: None,
            order: RowOrder::Ascending,
            limit: None,
            page_size: self.inner.config.query.page_size,
        }
    }

    fn spawn_read(
        &self,
        key: &StreamPartKey,
        plan: futures::future::BoxFuture<'static, Option<ReadPlan>>,
    ) -> MessageStream {
        let query = &self.inner.config.query;
        MessageStream::spawn(
            ReadContext {
                backend: Arc::clone(&self.inner.backend),
                stream_part: key.clone(),
                errors: self.inner.read_errors.clone(),
                shutdown: self.inner.shutdown.subscribe(),
                throttle_rows: query.throttle_rows,
                channel_capacity: query.channel_capacity,
            },
            plan,
        )
    }
}

fn check(request_id: &str, mode: &ResendMode) -> Result<()> {
    mode.check().map_err(|reason| {
        StoreError::invalid_request(CoreError::invalid_request(request_id, reason))
    })
}

fn bucket_ids(buckets: &[Bucket]) -> Vec<BucketId> {
    buckets.iter().map(|bucket| bucket.id).collect()
}
