use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use streamvault_core::{NodeId, ResendRequest, UnicastMessage};
use tokio::sync::mpsc;

use crate::ResendError;

/// Envelopes a relayed response buffers ahead of its consumer. A full
/// buffer holds the producing session until the consumer catches up.
pub(crate) const RELAY_BUFFER: usize = 64;

/// Envelopes produced by one strategy for one request. Dropping it cancels
/// the work behind it.
pub struct ResponseStream {
    inner: BoxStream<'static, UnicastMessage>,
}

impl ResponseStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = UnicastMessage> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    /// Ends once every sender is dropped.
    pub fn from_channel(mut rx: mpsc::Receiver<UnicastMessage>) -> Self {
        Self::new(stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}

impl Stream for ResponseStream {
    type Item = UnicastMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// A way of serving resend requests.
pub trait ResendStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts serving `request`. `source` is the peer that sent it, `None`
    /// for requests originating at this node.
    fn serve(
        &self,
        request: &ResendRequest,
        source: Option<&NodeId>,
    ) -> Result<ResponseStream, ResendError>;

    /// Cancels outstanding work.
    fn stop(&self) {}
}
