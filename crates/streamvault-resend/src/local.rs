use futures::StreamExt;
use streamvault_core::{NodeId, ResendRequest, UnicastMessage};
use streamvault_storage::Store;

use crate::{ResendError, ResendStrategy, ResponseStream};

/// Serves resends from this node's own store.
pub struct LocalResendStrategy {
    store: Store,
}

impl LocalResendStrategy {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl ResendStrategy for LocalResendStrategy {
    fn name(&self) -> &'static str {
        "local"
    }

    fn serve(
        &self,
        request: &ResendRequest,
        _source: Option<&NodeId>,
    ) -> Result<ResponseStream, ResendError> {
        let messages = self.store.resend(request)?;
        let request_id = request.request_id.clone();
        Ok(ResponseStream::new(messages.map(move |message| {
            UnicastMessage::new(request_id.clone(), message)
        })))
    }
}
