use streamvault_core::{CoreError, NodeId};
use streamvault_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("node {0} is not connected")]
    NotConnected(NodeId),

    #[error("connecting to node {node} failed: {reason}")]
    ConnectFailed { node: NodeId, reason: String },

    #[error("sending to node {node} failed: {reason}")]
    SendFailed { node: NodeId, reason: String },

    #[error("no tracker responsible for {0}")]
    NoTracker(String),
}

#[derive(Debug, Error)]
pub enum ResendError {
    #[error(transparent)]
    InvalidRequest(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("resend handler is stopped")]
    Stopped,
}
