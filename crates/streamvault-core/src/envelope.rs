use serde::{Deserialize, Serialize};

use crate::{ResendRequest, StreamMessage};

/// A resent message addressed to the requester, tagged with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnicastMessage {
    pub request_id: String,
    pub message: StreamMessage,
}

impl UnicastMessage {
    pub fn new(request_id: impl Into<String>, message: StreamMessage) -> Self {
        Self {
            request_id: request_id.into(),
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResendResponseKind {
    /// Data follows
    Resending,
    /// All data has been sent
    Resent,
    /// The responder holds nothing for this request
    NoResend,
}

/// Control message that frames a resend conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendResponse {
    pub kind: ResendResponseKind,
    pub stream_id: String,
    pub partition: u32,
    pub request_id: String,
}

impl ResendResponse {
    pub fn for_request(kind: ResendResponseKind, request: &ResendRequest) -> Self {
        Self {
            kind,
            stream_id: request.stream_id.clone(),
            partition: request.partition,
            request_id: request.request_id.clone(),
        }
    }
}
