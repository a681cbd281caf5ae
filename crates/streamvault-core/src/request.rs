use serde::{Deserialize, Serialize};

use crate::{CoreError, MessageRef, Result, StreamPartKey};

/// Which slice of history a resend asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResendMode {
    Last {
        count: u64,
    },
    From {
        from: MessageRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publisher_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_chain_id: Option<String>,
    },
    Range {
        from: MessageRef,
        to: MessageRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publisher_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_chain_id: Option<String>,
    },
}

impl ResendMode {
    pub fn name(&self) -> &'static str {
        match self {
            ResendMode::Last { .. } => "last",
            ResendMode::From { .. } => "from",
            ResendMode::Range { .. } => "range",
        }
    }
}

/// Immutable resend descriptor. `request_id` correlates responses across hops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendRequest {
    pub stream_id: String,
    pub partition: u32,
    pub request_id: String,
    pub mode: ResendMode,
}

impl ResendRequest {
    pub fn last(
        stream_id: impl Into<String>,
        partition: u32,
        request_id: impl Into<String>,
        count: u64,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
            request_id: request_id.into(),
            mode: ResendMode::Last { count },
        }
    }

    pub fn starting_at(
        stream_id: impl Into<String>,
        partition: u32,
        request_id: impl Into<String>,
        from: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
            request_id: request_id.into(),
            mode: ResendMode::From {
                from,
                publisher_id,
                msg_chain_id,
            },
        }
    }

    pub fn range(
        stream_id: impl Into<String>,
        partition: u32,
        request_id: impl Into<String>,
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
            request_id: request_id.into(),
            mode: ResendMode::Range {
                from,
                to,
                publisher_id,
                msg_chain_id,
            },
        }
    }

    pub fn stream_part(&self) -> StreamPartKey {
        StreamPartKey::new(self.stream_id.clone(), self.partition)
    }

    /// Rejects parameter combinations no query shape can serve.
    pub fn validate(&self) -> Result<()> {
        self.mode
            .check()
            .map_err(|reason| CoreError::invalid_request(&self.request_id, reason))
    }
}

impl ResendMode {
    /// Checks filter and bound combinations, returning the reason on failure.
    pub fn check(&self) -> std::result::Result<(), &'static str> {
        let (sequence_set, publisher_id, msg_chain_id) = match self {
            ResendMode::Last { .. } => return Ok(()),
            ResendMode::From {
                from,
                publisher_id,
                msg_chain_id,
            } => (from.sequence_no != 0, publisher_id, msg_chain_id),
            ResendMode::Range {
                from,
                to,
                publisher_id,
                msg_chain_id,
            } => {
                if from > to {
                    return Err("range start is after range end");
                }
                (
                    from.sequence_no != 0 || to.sequence_no != 0,
                    publisher_id,
                    msg_chain_id,
                )
            }
        };
        match (publisher_id, msg_chain_id) {
            (Some(_), Some(_)) => Ok(()),
            (None, None) if !sequence_set => Ok(()),
            (None, None) => Err("Invalid combination: sequence number requires publisher_id"),
            (Some(_), None) => Err("Invalid combination: publisher_id requires msg_chain_id"),
            (None, Some(_)) => Err("Invalid combination: msg_chain_id requires publisher_id"),
        }
    }
}
