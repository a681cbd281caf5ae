use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Identifies one partition of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamPartKey {
    pub stream_id: String,
    pub partition: u32,
}

impl StreamPartKey {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }
}

impl fmt::Display for StreamPartKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.stream_id, self.partition)
    }
}

/// Opaque identifier of a peer node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Position of a message on its publisher's timeline.
///
/// Ordering is by timestamp first, then sequence number, which is the
/// order the read path restores when merging query results.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct MessageRef {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub sequence_no: u32,
}

impl MessageRef {
    pub fn new(timestamp: i64, sequence_no: u32) -> Self {
        Self {
            timestamp,
            sequence_no,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub stream_id: String,
    pub partition: u32,
    pub timestamp: i64,
    pub sequence_no: u32,
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl MessageId {
    pub fn stream_part(&self) -> StreamPartKey {
        StreamPartKey::new(self.stream_id.clone(), self.partition)
    }

    pub fn message_ref(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_no)
    }
}

/// A published message as it is stored and resent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub id: MessageId,
    /// Reference to the previous message in the same chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<MessageRef>,
    pub content: serde_json::Value,
}

impl StreamMessage {
    pub fn new(id: MessageId, prev: Option<MessageRef>, content: serde_json::Value) -> Self {
        Self { id, prev, content }
    }

    pub fn stream_id(&self) -> &str {
        &self.id.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.id.partition
    }

    pub fn timestamp(&self) -> i64 {
        self.id.timestamp
    }

    pub fn sequence_no(&self) -> u32 {
        self.id.sequence_no
    }

    pub fn publisher_id(&self) -> &str {
        &self.id.publisher_id
    }

    pub fn msg_chain_id(&self) -> &str {
        &self.id.msg_chain_id
    }

    /// Serialize into the payload column stored by the backing store.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(ts: i64, seq: u32) -> StreamMessage {
        StreamMessage::new(
            MessageId {
                stream_id: "stream-1".to_string(),
                partition: 0,
                timestamp: ts,
                sequence_no: seq,
                publisher_id: "publisher".to_string(),
                msg_chain_id: "chain".to_string(),
            },
            None,
            json!({ "value": ts }),
        )
    }

    #[test]
    fn message_refs_order_by_timestamp_then_sequence() {
        let mut refs = vec![
            MessageRef::new(2000, 0),
            MessageRef::new(1000, 5),
            MessageRef::new(1000, 1),
        ];
        refs.sort();
        assert_eq!(
            refs,
            vec![
                MessageRef::new(1000, 1),
                MessageRef::new(1000, 5),
                MessageRef::new(2000, 0),
            ]
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(StreamMessage::decode(b"not json").is_err());
    }

    #[test]
    fn encoded_payload_restores_message() {
        let original = message(1000, 3);
        let payload = original.encode().unwrap();
        let decoded = StreamMessage::decode(&payload).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.id.stream_part().to_string(), "stream-1::0");
    }
}
