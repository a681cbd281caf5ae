// streamvault-core - Shared domain types for the storage and resend layers
//
// Everything that crosses a crate boundary lives here: stream messages and
// their identifiers, resend requests, and the envelopes exchanged with peers.

mod envelope;
mod error;
mod message;
mod request;

pub use envelope::{ResendResponse, ResendResponseKind, UnicastMessage};
pub use error::{CoreError, Result};
pub use message::{MessageId, MessageRef, NodeId, StreamMessage, StreamPartKey};
pub use request::{ResendMode, ResendRequest};
