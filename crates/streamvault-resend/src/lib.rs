// streamvault-resend - Serving historical messages to requesters
//
// A resend is answered by the first strategy that has data: this node's own
// store, a neighbor that holds the stream, or a storage node located through
// the tracker. Remote strategies relay the request and forward the peer's
// envelopes downstream.

mod bookkeeper;
mod error;
mod foreign;
mod handler;
mod local;
#[cfg(test)]
mod mock;
mod neighbors;
pub mod proxied;
mod response;
pub mod transport;

pub use error::{ResendError, TransportError};
pub use foreign::ForeignResendStrategy;
pub use handler::{ResendHandler, ResendOutput, ResendOutputStream};
pub use local::LocalResendStrategy;
pub use neighbors::AskNeighborsResendStrategy;
pub use proxied::{ProxiedConfig, ProxiedOutcome, ProxiedResend};
pub use response::{ResendStrategy, ResponseStream};
pub use transport::{
    NeighborSource, NodeEvent, NodeToNode, StorageNodesResponse, SubscriptionCheck, TrackerClient,
};
