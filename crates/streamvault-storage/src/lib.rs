// streamvault-storage - Bucketed, batched message storage
//
// Writes are routed to time-bounded buckets and accumulated into bulk
// inserts; reads merge paginated cursors into ordered message streams.
//
// Layout:
// - backend: contract with the durable store, plus an in-memory backend
// - bucket / directory: bucket identity, limits and the write-side directory
// - batch / accumulator: per-bucket write buffers and their insert retries
// - store / query / stream: the façade used by the resend layer

pub mod accumulator;
pub mod backend;
mod batch;
pub mod bucket;
pub mod directory;
mod error;
mod query;
pub mod store;
pub mod stream;

pub use accumulator::{BatchAccumulator, BatchConfig, BatchMetrics};
pub use backend::{BackendError, BackingStore, MemoryBackend, StoredRow};
pub use batch::BatchState;
pub use bucket::{Bucket, BucketId, BucketLimits};
pub use directory::{BucketConfig, BucketDirectory};
pub use error::{ErrorCode, Result, StoreError};
pub use store::{Store, StoreConfig, StreamStats, WriteHandle};
pub use stream::{MessageStream, QueryConfig, ReadError, ReadErrorKind};
