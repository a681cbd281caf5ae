use std::fmt;

use streamvault_core::StreamPartKey;
use uuid::{NoContext, Timestamp, Uuid};

/// Time-derived bucket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(Uuid);

impl BucketId {
    /// Creates a fresh id whose time component is `timestamp_ms`.
    pub fn from_timestamp(timestamp_ms: i64) -> Self {
        let millis = timestamp_ms.max(0) as u64;
        let ts = Timestamp::from_unix(
            NoContext,
            millis / 1_000,
            ((millis % 1_000) * 1_000_000) as u32,
        );
        Self(Uuid::new_v7(ts))
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A bounded partition of one stream-part's timeline, as persisted in the
/// bucket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub id: BucketId,
    pub stream_part: StreamPartKey,
    /// Earliest timestamp (ms) the bucket accepts
    pub date_create: i64,
    pub size: u64,
    pub records: u64,
}

impl Bucket {
    pub fn new(id: BucketId, stream_part: StreamPartKey, date_create: i64) -> Self {
        Self {
            id,
            stream_part,
            date_create,
            size: 0,
            records: 0,
        }
    }
}

/// Rollover thresholds applied to in-memory buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLimits {
    pub max_size: u64,
    pub max_records: u64,
    pub almost_full_percent: u8,
}

impl BucketLimits {
    /// True once either counter reaches the almost-full share of its limit.
    pub fn is_full(&self, bucket: &Bucket) -> bool {
        let pct = u64::from(self.almost_full_percent);
        bucket.size.saturating_mul(100) >= self.max_size.saturating_mul(pct)
            || bucket.records.saturating_mul(100) >= self.max_records.saturating_mul(pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_is_full_at_threshold_share() {
        let limits = BucketLimits {
            max_size: 1_000,
            max_records: 10,
            almost_full_percent: 70,
        };
        let mut bucket = Bucket::new(BucketId::from_timestamp(0), StreamPartKey::new("s", 0), 0);

        bucket.records = 6;
        assert!(!limits.is_full(&bucket));
        bucket.records = 7;
        assert!(limits.is_full(&bucket));

        bucket.records = 0;
        bucket.size = 700;
        assert!(limits.is_full(&bucket));
    }

    #[test]
    fn ids_are_unique_for_equal_timestamps() {
        let a = BucketId::from_timestamp(1_000);
        let b = BucketId::from_timestamp(1_000);
        assert_ne!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 7);
    }
}
