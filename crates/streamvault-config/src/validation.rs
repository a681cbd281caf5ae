// Configuration validation
//
// Rejects thresholds that would stall the write path or the resend proxy

use crate::*;
use anyhow::{bail, Result};
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_node_config(&config.node)?;
    validate_storage_config(&config.storage)?;
    validate_bucket_config(&config.bucket)?;
    validate_batch_config(&config.batch)?;
    validate_query_config(&config.query)?;
    validate_resend_config(&config.resend)?;
    Ok(())
}

fn validate_node_config(config: &NodeConfig) -> Result<()> {
    if config.node_id.trim().is_empty() {
        bail!("node.node_id must not be empty");
    }
    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<()> {
    if config.write_retry_interval_ms == 0 {
        bail!("storage.write_retry_interval_ms must be greater than 0");
    }
    Ok(())
}

fn validate_bucket_config(config: &BucketConfig) -> Result<()> {
    if config.max_bucket_bytes == 0 {
        bail!("bucket.max_bucket_bytes must be greater than 0");
    }

    if config.max_bucket_records == 0 {
        bail!("bucket.max_bucket_records must be greater than 0");
    }

    if config.almost_full_percent == 0 || config.almost_full_percent > 100 {
        bail!(
            "bucket.almost_full_percent must be between 1 and 100, got {}",
            config.almost_full_percent
        );
    }

    if config.check_full_interval_ms == 0 || config.store_interval_ms == 0 {
        bail!("bucket maintenance intervals must be greater than 0");
    }

    Ok(())
}

fn validate_batch_config(config: &BatchConfig) -> Result<()> {
    if config.max_records == 0 {
        bail!("batch.max_records must be greater than 0");
    }

    if config.max_bytes == 0 {
        bail!("batch.max_bytes must be greater than 0");
    }

    if config.close_timeout_ms == 0 {
        bail!("batch.close_timeout_ms must be greater than 0");
    }

    if config.retry_interval_ms == 0 {
        bail!("batch.retry_interval_ms must be greater than 0");
    }

    if config.max_records > 1_000_000 {
        warn!(
            max_records = config.max_records,
            "batch.max_records is very large; bulk writes may be rejected by the backing store"
        );
    }

    if config.max_bytes > 64 * 1024 * 1024 {
        warn!(
            max_bytes = config.max_bytes,
            "batch.max_bytes is very large; may cause memory issues"
        );
    }

    Ok(())
}

fn validate_query_config(config: &QueryConfig) -> Result<()> {
    if config.last_bucket_window == 0 {
        bail!("query.last_bucket_window must be greater than 0");
    }

    if config.throttle_rows == 0 || config.page_size == 0 || config.channel_capacity == 0 {
        bail!("query.throttle_rows, query.page_size and query.channel_capacity must be greater than 0");
    }

    Ok(())
}

fn validate_resend_config(config: &ResendConfig) -> Result<()> {
    if config.neighbor_timeout_ms == 0 {
        bail!("resend.neighbor_timeout_ms must be greater than 0");
    }

    if config.tracker_timeout_ms == 0 {
        bail!("resend.tracker_timeout_ms must be greater than 0");
    }

    if config.max_neighbor_tries == 0 {
        bail!("resend.max_neighbor_tries must be greater than 0");
    }

    Ok(())
}
