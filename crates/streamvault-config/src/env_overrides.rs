use super::{LogFormat, RuntimeConfig};
use anyhow::{anyhow, Context, Result};

pub const ENV_PREFIX: &str = "STREAMVAULT_";

/// Abstraction over environment-variable lookups so tests and embedders can
/// supply their own source of overrides.
pub trait EnvSource {
    /// Get a variable by its name without the STREAMVAULT_ prefix
    fn get(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Node identity and logging
    if let Some(node_id) = env.get("NODE_ID") {
        config.node.node_id = node_id;
    }
    if let Some(level) = env.get("LOG_LEVEL") {
        config.node.log_level = level;
    }
    if let Some(format) = env.get("LOG_FORMAT") {
        config.node.log_format = format
            .parse::<LogFormat>()
            .context("Invalid STREAMVAULT_LOG_FORMAT value")?;
    }
    if let Some(val) = get_env_u64(env, "METRICS_INTERVAL_SECS")? {
        config.node.metrics_interval_secs = val;
    }

    // Write retries
    if let Some(val) = get_env_u64(env, "WRITE_RETRY_INTERVAL_MS")? {
        config.storage.write_retry_interval_ms = val;
    }
    if let Some(val) = get_env_u32(env, "MAX_WRITE_RETRIES")? {
        config.storage.max_write_retries = Some(val);
    }

    // Buckets
    if let Some(val) = get_env_u64(env, "BUCKET_MAX_BYTES")? {
        config.bucket.max_bucket_bytes = val;
    }
    if let Some(val) = get_env_u64(env, "BUCKET_MAX_RECORDS")? {
        config.bucket.max_bucket_records = val;
    }
    if let Some(val) = get_env_u64(env, "BUCKET_KEEP_ALIVE_SECS")? {
        config.bucket.keep_alive_secs = val;
    }

    // Batches
    if let Some(val) = get_env_usize(env, "BATCH_MAX_BYTES")? {
        config.batch.max_bytes = val;
    }
    if let Some(val) = get_env_usize(env, "BATCH_MAX_RECORDS")? {
        config.batch.max_records = val;
    }
    if let Some(val) = get_env_u64(env, "BATCH_CLOSE_TIMEOUT_MS")? {
        config.batch.close_timeout_ms = val;
    }
    if let Some(val) = get_env_u32(env, "BATCH_MAX_RETRIES")? {
        config.batch.max_retries = val;
    }
    if let Some(val) = get_env_u64(env, "BATCH_RETRY_INTERVAL_MS")? {
        config.batch.retry_interval_ms = val;
    }

    // Queries
    if let Some(val) = get_env_u64(env, "MAX_RESEND_LAST")? {
        config.query.max_resend_last = val;
    }

    // Resend proxying
    if let Some(val) = get_env_u64(env, "RESEND_NEIGHBOR_TIMEOUT_MS")? {
        config.resend.neighbor_timeout_ms = val;
    }
    if let Some(val) = get_env_u64(env, "RESEND_TRACKER_TIMEOUT_MS")? {
        config.resend.tracker_timeout_ms = val;
    }
    if let Some(val) = get_env_usize(env, "RESEND_MAX_NEIGHBOR_TRIES")? {
        config.resend.max_neighbor_tries = val;
    }

    Ok(())
}

fn parse_env<E: EnvSource, T>(env: &E, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env.get(key) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_usize<E: EnvSource>(env: &E, key: &str) -> Result<Option<usize>> {
    parse_env(env, key)
}

fn get_env_u64<E: EnvSource>(env: &E, key: &str) -> Result<Option<u64>> {
    parse_env(env, key)
}

fn get_env_u32<E: EnvSource>(env: &E, key: &str) -> Result<Option<u32>> {
    parse_env(env, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapEnv(HashMap<&'static str, &'static str>);

    impl EnvSource for MapEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| v.to_string())
        }
    }

    #[test]
    fn overrides_replace_file_values() {
        let env = MapEnv(HashMap::from([
            ("BATCH_MAX_RECORDS", "42"),
            ("MAX_WRITE_RETRIES", "7"),
            ("LOG_FORMAT", "json"),
            ("RESEND_NEIGHBOR_TIMEOUT_MS", " 1500 "),
        ]));
        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config, &env).unwrap();

        assert_eq!(config.batch.max_records, 42);
        assert_eq!(config.storage.max_write_retries, Some(7));
        assert_eq!(config.node.log_format, LogFormat::Json);
        assert_eq!(config.resend.neighbor_timeout_ms, 1500);
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let env = MapEnv(HashMap::from([("BATCH_MAX_BYTES", "lots")]));
        let mut config = RuntimeConfig::default();
        let err = apply_env_overrides(&mut config, &env).unwrap_err();
        assert!(err.to_string().contains("STREAMVAULT_BATCH_MAX_BYTES"));
    }
}
