// Configuration source loading.
//
// Priority order:
// 1. Environment variables (STREAMVAULT_* prefix)
// 2. Config file path from STREAMVAULT_CONFIG
// 3. Inline config content from STREAMVAULT_CONFIG_CONTENT
// 4. Default config files (./config.toml, ./.streamvault.toml)
// 5. Built-in defaults

use crate::env_overrides::{self, EnvSource, ENV_PREFIX};
use crate::RuntimeConfig;
use anyhow::{Context, Result};
use std::env;
use std::path::Path;

const DEFAULT_CONFIG_FILES: &[&str] = &["./config.toml", "./.streamvault.toml"];

pub fn load_config() -> Result<RuntimeConfig> {
    let env_source = StdEnvSource;
    let mut config = RuntimeConfig::default();

    if let Some(file_config) = load_from_file(&env_source)? {
        config.merge(file_config);
    }

    env_overrides::apply_env_overrides(&mut config, &env_source)?;
    config.validate()?;
    Ok(config)
}

fn load_from_file<E: EnvSource>(env: &E) -> Result<Option<RuntimeConfig>> {
    if let Some(path) = env.get("CONFIG") {
        return read_file(Path::new(&path)).map(Some);
    }

    if let Some(content) = env.get("CONFIG_CONTENT") {
        let config: RuntimeConfig = toml::from_str(&content)
            .context("Failed to parse inline config from STREAMVAULT_CONFIG_CONTENT")?;
        return Ok(Some(config));
    }

    for path in DEFAULT_CONFIG_FILES {
        let path = Path::new(path);
        if path.exists() {
            return read_file(path).map(Some);
        }
    }

    Ok(None)
}

fn read_file(path: &Path) -> Result<RuntimeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load configuration from a specific file path (for CLI --config flag).
/// Returns error if file doesn't exist or can't be parsed.
pub fn load_from_file_path(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::default();
    config.merge(read_file(path.as_ref())?);

    env_overrides::apply_env_overrides(&mut config, &StdEnvSource)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration with graceful fallback to defaults.
pub fn load_or_default() -> Result<RuntimeConfig> {
    let env_source = StdEnvSource;
    let mut config = RuntimeConfig::default();

    match load_from_file(&env_source) {
        Ok(Some(file_config)) => config.merge(file_config),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Ignoring unreadable config file, using defaults"),
    }

    env_overrides::apply_env_overrides(&mut config, &env_source)?;
    config.validate()?;
    Ok(config)
}

/// Build a configuration from optional inline TOML plus overrides supplied by
/// a custom `EnvSource`. Never touches the filesystem.
pub fn load_with_env<E: EnvSource>(inline_config: Option<&str>, env: &E) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::default();

    if let Some(content) = inline_config {
        let file_config: RuntimeConfig =
            toml::from_str(content).context("Failed to parse inline config")?;
        config.merge(file_config);
    }

    env_overrides::apply_env_overrides(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

struct StdEnvSource;

impl EnvSource for StdEnvSource {
    fn get(&self, key: &str) -> Option<String> {
        env::var(format!("{}{}", ENV_PREFIX, key)).ok()
    }
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
    fn env_wins_over_inline_content() {
        let env = MapEnv(HashMap::from([("BATCH_MAX_RETRIES", "3")]));
        let config = load_with_env(
            Some(
                r#"
                [batch]
                max_retries = 9
                max_records = 100
                "#,
            ),
            &env,
        )
        .unwrap();

        assert_eq!(config.batch.max_retries, 3);
        assert_eq!(config.batch.max_records, 100);
    }

    #[test]
    fn inline_content_from_env_is_used_when_no_path() {
        let env = MapEnv(HashMap::from([(
            "CONFIG_CONTENT",
            "[node]\nnode_id = \"inline-node\"\n",
        )]));
        let config = load_from_file(&env).unwrap().unwrap();
        assert_eq!(config.node.node_id, "inline-node");
    }

    #[test]
    fn invalid_result_is_rejected() {
        let env = MapEnv(HashMap::new());
        let err = load_with_env(Some("[batch]\nmax_records = 0\n"), &env).unwrap_err();
        assert!(err.to_string().contains("batch.max_records"));
    }
}
