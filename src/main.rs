use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use streamvault_config::RuntimeConfig;

/// Storage node persisting stream messages and serving resend requests
#[derive(Parser)]
#[command(name = "streamvault")]
#[command(version)]
#[command(about = "Storage node persisting stream messages and serving resends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Node identifier (overrides config file)
    #[arg(short, long, value_name = "ID", global = true)]
    node_id: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the storage node (default if no subcommand given)
    Run,
    /// Print the resolved configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config) => print_config(&cli),
        Some(Commands::Run) | None => run_node(cli),
    }
}

fn print_config(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

fn run_node(cli: Cli) -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;

    // run_with_config calls init_tracing again, which is idempotent
    streamvault::init_tracing(&config);
    display_startup_info(&config);

    streamvault::run_with_config(config).await
}

fn resolve_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load_or_default().context("Failed to load configuration")?
    };

    // CLI flags win over file and environment
    apply_cli_overrides(&mut config, cli);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    if let Some(node_id) = &cli.node_id {
        config.node.node_id = node_id.clone();
    }
    if let Some(level) = &cli.log_level {
        config.node.log_level = level.clone();
    }
}

fn display_startup_info(config: &RuntimeConfig) {
    use tracing::info;

    info!("╭─────────────────────────────────────────────────");
    info!("│ streamvault v{}", env!("CARGO_PKG_VERSION"));
    info!("├─────────────────────────────────────────────────");
    info!("│ Node id: {}", config.node.node_id);
    info!("│ Log level: {}", config.node.log_level);
    info!(
        "│ Buckets: {} MB / {} records max",
        config.bucket.max_bucket_bytes / 1_048_576,
        config.bucket.max_bucket_records
    );
    info!(
        "│ Batching: {} records, {}ms close timeout",
        config.batch.max_records, config.batch.close_timeout_ms
    );
    info!("│ Resend last limit: {}", config.query.max_resend_last);
    match config.storage.max_write_retries {
        Some(max) => info!("│ Write retries: up to {}", max),
        None => info!("│ Write retries: unbounded"),
    }
    if config.node.metrics_interval_secs > 0 {
        info!(
            "│ Metrics log interval: {}s",
            config.node.metrics_interval_secs
        );
    }
    info!("╰─────────────────────────────────────────────────");
}
