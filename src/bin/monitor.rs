//! Monitor binary

use autofailover::common::{parse_duration, Config};
use autofailover::Monitor;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "autofailover-monitor")]
#[command(about = "autofailover monitor: node registry and failover decisions")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitor server
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Registry directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Silence after which a node is unhealthy (e.g. "20s")
        #[arg(long)]
        partition_timeout: Option<String>,

        /// Silence after which a demoted primary is presumed fenced (e.g. "30s")
        #[arg(long)]
        drain_timeout: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // File and environment first, CLI flags override
    let mut monitor_config = config.monitor.clone().unwrap_or_default();

    match cli.command {
        Commands::Serve {
            bind,
            db,
            partition_timeout,
            drain_timeout,
        } => {
            if let Some(bind) = bind {
                monitor_config.bind_addr = bind;
            }
            if let Some(db) = db {
                monitor_config.db_path = db;
            }
            if let Some(timeout) = partition_timeout {
                monitor_config.network_partition_timeout_ms =
                    parse_duration(&timeout)?.as_millis() as u64;
            }
            if let Some(timeout) = drain_timeout {
                monitor_config.drain_timeout_ms = parse_duration(&timeout)?.as_millis() as u64;
            }
            monitor_config.validate()?;

            Monitor::new(monitor_config).serve().await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&monitor_config)?);
        }
    }

    Ok(())
}
