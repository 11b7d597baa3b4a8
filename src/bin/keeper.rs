//! Keeper binary

use autofailover::common::{parse_duration, Config, KeeperConfig};
use autofailover::keeper::{CommandController, HttpMonitorClient, Keeper, StateFile};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "autofailover-keeper")]
#[command(about = "autofailover keeper: drives one database node")]
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
    /// Register with the monitor and run the control loop
    Run {
        /// Node name, unique within the formation
        #[arg(long)]
        name: Option<String>,

        /// Address other nodes use to reach this database
        #[arg(long)]
        host: Option<String>,

        /// Database port
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        formation: Option<String>,

        /// Requested group
        #[arg(long)]
        group: Option<u32>,

        /// Candidate priority, 0 never promotes this node
        #[arg(long)]
        priority: Option<u8>,

        /// Keep this node out of the synchronous quorum
        #[arg(long)]
        no_replication_quorum: bool,

        /// Monitor URL
        #[arg(long)]
        monitor: Option<String>,

        /// Local state file
        #[arg(long)]
        state: Option<PathBuf>,

        /// Report interval (e.g. "5s")
        #[arg(long)]
        report_interval: Option<String>,

        /// Self-demotion delay when the monitor is unreachable (e.g. "20s")
        #[arg(long)]
        partition_timeout: Option<String>,
    },

    /// Print the local state file
    Show {
        /// Local state file
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
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

    let mut keeper_config: KeeperConfig = config.keeper.clone().unwrap_or_default();

    match cli.command {
        Commands::Run {
            name,
            host,
            port,
            formation,
            group,
            priority,
            no_replication_quorum,
            monitor,
            state,
            report_interval,
            partition_timeout,
        } => {
            if let Some(name) = name {
                keeper_config.name = name;
            }
            if let Some(host) = host {
                keeper_config.host = host;
            }
            if let Some(port) = port {
                keeper_config.port = port;
            }
            if let Some(formation) = formation {
                keeper_config.formation = formation;
            }
            if group.is_some() {
                keeper_config.group_id = group;
            }
            if let Some(priority) = priority {
                keeper_config.candidate_priority = priority;
            }
            if no_replication_quorum {
                keeper_config.replication_quorum = false;
            }
            if let Some(monitor) = monitor {
                keeper_config.monitor_url = monitor;
            }
            if let Some(state) = state {
                keeper_config.state_path = state;
            }
            if let Some(interval) = report_interval {
                keeper_config.report_interval_ms = parse_duration(&interval)?.as_millis() as u64;
            }
            if let Some(timeout) = partition_timeout {
                keeper_config.network_partition_timeout_ms =
                    parse_duration(&timeout)?.as_millis() as u64;
            }

            let monitor = HttpMonitorClient::new(
                keeper_config.monitor_url.clone(),
                keeper_config.request_timeout(),
            )?;
            let controller = CommandController::new(keeper_config.hooks.clone());
            let keeper = Keeper::new(keeper_config, Arc::new(monitor), Arc::new(controller))?;

            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                tracing::info!("Shutdown signal received");
                let _ = stop_tx.send(true);
            });

            keeper.run(stop_rx).await?;
        }

        Commands::Show { state } => {
            let path = state.unwrap_or(keeper_config.state_path);
            match StateFile::new(&path).load()? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("No keeper state at {}", path.display()),
            }
        }
    }

    Ok(())
}
