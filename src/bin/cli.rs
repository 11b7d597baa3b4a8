//! CLI for cluster operations

use autofailover::common::protocol::NodeSettings;
use autofailover::keeper::HttpMonitorClient;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "autofailover")]
#[command(about = "autofailover administration CLI")]
#[command(version)]
struct Cli {
    /// Monitor URL
    #[arg(long, default_value = "http://localhost:6000")]
    monitor: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show nodes, goals and health of a formation
    State {
        #[arg(long, default_value = "default")]
        formation: String,
    },

    /// Show the most recent events
    Events {
        #[arg(long, default_value = "default")]
        formation: String,

        #[arg(long, default_value = "10")]
        count: usize,
    },

    /// Show the synchronous standby names of a group
    StandbyNames {
        #[arg(long, default_value = "default")]
        formation: String,

        #[arg(long, default_value = "0")]
        group: u32,
    },

    /// Demote the primary and promote the best standby
    Switchover {
        #[arg(long, default_value = "default")]
        formation: String,

        #[arg(long, default_value = "0")]
        group: u32,
    },

    /// Put a node in or out of maintenance
    Maintenance {
        #[command(subcommand)]
        action: MaintenanceAction,
    },

    /// Change candidate priority or replication quorum of a node
    Settings {
        node: u64,

        #[arg(long)]
        priority: Option<u8>,

        #[arg(long)]
        replication_quorum: Option<bool>,
    },

    /// Remove a node from the monitor
    Drop { node: u64 },

    /// Manage formations
    Formation {
        #[command(subcommand)]
        action: FormationAction,
    },
}

#[derive(Subcommand)]
enum MaintenanceAction {
    Enable { node: u64 },
    Disable { node: u64 },
}

#[derive(Subcommand)]
enum FormationAction {
    List,
    Create { name: String },
    Drop { name: String },
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = HttpMonitorClient::new(&cli.monitor, Duration::from_secs(cli.timeout))?;

    match cli.command {
        Commands::State { formation } => {
            print(&client.formation_state(&formation).await?)?;
        }

        Commands::Events { formation, count } => {
            print(&client.events(&formation, count).await?)?;
        }

        Commands::StandbyNames { formation, group } => {
            print(&client.standby_names(&formation, group).await?)?;
        }

        Commands::Switchover { formation, group } => {
            client.switchover(&formation, group).await?;
            println!("Switchover started for {}/{}", formation, group);
        }

        Commands::Maintenance { action } => match action {
            MaintenanceAction::Enable { node } => {
                client.enable_maintenance(node).await?;
                println!("Maintenance requested for node {}", node);
            }
            MaintenanceAction::Disable { node } => {
                client.disable_maintenance(node).await?;
                println!("Maintenance ended for node {}", node);
            }
        },

        Commands::Settings {
            node,
            priority,
            replication_quorum,
        } => {
            let settings = NodeSettings {
                candidate_priority: priority,
                replication_quorum,
            };
            print(&client.set_node_settings(node, &settings).await?)?;
        }

        Commands::Drop { node } => {
            client.drop_node(node).await?;
            println!("Node {} dropped", node);
        }

        Commands::Formation { action } => match action {
            FormationAction::List => print(&client.list_formations().await?)?,
            FormationAction::Create { name } => {
                client.create_formation(&name).await?;
                println!("Formation {} created", name);
            }
            FormationAction::Drop { name } => {
                client.drop_formation(&name).await?;
                println!("Formation {} dropped", name);
            }
        },
    }

    Ok(())
}
