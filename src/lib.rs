//! # autofailover
//!
//! High-availability orchestration for primary/standby database groups:
//! - A keeper per node drives its local database through a finite state machine
//! - A monitor collects health reports and assigns every node its goal state
//! - Automatic failover with split-brain fencing, switchover and maintenance
//! - Synchronous replication quorum derived from candidate priorities
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                Monitor                    │
//! │  registry (RocksDB) + decision engine     │
//! │   - goal states, quorum, events           │
//! └───────────▲──────────────────────────────┘
//!             │ HTTP/JSON: register, report
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─┴──────────┐   ┌─────┴──────┐   ┌───┴──────────┐
//! │ Keeper A   │   │ Keeper B   │   │ Keeper C     │
//! │ (primary)  │   │ (secondary)│   │ (secondary)  │
//! │  + DB      │   │  + DB      │   │  + DB        │
//! └────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the monitor
//! ```bash
//! autofailover-monitor serve \
//!   --bind 0.0.0.0:6000 \
//!   --db ./monitor-data
//! ```
//!
//! ### Start a keeper next to each database
//! ```bash
//! autofailover-keeper run \
//!   --name node_a \
//!   --host 10.0.0.1 \
//!   --monitor http://monitor:6000 \
//!   --state ./node_a.state
//! ```
//!
//! ### Use the CLI
//! ```bash
//! autofailover state --formation default
//! autofailover switchover --formation default --group 0
//! autofailover maintenance enable 2
//! autofailover events --count 20
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod keeper;
pub mod monitor;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use keeper::Keeper;
pub use monitor::{Monitor, MonitorService};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
