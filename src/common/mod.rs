//! Common utilities and types shared by the keeper and the monitor

pub mod config;
pub mod error;
pub mod fsm;
pub mod metrics;
pub mod protocol;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, HookConfig, KeeperConfig, MonitorConfig, RetryPolicy};
pub use error::{Error, Result};
pub use fsm::{EdgeKind, NodeState, TransitionTable};
pub use metrics::METRICS;
pub use protocol::{GroupHealth, GroupId, NodeEndpoint, NodeId, QuorumDescription};
pub use utils::{parse_duration, timestamp_now_millis, Clock, ManualClock, SystemClock};
