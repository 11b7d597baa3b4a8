//! Configuration for autofailover components
//!
//! Values come from an optional TOML file, then `AUTOFAILOVER__*`
//! environment variables (double underscore separates sections, e.g.
//! `AUTOFAILOVER__MONITOR__DRAIN_TIMEOUT_MS=45000`), then CLI flags applied
//! by the binaries.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Monitor-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorConfig>,

    /// Keeper-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keeper: Option<KeeperConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `path` (or `./autofailover.toml` when present)
    /// layered with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("autofailover").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("AUTOFAILOVER")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut loaded: Config = builder.build()?.try_deserialize()?;
        if loaded.log_level.is_empty() {
            loaded.log_level = default_log_level();
        }
        Ok(loaded)
    }
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_monitor_bind")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for the node registry
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// A node whose last report is older than this is unhealthy
    #[serde(default = "default_partition_timeout")]
    pub network_partition_timeout_ms: u64,

    /// How long a demoted primary may stay silent before it is presumed fenced.
    /// Must exceed every keeper's own partition timeout. A keeper has
    /// `network_partition_timeout_ms + drain_timeout_ms` after its last report
    /// to demote itself; that sum is its `fencing_budget_ms`.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Interval of the background health sweep
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,

    /// Max replication lag (progress units) for catchingup -> secondary
    #[serde(default = "default_promotable_lag")]
    pub promotable_lag_bytes: u64,

    /// Number of events kept in the history
    #[serde(default = "default_events_retained")]
    pub events_retained: usize,
}

fn default_monitor_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6000))
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./monitor-data")
}
fn default_partition_timeout() -> u64 {
    20_000
}
fn default_drain_timeout() -> u64 {
    30_000
}
fn default_health_check_interval() -> u64 {
    1_000
}
fn default_promotable_lag() -> u64 {
    16 * 1024 * 1024
}
fn default_events_retained() -> usize {
    1_000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_monitor_bind(),
            db_path: default_db_path(),
            network_partition_timeout_ms: default_partition_timeout(),
            drain_timeout_ms: default_drain_timeout(),
            health_check_interval_ms: default_health_check_interval(),
            promotable_lag_bytes: default_promotable_lag(),
            events_retained: default_events_retained(),
        }
    }
}

impl MonitorConfig {
    pub fn network_partition_timeout(&self) -> Duration {
        Duration::from_millis(self.network_partition_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network_partition_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "network_partition_timeout_ms must be positive".into(),
            ));
        }
        if self.drain_timeout_ms <= self.network_partition_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "drain_timeout_ms ({}) must exceed network_partition_timeout_ms ({})",
                self.drain_timeout_ms, self.network_partition_timeout_ms
            )));
        }
        if self.health_check_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "health_check_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Retry/backoff policy for failed transition operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive failures of one edge before the keeper gives up
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Randomize each delay within [delay/2, delay]
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_failures() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    1_000
}
fn default_max_backoff() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_failures(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_true(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.max(1.0).powi(failures.saturating_sub(1) as i32);
        let millis = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64) as u64;
        if self.jitter && millis > 1 {
            let low = millis / 2;
            Duration::from_millis(rand::random::<u64>() % (millis - low + 1) + low)
        } else {
            Duration::from_millis(millis)
        }
    }

    /// Has `failures` reached the ceiling?
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_consecutive_failures
    }
}

/// Hook commands run by the keeper's `CommandController`.
///
/// Keys are operation names (`observe`, `init_primary`, `promote`, ...).
/// Missing keys make the operation a no-op that succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            commands: BTreeMap::new(),
        }
    }
}

/// Keeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Node name, unique within the formation
    pub name: String,

    /// Address other nodes use to reach this node's database
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_formation")]
    pub formation: String,

    /// Requested group; the monitor picks one when absent
    #[serde(default)]
    pub group_id: Option<u32>,

    /// 0 means never promote this node
    #[serde(default = "default_candidate_priority")]
    pub candidate_priority: u8,

    #[serde(default = "default_true")]
    pub replication_quorum: bool,

    #[serde(default = "default_monitor_url")]
    pub monitor_url: String,

    /// Local FSM state file
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Upper bound for any single local operation
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// A writable keeper that cannot reach the monitor this long demotes itself
    #[serde(default = "default_partition_timeout")]
    pub network_partition_timeout_ms: u64,

    /// Time after the last monitor contact by which a writable node is
    /// demoted. The monitor promotes another node after its partition plus
    /// drain timeouts, so this must not exceed their sum.
    #[serde(default = "default_fencing_budget")]
    pub fencing_budget_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub hooks: HookConfig,
}

fn default_db_port() -> u16 {
    5432
}
fn default_formation() -> String {
    "default".to_string()
}
fn default_candidate_priority() -> u8 {
    50
}
fn default_monitor_url() -> String {
    "http://127.0.0.1:6000".to_string()
}
fn default_state_path() -> PathBuf {
    PathBuf::from("./keeper.state")
}
fn default_report_interval() -> u64 {
    5_000
}
fn default_request_timeout() -> u64 {
    5_000
}
fn default_operation_timeout() -> u64 {
    60_000
}
fn default_fencing_budget() -> u64 {
    default_partition_timeout() + default_drain_timeout()
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            name: "node_1".to_string(),
            host: "localhost".to_string(),
            port: default_db_port(),
            formation: default_formation(),
            group_id: None,
            candidate_priority: default_candidate_priority(),
            replication_quorum: true,
            monitor_url: default_monitor_url(),
            state_path: default_state_path(),
            report_interval_ms: default_report_interval(),
            request_timeout_ms: default_request_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            network_partition_timeout_ms: default_partition_timeout(),
            fencing_budget_ms: default_fencing_budget(),
            retry: RetryPolicy::default(),
            hooks: HookConfig::default(),
        }
    }
}

impl KeeperConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn network_partition_timeout(&self) -> Duration {
        Duration::from_millis(self.network_partition_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("keeper name cannot be empty".into()));
        }
        if self.candidate_priority > 100 {
            return Err(Error::InvalidConfig(format!(
                "candidate_priority must be within 0..=100, got {}",
                self.candidate_priority
            )));
        }
        if self.report_interval_ms == 0 || self.operation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "report_interval_ms and operation_timeout_ms must be positive".into(),
            ));
        }
        if self.network_partition_timeout_ms <= self.report_interval_ms {
            return Err(Error::InvalidConfig(
                "network_partition_timeout_ms must exceed report_interval_ms".into(),
            ));
        }
        // operations of a writable node stop at the partition deadline, the
        // failed report that follows and the next tick must fit the budget
        let worst_case =
            self.network_partition_timeout_ms + self.report_interval_ms + self.request_timeout_ms;
        if worst_case >= self.fencing_budget_ms {
            return Err(Error::InvalidConfig(format!(
                "network_partition_timeout_ms + report_interval_ms + request_timeout_ms ({}) \
                 must stay below fencing_budget_ms ({})",
                worst_case, self.fencing_budget_ms
            )));
        }
        if self.retry.max_consecutive_failures == 0 {
            return Err(Error::InvalidConfig(
                "retry.max_consecutive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_defaults_are_valid() {
        MonitorConfig::default().validate().unwrap();
        KeeperConfig::default().validate().unwrap();
    }

    #[test]
    fn test_drain_must_exceed_partition_timeout() {
        let config = MonitorConfig {
            drain_timeout_ms: 10_000,
            network_partition_timeout_ms: 20_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keeper_must_fence_within_budget() {
        let config = KeeperConfig {
            request_timeout_ms: 30_000,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fencing_budget_ms"));

        let config = KeeperConfig {
            request_timeout_ms: 30_000,
            fencing_budget_ms: 90_000,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = RetryPolicy {
            initial_backoff_ms: 400,
            jitter: true,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_keeper_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autofailover.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"

[keeper]
name = "node_b"
host = "10.0.0.2"
candidate_priority = 100

[keeper.retry]
max_consecutive_failures = 3

[keeper.hooks.commands]
promote = "pg_ctl promote"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        let keeper = config.keeper.unwrap();
        assert_eq!(keeper.name, "node_b");
        assert_eq!(keeper.candidate_priority, 100);
        assert_eq!(keeper.retry.max_consecutive_failures, 3);
        assert_eq!(keeper.retry.initial_backoff_ms, 1_000);
        assert_eq!(keeper.hooks.commands["promote"], "pg_ctl promote");
        assert_eq!(keeper.formation, "default");
    }
}
