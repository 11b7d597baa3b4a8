//! Local database control
//!
//! The keeper never talks to the database directly: every local action goes
//! through a [`NodeController`]. [`CommandController`] runs the operator's
//! hook commands, [`SimulatedController`] keeps an in-memory stand-in used by
//! simulations and tests.

use crate::common::config::HookConfig;
use crate::common::error::{Error, Result};
use crate::common::protocol::{NodeEndpoint, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;

/// Result of a local operation: an optional diagnostic on success.
pub type Outcome = Result<Option<String>>;

/// What the keeper sees of its local database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObservation {
    pub running: bool,
    /// Replication progress (LSN-like)
    #[serde(default)]
    pub progress: u64,
    #[serde(default)]
    pub connected_standbys: u32,
}

#[async_trait]
pub trait NodeController: Send + Sync {
    async fn observe(&self) -> Result<LocalObservation>;

    async fn init_primary(&self) -> Outcome;

    /// Base backup from `upstream`, then stream from it.
    async fn init_standby(&self, upstream: &NodeEndpoint) -> Outcome;

    async fn start_following(&self, upstream: &NodeEndpoint) -> Outcome;

    async fn promote(&self) -> Outcome;

    async fn rewind(&self, upstream: &NodeEndpoint) -> Outcome;

    /// Fetch the history `upstream` has and we lack.
    async fn fast_forward(&self, upstream: &NodeEndpoint) -> Outcome;

    /// Empty `names` disables synchronous replication.
    async fn set_synchronous_standbys(&self, names: &str) -> Outcome;

    async fn update_access(&self, standbys: &[NodeEndpoint]) -> Outcome;

    async fn drain(&self) -> Outcome;

    async fn stop(&self) -> Outcome;

    async fn pause_replication(&self) -> Outcome;

    async fn prepare_promotion(&self) -> Outcome;

    async fn stop_replication(&self) -> Outcome;
}

/// Runs one shell command per operation, configured in [`HookConfig`].
///
/// Operation parameters are passed as environment variables:
/// `AUTOFAILOVER_UPSTREAM_{NODE_ID,NAME,HOST,PORT}`,
/// `AUTOFAILOVER_SYNC_STANDBY_NAMES` and `AUTOFAILOVER_STANDBYS`
/// (comma separated `name@host:port`). The `observe` hook must print a JSON
/// [`LocalObservation`] on stdout. A non-zero exit fails the operation with
/// its stderr as the reason.
pub struct CommandController {
    hooks: HookConfig,
}

impl CommandController {
    pub fn new(hooks: HookConfig) -> Self {
        Self { hooks }
    }

    async fn run(&self, operation: &str, env: Vec<(&'static str, String)>) -> Outcome {
        let Some(command) = self.hooks.commands.get(operation) else {
            tracing::debug!(operation, "No hook configured, skipping");
            return Ok(None);
        };

        tracing::debug!(operation, command = %command, "Running hook");
        let output = Command::new(&self.hooks.shell)
            .arg("-c")
            .arg(command)
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::OperationFailed {
                operation: operation.to_string(),
                reason: format!("cannot spawn {}: {}", self.hooks.shell, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::OperationFailed {
                operation: operation.to_string(),
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!stdout.is_empty()).then_some(stdout))
    }
}

fn upstream_env(upstream: &NodeEndpoint) -> Vec<(&'static str, String)> {
    vec![
        ("AUTOFAILOVER_UPSTREAM_NODE_ID", upstream.node_id.to_string()),
        ("AUTOFAILOVER_UPSTREAM_NAME", upstream.name.clone()),
        ("AUTOFAILOVER_UPSTREAM_HOST", upstream.host.clone()),
        ("AUTOFAILOVER_UPSTREAM_PORT", upstream.port.to_string()),
    ]
}

#[async_trait]
impl NodeController for CommandController {
    async fn observe(&self) -> Result<LocalObservation> {
        if !self.hooks.commands.contains_key("observe") {
            return Ok(LocalObservation {
                running: true,
                ..Default::default()
            });
        }
        let stdout = self.run("observe", Vec::new()).await?.unwrap_or_default();
        serde_json::from_str(&stdout).map_err(|e| Error::OperationFailed {
            operation: "observe".into(),
            reason: format!("invalid observation {:?}: {}", stdout, e),
        })
    }

    async fn init_primary(&self) -> Outcome {
        self.run("init_primary", Vec::new()).await
    }

    async fn init_standby(&self, upstream: &NodeEndpoint) -> Outcome {
        self.run("init_standby", upstream_env(upstream)).await
    }

    async fn start_following(&self, upstream: &NodeEndpoint) -> Outcome {
        self.run("start_following", upstream_env(upstream)).await
    }

    async fn promote(&self) -> Outcome {
        self.run("promote", Vec::new()).await
    }

    async fn rewind(&self, upstream: &NodeEndpoint) -> Outcome {
        self.run("rewind", upstream_env(upstream)).await
    }

    async fn fast_forward(&self, upstream: &NodeEndpoint) -> Outcome {
        self.run("fast_forward", upstream_env(upstream)).await
    }

    async fn set_synchronous_standbys(&self, names: &str) -> Outcome {
        let env = vec![("AUTOFAILOVER_SYNC_STANDBY_NAMES", names.to_string())];
        self.run("set_synchronous_standbys", env).await
    }

    async fn update_access(&self, standbys: &[NodeEndpoint]) -> Outcome {
        let list = standbys
            .iter()
            .map(|s| format!("{}@{}:{}", s.name, s.host, s.port))
            .collect::<Vec<_>>()
            .join(",");
        self.run("update_access", vec![("AUTOFAILOVER_STANDBYS", list)])
            .await
    }

    async fn drain(&self) -> Outcome {
        self.run("drain", Vec::new()).await
    }

    async fn stop(&self) -> Outcome {
        self.run("stop", Vec::new()).await
    }

    async fn pause_replication(&self) -> Outcome {
        self.run("pause_replication", Vec::new()).await
    }

    async fn prepare_promotion(&self) -> Outcome {
        self.run("prepare_promotion", Vec::new()).await
    }

    async fn stop_replication(&self) -> Outcome {
        self.run("stop_replication", Vec::new()).await
    }
}

/// In-memory database stand-in.
#[derive(Debug, Default)]
pub struct SimulatedController {
    inner: Mutex<SimulatedDatabase>,
}

/// Observable state of a [`SimulatedController`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatedDatabase {
    pub running: bool,
    pub writable: bool,
    pub progress: u64,
    pub upstream: Option<NodeId>,
    pub synchronous_standby_names: String,
    pub allowed: Vec<String>,
    /// Every operation run, in order
    pub calls: Vec<String>,
    /// Remaining forced failures per operation
    failures: HashMap<String, u32>,
    broken: HashSet<String>,
    stalled: HashSet<String>,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` runs of `operation` fail.
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.with(|db| {
            db.failures.insert(operation.to_string(), times);
        });
    }

    /// Make every run of `operation` fail until [`Self::repair`].
    pub fn break_operation(&self, operation: &str) {
        self.with(|db| {
            db.broken.insert(operation.to_string());
        });
    }

    pub fn repair(&self, operation: &str) {
        self.with(|db| {
            db.broken.remove(operation);
            db.failures.remove(operation);
            db.stalled.remove(operation);
        });
    }

    /// Make runs of `operation` hang, like a database that stopped answering.
    pub fn stall(&self, operation: &str) {
        self.with(|db| {
            db.stalled.insert(operation.to_string());
        });
    }

    async fn wait_unless_stalled(&self, operation: &str) {
        if self.with(|db| db.stalled.contains(operation)) {
            self.with(|db| db.calls.push(operation.to_string()));
            std::future::pending::<()>().await;
        }
    }

    /// Pretend writes or replay moved the database forward.
    pub fn advance(&self, by: u64) {
        self.with(|db| db.progress += by);
    }

    pub fn snapshot(&self) -> SimulatedDatabase {
        self.with(|db| db.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|db| db.calls.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut SimulatedDatabase) -> T) -> T {
        let mut db = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut db)
    }

    fn apply(&self, operation: &str, f: impl FnOnce(&mut SimulatedDatabase)) -> Outcome {
        self.with(|db| {
            db.calls.push(operation.to_string());
            let forced = match db.failures.get_mut(operation) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if forced || db.broken.contains(operation) {
                return Err(Error::OperationFailed {
                    operation: operation.to_string(),
                    reason: "simulated failure".into(),
                });
            }
            f(db);
            Ok(None)
        })
    }
}

#[async_trait]
impl NodeController for SimulatedController {
    async fn observe(&self) -> Result<LocalObservation> {
        Ok(self.with(|db| LocalObservation {
            running: db.running,
            progress: db.progress,
            connected_standbys: db.allowed.len() as u32,
        }))
    }

    async fn init_primary(&self) -> Outcome {
        self.apply("init_primary", |db| {
            db.running = true;
            db.writable = true;
        })
    }

    async fn init_standby(&self, upstream: &NodeEndpoint) -> Outcome {
        let id = upstream.node_id;
        self.apply("init_standby", |db| {
            db.running = true;
            db.writable = false;
            db.upstream = Some(id);
        })
    }

    async fn start_following(&self, upstream: &NodeEndpoint) -> Outcome {
        let id = upstream.node_id;
        self.apply("start_following", |db| {
            db.running = true;
            db.upstream = Some(id);
        })
    }

    async fn promote(&self) -> Outcome {
        self.apply("promote", |db| {
            db.running = true;
            db.writable = true;
            db.upstream = None;
        })
    }

    async fn rewind(&self, upstream: &NodeEndpoint) -> Outcome {
        let id = upstream.node_id;
        self.apply("rewind", |db| {
            db.running = true;
            db.writable = false;
            db.upstream = Some(id);
        })
    }

    async fn fast_forward(&self, upstream: &NodeEndpoint) -> Outcome {
        let id = upstream.node_id;
        self.apply("fast_forward", |db| db.upstream = Some(id))
    }

    async fn set_synchronous_standbys(&self, names: &str) -> Outcome {
        self.wait_unless_stalled("set_synchronous_standbys").await;
        let names = names.to_string();
        self.apply("set_synchronous_standbys", |db| {
            db.synchronous_standby_names = names
        })
    }

    async fn update_access(&self, standbys: &[NodeEndpoint]) -> Outcome {
        self.wait_unless_stalled("update_access").await;
        let allowed = standbys.iter().map(|s| s.name.clone()).collect();
        self.apply("update_access", |db| db.allowed = allowed)
    }

    async fn drain(&self) -> Outcome {
        self.apply("drain", |db| db.writable = false)
    }

    async fn stop(&self) -> Outcome {
        self.apply("stop", |db| {
            db.running = false;
            db.writable = false;
        })
    }

    async fn pause_replication(&self) -> Outcome {
        self.apply("pause_replication", |_| {})
    }

    async fn prepare_promotion(&self) -> Outcome {
        self.apply("prepare_promotion", |_| {})
    }

    async fn stop_replication(&self) -> Outcome {
        self.apply("stop_replication", |db| db.upstream = None)
    }
}
