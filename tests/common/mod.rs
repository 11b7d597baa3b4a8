//! In-process cluster harness: one monitor, several keepers over simulated
//! databases, all sharing a manual clock.

#![allow(dead_code)]

use async_trait::async_trait;
use autofailover::common::config::{KeeperConfig, MonitorConfig, RetryPolicy};
use autofailover::common::fsm::NodeState;
use autofailover::common::protocol::{
    GroupStatus, NodeStatus, RegisterRequest, RegisterResponse, ReportRequest, ReportResponse,
};
use autofailover::common::utils::ManualClock;
use autofailover::keeper::{Keeper, MonitorApi, SimulatedController, Tick};
use autofailover::{Error, MonitorService, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

pub const PARTITION_MS: u64 = 20_000;
pub const DRAIN_MS: u64 = 30_000;

/// Network link between one keeper and the monitor that tests can cut.
pub struct Link {
    service: Arc<MonitorService>,
    cut: AtomicBool,
}

impl Link {
    pub fn new(service: Arc<MonitorService>) -> Arc<Self> {
        Arc::new(Self {
            service,
            cut: AtomicBool::new(false),
        })
    }

    pub fn set_cut(&self, cut: bool) {
        self.cut.store(cut, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.cut.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("network partition".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MonitorApi for Link {
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        self.check()?;
        self.service.register(req).await
    }

    async fn report(&self, req: ReportRequest) -> Result<ReportResponse> {
        self.check()?;
        self.service.report(req).await
    }
}

pub struct Member {
    pub name: String,
    pub keeper: Keeper,
    pub db: Arc<SimulatedController>,
    pub link: Arc<Link>,
    pub config: KeeperConfig,
    /// Set once the keeper stopped, for a dropped node or a fatal error
    pub stopped: bool,
}

pub struct Cluster {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub service: Arc<MonitorService>,
    pub members: Vec<Member>,
    /// Rounds that had two writable databases at once
    pub split_brain_rounds: usize,
}

pub fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        network_partition_timeout_ms: PARTITION_MS,
        drain_timeout_ms: DRAIN_MS,
        ..Default::default()
    }
}

pub fn keeper_config(dir: &TempDir, name: &str, priority: u8) -> KeeperConfig {
    KeeperConfig {
        name: name.to_string(),
        host: format!("{}.db.local", name),
        candidate_priority: priority,
        state_path: dir.path().join(format!("{}.state", name)),
        report_interval_ms: 1_000,
        network_partition_timeout_ms: PARTITION_MS,
        retry: RetryPolicy {
            max_consecutive_failures: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 4_000,
            multiplier: 2.0,
            jitter: false,
        },
        ..Default::default()
    }
}

impl Cluster {
    pub fn new() -> Self {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let service = Arc::new(
            MonitorService::open_at(dir.path().join("monitor"), &monitor_config(), clock.clone())
                .unwrap(),
        );
        Self {
            dir,
            clock,
            service,
            members: Vec::new(),
            split_brain_rounds: 0,
        }
    }

    /// Add a keeper; it registers on its first step.
    pub fn add(&mut self, name: &str, priority: u8) {
        let config = keeper_config(&self.dir, name, priority);
        self.add_with(config);
    }

    pub fn add_with(&mut self, config: KeeperConfig) {
        let db = Arc::new(SimulatedController::new());
        let link = Link::new(self.service.clone());
        let keeper = Keeper::with_clock(config.clone(), link.clone(), db.clone(), self.clock.clone())
            .unwrap();
        self.members.push(Member {
            name: config.name.clone(),
            keeper,
            db,
            link,
            config,
            stopped: false,
        });
    }

    /// Replace a keeper process, keeping its database and state file.
    pub fn restart(&mut self, name: &str) {
        let clock = self.clock.clone();
        let member = self.member_mut(name);
        member.keeper = Keeper::with_clock(
            member.config.clone(),
            member.link.clone(),
            member.db.clone(),
            clock,
        )
        .unwrap();
        member.stopped = false;
    }

    pub fn member(&self, name: &str) -> &Member {
        self.members
            .iter()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("no member {}", name))
    }

    pub fn member_mut(&mut self, name: &str) -> &mut Member {
        self.members
            .iter_mut()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("no member {}", name))
    }

    pub fn partition(&self, name: &str, cut: bool) {
        self.member(name).link.set_cut(cut);
    }

    /// Every keeper steps once, the monitor sweeps, one second passes.
    pub async fn round(&mut self) {
        let order: Vec<usize> = (0..self.members.len()).collect();
        self.round_in(&order).await;
    }

    /// Like [`Cluster::round`], keepers stepping in the given order.
    pub async fn round_in(&mut self, order: &[usize]) {
        for &i in order {
            let member = &mut self.members[i];
            if member.stopped {
                continue;
            }
            match member.keeper.step().await {
                Ok(Tick::Dropped) => member.stopped = true,
                Ok(_) => {}
                Err(e) => {
                    eprintln!("keeper {} stopped: {}", member.name, e);
                    member.stopped = true;
                }
            }
        }
        self.service.health_sweep().await;
        if self.writers().len() > 1 {
            self.split_brain_rounds += 1;
        }
        self.clock.advance(Duration::from_secs(1));
    }

    pub async fn rounds(&mut self, n: usize) {
        for _ in 0..n {
            self.round().await;
        }
    }

    /// Step until `done` holds for the group, at most `max_rounds` times.
    pub async fn run_until(&mut self, max_rounds: usize, done: impl Fn(&GroupStatus) -> bool) -> bool {
        for _ in 0..max_rounds {
            self.round().await;
            if done(&self.group().await) {
                return true;
            }
        }
        false
    }

    pub async fn group(&self) -> GroupStatus {
        let state = self.service.formation_state("default").await.unwrap();
        state.groups.into_iter().next().expect("group 0 exists")
    }

    /// Names of members whose simulated database accepts writes.
    pub fn writers(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.db.snapshot().writable)
            .map(|m| m.name.clone())
            .collect()
    }
}

pub fn node<'a>(group: &'a GroupStatus, name: &str) -> &'a NodeStatus {
    group
        .nodes
        .iter()
        .find(|n| n.name == name)
        .unwrap_or_else(|| panic!("no node {} in group", name))
}

/// Current and goal states agree on `state`.
pub fn settled(group: &GroupStatus, name: &str, state: NodeState) -> bool {
    group
        .nodes
        .iter()
        .any(|n| n.name == name && n.current_state == state && n.goal_state == state)
}

/// A three node group with `a` as primary and `b`, `c` as secondaries.
pub async fn steady_three(priorities: [u8; 3]) -> Cluster {
    let mut cluster = Cluster::new();
    cluster.add("a", priorities[0]);
    cluster.rounds(2).await;
    cluster.add("b", priorities[1]);
    cluster.add("c", priorities[2]);
    let steady = cluster
        .run_until(40, |g| {
            settled(g, "a", NodeState::Primary)
                && settled(g, "b", NodeState::Secondary)
                && settled(g, "c", NodeState::Secondary)
        })
        .await;
    assert!(steady, "group never reached steady state: {:?}", cluster.group().await);
    cluster
}
