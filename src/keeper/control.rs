//! Keeper control loop
//!
//! Each tick observes the local database, reports to the monitor and moves
//! at most one edge towards the goal state it gets back. The current state
//! is persisted before anything is reported about it.

use crate::common::config::KeeperConfig;
use crate::common::error::{Error, Result};
use crate::common::fsm::{EdgeKind, NodeState, TransitionTable};
use crate::common::metrics::METRICS;
use crate::common::protocol::{NodeId, QuorumDescription, RegisterRequest, ReportRequest, ReportResponse};
use crate::common::utils::{Clock, SystemClock};
use crate::keeper::client::MonitorApi;
use crate::keeper::controller::{LocalObservation, NodeController, Outcome};
use crate::keeper::state::{KeeperState, StateFile};
use crate::keeper::transitions::{Operations, TransitionContext};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What one iteration of the loop achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The monitor answered; `transitioned` when an edge was crossed
    Reported { transitioned: bool },
    /// The monitor could not be reached
    Unreachable,
    /// The monitor no longer knows this node
    Dropped,
}

pub struct Keeper {
    config: KeeperConfig,
    monitor: Arc<dyn MonitorApi>,
    controller: Arc<dyn NodeController>,
    clock: Arc<dyn Clock>,
    table: TransitionTable,
    operations: Operations,
    state_file: StateFile,
    state: KeeperState,
    assignment: Option<ReportResponse>,
    /// Edge that failed last, and when it may be tried again
    failing_edge: Option<(NodeState, NodeState)>,
    retry_at: Option<u64>,
    last_progress: u64,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Keeper {
    pub fn new(
        config: KeeperConfig,
        monitor: Arc<dyn MonitorApi>,
        controller: Arc<dyn NodeController>,
    ) -> Result<Self> {
        Self::with_clock(config, monitor, controller, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: KeeperConfig,
        monitor: Arc<dyn MonitorApi>,
        controller: Arc<dyn NodeController>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let table = TransitionTable::standard();
        let operations = Operations::standard();
        operations.verify(&table)?;

        let state_file = StateFile::new(&config.state_path);
        let mut state = match state_file.load()? {
            Some(state) => {
                if state.formation != config.formation {
                    return Err(Error::InvalidConfig(format!(
                        "state file {} belongs to formation {}, configured formation is {}",
                        state_file.path().display(),
                        state.formation,
                        config.formation
                    )));
                }
                info!(
                    node_id = ?state.node_id,
                    current = %state.current_state,
                    report_version = state.report_version,
                    "Loaded keeper state"
                );
                state
            }
            None => KeeperState::new(config.formation.clone()),
        };
        if state.last_monitor_contact == 0 {
            state.last_monitor_contact = clock.now_millis();
        }
        let failing_edge =
            (state.consecutive_failures > 0).then_some((state.current_state, state.goal_state));

        Ok(Self {
            config,
            monitor,
            controller,
            clock,
            table,
            operations,
            state_file,
            state,
            assignment: None,
            failing_edge,
            retry_at: None,
            last_progress: 0,
            shutdown: None,
        })
    }

    /// Replace the operation registry, checked against the transition table.
    pub fn with_operations(mut self, operations: Operations) -> Result<Self> {
        operations.verify(&self.table)?;
        self.operations = operations;
        Ok(self)
    }

    pub fn state(&self) -> &KeeperState {
        &self.state
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.state.node_id
    }

    pub fn current_state(&self) -> NodeState {
        self.state.current_state
    }

    /// Last answer of the monitor.
    pub fn assignment(&self) -> Option<&ReportResponse> {
        self.assignment.as_ref()
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Run until `shutdown` flips, the node is dropped, or a fatal error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            name = %self.config.name,
            formation = %self.config.formation,
            monitor = %self.config.monitor_url,
            "Starting keeper"
        );
        self.shutdown = Some(shutdown.clone());
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.step().await {
                Ok(Tick::Dropped) => {
                    warn!("Node was removed from the monitor, stopping");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    error!(state = %self.state.current_state, "Keeper stopping: {}", e);
                    return Err(e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.report_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(state = %self.state.current_state, "Keeper stopped");
        Ok(())
    }

    /// One iteration: register if needed, observe, report, move one edge.
    pub async fn step(&mut self) -> Result<Tick> {
        if !self.state.is_registered() {
            if let Err(e) = self.register().await {
                if e.is_retryable() {
                    METRICS.report_failures_total.inc();
                    warn!("Cannot register with the monitor: {}", e);
                    return Ok(Tick::Unreachable);
                }
                return Err(e);
            }
        }

        let observation = self.observe().await;
        let report = self.next_report(&observation)?;

        match self.monitor.report(report).await {
            Ok(response) => {
                self.state.last_monitor_contact = self.now();
                if self.shutting_down() {
                    debug!(goal = %response.goal_state, "Shutting down, goal left for the next start");
                    self.state_file.save(&self.state)?;
                    return Ok(Tick::Reported { transitioned: false });
                }
                let transitioned = self.apply(response).await?;
                Ok(Tick::Reported { transitioned })
            }
            Err(Error::NodeNotFound(id)) => {
                warn!(node_id = id, "Monitor does not know this node anymore");
                self.self_fence("node was dropped from the monitor").await?;
                Ok(Tick::Dropped)
            }
            Err(e) => {
                METRICS.report_failures_total.inc();
                warn!("Report failed: {}", e);
                self.check_partition().await?;
                Ok(Tick::Unreachable)
            }
        }
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Bound for a local operation. A writable node that may have to fence
    /// itself never waits past its partition deadline.
    fn operation_limit(&self) -> Duration {
        let limit = self.config.operation_timeout();
        let current = self.state.current_state;
        if !current.is_writable() || current == NodeState::Single {
            return limit;
        }
        let deadline = self.state.last_monitor_contact + self.config.network_partition_timeout_ms;
        let left = Duration::from_millis(deadline.saturating_sub(self.now()));
        limit.min(left)
    }

    async fn register(&mut self) -> Result<()> {
        let request = RegisterRequest {
            formation: self.config.formation.clone(),
            name: self.config.name.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            group_id: self.config.group_id,
            candidate_priority: self.config.candidate_priority,
            replication_quorum: self.config.replication_quorum,
        };
        let response = self.monitor.register(request).await?;
        info!(
            node_id = response.node_id,
            group_id = response.group_id,
            goal = %response.goal_state,
            "Registered with the monitor"
        );

        self.state.node_id = Some(response.node_id);
        self.state.group_id = Some(response.group_id);
        self.state.goal_state = response.goal_state;
        self.state.report_version = self.state.report_version.max(response.report_version);
        self.state.last_monitor_contact = self.now();
        self.state_file.save(&self.state)
    }

    async fn observe(&mut self) -> LocalObservation {
        let limit = self.operation_limit();
        let result = match tokio::time::timeout(limit, self.controller.observe()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "observe did not finish within {}ms",
                limit.as_millis()
            ))),
        };
        match result {
            Ok(observation) => {
                self.last_progress = observation.progress;
                observation
            }
            Err(e) => {
                warn!("Cannot observe local database: {}", e);
                LocalObservation {
                    running: false,
                    progress: self.last_progress,
                    connected_standbys: 0,
                }
            }
        }
    }

    /// Bump and persist the report version, then build the report.
    fn next_report(&mut self, observation: &LocalObservation) -> Result<ReportRequest> {
        let node_id = self
            .state
            .node_id
            .ok_or_else(|| Error::Internal("reporting before registration".into()))?;
        self.state.report_version += 1;
        self.state_file.save(&self.state)?;

        Ok(ReportRequest {
            node_id,
            report_version: self.state.report_version,
            current_state: self.state.current_state,
            progress: observation.progress,
            timestamp: self.now(),
            connected_standbys: observation.connected_standbys,
            last_error: self.state.last_error.clone(),
            applied_membership: self.state.applied_membership,
            applied_quorum_version: self.state.applied_quorum_version,
        })
    }

    async fn apply(&mut self, response: ReportResponse) -> Result<bool> {
        let goal = response.goal_state;
        if goal != self.state.goal_state {
            info!(
                current = %self.state.current_state,
                from = %self.state.goal_state,
                to = %goal,
                "New goal: {}",
                response.description
            );
            self.state.goal_state = goal;
        }
        self.assignment = Some(response);

        let transitioned = if goal == self.state.current_state {
            if self.failing_edge.take().is_some() {
                self.state.consecutive_failures = 0;
                self.retry_at = None;
            }
            self.ensure_settings().await;
            false
        } else {
            self.transition(goal).await?
        };
        self.state_file.save(&self.state)?;
        Ok(transitioned)
    }

    async fn transition(&mut self, goal: NodeState) -> Result<bool> {
        let from = self.state.current_state;
        let kind = match self.table.edge(from, goal) {
            Ok(kind) => kind,
            Err(e) => return Err(self.refuse(e).await),
        };
        let now = self.now();

        if self.failing_edge != Some((from, goal)) {
            self.failing_edge = None;
            self.retry_at = None;
            self.state.consecutive_failures = 0;
        }
        if let Some(at) = self.retry_at {
            if now < at {
                debug!(from = %from, to = %goal, "Backing off, {}ms left", at - now);
                return Ok(false);
            }
        }
        let Some(response) = self.assignment.as_ref() else {
            return Ok(false);
        };

        info!(from = %from, to = %goal, operation = %kind, "Applying transition");
        let ctx = TransitionContext {
            controller: self.controller.as_ref(),
            from,
            to: goal,
            upstream: response.upstream.as_ref(),
            standbys: &response.standbys,
            quorum: &response.quorum,
        };
        let what = format!("{} -> {}", from, goal);
        let result = bounded(
            self.operation_limit(),
            &what,
            self.operations.run(kind, &ctx),
        )
        .await;
        let membership = response.membership_version;
        let quorum_version = response.quorum.version;
        let upstream = response.upstream.as_ref().map(|u| u.node_id);

        match result {
            Ok(diagnostic) => {
                self.state.current_state = goal;
                self.state.consecutive_failures = 0;
                self.state.last_error = None;
                self.failing_edge = None;
                self.retry_at = None;
                self.record_applied(kind, membership, quorum_version, upstream);
                self.state_file.save(&self.state)?;
                METRICS.transitions_total.inc();
                match diagnostic {
                    Some(d) => info!(state = %goal, "Transition done: {}", d),
                    None => info!(state = %goal, "Transition done"),
                }
                Ok(true)
            }
            Err(e) => {
                let failures = self.state.consecutive_failures + 1;
                self.state.consecutive_failures = failures;
                self.state.last_error = Some(e.to_string());
                self.failing_edge = Some((from, goal));
                self.state_file.save(&self.state)?;
                METRICS.transition_failures_total.inc();

                if self.config.retry.exhausted(failures) {
                    return Err(Error::RetryCeilingExceeded {
                        from,
                        to: goal,
                        failures,
                        last_error: e.to_string(),
                    });
                }
                let delay = self.config.retry.backoff(failures);
                self.retry_at = Some(now + delay.as_millis() as u64);
                warn!(
                    from = %from,
                    to = %goal,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Transition failed: {}",
                    e
                );
                Ok(false)
            }
        }
    }

    /// The monitor asked for an edge outside the table. Nothing is applied;
    /// the error is persisted and sent in one last report before stopping.
    async fn refuse(&mut self, err: Error) -> Error {
        error!(current = %self.state.current_state, "Refusing goal: {}", err);
        self.state.last_error = Some(err.to_string());
        let observation = self.observe().await;
        let report = match self.next_report(&observation) {
            Ok(report) => report,
            Err(e) => {
                warn!("Cannot persist the refused goal: {}", e);
                return err;
            }
        };
        if let Err(e) = self.monitor.report(report).await {
            warn!("Cannot report the refused goal: {}", e);
        }
        err
    }

    /// Remember which monitor versions the local database now reflects.
    fn record_applied(
        &mut self,
        kind: EdgeKind,
        membership: u64,
        quorum_version: u64,
        upstream: Option<NodeId>,
    ) {
        match kind {
            EdgeKind::AddStandbyAccess => self.state.applied_membership = membership,
            EdgeKind::EnableSyncRep | EdgeKind::DisableSyncRep | EdgeKind::ApplySettings => {
                self.state.applied_quorum_version = quorum_version
            }
            EdgeKind::InitStandby
            | EdgeKind::Rewind
            | EdgeKind::FollowPrimary
            | EdgeKind::FastForward => self.state.upstream = upstream,
            EdgeKind::InitPrimary | EdgeKind::Promote | EdgeKind::StopReplication => {
                self.state.upstream = None
            }
            _ => {}
        }
    }

    /// Settled on the goal: keep the local database in line with the
    /// membership, quorum and upstream the monitor last sent.
    async fn ensure_settings(&mut self) {
        let Some(response) = self.assignment.as_ref() else {
            return;
        };
        let current = self.state.current_state;
        let limit = self.operation_limit();
        let controller = self.controller.as_ref();

        if current.is_writable() && self.state.applied_membership != response.membership_version {
            match bounded(limit, "update_access", controller.update_access(&response.standbys)).await {
                Ok(_) => {
                    debug!(version = response.membership_version, "Standby access updated");
                    self.state.applied_membership = response.membership_version;
                }
                Err(e) => {
                    warn!("Cannot update standby access: {}", e);
                    self.state.last_error = Some(e.to_string());
                }
            }
        }

        if current.is_writable() && self.state.applied_quorum_version != response.quorum.version {
            let names = match current {
                NodeState::Primary | NodeState::ApplySettings | NodeState::JoinPrimary => {
                    response.quorum.synchronous_standby_names()
                }
                _ => String::new(),
            };
            match bounded(
                limit,
                "set_synchronous_standbys",
                controller.set_synchronous_standbys(&names),
            )
            .await
            {
                Ok(_) => {
                    debug!(version = response.quorum.version, names = %names, "Quorum applied");
                    self.state.applied_quorum_version = response.quorum.version;
                }
                Err(e) => {
                    warn!("Cannot apply synchronous standby names: {}", e);
                    self.state.last_error = Some(e.to_string());
                }
            }
        }

        if matches!(current, NodeState::Secondary | NodeState::Catchingup) {
            if let Some(upstream) = response.upstream.as_ref() {
                if self.state.upstream != Some(upstream.node_id) {
                    match bounded(limit, "start_following", controller.start_following(upstream)).await {
                        Ok(_) => {
                            info!(upstream = %upstream, "Following new upstream");
                            self.state.upstream = Some(upstream.node_id);
                        }
                        Err(e) => {
                            warn!("Cannot follow {}: {}", upstream, e);
                            self.state.last_error = Some(e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// A writable node that lost the monitor for longer than the partition
    /// timeout demotes itself: a standby may be promoted meanwhile.
    async fn check_partition(&mut self) -> Result<()> {
        let current = self.state.current_state;
        if !current.is_writable() || current == NodeState::Single {
            return Ok(());
        }
        let silent = self.now().saturating_sub(self.state.last_monitor_contact);
        if silent <= self.config.network_partition_timeout_ms {
            debug!(silent_ms = silent, "Monitor unreachable, still within partition timeout");
            return Ok(());
        }
        self.self_fence(&format!("monitor unreachable for {}ms", silent))
            .await
    }

    async fn self_fence(&mut self, reason: &str) -> Result<()> {
        let from = self.state.current_state;
        if !from.is_writable() {
            return Ok(());
        }
        let kind = self.table.edge(from, NodeState::DemoteTimeout)?;
        warn!(state = %from, "Demoting local node: {}", reason);

        let quorum = QuorumDescription::default();
        let ctx = TransitionContext {
            controller: self.controller.as_ref(),
            from,
            to: NodeState::DemoteTimeout,
            upstream: None,
            standbys: &[],
            quorum: &quorum,
        };
        let result = bounded(
            self.config.operation_timeout(),
            "self-fencing",
            self.operations.run(kind, &ctx),
        )
        .await;

        match result {
            Ok(_) => {
                self.state.current_state = NodeState::DemoteTimeout;
                self.state.last_error = Some(reason.to_string());
                METRICS.self_fencing_total.inc();
            }
            Err(e) => {
                error!("Self-fencing failed, retrying next tick: {}", e);
                self.state.last_error = Some(format!("{}: {}", reason, e));
            }
        }
        self.state_file.save(&self.state)
    }
}

async fn bounded<F>(limit: Duration, what: &str, operation: F) -> Outcome
where
    F: Future<Output = Outcome>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "{} did not finish within {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::RetryPolicy;
    use crate::common::protocol::{GroupHealth, NodeEndpoint, RegisterResponse};
    use crate::common::utils::ManualClock;
    use crate::keeper::controller::SimulatedController;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    /// Monitor answering whatever goal the test sets.
    struct Scripted {
        goal: Mutex<NodeState>,
        reachable: Mutex<bool>,
        dropped: Mutex<bool>,
        reports: Mutex<Vec<ReportRequest>>,
        /// Flipped while a report is in flight
        stop_on_report: Mutex<Option<watch::Sender<bool>>>,
    }

    impl Scripted {
        fn new(goal: NodeState) -> Arc<Self> {
            Arc::new(Self {
                goal: Mutex::new(goal),
                reachable: Mutex::new(true),
                dropped: Mutex::new(false),
                reports: Mutex::new(Vec::new()),
                stop_on_report: Mutex::new(None),
            })
        }

        fn set_goal(&self, goal: NodeState) {
            *self.goal.lock().unwrap() = goal;
        }

        fn last_report(&self) -> ReportRequest {
            self.reports.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl MonitorApi for Scripted {
        async fn register(&self, _req: RegisterRequest) -> Result<RegisterResponse> {
            Ok(RegisterResponse {
                node_id: 1,
                group_id: 0,
                goal_state: *self.goal.lock().unwrap(),
                description: String::new(),
                report_version: 0,
            })
        }

        async fn report(&self, req: ReportRequest) -> Result<ReportResponse> {
            if *self.dropped.lock().unwrap() {
                return Err(Error::NodeNotFound(req.node_id));
            }
            if !*self.reachable.lock().unwrap() {
                return Err(Error::ConnectionFailed("connection refused".into()));
            }
            self.reports.lock().unwrap().push(req);
            if let Some(tx) = self.stop_on_report.lock().unwrap().as_ref() {
                let _ = tx.send(true);
            }
            Ok(ReportResponse {
                goal_state: *self.goal.lock().unwrap(),
                description: "scripted".into(),
                quorum: QuorumDescription::default(),
                upstream: Some(NodeEndpoint {
                    node_id: 2,
                    name: "b".into(),
                    host: "10.0.0.2".into(),
                    port: 5432,
                }),
                standbys: Vec::new(),
                membership_version: 1,
                group_health: GroupHealth::Healthy,
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: KeeperConfig,
        monitor: Arc<Scripted>,
        db: Arc<SimulatedController>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new(goal: NodeState) -> Self {
            let dir = tempdir().unwrap();
            let config = KeeperConfig {
                name: "a".into(),
                state_path: dir.path().join("keeper.state"),
                report_interval_ms: 1_000,
                network_partition_timeout_ms: 20_000,
                retry: RetryPolicy {
                    max_consecutive_failures: 3,
                    initial_backoff_ms: 1_000,
                    max_backoff_ms: 4_000,
                    multiplier: 2.0,
                    jitter: false,
                },
                ..Default::default()
            };
            Self {
                _dir: dir,
                config,
                monitor: Scripted::new(goal),
                db: Arc::new(SimulatedController::new()),
                clock: Arc::new(ManualClock::new(1_000_000)),
            }
        }

        fn keeper(&self) -> Keeper {
            Keeper::with_clock(
                self.config.clone(),
                self.monitor.clone(),
                self.db.clone(),
                self.clock.clone(),
            )
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_single_node_bootstrap() {
        let f = Fixture::new(NodeState::Single);
        let mut keeper = f.keeper();

        let tick = keeper.step().await.unwrap();
        assert_eq!(tick, Tick::Reported { transitioned: true });
        assert_eq!(keeper.current_state(), NodeState::Single);
        assert!(f.db.snapshot().writable);
        // the report described the state before the edge
        assert_eq!(f.monitor.last_report().current_state, NodeState::Init);

        let tick = keeper.step().await.unwrap();
        assert_eq!(tick, Tick::Reported { transitioned: false });
        assert_eq!(f.monitor.last_report().current_state, NodeState::Single);
        assert_eq!(keeper.state().applied_membership, 1);
    }

    #[tokio::test]
    async fn test_illegal_goal_is_fatal_and_changes_nothing() {
        let f = Fixture::new(NodeState::Secondary);
        let mut keeper = f.keeper();

        let err = keeper.step().await.unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalTransition {
                from: NodeState::Init,
                to: NodeState::Secondary
            }
        ));
        assert!(err.is_fatal());
        assert_eq!(keeper.current_state(), NodeState::Init);
        assert!(f.db.calls().is_empty());

        // the monitor hears about the refused edge before the keeper stops
        let reports = f.monitor.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 2);
        let last = reports.last().unwrap();
        assert_eq!(last.current_state, NodeState::Init);
        assert_eq!(
            last.last_error.as_deref(),
            Some("Illegal transition from init to secondary")
        );
        let saved = StateFile::new(&f.config.state_path).load().unwrap().unwrap();
        assert_eq!(saved.last_error, last.last_error);
        assert_eq!(saved.report_version, last.report_version);
    }

    #[tokio::test]
    async fn test_retry_backoff_then_ceiling() {
        let f = Fixture::new(NodeState::Single);
        f.db.break_operation("init_primary");
        let mut keeper = f.keeper();

        keeper.step().await.unwrap();
        assert_eq!(keeper.state().consecutive_failures, 1);
        assert!(keeper.state().last_error.is_some());

        // still backing off: no new attempt
        f.clock.advance(Duration::from_millis(500));
        keeper.step().await.unwrap();
        assert_eq!(f.db.calls().len(), 1);
        assert!(f.monitor.last_report().last_error.is_some());

        f.clock.advance(Duration::from_millis(600));
        keeper.step().await.unwrap();
        assert_eq!(keeper.state().consecutive_failures, 2);

        f.clock.advance(Duration::from_secs(3));
        let err = keeper.step().await.unwrap_err();
        assert!(matches!(
            err,
            Error::RetryCeilingExceeded { failures: 3, .. }
        ));
        assert_eq!(keeper.current_state(), NodeState::Init);
    }

    #[tokio::test]
    async fn test_failure_then_recovery_clears_error() {
        let f = Fixture::new(NodeState::Single);
        f.db.fail_next("init_primary", 1);
        let mut keeper = f.keeper();

        keeper.step().await.unwrap();
        f.clock.advance(Duration::from_secs(2));
        let tick = keeper.step().await.unwrap();
        assert_eq!(tick, Tick::Reported { transitioned: true });
        assert_eq!(keeper.state().consecutive_failures, 0);
        assert!(keeper.state().last_error.is_none());
    }

    #[tokio::test]
    async fn test_self_fencing_on_partition() {
        let f = Fixture::new(NodeState::Single);
        let mut keeper = f.keeper();
        keeper.step().await.unwrap();
        f.monitor.set_goal(NodeState::WaitPrimary);
        keeper.step().await.unwrap();
        assert_eq!(keeper.current_state(), NodeState::WaitPrimary);

        *f.monitor.reachable.lock().unwrap() = false;
        f.clock.advance(Duration::from_secs(10));
        assert_eq!(keeper.step().await.unwrap(), Tick::Unreachable);
        assert_eq!(keeper.current_state(), NodeState::WaitPrimary);

        f.clock.advance(Duration::from_secs(11));
        keeper.step().await.unwrap();
        assert_eq!(keeper.current_state(), NodeState::DemoteTimeout);
        assert!(!f.db.snapshot().writable);
    }

    #[tokio::test]
    async fn test_stalled_operation_stops_at_partition_deadline() {
        let mut f = Fixture::new(NodeState::Single);
        f.config.network_partition_timeout_ms = 300;
        f.config.report_interval_ms = 100;
        let mut keeper = f.keeper();
        keeper.step().await.unwrap();
        f.monitor.set_goal(NodeState::WaitPrimary);
        keeper.step().await.unwrap();
        assert_eq!(keeper.current_state(), NodeState::WaitPrimary);

        // the database hangs: the edge gives up at the deadline, not after
        // the operation timeout
        f.db.stall("set_synchronous_standbys");
        f.monitor.set_goal(NodeState::Primary);
        let tick = tokio::time::timeout(Duration::from_secs(5), keeper.step())
            .await
            .expect("operation outlived the partition deadline")
            .unwrap();
        assert_eq!(tick, Tick::Reported { transitioned: false });
        assert!(keeper
            .state()
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("did not finish within 300ms")));

        *f.monitor.reachable.lock().unwrap() = false;
        f.clock.advance(Duration::from_millis(301));
        keeper.step().await.unwrap();
        assert_eq!(keeper.current_state(), NodeState::DemoteTimeout);
        assert!(!f.db.snapshot().writable);
    }

    #[tokio::test]
    async fn test_single_does_not_fence_itself() {
        let f = Fixture::new(NodeState::Single);
        let mut keeper = f.keeper();
        keeper.step().await.unwrap();

        *f.monitor.reachable.lock().unwrap() = false;
        f.clock.advance(Duration::from_secs(60));
        keeper.step().await.unwrap();
        assert_eq!(keeper.current_state(), NodeState::Single);
    }

    #[tokio::test]
    async fn test_dropped_node_fences_and_stops() {
        let f = Fixture::new(NodeState::Single);
        let mut keeper = f.keeper();
        keeper.step().await.unwrap();

        *f.monitor.dropped.lock().unwrap() = true;
        assert_eq!(keeper.step().await.unwrap(), Tick::Dropped);
        assert_eq!(keeper.current_state(), NodeState::DemoteTimeout);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let f = Fixture::new(NodeState::Single);
        let mut keeper = f.keeper();
        keeper.step().await.unwrap();
        keeper.step().await.unwrap();
        let version = keeper.state().report_version;
        drop(keeper);

        let mut keeper = f.keeper();
        assert_eq!(keeper.current_state(), NodeState::Single);
        assert_eq!(keeper.node_id(), Some(1));
        keeper.step().await.unwrap();
        assert_eq!(f.monitor.last_report().report_version, version + 1);
        // no second registration nor a second init
        assert_eq!(
            f.db.calls().iter().filter(|c| *c == "init_primary").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_follows_new_upstream_when_settled() {
        let f = Fixture::new(NodeState::WaitStandby);
        let mut keeper = f.keeper();
        keeper.step().await.unwrap();
        assert_eq!(keeper.current_state(), NodeState::WaitStandby);

        f.monitor.set_goal(NodeState::Catchingup);
        keeper.step().await.unwrap();
        assert_eq!(keeper.state().upstream, Some(2));

        // settled, upstream unchanged: nothing to do
        keeper.step().await.unwrap();
        assert_eq!(
            f.db.calls(),
            vec!["init_standby".to_string()]
        );
    }

    #[tokio::test]
    async fn test_incomplete_registry_refused() {
        let f = Fixture::new(NodeState::Single);
        let mut ops = Operations::standard();
        ops.unregister(EdgeKind::Rewind);
        let err = f.keeper().with_operations(ops).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = Fixture::new(NodeState::Single);
        let keeper = f.keeper();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(keeper.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(f.db.snapshot().writable);
    }

    #[tokio::test]
    async fn test_shutdown_during_report_skips_transition() {
        let f = Fixture::new(NodeState::Single);
        let keeper = f.keeper();
        let (tx, rx) = watch::channel(false);
        *f.monitor.stop_on_report.lock().unwrap() = Some(tx);

        keeper.run(rx).await.unwrap();
        assert_eq!(f.monitor.reports.lock().unwrap().len(), 1);
        assert!(f.db.calls().is_empty());
        let saved = StateFile::new(&f.config.state_path).load().unwrap().unwrap();
        assert_eq!(saved.current_state, NodeState::Init);
        assert_eq!(saved.report_version, 1);
    }
}
