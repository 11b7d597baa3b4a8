//! Decision engine
//!
//! Pure function of a group and the monitor clock: reads the reported
//! states, writes goal states, the quorum and the group health, and returns
//! the notes describing what it decided. Callers hold the group lock and
//! persist the group together with the notes.
//!
//! Split-brain ordering is enforced at a single place, [`Pass::promotion_safe`]:
//! no candidate is ever handed a writable goal while another node may still
//! accept writes.

use super::events::Note;
use super::model::{Election, ElectionKind, Group, Node};
use super::quorum;
use crate::common::config::MonitorConfig;
use crate::common::error::{Error, Result};
use crate::common::fsm::{NodeState, TransitionTable};
use crate::common::metrics::METRICS;
use crate::common::protocol::{GroupHealth, NodeId};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub partition_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub promotable_lag_bytes: u64,
}

impl From<&MonitorConfig> for EngineConfig {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            partition_timeout_ms: config.network_partition_timeout_ms,
            drain_timeout_ms: config.drain_timeout_ms,
            promotable_lag_bytes: config.promotable_lag_bytes,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

pub struct Engine {
    config: EngineConfig,
    table: TransitionTable,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            table: TransitionTable::standard(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Re-evaluate every rule for the group.
    pub fn proceed(&self, group: &mut Group, now: u64) -> Vec<Note> {
        let mut pass = Pass::new(self, group, now);
        pass.run();
        pass.notes
    }

    /// Insert a freshly registered node and assign its first goal.
    pub fn register(&self, group: &mut Group, node: Node, now: u64) -> Vec<Note> {
        let node_id = node.node_id;
        let mut pass = Pass::new(self, group, now);
        let alone = pass.group.nodes.is_empty();
        pass.group.membership_version += 1;

        let mut node = node;
        node.joined_membership = pass.group.membership_version;
        pass.group.nodes.insert(node_id, node);

        if alone {
            if pass.tombstone_cleared() {
                pass.assign(node_id, NodeState::Single, "first node of the group");
            } else {
                pass.hold_for_tombstone(node_id);
            }
        } else {
            pass.assign(node_id, NodeState::WaitStandby, "waiting for the primary to let it in");
            if let Some(p) = pass.group.primary_id() {
                let primary = &pass.group.nodes[&p];
                let (settled, current) = (primary.is_settled(), primary.current_state);
                if settled {
                    match current {
                        NodeState::Single => {
                            pass.assign(p, NodeState::WaitPrimary, "a standby joined the group")
                        }
                        NodeState::Primary | NodeState::WaitPrimary => {
                            pass.assign(p, NodeState::JoinPrimary, "a standby joined the group")
                        }
                        _ => {}
                    }
                }
            }
        }
        pass.run();
        pass.notes
    }

    /// Remove a node. A dropped primary leaves a tombstone and triggers an
    /// election among the remaining standbys.
    pub fn drop_node(&self, group: &mut Group, node_id: NodeId, now: u64) -> Option<(Node, Vec<Note>)> {
        let mut pass = Pass::new(self, group, now);
        let removed = pass.group.nodes.remove(&node_id)?;
        pass.group.membership_version += 1;
        pass.notes
            .push(Note::node(&removed, format!("node {} dropped from the group", removed.name)));

        let was_primary = removed.goal_state.is_writable();
        if was_primary || !removed.current_state.is_quiesced() {
            pass.group.tombstone = Some(super::model::Tombstone {
                node_id,
                name: removed.name.clone(),
                dropped_at: now,
            });
        }

        if let Some(election) = pass.group.election.as_mut() {
            if election.old_primary == Some(node_id) {
                election.old_primary = None;
            }
            if election.fast_forward_from == Some(node_id) {
                election.fast_forward_from = None;
            }
        }
        let was_candidate = pass
            .group
            .election
            .as_ref()
            .is_some_and(|e| e.candidate == Some(node_id));

        if was_candidate {
            pass.restart_round("promotion candidate was dropped");
        } else if was_primary && !pass.group.nodes.is_empty() {
            pass.start_election(
                ElectionKind::Drop,
                None,
                NodeState::DemoteTimeout,
                format!("primary {} was dropped", removed.name),
            );
        }
        pass.run();
        Some((removed, pass.notes))
    }

    /// Operator-requested role change.
    pub fn start_switchover(&self, group: &mut Group, now: u64) -> Result<Vec<Note>> {
        let mut pass = Pass::new(self, group, now);
        let p = pass.check_primary_movable("switchover")?;
        pass.start_election(
            ElectionKind::Switchover,
            Some(p),
            NodeState::Draining,
            "switchover requested".to_string(),
        );
        METRICS.switchovers_total.inc();
        pass.run();
        Ok(pass.notes)
    }

    /// Move a node to maintenance. The primary is first replaced.
    pub fn start_maintenance(&self, group: &mut Group, node_id: NodeId, now: u64) -> Result<Vec<Note>> {
        let mut pass = Pass::new(self, group, now);
        let node = pass.group.nodes.get(&node_id).ok_or(Error::NodeNotFound(node_id))?;

        if node.maintenance_requested {
            return Err(Error::InvalidSetting(format!(
                "node {} is already in maintenance",
                node.name
            )));
        }

        if node.goal_state.is_writable() {
            let p = pass.check_primary_movable("maintenance")?;
            pass.start_election(
                ElectionKind::Maintenance,
                Some(p),
                NodeState::PrepareMaintenance,
                "maintenance requested on the primary".to_string(),
            );
        } else if !matches!(
            (node.current_state, node.goal_state),
            (NodeState::Secondary, NodeState::Secondary)
                | (NodeState::Catchingup, NodeState::Catchingup)
        ) {
            return Err(Error::InvalidSetting(format!(
                "node {} is {} (goal {}), maintenance needs a settled standby",
                node.name, node.current_state, node.goal_state
            )));
        }

        if let Some(node) = pass.group.nodes.get_mut(&node_id) {
            node.maintenance_requested = true;
        }
        pass.run();
        Ok(pass.notes)
    }

    /// Bring a node back from maintenance.
    pub fn stop_maintenance(&self, group: &mut Group, node_id: NodeId, now: u64) -> Result<Vec<Note>> {
        let mut pass = Pass::new(self, group, now);
        let node = pass.group.nodes.get_mut(&node_id).ok_or(Error::NodeNotFound(node_id))?;

        if !node.maintenance_requested {
            return Err(Error::InvalidSetting(format!(
                "node {} is not in maintenance",
                node.name
            )));
        }
        if !(node.current_state == NodeState::Maintenance && node.is_settled()) {
            return Err(Error::InvalidSetting(format!(
                "node {} is still moving to maintenance ({} -> {})",
                node.name, node.current_state, node.goal_state
            )));
        }
        node.maintenance_requested = false;
        pass.run();
        Ok(pass.notes)
    }
}

/// One evaluation of the rules over a locked group.
struct Pass<'a> {
    engine: &'a Engine,
    group: &'a mut Group,
    now: u64,
    notes: Vec<Note>,
}

impl<'a> Pass<'a> {
    fn new(engine: &'a Engine, group: &'a mut Group, now: u64) -> Self {
        Self {
            engine,
            group,
            now,
            notes: Vec::new(),
        }
    }

    fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    fn healthy(&self, node_id: NodeId) -> bool {
        self.group
            .nodes
            .get(&node_id)
            .is_some_and(|n| n.is_healthy(self.now, self.config().partition_timeout_ms))
    }

    fn name(&self, node_id: NodeId) -> String {
        self.group
            .nodes
            .get(&node_id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| format!("node {}", node_id))
    }

    fn assign(&mut self, node_id: NodeId, goal: NodeState, description: impl Into<String>) {
        let now = self.now;
        let Some(node) = self.group.nodes.get_mut(&node_id) else {
            return;
        };
        if node.goal_state == goal {
            return;
        }
        let description = description.into();
        debug!(
            node_id,
            from = %node.goal_state,
            to = %goal,
            "{}", description
        );
        node.goal_state = goal;
        node.goal_changed_at = now;
        node.description = description.clone();
        METRICS.goal_changes_total.inc();

        let text = format!("Setting goal state of {} to {}: {}", node.name, goal, description);
        self.notes.push(Note::node(node, text));
    }

    fn run(&mut self) {
        if self.group.nodes.is_empty() {
            return;
        }
        self.contain_writers();
        if self.group.election.is_some() {
            self.progress_election();
        } else {
            self.check_primary();
        }
        self.settle_standbys();
        self.refresh_quorum();
        self.settle_primary();
        self.refresh_health();
    }

    /// A node reporting a writable state it was never assigned is told to
    /// demote. Nodes already stepping down are left on their path.
    fn contain_writers(&mut self) {
        let rogue: Vec<(NodeId, NodeState, NodeState)> = self
            .group
            .nodes
            .values()
            .filter(|n| {
                n.current_state.is_writable()
                    && !n.goal_state.is_writable()
                    && !n.goal_state.is_demote_class()
            })
            .map(|n| (n.node_id, n.current_state, n.goal_state))
            .collect();

        for (id, current, goal) in rogue {
            let primary = self.group.primary_id().map(|p| self.name(p));
            warn!(
                node_id = id,
                current = %current,
                goal = %goal,
                primary = ?primary,
                "node reports a writable state it was not assigned"
            );
            self.assign(
                id,
                NodeState::DemoteTimeout,
                format!("reported {} while its goal was {}, possible split-brain", current, goal),
            );
        }
    }

    /// Healthy standbys streaming from the primary, excluding `except`.
    fn electable(&self, except: Option<NodeId>) -> Vec<NodeId> {
        self.group
            .nodes
            .values()
            .filter(|n| Some(n.node_id) != except)
            .filter(|n| {
                n.current_state == NodeState::Secondary
                    && n.goal_state == NodeState::Secondary
                    && !n.maintenance_requested
                    && n.is_healthy(self.now, self.config().partition_timeout_ms)
            })
            .map(|n| n.node_id)
            .collect()
    }

    fn check_primary_movable(&self, action: &str) -> Result<NodeId> {
        let reject = |reason: String| Err(Error::SwitchoverRejected(reason));

        if let Some(election) = &self.group.election {
            return reject(format!("a {} is already in progress", election.kind));
        }
        let Some(p) = self.group.primary_id() else {
            return reject(format!("group {} has no primary", self.group.key()));
        };
        let primary = &self.group.nodes[&p];
        if !self.healthy(p) {
            return reject(format!("primary {} is not reporting", primary.name));
        }
        if !primary.is_settled()
            || !matches!(primary.current_state, NodeState::Primary | NodeState::WaitPrimary)
        {
            return reject(format!(
                "primary {} is {} (goal {}), {} needs primary or wait_primary",
                primary.name, primary.current_state, primary.goal_state, action
            ));
        }
        let has_candidate = self
            .electable(Some(p))
            .iter()
            .any(|id| self.group.nodes[id].candidate_priority > 0);
        if !has_candidate {
            return Err(Error::NoCandidate {
                formation: self.group.formation.clone(),
                group_id: self.group.group_id,
            });
        }
        Ok(p)
    }

    /// Demote `old_primary` (if any) and ask the standbys for their
    /// progress. Returns false when no standby may be promoted.
    fn start_election(
        &mut self,
        kind: ElectionKind,
        old_primary: Option<NodeId>,
        old_goal: NodeState,
        reason: String,
    ) -> bool {
        let electable = self.electable(old_primary);
        let has_candidate = electable
            .iter()
            .any(|id| self.group.nodes[id].candidate_priority > 0);
        if !has_candidate {
            debug!(group = %self.group.key(), "{}, but no standby can be promoted", reason);
            return false;
        }

        info!(group = %self.group.key(), kind = %kind, "{}", reason);
        if let Some(old) = old_primary {
            self.assign(old, old_goal, reason.clone());
        }
        if kind == ElectionKind::Failover {
            METRICS.failovers_total.inc();
        }

        let mut election = Election {
            kind,
            old_primary,
            started_at: self.now,
            candidate: None,
            fast_forward_from: None,
        };

        if let [only] = electable.as_slice() {
            let only = *only;
            self.assign(
                only,
                NodeState::PreparePromotion,
                format!("{}: only standby left, preparing promotion", reason),
            );
            election.candidate = Some(only);
        } else {
            for id in electable {
                self.assign(
                    id,
                    NodeState::ReportLsn,
                    format!("{}: reporting progress for candidate selection", reason),
                );
            }
        }
        self.group.election = Some(election);
        true
    }

    /// No election running: start one if the designated primary went silent.
    fn check_primary(&mut self) {
        match self.group.primary_id() {
            Some(p) => {
                let fenced = self.group.nodes[&p].current_state == NodeState::DemoteTimeout;
                if self.healthy(p) && fenced {
                    let reason = format!(
                        "primary {} demoted itself after losing the monitor",
                        self.name(p)
                    );
                    if !self.start_election(
                        ElectionKind::Failover,
                        Some(p),
                        NodeState::DemoteTimeout,
                        reason,
                    ) {
                        self.assign(
                            p,
                            NodeState::WaitPrimary,
                            "no standby can be promoted, resuming writes",
                        );
                    }
                    return;
                }
                if self.healthy(p) {
                    return;
                }
                let reason = format!(
                    "primary {} has not reported for more than {}ms",
                    self.name(p),
                    self.config().partition_timeout_ms
                );
                self.start_election(
                    ElectionKind::Failover,
                    Some(p),
                    NodeState::DemoteTimeout,
                    reason,
                );
            }
            None => {
                if !self.electable(None).is_empty() {
                    self.start_election(
                        ElectionKind::Failover,
                        None,
                        NodeState::DemoteTimeout,
                        "group has no primary".to_string(),
                    );
                } else {
                    self.admit_held_node();
                }
            }
        }
    }

    /// A node registering into a group whose primary was just dropped stays
    /// in init until the dropped primary can no longer write.
    fn hold_for_tombstone(&mut self, node_id: NodeId) {
        let Some(tombstone) = &self.group.tombstone else {
            return;
        };
        let text = format!(
            "waiting up to {}ms for dropped primary {} to stop",
            self.config().drain_timeout_ms,
            tombstone.name
        );
        info!(group = %self.group.key(), node_id, "{}", text);
        if let Some(node) = self.group.nodes.get(&node_id) {
            self.notes.push(Note::node(node, text));
        }
    }

    fn admit_held_node(&mut self) {
        let held = self
            .group
            .nodes
            .values()
            .filter(|n| n.current_state == NodeState::Init && n.goal_state == NodeState::Init)
            .map(|n| n.node_id)
            .min();
        let Some(id) = held else {
            return;
        };
        if self.tombstone_cleared() {
            self.assign(id, NodeState::Single, "dropped primary presumed stopped, first node of the group");
        }
    }

    /// False while a dropped primary may still accept writes. An expired
    /// tombstone is removed.
    fn tombstone_cleared(&mut self) -> bool {
        let drain_timeout = self.config().drain_timeout_ms;
        let Some(tombstone) = &self.group.tombstone else {
            return true;
        };
        if self.now.saturating_sub(tombstone.dropped_at) <= drain_timeout {
            return false;
        }
        let text = format!(
            "dropped primary {} presumed stopped after {}ms",
            tombstone.name, drain_timeout
        );
        self.notes.push(Note::group(text));
        self.group.tombstone = None;
        true
    }

    fn progress_election(&mut self) {
        let Some(election) = self.group.election.clone() else {
            return;
        };
        if let Some(old) = election.old_primary {
            self.progress_old_primary(old);
        }
        match election.candidate {
            None => self.select_candidate(),
            Some(c) => self.progress_candidate(&election, c),
        }
    }

    fn progress_old_primary(&mut self, old: NodeId) {
        let Some(node) = self.group.nodes.get(&old) else {
            return;
        };
        let waited = self.now.saturating_sub(node.goal_changed_at);
        match (node.current_state, node.goal_state) {
            (NodeState::Draining, NodeState::Draining) => {
                self.assign(old, NodeState::Demoted, "drained, demoting");
            }
            (NodeState::PrepareMaintenance, NodeState::PrepareMaintenance) => {
                self.assign(old, NodeState::Maintenance, "drained, entering maintenance");
            }
            (current, NodeState::Draining) if current.is_writable() => {
                if waited > self.config().drain_timeout_ms {
                    self.assign(
                        old,
                        NodeState::DemoteTimeout,
                        format!("draining took longer than {}ms", self.config().drain_timeout_ms),
                    );
                }
            }
            _ => {}
        }
    }

    /// Once every participant reported its progress, pick the candidate.
    fn select_candidate(&mut self) {
        let participants: Vec<NodeId> = self
            .group
            .nodes
            .values()
            .filter(|n| n.goal_state == NodeState::ReportLsn)
            .filter(|n| n.is_healthy(self.now, self.config().partition_timeout_ms))
            .map(|n| n.node_id)
            .collect();

        if participants.is_empty() {
            return;
        }
        if participants
            .iter()
            .any(|id| self.group.nodes[id].current_state != NodeState::ReportLsn)
        {
            return;
        }

        let nodes = &self.group.nodes;
        let candidate = participants
            .iter()
            .copied()
            .filter(|id| nodes[id].candidate_priority > 0)
            .max_by(|a, b| {
                let (a, b) = (&nodes[a], &nodes[b]);
                a.candidate_priority
                    .cmp(&b.candidate_priority)
                    .then(a.progress.cmp(&b.progress))
                    .then(b.node_id.cmp(&a.node_id))
            });
        let Some(c) = candidate else {
            return;
        };
        let most_advanced = participants
            .iter()
            .copied()
            .max_by(|a, b| {
                nodes[a]
                    .progress
                    .cmp(&nodes[b].progress)
                    .then(b.cmp(a))
            })
            .unwrap_or(c);

        let candidate_name = self.name(c);
        let mut fast_forward_from = None;
        if nodes[&c].progress < nodes[&most_advanced].progress {
            let source = self.name(most_advanced);
            self.assign(
                c,
                NodeState::FastForward,
                format!("selected as candidate, fetching missing changes from {}", source),
            );
            fast_forward_from = Some(most_advanced);
        } else {
            self.assign(c, NodeState::PreparePromotion, "selected as promotion candidate");
        }
        for id in participants.into_iter().filter(|&id| id != c) {
            self.assign(
                id,
                NodeState::JoinSecondary,
                format!("{} was selected as promotion candidate", candidate_name),
            );
        }

        if let Some(election) = self.group.election.as_mut() {
            election.candidate = Some(c);
            election.fast_forward_from = fast_forward_from;
        }
    }

    fn progress_candidate(&mut self, election: &Election, c: NodeId) {
        let Some(node) = self.group.nodes.get(&c) else {
            self.restart_round("promotion candidate left the group");
            return;
        };

        if !self.healthy(c) {
            let reason = format!("promotion candidate {} stopped reporting", node.name);
            if self.engine.table.is_legal(node.current_state, NodeState::Catchingup) {
                self.assign(c, NodeState::Catchingup, reason.clone());
            }
            self.restart_round(&reason);
            return;
        }

        let current = node.current_state;
        match (current, node.goal_state) {
            (NodeState::FastForward, NodeState::FastForward) => {
                self.assign(c, NodeState::PreparePromotion, "caught up, preparing promotion");
            }
            (NodeState::PreparePromotion, NodeState::PreparePromotion)
            | (NodeState::StopReplication, NodeState::StopReplication) => {
                if self.promotion_safe(election, c) {
                    let name = self.name(c);
                    self.assign(c, NodeState::WaitPrimary, "promoting to primary");
                    self.group.election = None;
                    self.notes.push(Note::group(format!(
                        "{} complete, {} is the new primary",
                        election.kind, name
                    )));
                } else if current == NodeState::PreparePromotion {
                    self.assign(
                        c,
                        NodeState::StopReplication,
                        "waiting for the former primary to stop accepting writes",
                    );
                }
            }
            _ => {}
        }
    }

    /// Candidate lost: every healthy paused standby reports its progress again.
    fn restart_round(&mut self, reason: &str) {
        let old_primary = self.group.election.as_ref().and_then(|e| e.old_primary);
        let participants: Vec<NodeId> = self
            .group
            .nodes
            .values()
            .filter(|n| Some(n.node_id) != old_primary)
            .filter(|n| n.is_healthy(self.now, self.config().partition_timeout_ms))
            .filter(|n| {
                matches!(
                    n.goal_state,
                    NodeState::JoinSecondary | NodeState::ReportLsn | NodeState::Secondary
                ) && matches!(
                    n.current_state,
                    NodeState::JoinSecondary | NodeState::ReportLsn | NodeState::Secondary
                )
            })
            .map(|n| n.node_id)
            .collect();

        warn!(group = %self.group.key(), "{}, starting a new candidate selection", reason);
        for id in participants {
            self.assign(
                id,
                NodeState::ReportLsn,
                format!("{}: reporting progress for candidate selection", reason),
            );
        }
        if let Some(election) = self.group.election.as_mut() {
            election.candidate = None;
            election.fast_forward_from = None;
        }
    }

    /// True when no other node can accept writes. Silent nodes stepping down
    /// for longer than the drain timeout are fenced on the way.
    fn promotion_safe(&mut self, election: &Election, candidate: NodeId) -> bool {
        let drain_timeout = self.config().drain_timeout_ms;
        let others: Vec<NodeId> = self
            .group
            .nodes
            .keys()
            .copied()
            .filter(|&id| id != candidate)
            .collect();

        let mut safe = true;
        for id in others {
            let node = &self.group.nodes[&id];
            if node.current_state.is_quiesced() {
                continue;
            }
            let stepping_down =
                node.goal_state.is_demote_class() || node.goal_state == NodeState::Maintenance;
            let since = if election.old_primary == Some(id) {
                election.started_at.min(node.goal_changed_at)
            } else {
                node.goal_changed_at
            };
            if !self.healthy(id) && stepping_down && self.now.saturating_sub(since) > drain_timeout {
                self.fence(id);
                continue;
            }
            safe = false;
        }

        if !self.tombstone_cleared() {
            return false;
        }
        safe
    }

    fn fence(&mut self, node_id: NodeId) {
        let drain_timeout = self.config().drain_timeout_ms;
        let Some(node) = self.group.nodes.get_mut(&node_id) else {
            return;
        };
        warn!(
            node_id,
            name = %node.name,
            recorded = %node.current_state,
            "node silent for more than {}ms, presuming it demoted", drain_timeout
        );
        let text = format!(
            "{} has been silent while {} for more than {}ms, presumed fenced",
            node.name, node.current_state, drain_timeout
        );
        node.current_state = NodeState::DemoteTimeout;
        METRICS.fenced_nodes_total.inc();
        self.notes.push(Note::node(node, text));
        self.assign(node_id, NodeState::DemoteTimeout, "presumed fenced");
    }

    /// Rejoin, catch-up and maintenance rules for every non-primary node.
    fn settle_standbys(&mut self) {
        let election_active = self.group.election.is_some();
        let primary = self
            .group
            .primary()
            .filter(|p| {
                p.current_state.is_writable()
                    && p.is_healthy(self.now, self.config().partition_timeout_ms)
            })
            .map(|p| {
                (
                    p.node_id,
                    p.name.clone(),
                    p.progress,
                    p.applied_membership,
                    p.is_settled() && p.applied_quorum_version == self.group.quorum.version,
                )
            });
        let primary_id = self.group.primary_id();
        let lag_limit = self.config().promotable_lag_bytes;

        let ids: Vec<NodeId> = self.group.nodes.keys().copied().collect();
        for id in ids {
            if Some(id) == primary_id {
                continue;
            }
            let healthy = self.healthy(id);
            let node = &self.group.nodes[&id];
            let (current, goal) = (node.current_state, node.goal_state);

            // left over from an election it could not take part in
            if goal == NodeState::ReportLsn && !election_active {
                if let Some((_, pname, ..)) = &primary {
                    if healthy && self.engine.table.is_legal(current, NodeState::Catchingup) {
                        let text = format!("election is over, following {}", pname);
                        self.assign(id, NodeState::Catchingup, text);
                    }
                }
                continue;
            }
            if current != goal {
                continue;
            }

            match current {
                NodeState::Demoted | NodeState::DemoteTimeout => {
                    if let Some((_, pname, ..)) = &primary {
                        if healthy {
                            let text = format!("rejoining as a standby of {}", pname);
                            self.assign(id, NodeState::Catchingup, text);
                        }
                    }
                }
                NodeState::JoinSecondary => {
                    if let Some((_, pname, ..)) = &primary {
                        if healthy {
                            let text = format!("following new primary {}", pname);
                            self.assign(id, NodeState::Secondary, text);
                        }
                    }
                }
                NodeState::WaitStandby => {
                    if let Some((_, pname, _, applied_membership, _)) = &primary {
                        if *applied_membership >= node.joined_membership {
                            let text = format!("{} accepts connections, copying its data", pname);
                            self.assign(id, NodeState::Catchingup, text);
                        }
                    }
                }
                NodeState::Catchingup => {
                    if node.maintenance_requested && !election_active {
                        self.assign(id, NodeState::WaitMaintenance, "maintenance requested");
                    } else if let Some((_, pname, progress, ..)) = &primary {
                        if healthy && progress.saturating_sub(node.progress) <= lag_limit {
                            let text = format!("caught up with {}", pname);
                            self.assign(id, NodeState::Secondary, text);
                        }
                    }
                }
                NodeState::Secondary => {
                    if election_active {
                        continue;
                    }
                    if node.maintenance_requested {
                        self.assign(id, NodeState::WaitMaintenance, "maintenance requested");
                    } else if !healthy {
                        self.assign(
                            id,
                            NodeState::Catchingup,
                            format!(
                                "has not reported for more than {}ms",
                                self.config().partition_timeout_ms
                            ),
                        );
                    }
                }
                NodeState::WaitMaintenance => {
                    let primary_settled = match &primary {
                        Some((.., settled)) => *settled,
                        None => primary_id.is_none() && !election_active,
                    };
                    if primary_settled {
                        self.assign(
                            id,
                            NodeState::Maintenance,
                            "primary no longer waits for this node",
                        );
                    }
                }
                NodeState::Maintenance => {
                    if !node.maintenance_requested {
                        if let Some((_, pname, ..)) = &primary {
                            if healthy {
                                let text = format!("maintenance over, rejoining {}", pname);
                                self.assign(id, NodeState::Catchingup, text);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn refresh_quorum(&mut self) {
        if quorum::refresh(self.group, self.now, self.config().partition_timeout_ms) {
            let q = &self.group.quorum;
            let text = if q.degraded {
                format!("quorum v{}: no eligible standby, synchronous replication relaxed", q.version)
            } else {
                format!("quorum v{}: {}", q.version, q.synchronous_standby_names())
            };
            self.notes.push(Note::group(text));
        }
    }

    /// Steady-state role of the designated primary, one edge at a time.
    fn settle_primary(&mut self) {
        let Some(p) = self.group.primary_id() else {
            return;
        };
        let node = &self.group.nodes[&p];
        if !node.is_settled() || !self.healthy(p) {
            return;
        }
        let alone = self.group.nodes.len() == 1;
        let degraded = self.group.quorum.degraded;
        let quorum_behind = node.applied_quorum_version != self.group.quorum.version;

        let target = if alone {
            NodeState::Single
        } else if degraded {
            NodeState::WaitPrimary
        } else {
            NodeState::Primary
        };

        use NodeState::*;
        let (goal, why) = match (node.current_state, target) {
            (Single, Single) => return,
            (Single, _) => (WaitPrimary, "a standby joined the group"),
            (WaitPrimary, Single) | (Primary, Single) | (JoinPrimary, Single) => {
                (Single, "no standby left")
            }
            (WaitPrimary, Primary) => (Primary, "synchronous quorum can be satisfied"),
            (JoinPrimary, Primary) => (Primary, "standby access granted"),
            (JoinPrimary, WaitPrimary) => (WaitPrimary, "standby access granted"),
            (Primary, WaitPrimary) => (WaitPrimary, "no eligible standby, relaxing synchronous replication"),
            (Primary, Primary) if quorum_behind => (ApplySettings, "quorum changed"),
            (ApplySettings, Primary) => (Primary, "quorum applied"),
            (ApplySettings, _) => (WaitPrimary, "quorum applied, no eligible standby"),
            _ => return,
        };
        self.assign(p, goal, why);
    }

    fn refresh_health(&mut self) {
        let timeout = self.config().partition_timeout_ms;
        let health = match (self.group.primary(), &self.group.election) {
            (Some(p), _) => {
                if !p.is_healthy(self.now, timeout) {
                    GroupHealth::NoPrimaryCandidate
                } else if self.group.nodes.len() > 1 && self.group.quorum.degraded {
                    GroupHealth::Degraded
                } else {
                    GroupHealth::Healthy
                }
            }
            (None, Some(election)) => {
                let stuck = election.candidate.is_none()
                    && !self.group.nodes.values().any(|n| {
                        n.goal_state == NodeState::ReportLsn
                            && n.candidate_priority > 0
                            && n.is_healthy(self.now, timeout)
                    });
                if stuck {
                    GroupHealth::NoPrimaryCandidate
                } else {
                    GroupHealth::Healthy
                }
            }
            (None, None) => {
                // streaming standbys left but none of them may be promoted
                if self.electable(None).is_empty() {
                    GroupHealth::PrimaryLess
                } else {
                    GroupHealth::NoPrimaryCandidate
                }
            }
        };

        if health != self.group.health {
            let previous = self.group.health;
            self.group.health = health;
            let text = match health {
                GroupHealth::NoPrimaryCandidate => {
                    "primary is unavailable and no standby can be promoted".to_string()
                }
                _ => format!("group health changed from {} to {}", previous, health),
            };
            if health == GroupHealth::NoPrimaryCandidate {
                warn!(group = %self.group.key(), "{}", text);
            }
            self.notes.push(Note::group(text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::model::fixtures::{group, node};
    use NodeState::*;

    const TIMEOUT: u64 = 20_000;
    const DRAIN: u64 = 30_000;

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            partition_timeout_ms: TIMEOUT,
            drain_timeout_ms: DRAIN,
            promotable_lag_bytes: 1_000,
        })
    }

    /// Primary 1 with settled secondaries, quorum already applied.
    fn steady(standbys: &[(NodeId, u8)], now: u64) -> Group {
        let mut nodes = vec![node(1, Primary, 50)];
        for &(id, priority) in standbys {
            nodes.push(node(id, Secondary, priority));
        }
        let mut g = group(nodes, now);
        quorum::refresh(&mut g, now, TIMEOUT);
        let version = g.quorum.version;
        g.nodes.get_mut(&1).unwrap().applied_quorum_version = version;
        g
    }

    /// Keeper catches up with its goal and reports at `now`.
    fn reach(g: &mut Group, id: NodeId, now: u64) {
        let n = g.nodes.get_mut(&id).unwrap();
        n.current_state = n.goal_state;
        n.last_report_at = now;
    }

    fn touch(g: &mut Group, ids: &[NodeId], now: u64) {
        for id in ids {
            g.nodes.get_mut(id).unwrap().last_report_at = now;
        }
    }

    fn goal(g: &Group, id: NodeId) -> NodeState {
        g.nodes[&id].goal_state
    }

    #[test]
    fn test_steady_state_is_stable() {
        let e = engine();
        let mut g = steady(&[(2, 50), (3, 50)], 0);
        let notes = e.proceed(&mut g, 1_000);
        assert!(notes.is_empty(), "{:?}", notes);
        assert_eq!(goal(&g, 1), Primary);
        assert_eq!(g.health, GroupHealth::Healthy);
    }

    #[test]
    fn test_higher_priority_wins_failover() {
        let e = engine();
        let mut g = steady(&[(2, 100), (3, 50)], 0);
        g.nodes.get_mut(&2).unwrap().progress = 90;
        g.nodes.get_mut(&3).unwrap().progress = 90;

        let now = TIMEOUT + 1;
        touch(&mut g, &[2, 3], now);
        e.proceed(&mut g, now);
        assert_eq!(goal(&g, 1), DemoteTimeout);
        assert_eq!(goal(&g, 2), ReportLsn);
        assert_eq!(goal(&g, 3), ReportLsn);

        reach(&mut g, 2, now);
        reach(&mut g, 3, now);
        e.proceed(&mut g, now);
        assert_eq!(goal(&g, 2), PreparePromotion);
        assert_eq!(goal(&g, 3), JoinSecondary);

        // old primary silent: candidate waits, then the primary is fenced
        reach(&mut g, 2, now);
        e.proceed(&mut g, now);
        assert_eq!(goal(&g, 2), StopReplication);
        assert!(g.writable_nodes().contains(&1));

        let later = now + DRAIN + 1;
        reach(&mut g, 2, later);
        touch(&mut g, &[3], later);
        e.proceed(&mut g, later);
        assert_eq!(g.nodes[&1].current_state, DemoteTimeout);
        assert_eq!(goal(&g, 2), WaitPrimary);
        assert!(g.election.is_none());
        assert!(g.writable_nodes().is_empty());
    }

    #[test]
    fn test_priority_zero_survivor_is_not_promoted() {
        let e = engine();
        let mut g = steady(&[(2, 0)], 0);

        let now = TIMEOUT + 1;
        touch(&mut g, &[2], now);
        let notes = e.proceed(&mut g, now);

        assert_eq!(goal(&g, 1), Primary);
        assert_eq!(goal(&g, 2), Secondary);
        assert_eq!(g.health, GroupHealth::NoPrimaryCandidate);
        assert!(notes.iter().any(|n| n.description.contains("no standby can be promoted")));

        // written once
        touch(&mut g, &[2], now + 1_000);
        let notes = e.proceed(&mut g, now + 1_000);
        assert!(notes.iter().all(|n| !n.description.contains("no standby can be promoted")));

        // raising the priority unblocks the failover
        g.nodes.get_mut(&2).unwrap().candidate_priority = 10;
        e.proceed(&mut g, now + 2_000);
        assert_eq!(goal(&g, 1), DemoteTimeout);
        assert_eq!(goal(&g, 2), PreparePromotion);
    }

    #[test]
    fn test_behind_candidate_fast_forwards() {
        let e = engine();
        let mut g = steady(&[(2, 100), (3, 50)], 0);
        g.nodes.get_mut(&2).unwrap().progress = 10;
        g.nodes.get_mut(&3).unwrap().progress = 20;

        let now = TIMEOUT + 1;
        touch(&mut g, &[2, 3], now);
        e.proceed(&mut g, now);
        reach(&mut g, 2, now);
        reach(&mut g, 3, now);
        e.proceed(&mut g, now);

        assert_eq!(goal(&g, 2), FastForward);
        assert_eq!(goal(&g, 3), JoinSecondary);
        assert_eq!(g.election.as_ref().unwrap().fast_forward_from, Some(3));

        reach(&mut g, 2, now);
        e.proceed(&mut g, now);
        assert_eq!(goal(&g, 2), PreparePromotion);
    }

    #[test]
    fn test_switchover_drains_before_promotion() {
        let e = engine();
        let mut g = steady(&[(2, 50)], 0);

        let notes = e.start_switchover(&mut g, 1_000).unwrap();
        assert!(!notes.is_empty());
        assert_eq!(goal(&g, 1), Draining);
        assert_eq!(goal(&g, 2), PreparePromotion);

        reach(&mut g, 2, 2_000);
        e.proceed(&mut g, 2_000);
        assert_eq!(goal(&g, 2), StopReplication);

        reach(&mut g, 2, 3_000);
        reach(&mut g, 1, 3_000);
        e.proceed(&mut g, 3_000);
        assert_eq!(goal(&g, 1), Demoted);
        assert_eq!(goal(&g, 2), StopReplication);

        reach(&mut g, 1, 4_000);
        e.proceed(&mut g, 4_000);
        assert_eq!(goal(&g, 2), WaitPrimary);

        reach(&mut g, 2, 5_000);
        touch(&mut g, &[1], 5_000);
        e.proceed(&mut g, 5_000);
        assert_eq!(goal(&g, 1), Catchingup);
        assert_eq!(g.writable_nodes(), vec![2]);
    }

    #[test]
    fn test_switchover_rejected_without_candidate() {
        let e = engine();
        let mut g = steady(&[(2, 0)], 0);
        let err = e.start_switchover(&mut g, 1_000).unwrap_err();
        assert!(matches!(err, Error::NoCandidate { .. }));

        let mut g = steady(&[(2, 50)], 0);
        g.nodes.get_mut(&1).unwrap().goal_state = ApplySettings;
        let err = e.start_switchover(&mut g, 1_000).unwrap_err();
        assert!(matches!(err, Error::SwitchoverRejected(_)));
    }

    #[test]
    fn test_draining_timeout_demotes() {
        let e = engine();
        let mut g = steady(&[(2, 50)], 0);
        e.start_switchover(&mut g, 0).unwrap();

        let later = DRAIN + 1;
        touch(&mut g, &[1, 2], later);
        e.proceed(&mut g, later);
        assert_eq!(goal(&g, 1), DemoteTimeout);
    }

    #[test]
    fn test_registration_flow() {
        let e = engine();
        let mut g = group(vec![], 0);

        let mut first = node(1, Init, 50);
        first.goal_state = Init;
        e.register(&mut g, first, 0);
        assert_eq!(goal(&g, 1), Single);
        reach(&mut g, 1, 0);

        let second = node(2, Init, 50);
        e.register(&mut g, second, 0);
        assert_eq!(goal(&g, 2), WaitStandby);
        assert_eq!(goal(&g, 1), WaitPrimary);
        reach(&mut g, 2, 0);
        e.proceed(&mut g, 0);
        // primary has not yet let the standby in
        assert_eq!(goal(&g, 2), WaitStandby);

        reach(&mut g, 1, 100);
        g.nodes.get_mut(&1).unwrap().applied_membership = g.membership_version;
        e.proceed(&mut g, 100);
        assert_eq!(goal(&g, 2), Catchingup);

        reach(&mut g, 2, 200);
        e.proceed(&mut g, 200);
        assert_eq!(goal(&g, 2), Secondary);

        reach(&mut g, 2, 300);
        e.proceed(&mut g, 300);
        assert!(!g.quorum.degraded);
        assert_eq!(goal(&g, 1), Primary);
    }

    #[test]
    fn test_catchingup_waits_for_lag() {
        let e = engine();
        let mut g = steady(&[], 0);
        let mut standby = node(2, Catchingup, 50);
        standby.last_report_at = 0;
        g.nodes.insert(2, standby);
        g.nodes.get_mut(&1).unwrap().progress = 5_000;

        e.proceed(&mut g, 0);
        assert_eq!(goal(&g, 2), Catchingup);

        g.nodes.get_mut(&2).unwrap().progress = 4_500;
        e.proceed(&mut g, 0);
        assert_eq!(goal(&g, 2), Secondary);
    }

    #[test]
    fn test_quorum_change_goes_through_apply_settings() {
        let e = engine();
        let mut g = steady(&[(2, 50), (3, 50)], 0);

        let now = TIMEOUT + 1;
        touch(&mut g, &[1, 2], now);
        e.proceed(&mut g, now);
        assert_eq!(goal(&g, 3), Catchingup);
        assert_eq!(g.quorum.standbys.len(), 1);
        assert_eq!(goal(&g, 1), ApplySettings);

        reach(&mut g, 1, now);
        g.nodes.get_mut(&1).unwrap().applied_quorum_version = g.quorum.version;
        e.proceed(&mut g, now);
        assert_eq!(goal(&g, 1), Primary);
    }

    #[test]
    fn test_standby_maintenance() {
        let e = engine();
        let mut g = steady(&[(2, 50), (3, 50)], 0);

        e.start_maintenance(&mut g, 3, 100).unwrap();
        assert_eq!(goal(&g, 3), WaitMaintenance);

        reach(&mut g, 3, 200);
        touch(&mut g, &[1, 2], 200);
        e.proceed(&mut g, 200);
        // quorum lost node 3, primary must apply it first
        assert_eq!(goal(&g, 1), ApplySettings);
        assert_eq!(goal(&g, 3), WaitMaintenance);

        reach(&mut g, 1, 300);
        g.nodes.get_mut(&1).unwrap().applied_quorum_version = g.quorum.version;
        e.proceed(&mut g, 300);
        reach(&mut g, 1, 400);
        e.proceed(&mut g, 400);
        assert_eq!(goal(&g, 1), Primary);
        assert_eq!(goal(&g, 3), Maintenance);

        reach(&mut g, 3, 500);
        assert!(e.start_maintenance(&mut g, 3, 500).is_err());
        e.stop_maintenance(&mut g, 3, 600).unwrap();
        assert_eq!(goal(&g, 3), Catchingup);
    }

    #[test]
    fn test_primary_maintenance_elects_new_primary() {
        let e = engine();
        let mut g = steady(&[(2, 50)], 0);

        e.start_maintenance(&mut g, 1, 100).unwrap();
        assert_eq!(goal(&g, 1), PrepareMaintenance);
        assert_eq!(goal(&g, 2), PreparePromotion);

        reach(&mut g, 1, 200);
        reach(&mut g, 2, 200);
        e.proceed(&mut g, 200);
        assert_eq!(goal(&g, 1), Maintenance);
        assert_eq!(goal(&g, 2), StopReplication);

        reach(&mut g, 1, 300);
        reach(&mut g, 2, 300);
        e.proceed(&mut g, 300);
        assert_eq!(goal(&g, 2), WaitPrimary);
        assert!(g.nodes[&1].maintenance_requested);
    }

    #[test]
    fn test_dropped_primary_tombstone_gates_promotion() {
        let e = engine();
        let mut g = steady(&[(2, 50)], 0);

        let (removed, _) = e.drop_node(&mut g, 1, 1_000).unwrap();
        assert_eq!(removed.node_id, 1);
        assert!(g.tombstone.is_some());
        assert_eq!(goal(&g, 2), PreparePromotion);

        reach(&mut g, 2, 2_000);
        e.proceed(&mut g, 2_000);
        assert_eq!(goal(&g, 2), StopReplication);

        let later = 1_000 + DRAIN + 1;
        reach(&mut g, 2, later);
        e.proceed(&mut g, later);
        assert_eq!(goal(&g, 2), WaitPrimary);
        assert!(g.tombstone.is_none());
    }

    #[test]
    fn test_first_node_after_dropped_primary_waits_for_tombstone() {
        let e = engine();
        let mut g = group(vec![node(1, Single, 50)], 0);

        e.drop_node(&mut g, 1, 1_000).unwrap();
        assert!(g.nodes.is_empty());
        assert!(g.tombstone.is_some());

        let mut fresh = node(2, Init, 50);
        fresh.goal_state = Init;
        let notes = e.register(&mut g, fresh, 1_500);
        assert_eq!(goal(&g, 2), Init);
        assert!(notes.iter().any(|n| n.description.contains("dropped primary node_1")));
        assert!(g.primary_id().is_none());

        // still within the drain timeout
        touch(&mut g, &[2], 1_000 + DRAIN);
        e.proceed(&mut g, 1_000 + DRAIN);
        assert_eq!(goal(&g, 2), Init);

        let later = 1_000 + DRAIN + 1;
        touch(&mut g, &[2], later);
        e.proceed(&mut g, later);
        assert_eq!(goal(&g, 2), Single);
        assert!(g.tombstone.is_none());
    }

    #[test]
    fn test_lost_candidate_restarts_selection() {
        let e = engine();
        let mut g = steady(&[(2, 100), (3, 50), (4, 50)], 0);

        let now = TIMEOUT + 1;
        touch(&mut g, &[2, 3, 4], now);
        e.proceed(&mut g, now);
        for id in [2, 3, 4] {
            reach(&mut g, id, now);
        }
        e.proceed(&mut g, now);
        assert_eq!(goal(&g, 2), PreparePromotion);
        reach(&mut g, 3, now);
        reach(&mut g, 4, now);

        // candidate goes silent
        let later = now + TIMEOUT + 1;
        touch(&mut g, &[3, 4], later);
        e.proceed(&mut g, later);
        assert_eq!(goal(&g, 2), Catchingup);
        assert_eq!(goal(&g, 3), ReportLsn);
        assert_eq!(goal(&g, 4), ReportLsn);
        assert_eq!(g.election.as_ref().unwrap().candidate, None);
    }

    #[test]
    fn test_unexpected_writer_is_demoted() {
        let e = engine();
        let mut g = steady(&[(2, 50)], 0);
        g.nodes.get_mut(&2).unwrap().current_state = Primary;

        let notes = e.proceed(&mut g, 100);
        assert_eq!(goal(&g, 2), DemoteTimeout);
        assert_eq!(g.primary_id(), Some(1));
        assert!(notes.iter().any(|n| n.description.contains("possible split-brain")));
    }

    #[test]
    fn test_unhealthy_secondary_goes_back_to_catchingup() {
        let e = engine();
        let mut g = steady(&[(2, 50), (3, 50)], 0);
        let now = TIMEOUT + 1;
        touch(&mut g, &[1, 3], now);
        e.proceed(&mut g, now);
        assert_eq!(goal(&g, 2), Catchingup);
        assert_eq!(goal(&g, 3), Secondary);
    }

    #[test]
    fn test_self_fenced_primary_is_replaced() {
        let e = engine();
        let mut g = steady(&[(2, 50)], 0);
        g.nodes.get_mut(&1).unwrap().current_state = DemoteTimeout;

        e.proceed(&mut g, 100);
        assert_eq!(goal(&g, 1), DemoteTimeout);
        assert_eq!(goal(&g, 2), PreparePromotion);
        assert_eq!(g.election.as_ref().unwrap().kind, ElectionKind::Failover);
    }

    #[test]
    fn test_self_fenced_primary_resumes_without_candidate() {
        let e = engine();
        let mut g = steady(&[(2, 0)], 0);
        g.nodes.get_mut(&1).unwrap().current_state = DemoteTimeout;

        e.proceed(&mut g, 100);
        assert_eq!(goal(&g, 1), WaitPrimary);
        assert!(g.election.is_none());
        assert!(TransitionTable::standard().is_legal(DemoteTimeout, WaitPrimary));
    }
}
