//! Monitor operations
//!
//! Entry points for keeper reports, registrations and operator actions. Each
//! one locks the affected group, applies its input, lets the engine decide,
//! and persists the result before answering.

use super::engine::{Engine, EngineConfig};
use super::events::{Event, Note};
use super::model::{Group, GroupKey, Node};
use super::registry::{GroupHandle, Registry};
use crate::common::config::MonitorConfig;
use crate::common::error::{Error, Result};
use crate::common::fsm::NodeState;
use crate::common::metrics::METRICS;
use crate::common::protocol::{
    FormationStatus, GroupId, GroupStatus, NodeId, NodeSettings, NodeStatus, RegisterRequest,
    RegisterResponse, ReportRequest, ReportResponse, StandbyNames,
};
use crate::common::utils::Clock;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Highest accepted candidate priority
pub const MAX_CANDIDATE_PRIORITY: u8 = 100;

pub struct MonitorService {
    registry: Registry,
    engine: Engine,
    clock: Arc<dyn Clock>,
}

impl MonitorService {
    pub fn new(registry: Registry, config: &MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            engine: Engine::new(EngineConfig::from(config)),
            clock,
        }
    }

    /// Open the registry at `config.db_path`.
    pub fn open(config: &MonitorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::open_at(&config.db_path, config, clock)
    }

    pub fn open_at(path: impl AsRef<Path>, config: &MonitorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = Registry::open(path, config.events_retained, clock.now_millis())?;
        Ok(Self::new(registry, config, clock))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn partition_timeout(&self) -> u64 {
        self.engine.config().partition_timeout_ms
    }

    // === Keeper protocol ===

    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        validate_name("node name", &req.name)?;
        if req.host.trim().is_empty() {
            return Err(Error::InvalidSetting("host must not be empty".into()));
        }
        if req.candidate_priority > MAX_CANDIDATE_PRIORITY {
            return Err(Error::InvalidSetting(format!(
                "candidate priority {} is above {}",
                req.candidate_priority, MAX_CANDIDATE_PRIORITY
            )));
        }
        if !self.registry.formation_exists(&req.formation).await {
            return Err(Error::FormationNotFound(req.formation.clone()));
        }

        if let Some(existing) = self.find_by_name(&req.formation, &req.name).await {
            let (group_id, response) = existing;
            if req.group_id.is_some_and(|g| g != group_id) {
                return Err(Error::InvalidSetting(format!(
                    "node {} is already registered in group {}",
                    req.name, group_id
                )));
            }
            info!(node_id = response.node_id, name = %req.name, "Node re-registered");
            return Ok(response);
        }

        let key = GroupKey::new(req.formation.clone(), req.group_id.unwrap_or(0));
        let handle = self.registry.group_or_create(&key).await;
        let node_id = self.registry.allocate_node_id()?;
        let now = self.now();
        let engine = &self.engine;

        let (response, created) = self
            .registry
            .mutate(&handle, now, |group, changes| {
                // registered concurrently under the same name
                if let Some(node) = group.nodes.values().find(|n| n.name == req.name) {
                    return Ok((register_response(node), false));
                }
                let node = new_node(node_id, &req, &key, now);
                changes.extend(engine.register(group, node, now));
                let node = group
                    .nodes
                    .get(&node_id)
                    .ok_or_else(|| Error::Internal("registered node vanished".into()))?;
                Ok((register_response(node), true))
            })
            .await?;

        if created {
            self.registry.index_node(node_id, key.clone()).await;
            METRICS.registrations_total.inc();
            info!(
                node_id,
                name = %req.name,
                group = %key,
                goal = %response.goal_state,
                "Node registered"
            );
        }
        Ok(response)
    }

    async fn find_by_name(&self, formation: &str, name: &str) -> Option<(GroupId, RegisterResponse)> {
        for (key, handle) in self.registry.groups_of(formation).await {
            let group = handle.lock().await;
            if let Some(node) = group.nodes.values().find(|n| n.name == name) {
                return Some((key.group_id, register_response(node)));
            }
        }
        None
    }

    /// Apply a health report and answer with the node's assignment.
    pub async fn report(&self, req: ReportRequest) -> Result<ReportResponse> {
        let start = Instant::now();
        let (_, handle) = self.registry.group_of(req.node_id).await?;
        let now = self.now();
        let engine = &self.engine;
        let node_id = req.node_id;

        let response = self
            .registry
            .mutate(&handle, now, |group, changes| {
                let node = group
                    .nodes
                    .get_mut(&node_id)
                    .ok_or(Error::NodeNotFound(node_id))?;

                if req.report_version < node.report_version {
                    warn!(
                        node_id,
                        received = req.report_version,
                        recorded = node.report_version,
                        state = %req.current_state,
                        "Ignoring stale report"
                    );
                    METRICS.stale_reports_total.inc();
                    return response_for(group, node_id);
                }
                if req.report_version == node.report_version {
                    debug!(node_id, version = req.report_version, "Retransmitted report");
                    METRICS.duplicate_reports_total.inc();
                    return response_for(group, node_id);
                }

                let previous = node.current_state;
                apply_report(node, &req, now);
                if previous != req.current_state {
                    let text = format!("{} reported {} (was {})", node.name, req.current_state, previous);
                    changes.note(Note::node(node, text));
                }
                if let Some(error) = &req.last_error {
                    debug!(node_id, error = %error, "Keeper reported a failed operation");
                }

                changes.extend(engine.proceed(group, now));
                METRICS.reports_total.inc();
                response_for(group, node_id)
            })
            .await?;

        METRICS
            .report_latency
            .observe(start.elapsed().as_secs_f64() * 1000.0);
        Ok(response)
    }

    // === Operator actions ===

    pub async fn drop_node(&self, node_id: NodeId) -> Result<()> {
        let (key, handle) = self.registry.group_of(node_id).await?;
        let now = self.now();
        let engine = &self.engine;

        let removed = self
            .registry
            .mutate(&handle, now, |group, changes| {
                let (removed, notes) = engine
                    .drop_node(group, node_id, now)
                    .ok_or(Error::NodeNotFound(node_id))?;
                changes.extend(notes);
                changes.removed.push(node_id);
                Ok(removed)
            })
            .await?;

        self.registry.unindex_node(node_id).await;
        METRICS.drops_total.inc();
        info!(node_id, name = %removed.name, group = %key, "Node dropped");
        Ok(())
    }

    pub async fn switchover(&self, formation: &str, group_id: GroupId) -> Result<()> {
        let handle = self.existing_group(formation, group_id).await?;
        let now = self.now();
        let engine = &self.engine;
        self.registry
            .mutate(&handle, now, |group, changes| {
                changes.extend(engine.start_switchover(group, now)?);
                Ok(())
            })
            .await?;
        info!(formation, group_id, "Switchover started");
        Ok(())
    }

    pub async fn enable_maintenance(&self, node_id: NodeId) -> Result<()> {
        let (_, handle) = self.registry.group_of(node_id).await?;
        let now = self.now();
        let engine = &self.engine;
        self.registry
            .mutate(&handle, now, |group, changes| {
                changes.extend(engine.start_maintenance(group, node_id, now)?);
                Ok(())
            })
            .await?;
        info!(node_id, "Maintenance enabled");
        Ok(())
    }

    pub async fn disable_maintenance(&self, node_id: NodeId) -> Result<()> {
        let (_, handle) = self.registry.group_of(node_id).await?;
        let now = self.now();
        let engine = &self.engine;
        self.registry
            .mutate(&handle, now, |group, changes| {
                changes.extend(engine.stop_maintenance(group, node_id, now)?);
                Ok(())
            })
            .await?;
        info!(node_id, "Maintenance disabled");
        Ok(())
    }

    pub async fn set_node_settings(&self, node_id: NodeId, settings: NodeSettings) -> Result<NodeStatus> {
        if let Some(priority) = settings.candidate_priority {
            if priority > MAX_CANDIDATE_PRIORITY {
                return Err(Error::InvalidSetting(format!(
                    "candidate priority {} is above {}",
                    priority, MAX_CANDIDATE_PRIORITY
                )));
            }
        }
        let (_, handle) = self.registry.group_of(node_id).await?;
        let now = self.now();
        let engine = &self.engine;
        let timeout = self.partition_timeout();

        self.registry
            .mutate(&handle, now, |group, changes| {
                let node = group
                    .nodes
                    .get_mut(&node_id)
                    .ok_or(Error::NodeNotFound(node_id))?;
                if let Some(priority) = settings.candidate_priority {
                    if node.candidate_priority != priority {
                        node.candidate_priority = priority;
                        let text = format!("{} candidate priority set to {}", node.name, priority);
                        changes.note(Note::node(node, text));
                    }
                }
                if let Some(quorum) = settings.replication_quorum {
                    if node.replication_quorum != quorum {
                        node.replication_quorum = quorum;
                        let text = format!("{} replication quorum set to {}", node.name, quorum);
                        changes.note(Note::node(node, text));
                    }
                }
                changes.extend(engine.proceed(group, now));
                group
                    .nodes
                    .get(&node_id)
                    .map(|n| n.status(now, timeout))
                    .ok_or(Error::NodeNotFound(node_id))
            })
            .await
    }

    // === Formations ===

    pub async fn create_formation(&self, name: &str) -> Result<()> {
        validate_name("formation", name)?;
        self.registry.create_formation(name, self.now()).await?;
        info!(formation = name, "Formation created");
        Ok(())
    }

    pub async fn drop_formation(&self, name: &str) -> Result<()> {
        self.registry.drop_formation(name, self.now()).await?;
        info!(formation = name, "Formation dropped");
        Ok(())
    }

    pub async fn list_formations(&self) -> Vec<String> {
        self.registry
            .list_formations()
            .await
            .into_iter()
            .map(|f| f.name)
            .collect()
    }

    // === Read-only views ===

    pub async fn formation_state(&self, formation: &str) -> Result<FormationStatus> {
        if !self.registry.formation_exists(formation).await {
            return Err(Error::FormationNotFound(formation.to_string()));
        }
        let now = self.now();
        let timeout = self.partition_timeout();
        let mut groups = Vec::new();
        for (_, handle) in self.registry.groups_of(formation).await {
            let group = handle.lock().await;
            if group.nodes.is_empty() {
                continue;
            }
            groups.push(group_status(&group, now, timeout));
        }
        Ok(FormationStatus {
            formation: formation.to_string(),
            groups,
        })
    }

    pub async fn standby_names(&self, formation: &str, group_id: GroupId) -> Result<StandbyNames> {
        let handle = self.existing_group(formation, group_id).await?;
        let group = handle.lock().await;
        Ok(StandbyNames {
            formation: formation.to_string(),
            group_id,
            synchronous_standby_names: group.quorum.synchronous_standby_names(),
            quorum: group.quorum.clone(),
        })
    }

    pub async fn events(&self, formation: &str, count: usize) -> Result<Vec<Event>> {
        if !self.registry.formation_exists(formation).await {
            return Err(Error::FormationNotFound(formation.to_string()));
        }
        Ok(self.registry.events(Some(formation), count))
    }

    async fn existing_group(&self, formation: &str, group_id: GroupId) -> Result<GroupHandle> {
        let not_found = || Error::GroupNotFound {
            formation: formation.to_string(),
            group_id,
        };
        let handle = self
            .registry
            .group(&GroupKey::new(formation, group_id))
            .await
            .ok_or_else(not_found)?;
        if handle.lock().await.nodes.is_empty() {
            return Err(not_found());
        }
        Ok(handle)
    }

    /// Re-run the engine on every group. Catches silent nodes nobody reports about.
    pub async fn health_sweep(&self) -> usize {
        let mut changed = 0;
        for (key, handle) in self.registry.all_groups().await {
            let now = self.now();
            let engine = &self.engine;
            let result = self
                .registry
                .mutate(&handle, now, |group, changes| {
                    let notes = engine.proceed(group, now);
                    let any = !notes.is_empty();
                    changes.extend(notes);
                    Ok(any)
                })
                .await;
            match result {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!(group = %key, "Health sweep failed: {}", e),
            }
        }
        changed
    }
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSetting(format!("invalid {}: {:?}", what, name)))
    }
}

fn new_node(node_id: NodeId, req: &RegisterRequest, key: &GroupKey, now: u64) -> Node {
    Node {
        node_id,
        name: req.name.clone(),
        host: req.host.clone(),
        port: req.port,
        formation: key.formation.clone(),
        group_id: key.group_id,
        current_state: NodeState::Init,
        goal_state: NodeState::Init,
        description: String::new(),
        goal_changed_at: now,
        candidate_priority: req.candidate_priority,
        replication_quorum: req.replication_quorum,
        maintenance_requested: false,
        report_version: 0,
        progress: 0,
        connected_standbys: 0,
        last_report_at: now,
        reported_at: 0,
        last_error: None,
        registered_at: now,
        joined_membership: 0,
        applied_membership: 0,
        applied_quorum_version: 0,
    }
}

fn apply_report(node: &mut Node, req: &ReportRequest, now: u64) {
    node.report_version = req.report_version;
    node.current_state = req.current_state;
    node.progress = req.progress;
    node.connected_standbys = req.connected_standbys;
    node.reported_at = req.timestamp;
    node.last_report_at = now;
    node.last_error = req.last_error.clone();
    node.applied_membership = req.applied_membership;
    node.applied_quorum_version = req.applied_quorum_version;
}

fn register_response(node: &Node) -> RegisterResponse {
    RegisterResponse {
        node_id: node.node_id,
        group_id: node.group_id,
        goal_state: node.goal_state,
        description: node.description.clone(),
        report_version: node.report_version,
    }
}

/// Assignment sent back to a keeper.
pub fn response_for(group: &Group, node_id: NodeId) -> Result<ReportResponse> {
    let node = group.nodes.get(&node_id).ok_or(Error::NodeNotFound(node_id))?;

    let upstream = if node.goal_state == NodeState::FastForward {
        group
            .election
            .as_ref()
            .and_then(|e| e.fast_forward_from)
            .and_then(|id| group.nodes.get(&id))
            .map(Node::endpoint)
    } else {
        group
            .primary()
            .filter(|p| p.node_id != node_id)
            .map(Node::endpoint)
    };

    let standbys = group
        .nodes
        .values()
        .filter(|n| n.node_id != node_id)
        .map(Node::endpoint)
        .collect();

    Ok(ReportResponse {
        goal_state: node.goal_state,
        description: node.description.clone(),
        quorum: group.quorum.clone(),
        upstream,
        standbys,
        membership_version: group.membership_version,
        group_health: group.health,
    })
}

pub fn group_status(group: &Group, now: u64, partition_timeout_ms: u64) -> GroupStatus {
    GroupStatus {
        formation: group.formation.clone(),
        group_id: group.group_id,
        health: group.health,
        quorum: group.quorum.clone(),
        nodes: group
            .nodes
            .values()
            .map(|n| n.status(now, partition_timeout_ms))
            .collect(),
    }
}
