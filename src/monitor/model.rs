//! Registry records: nodes, groups, formations.

use crate::common::fsm::NodeState;
use crate::common::protocol::{
    GroupHealth, GroupId, NodeEndpoint, NodeId, NodeStatus, QuorumDescription, StandbyRef,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A registered node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub formation: String,
    pub group_id: GroupId,

    pub current_state: NodeState,
    pub goal_state: NodeState,
    /// Why the current goal was assigned
    pub description: String,
    pub goal_changed_at: u64,

    pub candidate_priority: u8,
    pub replication_quorum: bool,
    pub maintenance_requested: bool,

    /// Highest report version accepted
    pub report_version: u64,
    pub progress: u64,
    pub connected_standbys: u32,
    /// Monitor clock, milliseconds
    pub last_report_at: u64,
    /// Keeper clock, milliseconds
    pub reported_at: u64,
    pub last_error: Option<String>,
    pub registered_at: u64,

    /// Group membership version this node joined at
    pub joined_membership: u64,
    /// Membership version whose access rules the node has applied
    pub applied_membership: u64,
    /// Quorum version the node has pushed to its database
    pub applied_quorum_version: u64,
}

impl Node {
    pub fn endpoint(&self) -> NodeEndpoint {
        NodeEndpoint {
            node_id: self.node_id,
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn standby_ref(&self) -> StandbyRef {
        StandbyRef {
            node_id: self.node_id,
            name: self.name.clone(),
        }
    }

    /// Healthy when the last report is within the partition timeout.
    pub fn is_healthy(&self, now: u64, partition_timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_report_at) <= partition_timeout_ms
    }

    pub fn is_settled(&self) -> bool {
        self.current_state == self.goal_state
    }

    pub fn status(&self, now: u64, partition_timeout_ms: u64) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id,
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            group_id: self.group_id,
            current_state: self.current_state,
            goal_state: self.goal_state,
            candidate_priority: self.candidate_priority,
            replication_quorum: self.replication_quorum,
            progress: self.progress,
            healthy: self.is_healthy(now, partition_timeout_ms),
            last_report_at: self.last_report_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Identifies a group across formations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub formation: String,
    pub group_id: GroupId,
}

impl GroupKey {
    pub fn new(formation: impl Into<String>, group_id: GroupId) -> Self {
        Self {
            formation: formation.into(),
            group_id,
        }
    }

    /// Storage key
    pub fn encode(&self) -> String {
        format!("{}/{}", self.formation, self.group_id)
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.formation, self.group_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionKind {
    /// Primary stopped reporting
    Failover,
    /// Operator asked to move the primary role
    Switchover,
    /// Primary is being put in maintenance
    Maintenance,
    /// Primary was dropped from the registry
    Drop,
}

impl std::fmt::Display for ElectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ElectionKind::Failover => "failover",
            ElectionKind::Switchover => "switchover",
            ElectionKind::Maintenance => "maintenance",
            ElectionKind::Drop => "drop",
        };
        f.write_str(s)
    }
}

/// Promotion in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Election {
    pub kind: ElectionKind,
    pub old_primary: Option<NodeId>,
    pub started_at: u64,
    /// Chosen once every participant reported its progress
    pub candidate: Option<NodeId>,
    /// Most advanced participant when the candidate is behind it
    pub fast_forward_from: Option<NodeId>,
}

/// A primary that left the registry while possibly still writable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub node_id: NodeId,
    pub name: String,
    pub dropped_at: u64,
}

/// Nodes replicating one dataset plus the derived replication requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub formation: String,
    pub group_id: GroupId,
    pub nodes: BTreeMap<NodeId, Node>,
    pub quorum: QuorumDescription,
    pub health: GroupHealth,
    pub membership_version: u64,
    pub election: Option<Election>,
    pub tombstone: Option<Tombstone>,
}

impl Group {
    pub fn new(key: &GroupKey) -> Self {
        Self {
            formation: key.formation.clone(),
            group_id: key.group_id,
            nodes: BTreeMap::new(),
            quorum: QuorumDescription::default(),
            health: GroupHealth::Healthy,
            membership_version: 0,
            election: None,
            tombstone: None,
        }
    }

    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.formation.clone(), self.group_id)
    }

    /// The node holding the writable goal, if any.
    pub fn primary_id(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.goal_state.is_writable())
            .map(|n| n.node_id)
    }

    pub fn primary(&self) -> Option<&Node> {
        self.primary_id().and_then(|id| self.nodes.get(&id))
    }

    /// Nodes whose recorded current state is writable.
    pub fn writable_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.current_state.is_writable())
            .map(|n| n.node_id)
            .collect()
    }

    /// Record stored alongside the nodes.
    pub fn record(&self) -> GroupRecord {
        GroupRecord {
            formation: self.formation.clone(),
            group_id: self.group_id,
            quorum: self.quorum.clone(),
            health: self.health,
            membership_version: self.membership_version,
            election: self.election.clone(),
            tombstone: self.tombstone.clone(),
        }
    }

    pub fn from_record(record: GroupRecord, nodes: BTreeMap<NodeId, Node>) -> Self {
        Self {
            formation: record.formation,
            group_id: record.group_id,
            nodes,
            quorum: record.quorum,
            health: record.health,
            membership_version: record.membership_version,
            election: record.election,
            tombstone: record.tombstone,
        }
    }
}

/// Group fields persisted outside of node records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub formation: String,
    pub group_id: GroupId,
    pub quorum: QuorumDescription,
    pub health: GroupHealth,
    pub membership_version: u64,
    pub election: Option<Election>,
    pub tombstone: Option<Tombstone>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formation {
    pub name: String,
    pub created_at: u64,
}
