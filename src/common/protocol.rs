//! Wire contract between keepers, the monitor and admin clients.
//!
//! Everything here travels as JSON over the monitor's HTTP API.

use crate::common::fsm::NodeState;
use serde::{Deserialize, Serialize};

pub type NodeId = u64;
pub type GroupId = u32;

/// Where to reach a node's database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub node_id: NodeId,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

/// A standby taking part in synchronous acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbyRef {
    pub node_id: NodeId,
    pub name: String,
}

/// Synchronous replication requirement of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumDescription {
    /// Ordered by candidate priority (desc) then node id (asc)
    pub standbys: Vec<StandbyRef>,
    /// Minimum number of standby acknowledgments per commit
    pub count: usize,
    /// Synchronous replication relaxed: no eligible standby
    pub degraded: bool,
    /// Bumped whenever the description changes
    pub version: u64,
}

impl QuorumDescription {
    /// Same requirement, ignoring the version counter.
    pub fn same_requirement(&self, other: &QuorumDescription) -> bool {
        self.standbys == other.standbys && self.count == other.count && self.degraded == other.degraded
    }

    /// Render as a `synchronous_standby_names` value.
    pub fn synchronous_standby_names(&self) -> String {
        if self.degraded || self.standbys.is_empty() {
            return String::new();
        }
        let names: Vec<String> = self
            .standbys
            .iter()
            .map(|s| format!("\"{}\"", standby_application_name(s.node_id, &s.name)))
            .collect();
        format!("ANY {} ({})", self.count, names.join(", "))
    }
}

/// Name a standby uses when connecting to its upstream.
pub fn standby_application_name(node_id: NodeId, name: &str) -> String {
    format!("autofailover_{}_{}", node_id, name)
}

/// Cluster-level condition of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupHealth {
    #[default]
    Healthy,
    /// Synchronous replication relaxed for lack of eligible standbys
    Degraded,
    /// The primary is lost and no standby may be promoted
    NoPrimaryCandidate,
    /// Group has nodes but none is, or is becoming, writable
    PrimaryLess,
}

impl std::fmt::Display for GroupHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GroupHealth::Healthy => "healthy",
            GroupHealth::Degraded => "degraded",
            GroupHealth::NoPrimaryCandidate => "no_primary_candidate",
            GroupHealth::PrimaryLess => "primary_less",
        };
        f.write_str(s)
    }
}

/// First contact of a keeper with the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub formation: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub candidate_priority: u8,
    pub replication_quorum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: NodeId,
    pub group_id: GroupId,
    pub goal_state: NodeState,
    pub description: String,
    /// High-water mark of accepted reports, for keepers re-registering
    #[serde(default)]
    pub report_version: u64,
}

/// Periodic health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub node_id: NodeId,
    pub report_version: u64,
    pub current_state: NodeState,
    /// Replication progress (LSN-like, monotonic per history)
    pub progress: u64,
    /// Keeper wall clock, milliseconds since the epoch
    pub timestamp: u64,
    #[serde(default)]
    pub connected_standbys: u32,
    /// Diagnostic of the last failed transition operation, if any
    #[serde(default)]
    pub last_error: Option<String>,
    /// Membership version whose access rules are in place locally
    #[serde(default)]
    pub applied_membership: u64,
    /// Quorum version pushed to the local database
    #[serde(default)]
    pub applied_quorum_version: u64,
}

/// The monitor's assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub goal_state: NodeState,
    pub description: String,
    pub quorum: QuorumDescription,
    /// Node to replicate from (primary, or fast-forward source)
    #[serde(default)]
    pub upstream: Option<NodeEndpoint>,
    /// Nodes the primary must let in
    #[serde(default)]
    pub standbys: Vec<NodeEndpoint>,
    /// Bumped whenever a node joins or leaves the group
    #[serde(default)]
    pub membership_version: u64,
    pub group_health: GroupHealth,
}

/// Runtime changes to a node's settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(default)]
    pub candidate_priority: Option<u8>,
    #[serde(default)]
    pub replication_quorum: Option<bool>,
}

/// One row of `GET /v1/formations/:formation/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub group_id: GroupId,
    pub current_state: NodeState,
    pub goal_state: NodeState,
    pub candidate_priority: u8,
    pub replication_quorum: bool,
    pub progress: u64,
    pub healthy: bool,
    pub last_report_at: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatus {
    pub formation: String,
    pub group_id: GroupId,
    pub health: GroupHealth,
    pub quorum: QuorumDescription,
    pub nodes: Vec<NodeStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormationStatus {
    pub formation: String,
    pub groups: Vec<GroupStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandbyNames {
    pub formation: String,
    pub group_id: GroupId,
    pub synchronous_standby_names: String,
    pub quorum: QuorumDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default)]
    pub node_id: Option<NodeId>,
}
