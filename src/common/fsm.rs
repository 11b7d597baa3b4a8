//! Node finite state machine
//!
//! Shared vocabulary between the keeper and the monitor: the node states,
//! the writable class, and the table of legal edges. Each edge names the
//! kind of local operation the keeper runs to cross it; the keeper maps
//! kinds to implementations in `keeper::transitions`.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Role of a node in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Init,
    Single,
    WaitStandby,
    Catchingup,
    Secondary,
    WaitPrimary,
    Primary,
    JoinPrimary,
    ApplySettings,
    Draining,
    DemoteTimeout,
    Demoted,
    StopReplication,
    PreparePromotion,
    ReportLsn,
    FastForward,
    JoinSecondary,
    WaitMaintenance,
    PrepareMaintenance,
    Maintenance,
}

impl NodeState {
    pub const ALL: [NodeState; 20] = [
        NodeState::Init,
        NodeState::Single,
        NodeState::WaitStandby,
        NodeState::Catchingup,
        NodeState::Secondary,
        NodeState::WaitPrimary,
        NodeState::Primary,
        NodeState::JoinPrimary,
        NodeState::ApplySettings,
        NodeState::Draining,
        NodeState::DemoteTimeout,
        NodeState::Demoted,
        NodeState::StopReplication,
        NodeState::PreparePromotion,
        NodeState::ReportLsn,
        NodeState::FastForward,
        NodeState::JoinSecondary,
        NodeState::WaitMaintenance,
        NodeState::PrepareMaintenance,
        NodeState::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Init => "init",
            NodeState::Single => "single",
            NodeState::WaitStandby => "wait_standby",
            NodeState::Catchingup => "catchingup",
            NodeState::Secondary => "secondary",
            NodeState::WaitPrimary => "wait_primary",
            NodeState::Primary => "primary",
            NodeState::JoinPrimary => "join_primary",
            NodeState::ApplySettings => "apply_settings",
            NodeState::Draining => "draining",
            NodeState::DemoteTimeout => "demote_timeout",
            NodeState::Demoted => "demoted",
            NodeState::StopReplication => "stop_replication",
            NodeState::PreparePromotion => "prepare_promotion",
            NodeState::ReportLsn => "report_lsn",
            NodeState::FastForward => "fast_forward",
            NodeState::JoinSecondary => "join_secondary",
            NodeState::WaitMaintenance => "wait_maintenance",
            NodeState::PrepareMaintenance => "prepare_maintenance",
            NodeState::Maintenance => "maintenance",
        }
    }

    /// Can a node in this state accept writes?
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            NodeState::Single
                | NodeState::WaitPrimary
                | NodeState::Primary
                | NodeState::JoinPrimary
                | NodeState::ApplySettings
        )
    }

    /// Neither writable nor still flushing in-flight writes.
    pub fn is_quiesced(&self) -> bool {
        !self.is_writable()
            && !matches!(self, NodeState::Draining | NodeState::PrepareMaintenance)
    }

    /// Goals that take a primary out of service.
    pub fn is_demote_class(&self) -> bool {
        matches!(
            self,
            NodeState::Draining
                | NodeState::DemoteTimeout
                | NodeState::Demoted
                | NodeState::PrepareMaintenance
        )
    }

    /// States that count as a streaming standby for the synchronous quorum.
    pub fn is_streaming_standby(&self) -> bool {
        matches!(self, NodeState::Secondary)
    }

    /// States belonging to an in-progress promotion of this node.
    pub fn is_promotion_path(&self) -> bool {
        matches!(
            self,
            NodeState::FastForward | NodeState::PreparePromotion | NodeState::StopReplication
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NodeState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::InvalidSetting(format!("unknown node state: {}", s)))
    }
}

/// The local operation an edge performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Bring the local database up as a standalone writable node.
    InitPrimary,
    /// Clone the upstream and start streaming from it.
    InitStandby,
    /// Allow the newly registered standbys to connect.
    AddStandbyAccess,
    EnableSyncRep,
    DisableSyncRep,
    /// Push the current quorum description to the local database.
    ApplySettings,
    /// Stop accepting new writes, let in-flight commits finish.
    Drain,
    /// Stop serving as a primary.
    Demote,
    /// Rewind to the history shared with the upstream, then follow it.
    Rewind,
    FollowPrimary,
    PauseReplication,
    /// Fetch missing history from the most advanced standby.
    FastForward,
    PreparePromotion,
    StopReplication,
    Promote,
    StopLocal,
    Noop,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 17] = [
        EdgeKind::InitPrimary,
        EdgeKind::InitStandby,
        EdgeKind::AddStandbyAccess,
        EdgeKind::EnableSyncRep,
        EdgeKind::DisableSyncRep,
        EdgeKind::ApplySettings,
        EdgeKind::Drain,
        EdgeKind::Demote,
        EdgeKind::Rewind,
        EdgeKind::FollowPrimary,
        EdgeKind::PauseReplication,
        EdgeKind::FastForward,
        EdgeKind::PreparePromotion,
        EdgeKind::StopReplication,
        EdgeKind::Promote,
        EdgeKind::StopLocal,
        EdgeKind::Noop,
    ];

    /// Does the operation need to know which node to replicate from?
    pub fn needs_upstream(&self) -> bool {
        matches!(
            self,
            EdgeKind::InitStandby | EdgeKind::Rewind | EdgeKind::FollowPrimary | EdgeKind::FastForward
        )
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

use NodeState::*;

const EDGES: &[(NodeState, NodeState, EdgeKind)] = &[
    (Init, Single, EdgeKind::InitPrimary),
    (Init, WaitStandby, EdgeKind::Noop),
    (WaitStandby, Catchingup, EdgeKind::InitStandby),
    // primary side: standbys joining and quorum changes
    (Single, WaitPrimary, EdgeKind::AddStandbyAccess),
    (WaitPrimary, JoinPrimary, EdgeKind::AddStandbyAccess),
    (Primary, JoinPrimary, EdgeKind::AddStandbyAccess),
    (JoinPrimary, Primary, EdgeKind::ApplySettings),
    (JoinPrimary, WaitPrimary, EdgeKind::DisableSyncRep),
    (WaitPrimary, Primary, EdgeKind::EnableSyncRep),
    (Primary, WaitPrimary, EdgeKind::DisableSyncRep),
    (Primary, ApplySettings, EdgeKind::ApplySettings),
    (ApplySettings, Primary, EdgeKind::Noop),
    (ApplySettings, WaitPrimary, EdgeKind::DisableSyncRep),
    (WaitPrimary, Single, EdgeKind::DisableSyncRep),
    (Primary, Single, EdgeKind::DisableSyncRep),
    (JoinPrimary, Single, EdgeKind::DisableSyncRep),
    // demotion
    (Single, Draining, EdgeKind::Drain),
    (WaitPrimary, Draining, EdgeKind::Drain),
    (Primary, Draining, EdgeKind::Drain),
    (JoinPrimary, Draining, EdgeKind::Drain),
    (ApplySettings, Draining, EdgeKind::Drain),
    (Single, DemoteTimeout, EdgeKind::Demote),
    (WaitPrimary, DemoteTimeout, EdgeKind::Demote),
    (Primary, DemoteTimeout, EdgeKind::Demote),
    (JoinPrimary, DemoteTimeout, EdgeKind::Demote),
    (ApplySettings, DemoteTimeout, EdgeKind::Demote),
    (Draining, Demoted, EdgeKind::Demote),
    (Draining, DemoteTimeout, EdgeKind::Demote),
    (DemoteTimeout, Demoted, EdgeKind::Noop),
    (Demoted, Catchingup, EdgeKind::Rewind),
    (DemoteTimeout, Catchingup, EdgeKind::Rewind),
    // standby side
    (Catchingup, Secondary, EdgeKind::Noop),
    (Secondary, Catchingup, EdgeKind::FollowPrimary),
    (Secondary, ReportLsn, EdgeKind::PauseReplication),
    (Catchingup, ReportLsn, EdgeKind::PauseReplication),
    (Secondary, PreparePromotion, EdgeKind::PreparePromotion),
    (ReportLsn, PreparePromotion, EdgeKind::PreparePromotion),
    (ReportLsn, FastForward, EdgeKind::FastForward),
    (FastForward, PreparePromotion, EdgeKind::PreparePromotion),
    (ReportLsn, JoinSecondary, EdgeKind::Noop),
    (JoinSecondary, Secondary, EdgeKind::FollowPrimary),
    (ReportLsn, Catchingup, EdgeKind::FollowPrimary),
    (JoinSecondary, Catchingup, EdgeKind::FollowPrimary),
    (PreparePromotion, StopReplication, EdgeKind::StopReplication),
    (PreparePromotion, WaitPrimary, EdgeKind::Promote),
    (StopReplication, WaitPrimary, EdgeKind::Promote),
    // abandoned promotion, new election round
    (FastForward, Catchingup, EdgeKind::FollowPrimary),
    (PreparePromotion, Catchingup, EdgeKind::FollowPrimary),
    (StopReplication, Catchingup, EdgeKind::Rewind),
    (JoinSecondary, ReportLsn, EdgeKind::PauseReplication),
    // self-fenced primary resumes, nobody else can take over
    (DemoteTimeout, WaitPrimary, EdgeKind::Promote),
    // maintenance
    (Secondary, WaitMaintenance, EdgeKind::Noop),
    (Catchingup, WaitMaintenance, EdgeKind::Noop),
    (WaitMaintenance, Maintenance, EdgeKind::StopLocal),
    (Primary, PrepareMaintenance, EdgeKind::Drain),
    (WaitPrimary, PrepareMaintenance, EdgeKind::Drain),
    (PrepareMaintenance, Maintenance, EdgeKind::Demote),
    (Maintenance, Catchingup, EdgeKind::Rewind),
];

/// Lookup table of legal edges.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    edges: HashMap<(NodeState, NodeState), EdgeKind>,
}

impl TransitionTable {
    pub fn standard() -> Self {
        let edges = EDGES
            .iter()
            .map(|&(from, to, kind)| ((from, to), kind))
            .collect();
        Self { edges }
    }

    /// The operation for `from -> to`, or `IllegalTransition`.
    pub fn edge(&self, from: NodeState, to: NodeState) -> Result<EdgeKind> {
        self.edges
            .get(&(from, to))
            .copied()
            .ok_or(Error::IllegalTransition { from, to })
    }

    pub fn is_legal(&self, from: NodeState, to: NodeState) -> bool {
        self.edges.contains_key(&(from, to))
    }

    pub fn edges(&self) -> impl Iterator<Item = (NodeState, NodeState, EdgeKind)> + '_ {
        self.edges.iter().map(|(&(from, to), &kind)| (from, to, kind))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}
