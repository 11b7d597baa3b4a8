//! Event history
//!
//! Every goal assignment, fencing decision and quorum or health change is
//! recorded as an [`Event`], persisted with the group mutation that caused
//! it and mirrored to the log under the `autofailover::events` target.

use super::model::Node;
use crate::common::fsm::NodeState;
use crate::common::protocol::{GroupId, NodeId};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A recorded decision or observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
    pub formation: String,
    pub group_id: GroupId,
    pub node_id: Option<NodeId>,
    pub node_name: Option<String>,
    pub current_state: Option<NodeState>,
    pub goal_state: Option<NodeState>,
    pub progress: u64,
    pub description: String,
}

/// Node columns of an event, captured when the note is taken.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub name: String,
    pub current_state: NodeState,
    pub goal_state: NodeState,
    pub progress: u64,
}

/// Event not yet numbered nor persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub node: Option<NodeSnapshot>,
    pub description: String,
}

impl Note {
    pub fn group(description: impl Into<String>) -> Self {
        Self {
            node: None,
            description: description.into(),
        }
    }

    pub fn node(node: &Node, description: impl Into<String>) -> Self {
        Self {
            node: Some(NodeSnapshot {
                node_id: node.node_id,
                name: node.name.clone(),
                current_state: node.current_state,
                goal_state: node.goal_state,
                progress: node.progress,
            }),
            description: description.into(),
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node.as_ref().map(|n| n.node_id)
    }

    /// Number the note and stamp it with the monitor clock.
    pub fn into_event(self, event_id: u64, formation: &str, group_id: GroupId, now_ms: u64) -> Event {
        let at = Utc
            .timestamp_millis_opt(now_ms as i64)
            .single()
            .unwrap_or_else(Utc::now);
        let (node_id, node_name, current_state, goal_state, progress) = match self.node {
            Some(n) => (
                Some(n.node_id),
                Some(n.name),
                Some(n.current_state),
                Some(n.goal_state),
                n.progress,
            ),
            None => (None, None, None, None, 0),
        };
        Event {
            event_id,
            at,
            formation: formation.to_string(),
            group_id,
            node_id,
            node_name,
            current_state,
            goal_state,
            progress,
            description: self.description,
        }
    }
}

/// Most recent events kept in memory, oldest evicted first.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<Event>,
    retained: usize,
}

impl EventLog {
    pub fn new(retained: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(retained.min(1024)),
            retained: retained.max(1),
        }
    }

    pub fn push(&mut self, event: Event) {
        tracing::info!(
            target: "autofailover::events",
            event_id = event.event_id,
            formation = %event.formation,
            group_id = event.group_id,
            node_id = ?event.node_id,
            "{}",
            event.description
        );
        self.events.push_back(event);
        while self.events.len() > self.retained {
            self.events.pop_front();
        }
    }

    /// Newest first, optionally restricted to one formation.
    pub fn recent(&self, formation: Option<&str>, count: usize) -> Vec<Event> {
        self.events
            .iter()
            .rev()
            .filter(|e| formation.map_or(true, |f| e.formation == f))
            .take(count)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn retained(&self) -> usize {
        self.retained
    }
}
