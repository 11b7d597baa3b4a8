//! Synchronous replication requirement of a group

use super::model::{Group, Node};
use crate::common::protocol::QuorumDescription;

/// Standbys allowed to acknowledge commits: quorum members currently streaming
/// from the primary, on track to stay there, and reporting.
pub fn is_eligible(node: &Node, now: u64, partition_timeout_ms: u64) -> bool {
    node.replication_quorum
        && node.current_state.is_streaming_standby()
        && node.goal_state.is_streaming_standby()
        && node.is_healthy(now, partition_timeout_ms)
}

/// Majority of `n` eligible standbys.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Requirement derived from the current membership, version left at 0.
pub fn compute<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    now: u64,
    partition_timeout_ms: u64,
) -> QuorumDescription {
    let mut eligible: Vec<&Node> = nodes
        .into_iter()
        .filter(|n| is_eligible(n, now, partition_timeout_ms))
        .collect();

    eligible.sort_by(|a, b| {
        b.candidate_priority
            .cmp(&a.candidate_priority)
            .then(a.node_id.cmp(&b.node_id))
    });

    if eligible.is_empty() {
        return QuorumDescription {
            standbys: Vec::new(),
            count: 0,
            degraded: true,
            version: 0,
        };
    }

    QuorumDescription {
        count: majority(eligible.len()),
        standbys: eligible.iter().map(|n| n.standby_ref()).collect(),
        degraded: false,
        version: 0,
    }
}

/// Recompute the group's quorum. Returns true when the requirement changed,
/// in which case the version has been bumped.
pub fn refresh(group: &mut Group, now: u64, partition_timeout_ms: u64) -> bool {
    let mut next = compute(group.nodes.values(), now, partition_timeout_ms);
    if next.same_requirement(&group.quorum) {
        return false;
    }
    next.version = group.quorum.version + 1;
    group.quorum = next;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::fsm::NodeState;
    use crate::monitor::model::fixtures::{group, node};

    const TIMEOUT: u64 = 20_000;

    fn secondaries(n: u64) -> Vec<Node> {
        let mut nodes = vec![node(1, NodeState::Primary, 50)];
        for id in 2..2 + n {
            nodes.push(node(id, NodeState::Secondary, 50));
        }
        nodes
    }

    #[test]
    fn test_majority_of_eligible() {
        for (n, expected) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3)] {
            let g = group(secondaries(n), 1_000);
            let q = compute(g.nodes.values(), 1_000, TIMEOUT);
            assert_eq!(q.standbys.len() as u64, n);
            assert_eq!(q.count, expected, "n = {}", n);
            assert!(!q.degraded);
        }
    }

    #[test]
    fn test_degraded_without_eligible_standby() {
        let mut nodes = secondaries(2);
        nodes[1].replication_quorum = false;
        nodes[2].current_state = NodeState::Catchingup;
        nodes[2].goal_state = NodeState::Catchingup;
        let g = group(nodes, 1_000);

        let q = compute(g.nodes.values(), 1_000, TIMEOUT);
        assert!(q.degraded);
        assert_eq!(q.count, 0);
        assert_eq!(q.synchronous_standby_names(), "");
    }

    #[test]
    fn test_unhealthy_standby_excluded() {
        let mut g = group(secondaries(3), 1_000);
        g.nodes.get_mut(&3).unwrap().last_report_at = 0;

        // node 3 is past the timeout, the others are exactly at it
        let q = compute(g.nodes.values(), 1_000 + TIMEOUT, TIMEOUT);
        let ids: Vec<u64> = q.standbys.iter().map(|s| s.node_id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(q.count, 2);

        let q = compute(g.nodes.values(), 1_000 + TIMEOUT + 1, TIMEOUT);
        assert!(q.degraded);
    }

    #[test]
    fn test_ordering_by_priority_then_id() {
        let mut nodes = secondaries(3);
        nodes[1].candidate_priority = 10;
        nodes[2].candidate_priority = 90;
        nodes[3].candidate_priority = 90;
        let g = group(nodes, 0);

        let q = compute(g.nodes.values(), 0, TIMEOUT);
        let ids: Vec<u64> = q.standbys.iter().map(|s| s.node_id).collect();
        assert_eq!(ids, vec![3, 4, 2]);
    }

    #[test]
    fn test_single_failure_never_raises_count() {
        for n in 1..8 {
            let mut g = group(secondaries(n), 0);
            let before = compute(g.nodes.values(), 0, TIMEOUT);
            g.nodes.remove(&2);
            let after = compute(g.nodes.values(), 0, TIMEOUT);
            assert!(after.count <= before.count, "n = {}", n);
        }
    }

    #[test]
    fn test_refresh_bumps_version_on_change_only() {
        let mut g = group(secondaries(2), 0);
        assert!(refresh(&mut g, 0, TIMEOUT));
        assert_eq!(g.quorum.version, 1);
        assert!(!refresh(&mut g, 0, TIMEOUT));
        assert_eq!(g.quorum.version, 1);

        g.nodes.remove(&3);
        assert!(refresh(&mut g, 0, TIMEOUT));
        assert_eq!(g.quorum.version, 2);
        assert_eq!(g.quorum.count, 1);
    }
}
