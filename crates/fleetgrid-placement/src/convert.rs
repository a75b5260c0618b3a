//! Conversions from node store types.

use fleetgrid_state::{Node, NodeState, StateError};

use crate::activation::HostAssignment;
use crate::error::PlacementError;

impl From<StateError> for PlacementError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict { hostname, detail } => PlacementError::Conflict { hostname, detail },
            StateError::SideEffect(e) => PlacementError::SideEffect(e),
            other => PlacementError::State(other),
        }
    }
}

/// Assignment for an allocated node; `None` when it carries no allocation.
pub fn node_to_assignment(node: &Node) -> Option<HostAssignment> {
    Some(HostAssignment {
        hostname: node.hostname.clone(),
        ip_addresses: node.ip_addresses.iter().copied().collect(),
        parent: node.parent_hostname.clone(),
        membership: node.membership()?.clone(),
    })
}

/// Assignments for the active, non-retired nodes among `nodes`, by cluster then index.
pub fn active_assignments<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Vec<HostAssignment> {
    let mut hosts: Vec<HostAssignment> = nodes
        .into_iter()
        .filter(|n| n.state == NodeState::Active && !n.is_retired())
        .filter_map(node_to_assignment)
        .collect();
    hosts.sort_by(|a, b| {
        a.membership
            .cluster_id
            .cmp(&b.membership.cluster_id)
            .then(a.membership.index.cmp(&b.membership.index))
    });
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{ApplicationId, ClusterSpec, ClusterType, Generation};
    use fleetgrid_state::Allocation;

    fn active(hostname: &str, cluster: &str, index: u32) -> Node {
        let mut node = Node::child(hostname, "host1", "d-1", ["10.0.0.1".parse().unwrap()]);
        node.state = NodeState::Active;
        node.allocation = Some(Allocation::new(
            ApplicationId::new("t", "a", "default"),
            ClusterSpec::new(ClusterType::Container, cluster, 1).membership(index),
            Generation(1),
        ));
        node
    }

    #[test]
    fn conflicts_stay_retryable() {
        let err: PlacementError = StateError::Conflict {
            hostname: "n1".to_string(),
            detail: "drift".to_string(),
        }
        .into();
        assert!(err.is_retryable());

        let err: PlacementError = StateError::NotClean("n1".to_string()).into();
        assert!(matches!(err, PlacementError::State(StateError::NotClean(_))));
        assert!(!err.is_retryable());
    }

    #[test]
    fn assignments_skip_unallocated_and_retired_nodes() {
        let mut retired = active("r", "c0", 0);
        retired.allocation = retired.allocation.map(|a| a.retire());
        let nodes = vec![
            active("b", "c1", 0),
            active("a", "c0", 2),
            retired,
            Node::host("host1", "host-large", []),
            active("c", "c0", 1),
        ];
        let hosts = active_assignments(&nodes);
        let names: Vec<_> = hosts.iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(hosts[0].parent.as_deref(), Some("host1"));
    }
}
