//! Point-in-time views over the node set.

use std::collections::BTreeMap;

use fleet_core::{ApplicationId, Generation, NodeType};

use crate::types::{Node, NodeState, generation_key};

/// Criteria for [`crate::NodeStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub states: Option<Vec<NodeState>>,
    pub node_type: Option<NodeType>,
    pub owner: Option<ApplicationId>,
    pub cluster_id: Option<String>,
    pub parent: Option<String>,
}

impl NodeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_states(mut self, states: &[NodeState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    pub fn of_type(mut self, node_type: NodeType) -> Self {
        self.node_type = Some(node_type);
        self
    }

    pub fn owned_by(mut self, owner: &ApplicationId) -> Self {
        self.owner = Some(owner.clone());
        self
    }

    pub fn in_cluster(mut self, owner: &ApplicationId, cluster_id: &str) -> Self {
        self.owner = Some(owner.clone());
        self.cluster_id = Some(cluster_id.to_string());
        self
    }

    pub fn children_of(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&node.state) {
                return false;
            }
        }
        if let Some(node_type) = self.node_type {
            if node.node_type != node_type {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if node.owner() != Some(owner) {
                return false;
            }
        }
        if let Some(cluster_id) = &self.cluster_id {
            if node.membership().map(|m| &m.cluster_id) != Some(cluster_id) {
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            if node.parent_hostname.as_ref() != Some(parent) {
                return false;
            }
        }
        true
    }
}

/// Consistent snapshot of every node and cluster generation.
#[derive(Debug, Clone, Default)]
pub struct NodeList {
    nodes: BTreeMap<String, Node>,
    generations: BTreeMap<String, Generation>,
}

impl NodeList {
    pub fn new(nodes: BTreeMap<String, Node>, generations: BTreeMap<String, Generation>) -> Self {
        Self { nodes, generations }
    }

    pub fn get(&self, hostname: &str) -> Option<&Node> {
        self.nodes.get(hostname)
    }

    /// Nodes in hostname order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn filter<'a>(&'a self, filter: &'a NodeFilter) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.values().filter(move |n| filter.matches(n))
    }

    pub fn in_state(&self, state: NodeState) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |n| n.state == state)
    }

    pub fn children_of<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes
            .values()
            .filter(move |n| n.parent_hostname.as_deref() == Some(parent))
    }

    /// Every node holding an allocation for `(owner, cluster_id)`.
    pub fn cluster_members<'a>(
        &'a self,
        owner: &'a ApplicationId,
        cluster_id: &'a str,
    ) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes
            .values()
            .filter(move |n| n.belongs_to(owner, cluster_id))
    }

    pub fn generation(&self, owner: &ApplicationId, cluster_id: &str) -> Generation {
        self.generations
            .get(&generation_key(owner, cluster_id))
            .copied()
            .unwrap_or(Generation::INITIAL)
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes.into_values().collect()
    }
}
