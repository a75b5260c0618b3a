//! The result of `prepare`: what an activation would change.

use fleet_core::{ApplicationId, ClusterMembership, ClusterSpec, Flavor, Generation};
use fleetgrid_state::{Expectation, Hostname, Node, NodeState};

/// Where an added member comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum AdditionTarget {
    /// A `ready` node handed over as is.
    Existing {
        hostname: Hostname,
        parent: Option<Hostname>,
    },
    /// An `inactive` member of this cluster brought back.
    Reactivate {
        hostname: Hostname,
        parent: Option<Hostname>,
    },
    /// A container node created on `parent`.
    NewChild { node: Node, parent: Hostname },
}

impl AdditionTarget {
    pub fn hostname(&self) -> &str {
        match self {
            AdditionTarget::Existing { hostname, .. }
            | AdditionTarget::Reactivate { hostname, .. } => hostname,
            AdditionTarget::NewChild { node, .. } => &node.hostname,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        match self {
            AdditionTarget::Existing { parent, .. } | AdditionTarget::Reactivate { parent, .. } => {
                parent.as_deref()
            }
            AdditionTarget::NewChild { parent, .. } => Some(parent),
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, AdditionTarget::NewChild { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Addition {
    pub target: AdditionTarget,
    pub membership: ClusterMembership,
}

/// A current member the proposal keeps or retires.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub hostname: Hostname,
    pub parent: Option<Hostname>,
    pub state: NodeState,
    pub membership: ClusterMembership,
}

impl Member {
    pub(crate) fn of(node: &Node) -> Option<Self> {
        Some(Self {
            hostname: node.hostname.clone(),
            parent: node.parent_hostname.clone(),
            state: node.state,
            membership: node.membership()?.clone(),
        })
    }
}

/// Placement decided against one store snapshot.
///
/// Dropping a proposal cancels it; nothing is reserved until activation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementProposal {
    pub application: ApplicationId,
    pub cluster: ClusterSpec,
    pub flavor: Flavor,
    pub consume_headroom: bool,
    /// Cluster generation the proposal was computed against.
    pub base_generation: Generation,
    /// Generation every member carries after activation.
    pub generation: Generation,
    pub additions: Vec<Addition>,
    pub retained: Vec<Member>,
    pub retired: Vec<Member>,
    pub(crate) expectations: Vec<Expectation>,
}

impl PlacementProposal {
    /// Node state the activation will verify before committing.
    pub fn expectations(&self) -> &[Expectation] {
        &self.expectations
    }

    /// Members active after activation.
    pub fn size(&self) -> usize {
        self.additions.len() + self.retained.len()
    }

    pub fn is_noop(&self) -> bool {
        self.additions.is_empty() && self.retired.is_empty()
    }
}
