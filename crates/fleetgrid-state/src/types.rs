//! Domain types for the node store.
//!
//! These types represent the persisted record of every node in the fleet:
//! its identity, addresses, flavor, lifecycle state, and (when tenant-owned)
//! its allocation. All types serialize to JSON for storage in redb tables.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use fleet_core::config::HostConfig;
use fleet_core::{Agent, ApplicationId, ClusterMembership, Generation, NodeType};
use serde::{Deserialize, Serialize};

use crate::history::History;

/// Unique key of a node.
pub type Hostname = String;

// ── Lifecycle state ───────────────────────────────────────────────

/// Lifecycle state of a node. Legal edges live in [`crate::lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Provisioned,
    Dirty,
    Ready,
    Reserved,
    Active,
    Inactive,
    Failed,
    Parked,
    Decommissioned,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Provisioned => "provisioned",
            NodeState::Dirty => "dirty",
            NodeState::Ready => "ready",
            NodeState::Reserved => "reserved",
            NodeState::Active => "active",
            NodeState::Inactive => "inactive",
            NodeState::Failed => "failed",
            NodeState::Parked => "parked",
            NodeState::Decommissioned => "decommissioned",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Status ────────────────────────────────────────────────────────

/// Operational flags carried alongside the lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Set when tenant or operator state may be left on the node.
    pub wants_wipe: bool,
    /// Number of times the node has entered `failed`.
    pub fail_count: u32,
    /// Free-form operator flags.
    pub flags: BTreeSet<String>,
}

// ── Allocation ────────────────────────────────────────────────────

/// Tenant ownership of a node, present only in reserved/active/inactive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub owner: ApplicationId,
    pub membership: ClusterMembership,
    pub generation: Generation,
    pub retired: bool,
}

impl Allocation {
    pub fn new(owner: ApplicationId, membership: ClusterMembership, generation: Generation) -> Self {
        Self {
            owner,
            membership,
            generation,
            retired: false,
        }
    }

    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }

    pub fn retire(mut self) -> Self {
        self.retired = true;
        self
    }

    pub fn unretire(mut self) -> Self {
        self.retired = false;
        self
    }

    pub fn belongs_to(&self, owner: &ApplicationId, cluster_id: &str) -> bool {
        &self.owner == owner && self.membership.cluster_id == cluster_id
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// A physical host or a container running on one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: Hostname,
    pub ip_addresses: BTreeSet<IpAddr>,
    /// Address pool a host hands out to the children it carries.
    pub additional_ip_addresses: BTreeSet<IpAddr>,
    /// Hostname of the carrying host; containers only.
    pub parent_hostname: Option<Hostname>,
    pub flavor: String,
    pub node_type: NodeType,
    pub status: Status,
    pub state: NodeState,
    pub allocation: Option<Allocation>,
    pub history: History,
    /// Unix timestamp (milliseconds) of enrolment, set by the store.
    pub created_at: u64,
    pub created_by: Agent,
    /// Bumped by the store on every write that touches this node.
    pub version: u64,
}

impl Node {
    /// A bare-metal host in its initial state.
    pub fn host(hostname: &str, flavor: &str, ip_addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self::new(hostname, flavor, NodeType::Host, None, ip_addresses)
    }

    /// A container node carried by `parent`.
    pub fn child(
        hostname: &str,
        parent: &str,
        flavor: &str,
        ip_addresses: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self::new(
            hostname,
            flavor,
            NodeType::Tenant,
            Some(parent.to_string()),
            ip_addresses,
        )
    }

    /// A bare-metal node handed to tenants directly.
    pub fn tenant(hostname: &str, flavor: &str, ip_addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self::new(hostname, flavor, NodeType::Tenant, None, ip_addresses)
    }

    fn new(
        hostname: &str,
        flavor: &str,
        node_type: NodeType,
        parent_hostname: Option<Hostname>,
        ip_addresses: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            hostname: hostname.to_string(),
            ip_addresses: ip_addresses.into_iter().collect(),
            additional_ip_addresses: BTreeSet::new(),
            parent_hostname,
            flavor: flavor.to_string(),
            node_type,
            status: Status::default(),
            state: NodeState::Provisioned,
            allocation: None,
            history: History::default(),
            created_at: 0,
            created_by: Agent::System,
            version: 0,
        }
    }

    pub fn with_additional_ip_addresses(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.additional_ip_addresses = ips.into_iter().collect();
        self
    }

    pub fn is_host(&self) -> bool {
        self.node_type == NodeType::Host
    }

    pub fn is_child(&self) -> bool {
        self.parent_hostname.is_some()
    }

    pub fn owner(&self) -> Option<&ApplicationId> {
        self.allocation.as_ref().map(|a| &a.owner)
    }

    pub fn membership(&self) -> Option<&ClusterMembership> {
        self.allocation.as_ref().map(|a| &a.membership)
    }

    pub fn belongs_to(&self, owner: &ApplicationId, cluster_id: &str) -> bool {
        self.allocation
            .as_ref()
            .is_some_and(|a| a.belongs_to(owner, cluster_id))
    }

    pub fn is_retired(&self) -> bool {
        self.allocation.as_ref().is_some_and(|a| a.retired)
    }
}

impl From<&HostConfig> for Node {
    fn from(cfg: &HostConfig) -> Self {
        Node::host(&cfg.hostname, &cfg.flavor, cfg.ip_addresses.iter().copied())
            .with_additional_ip_addresses(
                cfg.additional_ip_addresses.iter().flatten().copied(),
            )
    }
}

/// Key under which a cluster's generation is persisted.
pub fn generation_key(owner: &ApplicationId, cluster_id: &str) -> String {
    format!("{owner}#{cluster_id}")
}
