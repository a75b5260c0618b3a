//! Transactional activation of a placement proposal.
//!
//! A proposal becomes one store batch: every node it read is pinned by an
//! expectation, new children walk the whole lifecycle up to `active`, ready
//! nodes are reserved and activated, retired members go `inactive`, and the
//! cluster generation is bumped from the one the proposal read. The store runs the caller's paired actions
//! inside the same commit.

use std::net::IpAddr;

use fleet_core::{Agent, ClusterMembership, Generation};
use fleetgrid_state::{Allocation, CommitSummary, Hostname, NodeState, NodeTransaction};
use serde::Serialize;

use crate::convert::active_assignments;
use crate::proposal::{AdditionTarget, PlacementProposal};

/// A node serving the cluster after activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostAssignment {
    pub hostname: Hostname,
    pub ip_addresses: Vec<IpAddr>,
    pub parent: Option<Hostname>,
    pub membership: ClusterMembership,
}

/// Outcome of a committed activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activation {
    pub generation: Generation,
    /// Active members ordered by index.
    pub hosts: Vec<HostAssignment>,
}

/// Store batch realizing `proposal`.
pub fn activation_transaction(proposal: &PlacementProposal, agent: Agent) -> NodeTransaction {
    let owner = &proposal.application;
    let generation = proposal.generation;
    let allocation =
        |membership: &ClusterMembership| Allocation::new(owner.clone(), membership.clone(), generation);

    let mut txn = NodeTransaction::new(
        agent,
        format!("activate {owner} {} generation {generation}", proposal.cluster.id),
    );
    for exp in proposal.expectations() {
        txn.expect(&exp.hostname, exp.version, exp.state);
    }

    for addition in &proposal.additions {
        let hostname = addition.target.hostname().to_string();
        let alloc = allocation(&addition.membership);
        match &addition.target {
            AdditionTarget::NewChild { node, .. } => {
                if proposal.consume_headroom {
                    txn.add_consuming_headroom(node.clone());
                } else {
                    txn.add(node.clone());
                }
                txn.transition(&hostname, NodeState::Dirty)
                    .transition(&hostname, NodeState::Ready)
                    .set_allocation(&hostname, Some(alloc))
                    .transition(&hostname, NodeState::Reserved)
                    .transition(&hostname, NodeState::Active);
            }
            AdditionTarget::Existing { .. } => {
                txn.set_allocation(&hostname, Some(alloc))
                    .transition(&hostname, NodeState::Reserved)
                    .transition(&hostname, NodeState::Active);
            }
            AdditionTarget::Reactivate { .. } => {
                txn.set_allocation(&hostname, Some(alloc))
                    .transition(&hostname, NodeState::Active);
            }
        }
    }

    for member in &proposal.retained {
        txn.set_allocation(&member.hostname, Some(allocation(&member.membership)));
        if member.state == NodeState::Reserved {
            txn.transition(&member.hostname, NodeState::Active);
        }
    }

    for member in &proposal.retired {
        match member.state {
            // An unused reservation is simply abandoned.
            NodeState::Reserved => {
                txn.transition(&member.hostname, NodeState::Dirty);
            }
            _ => {
                txn.set_allocation(
                    &member.hostname,
                    Some(allocation(&member.membership).retire()),
                )
                .transition(&member.hostname, NodeState::Inactive);
            }
        }
    }

    txn.expect_generation(owner, &proposal.cluster.id, proposal.base_generation)
        .set_generation(owner, &proposal.cluster.id, generation);
    txn
}

/// Activation result read back from the committed batch.
pub fn activation_result(proposal: &PlacementProposal, summary: &CommitSummary) -> Activation {
    let members = summary
        .changed
        .iter()
        .filter(|n| n.belongs_to(&proposal.application, &proposal.cluster.id));
    Activation {
        generation: proposal.generation,
        hosts: active_assignments(members),
    }
}
