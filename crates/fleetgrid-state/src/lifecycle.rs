//! Node lifecycle state machine.
//!
//! ```text
//! provisioned ─► dirty ─► ready ─► reserved ─► active ◄─► inactive
//!                  ▲                  │           │           │
//!                  └──────────────────┴───────────┴───────────┘
//!
//! any non-terminal ─► failed | parked ─► decommissioned
//!                       └───────┴─► dirty
//! ```
//!
//! Only the store calls [`apply_transition`]; everything else goes through
//! the store's transition/commit API.

use fleet_core::Agent;

use crate::error::{StateError, StateResult};
use crate::history::HistoryEvent;
use crate::types::{Node, NodeState};

impl NodeState {
    pub const ALL: [NodeState; 9] = [
        NodeState::Provisioned,
        NodeState::Dirty,
        NodeState::Ready,
        NodeState::Reserved,
        NodeState::Active,
        NodeState::Inactive,
        NodeState::Failed,
        NodeState::Parked,
        NodeState::Decommissioned,
    ];

    /// Whether `self → to` is an edge of the state graph.
    pub fn can_transition_to(self, to: NodeState) -> bool {
        use NodeState::*;
        match (self, to) {
            (Provisioned, Dirty)
            | (Dirty, Ready)
            | (Ready, Reserved)
            | (Reserved, Active)
            | (Active, Inactive)
            | (Inactive, Active)
            | (Reserved, Dirty)
            | (Active, Dirty)
            | (Inactive, Dirty)
            | (Failed, Dirty)
            | (Parked, Dirty)
            | (Failed, Decommissioned)
            | (Parked, Decommissioned) => true,
            (from, Failed) => !from.is_terminal() && from != Failed,
            (from, Parked) => !from.is_terminal() && from != Parked,
            _ => false,
        }
    }

    pub fn successors(self) -> Vec<NodeState> {
        NodeState::ALL
            .into_iter()
            .filter(|to| self.can_transition_to(*to))
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        self == NodeState::Decommissioned
    }

    /// States in which a node carries an allocation.
    pub fn is_allocated(self) -> bool {
        matches!(
            self,
            NodeState::Reserved | NodeState::Active | NodeState::Inactive
        )
    }

    /// States in which a host may carry children.
    pub fn accepts_children(self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Active)
    }

    /// Nodes outside failed/parked/decommissioned need an eligible parent.
    pub fn is_live(self) -> bool {
        !matches!(
            self,
            NodeState::Failed | NodeState::Parked | NodeState::Decommissioned
        )
    }
}

/// Move `node` to `to`, applying the edge's side effects and appending history.
pub(crate) fn apply_transition(
    node: &mut Node,
    to: NodeState,
    agent: Agent,
    reason: &str,
    at: u64,
    transaction: u64,
) -> StateResult<HistoryEvent> {
    let from = node.state;

    if from == NodeState::Reserved && to == NodeState::Reserved {
        return Err(StateError::AlreadyReserved(node.hostname.clone()));
    }
    if !from.can_transition_to(to) {
        return Err(StateError::IllegalTransition {
            hostname: node.hostname.clone(),
            from,
            to,
        });
    }

    match to {
        NodeState::Ready => {
            if node.status.wants_wipe || node.allocation.is_some() {
                return Err(StateError::NotClean(node.hostname.clone()));
            }
        }
        NodeState::Reserved => {
            if node.allocation.is_none() {
                return Err(StateError::AllocationInvariant {
                    hostname: node.hostname.clone(),
                    detail: "cannot reserve without an allocation".to_string(),
                });
            }
        }
        NodeState::Active => match &node.allocation {
            Some(allocation) if !allocation.retired => {}
            Some(_) => {
                return Err(StateError::AllocationInvariant {
                    hostname: node.hostname.clone(),
                    detail: "cannot activate a retired allocation".to_string(),
                });
            }
            None => {
                return Err(StateError::AllocationInvariant {
                    hostname: node.hostname.clone(),
                    detail: "cannot activate without an allocation".to_string(),
                });
            }
        },
        NodeState::Dirty => {
            if from.is_allocated() || matches!(from, NodeState::Failed | NodeState::Parked) {
                node.status.wants_wipe = true;
            }
            node.allocation = None;
        }
        NodeState::Failed => {
            node.status.fail_count += 1;
            node.allocation = None;
        }
        NodeState::Parked => {
            node.allocation = None;
        }
        NodeState::Provisioned
        | NodeState::Inactive
        | NodeState::Decommissioned => {}
    }

    node.state = to;
    let event = HistoryEvent {
        from,
        to,
        at,
        agent,
        reason: reason.to_string(),
        transaction,
    };
    node.history.append(event.clone());
    Ok(event)
}
