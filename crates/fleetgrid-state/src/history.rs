//! History and audit records.
//!
//! Every lifecycle transition appends a [`HistoryEvent`] to the node's own
//! history. The store additionally keeps a fleet-wide, append-only audit log
//! of [`AuditRecord`]s keyed by a global sequence number; it survives node
//! removal and ties each change to the commit batch that made it.

use fleet_core::{Agent, Generation};
use serde::{Deserialize, Serialize};

use crate::types::{Hostname, NodeState};

/// A single lifecycle transition of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub from: NodeState,
    pub to: NodeState,
    /// Unix timestamp in milliseconds.
    pub at: u64,
    pub agent: Agent,
    pub reason: String,
    /// Id of the commit batch that performed the transition.
    pub transaction: u64,
}

/// Append-only transition history of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    events: Vec<HistoryEvent>,
}

impl History {
    pub fn append(&mut self, event: HistoryEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn last(&self) -> Option<&HistoryEvent> {
        self.events.last()
    }

    /// Most recent event that moved the node into `state`.
    pub fn entered(&self, state: NodeState) -> Option<&HistoryEvent> {
        self.events.iter().rev().find(|e| e.to == state)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What an audit record describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditAction {
    Added,
    Transitioned { from: NodeState, to: NodeState },
    Allocated { membership: Option<String>, generation: Option<Generation> },
    Wiped,
    Removed,
}

/// One entry of the fleet-wide audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub transaction: u64,
    pub hostname: Hostname,
    pub action: AuditAction,
    pub at: u64,
    pub agent: Agent,
    pub reason: String,
}
