//! Allocation events and the sinks that observe them.
//!
//! Every successful activation emits an [`AllocationEvent::Activated`]
//! carrying a snapshot of the fleet, so tooling can replay allocation step
//! by step without reaching into the engine.

use std::sync::{Mutex, PoisonError};

use fleet_core::{ApplicationId, Generation};
use fleetgrid_state::{Hostname, NodeList, NodeState};
use serde::Serialize;
use tracing::{info, warn};

use crate::activation::HostAssignment;

/// Compact view of one node inside an event snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub hostname: Hostname,
    pub parent: Option<Hostname>,
    pub flavor: String,
    pub state: NodeState,
    pub owner: Option<ApplicationId>,
    pub membership: Option<String>,
    pub retired: bool,
}

impl NodeView {
    pub fn snapshot(fleet: &NodeList) -> Vec<NodeView> {
        fleet
            .iter()
            .map(|node| NodeView {
                hostname: node.hostname.clone(),
                parent: node.parent_hostname.clone(),
                flavor: node.flavor.clone(),
                state: node.state,
                owner: node.owner().cloned(),
                membership: node.membership().map(|m| m.to_string()),
                retired: node.is_retired(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AllocationEvent {
    Activated {
        application: ApplicationId,
        cluster_id: String,
        generation: Generation,
        hosts: Vec<HostAssignment>,
        fleet: Vec<NodeView>,
    },
    CapacityShortfall {
        application: ApplicationId,
        cluster_id: String,
        requested: u32,
        shortfall: u32,
    },
    RetirementConfirmed {
        application: ApplicationId,
        cluster_id: String,
        hostnames: Vec<Hostname>,
    },
    ApplicationRemoved {
        application: ApplicationId,
        hostnames: Vec<Hostname>,
    },
}

impl AllocationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AllocationEvent::Activated { .. } => "activated",
            AllocationEvent::CapacityShortfall { .. } => "capacity_shortfall",
            AllocationEvent::RetirementConfirmed { .. } => "retirement_confirmed",
            AllocationEvent::ApplicationRemoved { .. } => "application_removed",
        }
    }
}

/// Receives allocation events. Implementations must not block for long;
/// events are emitted on the caller's thread after the commit.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &AllocationEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &AllocationEvent) {
        match event {
            AllocationEvent::Activated {
                application,
                cluster_id,
                generation,
                hosts,
                fleet,
            } => info!(
                %application,
                cluster = %cluster_id,
                %generation,
                hosts = hosts.len(),
                fleet = fleet.len(),
                "cluster activated"
            ),
            AllocationEvent::CapacityShortfall {
                application,
                cluster_id,
                requested,
                shortfall,
            } => warn!(
                %application,
                cluster = %cluster_id,
                requested,
                shortfall,
                "capacity shortfall"
            ),
            AllocationEvent::RetirementConfirmed {
                application,
                cluster_id,
                hostnames,
            } => info!(
                %application,
                cluster = %cluster_id,
                released = hostnames.len(),
                "retired members released"
            ),
            AllocationEvent::ApplicationRemoved {
                application,
                hostnames,
            } => info!(%application, released = hostnames.len(), "application removed"),
        }
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AllocationEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AllocationEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain recorded events.
    pub fn take(&self) -> Vec<AllocationEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &AllocationEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &AllocationEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shortfall() -> AllocationEvent {
        AllocationEvent::CapacityShortfall {
            application: ApplicationId::new("t", "a", "default"),
            cluster_id: "c0".to_string(),
            requested: 10,
            shortfall: 4,
        }
    }

    #[test]
    fn recording_sink_keeps_order_and_drains() {
        let sink = RecordingSink::new();
        sink.emit(&shortfall());
        sink.emit(&AllocationEvent::ApplicationRemoved {
            application: ApplicationId::new("t", "a", "default"),
            hostnames: vec!["n1".to_string()],
        });
        assert_eq!(sink.len(), 2);
        let names: Vec<_> = sink.events().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["capacity_shortfall", "application_removed"]);

        assert_eq!(sink.take().len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(shortfall()).unwrap();
        assert_eq!(json["event"], "capacity_shortfall");
        assert_eq!(json["shortfall"], 4);
        assert_eq!(json["application"]["tenant"], "t");
    }

    #[test]
    fn null_sink_ignores_events() {
        NullSink.emit(&shortfall());
    }
}
