use std::path::Path;
use std::sync::Arc;

use fleet_core::{Agent, FleetConfig};
use fleetgrid_placement::{
    AllocationEngine, AllocationEvent, AllocationPolicy, MemoryNameResolver, NodeView,
    RecordingSink,
};
use fleetgrid_state::{NestedTransaction, Node, NodeState, NodeStore};
use serde::Serialize;
use tracing::{info, warn};

use crate::scenario::{Scenario, Step};

/// Outcome of one replayed step.
#[derive(Debug, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub action: &'static str,
    pub description: String,
    pub error: Option<String>,
    pub events: Vec<AllocationEvent>,
    pub fleet: Vec<NodeView>,
}

pub fn run(path: &str, format: &str) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(Path::new(path))?;
    let reports = replay(&scenario)?;

    match format {
        "json" => {
            for report in &reports {
                println!("{}", serde_json::to_string(report)?);
            }
        }
        _ => {
            for report in &reports {
                print!("{}", format_report(report));
            }
        }
    }

    Ok(())
}

/// Open the scenario's store, bootstrap its hosts and run every step.
///
/// Failed steps are reported, not fatal.
pub fn replay(scenario: &Scenario) -> anyhow::Result<Vec<StepReport>> {
    let catalog = scenario.fleet.flavor_catalog()?;
    let store = match scenario.fleet.store_path() {
        Some(path) => NodeStore::open(path, catalog)?,
        None => NodeStore::open_in_memory(catalog)?,
    };
    bootstrap(&store, &scenario.fleet)?;

    let sink = Arc::new(RecordingSink::new());
    let engine = AllocationEngine::new(store.clone(), Arc::new(MemoryNameResolver::any_lookup()))
        .with_policy(AllocationPolicy::from_config(&scenario.fleet.allocation()))
        .with_event_sink(sink.clone());

    let mut reports = Vec::with_capacity(scenario.steps.len());
    for (i, step) in scenario.steps.iter().enumerate() {
        let error = match apply(&engine, step) {
            Ok(()) => None,
            Err(e) => {
                warn!(step = i + 1, action = step.action(), error = %e, "step failed");
                Some(format!("{e:#}"))
            }
        };
        reports.push(StepReport {
            step: i + 1,
            action: step.action(),
            description: step.to_string(),
            error,
            events: sink.take(),
            fleet: NodeView::snapshot(&store.snapshot()?),
        });
    }
    info!(steps = reports.len(), "scenario finished");
    Ok(reports)
}

/// Add configured hosts missing from the store and make them ready.
fn bootstrap(store: &NodeStore, fleet: &FleetConfig) -> anyhow::Result<()> {
    for host in fleet.hosts() {
        if store.get(&host.hostname)?.is_some() {
            continue;
        }
        store.add_nodes(vec![Node::from(host)], Agent::System)?;
        store.transition(&host.hostname, NodeState::Dirty, Agent::System, "bootstrap")?;
        store.transition(&host.hostname, NodeState::Ready, Agent::System, "bootstrap")?;
        info!(hostname = %host.hostname, flavor = %host.flavor, "host ready");
    }
    Ok(())
}

fn apply(engine: &AllocationEngine, step: &Step) -> anyhow::Result<()> {
    match step {
        Step::Provision { .. } => {
            if let Some(request) = step.capacity_request()? {
                engine.provision(&request, &mut NestedTransaction::new())?;
            }
        }
        Step::ConfirmRetirement { cluster, .. } => {
            if let Some(application) = step.application()? {
                engine.confirm_retirement(&application, cluster, Agent::Operator)?;
            }
        }
        Step::Remove { .. } => {
            if let Some(application) = step.application()? {
                engine.remove_application(&application, Agent::Operator)?;
            }
        }
        Step::Fail { hostname } => {
            engine
                .store()
                .transition(hostname, NodeState::Failed, Agent::HealthCheck, "simulated failure")?;
        }
        Step::Recycle => {
            let store = engine.store();
            for node in store.snapshot()?.in_state(NodeState::Dirty) {
                store.mark_wiped(&node.hostname, Agent::System)?;
                store.transition(&node.hostname, NodeState::Ready, Agent::System, "recycled")?;
            }
        }
    }
    Ok(())
}

/// Render a step as an indented fleet tree.
pub fn format_report(report: &StepReport) -> String {
    let mut out = format!("── step {}: {}\n", report.step, report.description);
    if let Some(error) = &report.error {
        out.push_str(&format!("   ✗ {error}\n"));
    }
    for event in &report.events {
        out.push_str(&format!("   • {}\n", describe(event)));
    }

    let hosts = report.fleet.iter().filter(|n| n.parent.is_none());
    for host in hosts {
        out.push_str(&format!("   {:<16} {:<12} {}\n", host.hostname, host.flavor, host.state));
        for child in report
            .fleet
            .iter()
            .filter(|n| n.parent.as_deref() == Some(host.hostname.as_str()))
        {
            let owner = match (&child.owner, &child.membership) {
                (Some(owner), Some(membership)) => {
                    let retired = if child.retired { " (retired)" } else { "" };
                    format!(" {owner} {membership}{retired}")
                }
                _ => String::new(),
            };
            out.push_str(&format!(
                "     └ {:<16} {:<10} {}{}\n",
                child.hostname, child.flavor, child.state, owner
            ));
        }
    }
    out
}

fn describe(event: &AllocationEvent) -> String {
    match event {
        AllocationEvent::Activated {
            application,
            cluster_id,
            generation,
            hosts,
            ..
        } => format!(
            "{application} {cluster_id} generation {generation}: {} active",
            hosts.len()
        ),
        AllocationEvent::CapacityShortfall {
            application,
            cluster_id,
            requested,
            shortfall,
        } => format!("{application} {cluster_id}: short {shortfall} of {requested} nodes"),
        AllocationEvent::RetirementConfirmed {
            application,
            cluster_id,
            hostnames,
        } => format!("{application} {cluster_id}: released {}", hostnames.join(", ")),
        AllocationEvent::ApplicationRemoved {
            application,
            hostnames,
        } => format!("{application} removed: released {}", hostnames.join(", ")),
    }
}
