#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;

use fleet_core::{
    Agent, ApplicationId, ClusterSpec, ClusterType, Flavor, FlavorCatalog, FlavorKind, Resources,
};
use fleetgrid_placement::{
    AllocationEngine, CapacityRequest, FlavorRequest, MemoryNameResolver, NullSink,
};
use fleetgrid_state::{Node, NodeState, NodeStore};

pub fn catalog() -> FlavorCatalog {
    FlavorCatalog::new(vec![
        Flavor::new("host-large", Resources::new(8.0, 8.0, 8.0), FlavorKind::BareMetal)
            .with_headroom(1),
        Flavor::new("host-small", Resources::new(5.0, 5.0, 5.0), FlavorKind::BareMetal)
            .with_headroom(2),
        Flavor::new("d-1", Resources::new(1.0, 1.0, 1.0), FlavorKind::VirtualContainer),
        Flavor::new("d-2-old", Resources::new(2.0, 2.0, 2.0), FlavorKind::VirtualContainer)
            .retired(),
        Flavor::new("d-2", Resources::new(2.0, 2.0, 2.0), FlavorKind::VirtualContainer)
            .replacing("d-2-old"),
        Flavor::new("d-3", Resources::new(3.0, 3.0, 3.0), FlavorKind::VirtualContainer),
    ])
    .unwrap()
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Hostname the any-lookup resolver gives the `n`th address of host `i`.
pub fn child_of(host: u32, n: u32) -> String {
    format!("node-10-0-{host}-{n}")
}

/// A store with `count` ready hosts `host1..`, each with four spare addresses.
pub fn fleet(count: u32, flavor: &str) -> NodeStore {
    let store = NodeStore::open_in_memory(catalog()).unwrap();
    for i in 1..=count {
        let hostname = format!("host{i}");
        let host = Node::host(&hostname, flavor, [ip(&format!("10.0.0.{i}"))])
            .with_additional_ip_addresses((1..=4).map(|n| ip(&format!("10.0.{i}.{n}"))));
        store.add_nodes(vec![host], Agent::System).unwrap();
        store
            .transition(&hostname, NodeState::Dirty, Agent::System, "bootstrap")
            .unwrap();
        store
            .transition(&hostname, NodeState::Ready, Agent::System, "bootstrap")
            .unwrap();
    }
    store
}

pub fn engine(store: &NodeStore) -> AllocationEngine {
    AllocationEngine::new(store.clone(), Arc::new(MemoryNameResolver::any_lookup()))
        .with_event_sink(Arc::new(NullSink))
}

pub fn app(name: &str) -> ApplicationId {
    ApplicationId::new("tenant", name, "default")
}

pub fn request(app: &ApplicationId, count: u32, groups: u32, flavor: &str) -> CapacityRequest {
    CapacityRequest::new(
        app.clone(),
        ClusterSpec::new(ClusterType::Container, "c0", groups),
        count,
        FlavorRequest::named(flavor),
    )
}

/// Active hosts of `app`, as `(hostname, parent, index)`.
pub fn layout(engine: &AllocationEngine, app: &ApplicationId) -> Vec<(String, String, u32)> {
    engine
        .active_hosts(app)
        .unwrap()
        .into_iter()
        .map(|h| {
            (
                h.hostname,
                h.parent.unwrap_or_default(),
                h.membership.index,
            )
        })
        .collect()
}

pub fn parents(engine: &AllocationEngine, app: &ApplicationId) -> Vec<String> {
    layout(engine, app).into_iter().map(|(_, p, _)| p).collect()
}
