//! Concurrent commit regression tests.
//!
//! Two writers that read the same host version and then both try to add a
//! child to it must not both succeed.

use std::net::IpAddr;
use std::sync::{Arc, Barrier};
use std::thread;

use fleet_core::{
    Agent, ApplicationId, ClusterSpec, ClusterType, Flavor, FlavorCatalog, FlavorKind, Generation,
    Resources,
};
use fleetgrid_state::*;

fn test_store() -> NodeStore {
    let catalog = FlavorCatalog::new(vec![
        Flavor::new("host-large", Resources::new(8.0, 8.0, 8.0), FlavorKind::BareMetal)
            .with_headroom(1),
        Flavor::new("d-2", Resources::new(2.0, 2.0, 2.0), FlavorKind::VirtualContainer),
    ])
    .unwrap();
    NodeStore::open_in_memory(catalog).unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn bootstrap(store: &NodeStore) {
    store
        .add_nodes(vec![Node::host("host1", "host-large", [ip("10.0.0.1")])], Agent::System)
        .unwrap();
    store
        .transition("host1", NodeState::Dirty, Agent::System, "bootstrap")
        .unwrap();
    store
        .transition("host1", NodeState::Ready, Agent::System, "bootstrap")
        .unwrap();
}

fn child_activation(host: &Node, child: &str, address: &str, index: u32) -> NodeTransaction {
    let app = ApplicationId::new("tenant", "app", "default");
    let cluster = ClusterSpec::new(ClusterType::Container, "c0", 1);
    let mut txn = NodeTransaction::new(Agent::Application, "activate");
    txn.expect_unchanged(host)
        .add(Node::child(child, &host.hostname, "d-2", [ip(address)]))
        .transition(child, NodeState::Dirty)
        .transition(child, NodeState::Ready)
        .set_allocation(
            child,
            Some(Allocation::new(app, cluster.membership(index), Generation(1))),
        )
        .transition(child, NodeState::Reserved)
        .transition(child, NodeState::Active);
    txn
}

#[test]
fn overlapping_commits_yield_one_conflict() {
    let store = test_store();
    bootstrap(&store);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2u32)
        .map(|i| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let host = store.get("host1").unwrap().unwrap();
                let txn = child_activation(&host, &format!("c{i}"), &format!("10.0.1.{i}"), i);
                barrier.wait();
                store.commit(txn)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_conflict()))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.children_of("host1").count(), 1);
    assert_eq!(snapshot.get("host1").unwrap().version, 4);
}

#[test]
fn disjoint_commits_both_succeed() {
    let store = test_store();
    bootstrap(&store);

    let host = store.get("host1").unwrap().unwrap();
    store.commit(child_activation(&host, "c0", "10.0.1.0", 0)).unwrap();

    // A fresh read sees the new host version.
    let host = store.get("host1").unwrap().unwrap();
    store.commit(child_activation(&host, "c1", "10.0.1.1", 1)).unwrap();
    assert_eq!(store.snapshot().unwrap().children_of("host1").count(), 2);
}
