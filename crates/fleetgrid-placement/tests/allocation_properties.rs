//! Allocation invariants under concurrency and arbitrary resize sequences.

mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use fleetgrid_placement::{Activation, PlacementProposal};
use fleetgrid_state::NestedTransaction;
use proptest::prelude::*;

#[test]
fn concurrent_activations_on_one_host_conflict_once() {
    let store = fleet(3, "host-large");
    let engine = engine(&store);

    let proposals: Vec<PlacementProposal> = ["a", "b"]
        .iter()
        .map(|name| engine.prepare(&request(&app(name), 1, 1, "d-2")).unwrap())
        .collect();

    let barrier = Arc::new(Barrier::new(proposals.len()));
    let handles: Vec<_> = proposals
        .into_iter()
        .map(|proposal| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.activate(&proposal, &mut NestedTransaction::new())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let committed = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_retryable()))
        .count();
    assert_eq!((committed, conflicts), (1, 1));
    assert_eq!(store.snapshot().unwrap().len(), 4);
}

#[test]
fn concurrent_provisioning_places_everyone() {
    let store = fleet(4, "host-large");
    let engine = engine(&store);

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|name| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let req = request(&app(name), 1, 1, "d-1");
            thread::spawn(move || {
                barrier.wait();
                engine.provision(&req, &mut NestedTransaction::new())
            })
        })
        .collect();

    // Retries are bounded, so only assert on whoever got through.
    let placed: Vec<Activation> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap().ok())
        .collect();
    assert!(!placed.is_empty());

    let hostnames: BTreeSet<String> = placed
        .iter()
        .flat_map(|a| a.hosts.iter().map(|h| h.hostname.clone()))
        .collect();
    assert_eq!(hostnames.len(), placed.len());
    assert_eq!(store.snapshot().unwrap().len(), 4 + placed.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn resizing_keeps_exact_count_and_unique_indices(
        groups in 1u32..=3,
        counts in prop::collection::vec(0u32..=6, 1..6),
    ) {
        let store = fleet(6, "host-large");
        let engine = engine(&store);
        let a = app("a");
        let mut last_generation = fleet_core::Generation::INITIAL;

        for count in counts {
            let activation = engine
                .provision(&request(&a, count, groups, "d-1"), &mut NestedTransaction::new())
                .unwrap();
            prop_assert!(activation.generation > last_generation);
            last_generation = activation.generation;

            let hosts = engine.active_hosts(&a).unwrap();
            prop_assert_eq!(hosts.len(), count as usize);

            let slots: BTreeSet<(u32, u32)> = hosts
                .iter()
                .map(|h| (h.membership.group, h.membership.index))
                .collect();
            prop_assert_eq!(slots.len(), hosts.len());
            prop_assert!(hosts.iter().all(|h| h.membership.group == h.membership.index % groups));

            let parents: BTreeSet<_> = hosts.iter().filter_map(|h| h.parent.clone()).collect();
            prop_assert_eq!(parents.len(), hosts.len());
        }
    }
}
