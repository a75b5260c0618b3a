//! Allocation engine: turns capacity requests into node assignments.
//!
//! Allocation is two-phase:
//! 1. `prepare` reads one store snapshot and decides which nodes to reuse,
//!    reactivate, create or retire, without mutating anything
//! 2. `activate` commits that decision as a single store batch guarded by
//!    the node versions the snapshot showed
//!
//! `provision` runs both phases and retries on conflict.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;

use fleet_core::{Agent, ApplicationId, Flavor, FlavorCatalog, FlavorMatch, Resources};
use fleetgrid_state::{
    Expectation, Hostname, NestedTransaction, Node, NodeFilter, NodeList, NodeState, NodeStore,
    NodeTransaction,
};
use tracing::{debug, info, warn};

use crate::activation::{Activation, HostAssignment, activation_result, activation_transaction};
use crate::convert::active_assignments;
use crate::error::{PlacementError, PlacementResult};
use crate::events::{AllocationEvent, EventSink, NodeView, TracingSink};
use crate::proposal::{Addition, AdditionTarget, Member, PlacementProposal};
use crate::request::{AllocationPolicy, CapacityRequest};
use crate::resolver::{NameResolver, ResolveError};
use crate::scorer::{self, Candidate, CandidateSource, host_load};

/// Allocates cluster capacity out of a [`NodeStore`].
#[derive(Clone)]
pub struct AllocationEngine {
    store: NodeStore,
    resolver: Arc<dyn NameResolver>,
    policy: AllocationPolicy,
    sink: Arc<dyn EventSink>,
}

impl AllocationEngine {
    pub fn new(store: NodeStore, resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            store,
            resolver,
            policy: AllocationPolicy::default(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    /// Decide how to bring the cluster to `request.count` active nodes.
    ///
    /// Reads a single snapshot and mutates nothing; calling it twice on an
    /// unchanged store yields equal proposals.
    pub fn prepare(&self, request: &CapacityRequest) -> PlacementResult<PlacementProposal> {
        request.validate()?;
        let catalog = self.store.catalog();
        let flavor = request.flavor.resolve(catalog)?;
        let snapshot = self.store.snapshot()?;

        let planner = Planner::new(
            &snapshot,
            catalog,
            &self.policy,
            self.resolver.as_ref(),
            request,
            flavor,
        );
        match planner.plan() {
            Ok(proposal) => {
                debug!(
                    application = %request.application,
                    cluster = %request.cluster.id,
                    flavor = %proposal.flavor.name,
                    generation = %proposal.generation,
                    additions = proposal.additions.len(),
                    retained = proposal.retained.len(),
                    retired = proposal.retired.len(),
                    "proposal prepared"
                );
                Ok(proposal)
            }
            Err(PlacementError::OutOfCapacity {
                requested,
                shortfall,
            }) => {
                self.sink.emit(&AllocationEvent::CapacityShortfall {
                    application: request.application.clone(),
                    cluster_id: request.cluster.id.clone(),
                    requested,
                    shortfall,
                });
                Err(PlacementError::OutOfCapacity {
                    requested,
                    shortfall,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Commit `proposal`, running `nested` inside the same store commit.
    pub fn activate(
        &self,
        proposal: &PlacementProposal,
        nested: &mut NestedTransaction,
    ) -> PlacementResult<Activation> {
        let txn = activation_transaction(proposal, Agent::Application);
        let summary = match self.store.commit_with(txn, nested) {
            Ok(summary) => summary,
            Err(e) => {
                let err = PlacementError::from(e);
                warn!(
                    application = %proposal.application,
                    cluster = %proposal.cluster.id,
                    error = %err,
                    "activation rejected"
                );
                return Err(err);
            }
        };

        let activation = activation_result(proposal, &summary);
        info!(
            application = %proposal.application,
            cluster = %proposal.cluster.id,
            generation = %activation.generation,
            hosts = activation.hosts.len(),
            added = proposal.additions.len(),
            retired = proposal.retired.len(),
            transaction = summary.transaction_id,
            "activation committed"
        );

        let fleet = match self.store.snapshot() {
            Ok(snapshot) => NodeView::snapshot(&snapshot),
            Err(e) => {
                warn!(error = %e, "could not read fleet snapshot for event");
                Vec::new()
            }
        };
        self.sink.emit(&AllocationEvent::Activated {
            application: proposal.application.clone(),
            cluster_id: proposal.cluster.id.clone(),
            generation: activation.generation,
            hosts: activation.hosts.clone(),
            fleet,
        });
        Ok(activation)
    }

    /// Prepare and activate, retrying with linear backoff on conflict.
    pub fn provision(
        &self,
        request: &CapacityRequest,
        nested: &mut NestedTransaction,
    ) -> PlacementResult<Activation> {
        let mut attempt = 0;
        loop {
            let result = self
                .prepare(request)
                .and_then(|proposal| self.activate(&proposal, nested));
            match result {
                Err(e) if e.is_retryable() && attempt < self.policy.max_conflict_retries => {
                    attempt += 1;
                    let backoff = self.policy.retry_backoff * attempt;
                    warn!(
                        application = %request.application,
                        cluster = %request.cluster.id,
                        attempt,
                        ?backoff,
                        "allocation conflicted, retrying"
                    );
                    thread::sleep(backoff);
                }
                other => return other,
            }
        }
    }

    /// Move retired inactive members of a cluster to `dirty`.
    pub fn confirm_retirement(
        &self,
        application: &ApplicationId,
        cluster_id: &str,
        agent: Agent,
    ) -> PlacementResult<Vec<Hostname>> {
        let snapshot = self.store.snapshot()?;
        let retired: Vec<&Node> = snapshot
            .cluster_members(application, cluster_id)
            .filter(|n| n.state == NodeState::Inactive && n.is_retired())
            .collect();
        if retired.is_empty() {
            return Ok(Vec::new());
        }

        let mut txn = NodeTransaction::new(
            agent,
            format!("release retired members of {application} {cluster_id}"),
        );
        for node in &retired {
            txn.expect_unchanged(node)
                .transition(&node.hostname, NodeState::Dirty);
        }
        self.store.commit(txn)?;

        let hostnames: Vec<Hostname> = retired.iter().map(|n| n.hostname.clone()).collect();
        self.sink.emit(&AllocationEvent::RetirementConfirmed {
            application: application.clone(),
            cluster_id: cluster_id.to_string(),
            hostnames: hostnames.clone(),
        });
        Ok(hostnames)
    }

    /// Release every node of `application` to `dirty` in one batch.
    pub fn remove_application(
        &self,
        application: &ApplicationId,
        agent: Agent,
    ) -> PlacementResult<Vec<Hostname>> {
        let snapshot = self.store.snapshot()?;
        let filter = NodeFilter::all().owned_by(application);
        let owned: Vec<&Node> = snapshot.filter(&filter).collect();
        if owned.is_empty() {
            return Ok(Vec::new());
        }

        let mut txn = NodeTransaction::new(agent, format!("remove {application}"));
        for node in &owned {
            txn.expect_unchanged(node);
            if node.state == NodeState::Active {
                txn.transition(&node.hostname, NodeState::Inactive);
            }
            txn.transition(&node.hostname, NodeState::Dirty);
        }
        self.store.commit(txn)?;

        let hostnames: Vec<Hostname> = owned.iter().map(|n| n.hostname.clone()).collect();
        self.sink.emit(&AllocationEvent::ApplicationRemoved {
            application: application.clone(),
            hostnames: hostnames.clone(),
        });
        Ok(hostnames)
    }

    /// Active, non-retired nodes of `application` across all its clusters.
    pub fn active_hosts(&self, application: &ApplicationId) -> PlacementResult<Vec<HostAssignment>> {
        let snapshot = self.store.snapshot()?;
        let filter = NodeFilter::all().owned_by(application);
        Ok(active_assignments(snapshot.filter(&filter)))
    }
}

// ── Planning ──────────────────────────────────────────────────────

/// Working state of one `prepare` call.
struct Planner<'a> {
    snapshot: &'a NodeList,
    catalog: &'a FlavorCatalog,
    policy: &'a AllocationPolicy,
    resolver: &'a dyn NameResolver,
    request: &'a CapacityRequest,
    /// Flavor the request resolved to.
    flavor: &'a Flavor,
    /// Flavor new children are created with.
    child_flavor: &'a Flavor,
    /// Host → resources used by its children, including planned ones.
    load: BTreeMap<Hostname, Resources>,
    /// Hosts carrying a node of this cluster.
    cluster_hosts: BTreeSet<Hostname>,
    /// (host, group) pairs already used by this cluster.
    group_hosts: BTreeSet<(Hostname, u32)>,
    used_ips: BTreeSet<IpAddr>,
    taken: BTreeSet<Hostname>,
    /// Hosts skipped because their next spare address did not resolve.
    resolve_failures: BTreeMap<Hostname, ResolveError>,
}

impl<'a> Planner<'a> {
    fn new(
        snapshot: &'a NodeList,
        catalog: &'a FlavorCatalog,
        policy: &'a AllocationPolicy,
        resolver: &'a dyn NameResolver,
        request: &'a CapacityRequest,
        flavor: &'a Flavor,
    ) -> Self {
        let mut load: BTreeMap<Hostname, Resources> = BTreeMap::new();
        let mut cluster_hosts = BTreeSet::new();
        let mut group_hosts = BTreeSet::new();
        let mut used_ips = BTreeSet::new();

        for node in snapshot.iter() {
            used_ips.extend(node.ip_addresses.iter().copied());
            let Some(parent) = &node.parent_hostname else {
                continue;
            };
            if node.state.is_terminal() {
                continue;
            }
            if let Ok(child) = catalog.resolve(&node.flavor) {
                *load.entry(parent.clone()).or_insert(Resources::ZERO) += child.resources;
            }
            if node.belongs_to(&request.application, &request.cluster.id) {
                cluster_hosts.insert(parent.clone());
                if let Some(membership) = node.membership() {
                    group_hosts.insert((parent.clone(), membership.group));
                }
            }
        }

        Self {
            snapshot,
            catalog,
            policy,
            resolver,
            request,
            flavor,
            child_flavor: catalog.effective_flavor(flavor),
            load,
            cluster_hosts,
            group_hosts,
            used_ips,
            taken: BTreeSet::new(),
            resolve_failures: BTreeMap::new(),
        }
    }

    fn plan(mut self) -> PlacementResult<PlacementProposal> {
        let snapshot = self.snapshot;
        let request = self.request;
        let cluster = &request.cluster;

        let members: Vec<&Node> = snapshot
            .cluster_members(&request.application, &cluster.id)
            .collect();
        let mut current: Vec<&Node> = members
            .iter()
            .copied()
            .filter(|n| {
                !n.is_retired() && matches!(n.state, NodeState::Active | NodeState::Reserved)
            })
            .collect();
        current.sort_by(|a, b| member_order(a).cmp(&member_order(b)));

        let mut expectations: BTreeMap<Hostname, Expectation> = BTreeMap::new();
        for node in &current {
            expect(&mut expectations, node);
        }

        // Surplus members are retired lowest index first.
        let wanted = request.count as usize;
        let surplus = current.len().saturating_sub(wanted);
        let (retiring, keeping) = current.split_at(surplus);
        let retired: Vec<Member> = retiring.iter().filter_map(|n| Member::of(n)).collect();
        let retained: Vec<Member> = keeping.iter().filter_map(|n| Member::of(n)).collect();

        let mut occupied: BTreeSet<u32> = retained.iter().map(|m| m.membership.index).collect();
        let mut need = wanted.saturating_sub(current.len());
        let mut additions = Vec::new();

        let mut inactive: Vec<&Node> = members
            .iter()
            .copied()
            .filter(|n| n.state == NodeState::Inactive)
            .collect();
        inactive.sort_by(|a, b| member_order(a).cmp(&member_order(b)));
        for node in inactive {
            if need == 0 {
                break;
            }
            let Some(own) = node.membership().map(|m| m.index) else {
                continue;
            };
            if self.catalog.matches(self.flavor, &node.flavor).is_none() || !self.parent_accepts(node) {
                debug!(hostname = %node.hostname, "inactive member not reusable");
                continue;
            }
            let index = if occupied.contains(&own) {
                smallest_free(&occupied)
            } else {
                own
            };
            occupied.insert(index);
            expect(&mut expectations, node);
            self.taken.insert(node.hostname.clone());
            additions.push(Addition {
                target: AdditionTarget::Reactivate {
                    hostname: node.hostname.clone(),
                    parent: node.parent_hostname.clone(),
                },
                membership: cluster.membership(index),
            });
            need -= 1;
        }

        for index in free_indices(&occupied).take(need) {
            let membership = cluster.membership(index);
            let candidates = self.candidates(membership.group);
            let Some(choice) = scorer::best(candidates) else {
                let placed = retained.len() + additions.len();
                let shortfall = request.count - placed as u32;
                // Unresolvable hosts only explain a shortfall they could have covered.
                if shortfall as usize <= self.resolve_failures.len() {
                    if let Some((_, err)) = self.resolve_failures.pop_first() {
                        return Err(err.into());
                    }
                }
                warn!(
                    application = %request.application,
                    cluster = %cluster.id,
                    requested = request.count,
                    shortfall,
                    unresolvable_hosts = self.resolve_failures.len(),
                    "not enough capacity"
                );
                return Err(PlacementError::OutOfCapacity {
                    requested: request.count,
                    shortfall,
                });
            };
            debug!(
                hostname = %choice.hostname,
                parent = ?choice.parent,
                load = choice.load,
                new = choice.is_new(),
                index,
                "candidate selected"
            );
            additions.push(self.take(choice, membership, &mut expectations));
        }

        let base_generation = snapshot.generation(&request.application, &cluster.id);
        Ok(PlacementProposal {
            application: request.application.clone(),
            cluster: cluster.clone(),
            flavor: self.flavor.clone(),
            consume_headroom: request.consume_headroom,
            base_generation,
            generation: base_generation.next(),
            additions,
            retained,
            retired,
            expectations: expectations.into_values().collect(),
        })
    }

    /// Every way to fill an index of `group`, unranked.
    fn candidates(&mut self, group: u32) -> Vec<Candidate> {
        let snapshot = self.snapshot;
        let mut out = Vec::new();

        for node in snapshot.in_state(NodeState::Ready) {
            if node.is_host() || self.taken.contains(&node.hostname) {
                continue;
            }
            let Some(flavor_match) = self.catalog.matches(self.flavor, &node.flavor) else {
                continue;
            };
            let parent = node.parent_hostname.as_deref();
            if !self.parent_accepts(node) || self.excluded(parent) {
                continue;
            }
            out.push(Candidate {
                hostname: node.hostname.clone(),
                parent: node.parent_hostname.clone(),
                source: CandidateSource::Existing {
                    version: node.version,
                },
                flavor_match,
                load: self.load_of(parent),
                group_conflict: self.conflicts(parent, group),
            });
        }

        if self.child_flavor.is_container() {
            for host in snapshot
                .iter()
                .filter(|n| n.is_host() && n.state.accepts_children())
            {
                if let Some(candidate) = self.new_child_on(host, group) {
                    out.push(candidate);
                }
            }
        }
        out
    }

    fn new_child_on(&mut self, host: &Node, group: u32) -> Option<Candidate> {
        if self.excluded(Some(host.hostname.as_str())) {
            return None;
        }
        let host_flavor = self.catalog.resolve(&host.flavor).ok()?;
        if !self.catalog.can_host(host_flavor, self.child_flavor) {
            return None;
        }

        let used = self
            .load
            .get(&host.hostname)
            .copied()
            .unwrap_or(Resources::ZERO);
        let child = self.child_flavor.resources;
        let required = if self.request.consume_headroom {
            child
        } else {
            child + host_flavor.headroom_for(&child)
        };
        let free = host_flavor.resources.saturating_sub(&used);
        if !required.fits_within(&free) {
            debug!(host = %host.hostname, %required, %free, "host has no room");
            return None;
        }

        let ip = host
            .additional_ip_addresses
            .iter()
            .copied()
            .find(|ip| !self.used_ips.contains(ip))?;
        let hostname = match self.resolver.hostname_for(ip) {
            Ok(hostname) => hostname,
            Err(e) => {
                warn!(host = %host.hostname, %ip, error = %e, "skipping host, name resolution failed");
                self.resolve_failures.insert(host.hostname.clone(), e);
                return None;
            }
        };
        if self.snapshot.get(&hostname).is_some() || self.taken.contains(&hostname) {
            warn!(host = %host.hostname, %ip, %hostname, "resolved hostname already in use");
            return None;
        }

        let flavor_match = if self.child_flavor.name == self.flavor.name {
            FlavorMatch::Exact
        } else {
            FlavorMatch::Replacement
        };
        Some(Candidate {
            hostname,
            parent: Some(host.hostname.clone()),
            source: CandidateSource::NewChild {
                ip,
                host: host.hostname.clone(),
                host_version: host.version,
                host_state: host.state,
            },
            flavor_match,
            load: host_load(&used, &host_flavor.resources),
            group_conflict: self.conflicts(Some(host.hostname.as_str()), group),
        })
    }

    /// Record `choice` as placed and build its addition.
    fn take(
        &mut self,
        choice: Candidate,
        membership: fleet_core::ClusterMembership,
        expectations: &mut BTreeMap<Hostname, Expectation>,
    ) -> Addition {
        self.taken.insert(choice.hostname.clone());
        if let Some(parent) = &choice.parent {
            self.cluster_hosts.insert(parent.clone());
            self.group_hosts.insert((parent.clone(), membership.group));
        }

        let target = match choice.source {
            CandidateSource::Existing { version } => {
                expectations.insert(
                    choice.hostname.clone(),
                    Expectation {
                        hostname: choice.hostname.clone(),
                        version,
                        state: NodeState::Ready,
                    },
                );
                AdditionTarget::Existing {
                    hostname: choice.hostname,
                    parent: choice.parent,
                }
            }
            CandidateSource::NewChild {
                ip,
                host,
                host_version,
                host_state,
            } => {
                self.used_ips.insert(ip);
                *self.load.entry(host.clone()).or_insert(Resources::ZERO) +=
                    self.child_flavor.resources;
                expectations.insert(
                    host.clone(),
                    Expectation {
                        hostname: host.clone(),
                        version: host_version,
                        state: host_state,
                    },
                );
                let node = Node::child(&choice.hostname, &host, &self.child_flavor.name, [ip]);
                AdditionTarget::NewChild { node, parent: host }
            }
        };
        Addition { target, membership }
    }

    fn parent_accepts(&self, node: &Node) -> bool {
        match &node.parent_hostname {
            None => true,
            Some(parent) => self
                .snapshot
                .get(parent)
                .is_some_and(|p| p.state.accepts_children()),
        }
    }

    fn excluded(&self, parent: Option<&str>) -> bool {
        self.policy.exclusive_cluster_hosts && parent.is_some_and(|p| self.cluster_hosts.contains(p))
    }

    fn conflicts(&self, parent: Option<&str>, group: u32) -> bool {
        parent.is_some_and(|p| self.group_hosts.contains(&(p.to_string(), group)))
    }

    fn load_of(&self, parent: Option<&str>) -> f64 {
        let Some(parent) = parent else {
            return 0.0;
        };
        let capacity = self
            .snapshot
            .get(parent)
            .and_then(|host| self.catalog.resolve(&host.flavor).ok())
            .map(|f| f.resources)
            .unwrap_or(Resources::ZERO);
        let used = self.load.get(parent).copied().unwrap_or(Resources::ZERO);
        host_load(&used, &capacity)
    }
}

fn member_order(node: &Node) -> (Option<u32>, &str) {
    (node.membership().map(|m| m.index), node.hostname.as_str())
}

fn expect(expectations: &mut BTreeMap<Hostname, Expectation>, node: &Node) {
    expectations.insert(
        node.hostname.clone(),
        Expectation {
            hostname: node.hostname.clone(),
            version: node.version,
            state: node.state,
        },
    );
}

fn smallest_free(occupied: &BTreeSet<u32>) -> u32 {
    (0..).find(|i| !occupied.contains(i)).unwrap_or(u32::MAX)
}

/// Indices not in `occupied`, smallest first.
fn free_indices(occupied: &BTreeSet<u32>) -> impl Iterator<Item = u32> + '_ {
    (0..u32::MAX).filter(|i| !occupied.contains(i))
}
