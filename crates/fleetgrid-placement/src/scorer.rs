//! Candidate ranking for placement decisions.
//!
//! Every target index is filled by the best remaining candidate, compared
//! lexicographically on:
//! - **Group spread**: hosts without a member of the target group first
//! - **Flavor match**: exact flavor before a replacement-chain match
//! - **Load**: least-loaded host first (dominant share of host capacity)
//! - **Parent hostname**, then existing nodes before new children, then hostname

use std::cmp::Ordering;
use std::net::IpAddr;

use fleet_core::{FlavorMatch, Resources};
use fleetgrid_state::{Hostname, NodeState};

/// How a candidate would be realized.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateSource {
    /// A `ready` node of version `version`.
    Existing { version: u64 },
    /// A new child on `host`, taking `ip` from the host's pool.
    NewChild {
        ip: IpAddr,
        host: Hostname,
        host_version: u64,
        host_state: NodeState,
    },
}

/// One way to fill a target index.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub hostname: Hostname,
    pub parent: Option<Hostname>,
    pub source: CandidateSource,
    pub flavor_match: FlavorMatch,
    /// Dominant share of the parent's capacity already used by children.
    pub load: f64,
    /// The parent already carries a member of the target group.
    pub group_conflict: bool,
}

impl Candidate {
    pub fn is_new(&self) -> bool {
        matches!(self.source, CandidateSource::NewChild { .. })
    }

    fn placement_key(&self) -> &str {
        self.parent.as_deref().unwrap_or(&self.hostname)
    }
}

/// Total order used to pick the best candidate; `Less` is better.
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    a.group_conflict
        .cmp(&b.group_conflict)
        .then(a.flavor_match.cmp(&b.flavor_match))
        .then(a.load.total_cmp(&b.load))
        .then_with(|| a.placement_key().cmp(b.placement_key()))
        .then(a.is_new().cmp(&b.is_new()))
        .then_with(|| a.hostname.cmp(&b.hostname))
}

/// Best candidate, if any.
pub fn best(candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates.into_iter().min_by(compare)
}

/// Sort candidates best first.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(compare);
}

/// Load of a host as the largest fraction of any resource its children use.
pub fn host_load(used: &Resources, capacity: &Resources) -> f64 {
    used.dominant_share(capacity)
}
