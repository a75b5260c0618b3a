//! Flavor catalog: named resource profiles and their replacement chains.
//!
//! A flavor is immutable once loaded. Flavors form a directed acyclic graph
//! through their `replaces` pointer: a newer flavor names the older one it
//! supersedes. Lookups follow that graph iteratively, newest last.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance for float comparisons on summed resources.
const EPSILON: f64 = 1e-9;

/// Errors raised while loading or querying the flavor catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlavorError {
    #[error("flavor not found: {0}")]
    NotFound(String),

    #[error("duplicate flavor name: {0}")]
    DuplicateName(String),

    #[error("flavor {flavor} replaces unknown flavor {replaces}")]
    UnknownReplacement { flavor: String, replaces: String },

    #[error("flavor {0} is replaced by more than one flavor")]
    AmbiguousReplacement(String),

    #[error("replacement chain through {0} forms a cycle")]
    ReplacementCycle(String),
}

/// Physical machine or container running on one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlavorKind {
    BareMetal,
    VirtualContainer,
}

impl fmt::Display for FlavorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlavorKind::BareMetal => "bare-metal",
            FlavorKind::VirtualContainer => "virtual-container",
        })
    }
}

/// A cpu/memory/disk resource vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu: 0.0,
        memory: 0.0,
        disk: 0.0,
    };

    pub fn new(cpu: f64, memory: f64, disk: f64) -> Self {
        Self { cpu, memory, disk }
    }

    /// True if every dimension of `self` fits inside `envelope`.
    pub fn fits_within(&self, envelope: &Resources) -> bool {
        self.cpu <= envelope.cpu + EPSILON
            && self.memory <= envelope.memory + EPSILON
            && self.disk <= envelope.disk + EPSILON
    }

    /// Component-wise difference, floored at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: (self.memory - other.memory).max(0.0),
            disk: (self.disk - other.disk).max(0.0),
        }
    }

    pub fn scale(&self, factor: f64) -> Resources {
        Resources {
            cpu: self.cpu * factor,
            memory: self.memory * factor,
            disk: self.disk * factor,
        }
    }

    /// Largest fraction of `envelope` used by `self` across all dimensions.
    ///
    /// Dimensions where the envelope is zero are ignored.
    pub fn dominant_share(&self, envelope: &Resources) -> f64 {
        [
            (self.cpu, envelope.cpu),
            (self.memory, envelope.memory),
            (self.disk, envelope.disk),
        ]
        .iter()
        .filter(|(_, total)| *total > 0.0)
        .map(|(used, total)| used / total)
        .fold(0.0, f64::max)
    }

    /// Sum of all dimensions, used as a crude size ordering.
    pub fn magnitude(&self) -> f64 {
        self.cpu + self.memory + self.disk
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            disk: self.disk + rhs.disk,
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[cpu: {}, memory: {}, disk: {}]",
            self.cpu, self.memory, self.disk
        )
    }
}

/// A named resource profile nodes are classified by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub name: String,
    pub resources: Resources,
    pub kind: FlavorKind,
    /// Number of child-sized slots a host of this flavor keeps free for failover.
    pub headroom: u32,
    /// The older flavor this one supersedes.
    pub replaces: Option<String>,
    /// Retired flavors are never handed out for new nodes.
    pub retired: bool,
    pub cost: u32,
}

impl Flavor {
    pub fn new(name: &str, resources: Resources, kind: FlavorKind) -> Self {
        Self {
            name: name.to_string(),
            resources,
            kind,
            headroom: 0,
            replaces: None,
            retired: false,
            cost: 0,
        }
    }

    pub fn with_headroom(mut self, headroom: u32) -> Self {
        self.headroom = headroom;
        self
    }

    pub fn replacing(mut self, older: &str) -> Self {
        self.replaces = Some(older.to_string());
        self
    }

    pub fn retired(mut self) -> Self {
        self.retired = true;
        self
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn is_container(&self) -> bool {
        self.kind == FlavorKind::VirtualContainer
    }

    /// Capacity a host of this flavor holds back when placing `child`.
    pub fn headroom_for(&self, child: &Resources) -> Resources {
        child.scale(f64::from(self.headroom))
    }
}

/// How a candidate flavor relates to the one requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlavorMatch {
    Exact,
    Replacement,
}

/// Immutable lookup table over all known flavors.
#[derive(Debug, Clone, Default)]
pub struct FlavorCatalog {
    flavors: BTreeMap<String, Flavor>,
    /// Older flavor name → the flavor that replaces it.
    replaced_by: BTreeMap<String, String>,
}

impl FlavorCatalog {
    /// Build a catalog, validating names and the replacement graph.
    pub fn new(flavors: impl IntoIterator<Item = Flavor>) -> Result<Self, FlavorError> {
        let mut by_name = BTreeMap::new();
        for flavor in flavors {
            if by_name.contains_key(&flavor.name) {
                return Err(FlavorError::DuplicateName(flavor.name));
            }
            by_name.insert(flavor.name.clone(), flavor);
        }

        let mut replaced_by = BTreeMap::new();
        for flavor in by_name.values() {
            let Some(older) = &flavor.replaces else { continue };
            if !by_name.contains_key(older) {
                return Err(FlavorError::UnknownReplacement {
                    flavor: flavor.name.clone(),
                    replaces: older.clone(),
                });
            }
            if replaced_by
                .insert(older.clone(), flavor.name.clone())
                .is_some()
            {
                return Err(FlavorError::AmbiguousReplacement(older.clone()));
            }
        }

        // Each flavor has at most one successor, so a walk longer than the
        // catalog must revisit a flavor.
        for start in by_name.keys() {
            let mut current = start;
            let mut steps = 0;
            while let Some(next) = replaced_by.get(current) {
                steps += 1;
                if next == start || steps > by_name.len() {
                    return Err(FlavorError::ReplacementCycle(start.clone()));
                }
                current = next;
            }
        }

        Ok(Self {
            flavors: by_name,
            replaced_by,
        })
    }

    pub fn resolve(&self, name: &str) -> Result<&Flavor, FlavorError> {
        self.flavors
            .get(name)
            .ok_or_else(|| FlavorError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flavors.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flavor> {
        self.flavors.values()
    }

    pub fn len(&self) -> usize {
        self.flavors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flavors.is_empty()
    }

    /// Cheapest non-retired flavor of `kind` whose resources contain `minimum`.
    ///
    /// Ordered by cost, then total size, then name.
    pub fn cheapest_satisfying(
        &self,
        minimum: &Resources,
        kind: FlavorKind,
    ) -> Result<&Flavor, FlavorError> {
        self.flavors
            .values()
            .filter(|f| f.kind == kind && !f.retired && minimum.fits_within(&f.resources))
            .min_by(|a, b| {
                a.cost
                    .cmp(&b.cost)
                    .then(a.resources.magnitude().total_cmp(&b.resources.magnitude()))
                    .then(a.name.cmp(&b.name))
            })
            .ok_or_else(|| FlavorError::NotFound(format!("{kind} flavor with at least {minimum}")))
    }

    /// Whether a host of flavor `host` can carry a child of flavor `child`.
    pub fn can_host(&self, host: &Flavor, child: &Flavor) -> bool {
        host.kind == FlavorKind::BareMetal
            && child.kind == FlavorKind::VirtualContainer
            && child.resources.fits_within(&host.resources)
    }

    /// Follow the replacement chain to the newest non-retired flavor.
    ///
    /// Returns `flavor` itself when every flavor on the chain is retired.
    pub fn effective_flavor<'a>(&'a self, flavor: &'a Flavor) -> &'a Flavor {
        let mut chain = vec![flavor.name.as_str()];
        let mut current = flavor.name.as_str();
        while let Some(next) = self.replaced_by.get(current) {
            chain.push(next.as_str());
            current = next.as_str();
        }
        chain
            .iter()
            .rev()
            .find_map(|name| self.flavors.get(*name).filter(|f| !f.retired))
            .unwrap_or(flavor)
    }

    /// How a node of flavor `candidate` satisfies a request for `requested`.
    pub fn matches(&self, requested: &Flavor, candidate: &str) -> Option<FlavorMatch> {
        if requested.name == candidate {
            return Some(FlavorMatch::Exact);
        }
        let candidate = self.flavors.get(candidate)?;
        let wanted = self.effective_flavor(requested);
        (self.effective_flavor(candidate).name == wanted.name).then_some(FlavorMatch::Replacement)
    }
}
