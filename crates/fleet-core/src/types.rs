//! Shared identity types used across FleetGrid crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when parsing one of the textual identity forms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} '{input}': {reason}")]
pub struct ParseError {
    pub kind: &'static str,
    pub input: String,
    pub reason: String,
}

impl ParseError {
    fn new(kind: &'static str, input: &str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

// ── Application ───────────────────────────────────────────────────

/// Identity of a deployed application instance, `tenant:application:instance`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApplicationId {
    pub tenant: String,
    pub application: String,
    pub instance: String,
}

impl ApplicationId {
    pub fn new(tenant: &str, application: &str, instance: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            application: application.to_string(),
            instance: instance.to_string(),
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant, self.application, self.instance)
    }
}

impl FromStr for ApplicationId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(ParseError::new(
                "application id",
                s,
                "expected tenant:application:instance",
            ));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ParseError::new("application id", s, "empty component"));
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

// ── Cluster ───────────────────────────────────────────────────────

/// Kind of cluster an application declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    Admin,
    Container,
    Content,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Admin => "admin",
            ClusterType::Container => "container",
            ClusterType::Content => "content",
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(ClusterType::Admin),
            "container" => Ok(ClusterType::Container),
            "content" => Ok(ClusterType::Content),
            other => Err(ParseError::new("cluster type", other, "unknown type")),
        }
    }
}

/// A cluster as requested by an application: type, id and group count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub cluster_type: ClusterType,
    pub id: String,
    /// Number of groups the cluster's nodes are spread across (at least 1).
    pub groups: u32,
}

impl ClusterSpec {
    pub fn new(cluster_type: ClusterType, id: &str, groups: u32) -> Self {
        Self {
            cluster_type,
            id: id.to_string(),
            groups,
        }
    }

    /// Membership for the replica at `index`; the group is `index mod groups`.
    pub fn membership(&self, index: u32) -> ClusterMembership {
        ClusterMembership {
            cluster_type: self.cluster_type,
            cluster_id: self.id.clone(),
            group: index % self.groups.max(1),
            index,
        }
    }
}

/// Position of one replica within an application's cluster.
///
/// Text form is `type/id/group/index`, e.g. `container/c0/1/3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub cluster_type: ClusterType,
    pub cluster_id: String,
    pub group: u32,
    pub index: u32,
}

impl fmt::Display for ClusterMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cluster_type, self.cluster_id, self.group, self.index
        )
    }
}

impl FromStr for ClusterMembership {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<&str> = s.split('/').collect();
        // Older records carry a trailing "/retired"; retirement lives on the allocation.
        if parts.last() == Some(&"retired") {
            parts.pop();
        }
        if parts.len() != 4 {
            return Err(ParseError::new(
                "cluster membership",
                s,
                "expected type/id/group/index",
            ));
        }
        let cluster_type = parts[0].parse()?;
        if parts[1].is_empty() {
            return Err(ParseError::new("cluster membership", s, "empty cluster id"));
        }
        let group = parts[2]
            .parse()
            .map_err(|_| ParseError::new("cluster membership", s, "group is not a number"))?;
        let index = parts[3]
            .parse()
            .map_err(|_| ParseError::new("cluster membership", s, "index is not a number"))?;
        Ok(Self {
            cluster_type,
            cluster_id: parts[1].to_string(),
            group,
            index,
        })
    }
}

/// Monotonically increasing counter bumped on each activation of a cluster.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub const INITIAL: Generation = Generation(0);

    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Node classification ───────────────────────────────────────────

/// Whether a node hosts other nodes or runs tenant workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Host,
    Tenant,
}

/// Who initiated a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Agent {
    System,
    Operator,
    Application,
    HealthCheck,
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Agent::System => "system",
            Agent::Operator => "operator",
            Agent::Application => "application",
            Agent::HealthCheck => "health-check",
        })
    }
}
