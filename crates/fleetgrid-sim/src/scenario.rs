//! Scenario files: a fleet.toml plus the steps to replay against it.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use fleet_core::{ApplicationId, ClusterSpec, ClusterType, FleetConfig};
use fleetgrid_placement::{CapacityRequest, FlavorRequest};
use serde::Deserialize;

pub struct Scenario {
    pub fleet: FleetConfig,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct StepList {
    #[serde(default)]
    steps: Vec<Step>,
}

/// One simulated event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Step {
    /// Bring a cluster to `count` nodes.
    Provision {
        application: String,
        cluster: String,
        #[serde(default = "default_cluster_type")]
        cluster_type: ClusterType,
        #[serde(default = "default_groups")]
        groups: u32,
        count: u32,
        flavor: String,
        #[serde(default)]
        consume_headroom: bool,
    },
    /// Release retired members of a cluster.
    ConfirmRetirement { application: String, cluster: String },
    /// Release every node of an application.
    Remove { application: String },
    /// Mark a node failed.
    Fail { hostname: String },
    /// Wipe every dirty node and return it to ready.
    Recycle,
}

fn default_cluster_type() -> ClusterType {
    ClusterType::Container
}

fn default_groups() -> u32 {
    1
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let fleet = FleetConfig::parse(content)?;
        let StepList { steps } = toml::from_str(content)?;
        Ok(Self { fleet, steps })
    }
}

impl Step {
    pub fn application(&self) -> anyhow::Result<Option<ApplicationId>> {
        match self {
            Step::Provision { application, .. }
            | Step::ConfirmRetirement { application, .. }
            | Step::Remove { application } => Ok(Some(application.parse()?)),
            Step::Fail { .. } | Step::Recycle => Ok(None),
        }
    }

    /// The capacity request of a `provision` step.
    pub fn capacity_request(&self) -> anyhow::Result<Option<CapacityRequest>> {
        let Step::Provision {
            application,
            cluster,
            cluster_type,
            groups,
            count,
            flavor,
            consume_headroom,
        } = self
        else {
            return Ok(None);
        };
        let mut request = CapacityRequest::new(
            application.parse()?,
            ClusterSpec::new(*cluster_type, cluster, *groups),
            *count,
            FlavorRequest::named(flavor),
        );
        request.consume_headroom = *consume_headroom;
        Ok(Some(request))
    }

    pub fn action(&self) -> &'static str {
        match self {
            Step::Provision { .. } => "provision",
            Step::ConfirmRetirement { .. } => "confirm-retirement",
            Step::Remove { .. } => "remove",
            Step::Fail { .. } => "fail",
            Step::Recycle => "recycle",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Provision {
                application,
                cluster,
                count,
                flavor,
                groups,
                ..
            } => write!(
                f,
                "provision {application} {cluster}: {count} x {flavor} in {groups} group(s)"
            ),
            Step::ConfirmRetirement {
                application,
                cluster,
            } => write!(f, "confirm retirement {application} {cluster}"),
            Step::Remove { application } => write!(f, "remove {application}"),
            Step::Fail { hostname } => write!(f, "fail {hostname}"),
            Step::Recycle => f.write_str("recycle dirty nodes"),
        }
    }
}
