//! Capacity requests and the policy knobs that shape their placement.

use std::time::Duration;

use fleet_core::config::AllocationConfig;
use fleet_core::{ApplicationId, ClusterSpec, Flavor, FlavorCatalog, FlavorKind, Resources};
use serde::{Deserialize, Serialize};

use crate::error::{PlacementError, PlacementResult};

/// Which flavor the requested nodes must have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlavorRequest {
    Named(String),
    /// Cheapest flavor of `kind` with at least these resources.
    Minimum { resources: Resources, kind: FlavorKind },
}

impl FlavorRequest {
    pub fn named(name: &str) -> Self {
        FlavorRequest::Named(name.to_string())
    }

    pub fn resolve<'a>(&self, catalog: &'a FlavorCatalog) -> PlacementResult<&'a Flavor> {
        match self {
            FlavorRequest::Named(name) => catalog
                .resolve(name)
                .map_err(|e| PlacementError::FlavorNotFound(e.to_string())),
            FlavorRequest::Minimum { resources, kind } => catalog
                .cheapest_satisfying(resources, *kind)
                .map_err(|e| PlacementError::FlavorNotFound(e.to_string())),
        }
    }
}

/// Desired size of one application cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityRequest {
    pub application: ApplicationId,
    pub cluster: ClusterSpec,
    /// Total number of active nodes wanted; zero releases the cluster.
    pub count: u32,
    pub flavor: FlavorRequest,
    /// Allow new children to use the capacity hosts keep free for failover.
    #[serde(default)]
    pub consume_headroom: bool,
}

impl CapacityRequest {
    pub fn new(application: ApplicationId, cluster: ClusterSpec, count: u32, flavor: FlavorRequest) -> Self {
        Self {
            application,
            cluster,
            count,
            flavor,
            consume_headroom: false,
        }
    }

    pub fn consuming_headroom(mut self) -> Self {
        self.consume_headroom = true;
        self
    }

    pub fn validate(&self) -> PlacementResult<()> {
        if self.cluster.id.is_empty() {
            return Err(PlacementError::InvalidRequest("cluster id is empty".to_string()));
        }
        if self.cluster.groups == 0 {
            return Err(PlacementError::InvalidRequest(format!(
                "cluster {} has zero groups",
                self.cluster.id
            )));
        }
        Ok(())
    }
}

/// Allocation policy, built from the `[allocation]` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPolicy {
    /// Never put two nodes of the same cluster on one host.
    pub exclusive_cluster_hosts: bool,
    pub max_conflict_retries: u32,
    /// Backoff before retry `n` is `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            exclusive_cluster_hosts: true,
            max_conflict_retries: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

impl AllocationPolicy {
    pub fn from_config(config: &AllocationConfig) -> Self {
        let defaults = Self::default();
        Self {
            exclusive_cluster_hosts: config
                .exclusive_cluster_hosts
                .unwrap_or(defaults.exclusive_cluster_hosts),
            max_conflict_retries: config
                .max_conflict_retries
                .unwrap_or(defaults.max_conflict_retries),
            retry_backoff: config
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::ClusterType;

    fn catalog() -> FlavorCatalog {
        FlavorCatalog::new(vec![
            Flavor::new("d-1", Resources::new(1.0, 1.0, 1.0), FlavorKind::VirtualContainer),
            Flavor::new("d-2", Resources::new(2.0, 2.0, 2.0), FlavorKind::VirtualContainer),
        ])
        .unwrap()
    }

    fn request(groups: u32) -> CapacityRequest {
        CapacityRequest::new(
            ApplicationId::new("t", "a", "default"),
            ClusterSpec::new(ClusterType::Container, "c0", groups),
            2,
            FlavorRequest::named("d-1"),
        )
    }

    #[test]
    fn resolves_named_and_minimum_flavors() {
        let catalog = catalog();
        assert_eq!(FlavorRequest::named("d-2").resolve(&catalog).unwrap().name, "d-2");

        let minimum = FlavorRequest::Minimum {
            resources: Resources::new(1.5, 1.0, 1.0),
            kind: FlavorKind::VirtualContainer,
        };
        assert_eq!(minimum.resolve(&catalog).unwrap().name, "d-2");

        let err = FlavorRequest::named("d-9").resolve(&catalog).unwrap_err();
        assert!(matches!(err, PlacementError::FlavorNotFound(_)));
    }

    #[test]
    fn zero_groups_is_invalid() {
        assert!(request(1).validate().is_ok());
        assert!(matches!(
            request(0).validate(),
            Err(PlacementError::InvalidRequest(_))
        ));
    }

    #[test]
    fn policy_defaults_fill_missing_config() {
        let config = AllocationConfig {
            exclusive_cluster_hosts: Some(false),
            max_conflict_retries: None,
            retry_backoff_ms: Some(25),
        };
        let policy = AllocationPolicy::from_config(&config);
        assert!(!policy.exclusive_cluster_hosts);
        assert_eq!(policy.max_conflict_retries, 3);
        assert_eq!(policy.retry_backoff, Duration::from_millis(25));
    }
}
