//! fleet.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::flavor::{Flavor, FlavorCatalog, FlavorError, FlavorKind, Resources};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub store: Option<StoreConfig>,
    pub allocation: Option<AllocationConfig>,
    pub flavors: Vec<FlavorConfig>,
    pub hosts: Option<Vec<HostConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// redb file; the store is kept in memory when absent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationConfig {
    pub exclusive_cluster_hosts: Option<bool>,
    pub max_conflict_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorConfig {
    pub name: String,
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub kind: FlavorKind,
    pub headroom: Option<u32>,
    pub replaces: Option<String>,
    pub retired: Option<bool>,
    pub cost: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    pub flavor: String,
    pub ip_addresses: Vec<IpAddr>,
    pub additional_ip_addresses: Option<Vec<IpAddr>>,
}

impl From<&FlavorConfig> for Flavor {
    fn from(cfg: &FlavorConfig) -> Self {
        Flavor {
            name: cfg.name.clone(),
            resources: Resources::new(cfg.cpu, cfg.memory, cfg.disk),
            kind: cfg.kind,
            headroom: cfg.headroom.unwrap_or(0),
            replaces: cfg.replaces.clone(),
            retired: cfg.retired.unwrap_or(false),
            cost: cfg.cost.unwrap_or(0),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build the immutable flavor catalog declared by `[[flavors]]`.
    pub fn flavor_catalog(&self) -> Result<FlavorCatalog, FlavorError> {
        FlavorCatalog::new(self.flavors.iter().map(Flavor::from))
    }

    pub fn allocation(&self) -> AllocationConfig {
        self.allocation.clone().unwrap_or_default()
    }

    pub fn hosts(&self) -> &[HostConfig] {
        self.hosts.as_deref().unwrap_or_default()
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_ref()?.path.as_deref()
    }
}
