use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// OpenStack endpoints and credentials
    pub openstack: OpenStackConfig,

    /// Multiplier applied to raw memory capacity
    #[serde(default = "default_ram_overcommit")]
    pub ram_overcommit: f64,

    /// Multiplier applied to raw vCPU capacity
    #[serde(default = "default_cpu_overcommit")]
    pub cpu_overcommit: f64,

    /// MB subtracted from memory capacity before availability is computed
    #[serde(default = "default_memory_overhead")]
    pub hypervisor_memory_overhead: i64,

    /// Number of optimization passes over the fleet
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OpenStackConfig {
    /// Keystone v3 endpoint, eg. https://keystone:5000/v3
    pub auth_url: String,

    /// Nova endpoint, eg. https://nova:8774/v2.1
    pub compute_url: String,

    pub username: String,
    pub password: String,
    pub project_id: String,
}

/// Per-hypervisor capacity configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Overcommit {
    pub ram_overcommit: f64,
    pub cpu_overcommit: f64,
    pub memory_overhead_mb: i64,
}

impl Default for Overcommit {
    fn default() -> Self {
        Self {
            ram_overcommit: default_ram_overcommit(),
            cpu_overcommit: default_cpu_overcommit(),
            memory_overhead_mb: default_memory_overhead(),
        }
    }
}

impl Settings {
    pub fn overcommit(&self) -> Overcommit {
        Overcommit {
            ram_overcommit: self.ram_overcommit,
            cpu_overcommit: self.cpu_overcommit,
            memory_overhead_mb: self.hypervisor_memory_overhead,
        }
    }
}

fn default_ram_overcommit() -> f64 {
    1.0
}

fn default_cpu_overcommit() -> f64 {
    4.0
}

fn default_memory_overhead() -> i64 {
    32768
}

fn default_iterations() -> u32 {
    3
}
