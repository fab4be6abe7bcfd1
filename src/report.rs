use crate::hypervisor::Hypervisor;
use crate::inventory::Inventory;
use serde::Serialize;

/// Serializable projection of the inventory, one entry per hypervisor
#[derive(Debug, Clone, Serialize)]
pub struct InventoryReport {
    pub common_ratio: i64,
    pub inventory: Vec<HypervisorReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HypervisorReport {
    pub name: String,
    pub score: f64,
    pub divergence: (f64, f64),
    pub enabled: bool,
    pub vcpus: i64,
    pub vcpus_used: i64,
    pub memory_mb: i64,
    pub memory_mb_used: i64,
    pub vms: Vec<String>,
}

impl From<&Hypervisor> for HypervisorReport {
    fn from(hypervisor: &Hypervisor) -> Self {
        Self {
            name: hypervisor.hostname.clone(),
            score: hypervisor.score(),
            divergence: hypervisor.divergence(),
            enabled: hypervisor.enabled(),
            vcpus: hypervisor.vcpus_capacity(),
            vcpus_used: hypervisor.vcpus_used,
            memory_mb: hypervisor.memory_capacity(),
            memory_mb_used: hypervisor.memory_mb_used,
            vms: hypervisor.servers().iter().map(|s| s.name.clone()).collect(),
        }
    }
}

impl From<&Inventory> for InventoryReport {
    fn from(inventory: &Inventory) -> Self {
        Self {
            common_ratio: inventory.common_ratio(),
            inventory: inventory.hypervisors().iter().map(|h| h.into()).collect(),
        }
    }
}
