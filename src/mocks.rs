use crate::nova::{ComputeApi, FlavorDetail, FlavorRef, HypervisorDetail, ServerDetail};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Canned compute API source for tests
#[derive(Default)]
pub struct MockCompute {
    pub flavors: Vec<FlavorDetail>,
    pub hypervisors: Vec<HypervisorDetail>,
    pub servers: Vec<ServerDetail>,
    server_pages: AtomicUsize,
}

impl MockCompute {
    pub fn add_flavor(&mut self, id: &str, ram: u64, vcpus: u32) {
        self.flavors.push(FlavorDetail {
            id: id.to_string(),
            ram,
            vcpus,
        });
    }

    pub fn add_hypervisor(
        &mut self,
        id: u64,
        hostname: &str,
        status: &str,
        vcpus: u32,
        memory_mb: u64,
    ) {
        self.hypervisors.push(HypervisorDetail {
            id,
            hypervisor_hostname: hostname.to_string(),
            status: status.to_string(),
            vcpus,
            memory_mb,
            vcpus_used: 0,
            memory_mb_used: 0,
        });
    }

    pub fn add_server(
        &mut self,
        id: &str,
        name: &str,
        status: &str,
        flavor_id: &str,
        host: Option<&str>,
    ) {
        self.servers.push(ServerDetail {
            id: id.to_string(),
            name: name.to_string(),
            status: status.to_string(),
            flavor: FlavorRef {
                id: flavor_id.to_string(),
            },
            hypervisor_hostname: host.map(|h| h.to_string()),
        });
    }

    /// Recompute every hypervisor's reported usage counters from the
    /// servers placed on it, so that a load with zero memory overhead
    /// passes resource verification
    pub fn sync_usage_counters(&mut self) {
        for hypervisor in &mut self.hypervisors {
            let mut vcpus_used = 0;
            let mut memory_mb_used = 0;
            for server in &self.servers {
                if server.status == "SHELVED_OFFLOADED" {
                    continue;
                }
                if server.hypervisor_hostname.as_deref()
                    != Some(hypervisor.hypervisor_hostname.as_str())
                {
                    continue;
                }
                if let Some(flavor) = self.flavors.iter().find(|f| f.id == server.flavor.id) {
                    vcpus_used += flavor.vcpus as i64;
                    memory_mb_used += flavor.ram as i64;
                }
            }
            hypervisor.vcpus_used = vcpus_used;
            hypervisor.memory_mb_used = memory_mb_used;
        }
    }

    pub fn server_pages_served(&self) -> usize {
        self.server_pages.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ComputeApi for MockCompute {
    async fn list_hypervisors(&self) -> Result<Vec<HypervisorDetail>> {
        Ok(self.hypervisors.clone())
    }

    async fn list_servers(
        &self,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ServerDetail>> {
        self.server_pages.fetch_add(1, Ordering::Relaxed);
        let start = match marker {
            Some(m) => self
                .servers
                .iter()
                .position(|s| s.id == m)
                .map(|p| p + 1)
                .unwrap_or(self.servers.len()),
            None => 0,
        };
        Ok(self
            .servers
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_flavors(&self) -> Result<Vec<FlavorDetail>> {
        Ok(self.flavors.clone())
    }
}
