use crate::nova::HypervisorDetail;
use crate::server::Server;
use crate::settings::Overcommit;
use anyhow::{bail, Result};
use log::{debug, error, warn};
use std::cell::Cell;
use std::sync::Arc;

fn sigmoid(x: f64) -> f64 {
    x / (1.0 + x.abs())
}

/// A compute host, the servers it carries and a stack of prior
/// server-list states used to roll planning back
#[derive(Debug)]
pub struct Hypervisor {
    pub id: u64,
    pub hostname: String,
    status: String,
    vcpus_raw: u32,
    memory_mb_raw: u64,
    pub vcpus_used: i64,
    pub memory_mb_used: i64,
    config: Overcommit,
    common_ratio: i64,
    servers: Vec<Arc<Server>>,
    snapshots: Vec<Vec<Arc<Server>>>,
    warned_ram: Cell<bool>,
    warned_vcpus: Cell<bool>,
}

impl Hypervisor {
    pub fn new(info: &HypervisorDetail, common_ratio: i64, config: Overcommit) -> Self {
        debug!("Initialized hypervisor: {}", info.id);
        Self {
            id: info.id,
            hostname: info.hypervisor_hostname.clone(),
            status: info.status.clone(),
            vcpus_raw: info.vcpus,
            memory_mb_raw: info.memory_mb,
            vcpus_used: info.vcpus_used,
            memory_mb_used: info.memory_mb_used,
            config,
            common_ratio,
            servers: Vec::new(),
            snapshots: Vec::new(),
            warned_ram: Cell::new(false),
            warned_vcpus: Cell::new(false),
        }
    }

    pub fn enabled(&self) -> bool {
        self.status == "enabled"
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn vcpus_capacity(&self) -> i64 {
        (self.vcpus_raw as f64 * self.config.cpu_overcommit) as i64
    }

    pub fn memory_capacity(&self) -> i64 {
        (self.memory_mb_raw as f64 * self.config.ram_overcommit) as i64
    }

    /// Number of vCPUs still free under the overcommitted capacity. May go
    /// negative; the first time it does a warning is logged and the value
    /// keeps being served.
    pub fn available_vcpus(&self) -> i64 {
        let used: i64 = self.servers.iter().map(|s| s.vcpus() as i64).sum();
        let available = self.vcpus_capacity() - used;

        if available < 0 && !self.warned_vcpus.get() {
            warn!("Used vCPUs above overcommit threshold on {}", self.hostname);
            self.warned_vcpus.set(true);
        }

        available
    }

    /// MB of memory still free after the hypervisor's own overhead. May go
    /// negative, same warning policy as [Self::available_vcpus].
    pub fn available_ram(&self) -> i64 {
        let used: i64 = self.servers.iter().map(|s| s.ram() as i64).sum();
        let available = self.memory_capacity() - used - self.config.memory_overhead_mb;

        if available < 0 && !self.warned_ram.get() {
            warn!("Used memory above overcommit threshold on {}", self.hostname);
            self.warned_ram.set(true);
        }

        available
    }

    /// Ratio between available RAM and available vCPUs. With no free vCPUs
    /// this falls through to the available RAM itself, which keeps the
    /// ordering callers rely on.
    pub fn ratio(&self) -> i64 {
        let vcpus = self.available_vcpus();
        if vcpus == 0 {
            return self.available_ram();
        }
        self.available_ram() / vcpus
    }

    /// Sum of divergences of hosted servers, split into the vCPU-heavy
    /// (left) and RAM-heavy (right) totals, both non-negative
    pub fn divergence(&self) -> (f64, f64) {
        let mut left = 0.0;
        let mut right = 0.0;
        for server in &self.servers {
            let divergence = server.divergence_from(self.common_ratio);
            if divergence < 0.0 {
                left -= divergence;
            } else {
                right += divergence;
            }
        }
        (left, right)
    }

    /// Angular deviation of this host's free-capacity ratio from the most
    /// common workload ratio, weighted down when the host is nearly full or
    /// nearly empty. Zero is optimal; the sign tells which kind of server
    /// the host should attract.
    pub fn score(&self) -> f64 {
        let weight_ram = sigmoid(self.available_ram() as f64 / self.memory_mb_raw as f64);
        let weight_vcpus = sigmoid(self.available_vcpus() as f64 / self.vcpus_raw as f64);
        let angle = (self.common_ratio as f64).atan() - (self.ratio() as f64).atan();
        angle * (weight_ram + weight_vcpus)
    }

    /// Score this hypervisor would have if it also hosted the given server.
    /// When the server does not fit the current score is returned.
    pub fn score_with(&mut self, server: &Arc<Server>) -> f64 {
        if !self.add_server(server.clone(), false) {
            return self.score();
        }
        let score = self.score();
        assert!(self.remove_server(server));
        score
    }

    /// Add a server to this host. Unless forced, the server is refused when
    /// it does not fit inside the available resources.
    pub fn add_server(&mut self, server: Arc<Server>, force: bool) -> bool {
        if !force
            && (server.ram() as i64 > self.available_ram()
                || server.vcpus() as i64 > self.available_vcpus())
        {
            return false;
        }
        debug!("Adding {} to {}", server.name, self.hostname);
        self.servers.push(server);
        true
    }

    /// Remove a server by identity. Returns false and leaves the list
    /// untouched unless exactly one entry matched.
    pub fn remove_server(&mut self, server: &Server) -> bool {
        debug!("Removing {} from {}", server.name, self.hostname);
        let filtered: Vec<Arc<Server>> = self
            .servers
            .iter()
            .filter(|s| s.as_ref() != server)
            .cloned()
            .collect();
        if filtered.len() + 1 == self.servers.len() {
            self.servers = filtered;
            true
        } else {
            error!(
                "Error while removing server {}: VM count {} -> {}",
                server.name,
                self.servers.len(),
                filtered.len()
            );
            false
        }
    }

    /// Detach and return all hosted servers
    pub fn pop_all(&mut self) -> Vec<Arc<Server>> {
        std::mem::take(&mut self.servers)
    }

    /// Replace the server list wholesale, e.g. to roll a failed mix back
    pub fn set_servers(&mut self, servers: Vec<Arc<Server>>) {
        self.servers = servers;
    }

    /// Push a copy of the current server list onto the snapshot stack
    pub fn snapshot(&mut self, validate: bool) -> Result<()> {
        self.snapshots.push(self.servers.clone());
        if validate {
            self.verify_available_resources()?;
        }
        Ok(())
    }

    /// Replace the server list with a copy of a stack entry. Negative
    /// indices count from the end, 0 addresses the state taken at load.
    pub fn use_snapshot(&mut self, index: isize, validate: bool) -> Result<()> {
        let resolved = if index < 0 {
            self.snapshots.len() - index.unsigned_abs()
        } else {
            index as usize
        };
        self.servers = self.snapshots[resolved].clone();
        if validate {
            self.verify_available_resources()?;
        }
        Ok(())
    }

    /// Check that the availability derived from the server list agrees with
    /// the counters reported by the API. A mismatch means the overcommit or
    /// overhead configuration is wrong for this cloud and planning on top of
    /// it would produce garbage.
    pub fn verify_available_resources(&self) -> Result<()> {
        let vcpus_check = self.vcpus_capacity() - self.vcpus_used;
        if self.available_vcpus() != vcpus_check {
            error!(
                "Calculated available vCPUs ({}) is not {} on {}",
                self.available_vcpus(),
                vcpus_check,
                self.hostname
            );
            bail!("available vCPU mismatch on {}, check the configuration", self.hostname);
        }

        let ram_check = self.memory_capacity() - self.memory_mb_used;
        if self.available_ram() != ram_check {
            error!(
                "Calculated available RAM ({}) is not {} on {}",
                self.available_ram(),
                ram_check,
                self.hostname
            );
            bail!("available RAM mismatch on {}, check the configuration", self.hostname);
        }
        Ok(())
    }
}
