use crate::hypervisor::Hypervisor;
use crate::migration::HostRef;
use crate::nova::ComputeApi;
use crate::server::{Flavor, Server};
use crate::settings::Overcommit;
use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Page size used when listing servers
pub const SERVER_PAGE_SIZE: usize = 1000;

/// The loaded fleet: every hypervisor with its attached servers, plus the
/// workload's most common RAM/vCPU ratio, fixed at load time
pub struct Inventory {
    hypervisors: Vec<Hypervisor>,
    common_ratio: i64,
}

impl Inventory {
    /// Fetch flavors, servers and hypervisors from the compute API and
    /// attach every server to its host. Servers that are shelved, reference
    /// an unknown flavor or an unknown host are dropped with a warning. The
    /// initial snapshot is taken and validated against the API's own usage
    /// counters; disagreement means the overcommit configuration is wrong
    /// and is fatal.
    pub async fn load(api: &dyn ComputeApi, overcommit: Overcommit) -> Result<Inventory> {
        info!("Fetching flavor info");
        let flavors: HashMap<String, Flavor> = api
            .list_flavors()
            .await?
            .into_iter()
            .map(|f| {
                (
                    f.id.clone(),
                    Flavor {
                        id: f.id,
                        ram_mb: f.ram,
                        vcpus: f.vcpus,
                    },
                )
            })
            .collect();

        info!("Fetching VM info");
        let mut details = Vec::new();
        loop {
            let marker = details.last().map(|d: &crate::nova::ServerDetail| d.id.clone());
            let page = api.list_servers(marker.as_deref(), SERVER_PAGE_SIZE).await?;
            let page_len = page.len();
            details.extend(page);
            if page_len < SERVER_PAGE_SIZE {
                break;
            }
        }

        let mut servers = Vec::new();
        for detail in details {
            if detail.status == "SHELVED_OFFLOADED" {
                continue;
            }
            let Some(flavor) = flavors.get(&detail.flavor.id) else {
                warn!(
                    "Unknown flavor {} for {}, dropping server",
                    detail.flavor.id, detail.name
                );
                continue;
            };
            servers.push(Arc::new(Server::new(
                detail.id,
                detail.name,
                detail.status,
                detail.hypervisor_hostname,
                flavor,
            )));
        }

        let common_ratio = most_common_ratio(&servers);
        info!("Most common RAM/vCPU ratio: {}", common_ratio);

        info!("Fetching hypervisor info");
        let mut hypervisors: Vec<Hypervisor> = api
            .list_hypervisors()
            .await?
            .iter()
            .map(|h| Hypervisor::new(h, common_ratio, overcommit.clone()))
            .collect();

        for server in servers {
            let host = server.host.clone();
            match host.and_then(|h| hypervisors.iter_mut().find(|hv| hv.hostname == h)) {
                Some(hypervisor) => {
                    hypervisor.add_server(server, true);
                }
                None => warn!(
                    "Unknown hypervisor for {} (status: {})",
                    server.name, server.status
                ),
            }
        }

        let mut inventory = Inventory {
            hypervisors,
            common_ratio,
        };
        inventory.snapshot(true)?;
        Ok(inventory)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(hypervisors: Vec<Hypervisor>, common_ratio: i64) -> Inventory {
        let mut inventory = Inventory {
            hypervisors,
            common_ratio,
        };
        inventory
            .snapshot(false)
            .expect("unvalidated snapshot cannot fail");
        inventory
    }

    pub fn common_ratio(&self) -> i64 {
        self.common_ratio
    }

    pub fn hypervisors(&self) -> &[Hypervisor] {
        &self.hypervisors
    }

    pub fn hypervisor(&self, id: u64) -> Option<&Hypervisor> {
        self.hypervisors.iter().find(|h| h.id == id)
    }

    pub fn hypervisor_mut(&mut self, id: u64) -> Option<&mut Hypervisor> {
        self.hypervisors.iter_mut().find(|h| h.id == id)
    }

    /// Mutable access to two distinct hypervisors at once
    pub fn hypervisor_pair_mut(
        &mut self,
        a: u64,
        b: u64,
    ) -> Option<(&mut Hypervisor, &mut Hypervisor)> {
        assert_ne!(a, b, "a hypervisor cannot be paired with itself");
        let mut first = None;
        let mut second = None;
        for hypervisor in &mut self.hypervisors {
            if hypervisor.id == a {
                first = Some(hypervisor);
            } else if hypervisor.id == b {
                second = Some(hypervisor);
            }
        }
        first.zip(second)
    }

    pub fn host_ref(&self, id: u64) -> Option<HostRef> {
        self.hypervisor(id).map(|h| HostRef {
            id: h.id,
            hostname: h.hostname.clone(),
        })
    }

    pub fn enabled_hypervisors(&self) -> impl Iterator<Item = &Hypervisor> {
        self.hypervisors.iter().filter(|h| h.enabled())
    }

    /// The enabled hypervisor with room for vCPU-heavy servers: negative
    /// score, maximal left divergence. None when no host qualifies.
    pub fn left_divergent(&self) -> Option<u64> {
        self.enabled_hypervisors()
            .filter(|h| h.score() < 0.0)
            .max_by(|a, b| {
                a.divergence()
                    .0
                    .partial_cmp(&b.divergence().0)
                    .expect("divergence is never NaN")
            })
            .map(|h| h.id)
    }

    /// The enabled hypervisor with room for RAM-heavy servers: positive
    /// score, maximal right divergence. None when no host qualifies.
    pub fn right_divergent(&self) -> Option<u64> {
        self.enabled_hypervisors()
            .filter(|h| h.score() > 0.0)
            .max_by(|a, b| {
                a.divergence()
                    .1
                    .partial_cmp(&b.divergence().1)
                    .expect("divergence is never NaN")
            })
            .map(|h| h.id)
    }

    /// Push a snapshot on every hypervisor
    pub fn snapshot(&mut self, validate: bool) -> Result<()> {
        debug!("Taking snapshot");
        for hypervisor in &mut self.hypervisors {
            hypervisor.snapshot(validate)?;
        }
        Ok(())
    }

    /// Revert every hypervisor to a stored snapshot
    pub fn use_snapshot(&mut self, index: isize, validate: bool) -> Result<()> {
        debug!("Reverting to snapshot");
        for hypervisor in &mut self.hypervisors {
            hypervisor.use_snapshot(index, validate)?;
        }
        Ok(())
    }

    /// Ids of every server currently attached to any hypervisor
    pub fn all_server_ids(&self) -> Vec<String> {
        self.hypervisors
            .iter()
            .flat_map(|h| h.servers().iter().map(|s| s.id.clone()))
            .collect()
    }
}

/// The mode of the servers' RAM/vCPU ratios. Ties break towards the ratio
/// seen earliest in load order, which pins the result for a fixed input.
/// An empty workload yields 0.
fn most_common_ratio(servers: &[Arc<Server>]) -> i64 {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for server in servers {
        *counts.entry(server.ratio()).or_default() += 1;
    }
    let mut best = 0;
    let mut best_count = 0;
    for server in servers {
        let count = counts[&server.ratio()];
        if count > best_count {
            best = server.ratio();
            best_count = count;
        }
    }
    best
}
