use serde::{Deserialize, Serialize};

/// A resource shape VMs are created against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub ram_mb: u64,
    pub vcpus: u32,
}

/// An instance and the resources it consumes on its host
#[derive(Debug, Clone, Serialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub status: String,
    /// Hostname of the hypervisor this server was loaded on, if known
    pub host: Option<String>,
    ram_mb: u64,
    vcpus: u32,
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Server {}

impl Server {
    pub fn new(
        id: String,
        name: String,
        status: String,
        host: Option<String>,
        flavor: &Flavor,
    ) -> Self {
        Self {
            id,
            name,
            status,
            host,
            ram_mb: flavor.ram_mb,
            vcpus: flavor.vcpus,
        }
    }

    /// Memory assigned to this server in MB
    pub fn ram(&self) -> u64 {
        self.ram_mb
    }

    /// Number of virtual CPUs assigned to this server
    pub fn vcpus(&self) -> u32 {
        self.vcpus
    }

    /// RAM/vCPU ratio, rounded down so ratios can be compared
    /// without floating point issues
    pub fn ratio(&self) -> i64 {
        (self.ram_mb / self.vcpus as u64) as i64
    }

    /// Length of this server's resource vector
    pub fn length(&self) -> f64 {
        let ram = self.ram_mb as f64;
        let vcpus = self.vcpus as f64;
        (ram * ram + vcpus * vcpus).sqrt()
    }

    /// Signed projection of this server's resource vector onto the deviation
    /// from a reference RAM/vCPU slope. Positive means RAM-heavy relative to
    /// the reference, negative means vCPU-heavy.
    pub fn divergence_from(&self, reference: i64) -> f64 {
        let angle = (self.ratio() as f64).atan() - (reference as f64).atan();
        self.length() * angle.sin()
    }
}
