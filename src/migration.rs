use crate::server::Server;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// One host endpoint of a migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRef {
    pub id: u64,
    pub hostname: String,
}

/// A planned live migration of one server between two hypervisors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub server: Arc<Server>,
    pub source: HostRef,
    pub destination: HostRef,
}

impl Migration {
    pub fn new(server: Arc<Server>, source: HostRef, destination: HostRef) -> Self {
        Self {
            server,
            source,
            destination,
        }
    }

    /// The opposite migration
    pub fn reverse(&self) -> Migration {
        Migration {
            server: self.server.clone(),
            source: self.destination.clone(),
            destination: self.source.clone(),
        }
    }
}

impl Display for Migration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "openstack server migrate --live-migration --host {} {} #{}:{}>{}",
            self.destination.hostname,
            self.server.id,
            self.server.name,
            self.source.hostname,
            self.destination.hostname
        )
    }
}
