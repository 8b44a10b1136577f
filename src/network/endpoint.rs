//! Container endpoints on a scope

use super::port::Port;
use crate::error::{Result, VesselError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

/// A DNS alias that resolves to a container on a scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Alias {
    /// The alias itself
    pub name: String,
    /// Name of the container the alias is defined against
    pub container: String,
}

/// A container's attachment to one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    container_id: String,
    container_name: String,
    scope: String,
    ip: Ipv4Addr,
    static_ip: bool,
    mac_address: String,
    ports: BTreeSet<Port>,
    /// Aliases keyed by the container they are defined against
    aliases: BTreeMap<String, Vec<Alias>>,
}

impl Endpoint {
    /// Create an endpoint; without an address it waits for one from the scope's allocator
    pub fn new(
        container_id: &str,
        container_name: &str,
        scope: &str,
        ip: Option<Ipv4Addr>,
    ) -> Self {
        Self {
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            scope: scope.to_string(),
            ip: ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            static_ip: ip.is_some(),
            mac_address: generate_mac_address(),
            ports: BTreeSet::new(),
            aliases: BTreeMap::new(),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn is_static(&self) -> bool {
        self.static_ip
    }

    pub fn mac_address(&self) -> &str {
        &self.mac_address
    }

    pub(crate) fn assign_ip(&mut self, ip: Ipv4Addr) {
        self.ip = ip;
    }

    /// Whether an address has been assigned
    pub fn has_ip(&self) -> bool {
        !self.ip.is_unspecified()
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    /// Expose a port on the endpoint
    pub fn add_port(&mut self, port: Port) -> Result<()> {
        if !self.ports.insert(port) {
            return Err(VesselError::PortAlreadyExposed(port.to_string()));
        }
        Ok(())
    }

    /// Add an alias defined against `container`, returning the stored alias
    ///
    /// Adding an alias that already exists returns the existing one. An empty
    /// name adds nothing.
    pub fn add_alias(&mut self, container: &str, name: &str) -> Option<Alias> {
        if name.is_empty() {
            return None;
        }

        let container = if container.is_empty() {
            self.container_name.clone()
        } else {
            container.to_string()
        };

        let aliases = self.aliases.entry(container.clone()).or_default();
        if let Some(existing) = aliases.iter().find(|a| a.name == name) {
            return Some(existing.clone());
        }

        let alias = Alias {
            name: name.to_string(),
            container,
        };
        aliases.push(alias.clone());
        Some(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &Alias> {
        self.aliases.values().flatten()
    }

    /// Fully qualified name of an alias on this endpoint's scope
    ///
    /// Aliases of the endpoint's own container are `scope:alias`, links to
    /// other containers are `scope:container:alias`.
    pub fn scoped_name(&self, alias: &Alias) -> String {
        if alias.container == self.container_name {
            format!("{}:{}", self.scope, alias.name)
        } else {
            format!("{}:{}:{}", self.scope, alias.container, alias.name)
        }
    }

    /// Copy of the endpoint with independent port and alias collections
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

/// Per-scope network request persisted with a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Address requested by the user
    pub static_ip: Option<Ipv4Addr>,
    /// Address currently assigned, set while the container is bound
    pub assigned_ip: Option<Ipv4Addr>,
    /// Ports exposed on the scope
    pub ports: Vec<Port>,
    /// Aliases, `name` for the container itself or `container:name` for links
    pub aliases: Vec<String>,
}

/// Generate a random MAC address
fn generate_mac_address() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    // Use locally administered, unicast MAC
    let bytes: [u8; 6] = [
        0x02, // Locally administered
        rng.gen(),
        rng.gen(),
        rng.gen(),
        rng.gen(),
        rng.gen(),
    ];

    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}
