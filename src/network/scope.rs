//! Network scopes

use super::config::{IpAllocator, ScopeType, Subnet};
use super::endpoint::Endpoint;
use crate::error::{Result, VesselError};
use crate::infra::HasReference;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// A named network that containers attach endpoints to
#[derive(Debug, Clone)]
pub struct Scope {
    id: String,
    name: String,
    scope_type: ScopeType,
    subnet: Subnet,
    gateway: Ipv4Addr,
    allocator: IpAllocator,
    /// Endpoints keyed by container ID
    endpoints: HashMap<String, Endpoint>,
}

impl HasReference for Scope {
    fn reference(&self) -> &str {
        &self.name
    }
}

/// Read-only summary of a scope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeInfo {
    pub id: String,
    pub name: String,
    pub scope_type: ScopeType,
    pub subnet: String,
    pub gateway: Ipv4Addr,
    pub endpoints: usize,
}

impl Scope {
    /// Create a new scope
    pub fn new(name: &str, scope_type: ScopeType, subnet: Subnet, gateway: Ipv4Addr) -> Result<Self> {
        if name.is_empty() {
            return Err(VesselError::Network("Scope name cannot be empty".to_string()));
        }
        let allocator = IpAllocator::new(subnet, gateway)?;

        Ok(Self {
            id: Uuid::new_v4().to_string().replace("-", "")[..12].to_string(),
            name: name.to_string(),
            scope_type,
            subnet,
            gateway,
            allocator,
            endpoints: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope_type(&self) -> ScopeType {
        self.scope_type
    }

    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn info(&self) -> ScopeInfo {
        ScopeInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            scope_type: self.scope_type,
            subnet: self.subnet.to_string(),
            gateway: self.gateway,
            endpoints: self.endpoints.len(),
        }
    }

    pub fn endpoint(&self, container_id: &str) -> Option<&Endpoint> {
        self.endpoints.get(container_id)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// Attach an endpoint, assigning it an address
    ///
    /// Static addresses are reserved as given; dynamic endpoints get the
    /// next free address in the subnet.
    pub fn add_endpoint(&mut self, mut endpoint: Endpoint) -> Result<&Endpoint> {
        let container_id = endpoint.container_id().to_string();
        if self.endpoints.contains_key(&container_id) {
            return Err(VesselError::Network(format!(
                "Container {} already has an endpoint on {}",
                container_id, self.name
            )));
        }

        if endpoint.is_static() {
            self.allocator.reserve(endpoint.ip())?;
        } else {
            let ip = self.allocator.allocate()?;
            endpoint.assign_ip(ip);
        }

        Ok(self.endpoints.entry(container_id).or_insert(endpoint))
    }

    /// Swap an existing endpoint for an updated copy, keeping its address
    pub(crate) fn replace_endpoint(&mut self, endpoint: Endpoint) -> Option<Endpoint> {
        self.endpoints
            .insert(endpoint.container_id().to_string(), endpoint)
    }

    /// Detach a container's endpoint and release its address
    pub fn remove_endpoint(&mut self, container_id: &str) -> Option<Endpoint> {
        let endpoint = self.endpoints.remove(container_id)?;
        if endpoint.has_ip() {
            self.allocator.release(endpoint.ip());
        }
        Some(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new(
            "bridge",
            ScopeType::Bridge,
            "172.16.0.0/16".parse().unwrap(),
            Ipv4Addr::new(172, 16, 0, 1),
        )
        .unwrap()
    }

    #[test]
    fn test_add_endpoint_allocates_address() {
        let mut scope = scope();
        let ip = scope
            .add_endpoint(Endpoint::new("c1", "web", "bridge", None))
            .unwrap()
            .ip();
        assert_eq!(ip, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(scope.info().endpoints, 1);
    }

    #[test]
    fn test_static_address_conflict() {
        let mut scope = scope();
        let fixed = Some(Ipv4Addr::new(172, 16, 0, 50));
        scope
            .add_endpoint(Endpoint::new("c1", "web", "bridge", fixed))
            .unwrap();
        assert!(scope
            .add_endpoint(Endpoint::new("c2", "db", "bridge", fixed))
            .is_err());
        assert!(scope.endpoint("c2").is_none());
    }

    #[test]
    fn test_remove_endpoint_releases_address() {
        let mut scope = scope();
        scope
            .add_endpoint(Endpoint::new("c1", "web", "bridge", None))
            .unwrap();
        let removed = scope.remove_endpoint("c1").unwrap();
        assert!(scope.remove_endpoint("c1").is_none());

        let again = scope
            .add_endpoint(Endpoint::new("c2", "db", "bridge", Some(removed.ip())))
            .unwrap();
        assert_eq!(again.ip(), removed.ip());
    }
}
