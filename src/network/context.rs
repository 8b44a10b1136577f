//! Scope registry and container binding

use super::config::{ScopeType, Subnet};
use super::endpoint::{Endpoint, EndpointConfig};
use super::port::Port;
use super::scope::{Scope, ScopeInfo};
use crate::config::BridgeConfig;
use crate::container::Handle;
use crate::error::{Result, VesselError};
use crate::infra::Registry;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Network mode names that select the default scope
const DEFAULT_MODES: [&str; 2] = ["", "default"];

/// A container's endpoint as seen by callers of bind and unbind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointInfo {
    pub container_id: String,
    pub scope: String,
    pub scope_type: ScopeType,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: String,
    pub mac_address: String,
    pub ports: Vec<Port>,
    /// Scope-qualified alias names
    pub aliases: Vec<String>,
}

impl EndpointInfo {
    fn new(scope: &Scope, endpoint: &Endpoint) -> Self {
        Self {
            container_id: endpoint.container_id().to_string(),
            scope: scope.name().to_string(),
            scope_type: scope.scope_type(),
            ip: endpoint.ip(),
            gateway: scope.gateway(),
            subnet: scope.subnet().to_string(),
            mac_address: endpoint.mac_address().to_string(),
            ports: endpoint.ports().copied().collect(),
            aliases: endpoint
                .aliases()
                .map(|alias| endpoint.scoped_name(alias))
                .collect(),
        }
    }
}

/// How to undo one scope's part of a bind
enum Undo {
    Added { scope: String, container_id: String },
    Replaced { scope: String, previous: Endpoint },
}

/// All scopes known to the engine
pub struct NetworkContext {
    scopes: RwLock<Registry<Scope>>,
    default_scope: RwLock<String>,
}

impl NetworkContext {
    /// Create a context holding the default bridge scope
    pub fn new(bridge: &BridgeConfig) -> Result<Self> {
        let subnet: Subnet = bridge.subnet.parse()?;
        let scope = Scope::new(&bridge.name, ScopeType::Bridge, subnet, bridge.gateway)?;

        let mut scopes = Registry::new();
        scopes.insert(scope);

        Ok(Self {
            scopes: RwLock::new(scopes),
            default_scope: RwLock::new(bridge.name.clone()),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Registry<Scope>>> {
        self.scopes
            .read()
            .map_err(|_| VesselError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Registry<Scope>>> {
        self.scopes
            .write()
            .map_err(|_| VesselError::Lock("Failed to acquire write lock".to_string()))
    }

    /// Create a new scope
    pub fn create_scope(
        &self,
        name: &str,
        scope_type: ScopeType,
        subnet: &str,
        gateway: Ipv4Addr,
    ) -> Result<ScopeInfo> {
        let scope = Scope::new(name, scope_type, subnet.parse()?, gateway)?;

        let mut scopes = self.write()?;
        if scopes.contains(name) {
            return Err(VesselError::Network(format!("Scope {} already exists", name)));
        }

        let info = scope.info();
        scopes.insert(scope);
        info!("Created {} scope {} ({})", scope_type, name, subnet);
        Ok(info)
    }

    /// Remove a scope without endpoints
    pub fn delete_scope(&self, name: &str) -> Result<()> {
        if self.default_scope()? == name {
            return Err(VesselError::Network(format!(
                "Cannot remove the default scope {}",
                name
            )));
        }

        let mut scopes = self.write()?;
        let scope = scopes
            .get(name)
            .ok_or_else(|| VesselError::NetworkNotFound(name.to_string()))?;
        if scope.endpoints().next().is_some() {
            return Err(VesselError::Network(format!(
                "Scope {} has active endpoints",
                name
            )));
        }

        scopes.remove(name);
        Ok(())
    }

    /// Get a scope by name
    pub fn scope(&self, name: &str) -> Result<ScopeInfo> {
        self.read()?
            .get(name)
            .map(Scope::info)
            .ok_or_else(|| VesselError::NetworkNotFound(name.to_string()))
    }

    /// List all scopes
    pub fn scopes(&self) -> Result<Vec<ScopeInfo>> {
        let mut scopes: Vec<ScopeInfo> = self.read()?.values().map(Scope::info).collect();
        scopes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(scopes)
    }

    pub fn default_scope(&self) -> Result<String> {
        self.default_scope
            .read()
            .map(|name| name.clone())
            .map_err(|_| VesselError::Lock("Failed to acquire read lock".to_string()))
    }

    pub fn set_default_scope(&self, name: &str) -> Result<()> {
        if !self.read()?.contains(name) {
            return Err(VesselError::NetworkNotFound(name.to_string()));
        }
        let mut default = self
            .default_scope
            .write()
            .map_err(|_| VesselError::Lock("Failed to acquire write lock".to_string()))?;
        *default = name.to_string();
        Ok(())
    }

    /// Scope name for a container network mode
    pub fn resolve_scope(&self, network_mode: &str) -> Result<String> {
        if DEFAULT_MODES.contains(&network_mode) {
            return self.default_scope();
        }
        if !self.read()?.contains(network_mode) {
            return Err(VesselError::NetworkNotFound(network_mode.to_string()));
        }
        Ok(network_mode.to_string())
    }

    /// Attach a container to every scope its configuration names
    ///
    /// Either every endpoint is bound or none is. A container that is
    /// already bound has its endpoints replaced by updated copies. The
    /// assigned addresses are staged on the handle.
    pub fn bind_container(&self, handle: &mut Handle) -> Result<Vec<EndpointInfo>> {
        let id = handle.id().to_string();
        let name = handle.exec_config().name.clone();
        let requests: Vec<(String, EndpointConfig)> = handle
            .exec_config()
            .networks
            .iter()
            .map(|(scope, config)| (scope.clone(), config.clone()))
            .collect();

        let mut scopes = self.write()?;
        let mut undo = Vec::with_capacity(requests.len());
        let mut endpoints = Vec::with_capacity(requests.len());

        for (scope_name, request) in &requests {
            match bind_one(&mut scopes, &id, &name, scope_name, request) {
                Ok((info, step)) => {
                    undo.push(step);
                    endpoints.push(info);
                }
                Err(e) => {
                    warn!("Binding {} to {} failed, rolling back: {}", id, scope_name, e);
                    rollback(&mut scopes, undo);
                    return Err(e);
                }
            }
        }
        drop(scopes);

        let config = handle.exec_config_mut();
        for endpoint in &endpoints {
            if let Some(request) = config.networks.get_mut(&endpoint.scope) {
                request.assigned_ip = Some(endpoint.ip);
            }
        }

        debug!("Bound {} to {} scope(s)", id, endpoints.len());
        Ok(endpoints)
    }

    /// Detach a container from the scopes its configuration names
    ///
    /// Returns `NotFound` when the container had no endpoint on any of them.
    pub fn unbind_container(&self, handle: &mut Handle) -> Result<Vec<EndpointInfo>> {
        let id = handle.id().to_string();
        let names: Vec<String> = handle.exec_config().networks.keys().cloned().collect();

        let mut removed = Vec::new();
        {
            let mut scopes = self.write()?;
            for name in &names {
                if let Some(scope) = scopes.get_mut(name) {
                    if let Some(endpoint) = scope.remove_endpoint(&id) {
                        removed.push(EndpointInfo::new(scope, &endpoint));
                    }
                }
            }
        }

        if removed.is_empty() {
            return Err(VesselError::NotFound(id));
        }

        for request in handle.exec_config_mut().networks.values_mut() {
            request.assigned_ip = None;
        }

        debug!("Unbound {} from {} scope(s)", id, removed.len());
        Ok(removed)
    }

    /// Drop every endpoint a container holds, whatever its configuration says
    pub fn remove_container_endpoints(&self, container_id: &str) -> Result<usize> {
        let mut scopes = self.write()?;
        let removed = scopes
            .values_mut()
            .filter_map(|scope| scope.remove_endpoint(container_id))
            .count();
        Ok(removed)
    }

    /// Endpoints a container currently holds
    pub fn container_endpoints(&self, container_id: &str) -> Result<Vec<EndpointInfo>> {
        let scopes = self.read()?;
        let mut endpoints: Vec<EndpointInfo> = scopes
            .values()
            .filter_map(|scope| {
                scope
                    .endpoint(container_id)
                    .map(|endpoint| EndpointInfo::new(scope, endpoint))
            })
            .collect();
        endpoints.sort_by(|a, b| a.scope.cmp(&b.scope));
        Ok(endpoints)
    }
}

fn bind_one(
    scopes: &mut Registry<Scope>,
    id: &str,
    name: &str,
    scope_name: &str,
    request: &EndpointConfig,
) -> Result<(EndpointInfo, Undo)> {
    let scope = scopes
        .get_mut(scope_name)
        .ok_or_else(|| VesselError::NetworkNotFound(scope_name.to_string()))?;

    let existing = scope.endpoint(id).map(Endpoint::copy);
    let rebinding = existing.is_some();
    let mut endpoint =
        existing.unwrap_or_else(|| Endpoint::new(id, name, scope_name, request.static_ip));

    for port in &request.ports {
        if rebinding && endpoint.ports().any(|p| p == port) {
            continue;
        }
        endpoint.add_port(*port)?;
    }

    for alias in &request.aliases {
        match alias.split_once(':') {
            Some((container, alias)) => endpoint.add_alias(container, alias),
            None => endpoint.add_alias("", alias),
        };
    }

    if rebinding {
        let info = EndpointInfo::new(scope, &endpoint);
        let previous = scope.replace_endpoint(endpoint);
        let undo = match previous {
            Some(previous) => Undo::Replaced {
                scope: scope_name.to_string(),
                previous,
            },
            None => Undo::Added {
                scope: scope_name.to_string(),
                container_id: id.to_string(),
            },
        };
        return Ok((info, undo));
    }

    let added = scope.add_endpoint(endpoint)?.clone();
    let info = EndpointInfo::new(scope, &added);
    Ok((
        info,
        Undo::Added {
            scope: scope_name.to_string(),
            container_id: id.to_string(),
        },
    ))
}

fn rollback(scopes: &mut Registry<Scope>, undo: Vec<Undo>) {
    for step in undo.into_iter().rev() {
        match step {
            Undo::Added {
                scope,
                container_id,
            } => {
                if let Some(scope) = scopes.get_mut(&scope) {
                    scope.remove_endpoint(&container_id);
                }
            }
            Undo::Replaced { scope, previous } => {
                if let Some(scope) = scopes.get_mut(&scope) {
                    scope.replace_endpoint(previous);
                }
            }
        }
    }
}
