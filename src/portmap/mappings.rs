//! Host port ownership

use super::allocator::PortAllocator;
use super::binding::{unroll_port_map, PortBinding, PortMapping};
use super::mapper::{MapperError, NatRule, PortMapper};
use crate::config::EngineConfig;
use crate::error::{Result, VesselError};
use crate::network::Protocol;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
struct Owner {
    container_id: String,
    rule: NatRule,
}

/// Installed port mappings and the container owning each host port
///
/// One lock covers the whole index and is held for a complete map or unmap
/// batch, so a host port has at most one owner at any instant.
pub struct PortMappings {
    mapper: Arc<dyn PortMapper>,
    allocator: PortAllocator,
    index: Mutex<HashMap<(Protocol, u16), Owner>>,
    external_interface: String,
    bridge_interface: String,
}

impl PortMappings {
    pub fn new(mapper: Arc<dyn PortMapper>, config: &EngineConfig) -> Self {
        Self {
            mapper,
            allocator: PortAllocator::new(config.ephemeral_ports),
            index: Mutex::new(HashMap::new()),
            external_interface: config.external_interface.clone(),
            bridge_interface: config.bridge_interface.clone(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<(Protocol, u16), Owner>>> {
        self.index
            .lock()
            .map_err(|_| VesselError::Lock("Failed to acquire port index lock".to_string()))
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    /// Allocate an ephemeral host port
    pub fn request_host_port(&self, protocol: Protocol) -> Result<u16> {
        self.allocator.request_port(protocol)
    }

    /// Expand bindings, allocating and writing back missing host ports
    pub fn unroll(&self, bindings: &mut [PortBinding]) -> Result<Vec<PortMapping>> {
        unroll_port_map(bindings, &self.allocator)
    }

    /// Forward every binding to the container endpoint at `endpoint_ip`
    ///
    /// Fails on the first port held by another container or rejected by the
    /// mapper, leaving earlier ports of the batch mapped; the caller undoes
    /// them with [`PortMappings::unmap_ports`].
    pub fn map_ports(
        &self,
        bindings: &mut [PortBinding],
        endpoint_ip: Ipv4Addr,
        container_id: &str,
    ) -> Result<()> {
        if bindings.is_empty() {
            return Ok(());
        }

        let mappings = self.unroll(bindings)?;
        let mut index = self.lock()?;

        for mapping in mappings {
            let key = (mapping.protocol, mapping.host_port);
            if let Some(owner) = index.get(&key) {
                if owner.container_id == container_id {
                    debug!("{}/{} already mapped to {}", mapping.host_port, mapping.protocol, container_id);
                    continue;
                }
                return Err(VesselError::PortUnavailable {
                    port: format!("{}/{}", mapping.host_port, mapping.protocol),
                    owner: owner.container_id.clone(),
                });
            }

            let rule = NatRule {
                protocol: mapping.protocol,
                host_ip: mapping.host_ip,
                host_port: mapping.host_port,
                container_ip: endpoint_ip,
                container_port: mapping.container_port,
                external_interface: self.external_interface.clone(),
                bridge_interface: self.bridge_interface.clone(),
            };
            if let Err(e) = self.mapper.map_port(&rule) {
                error!("Failed to map {} for {}: {}", rule, container_id, e);
                return Err(e.into());
            }

            self.allocator.reserve(mapping.protocol, mapping.host_port);
            debug!("Mapped {} for {}", rule, container_id);
            index.insert(
                key,
                Owner {
                    container_id: container_id.to_string(),
                    rule,
                },
            );
        }

        Ok(())
    }

    /// Remove the mappings of `container_id` named by `bindings`
    ///
    /// Ports that are not mapped, or are mapped for another container, are
    /// left alone.
    pub fn unmap_ports(&self, bindings: &[PortBinding], container_id: &str) -> Result<()> {
        let mut index = self.lock()?;

        for binding in bindings {
            let Some(host_port) = binding.host_port else {
                continue;
            };
            let key = (binding.protocol(), host_port);

            let held_by = index.get(&key).map(|owner| owner.container_id.clone());
            match held_by {
                None => {
                    debug!("{}/{} is not mapped", host_port, binding.protocol());
                }
                Some(other) if other != container_id => {
                    debug!(
                        "{}/{} belongs to {}, leaving it",
                        host_port,
                        binding.protocol(),
                        other
                    );
                }
                Some(_) => {
                    if let Some(owner) = index.remove(&key) {
                        self.release(&mut index, key, owner)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Remove every mapping owned by `container_id`
    pub fn unmap_container(&self, container_id: &str) -> Result<usize> {
        let mut index = self.lock()?;
        let keys: Vec<(Protocol, u16)> = index
            .iter()
            .filter(|(_, owner)| owner.container_id == container_id)
            .map(|(key, _)| *key)
            .collect();

        for key in &keys {
            if let Some(owner) = index.remove(key) {
                self.release(&mut index, *key, owner)?;
            }
        }

        Ok(keys.len())
    }

    /// Take down the rule of an entry already removed from the index
    fn release(
        &self,
        index: &mut HashMap<(Protocol, u16), Owner>,
        key: (Protocol, u16),
        owner: Owner,
    ) -> Result<()> {
        match self.mapper.unmap_port(&owner.rule) {
            Ok(()) => {}
            Err(MapperError::RuleMissing(rule)) => {
                warn!("NAT rule {} was already gone", rule);
            }
            Err(e) => {
                error!("Failed to unmap {} for {}: {}", owner.rule, owner.container_id, e);
                index.insert(key, owner);
                return Err(e.into());
            }
        }

        self.allocator.release(key.0, key.1);
        debug!("Unmapped {}/{} from {}", key.1, key.0, owner.container_id);
        Ok(())
    }

    /// Container currently holding a host port
    pub fn owner(&self, protocol: Protocol, host_port: u16) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .get(&(protocol, host_port))
            .map(|owner| owner.container_id.clone()))
    }

    /// Host ports held by a container
    pub fn owned_ports(&self, container_id: &str) -> Result<Vec<(Protocol, u16)>> {
        let mut ports: Vec<(Protocol, u16)> = self
            .lock()?
            .iter()
            .filter(|(_, owner)| owner.container_id == container_id)
            .map(|(key, _)| *key)
            .collect();
        ports.sort();
        Ok(ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Port;
    use crate::portmap::MemoryPortMapper;
    use std::thread;

    fn mappings() -> (Arc<MemoryPortMapper>, PortMappings) {
        let mapper = Arc::new(MemoryPortMapper::new());
        let ports = PortMappings::new(mapper.clone(), &EngineConfig::default());
        (mapper, ports)
    }

    fn ip() -> Ipv4Addr {
        Ipv4Addr::new(172, 16, 0, 2)
    }

    #[test]
    fn test_map_allocates_and_records_owner() {
        let (mapper, ports) = mappings();
        let mut bindings = vec![PortBinding::new(Port::tcp(80))];

        ports.map_ports(&mut bindings, ip(), "c1").unwrap();

        let host_port = bindings[0].host_port.unwrap();
        assert!(EngineConfig::default().ephemeral_ports.contains(host_port));
        assert_eq!(ports.owner(Protocol::Tcp, host_port).unwrap().as_deref(), Some("c1"));
        assert_eq!(mapper.rule(Protocol::Tcp, host_port).unwrap().container_ip, ip());
    }

    #[test]
    fn test_map_refuses_port_owned_elsewhere() {
        let (_, ports) = mappings();
        let mut first = vec![PortBinding::new(Port::tcp(80)).with_host_port(8083)];
        ports.map_ports(&mut first, ip(), "c1").unwrap();

        let mut second = vec![PortBinding::new(Port::tcp(80)).with_host_port(8083)];
        match ports.map_ports(&mut second, Ipv4Addr::new(172, 16, 0, 3), "c2") {
            Err(VesselError::PortUnavailable { owner, .. }) => assert_eq!(owner, "c1"),
            other => panic!("unexpected result: {:?}", other),
        }

        // same owner again is a no-op
        ports.map_ports(&mut first, ip(), "c1").unwrap();
    }

    #[test]
    fn test_concurrent_map_single_owner() {
        let (_, ports) = mappings();
        let ports = Arc::new(ports);

        let workers: Vec<_> = ["c1", "c2"]
            .into_iter()
            .map(|id| {
                let ports = ports.clone();
                thread::spawn(move || {
                    let mut bindings = vec![PortBinding::new(Port::tcp(80)).with_host_port(9090)];
                    ports.map_ports(&mut bindings, ip(), id).is_ok()
                })
            })
            .collect();

        let succeeded = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(succeeded, 1);
        assert!(ports.owner(Protocol::Tcp, 9090).unwrap().is_some());
    }

    #[test]
    fn test_unmap_is_idempotent() {
        let (mapper, ports) = mappings();
        let mut bindings = vec![
            PortBinding::new(Port::tcp(80)).with_host_port(8080),
            PortBinding::new(Port::udp(53)),
        ];
        ports.map_ports(&mut bindings, ip(), "c1").unwrap();

        ports.unmap_ports(&bindings, "c1").unwrap();
        ports.unmap_ports(&bindings, "c1").unwrap();

        assert!(mapper.installed().is_empty());
        assert!(ports.owned_ports("c1").unwrap().is_empty());
    }

    #[test]
    fn test_unmap_leaves_other_owner() {
        let (_, ports) = mappings();
        let mut bindings = vec![PortBinding::new(Port::tcp(80)).with_host_port(8080)];
        ports.map_ports(&mut bindings, ip(), "c1").unwrap();

        ports.unmap_ports(&bindings, "c2").unwrap();
        assert_eq!(ports.owner(Protocol::Tcp, 8080).unwrap().as_deref(), Some("c1"));

        assert_eq!(ports.unmap_container("c1").unwrap(), 1);
        assert!(ports.owner(Protocol::Tcp, 8080).unwrap().is_none());
    }

    #[test]
    fn test_partial_failure_is_undone_by_unmap() {
        let (mapper, ports) = mappings();
        mapper.fail_on(8081);
        let mut bindings = vec![
            PortBinding::new(Port::tcp(80)).with_host_port(8080),
            PortBinding::new(Port::tcp(81)).with_host_port(8081),
        ];

        assert!(ports.map_ports(&mut bindings, ip(), "c1").is_err());
        assert_eq!(ports.owned_ports("c1").unwrap(), vec![(Protocol::Tcp, 8080)]);

        ports.unmap_ports(&bindings, "c1").unwrap();
        assert!(mapper.installed().is_empty());
    }
}
