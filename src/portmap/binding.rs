//! Published port bindings

use crate::error::{Result, VesselError};
use crate::network::port::parse_port_number;
use crate::network::{Port, Protocol};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;

use super::allocator::PortAllocator;

/// A container port published on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: Port,
    /// Host address constraint; `None` binds every external address
    #[serde(default)]
    pub host_ip: Option<Ipv4Addr>,
    /// Requested host port, filled in once allocated
    #[serde(default)]
    pub host_port: Option<u16>,
}

impl PortBinding {
    pub fn new(container_port: Port) -> Self {
        Self {
            container_port,
            host_ip: None,
            host_port: None,
        }
    }

    pub fn with_host_port(mut self, host_port: u16) -> Self {
        self.host_port = Some(host_port);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.container_port.protocol
    }
}

impl std::fmt::Display for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ip = self.host_ip.map(|ip| ip.to_string()).unwrap_or_default();
        let port = self.host_port.map(|p| p.to_string()).unwrap_or_default();
        write!(f, "{}:{}:{}", ip, port, self.container_port)
    }
}

impl FromStr for PortBinding {
    type Err = VesselError;

    /// Parse a publish spec: `[[host_ip:]host_port:]container_port[/protocol]`
    fn from_str(s: &str) -> Result<Self> {
        let (rest, protocol) = match s.rsplit_once('/') {
            Some((rest, protocol)) => (rest, protocol.parse()?),
            None => (s, Protocol::Tcp),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => ("", "", *container),
            [host, container] => ("", *host, *container),
            [ip, host, container] => (*ip, *host, *container),
            _ => {
                return Err(VesselError::InvalidPortSpec(format!(
                    "invalid publish spec {:?}",
                    s
                )))
            }
        };

        if host_port.contains('-') || container_port.contains('-') {
            return Err(VesselError::InvalidPortSpec(format!(
                "port ranges are not supported: {:?}",
                s
            )));
        }

        let host_ip = match host_ip {
            "" => None,
            ip => Some(ip.parse::<Ipv4Addr>().map_err(|_| {
                VesselError::InvalidPortSpec(format!("invalid host IP {:?}", ip))
            })?),
        };
        let host_port = match host_port {
            "" => None,
            port => Some(parse_port_number(port)?),
        };
        let container_port = Port::new(protocol, parse_port_number(container_port)?);

        Ok(Self {
            container_port,
            host_ip,
            host_port,
        })
    }
}

/// One host-to-container forwarding after allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub host_ip: Option<Ipv4Addr>,
    pub host_port: u16,
    pub container_port: u16,
}

/// Check host address constraints against the addresses the host exposes
pub fn validate_bindings(bindings: &[PortBinding], external: &[Ipv4Addr]) -> Result<()> {
    for binding in bindings {
        match binding.host_ip {
            None => {}
            Some(ip) if ip.is_unspecified() => {}
            Some(ip) if external.contains(&ip) => {}
            Some(ip) => {
                return Err(VesselError::InvalidPortSpec(format!(
                    "host IP {} for {} is not an external address",
                    ip, binding.container_port
                )))
            }
        }
    }
    Ok(())
}

/// Expand bindings into mappings, allocating host ports where none was given
///
/// Allocated ports are written back into `bindings` so later calls reuse them.
pub fn unroll_port_map(
    bindings: &mut [PortBinding],
    allocator: &PortAllocator,
) -> Result<Vec<PortMapping>> {
    let mut mappings = Vec::with_capacity(bindings.len());

    for binding in bindings.iter_mut() {
        let protocol = binding.protocol();
        let host_port = match binding.host_port {
            Some(port) => port,
            None => {
                let port = allocator.request_port(protocol)?;
                binding.host_port = Some(port);
                port
            }
        };

        mappings.push(PortMapping {
            protocol,
            host_ip: binding.host_ip,
            host_port,
            container_port: binding.container_port.number,
        });
    }

    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;

    #[test]
    fn test_parse_publish_specs() {
        let b: PortBinding = "80".parse().unwrap();
        assert_eq!(b, PortBinding::new(Port::tcp(80)));

        let b: PortBinding = "8083:80".parse().unwrap();
        assert_eq!(b.host_port, Some(8083));

        let b: PortBinding = "10.0.0.5::53/udp".parse().unwrap();
        assert_eq!(b.host_ip, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(b.host_port, None);
        assert_eq!(b.container_port, Port::udp(53));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("8000-8010:80".parse::<PortBinding>().is_err());
        assert!("a:b:c:d".parse::<PortBinding>().is_err());
        assert!("host:80:80".parse::<PortBinding>().is_err());
        assert!("80:0".parse::<PortBinding>().is_err());
    }

    #[test]
    fn test_validate_host_ip() {
        let external = [Ipv4Addr::new(10, 0, 0, 5)];
        let ok: Vec<PortBinding> = vec!["10.0.0.5:80:80".parse().unwrap(), "0.0.0.0:81:81".parse().unwrap()];
        validate_bindings(&ok, &external).unwrap();

        let bad: Vec<PortBinding> = vec!["192.168.1.1:80:80".parse().unwrap()];
        assert!(validate_bindings(&bad, &external).is_err());
    }

    #[test]
    fn test_unroll_writes_back_allocations() {
        let allocator = PortAllocator::new(PortRange {
            start: 50000,
            end: 50010,
        });
        let mut bindings = vec![
            PortBinding::new(Port::tcp(80)),
            PortBinding::new(Port::tcp(443)).with_host_port(8443),
        ];

        let mappings = unroll_port_map(&mut bindings, &allocator).unwrap();
        assert_eq!(mappings[0].host_port, 50000);
        assert_eq!(bindings[0].host_port, Some(50000));
        assert_eq!(mappings[1].host_port, 8443);

        let again = unroll_port_map(&mut bindings, &allocator).unwrap();
        assert_eq!(again, mappings);
    }
}
