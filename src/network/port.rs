//! Protocol-qualified ports

use crate::error::{Result, VesselError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(VesselError::InvalidPortSpec(format!(
                "unsupported protocol {}",
                other
            ))),
        }
    }
}

/// A port number qualified by its protocol, written `80/tcp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Port {
    pub protocol: Protocol,
    pub number: u16,
}

impl Port {
    pub fn new(protocol: Protocol, number: u16) -> Self {
        Self { protocol, number }
    }

    pub fn tcp(number: u16) -> Self {
        Self::new(Protocol::Tcp, number)
    }

    pub fn udp(number: u16) -> Self {
        Self::new(Protocol::Udp, number)
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

impl FromStr for Port {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self> {
        let (number, protocol) = match s.split_once('/') {
            Some((number, protocol)) => (number, protocol.parse()?),
            None => (s, Protocol::Tcp),
        };
        let number = parse_port_number(number)?;
        Ok(Port::new(protocol, number))
    }
}

/// Parse a single non-zero port number
pub(crate) fn parse_port_number(s: &str) -> Result<u16> {
    match s.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(VesselError::InvalidPortSpec(format!("invalid port {:?}", s))),
        Ok(n) => Ok(n),
    }
}
