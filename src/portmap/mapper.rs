//! NAT rule installation

use crate::network::Protocol;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// A forwarding rule from a host port to a container endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NatRule {
    pub protocol: Protocol,
    pub host_ip: Option<Ipv4Addr>,
    pub host_port: u16,
    pub container_ip: Ipv4Addr,
    pub container_port: u16,
    pub external_interface: String,
    pub bridge_interface: String,
}

impl std::fmt::Display for NatRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} -> {}:{}",
            self.host_port, self.protocol, self.container_ip, self.container_port
        )
    }
}

/// Errors from the NAT collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapperError {
    #[error("rule already installed: {0}")]
    RuleExists(String),

    #[error("no such rule: {0}")]
    RuleMissing(String),

    #[error("{0}")]
    Failed(String),
}

/// Installs and removes NAT rules on the host
pub trait PortMapper: Send + Sync {
    fn map_port(&self, rule: &NatRule) -> Result<(), MapperError>;

    fn unmap_port(&self, rule: &NatRule) -> Result<(), MapperError>;
}

/// Rule table standing in for the host's packet filter
#[derive(Debug, Default)]
pub struct MemoryPortMapper {
    rules: Mutex<BTreeMap<(Protocol, u16), NatRule>>,
    failing: Mutex<HashSet<u16>>,
}

impl MemoryPortMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn rules(&self) -> MutexGuard<'_, BTreeMap<(Protocol, u16), NatRule>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make installing a rule for `host_port` fail
    pub fn fail_on(&self, host_port: u16) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host_port);
    }

    pub fn rule(&self, protocol: Protocol, host_port: u16) -> Option<NatRule> {
        self.rules().get(&(protocol, host_port)).cloned()
    }

    pub fn installed(&self) -> Vec<NatRule> {
        self.rules().values().cloned().collect()
    }
}

impl PortMapper for MemoryPortMapper {
    fn map_port(&self, rule: &NatRule) -> Result<(), MapperError> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&rule.host_port)
        {
            return Err(MapperError::Failed(format!("cannot install {}", rule)));
        }

        let mut rules = self.rules();
        let key = (rule.protocol, rule.host_port);
        if rules.contains_key(&key) {
            return Err(MapperError::RuleExists(rule.to_string()));
        }
        debug!("Installed NAT rule {}", rule);
        rules.insert(key, rule.clone());
        Ok(())
    }

    fn unmap_port(&self, rule: &NatRule) -> Result<(), MapperError> {
        match self.rules().remove(&(rule.protocol, rule.host_port)) {
            Some(_) => {
                debug!("Removed NAT rule {}", rule);
                Ok(())
            }
            None => Err(MapperError::RuleMissing(rule.to_string())),
        }
    }
}
