//! Engine configuration

use crate::error::{Result, VesselError};
use crate::network::Subnet;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Host ports handed out when a binding does not request one
    pub ephemeral_ports: PortRange,
    /// Upper bound on every infrastructure task, in seconds
    pub task_timeout_secs: u64,
    /// Grace period between the stop signal and a hard power off, in seconds
    pub stop_wait_secs: u64,
    /// Concurrent-modification retries allowed during reconfigure
    pub reconfigure_retry_limit: u32,
    /// Interval used when polling a VM for power state, in milliseconds
    pub power_poll_ms: u64,
    /// Name of the host interface clients connect to
    pub external_interface: String,
    /// Name of the bridge interface containers sit behind
    pub bridge_interface: String,
    /// Addresses of the external interface accepted as a host IP in port bindings
    pub external_addresses: Vec<Ipv4Addr>,
    /// Default bridge network
    pub bridge: BridgeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ephemeral_ports: PortRange::default(),
            task_timeout_secs: 180,
            stop_wait_secs: 10,
            reconfigure_retry_limit: 10,
            power_poll_ms: 250,
            external_interface: "external".to_string(),
            bridge_interface: "bridge".to_string(),
            external_addresses: Vec::new(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("vessel")
            .join(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load the configuration file if it exists, falling back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| VesselError::Yaml(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ephemeral_ports.start == 0 || self.ephemeral_ports.start > self.ephemeral_ports.end
        {
            return Err(VesselError::InvalidConfig(format!(
                "invalid ephemeral port range {}-{}",
                self.ephemeral_ports.start, self.ephemeral_ports.end
            )));
        }
        if self.task_timeout_secs == 0 {
            return Err(VesselError::InvalidConfig(
                "task_timeout_secs must be positive".to_string(),
            ));
        }
        if self.reconfigure_retry_limit == 0 {
            return Err(VesselError::InvalidConfig(
                "reconfigure_retry_limit must be positive".to_string(),
            ));
        }
        if self.bridge.name.is_empty() {
            return Err(VesselError::InvalidConfig(
                "bridge network needs a name".to_string(),
            ));
        }
        let subnet: Subnet = self.bridge.subnet.parse()?;
        if !subnet.contains(self.bridge.gateway) {
            return Err(VesselError::InvalidConfig(format!(
                "gateway {} is outside {}",
                self.bridge.gateway, self.bridge.subnet
            )));
        }
        Ok(())
    }

    /// Infrastructure task limit
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Default stop grace period
    pub fn stop_wait(&self) -> Duration {
        Duration::from_secs(self.stop_wait_secs)
    }

    /// Power state poll interval
    pub fn power_poll(&self) -> Duration {
        Duration::from_millis(self.power_poll_ms.max(1))
    }
}

/// Inclusive range of host ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 49153,
            end: 65535,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

/// Default bridge network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Network name
    pub name: String,
    /// Subnet in CIDR format
    pub subnet: String,
    /// Gateway address
    pub gateway: Ipv4Addr,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "bridge".to_string(),
            subnet: "172.16.0.0/16".to_string(),
            gateway: Ipv4Addr::new(172, 16, 0, 1),
        }
    }
}
