//! Container execution configuration
//!
//! The exec config is everything the guest needs to run the container. It is
//! persisted as JSON in the VM's extra config so that the container can be
//! reconstructed from the VM alone.

use crate::error::Result;
use crate::network::EndpointConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Extra config key holding the serialized exec config
pub const EXEC_CONFIG_KEY: &str = "vessel.exec_config";

/// A process session inside the container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Command to run
    pub cmd: Vec<String>,
    /// When the session was last started, as recorded by the guest
    pub started: Option<DateTime<Utc>>,
}

/// Container execution configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Unique container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Image name/tag
    pub image: String,
    /// Command to run
    pub cmd: Vec<String>,
    /// Entry point
    pub entrypoint: Vec<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub working_dir: String,
    /// User to run as
    pub user: String,
    /// Process sessions keyed by session ID; the primary session shares the container ID
    pub sessions: BTreeMap<String, SessionConfig>,
    /// Network requests keyed by scope name
    pub networks: BTreeMap<String, EndpointConfig>,
    /// Opaque data kept for layers above the engine
    pub annotations: BTreeMap<String, String>,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
}

impl ExecConfig {
    /// Create a new exec configuration
    pub fn new(id: &str, name: &str, image: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            created_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Set command to run, which is also the primary session's command
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.sessions.insert(
            self.id.clone(),
            SessionConfig {
                cmd: cmd.clone(),
                started: None,
            },
        );
        self.cmd = cmd;
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: &str) -> Self {
        self.working_dir = dir.to_string();
        self
    }

    /// Request an endpoint on a scope
    pub fn network(mut self, scope: &str, endpoint: EndpointConfig) -> Self {
        self.networks.insert(scope.to_string(), endpoint);
        self
    }

    /// Whether any session has ever been started
    pub fn has_started(&self) -> bool {
        self.sessions.values().any(|s| s.started.is_some())
    }

    /// Serialize into extra config entries
    pub fn encode(&self) -> Result<HashMap<String, String>> {
        let mut extra = HashMap::new();
        extra.insert(EXEC_CONFIG_KEY.to_string(), serde_json::to_string(self)?);
        Ok(extra)
    }

    /// Read back from extra config; `None` when the VM carries no exec config
    pub fn decode(extra: &HashMap<String, String>) -> Result<Option<Self>> {
        match extra.get(EXEC_CONFIG_KEY) {
            Some(encoded) => Ok(Some(serde_json::from_str(encoded)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Port;

    #[test]
    fn test_builder() {
        let config = ExecConfig::new("abc", "web", "nginx")
            .cmd(vec!["nginx".to_string(), "-g".to_string()])
            .env("KEY", "value")
            .working_dir("/srv")
            .network(
                "bridge",
                EndpointConfig {
                    ports: vec![Port::tcp(80)],
                    ..EndpointConfig::default()
                },
            );

        assert_eq!(config.sessions["abc"].cmd[0], "nginx");
        assert_eq!(config.env["KEY"], "value");
        assert_eq!(config.networks["bridge"].ports, vec![Port::tcp(80)]);
        assert!(!config.has_started());
    }

    #[test]
    fn test_encode_decode() {
        let mut config = ExecConfig::new("abc", "web", "nginx").cmd(vec!["nginx".to_string()]);
        config.sessions.get_mut("abc").unwrap().started = Some(Utc::now());

        let extra = config.encode().unwrap();
        let decoded = ExecConfig::decode(&extra).unwrap().unwrap();
        assert_eq!(decoded, config);
        assert!(decoded.has_started());
    }

    #[test]
    fn test_decode_missing_and_corrupt() {
        assert!(ExecConfig::decode(&HashMap::new()).unwrap().is_none());

        let mut extra = HashMap::new();
        extra.insert(EXEC_CONFIG_KEY.to_string(), "{not json".to_string());
        assert!(ExecConfig::decode(&extra).is_err());
    }
}
