//! Container create requests

use crate::error::{Result, VesselError};
use crate::network::Port;
use crate::portmap::{validate_bindings, PortBinding};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Users accepted for the container process
const ROOT_USERS: [&str; 4] = ["root", "0", "root:root", "0:0"];

const ADJECTIVES: [&str; 16] = [
    "admiring", "brave", "clever", "dazzling", "eager", "focused", "gallant", "happy",
    "jolly", "keen", "lucid", "modest", "nifty", "quirky", "serene", "vibrant",
];

const SURNAMES: [&str; 16] = [
    "babbage", "curie", "dijkstra", "euler", "feynman", "goodall", "hopper", "johnson",
    "knuth", "lovelace", "meitner", "noether", "pascal", "ritchie", "turing", "wozniak",
];

/// Request to create a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=value` pairs
    pub env: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Ports exposed on the network without publishing, e.g. `8080/tcp`
    pub exposed_ports: Vec<String>,
    /// Publish specs, `[[host_ip:]host_port:]container_port[/protocol]`
    pub port_bindings: Vec<String>,
    pub network_mode: Option<String>,
    pub aliases: Vec<String>,
    #[serde(rename = "IPAddress")]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(rename = "NumCPUs")]
    pub num_cpus: Option<u32>,
    #[serde(rename = "MemoryMB")]
    pub memory_mb: Option<u64>,
}

impl CreateRequest {
    pub fn new(image: &str, cmd: &[&str]) -> Self {
        Self {
            image: image.to_string(),
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            ..Self::default()
        }
    }

    /// Check the request without touching the platform, returning its port bindings
    pub fn validate(&self, external_addresses: &[Ipv4Addr]) -> Result<Vec<PortBinding>> {
        if self.image.is_empty() {
            return Err(VesselError::InvalidRequest("an image is required".to_string()));
        }

        let has_cmd = self.cmd.as_ref().is_some_and(|c| !c.is_empty());
        let has_entrypoint = self.entrypoint.as_ref().is_some_and(|e| !e.is_empty());
        if !has_cmd && !has_entrypoint {
            return Err(VesselError::InvalidRequest(
                "a command or entrypoint is required".to_string(),
            ));
        }

        if let Some(user) = self.user.as_deref() {
            if !user.is_empty() && !ROOT_USERS.contains(&user) {
                return Err(VesselError::InvalidRequest(format!(
                    "user {:?} is not supported, containers run as root",
                    user
                )));
            }
        }

        if let Some(name) = &self.name {
            validate_name(name)?;
        }

        self.exposed_ports()?;
        let bindings = self
            .port_bindings
            .iter()
            .map(|spec| spec.parse::<PortBinding>())
            .collect::<Result<Vec<_>>>()?;
        validate_bindings(&bindings, external_addresses)?;

        Ok(bindings)
    }

    pub fn exposed_ports(&self) -> Result<Vec<Port>> {
        self.exposed_ports.iter().map(|p| p.parse()).collect()
    }

    pub fn env_map(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .flatten()
            .filter_map(|e| e.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Container names: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    };

    if !valid {
        return Err(VesselError::InvalidRequest(format!(
            "invalid container name {:?}",
            name
        )));
    }
    Ok(())
}

/// A random `adjective_surname` name
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let surname = SURNAMES.choose(&mut rng).copied().unwrap_or("vessel");
    format!("{}_{}", adjective, surname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_request() {
        let mut request = CreateRequest::new("nginx", &["nginx"]);
        request.port_bindings = vec!["8083:80".to_string(), "53/udp".to_string()];
        request.user = Some("root".to_string());

        let bindings = request.validate(&[]).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].host_port, Some(8083));
    }

    #[test]
    fn test_rejections() {
        let external = [Ipv4Addr::new(10, 0, 0, 5)];
        let base = CreateRequest::new("nginx", &["nginx"]);

        let mut no_cmd = base.clone();
        no_cmd.cmd = None;
        assert!(no_cmd.validate(&external).is_err());

        let mut entrypoint_only = no_cmd.clone();
        entrypoint_only.entrypoint = Some(vec!["/init".to_string()]);
        assert!(entrypoint_only.validate(&external).is_ok());

        let mut user = base.clone();
        user.user = Some("www-data".to_string());
        assert!(user.validate(&external).is_err());

        let mut range = base.clone();
        range.port_bindings = vec!["8000-8001:80".to_string()];
        assert!(range.validate(&external).is_err());

        let mut foreign_ip = base.clone();
        foreign_ip.port_bindings = vec!["192.168.0.9:80:80".to_string()];
        assert!(foreign_ip.validate(&external).is_err());

        let mut bad_name = base.clone();
        bad_name.name = Some("-web".to_string());
        assert!(bad_name.validate(&external).is_err());
    }

    #[test]
    fn test_env_map() {
        let mut request = CreateRequest::new("nginx", &["nginx"]);
        request.env = Some(vec!["A=1".to_string(), "B=x=y".to_string(), "broken".to_string()]);
        let env = request.env_map();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_generated_names_are_valid() {
        for _ in 0..20 {
            let name = generate_name();
            validate_name(&name).unwrap();
            assert!(name.contains('_'));
        }
    }

    #[test]
    fn test_request_from_yaml() {
        let request: CreateRequest = serde_yaml::from_str(
            "Name: web\nImage: nginx\nCmd: [nginx]\nPortBindings: [\"8083:80\"]\nIPAddress: 172.16.0.40\n",
        )
        .unwrap();
        assert_eq!(request.name.as_deref(), Some("web"));
        assert_eq!(request.ip_address, Some(Ipv4Addr::new(172, 16, 0, 40)));
    }
}
