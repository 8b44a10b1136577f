//! Error types for Vessel

use crate::infra::Fault;
use crate::portmap::MapperError;
use thiserror::Error;

/// Result type for Vessel operations
pub type Result<T> = std::result::Result<T, VesselError>;

/// Engine step during which an infrastructure fault occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Create,
    Stop,
    Reconfigure,
    Start,
    Refresh,
    Remove,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Create => write!(f, "create"),
            Step::Stop => write!(f, "stop"),
            Step::Reconfigure => write!(f, "reconfigure"),
            Step::Start => write!(f, "start"),
            Step::Refresh => write!(f, "refresh"),
            Step::Remove => write!(f, "remove"),
        }
    }
}

/// Vessel error types
#[derive(Error, Debug)]
pub enum VesselError {
    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container already exists in the cache: {0}")]
    ContainerExists(String),

    #[error("Container is powered on: {0}")]
    RemovePower(String),

    #[error("A spec must be provided for create operations")]
    MissingSpec,

    #[error("No session provided for create operations")]
    MissingSession,

    #[error("Only create operations can be committed without an existing VM: {0}")]
    MissingVm(String),

    #[error("Concurrent modification of {id}: gave up after {attempts} conflicts")]
    ConcurrentAccess { id: String, attempts: u32 },

    #[error("Infrastructure fault during {step} of {id}: {source}")]
    Infra {
        id: String,
        step: Step,
        #[source]
        source: Fault,
    },

    #[error("Invalid port specification: {0}")]
    InvalidPortSpec(String),

    #[error("Port {0} already exposed")]
    PortAlreadyExposed(String),

    #[error("Host port {port} unavailable: held by container {owner}")]
    PortUnavailable { port: String, owner: String },

    #[error("No host port available for {0}")]
    PortsExhausted(String),

    #[error("Port mapping error: {0}")]
    PortMapping(#[from] MapperError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VesselError {
    /// Wrap an infrastructure fault with the container and step it came from
    pub fn infra(id: &str, step: Step, source: Fault) -> Self {
        match source {
            Fault::NotFound(_) => VesselError::NotFound(id.to_string()),
            source => VesselError::Infra {
                id: id.to_string(),
                step,
                source,
            },
        }
    }

    /// Whether the error proves the backing object is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, VesselError::NotFound(_))
    }
}
