//! Virtualization platform interface
//!
//! The engine never talks to the cluster directly. Everything it needs from
//! the platform goes through [`Infrastructure`], and every call returns once
//! the remote task has reached a terminal result or a typed [`Fault`].

pub mod memory;
mod registry;
mod task;

pub use memory::{MemoryInfrastructure, Operation};
pub use registry::{HasReference, Registry};
pub use task::TaskContext;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Reference to a VM managed by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef(String);

impl VmRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// VM power state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::PoweredOn => write!(f, "poweredOn"),
            PowerState::PoweredOff => write!(f, "poweredOff"),
            PowerState::Suspended => write!(f, "suspended"),
        }
    }
}

/// Configuration half of a VM's properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// VM display name
    pub name: String,
    /// Optimistic concurrency stamp, changes on every reconfigure
    pub change_version: String,
    /// Instance UUID
    pub instance_uuid: String,
    /// Number of virtual CPUs
    pub num_cpus: u32,
    /// Memory in MiB
    pub memory_mb: u64,
    /// Key/value payload persisted with the VM configuration
    pub extra_config: HashMap<String, String>,
}

/// Runtime half of a VM's properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRuntime {
    pub power_state: PowerState,
}

/// Config and runtime read in one property refresh
#[derive(Debug, Clone, PartialEq)]
pub struct VmProperties {
    pub config: VmConfig,
    pub runtime: VmRuntime,
}

/// A create or reconfigure request
///
/// Fields left as `None` are not changed by a reconfigure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: Option<String>,
    pub instance_uuid: Option<String>,
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    /// Requires a powered off VM to be written durably
    pub extra_config: Option<HashMap<String, String>>,
    /// Version the reconfigure was computed against
    pub change_version: Option<String>,
}

/// Faults returned by platform tasks
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("concurrent access to {0}")]
    ConcurrentAccess(String),

    #[error("managed object not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("task did not complete within {0:?}")]
    Timeout(Duration),

    #[error("task cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Where new VMs are placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Child of a virtual app, which is its own resource pool
    VirtualApp { pool: String },
    /// Registered in a VM folder and run in a resource pool
    Folder { folder: String, pool: String },
}

impl Placement {
    /// Resource pool the VM will run in
    pub fn pool(&self) -> &str {
        match self {
            Placement::VirtualApp { pool } => pool,
            Placement::Folder { pool, .. } => pool,
        }
    }
}

/// Resolved handles from an authenticated platform session
#[derive(Debug, Clone)]
pub struct Session {
    pub datacenter: String,
    pub resource_pool: String,
    pub vm_folder: String,
    /// Virtual app used as the resource pool, when running under a cluster manager
    pub virtual_app: Option<String>,
    /// Whether the session is connected to a cluster manager rather than a single host
    pub is_vc: bool,
}

impl Session {
    /// Session for a standalone host
    pub fn new(datacenter: &str, resource_pool: &str, vm_folder: &str) -> Self {
        Self {
            datacenter: datacenter.to_string(),
            resource_pool: resource_pool.to_string(),
            vm_folder: vm_folder.to_string(),
            virtual_app: None,
            is_vc: false,
        }
    }

    /// Placement for newly created VMs
    pub fn placement(&self) -> Placement {
        match (&self.virtual_app, self.is_vc) {
            (Some(vapp), true) => Placement::VirtualApp { pool: vapp.clone() },
            _ => Placement::Folder {
                folder: self.vm_folder.clone(),
                pool: self.resource_pool.clone(),
            },
        }
    }
}

/// Operations consumed from the virtualization platform
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Create a VM from a full spec
    async fn create_vm(&self, placement: &Placement, spec: &VmSpec) -> Result<VmRef, Fault>;

    /// Apply a spec delta, guarded by `spec.change_version`
    async fn reconfigure_vm(&self, vm: &VmRef, spec: &VmSpec) -> Result<(), Fault>;

    /// Power on a VM
    async fn power_on(&self, vm: &VmRef) -> Result<(), Fault>;

    /// Hard power off a VM
    async fn power_off(&self, vm: &VmRef) -> Result<(), Fault>;

    /// Deliver a signal to the container process inside the guest
    async fn signal(&self, vm: &VmRef, signal: i64) -> Result<(), Fault>;

    /// Destroy a VM, keeping its disks
    async fn delete_vm(&self, vm: &VmRef) -> Result<(), Fault>;

    /// Drop a VM from the inventory without destroying it
    async fn unregister_vm(&self, vm: &VmRef) -> Result<(), Fault>;

    /// Remove whatever the VM left behind on its datastore
    async fn delete_files(&self, datacenter: &str, vm: &VmRef) -> Result<(), Fault>;

    /// Read the current config and runtime of a VM
    async fn properties(&self, vm: &VmRef) -> Result<VmProperties, Fault>;

    /// List the VMs in a resource pool
    async fn pool_vms(&self, pool: &str) -> Result<Vec<VmRef>, Fault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_prefers_virtual_app_under_vc() {
        let mut session = Session::new("dc", "pool", "vm");
        assert_eq!(
            session.placement(),
            Placement::Folder {
                folder: "vm".to_string(),
                pool: "pool".to_string()
            }
        );

        session.virtual_app = Some("vapp".to_string());
        assert_eq!(session.placement().pool(), "pool");

        session.is_vc = true;
        assert_eq!(
            session.placement(),
            Placement::VirtualApp {
                pool: "vapp".to_string()
            }
        );
    }
}
