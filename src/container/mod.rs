//! Container management module
//!
//! Containers are cached snapshots of their backing VMs. Callers take a
//! [`Handle`] on a container, stage changes on it and hand it to
//! [`PortLayer::commit`], which applies the changes against the platform.

pub mod base;
pub mod cache;
pub mod config;
pub mod handle;
pub mod layer;
pub mod state;

pub use base::{instance_uuid, ContainerBase};
pub use cache::{Container, ContainerCache, ContainerInfo, ContainerSummary, StateWaiter};
pub use config::{ExecConfig, SessionConfig, EXEC_CONFIG_KEY};
pub use handle::Handle;
pub use layer::PortLayer;
pub use state::State;
