//! Vessel - A Docker-compatible container engine whose containers are virtual machines
//!
//! Every container is backed by a VM on a virtualization platform. Vessel
//! keeps a cache of those containers and provides:
//!
//! - A container state machine driven by committing handles
//! - Network scopes with per-container endpoints and IP allocation
//! - Host port publishing with a single-owner index and reclaim of stale ports
//! - Recovery of containers already present on the platform
//! - Lifecycle events

pub mod backend;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod infra;
pub mod network;
pub mod portmap;

pub use backend::{ContainerBackend, CreateRequest};
pub use config::EngineConfig;
pub use error::{Result, VesselError};
