//! Network management module
//!
//! Scopes are the networks containers attach to; an endpoint is one
//! container's attachment to one scope.

pub mod config;
pub mod context;
pub mod endpoint;
pub mod port;
pub mod scope;

pub use config::{IpAllocator, ScopeType, Subnet};
pub use context::{EndpointInfo, NetworkContext};
pub use endpoint::{Alias, Endpoint, EndpointConfig};
pub use port::{Port, Protocol};
pub use scope::{Scope, ScopeInfo};
