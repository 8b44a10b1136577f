//! Host port publishing
//!
//! Bindings name container ports to publish. The allocator hands out
//! ephemeral host ports, the mapper installs NAT rules, and the ownership
//! index records which container holds each host port.

mod allocator;
mod binding;
mod mapper;
mod mappings;

pub use allocator::PortAllocator;
pub use binding::{unroll_port_map, validate_bindings, PortBinding, PortMapping};
pub use mapper::{MapperError, MemoryPortMapper, NatRule, PortMapper};
pub use mappings::PortMappings;
