//! Ephemeral host port allocation

use crate::config::PortRange;
use crate::error::{Result, VesselError};
use crate::network::Protocol;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Allocations {
    in_use: HashMap<Protocol, BTreeSet<u16>>,
    last: HashMap<Protocol, u16>,
}

/// Hands out host ports from the ephemeral range, sequentially per protocol
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    state: Mutex<Allocations>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            state: Mutex::new(Allocations::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Allocations> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Allocate the next free ephemeral port after the last one handed out
    pub fn request_port(&self, protocol: Protocol) -> Result<u16> {
        let (start, end) = (u32::from(self.range.start), u32::from(self.range.end));
        if end < start {
            return Err(VesselError::PortsExhausted(protocol.to_string()));
        }
        let size = end - start + 1;

        let mut state = self.lock();
        let from = state
            .last
            .get(&protocol)
            .map(|last| u32::from(*last) + 1)
            .unwrap_or(start);

        for offset in 0..size {
            let candidate = start + (from.saturating_sub(start) + offset) % size;
            // candidate never exceeds `end`, which is a u16
            let port = candidate as u16;
            if state.in_use.entry(protocol).or_default().insert(port) {
                state.last.insert(protocol, port);
                return Ok(port);
            }
        }

        Err(VesselError::PortsExhausted(protocol.to_string()))
    }

    /// Mark a specific port as in use; false if it already was
    pub fn reserve(&self, protocol: Protocol, port: u16) -> bool {
        self.lock().in_use.entry(protocol).or_default().insert(port)
    }

    pub fn release(&self, protocol: Protocol, port: u16) {
        if let Some(ports) = self.lock().in_use.get_mut(&protocol) {
            ports.remove(&port);
        }
    }

    pub fn is_allocated(&self, protocol: Protocol, port: u16) -> bool {
        self.lock()
            .in_use
            .get(&protocol)
            .map(|ports| ports.contains(&port))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(PortRange { start, end })
    }

    #[test]
    fn test_sequential_allocation_per_protocol() {
        let alloc = allocator(49153, 49160);
        assert_eq!(alloc.request_port(Protocol::Tcp).unwrap(), 49153);
        assert_eq!(alloc.request_port(Protocol::Tcp).unwrap(), 49154);
        assert_eq!(alloc.request_port(Protocol::Udp).unwrap(), 49153);
    }

    #[test]
    fn test_skips_reserved_and_wraps() {
        let alloc = allocator(100, 102);
        assert!(alloc.reserve(Protocol::Tcp, 101));
        assert!(!alloc.reserve(Protocol::Tcp, 101));

        assert_eq!(alloc.request_port(Protocol::Tcp).unwrap(), 100);
        assert_eq!(alloc.request_port(Protocol::Tcp).unwrap(), 102);
        assert!(matches!(
            alloc.request_port(Protocol::Tcp),
            Err(VesselError::PortsExhausted(_))
        ));

        alloc.release(Protocol::Tcp, 100);
        assert_eq!(alloc.request_port(Protocol::Tcp).unwrap(), 100);
    }
}
