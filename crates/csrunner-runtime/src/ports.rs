//! Port allocation for managed applications.
//!
//! `allocate` asks the OS for a free port by binding port 0 on loopback,
//! then records it in a reservation set so a concurrent allocation cannot be
//! handed the same port before the owning child actually binds it. Fixed
//! ports declared in a spec bypass allocation but go through the same
//! reservation set, which is what guarantees no two managed applications
//! hold the same port.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use csrunner_core::SupervisorError;
use tracing::debug;

/// How many rebind attempts before giving up on a collision streak.
const MAX_BIND_ATTEMPTS: usize = 16;

/// Reservation-tracking port allocator.
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an OS-assigned loopback port.
    pub fn allocate(&self) -> Result<u16, SupervisorError> {
        let mut reserved = self.reserved.lock().unwrap();
        for _ in 0..MAX_BIND_ATTEMPTS {
            let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|e| {
                SupervisorError::PortUnavailable(format!("OS refused bind: {e}"))
            })?;
            let port = listener
                .local_addr()
                .map_err(|e| SupervisorError::PortUnavailable(e.to_string()))?
                .port();
            drop(listener);

            // Collision with an outstanding reservation: rebind
            if reserved.insert(port) {
                debug!(port = %port, "Allocated port");
                return Ok(port);
            }
        }
        Err(SupervisorError::PortUnavailable(
            "no unreserved port after repeated binds".to_string(),
        ))
    }

    /// Reserve a fixed port declared in a spec. Fails when another managed
    /// application currently holds it.
    pub fn reserve_fixed(&self, port: u16) -> Result<(), SupervisorError> {
        let mut reserved = self.reserved.lock().unwrap();
        if reserved.insert(port) {
            debug!(port = %port, "Reserved fixed port");
            Ok(())
        } else {
            Err(SupervisorError::PortUnavailable(format!(
                "port {port} is held by another managed application"
            )))
        }
    }

    /// Release a reservation. Idempotent.
    pub fn release(&self, port: u16) {
        let mut reserved = self.reserved.lock().unwrap();
        if reserved.remove(&port) {
            debug!(port = %port, "Released port");
        }
    }

    /// Whether a port is currently reserved by a managed application.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().unwrap().contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_distinct_ports() {
        let allocator = PortAllocator::new();
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);
        assert!(allocator.is_reserved(a));
        assert!(allocator.is_reserved(b));
    }

    #[test]
    fn release_is_idempotent() {
        let allocator = PortAllocator::new();
        let port = allocator.allocate().unwrap();
        allocator.release(port);
        allocator.release(port);
        assert!(!allocator.is_reserved(port));
    }

    #[test]
    fn fixed_port_conflicts_with_reservation() {
        let allocator = PortAllocator::new();
        let port = allocator.allocate().unwrap();
        let err = allocator.reserve_fixed(port).unwrap_err();
        assert_eq!(err.kind(), "port_unavailable");

        allocator.release(port);
        assert!(allocator.reserve_fixed(port).is_ok());
    }

    #[test]
    fn released_port_can_be_reallocated_eventually() {
        let allocator = PortAllocator::new();
        let port = allocator.allocate().unwrap();
        allocator.release(port);
        // Not asserting the same port comes back - just that allocation
        // still works after a release.
        assert!(allocator.allocate().is_ok());
    }
}
