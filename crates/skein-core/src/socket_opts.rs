//! Cross-cutting socket options.
//!
//! [`SocketOptions`] holds the boolean options that are read from
//! arbitrary contexts (including the receive path) and therefore live in
//! atomics outside the endpoint's locks. Options whose updates must reach
//! the endpoint synchronously (reuse-address, reuse-port) are delivered
//! through the [`SocketOptionsHandler`] installed at endpoint creation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;

/// Callbacks an endpoint implements to observe option updates that feed
/// into its registration state.
pub trait SocketOptionsHandler: Send + Sync {
    /// Called after the reuse-address option changes.
    fn on_reuse_address_set(&self, _enabled: bool) {}

    /// Called after the reuse-port option changes.
    fn on_reuse_port_set(&self, _enabled: bool) {}
}

/// Storage for endpoint-agnostic boolean socket options.
///
/// All loads and stores are relaxed: each option is an independent flag
/// and readers only need *some* recent value.
#[derive(Default)]
pub struct SocketOptions {
    handler: Mutex<Option<Weak<dyn SocketOptionsHandler>>>,

    broadcast: AtomicBool,
    multicast_loop: AtomicBool,
    no_checksum: AtomicBool,
    receive_original_dst: AtomicBool,
    receive_packet_info: AtomicBool,
    receive_tclass: AtomicBool,
    receive_tos: AtomicBool,
    reuse_address: AtomicBool,
    reuse_port: AtomicBool,
    v6_only: AtomicBool,
}

impl SocketOptions {
    /// Creates the holder with every option off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the endpoint callback handler. Called once, at endpoint
    /// construction, before the options are reachable from other threads.
    pub fn init_handler(&self, handler: Weak<dyn SocketOptionsHandler>) {
        *self.handler.lock() = Some(handler);
    }

    fn with_handler(&self, f: impl FnOnce(&dyn SocketOptionsHandler)) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler.and_then(|weak| weak.upgrade()) {
            f(&*handler);
        }
    }

    /// Whether sending to broadcast addresses is permitted.
    pub fn broadcast(&self) -> bool {
        self.broadcast.load(Ordering::Relaxed)
    }

    /// Enables or disables sending to broadcast addresses.
    pub fn set_broadcast(&self, enabled: bool) {
        self.broadcast.store(enabled, Ordering::Relaxed);
    }

    /// Whether multicast sends loop back to local receivers.
    pub fn multicast_loop(&self) -> bool {
        self.multicast_loop.load(Ordering::Relaxed)
    }

    /// Enables or disables multicast loopback.
    pub fn set_multicast_loop(&self, enabled: bool) {
        self.multicast_loop.store(enabled, Ordering::Relaxed);
    }

    /// Whether transmit checksum generation is suppressed where the
    /// network protocol permits it.
    pub fn no_checksum(&self) -> bool {
        self.no_checksum.load(Ordering::Relaxed)
    }

    /// Suppresses or restores transmit checksum generation.
    pub fn set_no_checksum(&self, enabled: bool) {
        self.no_checksum.store(enabled, Ordering::Relaxed);
    }

    /// Whether reads report the original destination address.
    pub fn receive_original_dst(&self) -> bool {
        self.receive_original_dst.load(Ordering::Relaxed)
    }

    /// Enables or disables original-destination reporting.
    pub fn set_receive_original_dst(&self, enabled: bool) {
        self.receive_original_dst.store(enabled, Ordering::Relaxed);
    }

    /// Whether reads report IP packet info.
    pub fn receive_packet_info(&self) -> bool {
        self.receive_packet_info.load(Ordering::Relaxed)
    }

    /// Enables or disables packet-info reporting.
    pub fn set_receive_packet_info(&self, enabled: bool) {
        self.receive_packet_info.store(enabled, Ordering::Relaxed);
    }

    /// Whether reads report the received IPv6 traffic class.
    pub fn receive_tclass(&self) -> bool {
        self.receive_tclass.load(Ordering::Relaxed)
    }

    /// Enables or disables traffic-class reporting.
    pub fn set_receive_tclass(&self, enabled: bool) {
        self.receive_tclass.store(enabled, Ordering::Relaxed);
    }

    /// Whether reads report the received IPv4 type-of-service.
    pub fn receive_tos(&self) -> bool {
        self.receive_tos.load(Ordering::Relaxed)
    }

    /// Enables or disables type-of-service reporting.
    pub fn set_receive_tos(&self, enabled: bool) {
        self.receive_tos.store(enabled, Ordering::Relaxed);
    }

    /// Whether local address reuse is requested.
    pub fn reuse_address(&self) -> bool {
        self.reuse_address.load(Ordering::Relaxed)
    }

    /// Sets address reuse and informs the endpoint, which folds it into
    /// the port flags used by future registrations.
    pub fn set_reuse_address(&self, enabled: bool) {
        self.reuse_address.store(enabled, Ordering::Relaxed);
        self.with_handler(|h| h.on_reuse_address_set(enabled));
    }

    /// Whether load-balanced port sharing is requested.
    pub fn reuse_port(&self) -> bool {
        self.reuse_port.load(Ordering::Relaxed)
    }

    /// Sets port reuse and informs the endpoint.
    pub fn set_reuse_port(&self, enabled: bool) {
        self.reuse_port.store(enabled, Ordering::Relaxed);
        self.with_handler(|h| h.on_reuse_port_set(enabled));
    }

    /// Whether an IPv6 endpoint is restricted to IPv6 peers.
    pub fn v6_only(&self) -> bool {
        self.v6_only.load(Ordering::Relaxed)
    }

    /// Restricts or widens an IPv6 endpoint's address family.
    pub fn set_v6_only(&self, enabled: bool) {
        self.v6_only.store(enabled, Ordering::Relaxed);
    }
}

/// Which halves of an endpoint have been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownFlags(u8);

impl ShutdownFlags {
    /// Shut down the receive half.
    pub const READ: ShutdownFlags = ShutdownFlags(0b01);
    /// Shut down the send half.
    pub const WRITE: ShutdownFlags = ShutdownFlags(0b10);

    /// No halves shut down.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Whether every flag in `other` is set.
    #[must_use]
    pub fn contains(&self, other: ShutdownFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for ShutdownFlags {
    type Output = ShutdownFlags;

    fn bitor(self, rhs: ShutdownFlags) -> ShutdownFlags {
        ShutdownFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ShutdownFlags {
    fn bitor_assign(&mut self, rhs: ShutdownFlags) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingHandler {
        address_sets: AtomicUsize,
        port_sets: AtomicUsize,
    }

    impl SocketOptionsHandler for CountingHandler {
        fn on_reuse_address_set(&self, _enabled: bool) {
            self.address_sets.fetch_add(1, Ordering::Relaxed);
        }

        fn on_reuse_port_set(&self, _enabled: bool) {
            self.port_sets.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_reuse_setters_invoke_handler() {
        let handler = Arc::new(CountingHandler::default());
        let ops = SocketOptions::new();
        ops.init_handler(Arc::downgrade(&handler) as Weak<dyn SocketOptionsHandler>);

        ops.set_reuse_address(true);
        ops.set_reuse_port(true);
        ops.set_reuse_port(false);

        assert!(ops.reuse_address());
        assert!(!ops.reuse_port());
        assert_eq!(handler.address_sets.load(Ordering::Relaxed), 1);
        assert_eq!(handler.port_sets.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_setters_without_handler_do_not_panic() {
        let ops = SocketOptions::new();
        ops.set_reuse_address(true);
        assert!(ops.reuse_address());
    }

    #[test]
    fn test_shutdown_flags() {
        let mut flags = ShutdownFlags::empty();
        assert!(!flags.contains(ShutdownFlags::READ));
        flags |= ShutdownFlags::READ;
        assert!(flags.contains(ShutdownFlags::READ));
        assert!(!flags.contains(ShutdownFlags::WRITE));
        flags |= ShutdownFlags::WRITE;
        assert!(flags.contains(ShutdownFlags::READ | ShutdownFlags::WRITE));
    }
}
