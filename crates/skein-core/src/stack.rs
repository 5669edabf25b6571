//! Interfaces between transport endpoints and the owning stack.
//!
//! A transport endpoint never routes, emits network headers, or
//! demultiplexes by itself; it consumes the [`Stack`] and [`Route`]
//! interfaces and offers [`TransportEndpoint`] back to the stack for
//! packet delivery. The concrete stack lives outside this crate.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::addr::{Address, NetworkProtocol, NicId};
use crate::buffer::PacketBuffer;
use crate::error::Result;

/// The four-tuple under which the stack demultiplexes incoming datagrams
/// to a transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransportEndpointId {
    /// Local (bound) port.
    pub local_port: u16,
    /// Local (bound) address; empty when bound to the wildcard.
    pub local_address: Address,
    /// Remote port; zero unless connected.
    pub remote_port: u16,
    /// Remote address; empty unless connected.
    pub remote_address: Address,
}

/// Behavioural flags attached to a port reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortFlags {
    /// The most recent binder takes over delivery (address reuse).
    pub most_recent: bool,
    /// Delivery is load-balanced across binders (port reuse).
    pub load_balanced: bool,
}

/// Parameters a route needs to emit the network header in front of a
/// transport packet.
#[derive(Debug, Clone, Copy)]
pub struct NetworkHeaderParams {
    /// Transport protocol number carried in the network header.
    pub protocol: u8,
    /// Hop limit / time-to-live.
    pub ttl: u8,
    /// IPv4 ToS or IPv6 traffic class.
    pub tos: u8,
}

/// Control signals the network layer translates from ICMP-type feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// The remote port is not listening.
    PortUnreachable,
    /// The destination network cannot be reached.
    NetworkUnreachable,
}

/// Bounds the stack imposes on a per-endpoint buffer capacity.
#[derive(Debug, Clone, Copy)]
pub struct BufferSizeLimits {
    /// Smallest accepted capacity.
    pub min: usize,
    /// Capacity given to new endpoints.
    pub default: usize,
    /// Largest accepted capacity.
    pub max: usize,
}

impl BufferSizeLimits {
    /// Clamps a requested capacity into `[min, max]`.
    #[must_use]
    pub fn clamp(&self, requested: usize) -> usize {
        requested.clamp(self.min, self.max)
    }
}

/// Identity of the principal a packet is sent on behalf of.
pub trait PacketOwner: Send + Sync {
    /// Effective user id.
    fn uid(&self) -> u32;
    /// Effective group id.
    fn gid(&self) -> u32;
}

/// Outcome of a link-layer address resolution request.
pub enum Resolution {
    /// The link address is known; the packet can be written now.
    Complete,
    /// Resolution is in flight. The channel is signalled (or closed)
    /// when it settles; the caller retries afterwards.
    Pending(Receiver<()>),
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("Complete"),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// A path to a destination, owned by the network layer.
///
/// Routes are handed out reference-counted; dropping the last `Arc`
/// releases the underlying route resources.
pub trait Route: Send + Sync {
    /// Bytes of headroom the network and link layers need in front of the
    /// transport header.
    fn max_header_length(&self) -> usize;

    /// TTL used when the transport passes "use default".
    fn default_ttl(&self) -> u8;

    /// Whether packets on this route leave as link-level broadcast.
    fn is_outbound_broadcast(&self) -> bool;

    /// Whether the route's next hop needs link-address resolution.
    fn is_resolution_required(&self) -> bool;

    /// Starts or checks link-address resolution.
    ///
    /// # Errors
    ///
    /// Fails when the next hop is known to be unreachable.
    fn resolve(&self) -> Result<Resolution>;

    /// Whether the transport must compute its checksum (false when the
    /// NIC offloads transmit checksums).
    fn requires_tx_transport_checksum(&self) -> bool;

    /// Partial checksum over the network pseudo-header for this route's
    /// source and destination addresses.
    fn pseudo_header_checksum(&self, protocol: u8, length: u16) -> u16;

    /// Emits the packet through the network layer.
    ///
    /// # Errors
    ///
    /// Propagates network-layer failures (unreachable, device gone, …).
    fn write_packet(&self, params: NetworkHeaderParams, pkt: PacketBuffer) -> Result<()>;

    /// Source address selected for this route.
    fn local_address(&self) -> Address;

    /// Destination address of this route.
    fn remote_address(&self) -> Address;

    /// Network protocol the route emits.
    fn net_proto(&self) -> NetworkProtocol;

    /// Interface the route leaves through.
    fn nic(&self) -> NicId;

    /// Stack-wide statistics, for transport-layer counters incremented
    /// at emission time.
    fn stats(&self) -> Arc<StackStats>;
}

/// The stack-side interface a transport endpoint is delivered through.
pub trait TransportEndpoint: Send + Sync {
    /// Delivers a parsed datagram addressed to this endpoint.
    fn handle_packet(&self, id: TransportEndpointId, pkt: PacketBuffer);

    /// Delivers a control signal (e.g. translated ICMP) for this endpoint.
    fn handle_control_packet(
        &self,
        id: TransportEndpointId,
        signal: ControlSignal,
        pkt: PacketBuffer,
    );
}

/// Operations a transport endpoint consumes from the owning stack.
pub trait Stack: Send + Sync {
    /// Finds a route from `local` (possibly empty) to `remote` through
    /// `nic` (possibly zero) under `proto`.
    ///
    /// # Errors
    ///
    /// Fails with *no-route* / *network-unreachable* style errors.
    fn find_route(
        &self,
        nic: NicId,
        local: Address,
        remote: Address,
        proto: NetworkProtocol,
        multicast_loop: bool,
    ) -> Result<Arc<dyn Route>>;

    /// Whether `nic` names an enabled interface.
    fn check_nic(&self, nic: NicId) -> bool;

    /// Whether `nic` names an existing interface.
    fn has_nic(&self, nic: NicId) -> bool;

    /// Returns the interface `addr` is assigned to (restricted to `nic`
    /// when non-zero), or zero if it is not a local address.
    fn check_local_address(&self, nic: NicId, proto: NetworkProtocol, addr: Address) -> NicId;

    /// Whether `addr` is the broadcast address of a subnet on `nic`.
    fn is_subnet_broadcast(&self, nic: NicId, proto: NetworkProtocol, addr: Address) -> bool;

    /// Reserves a local port (stack-chosen when `port` is zero) for the
    /// given protocols; returns the reserved port.
    ///
    /// # Errors
    ///
    /// Fails with *port-in-use* when the reservation conflicts.
    fn reserve_port(
        &self,
        protos: &[NetworkProtocol],
        addr: Address,
        port: u16,
        flags: PortFlags,
        bind_to_device: NicId,
    ) -> Result<u16>;

    /// Returns a reservation made by [`Stack::reserve_port`].
    fn release_port(
        &self,
        protos: &[NetworkProtocol],
        addr: Address,
        port: u16,
        flags: PortFlags,
        bind_to_device: NicId,
    );

    /// Registers `endpoint` for delivery under `id`.
    ///
    /// # Errors
    ///
    /// Fails with *port-in-use* when the identifier is taken.
    fn register_transport_endpoint(
        &self,
        nic: NicId,
        protos: &[NetworkProtocol],
        id: TransportEndpointId,
        endpoint: Arc<dyn TransportEndpoint>,
        flags: PortFlags,
        bind_to_device: NicId,
    ) -> Result<()>;

    /// Removes a registration created by
    /// [`Stack::register_transport_endpoint`].
    fn unregister_transport_endpoint(
        &self,
        nic: NicId,
        protos: &[NetworkProtocol],
        id: TransportEndpointId,
        endpoint: &Arc<dyn TransportEndpoint>,
        flags: PortFlags,
        bind_to_device: NicId,
    );

    /// Joins a multicast group on behalf of the caller.
    ///
    /// # Errors
    ///
    /// Propagates network-layer failures.
    fn join_group(&self, proto: NetworkProtocol, nic: NicId, addr: Address) -> Result<()>;

    /// Leaves a multicast group joined via [`Stack::join_group`].
    ///
    /// # Errors
    ///
    /// Propagates network-layer failures.
    fn leave_group(&self, proto: NetworkProtocol, nic: NicId, addr: Address) -> Result<()>;

    /// Monotonic stack clock, in nanoseconds.
    fn now_nanos(&self) -> i64;

    /// Bounds for per-endpoint receive buffer capacities.
    fn receive_buffer_limits(&self) -> BufferSizeLimits;

    /// Bounds for per-endpoint send buffer capacities.
    fn send_buffer_limits(&self) -> BufferSizeLimits;

    /// Stack-wide statistics.
    fn stats(&self) -> Arc<StackStats>;

    /// A fresh identifier for a newly created endpoint.
    fn next_unique_id(&self) -> u64;
}

/// A monotonically increasing statistics counter.
#[derive(Debug, Default)]
pub struct StatCounter(AtomicU64);

impl StatCounter {
    /// Adds one to the counter.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Stack-wide UDP counters.
#[derive(Debug, Default)]
pub struct UdpStats {
    /// Valid datagrams delivered to an endpoint.
    pub packets_received: StatCounter,
    /// Datagrams handed to the network layer.
    pub packets_sent: StatCounter,
    /// Datagrams the network layer refused to send.
    pub packet_send_errors: StatCounter,
    /// Datagrams dropped for a malformed header or length.
    pub malformed_packets_received: StatCounter,
    /// Datagrams dropped for a failed checksum.
    pub checksum_errors: StatCounter,
    /// Datagrams dropped because the receiver was full or closed.
    pub receive_buffer_errors: StatCounter,
}

/// Stack-wide statistics, grouped by protocol.
#[derive(Debug, Default)]
pub struct StackStats {
    /// UDP counters.
    pub udp: UdpStats,
}

/// Write-side error counters of one endpoint.
#[derive(Debug, Default)]
pub struct WriteErrors {
    /// Invalid arguments (oversized payload, bad option value).
    pub invalid_args: StatCounter,
    /// Writes after shutdown of the send half.
    pub write_closed: StatCounter,
    /// Writes in a state that does not permit sending.
    pub invalid_endpoint_state: StatCounter,
}

/// Network-facing send error counters of one endpoint.
#[derive(Debug, Default)]
pub struct SendErrors {
    /// Routing failures (no route, broadcast disabled, unreachable).
    pub no_route: StatCounter,
    /// Sends parked on link-address resolution.
    pub no_link_addr: StatCounter,
    /// Failures inside the network layer's transmit path.
    pub send_to_network_failed: StatCounter,
}

/// Receive-side error counters of one endpoint.
#[derive(Debug, Default)]
pub struct ReceiveErrors {
    /// Datagrams dropped for a malformed header or length.
    pub malformed_packets_received: StatCounter,
    /// Datagrams dropped for a failed checksum.
    pub checksum_errors: StatCounter,
    /// Datagrams dropped because the receive queue was not accepting.
    pub closed_receiver: StatCounter,
    /// Datagrams dropped because the receive buffer was full.
    pub receive_buffer_overflow: StatCounter,
    /// Reads attempted after shutdown of the receive half.
    pub read_closed: StatCounter,
}

/// Per-endpoint statistics.
#[derive(Debug, Default)]
pub struct EndpointStats {
    /// Datagrams accepted from the network.
    pub packets_received: StatCounter,
    /// Datagrams handed to a route for transmission.
    pub packets_sent: StatCounter,
    /// Write-side errors by category.
    pub write_errors: WriteErrors,
    /// Send-side errors by category.
    pub send_errors: SendErrors,
    /// Receive-side errors by category.
    pub receive_errors: ReceiveErrors,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_counter() {
        let counter = StatCounter::default();
        assert_eq!(counter.get(), 0);
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_buffer_limits_clamp() {
        let limits = BufferSizeLimits { min: 16, default: 64, max: 256 };
        assert_eq!(limits.clamp(8), 16);
        assert_eq!(limits.clamp(64), 64);
        assert_eq!(limits.clamp(1 << 20), 256);
    }
}
