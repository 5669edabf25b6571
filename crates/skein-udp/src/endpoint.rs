//! The UDP endpoint: lifecycle, identity, and the send/receive paths.
//!
//! An endpoint is safe to drive from concurrent threads. Three locks
//! partition its state:
//!
//! - the **endpoint lock** (reader/writer) over identity, options, route,
//!   and registration state;
//! - the **receive lock**, owned by [`RecvQueue`], over the datagram
//!   backlog and its accounting;
//! - the **last-error lock** over the single-slot asynchronous error
//!   mailbox.
//!
//! Lock order is endpoint → receive → last-error. The lifecycle state is
//! an atomic word: writes happen only under the exclusive endpoint lock,
//! reads take no lock at all.
//!
//! The send path releases the endpoint lock before handing the packet to
//! the route. Loopback delivery is synchronous, so transmitting under the
//! lock could re-enter this endpoint (for example through a
//! port-unreachable control signal) and deadlock against a pending
//! exclusive acquisition.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use thiserror::Error as ThisError;
use tracing::{debug, trace};

use skein_core::addr::canonicalize;
use skein_core::wire::{self, UdpHeader, MAX_PAYLOAD_SIZE, UDP_HEADER_LEN, UDP_PROTOCOL_NUMBER};
use skein_core::{
    Address, ByteChunks, ControlSignal, EndpointStats, Error, EventMask, FullAddress,
    NetworkHeaderParams, NetworkProtocol, NicId, PacketBuffer, PacketOwner, PortFlags, Resolution,
    Result, Route, ShutdownFlags, SocketOptions, SocketOptionsHandler, Stack, TransportEndpoint,
    TransportEndpointId, WaitQueue,
};

use crate::queue::{DatagramRecord, EnqueueOutcome, IpPacketInfo, RecvQueue};

/// The only path-MTU discovery setting a datagram endpoint accepts.
pub const MTU_DISCOVERY_DISABLED: usize = 0;

/// Lifecycle state of a UDP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EndpointState {
    /// Freshly created; no local identity.
    Initial = 0,
    /// Bound to a local address and port.
    Bound = 1,
    /// Bound and associated with a remote peer.
    Connected = 2,
    /// Closed; terminal.
    Closed = 3,
}

impl EndpointState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Initial,
            1 => Self::Bound,
            2 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => f.write_str("INITIAL"),
            Self::Bound => f.write_str("BOUND"),
            Self::Connected => f.write_str("CONNECTED"),
            Self::Closed => f.write_str("CLOSED"),
        }
    }
}

/// Per-write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Destination; required unless the endpoint is connected.
    pub to: Option<FullAddress>,
    /// Coalescing with later writes. Unsupported; must be `false`.
    pub more: bool,
}

/// Errors surfaced by [`Endpoint::write`].
#[derive(Debug, ThisError)]
pub enum WriteError {
    /// A synchronous endpoint or network error.
    #[error(transparent)]
    Endpoint(#[from] Error),

    /// The route's link address is still resolving. The channel fires
    /// when resolution settles; retry the write afterwards.
    #[error("no remote link address; retry after the resolution channel fires")]
    ResolutionPending(Receiver<()>),
}

/// Ancillary data accompanying a received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessages {
    /// Stack clock at enqueue time, in nanoseconds.
    pub timestamp_ns: i64,
    /// IPv4 type-of-service, when receive-TOS is enabled.
    pub tos: Option<u8>,
    /// IPv6 traffic class (widened to 32 bits, as presented to cmsg
    /// consumers), when receive-TClass is enabled.
    pub tclass: Option<u32>,
    /// Network-layer packet info, when receive-packet-info is enabled.
    pub packet_info: Option<IpPacketInfo>,
    /// Original destination, when receive-original-destination is enabled.
    pub original_destination: Option<FullAddress>,
}

/// A datagram handed to the reader.
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    /// The payload.
    pub payload: Vec<u8>,
    /// Sender address.
    pub sender: FullAddress,
    /// Ancillary data selected by the receive-* options.
    pub control: ControlMessages,
}

/// Integer-valued socket options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOptInt {
    /// Path-MTU discovery mode.
    MtuDiscover,
    /// Hop limit for multicast sends.
    MulticastTtl,
    /// Hop limit for unicast sends; zero means "use the route default".
    Ttl,
    /// IPv4 type-of-service applied to sends.
    Ipv4Tos,
    /// IPv6 traffic class applied to sends.
    Ipv6TrafficClass,
    /// Receive buffer capacity in bytes.
    ReceiveBufferSize,
    /// Send buffer capacity in bytes.
    SendBufferSize,
    /// Size of the datagram at the head of the receive queue.
    ReceiveQueueSize,
    /// Bytes pending in the send queue. Datagram sends are immediate, so
    /// UDP endpoints do not implement this option.
    SendQueueSize,
}

/// Structured socket options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    /// Selects the default interface for multicast sends.
    MulticastInterface {
        /// Interface id; zero to select by address.
        nic: NicId,
        /// Interface address; empty to select by id.
        interface_addr: Address,
    },
    /// Joins a multicast group.
    AddMembership {
        /// Interface id; zero to derive from the interface address or a
        /// route to the group.
        nic: NicId,
        /// Interface address; empty or all-zeros when unset.
        interface_addr: Address,
        /// Group to join.
        multicast_addr: Address,
    },
    /// Leaves a previously joined multicast group.
    RemoveMembership {
        /// Interface id; zero to derive from the interface address or a
        /// route to the group.
        nic: NicId,
        /// Interface address; empty or all-zeros when unset.
        interface_addr: Address,
        /// Group to leave.
        multicast_addr: Address,
    },
    /// Restricts the endpoint to one device; zero clears it.
    BindToDevice(NicId),
    /// Detaches a socket filter. Accepted as a no-op.
    DetachFilter,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct MulticastMembership {
    nic: NicId,
    addr: Address,
}

/// Fields guarded by the endpoint lock.
struct Core {
    id: TransportEndpointId,
    /// NIC the current registration was made through.
    register_nic: NicId,
    /// NIC fixed by an explicit bind; zero otherwise.
    bind_nic: NicId,
    bind_to_device: NicId,
    bound_bind_to_device: NicId,
    port_flags: PortFlags,
    /// Flags the current reservation/registration was made with.
    bound_port_flags: PortFlags,
    effective_net_protos: Vec<NetworkProtocol>,
    route: Option<Arc<dyn Route>>,
    dst_port: u16,
    ttl: u8,
    multicast_ttl: u8,
    multicast_addr: Address,
    multicast_nic: NicId,
    send_tos: u8,
    shutdown_flags: ShutdownFlags,
    multicast_memberships: HashSet<MulticastMembership>,
    snd_buf_size_max: usize,
    owner: Option<Arc<dyn PacketOwner>>,
}

/// A UDP endpoint.
///
/// Mediates between a socket-level consumer and the network layer of the
/// owning stack. All operations are non-blocking; readiness is reported
/// through the endpoint's wait queue.
pub struct Endpoint {
    stack: Arc<dyn Stack>,
    net_proto: NetworkProtocol,
    waiters: Arc<WaitQueue>,
    unique_id: u64,
    ops: SocketOptions,

    /// Lifecycle state. Written only under the exclusive endpoint lock,
    /// read without any lock.
    state: AtomicU32,
    core: RwLock<Core>,
    rcv: RecvQueue,
    last_error: Mutex<Option<Error>>,
    stats: EndpointStats,
    self_ref: Weak<Endpoint>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("unique_id", &self.unique_id)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Creates an endpoint on `stack` for `net_proto`, reporting
    /// readiness through `waiters`.
    pub fn new(
        stack: Arc<dyn Stack>,
        net_proto: NetworkProtocol,
        waiters: Arc<WaitQueue>,
    ) -> Arc<Self> {
        let rcv_limits = stack.receive_buffer_limits();
        let snd_limits = stack.send_buffer_limits();
        let unique_id = stack.next_unique_id();
        Arc::new_cyclic(|weak: &Weak<Endpoint>| {
            let ops = SocketOptions::new();
            ops.init_handler(weak.clone() as Weak<dyn SocketOptionsHandler>);
            // Multicast loopback is on by default, as on Linux.
            ops.set_multicast_loop(true);
            Endpoint {
                stack,
                net_proto,
                waiters,
                unique_id,
                ops,
                state: AtomicU32::new(EndpointState::Initial as u32),
                core: RwLock::new(Core {
                    id: TransportEndpointId::default(),
                    register_nic: 0,
                    bind_nic: 0,
                    bind_to_device: 0,
                    bound_bind_to_device: 0,
                    port_flags: PortFlags::default(),
                    bound_port_flags: PortFlags::default(),
                    effective_net_protos: Vec::new(),
                    route: None,
                    dst_port: 0,
                    ttl: 0,
                    // RFC 1075 recommends a TTL of 1 for membership-style
                    // traffic; Linux defaults multicast sends to 1.
                    multicast_ttl: 1,
                    multicast_addr: Address::Empty,
                    multicast_nic: 0,
                    send_tos: 0,
                    shutdown_flags: ShutdownFlags::empty(),
                    multicast_memberships: HashSet::new(),
                    snd_buf_size_max: snd_limits.default,
                    owner: None,
                }),
                rcv: RecvQueue::new(rcv_limits.default),
                last_error: Mutex::new(None),
                stats: EndpointStats::default(),
                self_ref: weak.clone(),
            }
        })
    }

    /// Current lifecycle state, read without taking the endpoint lock.
    pub fn state(&self) -> EndpointState {
        EndpointState::from_u32(self.state.load(Ordering::Relaxed))
    }

    /// The network protocol the endpoint was created for.
    pub fn network_protocol(&self) -> NetworkProtocol {
        self.net_proto
    }

    /// Identifier unique among this stack's endpoints.
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    /// Per-endpoint statistics.
    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// The cross-cutting socket options holder.
    pub fn socket_options(&self) -> &SocketOptions {
        &self.ops
    }

    /// Records the principal outgoing packets are attributed to.
    pub fn set_owner(&self, owner: Arc<dyn PacketOwner>) {
        self.core.write().owner = Some(owner);
    }

    /// Takes and clears the pending asynchronous error, if any.
    pub fn take_last_error(&self) -> Option<Error> {
        self.last_error.lock().take()
    }

    fn set_state(&self, _core: &mut Core, state: EndpointState) {
        self.state.store(state as u32, Ordering::Relaxed);
    }

    fn as_transport_endpoint(&self) -> Result<Arc<dyn TransportEndpoint>> {
        // Upgrading cannot fail while a caller holds the endpoint.
        self.self_ref
            .upgrade()
            .map(|ep| ep as Arc<dyn TransportEndpoint>)
            .ok_or(Error::InvalidEndpointState)
    }

    fn canonicalize(&self, core: &Core, addr: FullAddress) -> Result<(FullAddress, NetworkProtocol)> {
        canonicalize(addr, self.net_proto, &core.id.local_address, self.ops.v6_only())
    }

    fn is_broadcast_or_multicast(&self, nic: NicId, proto: NetworkProtocol, addr: &Address) -> bool {
        addr.is_limited_broadcast()
            || addr.is_multicast()
            || self.stack.is_subnet_broadcast(nic, proto, *addr)
    }

    // ====================================================================
    // Lifecycle
    // ====================================================================

    /// Binds the endpoint to a local address and port. Specifying a NIC
    /// is optional; port zero requests a stack-chosen ephemeral port.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidEndpointState`] outside the initial
    /// state, [`Error::BadLocalAddress`] for an address not assigned to
    /// any interface, and with reservation/registration errors.
    pub fn bind(&self, addr: FullAddress) -> Result<()> {
        let mut core = self.core.write();
        self.bind_locked(&mut core, addr)?;
        // Only an explicit bind pins the NIC for later routing decisions.
        core.bind_nic = core.register_nic;
        Ok(())
    }

    fn bind_locked(&self, core: &mut Core, addr: FullAddress) -> Result<()> {
        if self.state() != EndpointState::Initial {
            return Err(Error::InvalidEndpointState);
        }

        let (addr, net_proto) = self.canonicalize(core, addr)?;

        // A dual-mode IPv6 endpoint binding to the wildcard accepts IPv4
        // datagrams too, so it registers under both protocols.
        let mut net_protos = vec![net_proto];
        if net_proto == NetworkProtocol::Ipv6 && !self.ops.v6_only() && addr.addr.is_empty() {
            net_protos = vec![NetworkProtocol::Ipv6, NetworkProtocol::Ipv4];
        }

        let mut nic = addr.nic;
        if !addr.addr.is_empty() && !self.is_broadcast_or_multicast(addr.nic, net_proto, &addr.addr)
        {
            // A unicast local address must actually be assigned somewhere.
            nic = self.stack.check_local_address(addr.nic, net_proto, addr.addr);
            if nic == 0 {
                return Err(Error::BadLocalAddress);
            }
        }

        let id = TransportEndpointId {
            local_port: addr.port,
            local_address: addr.addr,
            ..TransportEndpointId::default()
        };
        let (id, bound_device) = self.register_with_stack(core, nic, &net_protos, id)?;

        core.id = id;
        core.bound_bind_to_device = bound_device;
        core.register_nic = nic;
        core.effective_net_protos = net_protos;

        self.set_state(core, EndpointState::Bound);
        self.rcv.mark_ready();

        debug!(id = self.unique_id, port = id.local_port, addr = %id.local_address, "bound endpoint");
        Ok(())
    }

    /// Reserves a port if the identifier has none yet and registers the
    /// endpoint under `id`. On registration failure a port reserved here
    /// is released again.
    fn register_with_stack(
        &self,
        core: &mut Core,
        nic: NicId,
        net_protos: &[NetworkProtocol],
        mut id: TransportEndpointId,
    ) -> Result<(TransportEndpointId, NicId)> {
        let endpoint = self.as_transport_endpoint()?;

        let mut reserved_here = false;
        if core.id.local_port == 0 {
            let port = self.stack.reserve_port(
                net_protos,
                id.local_address,
                id.local_port,
                core.port_flags,
                core.bind_to_device,
            )?;
            id.local_port = port;
            reserved_here = true;
        }
        core.bound_port_flags = core.port_flags;

        match self.stack.register_transport_endpoint(
            nic,
            net_protos,
            id,
            endpoint,
            core.bound_port_flags,
            core.bind_to_device,
        ) {
            Ok(()) => Ok((id, core.bind_to_device)),
            Err(err) => {
                if reserved_here {
                    self.stack.release_port(
                        net_protos,
                        id.local_address,
                        id.local_port,
                        core.bound_port_flags,
                        core.bind_to_device,
                    );
                }
                core.bound_port_flags = PortFlags::default();
                Err(err)
            }
        }
    }

    /// Connects the endpoint to `addr`. Specifying a NIC is optional.
    ///
    /// Connecting while already connected re-registers under the new
    /// identifier; the new registration is created before the old one is
    /// torn down.
    ///
    /// # Errors
    ///
    /// Port zero destinations and conflicting NICs fail with
    /// [`Error::InvalidEndpointState`]; routing and registration errors
    /// propagate.
    pub fn connect(&self, addr: FullAddress) -> Result<()> {
        if addr.port == 0 {
            return Err(Error::InvalidEndpointState);
        }

        let mut core = self.core.write();

        let mut nic = addr.nic;
        let mut local_port = 0;
        match self.state() {
            EndpointState::Initial => {}
            EndpointState::Bound | EndpointState::Connected => {
                local_port = core.id.local_port;
                if core.bind_nic != 0 {
                    if nic != 0 && nic != core.bind_nic {
                        return Err(Error::InvalidEndpointState);
                    }
                    nic = core.bind_nic;
                }
            }
            EndpointState::Closed => return Err(Error::InvalidEndpointState),
        }

        let (addr, net_proto) = self.canonicalize(&core, addr)?;
        let (route, nic) = self.connect_route(&core, nic, addr, net_proto)?;

        let mut id = TransportEndpointId {
            local_address: core.id.local_address,
            local_port,
            remote_port: addr.port,
            remote_address: route.remote_address(),
        };
        if self.state() == EndpointState::Initial {
            id.local_address = route.local_address();
        }

        // Even when the target is IPv4, a dual-mode endpoint stays
        // reachable over both protocols.
        let mut net_protos = vec![net_proto];
        if self.net_proto == NetworkProtocol::Ipv6 && !self.ops.v6_only() {
            net_protos = vec![NetworkProtocol::Ipv4, NetworkProtocol::Ipv6];
        }

        let old_port_flags = core.bound_port_flags;
        let (id, bound_device) = self.register_with_stack(&mut core, nic, &net_protos, id)?;

        // Tear the previous registration down only after the replacement
        // exists.
        if core.id.local_port != 0 {
            let endpoint = self.as_transport_endpoint()?;
            let old_protos = core.effective_net_protos.clone();
            self.stack.unregister_transport_endpoint(
                core.register_nic,
                &old_protos,
                core.id,
                &endpoint,
                old_port_flags,
                core.bound_bind_to_device,
            );
        }

        core.id = id;
        core.bound_bind_to_device = bound_device;
        core.route = Some(route);
        core.dst_port = addr.port;
        core.register_nic = nic;
        core.effective_net_protos = net_protos;

        self.set_state(&mut core, EndpointState::Connected);
        self.rcv.mark_ready();

        debug!(id = self.unique_id, peer = %addr, "connected endpoint");
        Ok(())
    }

    /// Establishes a route to the destination, falling back to the
    /// configured multicast interface for multicast targets with no
    /// explicit interface.
    fn connect_route(
        &self,
        core: &Core,
        nic: NicId,
        addr: FullAddress,
        net_proto: NetworkProtocol,
    ) -> Result<(Arc<dyn Route>, NicId)> {
        let mut local_addr = core.id.local_address;
        if self.is_broadcast_or_multicast(nic, net_proto, &local_addr) {
            // A packet can only originate from a unicast address.
            local_addr = Address::Empty;
        }

        let mut nic = nic;
        if addr.addr.is_multicast() {
            if nic == 0 {
                nic = core.multicast_nic;
            }
            if local_addr.is_empty() && nic == 0 {
                local_addr = core.multicast_addr;
            }
        }

        let route = self.stack.find_route(
            nic,
            local_addr,
            addr.addr,
            net_proto,
            self.ops.multicast_loop(),
        )?;
        Ok((route, nic))
    }

    /// Dissolves the association with the peer.
    ///
    /// A no-op unless connected. An explicitly bound endpoint returns to
    /// the bound state under its original local identity; an ephemeral
    /// bind is released entirely and the endpoint returns to the initial
    /// state.
    ///
    /// # Errors
    ///
    /// Fails only if re-registering the original identity fails.
    pub fn disconnect(&self) -> Result<()> {
        let mut core = self.core.write();
        if self.state() != EndpointState::Connected {
            return Ok(());
        }

        let endpoint = self.as_transport_endpoint()?;
        let old_port_flags = core.bound_port_flags;
        let protos = core.effective_net_protos.clone();

        let mut id = TransportEndpointId::default();
        let mut bound_device = 0;
        let mut unregister_flags = old_port_flags;

        // An explicit bind (a pinned NIC, or a wildcard local address) is
        // kept; only a connect-time ephemeral bind is released.
        if core.bind_nic != 0 || core.id.local_address.is_empty() {
            id = TransportEndpointId {
                local_port: core.id.local_port,
                local_address: core.id.local_address,
                ..TransportEndpointId::default()
            };
            let register_nic = core.register_nic;
            let (new_id, new_device) =
                self.register_with_stack(&mut core, register_nic, &protos, id)?;
            id = new_id;
            bound_device = new_device;
            unregister_flags = core.bound_port_flags;
            self.set_state(&mut core, EndpointState::Bound);
        } else {
            if core.id.local_port != 0 {
                self.stack.release_port(
                    &protos,
                    core.id.local_address,
                    core.id.local_port,
                    old_port_flags,
                    core.bound_bind_to_device,
                );
                core.bound_port_flags = PortFlags::default();
            }
            self.set_state(&mut core, EndpointState::Initial);
        }

        self.stack.unregister_transport_endpoint(
            core.register_nic,
            &protos,
            core.id,
            &endpoint,
            unregister_flags,
            core.bound_bind_to_device,
        );

        core.id = id;
        core.bound_bind_to_device = bound_device;
        core.route = None;
        core.dst_port = 0;

        debug!(id = self.unique_id, state = %self.state(), "disconnected endpoint");
        Ok(())
    }

    /// Shuts down the read and/or write half.
    ///
    /// Shutting down the read half wakes blocked readers so they observe
    /// the closure; a bound (not connected) endpoint can be shut down
    /// because it may still be receiving multicast datagrams.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotConnected`] unless bound or connected.
    pub fn shutdown(&self, flags: ShutdownFlags) -> Result<()> {
        let mut core = self.core.write();
        match self.state() {
            EndpointState::Bound | EndpointState::Connected => {}
            _ => return Err(Error::NotConnected),
        }

        core.shutdown_flags |= flags;

        if flags.contains(ShutdownFlags::READ) {
            let was_closed = self.rcv.close_read();
            if !was_closed {
                self.waiters.notify(EventMask::READABLE);
            }
        }
        Ok(())
    }

    /// Closes the endpoint and releases everything it holds: the
    /// registration and port, every multicast membership, the queued
    /// datagrams, and the route. Terminal and idempotent.
    pub fn close(&self) {
        {
            let mut core = self.core.write();
            core.shutdown_flags = ShutdownFlags::READ | ShutdownFlags::WRITE;

            match self.state() {
                EndpointState::Bound | EndpointState::Connected => {
                    if let Ok(endpoint) = self.as_transport_endpoint() {
                        let protos = core.effective_net_protos.clone();
                        self.stack.unregister_transport_endpoint(
                            core.register_nic,
                            &protos,
                            core.id,
                            &endpoint,
                            core.bound_port_flags,
                            core.bound_bind_to_device,
                        );
                        self.stack.release_port(
                            &protos,
                            core.id.local_address,
                            core.id.local_port,
                            core.bound_port_flags,
                            core.bound_bind_to_device,
                        );
                    }
                    core.bound_bind_to_device = 0;
                    core.bound_port_flags = PortFlags::default();
                }
                _ => {}
            }

            for membership in core.multicast_memberships.drain() {
                let _ = self
                    .stack
                    .leave_group(self.net_proto, membership.nic, membership.addr);
            }

            self.rcv.close();
            core.route = None;
            self.set_state(&mut core, EndpointState::Closed);
            debug!(id = self.unique_id, "closed endpoint");
        }

        self.waiters.notify(
            EventMask::HANGUP | EventMask::ERROR | EventMask::READABLE | EventMask::WRITABLE,
        );
    }

    /// Forcibly terminates the endpoint. Datagram endpoints have nothing
    /// in flight to abort, so this is [`Endpoint::close`].
    pub fn abort(&self) {
        self.close();
    }

    // ====================================================================
    // Datapath
    // ====================================================================

    /// Sends `payload`, optionally to `opts.to`, without blocking.
    ///
    /// Returns the number of bytes accepted. An endpoint in the initial
    /// state is implicitly bound to the wildcard address first.
    ///
    /// # Errors
    ///
    /// A pending asynchronous error is returned (and cleared) first.
    /// Otherwise fails per the state/destination guards, routing, or the
    /// network layer; [`WriteError::ResolutionPending`] reports a send
    /// parked on link-address resolution.
    pub fn write(&self, payload: &[u8], opts: WriteOptions) -> core::result::Result<usize, WriteError> {
        let result = self.write_inner(payload, opts);
        match &result {
            Ok(_) => self.stats.packets_sent.increment(),
            Err(WriteError::ResolutionPending(_)) => {
                self.stats.send_errors.no_link_addr.increment();
            }
            Err(WriteError::Endpoint(err)) => match err {
                Error::MessageTooLong | Error::InvalidOptionValue => {
                    self.stats.write_errors.invalid_args.increment();
                }
                Error::ClosedForSend => self.stats.write_errors.write_closed.increment(),
                Error::InvalidEndpointState => {
                    self.stats.write_errors.invalid_endpoint_state.increment();
                }
                Error::NoRoute | Error::BroadcastDisabled | Error::NetworkUnreachable => {
                    self.stats.send_errors.no_route.increment();
                }
                _ => self.stats.send_errors.send_to_network_failed.increment(),
            },
        }
        result
    }

    fn write_inner(
        &self,
        payload: &[u8],
        opts: WriteOptions,
    ) -> core::result::Result<usize, WriteError> {
        if let Some(err) = self.take_last_error() {
            return Err(err.into());
        }
        // Datagram coalescing is unimplemented.
        if opts.more {
            return Err(Error::InvalidOptionValue.into());
        }
        let to = opts.to;

        let mut core = self.core.read();

        if core.shutdown_flags.contains(ShutdownFlags::WRITE) {
            return Err(Error::ClosedForSend.into());
        }

        // Resolve the endpoint to a sendable state, binding implicitly
        // from INITIAL. The upgrade to the exclusive lock opens a window
        // in which the state may change, hence the loop.
        loop {
            match self.state() {
                EndpointState::Connected => break,
                EndpointState::Bound => {
                    if to.is_none() {
                        return Err(Error::DestinationRequired.into());
                    }
                    break;
                }
                EndpointState::Initial => {
                    drop(core);
                    {
                        let mut exclusive = self.core.write();
                        if self.state() == EndpointState::Initial {
                            self.bind_locked(&mut exclusive, FullAddress::default())?;
                        }
                    }
                    core = self.core.read();
                }
                EndpointState::Closed => return Err(Error::InvalidEndpointState.into()),
            }
        }

        let mut dst_port = core.dst_port;
        let route: Arc<dyn Route> = if let Some(to) = to {
            // A destination through a different NIC than the bound one is
            // unreachable from this endpoint.
            let mut nic = to.nic;
            if core.bind_nic != 0 {
                if nic != 0 && nic != core.bind_nic {
                    return Err(Error::NoRoute.into());
                }
                nic = core.bind_nic;
            }

            if to.port == 0 {
                return Err(Error::InvalidEndpointState.into());
            }

            let (dst, net_proto) = self.canonicalize(&core, to)?;
            let (route, _) = self.connect_route(&core, nic, dst, net_proto)?;
            dst_port = dst.port;
            route
        } else {
            core.route.clone().ok_or(Error::InvalidEndpointState)?
        };

        if !self.ops.broadcast() && route.is_outbound_broadcast() {
            return Err(Error::BroadcastDisabled.into());
        }

        if route.is_resolution_required() {
            match route.resolve() {
                Ok(Resolution::Complete) => {}
                Ok(Resolution::Pending(channel)) => {
                    return Err(WriteError::ResolutionPending(channel));
                }
                Err(err) => return Err(err.into()),
            }
        }

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::MessageTooLong.into());
        }

        let mut ttl = core.ttl;
        let mut use_default_ttl = ttl == 0;
        if route.remote_address().is_multicast() {
            // Multicast has its own hop limit, and zero is meaningful.
            ttl = core.multicast_ttl;
            use_default_ttl = false;
        }

        let local_port = core.id.local_port;
        let send_tos = core.send_tos;
        let owner = core.owner.clone();
        let no_checksum = self.ops.no_checksum();

        // Transmission may loop straight back into this endpoint; the
        // endpoint lock must not be held across it.
        drop(core);

        send_udp(
            route.as_ref(),
            ByteChunks::from(payload),
            local_port,
            dst_port,
            ttl,
            use_default_ttl,
            send_tos,
            owner,
            no_checksum,
        )?;
        Ok(payload.len())
    }

    /// Removes and returns the datagram at the head of the receive queue
    /// along with its ancillary data, without blocking.
    ///
    /// # Errors
    ///
    /// A pending asynchronous error is returned (and cleared) first.
    /// An empty queue yields [`Error::WouldBlock`], or
    /// [`Error::ClosedForReceive`] once the read half is shut down.
    pub fn read(&self) -> Result<ReceivedDatagram> {
        if let Some(err) = self.take_last_error() {
            return Err(err);
        }

        let record = self.rcv.dequeue().inspect_err(|err| {
            if *err == Error::ClosedForReceive {
                self.stats.receive_errors.read_closed.increment();
            }
        })?;

        let mut control = ControlMessages {
            timestamp_ns: record.timestamp_ns,
            tos: None,
            tclass: None,
            packet_info: None,
            original_destination: None,
        };
        if self.ops.receive_tos() {
            control.tos = Some(record.tos);
        }
        if self.ops.receive_tclass() {
            // The traffic class is 8 bits on the wire but presented as a
            // 32-bit value.
            control.tclass = Some(u32::from(record.tos));
        }
        if self.ops.receive_packet_info() {
            control.packet_info = Some(record.packet_info);
        }
        if self.ops.receive_original_dst() {
            control.original_destination = Some(record.destination);
        }

        Ok(ReceivedDatagram {
            payload: record.payload.to_vec(),
            sender: record.sender,
            control,
        })
    }

    /// Reads without consuming. Single-datagram sockets have nothing
    /// useful to peek, so this returns no data.
    ///
    /// # Errors
    ///
    /// None; the result is always empty.
    pub fn peek(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Current readiness, masked by the caller's interest set. The
    /// endpoint is always writable; it is readable when a datagram is
    /// queued or the queue is closed; an undelivered asynchronous error
    /// reports as [`EventMask::ERROR`].
    pub fn readiness(&self, mask: EventMask) -> EventMask {
        let mut result = EventMask::WRITABLE & mask;

        if mask.contains(EventMask::READABLE) && self.rcv.is_readable() {
            result |= EventMask::READABLE;
        }
        if mask.contains(EventMask::ERROR) && self.last_error.lock().is_some() {
            result |= EventMask::ERROR;
        }
        result
    }

    // ====================================================================
    // Addresses
    // ====================================================================

    /// The local address the endpoint is bound to.
    ///
    /// # Errors
    ///
    /// None; unbound endpoints report the empty identity.
    pub fn local_addr(&self) -> Result<FullAddress> {
        let core = self.core.read();
        let mut addr = core.id.local_address;
        if self.state() == EndpointState::Connected {
            if let Some(route) = &core.route {
                addr = route.local_address();
            }
        }
        Ok(FullAddress {
            nic: core.register_nic,
            addr,
            port: core.id.local_port,
        })
    }

    /// The peer the endpoint is connected to.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotConnected`] unless connected.
    pub fn remote_addr(&self) -> Result<FullAddress> {
        let core = self.core.read();
        if self.state() != EndpointState::Connected {
            return Err(Error::NotConnected);
        }
        Ok(FullAddress {
            nic: core.register_nic,
            addr: core.id.remote_address,
            port: core.id.remote_port,
        })
    }

    // ====================================================================
    // Unsupported stream-style operations
    // ====================================================================

    /// Datagram endpoints cannot listen.
    ///
    /// # Errors
    ///
    /// Always [`Error::NotSupported`].
    pub fn listen(&self, _backlog: usize) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Datagram endpoints cannot accept.
    ///
    /// # Errors
    ///
    /// Always [`Error::NotSupported`].
    pub fn accept(&self) -> Result<(Arc<Endpoint>, Arc<WaitQueue>)> {
        Err(Error::NotSupported)
    }

    /// Endpoint-to-endpoint connection is not a datagram concept.
    ///
    /// # Errors
    ///
    /// Always [`Error::InvalidEndpointState`].
    pub fn connect_endpoint(&self, _other: &Endpoint) -> Result<()> {
        Err(Error::InvalidEndpointState)
    }

    // ====================================================================
    // Socket options
    // ====================================================================

    /// Sets an integer-valued option.
    ///
    /// Buffer capacities are clamped to the stack's limits; the clamping
    /// is observable through the getter. TTL and ToS values are truncated
    /// to their 8-bit wire width.
    ///
    /// # Errors
    ///
    /// [`Error::NotSupported`] for any path-MTU discovery mode other
    /// than disabled.
    pub fn set_option_int(&self, opt: SockOptInt, value: usize) -> Result<()> {
        match opt {
            SockOptInt::MtuDiscover => {
                if value != MTU_DISCOVERY_DISABLED {
                    return Err(Error::NotSupported);
                }
                Ok(())
            }
            SockOptInt::MulticastTtl => {
                self.core.write().multicast_ttl = value as u8;
                Ok(())
            }
            SockOptInt::Ttl => {
                self.core.write().ttl = value as u8;
                Ok(())
            }
            SockOptInt::Ipv4Tos | SockOptInt::Ipv6TrafficClass => {
                self.core.write().send_tos = value as u8;
                Ok(())
            }
            SockOptInt::ReceiveBufferSize => {
                let clamped = self.stack.receive_buffer_limits().clamp(value);
                let _core = self.core.write();
                self.rcv.set_capacity(clamped);
                Ok(())
            }
            SockOptInt::SendBufferSize => {
                let clamped = self.stack.send_buffer_limits().clamp(value);
                self.core.write().snd_buf_size_max = clamped;
                Ok(())
            }
            // Queue sizes are observed, not configured; accept and ignore.
            SockOptInt::ReceiveQueueSize | SockOptInt::SendQueueSize => Ok(()),
        }
    }

    /// Reads an integer-valued option.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownProtocolOption`] for options UDP does not
    /// implement.
    pub fn option_int(&self, opt: SockOptInt) -> Result<usize> {
        match opt {
            SockOptInt::MtuDiscover => Ok(MTU_DISCOVERY_DISABLED),
            SockOptInt::MulticastTtl => Ok(usize::from(self.core.read().multicast_ttl)),
            SockOptInt::Ttl => Ok(usize::from(self.core.read().ttl)),
            SockOptInt::Ipv4Tos | SockOptInt::Ipv6TrafficClass => {
                Ok(usize::from(self.core.read().send_tos))
            }
            SockOptInt::ReceiveBufferSize => Ok(self.rcv.capacity()),
            SockOptInt::SendBufferSize => Ok(self.core.read().snd_buf_size_max),
            SockOptInt::ReceiveQueueSize => Ok(self.rcv.head_payload_len()),
            SockOptInt::SendQueueSize => Err(Error::UnknownProtocolOption),
        }
    }

    /// Sets a structured option.
    ///
    /// # Errors
    ///
    /// Per the option: multicast interface and membership validation,
    /// duplicate joins ([`Error::PortInUse`]), removals without a prior
    /// join ([`Error::BadLocalAddress`]), unknown devices.
    pub fn set_sock_opt(&self, opt: SockOpt) -> Result<()> {
        match opt {
            SockOpt::MulticastInterface { nic, interface_addr } => {
                let mut core = self.core.write();

                let target = FullAddress {
                    addr: interface_addr,
                    ..FullAddress::default()
                };
                let (target, net_proto) = self.canonicalize(&core, target)?;
                let addr = target.addr;

                if nic == 0 && addr.is_empty() {
                    core.multicast_addr = Address::Empty;
                    core.multicast_nic = 0;
                    return Ok(());
                }

                let nic = if nic != 0 {
                    if !self.stack.check_nic(nic) {
                        return Err(Error::BadLocalAddress);
                    }
                    nic
                } else {
                    let found = self.stack.check_local_address(0, net_proto, addr);
                    if found == 0 {
                        return Err(Error::BadLocalAddress);
                    }
                    found
                };

                if core.bind_nic != 0 && core.bind_nic != nic {
                    return Err(Error::InvalidEndpointState);
                }

                core.multicast_nic = nic;
                core.multicast_addr = addr;
                Ok(())
            }

            SockOpt::AddMembership { nic, interface_addr, multicast_addr } => {
                if !multicast_addr.is_multicast() {
                    return Err(Error::InvalidOptionValue);
                }

                let nic = self.membership_nic(nic, interface_addr, multicast_addr);
                if nic == 0 {
                    return Err(Error::UnknownDevice);
                }

                let membership = MulticastMembership { nic, addr: multicast_addr };
                let mut core = self.core.write();
                if core.multicast_memberships.contains(&membership) {
                    return Err(Error::PortInUse);
                }
                self.stack.join_group(self.net_proto, nic, multicast_addr)?;
                core.multicast_memberships.insert(membership);
                Ok(())
            }

            SockOpt::RemoveMembership { nic, interface_addr, multicast_addr } => {
                if !multicast_addr.is_multicast() {
                    return Err(Error::InvalidOptionValue);
                }

                let nic = self.membership_nic(nic, interface_addr, multicast_addr);
                if nic == 0 {
                    return Err(Error::UnknownDevice);
                }

                let membership = MulticastMembership { nic, addr: multicast_addr };
                let mut core = self.core.write();
                if !core.multicast_memberships.contains(&membership) {
                    return Err(Error::BadLocalAddress);
                }
                self.stack.leave_group(self.net_proto, nic, multicast_addr)?;
                core.multicast_memberships.remove(&membership);
                Ok(())
            }

            SockOpt::BindToDevice(device) => {
                if device != 0 && !self.stack.has_nic(device) {
                    return Err(Error::UnknownDevice);
                }
                self.core.write().bind_to_device = device;
                Ok(())
            }

            SockOpt::DetachFilter => Ok(()),
        }
    }

    /// Resolves the interface a membership operation applies to: an
    /// explicit interface address wins, then an explicit NIC, then a
    /// route to the group on any interface. Zero means unresolvable.
    fn membership_nic(&self, nic: NicId, interface_addr: Address, multicast_addr: Address) -> NicId {
        if interface_addr.is_empty() || interface_addr == Address::V4_ANY {
            if nic != 0 {
                return nic;
            }
            let proto = if multicast_addr.is_v6() {
                NetworkProtocol::Ipv6
            } else {
                NetworkProtocol::Ipv4
            };
            match self
                .stack
                .find_route(0, Address::Empty, multicast_addr, proto, false)
            {
                Ok(route) => route.nic(),
                Err(_) => 0,
            }
        } else {
            self.stack.check_local_address(nic, self.net_proto, interface_addr)
        }
    }

    /// The configured default multicast interface, as (NIC, address).
    pub fn multicast_interface(&self) -> (NicId, Address) {
        let core = self.core.read();
        (core.multicast_nic, core.multicast_addr)
    }

    /// The device the endpoint is restricted to; zero when unrestricted.
    pub fn bound_device(&self) -> NicId {
        self.core.read().bind_to_device
    }
}

impl SocketOptionsHandler for Endpoint {
    fn on_reuse_address_set(&self, enabled: bool) {
        self.core.write().port_flags.most_recent = enabled;
    }

    fn on_reuse_port_set(&self, enabled: bool) {
        self.core.write().port_flags.load_balanced = enabled;
    }
}

impl TransportEndpoint for Endpoint {
    /// Accepts a datagram from the stack: validates the header and
    /// checksum, captures ancillary metadata, queues the payload, and
    /// raises a readable event if the queue was empty.
    fn handle_packet(&self, id: TransportEndpointId, mut pkt: PacketBuffer) {
        let stack_stats = self.stack.stats();

        let hdr = match UdpHeader::parse(&pkt.transport_header) {
            Ok(hdr) => hdr,
            Err(err) => {
                trace!(id = self.unique_id, %err, "dropping datagram with short header");
                stack_stats.udp.malformed_packets_received.increment();
                self.stats.receive_errors.malformed_packets_received.increment();
                return;
            }
        };

        if usize::from(hdr.length) > pkt.data.len() + UDP_HEADER_LEN {
            trace!(
                id = self.unique_id,
                declared = hdr.length,
                available = pkt.data.len(),
                "dropping datagram with bad length"
            );
            stack_stats.udp.malformed_packets_received.increment();
            self.stats.receive_errors.malformed_packets_received.increment();
            return;
        }

        // The network layer may deliver trailing bytes beyond the
        // declared datagram; they are not payload.
        pkt.data.cap_length(usize::from(hdr.payload_length()));

        if !verify_checksum(&hdr, &pkt) {
            trace!(id = self.unique_id, "dropping datagram with bad checksum");
            stack_stats.udp.checksum_errors.increment();
            self.stats.receive_errors.checksum_errors.increment();
            return;
        }

        stack_stats.udp.packets_received.increment();
        self.stats.packets_received.increment();

        let local_addr = pkt.network.destination;
        let record = DatagramRecord {
            sender: FullAddress {
                nic: pkt.network.nic,
                addr: id.remote_address,
                port: hdr.src_port,
            },
            destination: FullAddress {
                nic: pkt.network.nic,
                addr: id.local_address,
                port: hdr.dst_port,
            },
            packet_info: IpPacketInfo {
                local_addr,
                destination_addr: local_addr,
                nic: pkt.network.nic,
            },
            payload: pkt.data,
            timestamp_ns: self.stack.now_nanos(),
            // One byte serves both protocols: IPv4 ToS or IPv6 traffic
            // class, as extracted by the network layer.
            tos: pkt.network.tos,
        };

        match self.rcv.try_enqueue(record) {
            EnqueueOutcome::Enqueued { was_empty } => {
                if was_empty {
                    self.waiters.notify(EventMask::READABLE);
                }
            }
            EnqueueOutcome::NotReady => {
                stack_stats.udp.receive_buffer_errors.increment();
                self.stats.receive_errors.closed_receiver.increment();
            }
            EnqueueOutcome::Overflow => {
                trace!(id = self.unique_id, "receive buffer full; dropping datagram");
                stack_stats.udp.receive_buffer_errors.increment();
                self.stats.receive_errors.receive_buffer_overflow.increment();
            }
        }
    }

    /// Latches a port-unreachable signal as the pending asynchronous
    /// error while connected; every other signal is ignored.
    fn handle_control_packet(
        &self,
        _id: TransportEndpointId,
        signal: ControlSignal,
        _pkt: PacketBuffer,
    ) {
        if signal == ControlSignal::PortUnreachable
            && self.state() == EndpointState::Connected
        {
            *self.last_error.lock() = Some(Error::ConnectionRefused);
            self.waiters.notify(EventMask::ERROR);
        }
    }
}

/// Frames `data` in a UDP header and hands it to `route`.
///
/// The checksum is computed when the route does not offload it, except
/// that IPv4 senders may omit it via the no-checksum option; on IPv6 the
/// checksum is mandatory regardless (RFC 2460 section 8.1).
#[allow(clippy::too_many_arguments)]
fn send_udp(
    route: &dyn Route,
    data: ByteChunks,
    local_port: u16,
    remote_port: u16,
    mut ttl: u8,
    use_default_ttl: bool,
    tos: u8,
    owner: Option<Arc<dyn PacketOwner>>,
    no_checksum: bool,
) -> Result<()> {
    let mut pkt = PacketBuffer::new(UDP_HEADER_LEN + route.max_header_length(), data);
    pkt.owner = owner;

    let length = (pkt.data.len() + UDP_HEADER_LEN) as u16;
    let mut hdr = UdpHeader {
        src_port: local_port,
        dst_port: remote_port,
        length,
        checksum: 0,
    };

    if route.requires_tx_transport_checksum()
        && (!no_checksum || route.net_proto() == NetworkProtocol::Ipv6)
    {
        let mut xsum = route.pseudo_header_checksum(UDP_PROTOCOL_NUMBER, length);
        xsum = pkt.data.fold_checksum(xsum);
        hdr.checksum = !wire::checksum(&hdr.encode(), xsum);
    }
    pkt.transport_header = hdr.encode().to_vec();

    if use_default_ttl {
        ttl = route.default_ttl();
    }

    let params = NetworkHeaderParams {
        protocol: UDP_PROTOCOL_NUMBER,
        ttl,
        tos,
    };
    if let Err(err) = route.write_packet(params, pkt) {
        route.stats().udp.packet_send_errors.increment();
        return Err(err);
    }
    route.stats().udp.packets_sent.increment();
    Ok(())
}

/// Verifies the receive checksum unless a lower layer already did, or the
/// sender omitted it where IPv4 permits that.
fn verify_checksum(hdr: &UdpHeader, pkt: &PacketBuffer) -> bool {
    let ipv6 = pkt.network.protocol == Some(NetworkProtocol::Ipv6);
    if pkt.rx_checksum_validated || (hdr.checksum == 0 && !ipv6) {
        return true;
    }
    let mut xsum = wire::pseudo_header_checksum(
        UDP_PROTOCOL_NUMBER,
        &pkt.network.destination,
        &pkt.network.source,
        hdr.length,
    );
    xsum = pkt.data.fold_checksum(xsum);
    wire::checksum(&pkt.transport_header[..UDP_HEADER_LEN], xsum) == 0xffff
}
