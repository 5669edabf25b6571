//! A scripted in-memory stack for driving endpoints in tests.
//!
//! The fake implements the collaborator interfaces an endpoint consumes:
//! a static NIC/address topology, a port reservation table, a transport
//! registration table, a route factory whose transmissions are captured
//! for inspection, link-resolution scripting, a manual clock, and the
//! shared statistics block. A delivery helper parses captured (or
//! hand-built) wire datagrams and pushes them back through the registered
//! endpoint, so tests can run full send → receive loops in memory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use skein_core::wire::{self, UdpHeader, UDP_HEADER_LEN, UDP_PROTOCOL_NUMBER};
use skein_core::{
    Address, BufferSizeLimits, ByteChunks, Error, FullAddress, NetworkHeaderParams, NetworkInfo,
    NetworkProtocol, NicId, PacketBuffer, PortFlags, Resolution, Result, Route, Stack, StackStats,
    TransportEndpoint, TransportEndpointId,
};

/// First port of the ephemeral range handed out by the fake.
pub const EPHEMERAL_PORT_FIRST: u16 = 49152;

/// Checksum handling when building a wire datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Compute a valid checksum.
    Valid,
    /// Emit a zero checksum (IPv4 "omitted").
    Omitted,
    /// Emit a non-zero but wrong checksum.
    Corrupt,
}

/// One packet a route handed to the (fake) network layer.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub nic: NicId,
    pub proto: NetworkProtocol,
    pub local: Address,
    pub remote: Address,
    pub ttl: u8,
    pub tos: u8,
    pub broadcast: bool,
    pub wire: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub proto: NetworkProtocol,
    pub nic: NicId,
    pub addr: Address,
}

/// The scripted stack.
pub struct FakeStack {
    self_ref: Weak<FakeStack>,

    nics: Mutex<HashMap<NicId, Vec<(NetworkProtocol, Address)>>>,
    subnet_broadcasts: Mutex<HashSet<Address>>,
    unreachable: Mutex<HashSet<Address>>,
    resolving: Mutex<HashMap<Address, (Sender<()>, Receiver<()>)>>,
    fail_transmit: Mutex<HashSet<Address>>,
    offload_tx_checksum: AtomicBool,

    reservations: Mutex<HashMap<(NetworkProtocol, u16), PortFlags>>,
    registry: DashMap<(NetworkProtocol, TransportEndpointId), Arc<dyn TransportEndpoint>>,
    groups: Mutex<Vec<GroupMembership>>,

    sent: Mutex<Vec<SentPacket>>,
    clock_ns: AtomicI64,
    next_id: AtomicU64,
    stats: Arc<StackStats>,

    recv_limits: BufferSizeLimits,
    send_limits: BufferSizeLimits,
}

impl FakeStack {
    /// A stack with two NICs:
    /// - NIC 1: 192.0.2.2 and 2001:db8::2
    /// - NIC 2: 198.51.100.2
    pub fn new() -> Arc<Self> {
        let stack = Self::empty();
        stack.add_address(1, "192.0.2.2".parse::<std::net::Ipv4Addr>().unwrap().into());
        stack.add_v6_address(1, "2001:db8::2");
        stack.add_address(2, "198.51.100.2".parse::<std::net::Ipv4Addr>().unwrap().into());
        stack
    }

    /// A stack with no NICs configured.
    pub fn empty() -> Arc<Self> {
        Arc::new_cyclic(|weak| FakeStack {
            self_ref: weak.clone(),
            nics: Mutex::new(HashMap::new()),
            subnet_broadcasts: Mutex::new(HashSet::new()),
            unreachable: Mutex::new(HashSet::new()),
            resolving: Mutex::new(HashMap::new()),
            fail_transmit: Mutex::new(HashSet::new()),
            offload_tx_checksum: AtomicBool::new(false),
            reservations: Mutex::new(HashMap::new()),
            registry: DashMap::new(),
            groups: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            clock_ns: AtomicI64::new(1_000_000_000),
            next_id: AtomicU64::new(1),
            stats: Arc::new(StackStats::default()),
            recv_limits: BufferSizeLimits { min: 16, default: 32 * 1024, max: 1 << 20 },
            send_limits: BufferSizeLimits { min: 16, default: 32 * 1024, max: 1 << 20 },
        })
    }

    // ---------------- topology scripting ----------------

    pub fn add_address(&self, nic: NicId, addr: Address) {
        let proto = if addr.is_v6() { NetworkProtocol::Ipv6 } else { NetworkProtocol::Ipv4 };
        self.nics.lock().entry(nic).or_default().push((proto, addr));
    }

    pub fn add_v6_address(&self, nic: NicId, addr: &str) {
        self.add_address(nic, addr.parse::<std::net::Ipv6Addr>().unwrap().into());
    }

    pub fn add_nic(&self, nic: NicId) {
        self.nics.lock().entry(nic).or_default();
    }

    pub fn add_subnet_broadcast(&self, addr: Address) {
        self.subnet_broadcasts.lock().insert(addr);
    }

    pub fn set_unreachable(&self, addr: Address) {
        self.unreachable.lock().insert(addr);
    }

    /// Makes routes to `addr` require link resolution until
    /// [`FakeStack::complete_resolution`] is called.
    pub fn set_resolving(&self, addr: Address) {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.resolving.lock().insert(addr, (tx, rx));
    }

    pub fn complete_resolution(&self, addr: Address) {
        if let Some((tx, _rx)) = self.resolving.lock().remove(&addr) {
            let _ = tx.send(());
        }
    }

    pub fn set_fail_transmit(&self, addr: Address) {
        self.fail_transmit.lock().insert(addr);
    }

    pub fn set_offload_tx_checksum(&self, enabled: bool) {
        self.offload_tx_checksum.store(enabled, Ordering::Relaxed);
    }

    pub fn advance_clock(&self, nanos: i64) {
        self.clock_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    // ---------------- inspection ----------------

    pub fn sent_packets(&self) -> Vec<SentPacket> {
        self.sent.lock().clone()
    }

    pub fn last_sent(&self) -> Option<SentPacket> {
        self.sent.lock().last().cloned()
    }

    pub fn joined_groups(&self) -> Vec<GroupMembership> {
        self.groups.lock().clone()
    }

    pub fn registration_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_port_reserved(&self, proto: NetworkProtocol, port: u16) -> bool {
        self.reservations.lock().contains_key(&(proto, port))
    }

    pub fn shared_stats(&self) -> Arc<StackStats> {
        Arc::clone(&self.stats)
    }

    // ---------------- delivery ----------------

    /// Builds a UDP wire datagram (header + payload).
    pub fn make_udp_wire(
        src: FullAddress,
        dst: FullAddress,
        payload: &[u8],
        mode: ChecksumMode,
    ) -> Vec<u8> {
        let length = (UDP_HEADER_LEN + payload.len()) as u16;
        let mut hdr = UdpHeader {
            src_port: src.port,
            dst_port: dst.port,
            length,
            checksum: 0,
        };
        match mode {
            ChecksumMode::Omitted => {}
            ChecksumMode::Valid | ChecksumMode::Corrupt => {
                let mut xsum =
                    wire::pseudo_header_checksum(UDP_PROTOCOL_NUMBER, &src.addr, &dst.addr, length);
                xsum = wire::checksum(payload, xsum);
                hdr.checksum = !wire::checksum(&hdr.encode(), xsum);
                if mode == ChecksumMode::Corrupt {
                    hdr.checksum ^= 0x0101;
                    if hdr.checksum == 0 {
                        hdr.checksum = 0x0101;
                    }
                }
            }
        }
        let mut bytes = hdr.encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Parses a wire datagram and delivers it to the registered endpoint
    /// matching it best, the way the stack's demultiplexer would. Returns
    /// whether an endpoint accepted delivery.
    pub fn deliver_udp(
        &self,
        proto: NetworkProtocol,
        nic: NicId,
        src: FullAddress,
        dst: FullAddress,
        wire_bytes: &[u8],
        tos: u8,
    ) -> bool {
        let id = TransportEndpointId {
            local_port: dst.port,
            local_address: dst.addr,
            remote_port: src.port,
            remote_address: src.addr,
        };

        let Some(endpoint) = self.lookup(proto, &id) else {
            return false;
        };

        let (header, payload) = wire_bytes.split_at(UDP_HEADER_LEN.min(wire_bytes.len()));
        let mut pkt = PacketBuffer {
            transport_header: header.to_vec(),
            data: ByteChunks::from(payload),
            ..PacketBuffer::default()
        };
        pkt.network = NetworkInfo {
            protocol: Some(proto),
            source: src.addr,
            destination: dst.addr,
            tos,
            nic,
        };
        endpoint.handle_packet(id, pkt);
        true
    }

    /// Feeds a previously captured transmission back in, as loopback
    /// delivery would.
    pub fn loop_back(&self, sent: &SentPacket) -> bool {
        let hdr = UdpHeader::parse(&sent.wire).expect("sent packet has a UDP header");
        self.deliver_udp(
            sent.proto,
            sent.nic,
            FullAddress::new(0, sent.local, hdr.src_port),
            FullAddress::new(0, sent.remote, hdr.dst_port),
            &sent.wire,
            sent.tos,
        )
    }

    /// Delivers a control signal to the endpoint registered under `id`.
    pub fn deliver_control(
        &self,
        proto: NetworkProtocol,
        id: TransportEndpointId,
        signal: skein_core::ControlSignal,
    ) -> bool {
        let Some(endpoint) = self.lookup(proto, &id) else {
            return false;
        };
        endpoint.handle_control_packet(id, signal, PacketBuffer::default());
        true
    }

    fn lookup(
        &self,
        proto: NetworkProtocol,
        id: &TransportEndpointId,
    ) -> Option<Arc<dyn TransportEndpoint>> {
        let mut best: Option<(u8, Arc<dyn TransportEndpoint>)> = None;
        for entry in self.registry.iter() {
            let (reg_proto, reg_id) = entry.key();
            if *reg_proto != proto || reg_id.local_port != id.local_port {
                continue;
            }
            if !reg_id.local_address.is_empty() && reg_id.local_address != id.local_address {
                continue;
            }
            if reg_id.remote_port != 0
                && (reg_id.remote_port != id.remote_port
                    || reg_id.remote_address != id.remote_address)
            {
                continue;
            }
            let score = match (reg_id.remote_port != 0, !reg_id.local_address.is_empty()) {
                (true, _) => 3,
                (false, true) => 2,
                (false, false) => 1,
            };
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, Arc::clone(entry.value())));
            }
        }
        best.map(|(_, endpoint)| endpoint)
    }

    fn primary_address(&self, nic: NicId, proto: NetworkProtocol) -> Option<Address> {
        self.nics
            .lock()
            .get(&nic)?
            .iter()
            .find(|(p, _)| *p == proto)
            .map(|(_, addr)| *addr)
    }

    fn nic_for_proto(&self, proto: NetworkProtocol) -> Option<NicId> {
        let nics = self.nics.lock();
        let mut ids: Vec<NicId> = nics
            .iter()
            .filter(|(_, addrs)| addrs.iter().any(|(p, _)| *p == proto))
            .map(|(nic, _)| *nic)
            .collect();
        ids.sort_unstable();
        ids.first().copied()
    }
}

impl Stack for FakeStack {
    fn find_route(
        &self,
        nic: NicId,
        local: Address,
        remote: Address,
        proto: NetworkProtocol,
        _multicast_loop: bool,
    ) -> Result<Arc<dyn Route>> {
        if self.unreachable.lock().contains(&remote) {
            return Err(Error::NoRoute);
        }

        let nic = if nic != 0 {
            if !self.has_nic(nic) {
                return Err(Error::NoRoute);
            }
            nic
        } else if !local.is_empty() {
            let found = self.check_local_address(0, proto, local);
            if found == 0 {
                return Err(Error::NoRoute);
            }
            found
        } else {
            self.nic_for_proto(proto).ok_or(Error::NetworkUnreachable)?
        };

        let local = if local.is_empty() {
            self.primary_address(nic, proto).ok_or(Error::NetworkUnreachable)?
        } else {
            local
        };

        let broadcast =
            remote.is_limited_broadcast() || self.is_subnet_broadcast(nic, proto, remote);

        let stack = self.self_ref.upgrade().expect("stack alive");
        Ok(Arc::new(FakeRoute { stack, nic, local, remote, proto, broadcast }))
    }

    fn check_nic(&self, nic: NicId) -> bool {
        self.nics.lock().contains_key(&nic)
    }

    fn has_nic(&self, nic: NicId) -> bool {
        self.nics.lock().contains_key(&nic)
    }

    fn check_local_address(&self, nic: NicId, proto: NetworkProtocol, addr: Address) -> NicId {
        let nics = self.nics.lock();
        if nic != 0 {
            let has = nics
                .get(&nic)
                .is_some_and(|addrs| addrs.iter().any(|(p, a)| *p == proto && *a == addr));
            return if has { nic } else { 0 };
        }
        let mut matching: Vec<NicId> = nics
            .iter()
            .filter(|(_, addrs)| addrs.iter().any(|(p, a)| *p == proto && *a == addr))
            .map(|(id, _)| *id)
            .collect();
        matching.sort_unstable();
        matching.first().copied().unwrap_or(0)
    }

    fn is_subnet_broadcast(&self, _nic: NicId, _proto: NetworkProtocol, addr: Address) -> bool {
        self.subnet_broadcasts.lock().contains(&addr)
    }

    fn reserve_port(
        &self,
        protos: &[NetworkProtocol],
        _addr: Address,
        port: u16,
        flags: PortFlags,
        _bind_to_device: NicId,
    ) -> Result<u16> {
        let mut reservations = self.reservations.lock();

        let conflicts = |reservations: &HashMap<(NetworkProtocol, u16), PortFlags>, port: u16| {
            protos.iter().any(|proto| {
                reservations
                    .get(&(*proto, port))
                    .is_some_and(|held| !(held.load_balanced && flags.load_balanced))
            })
        };

        let port = if port != 0 {
            if conflicts(&reservations, port) {
                return Err(Error::PortInUse);
            }
            port
        } else {
            let mut rng = rand::thread_rng();
            let mut chosen = None;
            for _ in 0..1000 {
                let candidate = rng.gen_range(EPHEMERAL_PORT_FIRST..=u16::MAX);
                if !conflicts(&reservations, candidate) {
                    chosen = Some(candidate);
                    break;
                }
            }
            chosen.ok_or(Error::PortInUse)?
        };

        for proto in protos {
            reservations.insert((*proto, port), flags);
        }
        Ok(port)
    }

    fn release_port(
        &self,
        protos: &[NetworkProtocol],
        _addr: Address,
        port: u16,
        _flags: PortFlags,
        _bind_to_device: NicId,
    ) {
        let mut reservations = self.reservations.lock();
        for proto in protos {
            reservations.remove(&(*proto, port));
        }
    }

    fn register_transport_endpoint(
        &self,
        _nic: NicId,
        protos: &[NetworkProtocol],
        id: TransportEndpointId,
        endpoint: Arc<dyn TransportEndpoint>,
        _flags: PortFlags,
        _bind_to_device: NicId,
    ) -> Result<()> {
        for proto in protos {
            if self.registry.contains_key(&(*proto, id)) {
                return Err(Error::PortInUse);
            }
        }
        for proto in protos {
            self.registry.insert((*proto, id), Arc::clone(&endpoint));
        }
        Ok(())
    }

    fn unregister_transport_endpoint(
        &self,
        _nic: NicId,
        protos: &[NetworkProtocol],
        id: TransportEndpointId,
        _endpoint: &Arc<dyn TransportEndpoint>,
        _flags: PortFlags,
        _bind_to_device: NicId,
    ) {
        for proto in protos {
            self.registry.remove(&(*proto, id));
        }
    }

    fn join_group(&self, proto: NetworkProtocol, nic: NicId, addr: Address) -> Result<()> {
        if !self.has_nic(nic) {
            return Err(Error::UnknownDevice);
        }
        self.groups.lock().push(GroupMembership { proto, nic, addr });
        Ok(())
    }

    fn leave_group(&self, proto: NetworkProtocol, nic: NicId, addr: Address) -> Result<()> {
        let mut groups = self.groups.lock();
        let target = GroupMembership { proto, nic, addr };
        match groups.iter().position(|g| *g == target) {
            Some(index) => {
                groups.remove(index);
                Ok(())
            }
            None => Err(Error::BadLocalAddress),
        }
    }

    fn now_nanos(&self) -> i64 {
        self.clock_ns.load(Ordering::Relaxed)
    }

    fn receive_buffer_limits(&self) -> BufferSizeLimits {
        self.recv_limits
    }

    fn send_buffer_limits(&self) -> BufferSizeLimits {
        self.send_limits
    }

    fn stats(&self) -> Arc<StackStats> {
        Arc::clone(&self.stats)
    }

    fn next_unique_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A route minted by [`FakeStack::find_route`].
pub struct FakeRoute {
    stack: Arc<FakeStack>,
    nic: NicId,
    local: Address,
    remote: Address,
    proto: NetworkProtocol,
    broadcast: bool,
}

impl Route for FakeRoute {
    fn max_header_length(&self) -> usize {
        match self.proto {
            NetworkProtocol::Ipv4 => 34,
            NetworkProtocol::Ipv6 => 54,
        }
    }

    fn default_ttl(&self) -> u8 {
        64
    }

    fn is_outbound_broadcast(&self) -> bool {
        self.broadcast
    }

    fn is_resolution_required(&self) -> bool {
        self.stack.resolving.lock().contains_key(&self.remote)
    }

    fn resolve(&self) -> Result<Resolution> {
        match self.stack.resolving.lock().get(&self.remote) {
            Some((_tx, rx)) => Ok(Resolution::Pending(rx.clone())),
            None => Ok(Resolution::Complete),
        }
    }

    fn requires_tx_transport_checksum(&self) -> bool {
        !self.stack.offload_tx_checksum.load(Ordering::Relaxed)
    }

    fn pseudo_header_checksum(&self, protocol: u8, length: u16) -> u16 {
        wire::pseudo_header_checksum(protocol, &self.local, &self.remote, length)
    }

    fn write_packet(&self, params: NetworkHeaderParams, pkt: PacketBuffer) -> Result<()> {
        if self.stack.fail_transmit.lock().contains(&self.remote) {
            return Err(Error::NetworkUnreachable);
        }
        self.stack.sent.lock().push(SentPacket {
            nic: self.nic,
            proto: self.proto,
            local: self.local,
            remote: self.remote,
            ttl: params.ttl,
            tos: params.tos,
            broadcast: self.broadcast,
            wire: pkt.to_wire(),
        });
        Ok(())
    }

    fn local_address(&self) -> Address {
        self.local
    }

    fn remote_address(&self) -> Address {
        self.remote
    }

    fn net_proto(&self) -> NetworkProtocol {
        self.proto
    }

    fn nic(&self) -> NicId {
        self.nic
    }

    fn stats(&self) -> Arc<StackStats> {
        self.stack.stats()
    }
}

/// Shorthand for an IPv4 [`Address`].
pub fn v4(addr: &str) -> Address {
    addr.parse::<std::net::Ipv4Addr>().unwrap().into()
}

/// Shorthand for an IPv6 [`Address`].
pub fn v6(addr: &str) -> Address {
    addr.parse::<std::net::Ipv6Addr>().unwrap().into()
}

/// Shorthand for a [`FullAddress`] without a NIC.
pub fn full(addr: Address, port: u16) -> FullAddress {
    FullAddress::new(0, addr, port)
}
