//! Vectorised payload views and packet buffers.
//!
//! Payloads move through the stack as [`ByteChunks`]: an ordered list of
//! owned byte fragments with a cached total length. A [`PacketBuffer`]
//! couples a payload with its transport-header bytes and the
//! network-layer metadata the IP layer attaches on receive.

use std::sync::Arc;

use crate::addr::{Address, NetworkProtocol, NicId};
use crate::stack::PacketOwner;
use crate::wire;

/// A vectorised view over payload bytes.
///
/// Fragments are kept as handed in; `cap_length` trims from the tail
/// without copying retained fragments.
#[derive(Debug, Clone, Default)]
pub struct ByteChunks {
    chunks: Vec<Vec<u8>>,
    len: usize,
}

impl ByteChunks {
    /// An empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of payload bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a fragment to the view.
    pub fn push_chunk(&mut self, chunk: Vec<u8>) {
        self.len += chunk.len();
        self.chunks.push(chunk);
    }

    /// Iterates the fragments in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(Vec::as_slice)
    }

    /// Caps the view to at most `len` bytes, dropping tail fragments and
    /// truncating the fragment that straddles the boundary.
    pub fn cap_length(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let mut remaining = len;
        let mut keep = 0;
        for chunk in &mut self.chunks {
            if remaining == 0 {
                break;
            }
            if chunk.len() > remaining {
                chunk.truncate(remaining);
            }
            remaining -= chunk.len();
            keep += 1;
        }
        self.chunks.truncate(keep);
        self.len = len;
    }

    /// Copies the fragments into one contiguous vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Folds the view into a partial internet checksum, preserving byte
    /// pairing across fragment boundaries regardless of fragment lengths.
    #[must_use]
    pub fn fold_checksum(&self, initial: u16) -> u16 {
        let mut sum = u32::from(initial);
        let mut odd = false;
        for chunk in &self.chunks {
            for &byte in chunk {
                if odd {
                    sum += u32::from(byte);
                } else {
                    sum += u32::from(byte) << 8;
                }
                odd = !odd;
            }
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }
}

impl From<Vec<u8>> for ByteChunks {
    fn from(chunk: Vec<u8>) -> Self {
        let len = chunk.len();
        Self { chunks: vec![chunk], len }
    }
}

impl From<&[u8]> for ByteChunks {
    fn from(bytes: &[u8]) -> Self {
        bytes.to_vec().into()
    }
}

/// Network-layer metadata attached to a received packet by the IP layer,
/// or consumed from [`crate::stack::NetworkHeaderParams`] on emission.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    /// Protocol of the network header the packet arrived in.
    pub protocol: Option<NetworkProtocol>,
    /// Network-layer source address.
    pub source: Address,
    /// Network-layer destination address.
    pub destination: Address,
    /// IPv4 ToS or IPv6 traffic-class byte.
    pub tos: u8,
    /// Interface the packet arrived on.
    pub nic: NicId,
}

/// A packet moving between a transport endpoint and the network layer.
#[derive(Clone, Default)]
pub struct PacketBuffer {
    /// Bytes reserved up front for headers the lower layers will prepend.
    pub header_reserve: usize,
    /// The transport header on its own; pushed by the sender, split off
    /// by the receive-side parser before delivery.
    pub transport_header: Vec<u8>,
    /// The transport payload.
    pub data: ByteChunks,
    /// Set when a lower layer already validated the transport checksum
    /// (e.g. checksum offload on the receive side).
    pub rx_checksum_validated: bool,
    /// Receive-side network metadata.
    pub network: NetworkInfo,
    /// Originator of the packet, when known.
    pub owner: Option<Arc<dyn PacketOwner>>,
}

impl PacketBuffer {
    /// Creates an outgoing packet with `header_reserve` bytes of headroom
    /// for transport and network headers.
    #[must_use]
    pub fn new(header_reserve: usize, data: ByteChunks) -> Self {
        Self {
            header_reserve,
            data,
            ..Default::default()
        }
    }

    /// Total size of the packet: transport header plus payload.
    #[must_use]
    pub fn size(&self) -> usize {
        self.transport_header.len() + self.data.len()
    }

    /// The packet as contiguous wire bytes (transport header then
    /// payload), e.g. for a link layer that does not scatter-gather.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&self.transport_header);
        for chunk in self.data.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl core::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("header_reserve", &self.header_reserve)
            .field("transport_header", &self.transport_header)
            .field("data_len", &self.data.len())
            .field("rx_checksum_validated", &self.rx_checksum_validated)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}
