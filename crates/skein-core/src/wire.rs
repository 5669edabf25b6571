//! UDP wire format and the internet checksum.
//!
//! The UDP header (RFC 768) is 8 bytes, all fields big-endian:
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |            Length             |           Checksum            |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! The checksum is the one's-complement of the one's-complement sum of
//! the pseudo-header, the UDP header, and the payload. On IPv4 a zero
//! checksum means the transmitter omitted it; on IPv6 the checksum is
//! mandatory (RFC 2460 section 8.1).

use thiserror::Error;

use crate::addr::Address;

/// Size of the UDP header in bytes.
pub const UDP_HEADER_LEN: usize = 8;

/// Maximum size of a UDP packet (header and payload) on the wire.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Maximum payload a single datagram can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - UDP_HEADER_LEN;

/// IP protocol number assigned to UDP.
pub const UDP_PROTOCOL_NUMBER: u8 = 17;

/// Errors produced while parsing wire headers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The buffer is smaller than the fixed header.
    #[error("header too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes available.
        actual: usize,
    },
}

/// A parsed UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Total datagram length declared by the sender (header + payload).
    pub length: u16,
    /// Checksum; `0` on IPv4 means "not computed".
    pub checksum: u16,
}

impl UdpHeader {
    /// Parses a header from the front of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if `data` holds fewer than
    /// [`UDP_HEADER_LEN`] bytes.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < UDP_HEADER_LEN {
            return Err(WireError::TooShort {
                expected: UDP_HEADER_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// Serialises the header to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }

    /// Payload length implied by the declared total length.
    #[must_use]
    pub fn payload_length(&self) -> u16 {
        self.length.saturating_sub(UDP_HEADER_LEN as u16)
    }
}

/// Folds `data` into a partial internet checksum.
///
/// `initial` is the accumulated partial sum so far. An odd trailing byte
/// is padded on the right, so only the final fragment of a checksummed
/// region may have odd length; [`crate::buffer::ByteChunks::fold_checksum`]
/// handles arbitrary fragmentation.
#[must_use]
pub fn checksum(data: &[u8], initial: u16) -> u16 {
    let mut sum = u32::from(initial);
    let mut pairs = data.chunks_exact(2);
    for pair in &mut pairs {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = pairs.remainder() {
        sum += u32::from(*last) << 8;
    }
    fold(sum)
}

/// Folds the 16-bit pseudo-header checksum over the source address,
/// destination address, protocol number, and transport length.
#[must_use]
pub fn pseudo_header_checksum(protocol: u8, src: &Address, dst: &Address, length: u16) -> u16 {
    let mut sum = checksum(src.as_slice(), 0);
    sum = checksum(dst.as_slice(), sum);
    sum = checksum(&[0, protocol], sum);
    checksum(&length.to_be_bytes(), sum)
}

fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}
