//! The bounded receive queue.
//!
//! The queue owns its lock and all receive-side state: the FIFO list,
//! the byte count, the capacity, and the ready/closed flags. The network
//! layer is the producer (through the endpoint's packet handler) and the
//! socket user is the consumer; neither holds any other endpoint lock
//! while touching the queue, which keeps the receive path cheap.
//!
//! Capacity accounting is byte-accurate: a datagram is refused when the
//! buffered byte count has already reached the capacity, and lowering the
//! capacity below the current usage never trims datagrams that were
//! already accepted.

use std::collections::VecDeque;

use skein_core::{Address, ByteChunks, Error, FullAddress, NicId, Result};

/// IP-layer details captured for one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpPacketInfo {
    /// Local address the datagram was delivered to.
    pub local_addr: Address,
    /// Destination address from the network header.
    pub destination_addr: Address,
    /// Interface the datagram arrived on.
    pub nic: NicId,
}

/// One received datagram with its ancillary metadata.
#[derive(Debug, Clone)]
pub struct DatagramRecord {
    /// Sender of the datagram.
    pub sender: FullAddress,
    /// Destination the datagram was addressed to.
    pub destination: FullAddress,
    /// Network-layer details.
    pub packet_info: IpPacketInfo,
    /// The payload.
    pub payload: ByteChunks,
    /// Stack clock at enqueue time, in nanoseconds.
    pub timestamp_ns: i64,
    /// IPv4 ToS or IPv6 traffic-class byte from the network header.
    pub tos: u8,
}

/// Outcome of offering a datagram to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The datagram was queued.
    Enqueued {
        /// Whether the queue was empty beforehand (the consumer may need
        /// a readable notification).
        was_empty: bool,
    },
    /// The queue is not accepting datagrams (never readied, or closed).
    NotReady,
    /// The buffered bytes already reach the capacity.
    Overflow,
}

#[derive(Debug)]
struct Inner {
    list: VecDeque<DatagramRecord>,
    used_bytes: usize,
    capacity: usize,
    ready: bool,
    closed: bool,
}

/// Bounded FIFO of received datagrams with its own lock.
#[derive(Debug)]
pub(crate) struct RecvQueue {
    inner: parking_lot::Mutex<Inner>,
}

impl RecvQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                list: VecDeque::new(),
                used_bytes: 0,
                capacity,
                ready: false,
                closed: false,
            }),
        }
    }

    /// Offers a datagram to the queue.
    pub(crate) fn try_enqueue(&self, record: DatagramRecord) -> EnqueueOutcome {
        let mut inner = self.inner.lock();
        if !inner.ready || inner.closed {
            return EnqueueOutcome::NotReady;
        }
        if inner.used_bytes >= inner.capacity {
            return EnqueueOutcome::Overflow;
        }
        let was_empty = inner.used_bytes == 0;
        inner.used_bytes += record.payload.len();
        inner.list.push_back(record);
        EnqueueOutcome::Enqueued { was_empty }
    }

    /// Removes the head datagram.
    ///
    /// Fails with [`Error::ClosedForReceive`] on an empty closed queue
    /// and [`Error::WouldBlock`] on an empty open one.
    pub(crate) fn dequeue(&self) -> Result<DatagramRecord> {
        let mut inner = self.inner.lock();
        match inner.list.pop_front() {
            Some(record) => {
                inner.used_bytes -= record.payload.len();
                Ok(record)
            }
            None if inner.closed => Err(Error::ClosedForReceive),
            None => Err(Error::WouldBlock),
        }
    }

    /// Payload size of the head datagram, or zero when empty.
    pub(crate) fn head_payload_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.list.front().map_or(0, |record| record.payload.len())
    }

    /// Starts accepting datagrams. Called when the endpoint gains a
    /// local identity (bind or connect).
    pub(crate) fn mark_ready(&self) {
        self.inner.lock().ready = true;
    }

    /// Stops accepting datagrams but keeps what is queued, so readers
    /// drain the backlog before seeing end-of-stream. Returns whether the
    /// queue was already closed.
    pub(crate) fn close_read(&self) -> bool {
        let mut inner = self.inner.lock();
        let was_closed = inner.closed;
        inner.closed = true;
        was_closed
    }

    /// Closes and drains the queue; used on endpoint teardown.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.used_bytes = 0;
        inner.list.clear();
    }

    /// Whether a read would make progress (data queued, or closed).
    pub(crate) fn is_readable(&self) -> bool {
        let inner = self.inner.lock();
        !inner.list.is_empty() || inner.closed
    }

    pub(crate) fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.inner.lock().capacity = capacity;
    }

    /// Buffered payload bytes.
    #[cfg(test)]
    pub(crate) fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }
}
