//! # skein-core
//!
//! Core primitives for the skein userspace TCP/IP stack.
//!
//! This crate provides:
//! - Network and transport addressing (`addr`)
//! - The UDP wire format and the internet checksum (`wire`)
//! - Vectorised payload views and packet buffers (`buffer`)
//! - The waiter/event notification primitive (`waiter`)
//! - The cross-cutting socket option holder (`socket_opts`)
//! - The interfaces a transport endpoint consumes from the surrounding
//!   stack: routes, registration, ports, groups, clock, and statistics
//!   (`stack`)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │               Transport endpoints (skein-udp)           │
//! ├─────────────────────────────────────────────────────────┤
//! │   Stack / Route / TransportEndpoint traits (stack)      │
//! ├─────────────────────────────────────────────────────────┤
//! │   addr │ wire │ buffer │ waiter │ socket_opts │ errors  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The traits in [`stack`] are the seam between a transport endpoint and
//! the network layer that owns routing, header emission, and
//! demultiplexing. Endpoints never talk to a NIC directly; they hand
//! packets to a [`stack::Route`] and receive parsed packets back through
//! [`stack::TransportEndpoint`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod buffer;
pub mod error;
pub mod socket_opts;
pub mod stack;
pub mod waiter;
pub mod wire;

pub use addr::{Address, FullAddress, NetworkProtocol, NicId};
pub use buffer::{ByteChunks, NetworkInfo, PacketBuffer};
pub use error::{Error, Result};
pub use socket_opts::{ShutdownFlags, SocketOptions, SocketOptionsHandler};
pub use stack::{
    BufferSizeLimits, ControlSignal, EndpointStats, NetworkHeaderParams, PacketOwner, PortFlags,
    Resolution, Route, Stack, StackStats, StatCounter, TransportEndpoint, TransportEndpointId,
};
pub use waiter::{ChannelNotifier, EventMask, EventNotifier, WaitQueue};
