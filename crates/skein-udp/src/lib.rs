//! # skein-udp
//!
//! The UDP transport endpoint of the skein userspace TCP/IP stack.
//!
//! An [`Endpoint`] owns the per-socket state — lifecycle, bound identity,
//! receive queue, multicast memberships, options — and implements the
//! datagram send and receive paths against the collaborator interfaces of
//! [`skein_core::stack`]. All operations are non-blocking; consumers wait
//! on the endpoint's [`skein_core::WaitQueue`] for readiness.
//!
//! ```no_run
//! use std::sync::Arc;
//! use skein_core::{FullAddress, NetworkProtocol, WaitQueue};
//! use skein_udp::{Endpoint, WriteOptions};
//!
//! # fn demo(stack: Arc<dyn skein_core::Stack>) -> Result<(), skein_udp::WriteError> {
//! let endpoint = Endpoint::new(stack, NetworkProtocol::Ipv4, Arc::new(WaitQueue::new()));
//! endpoint.bind(FullAddress::default())?;
//! let to = FullAddress::new(0, [192, 0, 2, 1].into(), 9);
//! endpoint.write(b"ping", WriteOptions { to: Some(to), ..Default::default() })?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

mod endpoint;
mod queue;

pub use endpoint::{
    ControlMessages, Endpoint, EndpointState, ReceivedDatagram, SockOpt, SockOptInt, WriteError,
    WriteOptions, MTU_DISCOVERY_DISABLED,
};
pub use queue::{DatagramRecord, IpPacketInfo};
