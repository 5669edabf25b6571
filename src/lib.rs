//! # skein
//!
//! Facade over the skein userspace TCP/IP stack crates:
//!
//! - [`core`](skein_core) — addresses, wire formats, buffers, waiters,
//!   socket options, and the collaborator interfaces between transport
//!   endpoints and the stack.
//! - [`udp`](skein_udp) — the UDP transport endpoint.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use skein_core as core;
pub use skein_udp as udp;
