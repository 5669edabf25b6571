//! Error types shared across the stack.
//!
//! Transport endpoints surface a closed set of error kinds to their
//! callers; the socket layer above maps them onto errno values. Errors
//! carry no payload so they stay `Copy` and can be latched in the
//! asynchronous last-error slot of an endpoint.

use thiserror::Error;

/// Result alias used throughout the stack.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned by stack and endpoint operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The operation would block; retry after the next readiness event.
    #[error("operation would block")]
    WouldBlock,

    /// The receive half of the endpoint has been shut down.
    #[error("endpoint is closed for receive")]
    ClosedForReceive,

    /// The send half of the endpoint has been shut down.
    #[error("endpoint is closed for send")]
    ClosedForSend,

    /// A send on an unconnected endpoint did not name a destination.
    #[error("destination address is required")]
    DestinationRequired,

    /// The endpoint is in a state that does not permit the operation.
    #[error("endpoint is in an invalid state")]
    InvalidEndpointState,

    /// An option carried a value the endpoint does not accept.
    #[error("invalid option value specified")]
    InvalidOptionValue,

    /// The payload cannot fit in a single datagram.
    #[error("message too long")]
    MessageTooLong,

    /// No route to the destination exists.
    #[error("no route to destination")]
    NoRoute,

    /// The destination is a broadcast address but broadcast is not enabled.
    #[error("broadcast is disabled on this endpoint")]
    BroadcastDisabled,

    /// The network is unreachable through any configured interface.
    #[error("network is unreachable")]
    NetworkUnreachable,

    /// The route's link-layer address is not resolved yet.
    #[error("no remote link address")]
    NoLinkAddress,

    /// The requested local address is not assigned to any interface.
    #[error("bad local address")]
    BadLocalAddress,

    /// The named interface does not exist.
    #[error("unknown device")]
    UnknownDevice,

    /// The port (or membership) is already in use.
    #[error("port is in use")]
    PortInUse,

    /// The endpoint is not connected.
    #[error("endpoint is not connected")]
    NotConnected,

    /// The operation is not supported by this transport.
    #[error("operation is not supported")]
    NotSupported,

    /// The option is not recognised by this protocol.
    #[error("unknown protocol option")]
    UnknownProtocolOption,

    /// The peer refused the connection (e.g. ICMP port unreachable).
    #[error("connection was refused")]
    ConnectionRefused,
}
