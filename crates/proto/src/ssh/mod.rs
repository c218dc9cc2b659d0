//! SSH connection-protocol support (RFC 4254).
//!
//! # Architecture
//!
//! The subsystem is layered:
//!
//! 1. **Wire primitives** ([`message`], [`buffer`]) - message identifiers and
//!    the SSH binary encoding (string / boolean / uint32 fields)
//! 2. **Service seams** ([`service`], [`channel`]) - traits through which the
//!    forwarder consumes the transport session and the channel layer
//! 3. **I/O substrate** ([`io`]) - acceptor/handler abstractions plus the
//!    `tokio` implementation that drives real sockets
//! 4. **Port forwarding** ([`forwarding`]) - the tunnel facade, binding
//!    registry, bridge handler and SOCKS5 engine
//!
//! # References
//!
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod buffer;
pub mod channel;
pub mod forwarding;
pub mod io;
pub mod message;
pub mod service;

// Re-export main types
pub use buffer::Buffer;
pub use channel::{ChannelState, StateWatch, TunnelChannel, TunnelChannelKind};
pub use forwarding::{
    ForwardingMode, LocalForwardingEntry, PortForwardingListener, TcpipForwarder, TunnelAddr,
};
pub use message::MessageType;
pub use service::{ConnectionService, ForwardingFilter, Session};
