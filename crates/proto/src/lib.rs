//! Protocol building blocks for the Skein SSH stack.
//!
//! This crate provides the SSH connection-protocol machinery for multiplexing
//! arbitrary TCP streams over an established SSH transport:
//!
//! - **Port forwarding** - local (`direct-tcpip`), remote (`tcpip-forward`)
//!   and dynamic (SOCKS5) tunnels, see [`ssh::forwarding`]
//! - **I/O substrate** - pluggable acceptor/handler abstractions with a
//!   production `tokio` implementation, see [`ssh::io`]
//!
//! The SSH transport itself (key exchange, encryption, authentication) is
//! consumed through the [`ssh::service::Session`] trait and is not part of
//! this crate.
//!
//! # Example
//!
//! ```rust
//! use skein_proto::ssh::buffer::Buffer;
//! use skein_proto::ssh::message::MessageType;
//!
//! // Encode a global request the way it goes on the wire
//! let mut buffer = Buffer::with_capacity(64);
//! buffer.put_u8(MessageType::GlobalRequest as u8);
//! buffer.put_string("tcpip-forward");
//! buffer.put_bool(true);
//! assert_eq!(buffer.len(), 1 + 4 + 13 + 1);
//! ```
//!
//! # References
//!
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 1928](https://datatracker.ietf.org/doc/html/rfc1928) - SOCKS Protocol Version 5

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
