//! SSH Port Forwarding
//!
//! This module implements port forwarding in three modes:
//! - **Local Forward**: forward local ports to remote destinations
//!   (`direct-tcpip`)
//! - **Remote Forward**: have the peer forward remote ports back here
//!   (`tcpip-forward` / `forwarded-tcpip`)
//! - **Dynamic Forward**: SOCKS5 proxy choosing the destination per
//!   connection
//!
//! [`TcpipForwarder`] is the facade owning every forwarding concern of a
//! session. It coordinates three asynchronous actors: the TCP acceptor
//! delivering inbound connections, the SSH connection service exchanging
//! channel and global-request messages, and the registered
//! [`PortForwardingListener`]s observing tunnel lifecycle.
//!
//! # Example
//!
//! ```rust,no_run
//! use skein_proto::ssh::forwarding::{TcpipForwarder, TunnelAddr};
//! use skein_proto::ssh::service::ConnectionService;
//! use std::sync::Arc;
//!
//! # async fn example(service: Arc<dyn ConnectionService>) -> skein_proto::ssh::forwarding::Result<()> {
//! let forwarder = TcpipForwarder::new(service);
//!
//! // Forward 127.0.0.1:8080 to database.internal:3306 through the session
//! let bound = forwarder
//!     .start_local_port_forwarding(
//!         &TunnelAddr::new("127.0.0.1", 8080),
//!         &TunnelAddr::new("database.internal", 3306),
//!     )
//!     .await?;
//!
//! // SOCKS5 proxy on 127.0.0.1:1080
//! let proxy = forwarder
//!     .start_dynamic_port_forwarding(&TunnelAddr::new("127.0.0.1", 1080))
//!     .await?;
//! println!("tunnel on {}, SOCKS on {}", bound, proxy);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
pub mod forwarder;
pub mod handler;
pub mod registry;
pub mod socks;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use events::{ListenerSet, PortForwardingListener};
pub use forwarder::{TcpipForwarder, DEFAULT_FORWARD_REQUEST_TIMEOUT, FORWARD_REQUEST_TIMEOUT};
pub use handler::BridgeIoHandler;
pub use registry::BindingRegistry;
pub use socks::SocksProxy;
pub use types::{parse_tunnel_addr, ForwardingMode, LocalForwardingEntry, TunnelAddr};
