//! Async I/O substrate.
//!
//! The forwarder accepts TCP connections through the abstractions below
//! rather than owning sockets directly: an [`IoAcceptor`] binds listen
//! addresses and drives an [`IoHandler`] with session lifecycle callbacks.
//! [`acceptor`] provides the production `tokio` implementation.
//!
//! Callback ordering per accepted session is fixed: `session_created`, then
//! zero or more `message_received` in arrival (FIFO) order, then
//! `session_closed`. `exception_caught` may interleave after a failed
//! delivery.

pub mod acceptor;

pub use acceptor::{TokioAcceptor, TokioIoServiceFactory};

use async_trait::async_trait;
use skein_platform::{SkeinError, SkeinResult};
use std::net::SocketAddr;
use std::sync::Arc;

/// One accepted TCP connection.
#[async_trait]
pub trait IoSession: Send + Sync {
    /// Identifier unique within the acceptor.
    fn id(&self) -> u64;

    /// The local (listen-side) address of the connection.
    fn local_address(&self) -> SocketAddr;

    /// The remote peer address.
    fn remote_address(&self) -> SocketAddr;

    /// Writes bytes back to the peer.
    async fn write(&self, data: &[u8]) -> SkeinResult<()>;

    /// Closes the connection; `immediately` skips the graceful shutdown.
    async fn close(&self, immediately: bool);
}

/// Receives lifecycle callbacks for sessions accepted on a bound address.
#[async_trait]
pub trait IoHandler: Send + Sync {
    /// A connection was accepted.
    async fn session_created(&self, session: &Arc<dyn IoSession>) -> SkeinResult<()>;

    /// The connection ended (peer EOF, local close or error).
    async fn session_closed(&self, session: &Arc<dyn IoSession>) -> SkeinResult<()>;

    /// Bytes arrived from the peer.
    async fn message_received(&self, session: &Arc<dyn IoSession>, data: &[u8])
        -> SkeinResult<()>;

    /// A delivery or read failed; the handler decides whether to drop the
    /// session.
    async fn exception_caught(&self, session: &Arc<dyn IoSession>, error: SkeinError);
}

/// Accepts TCP connections on any number of bound addresses.
///
/// Each bind carries its own handler, so one acceptor can serve statically
/// forwarded ports and SOCKS ports at the same time. `bind` does not report
/// the resolved address; callers recover it from [`bound_addresses`]
/// (see [`IoAcceptor::bound_addresses`]).
#[async_trait]
pub trait IoAcceptor: Send + Sync {
    /// Starts listening on `addr`, delivering sessions to `handler`.
    async fn bind(&self, addr: SocketAddr, handler: Arc<dyn IoHandler>) -> SkeinResult<()>;

    /// Stops listening on `addr`. Sessions already accepted keep running.
    async fn unbind(&self, addr: SocketAddr) -> SkeinResult<()>;

    /// The currently bound addresses, fully resolved.
    async fn bound_addresses(&self) -> Vec<SocketAddr>;

    /// Stops all listeners and closes every live session.
    async fn close(&self, immediately: bool) -> SkeinResult<()>;
}

/// Creates acceptors for the forwarding subsystem.
pub trait IoServiceFactory: Send + Sync {
    /// Creates a new, empty acceptor.
    fn create_acceptor(&self) -> Arc<dyn IoAcceptor>;
}
