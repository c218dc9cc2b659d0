//! Session and connection-service seams.
//!
//! The forwarder consumes the SSH transport and channel layers through the
//! traits below. Implementations live with the transport; the forwarding
//! subsystem only requires the operations named here.

use crate::ssh::buffer::Buffer;
use crate::ssh::channel::{TunnelChannel, TunnelChannelKind};
use crate::ssh::forwarding::types::TunnelAddr;
use crate::ssh::io::{IoServiceFactory, IoSession};
use crate::ssh::message::MessageType;
use async_trait::async_trait;
use skein_platform::SkeinResult;
use std::sync::Arc;
use std::time::Duration;

/// An established SSH transport session.
///
/// Global requests go through [`request`](Session::request) when a reply is
/// required and [`write_packet`](Session::write_packet) when fire-and-forget.
#[async_trait]
pub trait Session: Send + Sync {
    /// Allocates a payload buffer for a message of the given type.
    ///
    /// The message identifier is written as the first byte; `hint` sizes the
    /// allocation.
    fn create_buffer(&self, msg: MessageType, hint: usize) -> Buffer {
        let mut buffer = Buffer::with_capacity(hint + 1);
        buffer.put_u8(msg as u8);
        buffer
    }

    /// Issues a global request and waits for the peer's reply.
    ///
    /// Returns `Ok(Some(reply))` on `SSH_MSG_REQUEST_SUCCESS` (the buffer
    /// positioned at the reply payload), `Ok(None)` when the peer denied the
    /// request, and `Err` on transport failure or when no reply arrives
    /// within `timeout`.
    async fn request(
        &self,
        name: &str,
        payload: Buffer,
        timeout: Duration,
    ) -> SkeinResult<Option<Buffer>>;

    /// Writes a packet without waiting for any reply.
    async fn write_packet(&self, payload: Buffer) -> SkeinResult<()>;

    /// Looks up an integer session property, `None` when unset.
    fn int_property(&self, _name: &str) -> Option<u64> {
        None
    }

    /// The I/O substrate used to accept forwarded TCP connections.
    fn io_service_factory(&self) -> Arc<dyn IoServiceFactory>;

    /// Policy filter consulted on peer-requested forwards, if installed.
    fn forwarding_filter(&self) -> Option<Arc<dyn ForwardingFilter>> {
        None
    }
}

/// The connection service owning the session's channel table.
#[async_trait]
pub trait ConnectionService: Send + Sync {
    /// The session this service runs on.
    fn session(&self) -> Arc<dyn Session>;

    /// Creates a tunnel channel bound to an accepted TCP session.
    ///
    /// The channel writes bytes returning from the peer to `io` directly.
    fn create_tunnel_channel(
        &self,
        kind: TunnelChannelKind,
        io: Arc<dyn IoSession>,
    ) -> Arc<dyn TunnelChannel>;

    /// Adds a channel to the connection's channel table.
    async fn register_channel(&self, channel: Arc<dyn TunnelChannel>) -> SkeinResult<()>;

    /// Removes a channel from the connection's channel table.
    async fn unregister_channel(&self, channel: &dyn TunnelChannel) -> SkeinResult<()>;
}

/// Policy hook deciding whether a peer-requested listen address is permitted.
pub trait ForwardingFilter: Send + Sync {
    /// Returns `true` when the session may listen on `local` for forwarding.
    ///
    /// An `Err` marks the filter itself as broken (as opposed to a clean
    /// denial) and aborts the requested forward.
    fn can_listen(&self, local: &TunnelAddr, session: &dyn Session) -> SkeinResult<bool>;
}
