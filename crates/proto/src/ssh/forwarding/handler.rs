//! Bridge between accepted TCP sessions and tunnel channels.
//!
//! One [`BridgeIoHandler`] serves every statically forwarded port of a
//! forwarder. When a connection is accepted it opens a `direct-tcpip` channel
//! (local forwarding, the target comes from the binding registry) or a
//! `forwarded-tcpip` channel (server-requested forwarding, the peer picks the
//! target), then pumps the session's bytes into the channel.
//!
//! Opening is asynchronous while the TCP side may deliver data immediately,
//! so `message_received` waits on the channel's state watch until it is
//! opened or closed. Under `tokio` that parks the session's read task, which
//! also preserves the per-session byte order.

use super::registry::BindingRegistry;
use crate::ssh::channel::{ChannelState, TunnelChannel, TunnelChannelKind};
use crate::ssh::io::{IoHandler, IoSession};
use crate::ssh::service::ConnectionService;
use async_trait::async_trait;
use skein_platform::{SkeinError, SkeinResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Per-session bridge from accepted TCP connections to tunnel channels.
pub struct BridgeIoHandler {
    service: Arc<dyn ConnectionService>,
    registry: Arc<BindingRegistry>,
    channels: Mutex<HashMap<u64, Arc<dyn TunnelChannel>>>,
}

impl BridgeIoHandler {
    /// Creates a bridge reading targets from `registry` and opening channels
    /// through `service`.
    pub fn new(service: Arc<dyn ConnectionService>, registry: Arc<BindingRegistry>) -> Self {
        Self {
            service,
            registry,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn attached_channel(&self, session_id: u64) -> Option<Arc<dyn TunnelChannel>> {
        self.channels.lock().unwrap().get(&session_id).cloned()
    }
}

#[async_trait]
impl IoHandler for BridgeIoHandler {
    async fn session_created(&self, session: &Arc<dyn IoSession>) -> SkeinResult<()> {
        let local_port = session.local_address().port();
        let target = self.registry.lookup_local(local_port);
        debug!(
            session = session.id(),
            port = local_port,
            target = ?target,
            "bridging accepted connection"
        );

        let kind = match target {
            Some(remote) => TunnelChannelKind::Direct(remote),
            None => TunnelChannelKind::Forwarded,
        };
        let channel = self.service.create_tunnel_channel(kind, Arc::clone(session));
        self.channels
            .lock()
            .unwrap()
            .insert(session.id(), Arc::clone(&channel));

        self.service.register_channel(Arc::clone(&channel)).await?;

        // The TCP session stays up; its own close path reacts to the channel
        // closing, never the other way around.
        let service = Arc::clone(&self.service);
        let session_id = session.id();
        tokio::spawn(async move {
            if let Err(e) = channel.open().await {
                warn!(
                    session = session_id,
                    channel = channel.id(),
                    error = %e,
                    "failed to open tunnel channel"
                );
                if let Err(err) = service.unregister_channel(channel.as_ref()).await {
                    debug!(channel = channel.id(), error = %err, "unregister after failed open");
                }
                channel.close(false).await;
            }
        });
        Ok(())
    }

    async fn session_closed(&self, session: &Arc<dyn IoSession>) -> SkeinResult<()> {
        let channel = self.channels.lock().unwrap().remove(&session.id());
        if let Some(channel) = channel {
            debug!(
                session = session.id(),
                channel = channel.id(),
                "closing channel for ended session"
            );
            channel.close(false).await;
        }
        Ok(())
    }

    async fn message_received(
        &self,
        session: &Arc<dyn IoSession>,
        data: &[u8],
    ) -> SkeinResult<()> {
        let channel = match self.attached_channel(session.id()) {
            Some(channel) => channel,
            None => {
                trace!(session = session.id(), "data before channel attach, dropping");
                return Ok(());
            }
        };

        match channel.await_open_or_closed().await {
            ChannelState::Opened => channel.send_data(data).await,
            _ => {
                // Closed before the open completed: there is no sink for the
                // data any more.
                trace!(
                    session = session.id(),
                    channel = channel.id(),
                    len = data.len(),
                    "channel closed before open, dropping data"
                );
                Ok(())
            }
        }
    }

    async fn exception_caught(&self, session: &Arc<dyn IoSession>, error: SkeinError) {
        debug!(session = session.id(), error = %error, "session error, closing");
        session.close(false).await;
    }
}
