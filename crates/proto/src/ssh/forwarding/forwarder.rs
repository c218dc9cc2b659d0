//! TCP/IP port forwarder facade.
//!
//! [`TcpipForwarder`] owns every forwarding concern of one session: the
//! binding registry, the shared acceptor, the bridge and SOCKS handlers, and
//! the lifecycle listeners. All mutating operations are serialized by a
//! single facade monitor; the bind/registry sequence of each operation is
//! atomic with respect to every other.
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
//! // Forward localhost:8080 to database.internal:5432 through the session
//! let bound = forwarder
//!     .start_local_port_forwarding(
//!         &TunnelAddr::new("127.0.0.1", 8080),
//!         &TunnelAddr::new("database.internal", 5432),
//!     )
//!     .await?;
//! println!("listening on {}", bound);
//! # Ok(())
//! # }
//! ```

use super::error::{Error, Result};
use super::events::{ListenerSet, PortForwardingListener};
use super::handler::BridgeIoHandler;
use super::registry::BindingRegistry;
use super::socks::SocksProxy;
use super::types::{LocalForwardingEntry, TunnelAddr};
use crate::ssh::io::{IoAcceptor, IoHandler};
use crate::ssh::message::MessageType;
use crate::ssh::service::{ConnectionService, Session};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Session property naming the reply timeout (milliseconds) for the
/// `tcpip-forward` global request.
pub const FORWARD_REQUEST_TIMEOUT: &str = "tcpip-forward-request-timeout";

/// Default for [`FORWARD_REQUEST_TIMEOUT`] when the property is unset.
pub const DEFAULT_FORWARD_REQUEST_TIMEOUT: Duration = Duration::from_millis(15_000);

/// State guarded by the facade monitor.
struct FacadeState {
    acceptor: Option<Arc<dyn IoAcceptor>>,
}

/// Port forwarding facade for one SSH session.
pub struct TcpipForwarder {
    service: Arc<dyn ConnectionService>,
    session: Arc<dyn Session>,
    registry: Arc<BindingRegistry>,
    listeners: ListenerSet,
    bridge: Arc<BridgeIoHandler>,
    monitor: Mutex<FacadeState>,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl TcpipForwarder {
    /// Creates a forwarder for the service's session.
    pub fn new(service: Arc<dyn ConnectionService>) -> Self {
        let session = service.session();
        let registry = Arc::new(BindingRegistry::new());
        let bridge = Arc::new(BridgeIoHandler::new(
            Arc::clone(&service),
            Arc::clone(&registry),
        ));
        Self {
            service,
            session,
            registry,
            listeners: ListenerSet::new(),
            bridge,
            monitor: Mutex::new(FacadeState { acceptor: None }),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a lifecycle listener.
    pub fn add_listener(&self, listener: Arc<dyn PortForwardingListener>) {
        self.listeners.add(listener);
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, listener: &Arc<dyn PortForwardingListener>) {
        self.listeners.remove(listener);
    }

    /// Returns `true` once the forwarder is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` while shutdown is in progress.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) && !self.is_closed()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::State("forwarder is closed".to_string()));
        }
        if self.is_closing() {
            return Err(Error::State("forwarder is closing".to_string()));
        }
        Ok(())
    }

    fn forward_request_timeout(&self) -> Duration {
        self.session
            .int_property(FORWARD_REQUEST_TIMEOUT)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FORWARD_REQUEST_TIMEOUT)
    }

    /// Starts a local forward: connections accepted on `local` are tunneled
    /// to `remote` on the peer's side.
    ///
    /// Returns the resolved bound address; with `local.port == 0` its port is
    /// the one the OS assigned.
    pub async fn start_local_port_forwarding(
        &self,
        local: &TunnelAddr,
        remote: &TunnelAddr,
    ) -> Result<TunnelAddr> {
        let mut state = self.monitor.lock().await;
        self.check_open()?;

        self.listeners.broadcast(|l| {
            l.establishing_explicit_tunnel(self.session.as_ref(), local, Some(remote), true)
        });

        let outcome = self.bind_local(&mut state, local, remote).await;
        match outcome {
            Ok(bound) => {
                debug!(%local, %remote, %bound, "local port forwarding started");
                self.listeners.broadcast(|l| {
                    l.established_explicit_tunnel(
                        self.session.as_ref(),
                        local,
                        Some(remote),
                        true,
                        Some(&bound),
                        None,
                    )
                });
                Ok(bound)
            }
            Err(e) => {
                // A duplicate means the port belongs to a live tunnel; the
                // by-port defensive stop would tear that tunnel down.
                if !matches!(e, Error::DuplicateBinding { .. }) {
                    if let Err(err) = self.stop_local_locked(&mut state, local).await {
                        warn!(%local, error = %err, "cleanup after failed local forward");
                    }
                }
                self.listeners.broadcast(|l| {
                    l.established_explicit_tunnel(
                        self.session.as_ref(),
                        local,
                        Some(remote),
                        true,
                        None,
                        Some(&e),
                    )
                });
                Err(e)
            }
        }
    }

    fn check_port_free(&self, local: &TunnelAddr) -> Result<()> {
        if local.port() != 0 {
            if let Some(mode) = self.registry.mode_of(local.port()) {
                return Err(Error::DuplicateBinding {
                    mode,
                    port: local.port(),
                });
            }
        }
        Ok(())
    }

    async fn bind_local(
        &self,
        state: &mut FacadeState,
        local: &TunnelAddr,
        remote: &TunnelAddr,
    ) -> Result<TunnelAddr> {
        self.check_port_free(local)?;
        let handler: Arc<dyn IoHandler> = self.bridge.clone();
        let bound = self.do_bind(state, local, handler).await?;
        if let Err(e) = self.registry.insert_local(bound.port(), remote.clone()) {
            self.unbind_quietly(state, &TunnelAddr::from(bound)).await;
            return Err(e);
        }
        Ok(TunnelAddr::from(bound))
    }

    /// Stops the local forward on `local.port` and unbinds its listener.
    pub async fn stop_local_port_forwarding(&self, local: &TunnelAddr) -> Result<()> {
        let mut state = self.monitor.lock().await;
        self.stop_local_locked(&mut state, local).await
    }

    async fn stop_local_locked(&self, state: &mut FacadeState, local: &TunnelAddr) -> Result<()> {
        let removed = self.registry.remove_local(local.port());
        let acceptor = state.acceptor.clone();
        let (remote, acceptor) = match (removed, acceptor) {
            (Some(remote), Some(acceptor)) => (remote, acceptor),
            _ => {
                debug!(%local, "no local forwarding to stop");
                return Ok(());
            }
        };

        debug!(%local, %remote, "stopping local port forwarding");
        self.listeners
            .broadcast(|l| l.tearing_down_explicit_tunnel(self.session.as_ref(), local, true));

        let result = self.unbind(&acceptor, local).await;
        match result {
            Ok(()) => {
                self.listeners.broadcast(|l| {
                    l.torn_down_explicit_tunnel(self.session.as_ref(), local, true, None)
                });
                Ok(())
            }
            Err(e) => {
                self.listeners.broadcast(|l| {
                    l.torn_down_explicit_tunnel(self.session.as_ref(), local, true, Some(&e))
                });
                Err(e)
            }
        }
    }

    /// Asks the peer to listen on `remote` and tunnel connections back to
    /// `local`.
    ///
    /// Sends the `tcpip-forward` global request and waits for the reply,
    /// bounded by [`FORWARD_REQUEST_TIMEOUT`]. With `remote.port == 0` the
    /// peer assigns the port and reports it in the reply.
    pub async fn start_remote_port_forwarding(
        &self,
        remote: &TunnelAddr,
        local: &TunnelAddr,
    ) -> Result<TunnelAddr> {
        let _state = self.monitor.lock().await;

        self.listeners.broadcast(|l| {
            l.establishing_explicit_tunnel(self.session.as_ref(), local, Some(remote), false)
        });

        let outcome = self.request_remote(remote, local).await;
        match outcome {
            Ok(bound) => {
                debug!(%remote, %local, %bound, "remote port forwarding started");
                self.listeners.broadcast(|l| {
                    l.established_explicit_tunnel(
                        self.session.as_ref(),
                        local,
                        Some(remote),
                        false,
                        Some(&bound),
                        None,
                    )
                });
                Ok(bound)
            }
            Err(e) => {
                if !matches!(e, Error::DuplicateBinding { .. }) {
                    if let Err(err) = self.stop_remote_locked(remote).await {
                        warn!(%remote, error = %err, "cleanup after failed remote forward");
                    }
                }
                self.listeners.broadcast(|l| {
                    l.established_explicit_tunnel(
                        self.session.as_ref(),
                        local,
                        Some(remote),
                        false,
                        None,
                        Some(&e),
                    )
                });
                Err(e)
            }
        }
    }

    async fn request_remote(&self, remote: &TunnelAddr, local: &TunnelAddr) -> Result<TunnelAddr> {
        let remote_host = remote.host();
        let remote_port = remote.port();

        let mut buffer = self
            .session
            .create_buffer(MessageType::GlobalRequest, remote_host.len() + 32);
        buffer.put_string("tcpip-forward");
        buffer.put_bool(true); // want reply
        buffer.put_string(remote_host);
        buffer.put_u32(u32::from(remote_port));

        let timeout = self.forward_request_timeout();
        let reply = self
            .session
            .request("tcpip-forward", buffer, timeout)
            .await
            .map_err(Error::from)?;
        let mut reply = reply.ok_or_else(|| {
            Error::RequestDenied("tcpip forwarding request denied by server".to_string())
        })?;

        let port = if remote_port == 0 {
            let assigned = reply.get_u32().map_err(Error::from)?;
            u16::try_from(assigned)
                .map_err(|_| Error::Protocol(format!("Assigned port out of range: {}", assigned)))?
        } else {
            remote_port
        };

        // The mapping appears only after the reply; a forwarded-tcpip open
        // racing the reply finds no entry here.
        self.registry.insert_remote(port, local.clone())?;
        Ok(TunnelAddr::new(remote_host, port))
    }

    /// Cancels the remote forward on `remote.port`.
    ///
    /// The `cancel-tcpip-forward` request is fire-and-forget; the mapping is
    /// removed regardless of delivery.
    pub async fn stop_remote_port_forwarding(&self, remote: &TunnelAddr) -> Result<()> {
        let _state = self.monitor.lock().await;
        self.stop_remote_locked(remote).await
    }

    async fn stop_remote_locked(&self, remote: &TunnelAddr) -> Result<()> {
        let target = match self.registry.remove_remote(remote.port()) {
            Some(target) => target,
            None => {
                debug!(%remote, "no remote forwarding to stop");
                return Ok(());
            }
        };

        debug!(%remote, %target, "cancelling remote port forwarding");
        let remote_host = remote.host();
        let mut buffer = self
            .session
            .create_buffer(MessageType::GlobalRequest, remote_host.len() + 32);
        buffer.put_string("cancel-tcpip-forward");
        buffer.put_bool(false); // want reply
        buffer.put_string(remote_host);
        buffer.put_u32(u32::from(remote.port()));

        self.listeners
            .broadcast(|l| l.tearing_down_explicit_tunnel(self.session.as_ref(), remote, false));

        match self.session.write_packet(buffer).await.map_err(Error::from) {
            Ok(()) => {
                self.listeners.broadcast(|l| {
                    l.torn_down_explicit_tunnel(self.session.as_ref(), remote, false, None)
                });
                Ok(())
            }
            Err(e) => {
                self.listeners.broadcast(|l| {
                    l.torn_down_explicit_tunnel(self.session.as_ref(), remote, false, Some(&e))
                });
                Err(e)
            }
        }
    }

    /// Starts a dynamic (SOCKS5) forward on `local`.
    pub async fn start_dynamic_port_forwarding(&self, local: &TunnelAddr) -> Result<TunnelAddr> {
        let mut state = self.monitor.lock().await;
        self.check_open()?;

        let proxy = Arc::new(SocksProxy::new(Arc::clone(&self.service)));

        self.listeners
            .broadcast(|l| l.establishing_dynamic_tunnel(self.session.as_ref(), local));

        let outcome = self.bind_dynamic(&mut state, local, proxy).await;
        match outcome {
            Ok(bound) => {
                info!(%local, %bound, "dynamic port forwarding started");
                self.listeners.broadcast(|l| {
                    l.established_dynamic_tunnel(self.session.as_ref(), local, Some(&bound), None)
                });
                Ok(bound)
            }
            Err(e) => {
                if !matches!(e, Error::DuplicateBinding { .. }) {
                    if let Err(err) = self.stop_dynamic_locked(&mut state, local).await {
                        warn!(%local, error = %err, "cleanup after failed dynamic forward");
                    }
                }
                self.listeners.broadcast(|l| {
                    l.established_dynamic_tunnel(self.session.as_ref(), local, None, Some(&e))
                });
                Err(e)
            }
        }
    }

    async fn bind_dynamic(
        &self,
        state: &mut FacadeState,
        local: &TunnelAddr,
        proxy: Arc<SocksProxy>,
    ) -> Result<TunnelAddr> {
        self.check_port_free(local)?;
        let handler: Arc<dyn IoHandler> = proxy.clone();
        let bound = self.do_bind(state, local, handler).await?;
        if let Err(e) = self.registry.insert_dynamic(bound.port(), proxy) {
            self.unbind_quietly(state, &TunnelAddr::from(bound)).await;
            return Err(e);
        }
        Ok(TunnelAddr::from(bound))
    }

    /// Stops the dynamic forward on `local.port`: closes its SOCKS proxy,
    /// then unbinds the listener.
    pub async fn stop_dynamic_port_forwarding(&self, local: &TunnelAddr) -> Result<()> {
        let mut state = self.monitor.lock().await;
        self.stop_dynamic_locked(&mut state, local).await
    }

    async fn stop_dynamic_locked(&self, state: &mut FacadeState, local: &TunnelAddr) -> Result<()> {
        let proxy = match self.registry.remove_dynamic(local.port()) {
            Some(proxy) => proxy,
            None => {
                debug!(%local, "no dynamic forwarding to stop");
                return Ok(());
            }
        };

        debug!(%local, "stopping dynamic port forwarding");
        self.listeners
            .broadcast(|l| l.tearing_down_dynamic_tunnel(self.session.as_ref(), local));

        let result: Result<()> = async {
            proxy.close(true).await;
            if let Some(acceptor) = state.acceptor.clone() {
                self.unbind(&acceptor, local).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.listeners
                    .broadcast(|l| l.torn_down_dynamic_tunnel(self.session.as_ref(), local, None));
                Ok(())
            }
            Err(e) => {
                self.listeners.broadcast(|l| {
                    l.torn_down_dynamic_tunnel(self.session.as_ref(), local, Some(&e))
                });
                Err(e)
            }
        }
    }

    /// The local target of an active remote forward on `remote_port`, if any.
    pub fn get_forwarded_port(&self, remote_port: u16) -> Option<TunnelAddr> {
        self.registry.lookup_remote(remote_port)
    }

    /// Handles a peer's `tcpip-forward` request to listen on `local`.
    ///
    /// Consults the session's forwarding filter; a missing filter or a clean
    /// denial yields `Ok(None)` so the caller can refuse the global request.
    /// On success the resolved bound address is returned and recorded.
    pub async fn local_port_forwarding_requested(
        &self,
        local: &TunnelAddr,
    ) -> Result<Option<TunnelAddr>> {
        let mut state = self.monitor.lock().await;

        match self.session.forwarding_filter() {
            None => {
                debug!(%local, "local port forwarding request rejected: no filter installed");
                return Ok(None);
            }
            Some(filter) => match filter.can_listen(local, self.session.as_ref()) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(%local, "local port forwarding request rejected by filter");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(%local, error = %e, "failed to consult forwarding filter");
                    return Err(Error::Filter(e.to_string()));
                }
            },
        }

        self.listeners.broadcast(|l| {
            l.establishing_explicit_tunnel(self.session.as_ref(), local, None, true)
        });

        let outcome = self.bind_requested(&mut state, local).await;
        match outcome {
            Ok(result) => {
                debug!(%local, %result, "local port forwarding request accepted");
                self.listeners.broadcast(|l| {
                    l.established_explicit_tunnel(
                        self.session.as_ref(),
                        local,
                        None,
                        true,
                        Some(&result),
                        None,
                    )
                });
                Ok(Some(result))
            }
            Err(e) => {
                if let Err(err) = self.cancel_requested_locked(&mut state, local).await {
                    warn!(%local, error = %err, "cleanup after failed local forwarding request");
                }
                self.listeners.broadcast(|l| {
                    l.established_explicit_tunnel(
                        self.session.as_ref(),
                        local,
                        None,
                        true,
                        None,
                        Some(&e),
                    )
                });
                Err(e)
            }
        }
    }

    async fn bind_requested(
        &self,
        state: &mut FacadeState,
        local: &TunnelAddr,
    ) -> Result<TunnelAddr> {
        let handler: Arc<dyn IoHandler> = self.bridge.clone();
        let bound = self.do_bind(state, local, handler).await?;
        let result = TunnelAddr::from(bound);

        // The bound host goes first so later lookups match it.
        let entry = LocalForwardingEntry::new(result.host(), local.host(), result.port());
        if !self.registry.add_local_forward(entry) {
            return Err(Error::Bind(format!(
                "Failed to add local port forwarding entry for {} -> {}",
                local, result
            )));
        }
        Ok(result)
    }

    /// Handles a peer's `cancel-tcpip-forward` for `local`, matching the
    /// recorded entry by either its bound or requested host.
    pub async fn local_port_forwarding_cancelled(&self, local: &TunnelAddr) -> Result<()> {
        let mut state = self.monitor.lock().await;
        self.cancel_requested_locked(&mut state, local).await
    }

    async fn cancel_requested_locked(
        &self,
        state: &mut FacadeState,
        local: &TunnelAddr,
    ) -> Result<()> {
        let entry = self
            .registry
            .remove_local_forward(local.host(), local.port());
        let acceptor = state.acceptor.clone();
        let (entry, acceptor) = match (entry, acceptor) {
            (Some(entry), Some(acceptor)) => (entry, acceptor),
            _ => {
                debug!(%local, "no accepted local forwarding to cancel");
                return Ok(());
            }
        };

        debug!(%local, %entry, "cancelling accepted local forwarding");
        let bound = TunnelAddr::new(entry.bound_host(), entry.port());
        self.listeners
            .broadcast(|l| l.tearing_down_explicit_tunnel(self.session.as_ref(), &bound, true));

        match self.unbind(&acceptor, &bound).await {
            Ok(()) => {
                self.listeners.broadcast(|l| {
                    l.torn_down_explicit_tunnel(self.session.as_ref(), &bound, true, None)
                });
                Ok(())
            }
            Err(e) => {
                self.listeners.broadcast(|l| {
                    l.torn_down_explicit_tunnel(self.session.as_ref(), &bound, true, Some(&e))
                });
                Err(e)
            }
        }
    }

    /// Closes the forwarder: every SOCKS proxy in parallel (forcefully),
    /// then the shared acceptor. Subsequent operations are rejected.
    pub async fn close(&self, immediately: bool) -> Result<()> {
        let mut state = self.monitor.lock().await;
        if self.is_closed() {
            return Ok(());
        }
        self.close_locked(&mut state, immediately).await
    }

    async fn close_locked(&self, state: &mut FacadeState, immediately: bool) -> Result<()> {
        debug!("closing port forwarder");
        self.closing.store(true, Ordering::Release);

        let mut closers = Vec::new();
        for (port, proxy) in self.registry.drain_dynamic() {
            closers.push(tokio::spawn(async move {
                proxy.close(true).await;
                port
            }));
        }
        for closer in closers {
            match closer.await {
                Ok(port) => debug!(port, "SOCKS proxy closed"),
                Err(e) => warn!(error = %e, "SOCKS proxy close task failed"),
            }
        }

        let result = match state.acceptor.take() {
            Some(acceptor) => acceptor.close(immediately).await.map_err(Error::from),
            None => Ok(()),
        };
        self.closed.store(true, Ordering::Release);
        info!("port forwarder closed");
        result
    }

    /// Binds `addr` on the shared acceptor, creating the acceptor on first
    /// use, and returns the resolved bound address.
    async fn do_bind(
        &self,
        state: &mut FacadeState,
        addr: &TunnelAddr,
        handler: Arc<dyn IoHandler>,
    ) -> Result<SocketAddr> {
        let acceptor = match &state.acceptor {
            Some(acceptor) => Arc::clone(acceptor),
            None => {
                let factory = self.session.io_service_factory();
                let acceptor = factory.create_acceptor();
                state.acceptor = Some(Arc::clone(&acceptor));
                acceptor
            }
        };

        // The acceptor does not report which address a single bind resolved
        // to, so the new address is recovered by set difference. Safe only
        // because the facade monitor serializes binds.
        // TODO: return the resolved address from bind itself so the
        // difference (and its concurrency caveat) can go away.
        let before: HashSet<SocketAddr> = acceptor.bound_addresses().await.into_iter().collect();

        let outcome: Result<SocketAddr> = async {
            let native = addr.resolve().await?;
            acceptor
                .bind(native, handler)
                .await
                .map_err(Error::from)?;

            let after: HashSet<SocketAddr> =
                acceptor.bound_addresses().await.into_iter().collect();
            let mut fresh = after.difference(&before);
            let bound = fresh.next().copied().ok_or_else(|| {
                Error::Bind(format!("Error binding to {}: no local addresses bound", addr))
            })?;
            if fresh.next().is_some() {
                return Err(Error::Bind(format!(
                    "Multiple local addresses have been bound for {}",
                    addr
                )));
            }
            Ok(bound)
        }
        .await;

        match outcome {
            Ok(bound) => Ok(bound),
            Err(e) => {
                if acceptor.bound_addresses().await.is_empty() {
                    if let Err(err) = self.close_locked(state, true).await {
                        warn!(error = %err, "cleanup close after failed bind");
                    }
                }
                Err(e)
            }
        }
    }

    async fn unbind(&self, acceptor: &Arc<dyn IoAcceptor>, addr: &TunnelAddr) -> Result<()> {
        let native = addr.resolve().await?;
        acceptor.unbind(native).await.map_err(Error::from)
    }

    /// Unwinds a fresh bind whose registry insert was refused; nothing else
    /// of the operation exists yet.
    async fn unbind_quietly(&self, state: &FacadeState, addr: &TunnelAddr) {
        if let Some(acceptor) = state.acceptor.clone() {
            if let Err(e) = self.unbind(&acceptor, addr).await {
                warn!(%addr, error = %e, "failed to unbind after aborted forward");
            }
        }
    }
}
