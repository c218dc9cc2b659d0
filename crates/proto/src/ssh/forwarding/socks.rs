//! SOCKS5 engine for dynamic forwarding.
//!
//! A [`SocksProxy`] is the handler behind a dynamically forwarded port. Each
//! accepted connection runs the SOCKS5 exchange (RFC 1928): greeting with the
//! no-authentication method, then a CONNECT request naming the target, after
//! which a `direct-tcpip` channel to that target carries the connection's
//! bytes.
//!
//! The substrate delivers chunks, not streams, so decoding is incremental: a
//! per-session buffer accumulates input until the current phase is complete.
//! Only CONNECT is supported; BIND and UDP-ASSOCIATE are refused.

use crate::ssh::channel::{TunnelChannel, TunnelChannelKind};
use crate::ssh::forwarding::types::TunnelAddr;
use crate::ssh::io::{IoHandler, IoSession};
use crate::ssh::service::ConnectionService;
use async_trait::async_trait;
use skein_platform::{SkeinError, SkeinResult};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

const REPLY_SUCCEEDED: u8 = 0;
const REPLY_CONNECTION_REFUSED: u8 = 5;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 7;

fn reply(code: u8) -> [u8; 10] {
    // Version, code, reserved, then an all-zero IPv4 bind address.
    [SOCKS_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocksPhase {
    Greeting,
    Request,
    Connected,
}

struct SocksConn {
    phase: SocksPhase,
    buf: Vec<u8>,
    channel: Option<Arc<dyn TunnelChannel>>,
}

impl SocksConn {
    fn new() -> Self {
        Self {
            phase: SocksPhase::Greeting,
            buf: Vec::new(),
            channel: None,
        }
    }
}

/// SOCKS5 proxy handler for one dynamically forwarded port.
///
/// Exclusively owned by the binding registry until `stop_dynamic` or
/// forwarder shutdown closes it.
pub struct SocksProxy {
    service: Arc<dyn ConnectionService>,
    conns: Mutex<HashMap<u64, SocksConn>>,
    closed: AtomicBool,
}

impl SocksProxy {
    /// Creates a proxy opening channels through `service`.
    pub fn new(service: Arc<dyn ConnectionService>) -> Self {
        Self {
            service,
            conns: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `true` once the proxy has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every connection's channel and refuses further traffic.
    pub async fn close(&self, immediately: bool) {
        self.closed.store(true, Ordering::Release);
        let conns = std::mem::take(&mut *self.conns.lock().await);
        debug!(connections = conns.len(), "closing SOCKS proxy");
        for (_, conn) in conns {
            if let Some(channel) = conn.channel {
                channel.close(immediately).await;
            }
        }
    }

    /// Consumes the greeting once complete; `Ok(true)` when it was.
    async fn process_greeting(
        conn: &mut SocksConn,
        session: &Arc<dyn IoSession>,
    ) -> SkeinResult<bool> {
        if conn.buf.len() < 2 {
            return Ok(false);
        }
        if conn.buf[0] != SOCKS_VERSION {
            return Err(SkeinError::Protocol(format!(
                "Invalid SOCKS version: expected 5, got {}",
                conn.buf[0]
            )));
        }

        let nmethods = conn.buf[1] as usize;
        if nmethods == 0 {
            return Err(SkeinError::Protocol(
                "No authentication methods provided".to_string(),
            ));
        }
        if conn.buf.len() < 2 + nmethods {
            return Ok(false);
        }

        if !conn.buf[2..2 + nmethods].contains(&METHOD_NO_AUTH) {
            return Err(SkeinError::Protocol(
                "No acceptable authentication method".to_string(),
            ));
        }

        conn.buf.drain(..2 + nmethods);
        session.write(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
        conn.phase = SocksPhase::Request;
        Ok(true)
    }

    /// Decodes the CONNECT request once complete, returning its target.
    fn decode_request(conn: &mut SocksConn) -> SkeinResult<Option<TunnelAddr>> {
        if conn.buf.len() < 4 {
            return Ok(None);
        }
        if conn.buf[0] != SOCKS_VERSION {
            return Err(SkeinError::Protocol(
                "Invalid SOCKS version in request".to_string(),
            ));
        }

        let addr_len = match conn.buf[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                if conn.buf.len() < 5 {
                    return Ok(None);
                }
                1 + conn.buf[4] as usize
            }
            other => {
                return Err(SkeinError::Protocol(format!(
                    "Unsupported SOCKS address type: {}",
                    other
                )))
            }
        };

        let total = 4 + addr_len + 2;
        if conn.buf.len() < total {
            return Ok(None);
        }

        let host = match conn.buf[3] {
            ATYP_IPV4 => {
                Ipv4Addr::new(conn.buf[4], conn.buf[5], conn.buf[6], conn.buf[7]).to_string()
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&conn.buf[4..20]);
                Ipv6Addr::from(octets).to_string()
            }
            _ => {
                let len = conn.buf[4] as usize;
                String::from_utf8(conn.buf[5..5 + len].to_vec()).map_err(|_| {
                    SkeinError::Protocol("Domain name contains invalid UTF-8".to_string())
                })?
            }
        };
        let port = u16::from_be_bytes([conn.buf[total - 2], conn.buf[total - 1]]);

        conn.buf.drain(..total);
        Ok(Some(TunnelAddr::new(host, port)))
    }

    async fn connect_target(
        &self,
        conn: &mut SocksConn,
        session: &Arc<dyn IoSession>,
        target: TunnelAddr,
    ) -> SkeinResult<()> {
        debug!(session = session.id(), %target, "SOCKS CONNECT");

        let channel = self
            .service
            .create_tunnel_channel(TunnelChannelKind::Direct(target), Arc::clone(session));
        self.service.register_channel(Arc::clone(&channel)).await?;

        match channel.open().await {
            Ok(()) => {
                session.write(&reply(REPLY_SUCCEEDED)).await?;
                conn.channel = Some(channel);
                conn.phase = SocksPhase::Connected;
                Ok(())
            }
            Err(e) => {
                warn!(
                    session = session.id(),
                    channel = channel.id(),
                    error = %e,
                    "SOCKS target channel open failed"
                );
                if let Err(err) = session.write(&reply(REPLY_CONNECTION_REFUSED)).await {
                    trace!(session = session.id(), error = %err, "failure reply not delivered");
                }
                if let Err(err) = self.service.unregister_channel(channel.as_ref()).await {
                    debug!(channel = channel.id(), error = %err, "unregister after failed open");
                }
                channel.close(false).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl IoHandler for SocksProxy {
    async fn session_created(&self, session: &Arc<dyn IoSession>) -> SkeinResult<()> {
        if self.is_closed() {
            return Err(SkeinError::State("SOCKS proxy is closed".to_string()));
        }
        trace!(session = session.id(), "SOCKS session accepted");
        self.conns.lock().await.insert(session.id(), SocksConn::new());
        Ok(())
    }

    async fn session_closed(&self, session: &Arc<dyn IoSession>) -> SkeinResult<()> {
        let conn = self.conns.lock().await.remove(&session.id());
        if let Some(conn) = conn {
            if let Some(channel) = conn.channel {
                debug!(
                    session = session.id(),
                    channel = channel.id(),
                    "closing channel for ended SOCKS session"
                );
                channel.close(false).await;
            }
        }
        Ok(())
    }

    async fn message_received(
        &self,
        session: &Arc<dyn IoSession>,
        data: &[u8],
    ) -> SkeinResult<()> {
        let mut conns = self.conns.lock().await;
        let conn = match conns.get_mut(&session.id()) {
            Some(conn) => conn,
            None => {
                trace!(session = session.id(), "data for unknown SOCKS session, dropping");
                return Ok(());
            }
        };
        conn.buf.extend_from_slice(data);

        loop {
            match conn.phase {
                SocksPhase::Greeting => {
                    if !Self::process_greeting(conn, session).await? {
                        return Ok(());
                    }
                }
                SocksPhase::Request => {
                    if conn.buf.len() >= 2 && conn.buf[1] != CMD_CONNECT {
                        session.write(&reply(REPLY_COMMAND_NOT_SUPPORTED)).await?;
                        return Err(SkeinError::Protocol(format!(
                            "Unsupported SOCKS command: {}",
                            conn.buf[1]
                        )));
                    }
                    match Self::decode_request(conn)? {
                        Some(target) => self.connect_target(conn, session, target).await?,
                        None => return Ok(()),
                    }
                }
                SocksPhase::Connected => {
                    if conn.buf.is_empty() {
                        return Ok(());
                    }
                    let payload = std::mem::take(&mut conn.buf);
                    // Connected implies the channel is attached.
                    if let Some(channel) = &conn.channel {
                        channel.send_data(&payload).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn exception_caught(&self, session: &Arc<dyn IoSession>, error: SkeinError) {
        debug!(session = session.id(), error = %error, "SOCKS session error, closing");
        session.close(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::forwarding::testing::{OpenBehavior, TestIoSession, TestService, TestSession};

    fn setup(behavior: OpenBehavior) -> (Arc<TestService>, SocksProxy) {
        let session = Arc::new(TestSession::new());
        let service = Arc::new(TestService::new(session, behavior));
        let proxy = SocksProxy::new(service.clone());
        (service, proxy)
    }

    fn connect_request(host: &str, port: u16) -> Vec<u8> {
        let mut request = vec![5, CMD_CONNECT, 0, ATYP_DOMAIN, host.len() as u8];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        request
    }

    #[tokio::test]
    async fn test_full_connect_exchange() {
        let (service, proxy) = setup(OpenBehavior::Succeed);
        let io = Arc::new(TestIoSession::new(1, 1080));
        let io_dyn: Arc<dyn IoSession> = io.clone();

        proxy.session_created(&io_dyn).await.unwrap();
        proxy
            .message_received(&io_dyn, &[5, 1, METHOD_NO_AUTH])
            .await
            .unwrap();
        assert_eq!(io.written(), vec![5, 0]);

        proxy
            .message_received(&io_dyn, &connect_request("example.net", 443))
            .await
            .unwrap();

        let channel = service.channels().pop().unwrap();
        assert_eq!(
            channel.kind(),
            &TunnelChannelKind::Direct(TunnelAddr::new("example.net", 443))
        );
        // Method selection followed by the success reply.
        assert_eq!(io.written()[2..], reply(REPLY_SUCCEEDED));

        proxy.message_received(&io_dyn, b"GET /").await.unwrap();
        assert_eq!(channel.sent(), b"GET /");
    }

    #[tokio::test]
    async fn test_chunked_delivery() {
        let (service, proxy) = setup(OpenBehavior::Succeed);
        let io = Arc::new(TestIoSession::new(1, 1080));
        let io_dyn: Arc<dyn IoSession> = io.clone();
        proxy.session_created(&io_dyn).await.unwrap();

        // Greeting and request split at awkward boundaries.
        let mut bytes = vec![5, 1, METHOD_NO_AUTH];
        bytes.extend_from_slice(&connect_request("db", 5432));
        for chunk in bytes.chunks(2) {
            proxy.message_received(&io_dyn, chunk).await.unwrap();
        }

        let channel = service.channels().pop().unwrap();
        assert_eq!(
            channel.kind(),
            &TunnelChannelKind::Direct(TunnelAddr::new("db", 5432))
        );
    }

    #[tokio::test]
    async fn test_ipv4_request() {
        let (service, proxy) = setup(OpenBehavior::Succeed);
        let io = Arc::new(TestIoSession::new(1, 1080));
        let io_dyn: Arc<dyn IoSession> = io.clone();
        proxy.session_created(&io_dyn).await.unwrap();
        proxy
            .message_received(&io_dyn, &[5, 1, METHOD_NO_AUTH])
            .await
            .unwrap();

        let mut request = vec![5, CMD_CONNECT, 0, ATYP_IPV4, 10, 0, 0, 1];
        request.extend_from_slice(&80u16.to_be_bytes());
        proxy.message_received(&io_dyn, &request).await.unwrap();

        let channel = service.channels().pop().unwrap();
        assert_eq!(
            channel.kind(),
            &TunnelChannelKind::Direct(TunnelAddr::new("10.0.0.1", 80))
        );
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let (_service, proxy) = setup(OpenBehavior::Succeed);
        let io = Arc::new(TestIoSession::new(1, 1080));
        let io_dyn: Arc<dyn IoSession> = io.clone();
        proxy.session_created(&io_dyn).await.unwrap();

        let result = proxy.message_received(&io_dyn, &[4, 1, 0]).await;
        assert!(matches!(result, Err(SkeinError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_unsupported_command_refused() {
        let (_service, proxy) = setup(OpenBehavior::Succeed);
        let io = Arc::new(TestIoSession::new(1, 1080));
        let io_dyn: Arc<dyn IoSession> = io.clone();
        proxy.session_created(&io_dyn).await.unwrap();
        proxy
            .message_received(&io_dyn, &[5, 1, METHOD_NO_AUTH])
            .await
            .unwrap();

        // BIND is not supported.
        let result = proxy.message_received(&io_dyn, &[5, 2, 0, ATYP_IPV4]).await;
        assert!(result.is_err());
        assert_eq!(io.written()[2..], reply(REPLY_COMMAND_NOT_SUPPORTED));
    }

    #[tokio::test]
    async fn test_failed_channel_open_reports_refused() {
        let (service, proxy) = setup(OpenBehavior::Fail);
        let io = Arc::new(TestIoSession::new(1, 1080));
        let io_dyn: Arc<dyn IoSession> = io.clone();
        proxy.session_created(&io_dyn).await.unwrap();
        proxy
            .message_received(&io_dyn, &[5, 1, METHOD_NO_AUTH])
            .await
            .unwrap();

        let result = proxy
            .message_received(&io_dyn, &connect_request("unreachable", 80))
            .await;
        assert!(result.is_err());
        assert_eq!(io.written()[2..], reply(REPLY_CONNECTION_REFUSED));

        let channel = service.channels().pop().unwrap();
        assert_eq!(service.unregistered(), vec![channel.id()]);
    }

    #[tokio::test]
    async fn test_close_drains_channels() {
        let (service, proxy) = setup(OpenBehavior::Succeed);
        let io = Arc::new(TestIoSession::new(1, 1080));
        let io_dyn: Arc<dyn IoSession> = io.clone();
        proxy.session_created(&io_dyn).await.unwrap();
        proxy
            .message_received(&io_dyn, &[5, 1, METHOD_NO_AUTH])
            .await
            .unwrap();
        proxy
            .message_received(&io_dyn, &connect_request("db", 5432))
            .await
            .unwrap();

        proxy.close(true).await;
        assert!(proxy.is_closed());

        let channel = service.channels().pop().unwrap();
        assert_eq!(channel.closed(), Some(true));

        // New sessions are refused once closed.
        let late: Arc<dyn IoSession> = Arc::new(TestIoSession::new(2, 1080));
        assert!(proxy.session_created(&late).await.is_err());
    }
}
