//! `tokio` implementation of the I/O substrate.
//!
//! [`TokioAcceptor`] runs one accept loop per bound address and one read task
//! per accepted connection. The read task awaits each `message_received`
//! delivery before reading again, which gives the per-session FIFO ordering
//! the bridge handlers rely on.

use crate::ssh::io::{IoAcceptor, IoHandler, IoServiceFactory, IoSession};
use async_trait::async_trait;
use skein_platform::{SkeinError, SkeinResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Factory producing [`TokioAcceptor`] instances.
#[derive(Debug, Default)]
pub struct TokioIoServiceFactory;

impl TokioIoServiceFactory {
    /// Creates the factory.
    pub fn new() -> Self {
        Self
    }
}

impl IoServiceFactory for TokioIoServiceFactory {
    fn create_acceptor(&self) -> Arc<dyn IoAcceptor> {
        Arc::new(TokioAcceptor::new())
    }
}

/// Session bookkeeping shared between the acceptor and its spawned tasks.
struct AcceptorShared {
    sessions: Mutex<HashMap<u64, Arc<TokioIoSession>>>,
    next_session_id: AtomicU64,
}

impl AcceptorShared {
    fn allocate_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct Binding {
    accept_task: JoinHandle<()>,
}

/// TCP acceptor over `tokio::net::TcpListener`.
pub struct TokioAcceptor {
    bindings: Mutex<HashMap<SocketAddr, Binding>>,
    shared: Arc<AcceptorShared>,
    closed: AtomicBool,
}

impl TokioAcceptor {
    /// Creates an acceptor with no bound addresses.
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            shared: Arc::new(AcceptorShared {
                sessions: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
            }),
            closed: AtomicBool::new(false),
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        bound: SocketAddr,
        handler: Arc<dyn IoHandler>,
        shared: Arc<AcceptorShared>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    trace!(%bound, %peer, "accepted connection");
                    let handler = Arc::clone(&handler);
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        Self::run_session(stream, peer, handler, shared).await;
                    });
                }
                Err(e) => {
                    warn!(%bound, error = %e, "accept failed, stopping listener");
                    break;
                }
            }
        }
    }

    async fn run_session(
        stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn IoHandler>,
        shared: Arc<AcceptorShared>,
    ) {
        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(%peer, error = %e, "no local address for accepted stream");
                return;
            }
        };

        let id = shared.allocate_session_id();
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(TokioIoSession::new(id, local, peer, write_half));
        shared
            .sessions
            .lock()
            .await
            .insert(id, Arc::clone(&session));

        let session_dyn: Arc<dyn IoSession> = Arc::clone(&session) as Arc<dyn IoSession>;
        if let Err(e) = handler.session_created(&session_dyn).await {
            handler.exception_caught(&session_dyn, e).await;
        }

        Self::read_loop(read_half, &session, &session_dyn, handler.as_ref()).await;

        session.close(false).await;
        shared.sessions.lock().await.remove(&id);
        if let Err(e) = handler.session_closed(&session_dyn).await {
            debug!(session = id, error = %e, "session_closed callback failed");
        }
    }

    async fn read_loop(
        mut read_half: OwnedReadHalf,
        session: &Arc<TokioIoSession>,
        session_dyn: &Arc<dyn IoSession>,
        handler: &dyn IoHandler,
    ) {
        let mut closed_rx = session.closed_rx();
        // The handler may have closed the session before this task started.
        if *closed_rx.borrow_and_update() {
            return;
        }
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = closed_rx.changed() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = handler.message_received(session_dyn, &buf[..n]).await {
                            handler.exception_caught(session_dyn, e).await;
                        }
                    }
                    Err(e) => {
                        handler.exception_caught(session_dyn, SkeinError::Io(e)).await;
                        break;
                    }
                },
            }
        }
    }
}

impl Default for TokioAcceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IoAcceptor for TokioAcceptor {
    async fn bind(&self, addr: SocketAddr, handler: Arc<dyn IoHandler>) -> SkeinResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SkeinError::State("acceptor is closed".to_string()));
        }

        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        debug!(requested = %addr, %bound, "listener bound");

        let shared = Arc::clone(&self.shared);
        let accept_task =
            tokio::spawn(
                async move { Self::accept_loop(listener, bound, handler, shared).await },
            );

        self.bindings
            .lock()
            .await
            .insert(bound, Binding { accept_task });
        Ok(())
    }

    async fn unbind(&self, addr: SocketAddr) -> SkeinResult<()> {
        match self.bindings.lock().await.remove(&addr) {
            Some(binding) => {
                binding.accept_task.abort();
                debug!(%addr, "listener unbound");
            }
            None => debug!(%addr, "unbind: no listener on address"),
        }
        Ok(())
    }

    async fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.bindings.lock().await.keys().copied().collect()
    }

    async fn close(&self, immediately: bool) -> SkeinResult<()> {
        self.closed.store(true, Ordering::Release);

        let bindings = std::mem::take(&mut *self.bindings.lock().await);
        for binding in bindings.into_values() {
            binding.accept_task.abort();
        }

        let sessions = std::mem::take(&mut *self.shared.sessions.lock().await);
        for session in sessions.into_values() {
            session.close(immediately).await;
        }
        Ok(())
    }
}

/// One accepted connection; the write half lives here, the read half in the
/// session's read task.
pub struct TokioIoSession {
    id: u64,
    local: SocketAddr,
    peer: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed_tx: watch::Sender<bool>,
}

impl TokioIoSession {
    fn new(id: u64, local: SocketAddr, peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            local,
            peer,
            writer: Mutex::new(Some(writer)),
            closed_tx,
        }
    }

    fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

#[async_trait]
impl IoSession for TokioIoSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn local_address(&self) -> SocketAddr {
        self.local
    }

    fn remote_address(&self) -> SocketAddr {
        self.peer
    }

    async fn write(&self, data: &[u8]) -> SkeinResult<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => {
                writer.write_all(data).await?;
                writer.flush().await?;
                Ok(())
            }
            None => Err(SkeinError::State("session is closed".to_string())),
        }
    }

    async fn close(&self, immediately: bool) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if !immediately {
                if let Err(e) = writer.shutdown().await {
                    trace!(session = self.id, error = %e, "shutdown on close failed");
                }
            }
        }
        let _ = self.closed_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingHandler {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl IoHandler for RecordingHandler {
        async fn session_created(&self, _session: &Arc<dyn IoSession>) -> SkeinResult<()> {
            self.push("created".to_string());
            Ok(())
        }

        async fn session_closed(&self, _session: &Arc<dyn IoSession>) -> SkeinResult<()> {
            self.push("closed".to_string());
            Ok(())
        }

        async fn message_received(
            &self,
            session: &Arc<dyn IoSession>,
            data: &[u8],
        ) -> SkeinResult<()> {
            self.push(format!("data:{}", String::from_utf8_lossy(data)));
            // Echo so tests can confirm the write path.
            session.write(data).await
        }

        async fn exception_caught(&self, _session: &Arc<dyn IoSession>, error: SkeinError) {
            self.push(format!("error:{}", error));
        }
    }

    async fn bind_local(acceptor: &TokioAcceptor, handler: Arc<dyn IoHandler>) -> SocketAddr {
        acceptor
            .bind("127.0.0.1:0".parse().unwrap(), handler)
            .await
            .unwrap();
        acceptor.bound_addresses().await[0]
    }

    #[tokio::test]
    async fn test_bind_resolves_ephemeral_port() {
        let acceptor = TokioAcceptor::new();
        let handler = Arc::new(RecordingHandler::default());
        let bound = bind_local(&acceptor, handler).await;
        assert_ne!(bound.port(), 0);

        acceptor.unbind(bound).await.unwrap();
        assert!(acceptor.bound_addresses().await.is_empty());
    }

    #[tokio::test]
    async fn test_session_callbacks_in_order() {
        let acceptor = TokioAcceptor::new();
        let handler = Arc::new(RecordingHandler::default());
        let bound = bind_local(&acceptor, handler.clone()).await;

        let mut client = TcpStream::connect(bound).await.unwrap();
        client.write_all(b"one").await.unwrap();
        client.flush().await.unwrap();

        let mut echoed = [0u8; 3];
        timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"one");

        drop(client);
        timeout(Duration::from_secs(5), async {
            while !handler.events().contains(&"closed".to_string()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let events = handler.events();
        assert_eq!(events[0], "created");
        assert_eq!(events[1], "data:one");
        assert_eq!(events.last().unwrap(), "closed");
    }

    #[tokio::test]
    async fn test_unbind_stops_accepting() {
        let acceptor = TokioAcceptor::new();
        let handler = Arc::new(RecordingHandler::default());
        let bound = bind_local(&acceptor, handler).await;

        acceptor.unbind(bound).await.unwrap();
        // The listener socket is gone once the accept task is dropped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(bound).await.is_err());
    }

    #[tokio::test]
    async fn test_close_rejects_further_binds() {
        let acceptor = TokioAcceptor::new();
        acceptor.close(true).await.unwrap();

        let handler: Arc<dyn IoHandler> = Arc::new(RecordingHandler::default());
        let result = acceptor.bind("127.0.0.1:0".parse().unwrap(), handler).await;
        assert!(matches!(result, Err(SkeinError::State(_))));
    }
}
