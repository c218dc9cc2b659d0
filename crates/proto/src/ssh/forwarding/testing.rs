//! Test doubles shared by the forwarding unit tests.

use super::events::PortForwardingListener;
use super::types::TunnelAddr;
use crate::ssh::buffer::Buffer;
use crate::ssh::channel::{ChannelState, StateWatch, TunnelChannel, TunnelChannelKind};
use crate::ssh::io::{IoServiceFactory, IoSession, TokioIoServiceFactory};
use crate::ssh::service::{ConnectionService, ForwardingFilter, Session};
use async_trait::async_trait;
use skein_platform::{SkeinError, SkeinResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory stand-in for an accepted TCP session.
pub(crate) struct TestIoSession {
    id: u64,
    local: SocketAddr,
    peer: SocketAddr,
    written: Mutex<Vec<u8>>,
    closed: Mutex<Option<bool>>,
}

impl TestIoSession {
    pub(crate) fn new(id: u64, local_port: u16) -> Self {
        Self {
            id,
            local: format!("127.0.0.1:{}", local_port).parse().unwrap(),
            peer: "127.0.0.1:54321".parse().unwrap(),
            written: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
        }
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn closed(&self) -> Option<bool> {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl IoSession for TestIoSession {
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
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn close(&self, immediately: bool) {
        *self.closed.lock().unwrap() = Some(immediately);
    }
}

/// How a [`TestChannel`] behaves when opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenBehavior {
    /// `open()` succeeds and the channel transitions to `Opened`.
    Succeed,
    /// `open()` fails and the channel transitions to `Closed`.
    Fail,
    /// `open()` returns but the test drives the state watch itself.
    Manual,
}

/// Recording tunnel channel.
pub(crate) struct TestChannel {
    id: u32,
    kind: TunnelChannelKind,
    state: StateWatch,
    behavior: OpenBehavior,
    sent: Mutex<Vec<u8>>,
    closed: Mutex<Option<bool>>,
}

impl TestChannel {
    pub(crate) fn kind(&self) -> &TunnelChannelKind {
        &self.kind
    }

    pub(crate) fn state_watch(&self) -> StateWatch {
        self.state.clone()
    }

    pub(crate) fn sent(&self) -> Vec<u8> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn closed(&self) -> Option<bool> {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl TunnelChannel for TestChannel {
    fn id(&self) -> u32 {
        self.id
    }

    async fn open(&self) -> SkeinResult<()> {
        match self.behavior {
            OpenBehavior::Succeed => {
                self.state.set(ChannelState::Opened);
                Ok(())
            }
            OpenBehavior::Fail => {
                self.state.set(ChannelState::Closed);
                Err(SkeinError::Protocol("channel open rejected".to_string()))
            }
            OpenBehavior::Manual => Ok(()),
        }
    }

    async fn await_open_or_closed(&self) -> ChannelState {
        self.state.wait_open_or_closed().await
    }

    async fn send_data(&self, data: &[u8]) -> SkeinResult<()> {
        self.sent.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn close(&self, immediately: bool) {
        *self.closed.lock().unwrap() = Some(immediately);
        self.state.set(ChannelState::Closed);
    }
}

/// Connection service producing [`TestChannel`]s and recording registrations.
pub(crate) struct TestService {
    session: Arc<TestSession>,
    behavior: OpenBehavior,
    next_channel_id: AtomicU32,
    channels: Mutex<Vec<Arc<TestChannel>>>,
    registered: Mutex<Vec<u32>>,
    unregistered: Mutex<Vec<u32>>,
}

impl TestService {
    pub(crate) fn new(session: Arc<TestSession>, behavior: OpenBehavior) -> Self {
        Self {
            session,
            behavior,
            next_channel_id: AtomicU32::new(1),
            channels: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            unregistered: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn channels(&self) -> Vec<Arc<TestChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub(crate) fn registered(&self) -> Vec<u32> {
        self.registered.lock().unwrap().clone()
    }

    pub(crate) fn unregistered(&self) -> Vec<u32> {
        self.unregistered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionService for TestService {
    fn session(&self) -> Arc<dyn Session> {
        self.session.clone()
    }

    fn create_tunnel_channel(
        &self,
        kind: TunnelChannelKind,
        _io: Arc<dyn IoSession>,
    ) -> Arc<dyn TunnelChannel> {
        let channel = Arc::new(TestChannel {
            id: self.next_channel_id.fetch_add(1, Ordering::Relaxed),
            kind,
            state: StateWatch::new(),
            behavior: self.behavior,
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
        });
        self.channels.lock().unwrap().push(channel.clone());
        channel
    }

    async fn register_channel(&self, channel: Arc<dyn TunnelChannel>) -> SkeinResult<()> {
        self.registered.lock().unwrap().push(channel.id());
        Ok(())
    }

    async fn unregister_channel(&self, channel: &dyn TunnelChannel) -> SkeinResult<()> {
        self.unregistered.lock().unwrap().push(channel.id());
        Ok(())
    }
}

/// Scripted reply for [`TestSession::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestScript {
    /// Reply `Ok(None)` - denied by the server.
    Deny,
    /// Reply with a buffer carrying the assigned port.
    AssignPort(u32),
    /// Reply with an empty success buffer.
    Accept,
    /// Fail the request at the transport level.
    Fail,
}

/// Scripted transport session.
pub(crate) struct TestSession {
    factory: Arc<dyn IoServiceFactory>,
    filter: Mutex<Option<Arc<dyn ForwardingFilter>>>,
    script: Mutex<RequestScript>,
    requests: Mutex<Vec<(String, Vec<u8>)>>,
    timeouts: Mutex<Vec<Duration>>,
    packets: Mutex<Vec<Vec<u8>>>,
    properties: Mutex<HashMap<String, u64>>,
}

impl TestSession {
    pub(crate) fn new() -> Self {
        Self {
            factory: Arc::new(TokioIoServiceFactory::new()),
            filter: Mutex::new(None),
            script: Mutex::new(RequestScript::Accept),
            requests: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            packets: Mutex::new(Vec::new()),
            properties: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_script(&self, script: RequestScript) {
        *self.script.lock().unwrap() = script;
    }

    pub(crate) fn set_filter(&self, filter: Arc<dyn ForwardingFilter>) {
        *self.filter.lock().unwrap() = Some(filter);
    }

    pub(crate) fn set_property(&self, name: &str, value: u64) {
        self.properties.lock().unwrap().insert(name.to_string(), value);
    }

    pub(crate) fn requests(&self) -> Vec<(String, Vec<u8>)> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }

    pub(crate) fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Session for TestSession {
    async fn request(
        &self,
        name: &str,
        payload: Buffer,
        timeout: Duration,
    ) -> SkeinResult<Option<Buffer>> {
        self.requests
            .lock()
            .unwrap()
            .push((name.to_string(), payload.as_slice().to_vec()));
        self.timeouts.lock().unwrap().push(timeout);
        match *self.script.lock().unwrap() {
            RequestScript::Deny => Ok(None),
            RequestScript::AssignPort(port) => {
                let mut reply = Buffer::new();
                reply.put_u32(port);
                Ok(Some(reply))
            }
            RequestScript::Accept => Ok(Some(Buffer::new())),
            RequestScript::Fail => Err(SkeinError::Protocol("transport failure".to_string())),
        }
    }

    async fn write_packet(&self, payload: Buffer) -> SkeinResult<()> {
        self.packets.lock().unwrap().push(payload.as_slice().to_vec());
        Ok(())
    }

    fn int_property(&self, name: &str) -> Option<u64> {
        self.properties.lock().unwrap().get(name).copied()
    }

    fn io_service_factory(&self) -> Arc<dyn IoServiceFactory> {
        self.factory.clone()
    }

    fn forwarding_filter(&self) -> Option<Arc<dyn ForwardingFilter>> {
        self.filter.lock().unwrap().clone()
    }
}

/// Listener recording every callback as a compact tag.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

fn outcome(error: Option<&super::error::Error>) -> &'static str {
    if error.is_some() {
        "err"
    } else {
        "ok"
    }
}

impl PortForwardingListener for RecordingListener {
    fn establishing_explicit_tunnel(
        &self,
        _session: &dyn Session,
        local: &TunnelAddr,
        _remote: Option<&TunnelAddr>,
        local_side: bool,
    ) {
        self.push(format!("establishing:explicit:{}:{}", local, local_side));
    }

    fn established_explicit_tunnel(
        &self,
        _session: &dyn Session,
        local: &TunnelAddr,
        _remote: Option<&TunnelAddr>,
        local_side: bool,
        _bound: Option<&TunnelAddr>,
        error: Option<&super::error::Error>,
    ) {
        self.push(format!(
            "established:explicit:{}:{}:{}",
            local,
            local_side,
            outcome(error)
        ));
    }

    fn tearing_down_explicit_tunnel(
        &self,
        _session: &dyn Session,
        bound: &TunnelAddr,
        local_side: bool,
    ) {
        self.push(format!("tearing:explicit:{}:{}", bound, local_side));
    }

    fn torn_down_explicit_tunnel(
        &self,
        _session: &dyn Session,
        bound: &TunnelAddr,
        local_side: bool,
        error: Option<&super::error::Error>,
    ) {
        self.push(format!(
            "torn:explicit:{}:{}:{}",
            bound,
            local_side,
            outcome(error)
        ));
    }

    fn establishing_dynamic_tunnel(&self, _session: &dyn Session, local: &TunnelAddr) {
        self.push(format!("establishing:dynamic:{}", local));
    }

    fn established_dynamic_tunnel(
        &self,
        _session: &dyn Session,
        local: &TunnelAddr,
        _bound: Option<&TunnelAddr>,
        error: Option<&super::error::Error>,
    ) {
        self.push(format!("established:dynamic:{}:{}", local, outcome(error)));
    }

    fn tearing_down_dynamic_tunnel(&self, _session: &dyn Session, local: &TunnelAddr) {
        self.push(format!("tearing:dynamic:{}", local));
    }

    fn torn_down_dynamic_tunnel(
        &self,
        _session: &dyn Session,
        local: &TunnelAddr,
        error: Option<&super::error::Error>,
    ) {
        self.push(format!("torn:dynamic:{}:{}", local, outcome(error)));
    }
}
