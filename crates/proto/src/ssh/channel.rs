//! Tunnel channel seam.
//!
//! The forwarding subsystem never drives the SSH channel protocol itself; it
//! opens channels through the [`TunnelChannel`] trait implemented by the
//! channel layer. A channel is created for one accepted TCP session, opened
//! asynchronously, and fed the bytes arriving on that session.

use crate::ssh::forwarding::types::TunnelAddr;
use async_trait::async_trait;
use skein_platform::SkeinResult;
use tokio::sync::watch;

/// Lifecycle state of a tunnel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel open has been initiated but not confirmed.
    Opening,
    /// Channel is open and accepting data.
    Opened,
    /// Channel close has been initiated.
    Closing,
    /// Channel is closed.
    Closed,
}

/// Which SSH channel type a tunnel channel opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelChannelKind {
    /// `direct-tcpip`: client-side forward with a predefined target.
    Direct(TunnelAddr),
    /// `forwarded-tcpip`: server-originated forward, target chosen by the peer.
    Forwarded,
}

impl TunnelChannelKind {
    /// Returns the SSH channel type name.
    pub fn name(&self) -> &'static str {
        match self {
            TunnelChannelKind::Direct(_) => "direct-tcpip",
            TunnelChannelKind::Forwarded => "forwarded-tcpip",
        }
    }
}

/// A client channel bridging one accepted TCP session to the SSH peer.
///
/// Implemented by the channel layer; consumed by the forwarding bridge
/// handlers. The channel holds the TCP session it was created for and writes
/// returning bytes to it directly.
#[async_trait]
pub trait TunnelChannel: Send + Sync {
    /// Channel identifier within the connection.
    fn id(&self) -> u32;

    /// Initiates the channel open exchange with the peer.
    async fn open(&self) -> SkeinResult<()>;

    /// Waits until the channel reaches [`ChannelState::Opened`] or
    /// [`ChannelState::Closed`], returning the state observed. The wait is
    /// unbounded.
    async fn await_open_or_closed(&self) -> ChannelState;

    /// Writes forwarded bytes into the channel's input sink and flushes.
    async fn send_data(&self, data: &[u8]) -> SkeinResult<()>;

    /// Closes the channel, forcefully when `immediately` is set.
    async fn close(&self, immediately: bool);
}

/// Observable channel state cell for [`TunnelChannel`] implementations.
///
/// Wraps a `tokio::sync::watch` pair so any number of waiters can block on
/// the open/closed transition without polling.
///
/// # Example
///
/// ```rust
/// use skein_proto::ssh::channel::{ChannelState, StateWatch};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let watch = StateWatch::new();
/// let waiter = watch.clone();
/// let task = tokio::spawn(async move { waiter.wait_open_or_closed().await });
///
/// watch.set(ChannelState::Opened);
/// assert_eq!(task.await.unwrap(), ChannelState::Opened);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StateWatch {
    tx: watch::Sender<ChannelState>,
    rx: watch::Receiver<ChannelState>,
}

impl StateWatch {
    /// Creates a watch starting in [`ChannelState::Opening`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ChannelState::Opening);
        Self { tx, rx }
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        *self.rx.borrow()
    }

    /// Publishes a state transition to all waiters.
    pub fn set(&self, state: ChannelState) {
        // send only fails when every receiver is gone; we always hold one.
        let _ = self.tx.send(state);
    }

    /// Waits until the state is `Opened` or `Closed` and returns it.
    pub async fn wait_open_or_closed(&self) -> ChannelState {
        let mut rx = self.rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ChannelState::Opened | ChannelState::Closed => return state,
                ChannelState::Opening | ChannelState::Closing => {}
            }
            if rx.changed().await.is_err() {
                // Sender dropped mid-transition; report the terminal state.
                return ChannelState::Closed;
            }
        }
    }
}

impl Default for StateWatch {
    fn default() -> Self {
        Self::new()
    }
}
