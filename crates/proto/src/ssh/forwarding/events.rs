//! Tunnel lifecycle events.
//!
//! Listeners observe tunnel establishment and teardown. For every tunnel the
//! callbacks arrive in a fixed order: `establishing_*`, `established_*`, and
//! on teardown `tearing_down_*`, `torn_down_*`. The `local_side` flag tells
//! whether the bind side of the tunnel is local (`true`) or on the peer
//! (`false`).
//!
//! Dispatch goes through [`ListenerSet`], a fan-out with no business logic:
//! listeners run in insertion order over a snapshot, and a panicking listener
//! is logged and skipped so it can never affect the forwarder or the other
//! listeners.

use super::error::Error;
use super::types::TunnelAddr;
use crate::ssh::service::Session;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Observer of tunnel lifecycle transitions.
///
/// Every method has an empty default body; implement the ones of interest.
pub trait PortForwardingListener: Send + Sync {
    /// An explicit (local or remote) tunnel is about to be established.
    fn establishing_explicit_tunnel(
        &self,
        _session: &dyn Session,
        _local: &TunnelAddr,
        _remote: Option<&TunnelAddr>,
        _local_side: bool,
    ) {
    }

    /// An explicit tunnel establishment concluded.
    ///
    /// Exactly one of `bound` / `error` is set.
    fn established_explicit_tunnel(
        &self,
        _session: &dyn Session,
        _local: &TunnelAddr,
        _remote: Option<&TunnelAddr>,
        _local_side: bool,
        _bound: Option<&TunnelAddr>,
        _error: Option<&Error>,
    ) {
    }

    /// An explicit tunnel is about to be torn down.
    fn tearing_down_explicit_tunnel(
        &self,
        _session: &dyn Session,
        _bound: &TunnelAddr,
        _local_side: bool,
    ) {
    }

    /// An explicit tunnel teardown concluded; `error` is set on failure.
    fn torn_down_explicit_tunnel(
        &self,
        _session: &dyn Session,
        _bound: &TunnelAddr,
        _local_side: bool,
        _error: Option<&Error>,
    ) {
    }

    /// A dynamic (SOCKS) tunnel is about to be established.
    fn establishing_dynamic_tunnel(&self, _session: &dyn Session, _local: &TunnelAddr) {}

    /// A dynamic tunnel establishment concluded.
    fn established_dynamic_tunnel(
        &self,
        _session: &dyn Session,
        _local: &TunnelAddr,
        _bound: Option<&TunnelAddr>,
        _error: Option<&Error>,
    ) {
    }

    /// A dynamic tunnel is about to be torn down.
    fn tearing_down_dynamic_tunnel(&self, _session: &dyn Session, _local: &TunnelAddr) {}

    /// A dynamic tunnel teardown concluded; `error` is set on failure.
    fn torn_down_dynamic_tunnel(
        &self,
        _session: &dyn Session,
        _local: &TunnelAddr,
        _error: Option<&Error>,
    ) {
    }
}

/// Thread-safe, insertion-ordered listener collection with panic-isolating
/// fan-out.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn PortForwardingListener>>>,
}

impl ListenerSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener.
    pub fn add(&self, listener: Arc<dyn PortForwardingListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Removes a previously added listener (pointer identity).
    pub fn remove(&self, listener: &Arc<dyn PortForwardingListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Returns `true` when no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().unwrap().is_empty()
    }

    /// Invokes `notify` on each listener in insertion order.
    ///
    /// Iterates a snapshot, so listeners may add or remove listeners from
    /// within a callback. A panicking listener is logged and skipped.
    pub fn broadcast<F>(&self, notify: F)
    where
        F: Fn(&dyn PortForwardingListener),
    {
        let snapshot: Vec<Arc<dyn PortForwardingListener>> =
            self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| notify(listener.as_ref()))).is_err() {
                warn!("port forwarding listener panicked during dispatch");
            }
        }
    }
}
