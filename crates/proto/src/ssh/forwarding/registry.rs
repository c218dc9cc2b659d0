//! Binding registry.
//!
//! The single source of truth for what is currently forwarded: three
//! port-indexed mappings (one per [`ForwardingMode`]) plus the set of
//! server-accepted local-forward entries. A port may appear in at most one of
//! the port-indexed mappings at a time.
//!
//! Each collection carries its own lock so bridge handlers can look up
//! mappings without holding the forwarder facade monitor; all mutations run
//! under that monitor.

use super::error::{Error, Result};
use super::socks::SocksProxy;
use super::types::{ForwardingMode, LocalForwardingEntry, TunnelAddr};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Port-to-peer mappings for the three forwarding modes.
#[derive(Default)]
pub struct BindingRegistry {
    local_to_remote: Mutex<HashMap<u16, TunnelAddr>>,
    remote_to_local: Mutex<HashMap<u16, TunnelAddr>>,
    dynamic_local: Mutex<HashMap<u16, Arc<SocksProxy>>>,
    local_forwards: Mutex<HashSet<LocalForwardingEntry>>,
}

impl BindingRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Which mapping currently holds `port`, if any.
    pub fn mode_of(&self, port: u16) -> Option<ForwardingMode> {
        if self.local_to_remote.lock().unwrap().contains_key(&port) {
            return Some(ForwardingMode::Local);
        }
        if self.remote_to_local.lock().unwrap().contains_key(&port) {
            return Some(ForwardingMode::Remote);
        }
        if self.dynamic_local.lock().unwrap().contains_key(&port) {
            return Some(ForwardingMode::Dynamic);
        }
        None
    }

    fn check_unbound(&self, port: u16) -> Result<()> {
        match self.mode_of(port) {
            Some(mode) => Err(Error::DuplicateBinding { mode, port }),
            None => Ok(()),
        }
    }

    /// Records a local forward: connections accepted on `port` dial `remote`.
    pub fn insert_local(&self, port: u16, remote: TunnelAddr) -> Result<()> {
        self.check_unbound(port)?;
        self.local_to_remote.lock().unwrap().insert(port, remote);
        Ok(())
    }

    /// The remote peer for a locally accepted connection on `port`.
    pub fn lookup_local(&self, port: u16) -> Option<TunnelAddr> {
        self.local_to_remote.lock().unwrap().get(&port).cloned()
    }

    /// Drops the local forward on `port`, returning its remote peer.
    pub fn remove_local(&self, port: u16) -> Option<TunnelAddr> {
        self.local_to_remote.lock().unwrap().remove(&port)
    }

    /// Records a remote forward: server-originated channels for `port` dial
    /// `local`.
    pub fn insert_remote(&self, port: u16, local: TunnelAddr) -> Result<()> {
        self.check_unbound(port)?;
        self.remote_to_local.lock().unwrap().insert(port, local);
        Ok(())
    }

    /// The local peer for a server-side forward on `port`.
    pub fn lookup_remote(&self, port: u16) -> Option<TunnelAddr> {
        self.remote_to_local.lock().unwrap().get(&port).cloned()
    }

    /// Drops the remote forward on `port`, returning its local peer.
    pub fn remove_remote(&self, port: u16) -> Option<TunnelAddr> {
        self.remote_to_local.lock().unwrap().remove(&port)
    }

    /// Records a dynamic forward, transferring proxy ownership to the
    /// registry.
    pub fn insert_dynamic(&self, port: u16, proxy: Arc<SocksProxy>) -> Result<()> {
        self.check_unbound(port)?;
        self.dynamic_local.lock().unwrap().insert(port, proxy);
        Ok(())
    }

    /// Drops the dynamic forward on `port`, handing its proxy back.
    pub fn remove_dynamic(&self, port: u16) -> Option<Arc<SocksProxy>> {
        self.dynamic_local.lock().unwrap().remove(&port)
    }

    /// Removes and returns every dynamic forward, for shutdown.
    pub fn drain_dynamic(&self) -> Vec<(u16, Arc<SocksProxy>)> {
        self.dynamic_local.lock().unwrap().drain().collect()
    }

    /// Adds a server-accepted local-forward entry; `false` on duplicate.
    pub fn add_local_forward(&self, entry: LocalForwardingEntry) -> bool {
        self.local_forwards.lock().unwrap().insert(entry)
    }

    /// Removes the entry matching `(host, port)` by either of its hosts.
    pub fn remove_local_forward(&self, host: &str, port: u16) -> Option<LocalForwardingEntry> {
        let mut entries = self.local_forwards.lock().unwrap();
        let found = entries.iter().find(|e| e.matches(host, port)).cloned();
        if let Some(entry) = &found {
            entries.remove(entry);
        }
        found
    }
}
