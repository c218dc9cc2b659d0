//! Common types for port forwarding.

use super::error::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Logical tunnel endpoint.
///
/// The host may be a hostname, an IP address, or empty for the wildcard
/// address. Port 0 asks the binder to assign one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelAddr {
    host: String,
    port: u16,
}

impl TunnelAddr {
    /// Creates a new tunnel endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part; 0 means "assign".
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Converts to a socket address without touching the resolver.
    ///
    /// Only IP-literal and wildcard hosts convert; hostnames return `None`.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        if self.host.is_empty() {
            return Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.port,
            ));
        }
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolves to a socket address, consulting the resolver for hostnames.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.to_socket_addr() {
            return Ok(addr);
        }
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        addrs
            .next()
            .ok_or_else(|| Error::InvalidArgument(format!("Cannot resolve host: {}", self.host)))
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for TunnelAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Which forwarding mapping a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
    /// Local forwarding (`direct-tcpip`)
    Local,
    /// Remote forwarding (`tcpip-forward`)
    Remote,
    /// Dynamic forwarding (SOCKS)
    Dynamic,
}

impl fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForwardingMode::Local => "local",
            ForwardingMode::Remote => "remote",
            ForwardingMode::Dynamic => "dynamic",
        };
        write!(f, "{}", name)
    }
}

/// Record of a server-accepted local forwarding request.
///
/// Keeps both the address actually bound and the address the peer asked for,
/// so a later cancel matches whichever name the peer uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalForwardingEntry {
    bound_host: String,
    requested_host: String,
    port: u16,
}

impl LocalForwardingEntry {
    /// Creates an entry; the bound host must come first.
    pub fn new(bound_host: impl Into<String>, requested_host: impl Into<String>, port: u16) -> Self {
        Self {
            bound_host: bound_host.into(),
            requested_host: requested_host.into(),
            port,
        }
    }

    /// The host the listener actually bound.
    pub fn bound_host(&self) -> &str {
        &self.bound_host
    }

    /// The host the peer requested.
    pub fn requested_host(&self) -> &str {
        &self.requested_host
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` when `(host, port)` names this entry by either host.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && (self.bound_host == host || self.requested_host == host)
    }
}

impl fmt::Display for LocalForwardingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (requested {})", self.bound_host, self.port, self.requested_host)
    }
}

/// Parses a tunnel endpoint from a string.
///
/// Accepts formats:
/// - "host:port" - e.g., "localhost:8080"
/// - "[host]:port" - e.g., "[::1]:8080" for IPv6
///
/// # Example
///
/// ```rust
/// use skein_proto::ssh::forwarding::parse_tunnel_addr;
///
/// let addr = parse_tunnel_addr("localhost:8080").unwrap();
/// assert_eq!(addr.host(), "localhost");
/// assert_eq!(addr.port(), 8080);
/// ```
pub fn parse_tunnel_addr(addr: &str) -> Result<TunnelAddr> {
    // Handle IPv6 with brackets: [::1]:8080
    if addr.starts_with('[') {
        let end_bracket = addr.find(']').ok_or_else(|| {
            Error::InvalidArgument(format!("Invalid IPv6 address: missing ']': {}", addr))
        })?;

        let host = addr[1..end_bracket].to_string();

        let port_part = &addr[end_bracket + 1..];
        if !port_part.starts_with(':') {
            return Err(Error::InvalidArgument(format!(
                "Invalid address format: missing ':' after ']': {}",
                addr
            )));
        }

        let port = port_part[1..].parse::<u16>().map_err(|_| {
            Error::InvalidArgument(format!("Invalid port number: {}", &port_part[1..]))
        })?;

        return Ok(TunnelAddr::new(host, port));
    }

    let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
    if parts.len() != 2 {
        return Err(Error::InvalidArgument(format!(
            "Invalid address format: expected 'host:port', got '{}'",
            addr
        )));
    }

    let port = parts[0]
        .parse::<u16>()
        .map_err(|_| Error::InvalidArgument(format!("Invalid port number: {}", parts[0])))?;

    Ok(TunnelAddr::new(parts[1], port))
}
