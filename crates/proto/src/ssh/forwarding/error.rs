//! Error types for port forwarding operations.

use super::types::ForwardingMode;
use skein_platform::SkeinError;
use std::fmt;

/// Result type for port forwarding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Port forwarding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed caller input (address parse failure, unresolvable host)
    InvalidArgument(String),

    /// Operation on a closed or closing forwarder
    State(String),

    /// Bind produced no usable local address, or the listen setup failed
    Bind(String),

    /// The port is already held by one of the forwarding mappings
    DuplicateBinding {
        /// Mapping that currently holds the port
        mode: ForwardingMode,
        /// Contested port
        port: u16,
    },

    /// The peer denied a `tcpip-forward` request
    RequestDenied(String),

    /// The forwarding policy filter itself failed (as opposed to denying)
    Filter(String),

    /// I/O error from the substrate or transport
    Io(String),

    /// Malformed wire data (global-request reply, SOCKS exchange)
    Protocol(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::State(msg) => write!(f, "Invalid state: {}", msg),
            Error::Bind(msg) => write!(f, "Bind failed: {}", msg),
            Error::DuplicateBinding { mode, port } => {
                write!(
                    f,
                    "Multiple {} port forwarding bindings on port={}",
                    mode, port
                )
            }
            Error::RequestDenied(msg) => write!(f, "Request denied: {}", msg),
            Error::Filter(msg) => write!(f, "Forwarding filter failure: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<SkeinError> for Error {
    fn from(err: SkeinError) -> Self {
        match err {
            SkeinError::Io(e) => Error::Io(e.to_string()),
            SkeinError::Protocol(msg) => Error::Protocol(msg),
            SkeinError::State(msg) => Error::State(msg),
            SkeinError::Other(e) => Error::Io(e.to_string()),
        }
    }
}
