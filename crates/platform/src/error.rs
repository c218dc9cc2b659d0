//! Error types for Skein

use std::fmt;

/// Unified error type for substrate-level Skein operations
#[derive(Debug)]
pub enum SkeinError {
    /// I/O error
    Io(std::io::Error),

    /// Wire protocol error (malformed or truncated data)
    Protocol(String),

    /// Operation attempted in an invalid lifecycle state
    State(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for SkeinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkeinError::Io(e) => write!(f, "IO error: {}", e),
            SkeinError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkeinError::State(msg) => write!(f, "Invalid state: {}", msg),
            SkeinError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkeinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkeinError::Io(e) => Some(e),
            SkeinError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkeinError {
    fn from(err: std::io::Error) -> Self {
        SkeinError::Io(err)
    }
}

/// Result type for Skein operations
pub type SkeinResult<T> = Result<T, SkeinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SkeinError::Protocol("truncated packet".to_string());
        assert_eq!(err.to_string(), "Protocol error: truncated packet");

        let err = SkeinError::State("acceptor is closed".to_string());
        assert_eq!(err.to_string(), "Invalid state: acceptor is closed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let skein_err: SkeinError = io_err.into();
        assert!(matches!(skein_err, SkeinError::Io(_)));
    }

    #[test]
    fn test_other_error_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = SkeinError::Other(Box::new(inner));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_result_type() {
        fn example() -> SkeinResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
