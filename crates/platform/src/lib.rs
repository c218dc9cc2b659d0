//! # Skein Platform
//!
//! Core platform types and utilities for the Skein SSH stack.
//!
//! This crate provides:
//! - Unified error types (`SkeinError`, `SkeinResult`)
//!
//! # Examples
//!
//! ```
//! use skein_platform::{SkeinError, SkeinResult};
//!
//! fn example_function() -> SkeinResult<String> {
//!     Ok("Hello, Skein!".to_string())
//! }
//!
//! # fn main() -> SkeinResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Skein!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{SkeinError, SkeinResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
