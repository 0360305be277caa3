//! Configuration error types.
//!
//! Scalar options never fail (they fall back to defaults with a warning);
//! only malformed upstream URLs are fatal.

use thiserror::Error;

/// Fatal configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Upstream base URL is unparseable or lacks a scheme/host.
    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}
