//! Error types shared across the OAR workspace.
//!
//! One enum covers the whole fault taxonomy: I/O faults, codec faults,
//! device (resource) faults, HTTP faults, and misuse faults. Lower layers
//! funnel everything through these variants so the orchestrating layer has
//! a single place to react.

use thiserror::Error;

/// Convenience Result type using the OAR Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the OAR workspace
#[derive(Error, Debug)]
pub enum Error {
    /// File or network I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Audio device errors (open, enumerate, stream build)
    #[error("Audio device error: {0}")]
    Device(String),

    /// Codec errors (malformed compressed data, unexpected EOF mid-block)
    #[error("Decode error: {0}")]
    Decode(String),

    /// HTTP transport errors (upload, download)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state for operation (caller misuse, not recovered)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation attempted on a closed stream or device
    #[error("Closed")]
    Closed,
}
