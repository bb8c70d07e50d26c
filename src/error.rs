//! Error types for the DHCP server engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use crate::transport::TransportError;

/// Errors that can occur during DHCP server operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP datagram received.
    ///
    /// This includes datagrams that are too short, have an invalid magic
    /// cookie, carry truncated options, or violate other framing rules.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// A fixed-size option carried a payload of the wrong length.
    #[error("Option {code} length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        code: u8,
        expected: usize,
        actual: usize,
    },

    /// Invalid server configuration.
    ///
    /// Fatal to the one instance being constructed; sibling instances are
    /// unaffected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),

    /// Error reported by the datagram transport while serving.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
