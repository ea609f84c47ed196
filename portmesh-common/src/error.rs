//! Error types for `portmesh`

use thiserror::Error;

/// Main error type for `portmesh` operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A tunnel spec string does not match `lhost:lport[@rhost[:rport]]`
    #[error("Option parse error: [{0}]. Format lhost:lport[@rhost:rport]")]
    MalformedSpec(String),

    /// Remote host lookup failed
    #[error("Failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },

    /// Transport connect or forwarding request to one resolved address failed
    #[error("Dial {key} failed: {reason}")]
    Dial { key: String, reason: String },

    /// The server could not bind the requested forward address
    #[error("Unable to listen on {addr}: {reason}")]
    Listen { addr: String, reason: String },

    /// One side of a relayed connection closed or failed
    #[error("Relay failed: {0}")]
    Relay(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// Whether the retry loop should keep trying after this error.
    ///
    /// Malformed input and configuration mistakes never heal on their own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::MalformedSpec(_) | Self::Config(_))
    }
}

impl From<bincode_next::error::EncodeError> for TunnelError {
    fn from(err: bincode_next::error::EncodeError) -> Self {
        TunnelError::Serialization(err.to_string())
    }
}

impl From<bincode_next::error::DecodeError> for TunnelError {
    fn from(err: bincode_next::error::DecodeError) -> Self {
        TunnelError::Serialization(err.to_string())
    }
}
