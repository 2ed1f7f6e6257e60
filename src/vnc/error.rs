//! Error types for the RFB client engine.
//!
//! Every error is terminal for the connection that produced it: the engine never
//! retries a handshake or resumes a partially read message. Callers tear the
//! `RfbClient` down and build a new one to reconnect.

use std::io;

use thiserror::Error;

/// Errors produced by the protocol engine.
#[derive(Debug, Error)]
pub enum RfbError {
    /// The server closed the connection (EOF while reading or writing).
    #[error("server closed the connection")]
    TransportClosed,

    /// No progress was made on the transport within the configured deadline.
    #[error("timed out waiting for the server")]
    TransportTimeout,

    /// Malformed header, out-of-bounds rectangle, unsupported subencoding or
    /// corrupted compressed payload.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server rejected our credentials. Carries the server reason when one was sent.
    #[error("authentication failed{}", .0.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    AuthenticationFailed(Option<String>),

    /// The server offers nothing this client can speak.
    #[error("unsupported server capability: {0}")]
    UnsupportedServerCapability(String),

    /// Any other transport error.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// TLS layer failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl RfbError {
    /// Shorthand for building a [`RfbError::ProtocolViolation`].
    pub fn violation(msg: impl Into<String>) -> Self {
        RfbError::ProtocolViolation(msg.into())
    }
}

impl From<io::Error> for RfbError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => RfbError::TransportClosed,
            io::ErrorKind::TimedOut => RfbError::TransportTimeout,
            _ => RfbError::Io(err),
        }
    }
}

impl From<flate2::DecompressError> for RfbError {
    fn from(err: flate2::DecompressError) -> Self {
        RfbError::ProtocolViolation(format!("inflate failed: {err}"))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RfbError>;
