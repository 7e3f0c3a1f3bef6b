//! Error types for Warren.

use std::io;

use thiserror::Error;

/// Result type alias for Warren operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Warren.
#[derive(Error, Debug)]
pub enum Error {
    // Wire errors
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    // TLS errors
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("no peer certificate presented")]
    NoPeerCert,

    #[error("peer certificate rejected: {0}")]
    BadPeerCert(String),

    // Application handshake errors
    #[error("bad application handshake: {0}")]
    BadHandshake(String),

    #[error("application handshake timed out")]
    HandshakeTimeout,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Lifecycle errors
    #[error("shutting down")]
    Shutdown,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Wire framing errors.
///
/// All of these are terminal for the connection that produced them: once the
/// length prefix can no longer be trusted, the stream cannot be resynced.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FramingError {
    #[error("short read")]
    ShortRead,

    #[error("short write")]
    ShortWrite,

    #[error("frame length {len} outside 1..={mtu}, framing lost")]
    FramingLost { len: usize, mtu: usize },
}
