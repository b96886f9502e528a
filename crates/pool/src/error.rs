//! Error kinds surfaced to callers of the pool (see spec component G/§7).
use thiserror::Error;

/// Errors returned by the public pool API.
///
/// Mirrors the nesting style of `client::error::Error` /
/// `client::handle::Error`: a flat enum with `#[from]` wrapping for the
/// lower layers (I/O, transport) and one variant per named failure kind.
#[derive(Debug, Error)]
pub enum Error {
    #[error("a connection or handshake for this point is already in flight")]
    PendingConnection,

    #[error("peer is already connected")]
    AlreadyConnected,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("authentication timed out")]
    AuthenticationTimeout,

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("point or peer rejected (closed network or blacklisted)")]
    Rejected,

    #[error("too many connections")]
    TooManyConnections,

    #[error("no protocol version in common with peer")]
    NoCommonProtocol,

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("refused to connect to self")]
    Myself,

    #[error(transparent)]
    Transport(#[from] crate::transport::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("event bus channel error: {0}")]
    EventBus(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
