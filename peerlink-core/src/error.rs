//! Error kinds: explicit result values, never panics in the engine.

/// All failure modes surfaced by the engine.
///
/// `WouldBlock` is not a failure for queued sends (the poll loop retries),
/// but it is returned verbatim for unqueued operations such as a busy
/// Tier 2 buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    // Parameter & state errors
    #[error("invalid parameter")]
    InvalidParam,
    #[error("engine not initialized")]
    NotInitialized,
    #[error("invalid state for operation")]
    InvalidState,
    #[error("operation not supported")]
    NotSupported,

    // Network errors
    #[error("network failure")]
    Network,
    #[error("operation timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("operation would block")]
    WouldBlock,

    // Resource errors
    #[error("buffer full")]
    BufferFull,
    #[error("queue empty")]
    QueueEmpty,
    #[error("message too large")]
    MessageTooLarge,
    #[error("backpressure: send rate reduced")]
    Backpressure,
    #[error("out of memory")]
    NoMemory,
    #[error("resource busy")]
    Busy,
    #[error("operation cancelled")]
    Cancelled,

    // Protocol errors
    #[error("checksum mismatch")]
    Checksum,
    #[error("bad magic")]
    BadMagic,
    #[error("truncated data")]
    Truncated,
    #[error("protocol version mismatch")]
    VersionMismatch,

    // Peer errors
    #[error("peer not found")]
    PeerNotFound,
    #[error("discovery already in progress")]
    DiscoveryActive,

    #[error("internal error")]
    Internal,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Protocol errors are logged and the offending input dropped; they do
    /// not tear down a connection by themselves.
    pub fn is_protocol(self) -> bool {
        matches!(
            self,
            Error::Checksum | Error::BadMagic | Error::Truncated | Error::VersionMismatch
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::WouldBlock => Error::WouldBlock,
            ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            ErrorKind::TimedOut => Error::Timeout,
            ErrorKind::OutOfMemory => Error::NoMemory,
            _ => Error::Network,
        }
    }
}
