//! Error types for client operations.

use std::io;

use memcache_proto::Status;

/// Errors returned by the memcache client.
///
/// Domain outcomes are *not* errors: a `get` miss, a failed CAS store, and
/// an incr/decr against a non-numeric value all come back as values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key length outside `[1, 65535]`.
    #[error("bad key length")]
    BadKeyLength,

    /// Counter delta above `i64::MAX`.
    #[error("bad delta")]
    BadDelta,

    /// Counter initial value above `i64::MAX`.
    #[error("bad initial value")]
    BadInitial,

    /// `add`/`replace` called with a nil value.
    #[error("value required")]
    ValueRequired,

    /// Connect timeout of zero.
    #[error("bad timeout")]
    BadTimeout,

    /// Encoded value would overflow the frame's 32-bit body length.
    #[error("encoded value too long")]
    EncodedValueTooLong,

    /// Operation on a closed client.
    #[error("closed")]
    Closed,

    /// DNS resolution failed.
    #[error("error resolving '{host}:{port}'")]
    ResolveFailed { host: String, port: String },

    /// Every resolved address failed to connect; carries the last OS error
    /// (`ETIMEDOUT` when the bounded wait expired).
    #[error("error connecting to '{host}:{port}': {source}")]
    ConnectFailed {
        host: String,
        port: String,
        source: io::Error,
    },

    /// The peer closed the connection mid-exchange.
    #[error("socket closed")]
    SocketClosed,

    /// A send or receive failed.
    #[error("socket error: {0}")]
    SocketError(#[source] io::Error),

    /// The response frame was malformed (bad magic or segment lengths).
    #[error("bad response")]
    BadResponse(#[from] memcache_proto::ParseError),

    /// A frame that parses but does not fit the operation's shape.
    #[error("protocol error")]
    Protocol,

    /// The server returned a status outside the operation's domain.
    #[error("memcached error: {0}")]
    Server(Status),

    /// Value encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] memcache_codec::Error),
}
