//! Error types shared across the crate.

use thiserror::Error;

use crate::frame::FrameKind;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CellError>;

/// Errors produced by the cell runtime.
///
/// Three broad classes matter to callers: handshake errors
/// ([`UnexpectedFrame`](CellError::UnexpectedFrame),
/// [`MalformedFrame`](CellError::MalformedFrame)) are fatal to the connection
/// attempt that produced them; transport errors ([`Io`](CellError::Io),
/// [`Tls`](CellError::Tls)) close the connection they occurred on; and
/// [`ConnectionClosed`](CellError::ConnectionClosed) is the clean
/// end-of-stream terminal, which is not an operational failure.
#[derive(Debug, Error)]
pub enum CellError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid root certificate: {0}")]
    RootCert(String),

    #[error("invalid server name in address {0:?}")]
    ServerName(String),

    /// The peer closed the stream between frames. Clean shutdown, never
    /// logged as an error.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer sent a frame of the wrong kind for the current protocol
    /// step. Fatal during a handshake; during body streaming it breaks the
    /// exchange without necessarily tearing down the connection.
    #[error("queen sent unexpected {kind} frame during {context}")]
    UnexpectedFrame {
        context: &'static str,
        kind: FrameKind,
    },

    #[error("malformed {kind} frame: {source}")]
    MalformedFrame {
        kind: FrameKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("frame length {0} exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("not connected")]
    NotConnected,

    #[error("path {0:?} is not registered")]
    NotRegistered(String),
}
