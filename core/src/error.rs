//! Unified error type for the core crate.

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

/// The ten abstract error kinds named by the error-handling design, plus the
/// I/O and serialization passthroughs every layer needs.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame: short read, bad JSON, or a length that overflows the
    /// max frame size.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Handshake MAC mismatch, decrypt failure, or a rejected second
    /// connection.
    #[error("authentication error: {0}")]
    AuthError(String),

    /// The active connection dropped.
    #[error("connection lost")]
    ConnectionLost,

    /// Finalized file content did not match its declared checksum.
    #[error("checksum mismatch for '{file}'")]
    ChecksumMismatch { file: String },

    /// A `FILE_REQUEST` referenced a transfer the sender no longer has, or
    /// never had.
    #[error("transfer '{0}' is expired or unknown")]
    ExpiredOrUnknownTransfer(String),

    /// The clipboard adapter could not read or write.
    #[error("clipboard unavailable: {0}")]
    ClipboardUnavailable(String),

    /// An outbound send was dropped by the ignore filter.
    #[error("ignored by filter: {0}")]
    IgnoredByFilter(String),

    /// An outbound send exceeded a configured size limit.
    #[error("size limit exceeded: {0}")]
    SizeLimitExceeded(String),

    /// `start` (or any paired-only operation) was invoked with no pairing
    /// record present.
    #[error("not paired")]
    NotPaired,

    /// A bug, or a condition the design treats as impossible.
    #[error("internal error: {0}")]
    InternalError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the connect loop / retry policy should retry automatically
    /// per the error-handling design table.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::ClipboardUnavailable(_))
    }

    /// Process exit code per the CLI surface's exit-code table.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::NotPaired => 3,
            Self::AuthError(_) => 4,
            Self::ConnectionLost => 5,
            Self::Io(_) => 6,
            Self::InternalError(_) => 7,
            _ => 1,
        }
    }
}
