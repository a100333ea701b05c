//! Typed failures for an update session.
//!
//! Every variant aborts the session it occurs in. The device returns to
//! idle and keeps accepting; the host surfaces the error and exits
//! non-zero. A fresh invocation starts a brand-new session.

use thiserror::Error;

/// Failures during the challenge-response exchange.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The response digest did not match the device's own computation.
    #[error("credential rejected by peer")]
    Rejected,
    /// The peer did not answer within the authentication deadline.
    #[error("timed out during authentication")]
    Timeout,
}

/// Failures while moving or applying the update payload.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The stream ended before the declared length was reached.
    #[error("stream truncated before the declared length")]
    Truncated,
    /// The compressed stream is malformed or disagrees with the manifest.
    #[error("compressed payload is corrupt")]
    CorruptPayload,
    /// Declared uncompressed size exceeds the device's storage capacity.
    #[error("update does not fit in available storage")]
    InsufficientSpace,
    /// Staging or apply could not write to storage.
    #[error("failed to write update to storage")]
    WriteFailed,
}

/// Connection-level failures outside the protocol proper.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("could not connect to device: {0}")]
    ConnectFailed(#[source] std::io::Error),
    #[error("connection lost")]
    Disconnected,
}

/// Umbrella over everything that can end a session early.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}
