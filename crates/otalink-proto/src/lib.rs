//! Update transfer protocol shared by the device service and the push tool.
//!
//! Provides the pieces both ends of an OTA session agree on:
//! - challenge-response authentication (SHA-256 digests, never the secret)
//! - the update manifest model
//! - raw-deflate bundle compression, inflated incrementally on the device
//! - length-prefixed framing and status codes over one TCP stream

pub mod auth;
pub mod codec;
pub mod error;
pub mod manifest;
pub mod wire;

// Re-export key types for convenience.
pub use auth::{CHALLENGE_LEN, Challenge, RESPONSE_LEN};
pub use codec::{Deflater, Inflater};
pub use error::{AuthError, NetworkError, TransferError, UpdateError};
pub use manifest::{FileEntry, Manifest};
pub use wire::{DEFAULT_PORT, Status, TransferHeader};
