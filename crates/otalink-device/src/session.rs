//! Device-side session state machine.
//!
//! ```text
//! Idle --claim--> Authenticating --digest ok--> Receiving
//!     --lengths match--> Validating --stream complete--> Applying
//!     --swap ok--> Rebooting
//! ```
//!
//! Any failure edge closes the connection, removes staging, and returns the
//! device to `Idle` with the running image intact.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use otalink_proto::auth::{Challenge, RESPONSE_LEN};
use otalink_proto::manifest::Manifest;
use otalink_proto::wire::{self, Status, TransferHeader};
use otalink_proto::{AuthError, Inflater, NetworkError, TransferError, UpdateError};

use crate::config::DeviceConfig;
use crate::storage::Storage;

/// Socket read granularity while receiving the payload.
const RECV_CHUNK: usize = 4096;

/// Where the device currently is. Transitions are monotonic within a
/// session; no state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeviceState {
    Idle = 0,
    Authenticating = 1,
    Receiving = 2,
    Validating = 3,
    Applying = 4,
    Rebooting = 5,
}

impl DeviceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Authenticating,
            2 => Self::Receiving,
            3 => Self::Validating,
            4 => Self::Applying,
            5 => Self::Rebooting,
            _ => Self::Idle,
        }
    }
}

/// Shared, observable device state.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(DeviceState::Idle as u8))
    }

    pub fn get(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move forward through the session. Debug builds assert monotonicity.
    fn advance(&self, next: DeviceState) {
        debug_assert!(next > self.get(), "state must not be revisited");
        debug!(state = ?next, "session state");
        self.0.store(next as u8, Ordering::Release);
    }

    /// Back to idle after an aborted session.
    fn reset(&self) {
        self.0.store(DeviceState::Idle as u8, Ordering::Release);
    }
}

/// What a successful session applied.
#[derive(Debug, Clone, Copy)]
pub struct SessionStats {
    pub files: u32,
    pub bytes: u64,
}

/// Run one update session over an accepted connection.
///
/// The outcome status byte is reported to the host while the socket may
/// still be alive. On error the state cell is back at `Idle` and nothing
/// under the live app root has changed.
pub async fn run_session(
    stream: &mut TcpStream,
    config: &DeviceConfig,
    storage: &Storage,
    state: &StateCell,
) -> Result<SessionStats, UpdateError> {
    let result = drive(stream, config, storage, state).await;
    let status = match &result {
        Ok(_) => Status::Ok,
        Err(err) => Status::for_error(err),
    };
    wire::write_status_best_effort(stream, status).await;
    if result.is_err() {
        state.reset();
        // Read out whatever the host already sent. Closing with unread
        // bytes resets the connection and can destroy the status byte
        // before the host sees it.
        let _ = timeout(config.io_timeout, drain(stream)).await;
    }
    result
}

async fn drain(stream: &mut TcpStream) {
    let mut scratch = [0u8; 1024];
    loop {
        match stream.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn drive(
    stream: &mut TcpStream,
    config: &DeviceConfig,
    storage: &Storage,
    state: &StateCell,
) -> Result<SessionStats, UpdateError> {
    state.advance(DeviceState::Authenticating);
    authenticate(stream, config).await?;

    state.advance(DeviceState::Receiving);
    let header = timeout(config.io_timeout, TransferHeader::read_from(stream))
        .await
        .map_err(|_| TransferError::Truncated)??;
    header.validate()?;

    let mut manifest_buf = vec![0u8; header.manifest_len as usize];
    timeout(config.io_timeout, wire::read_exact(stream, &mut manifest_buf))
        .await
        .map_err(|_| TransferError::Truncated)??;
    let manifest = Manifest::from_bytes(&manifest_buf).map_err(|e| {
        warn!("manifest parse failed: {}", e);
        TransferError::CorruptPayload
    })?;
    manifest.validate().map_err(|e| {
        warn!("manifest refused: {}", e);
        TransferError::CorruptPayload
    })?;
    info!(
        files = manifest.total_files,
        bytes = manifest.total_size_bytes,
        compressed = header.payload_len,
        "update manifest received"
    );

    // Space check on the declared totals, before any staging write.
    storage.check_space(manifest.total_size_bytes)?;

    let mut staged = storage.begin_staging(&manifest).map_err(|e| {
        warn!("staging setup failed: {}", e);
        TransferError::WriteFailed
    })?;
    let mut inflater = Inflater::new(manifest.total_size_bytes);

    // The length prefix is authoritative: read exactly payload_len bytes,
    // inflating as they arrive.
    let mut remaining = header.payload_len as u64;
    let mut buf = [0u8; RECV_CHUNK];
    while remaining > 0 {
        let take = remaining.min(RECV_CHUNK as u64) as usize;
        timeout(config.io_timeout, wire::read_exact(stream, &mut buf[..take]))
            .await
            .map_err(|_| TransferError::Truncated)??;
        inflater.feed(&buf[..take], &mut staged)?;
        remaining -= take as u64;
    }

    state.advance(DeviceState::Validating);
    let bytes = inflater.finish()?;
    debug!(bytes, "payload inflated to declared total");

    state.advance(DeviceState::Applying);
    staged.commit().map_err(|e| {
        warn!("apply failed: {}", e);
        TransferError::WriteFailed
    })?;

    state.advance(DeviceState::Rebooting);
    Ok(SessionStats {
        files: manifest.total_files,
        bytes,
    })
}

/// Challenge-response exchange. One attempt per connection; the host must
/// reconnect to retry, so a single socket cannot become a guessing loop.
async fn authenticate(stream: &mut TcpStream, config: &DeviceConfig) -> Result<(), UpdateError> {
    let challenge = Challenge::generate();
    stream
        .write_all(challenge.as_bytes())
        .await
        .map_err(|_| NetworkError::Disconnected)?;

    let mut response = [0u8; RESPONSE_LEN];
    match timeout(config.io_timeout, stream.read_exact(&mut response)).await {
        Err(_) => return Err(AuthError::Timeout.into()),
        // A truncated response counts as a failed attempt, not a network
        // hiccup.
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(AuthError::Rejected.into());
        }
        Ok(Err(_)) => return Err(NetworkError::Disconnected.into()),
        Ok(Ok(_)) => {}
    }

    if !challenge.verify(&response, &config.password) {
        warn!("authentication rejected");
        return Err(AuthError::Rejected.into());
    }
    wire::write_status(stream, Status::Ok)
        .await
        .map_err(|_| NetworkError::Disconnected)?;
    debug!("authentication accepted");
    Ok(())
}
