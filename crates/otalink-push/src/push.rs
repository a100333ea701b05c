//! Client orchestrator: bundle a source tree and drive the update protocol.
//!
//! The protocol phases (authenticate, send manifest, send stream) run
//! strictly in order. Any failure aborts immediately with the typed error;
//! there is no partial recovery, matching the device's all-or-nothing
//! apply.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use otalink_proto::auth;
use otalink_proto::wire::{
    self, IO_CHUNK, IO_TIMEOUT, MAX_MANIFEST_LEN, MAX_PAYLOAD_LEN, Status, TransferHeader,
};
use otalink_proto::{AuthError, Deflater, NetworkError, UpdateError};

use crate::source::SourceTree;

/// The device decompresses and applies before confirming, so the final
/// status gets a longer deadline than ordinary reads.
const APPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for one push.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Device address or hostname; resolved by the OS before the protocol
    /// starts.
    pub host: String,
    pub port: u16,
    pub src: PathBuf,
    pub password: String,
}

/// Cumulative payload bytes sent, reported after every written chunk.
pub type ProgressFn = Box<dyn FnMut(u64) + Send>;

/// Sizes of a confirmed update.
#[derive(Debug, Clone, Copy)]
pub struct PushReport {
    pub files: u32,
    pub uncompressed: u64,
    pub compressed: u64,
}

/// Why a push failed: either the protocol said no, or the bundle could not
/// be built in the first place.
#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Protocol(#[from] UpdateError),
    #[error("could not build update bundle: {0}")]
    Source(#[from] anyhow::Error),
}

/// Bundle `config.src` and push it to the device.
pub async fn push_update(
    config: &PushConfig,
    mut progress: Option<ProgressFn>,
) -> Result<PushReport, PushError> {
    let tree = SourceTree::open(&config.src)?;
    let (manifest, paths) = tree.collect()?;
    if manifest.files.is_empty() {
        return Err(PushError::Source(anyhow::anyhow!(
            "no files to upload under {}",
            config.src.display()
        )));
    }

    // One deflate context for the whole batch, files in manifest order.
    let mut deflater = Deflater::new();
    for path in &paths {
        let data =
            fs::read(path).map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        deflater
            .push(&data)
            .map_err(|e| anyhow::anyhow!("compression failed: {e}"))?;
    }
    let uncompressed = deflater.raw_len();
    let payload = deflater
        .finish()
        .map_err(|e| anyhow::anyhow!("compression failed: {e}"))?;
    let manifest_bytes = manifest
        .to_bytes()
        .map_err(|e| anyhow::anyhow!("manifest serialization failed: {e}"))?;

    if manifest_bytes.len() as u64 > MAX_MANIFEST_LEN as u64
        || payload.len() as u64 > MAX_PAYLOAD_LEN as u64
    {
        return Err(PushError::Source(anyhow::anyhow!(
            "bundle too large for the wire format"
        )));
    }

    let saved = 100.0 - (payload.len() as f64 / uncompressed.max(1) as f64) * 100.0;
    info!(
        files = manifest.total_files,
        uncompressed,
        compressed = payload.len(),
        "bundle ready ({saved:.1}% smaller)"
    );

    let mut stream = connect(&config.host, config.port).await?;
    authenticate(&mut stream, &config.password).await?;
    send_update(&mut stream, &manifest_bytes, &payload, progress.as_mut()).await?;

    Ok(PushReport {
        files: manifest.total_files,
        uncompressed,
        compressed: payload.len() as u64,
    })
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, UpdateError> {
    debug!(host, port, "connecting");
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(NetworkError::ConnectFailed)?;
    let _ = socket2::SockRef::from(&stream).set_nodelay(true);
    Ok(stream)
}

/// Client half of the challenge-response exchange.
async fn authenticate(stream: &mut TcpStream, password: &str) -> Result<(), UpdateError> {
    let mut challenge = [0u8; auth::CHALLENGE_LEN];
    match timeout(IO_TIMEOUT, stream.read_exact(&mut challenge)).await {
        Err(_) => return Err(AuthError::Timeout.into()),
        Ok(Err(_)) => return Err(NetworkError::Disconnected.into()),
        Ok(Ok(_)) => {}
    }

    let response = auth::respond(&challenge, password);
    stream
        .write_all(&response)
        .await
        .map_err(|_| NetworkError::Disconnected)?;

    let status = match timeout(IO_TIMEOUT, wire::read_status(stream)).await {
        Err(_) => return Err(AuthError::Timeout.into()),
        // The device closes without a status byte only when it refused us.
        Ok(Err(_)) => return Err(AuthError::Rejected.into()),
        Ok(Ok(status)) => status,
    };
    match status {
        Status::Ok => {
            debug!("authentication accepted");
            Ok(())
        }
        other => Err(other
            .into_error()
            .unwrap_or_else(|| AuthError::Rejected.into())),
    }
}

async fn send_update(
    stream: &mut TcpStream,
    manifest_bytes: &[u8],
    payload: &[u8],
    mut progress: Option<&mut ProgressFn>,
) -> Result<(), UpdateError> {
    let header = TransferHeader {
        manifest_len: manifest_bytes.len() as u32,
        payload_len: payload.len() as u32,
    };
    header
        .write_to(stream)
        .await
        .map_err(|_| NetworkError::Disconnected)?;
    stream
        .write_all(manifest_bytes)
        .await
        .map_err(|_| NetworkError::Disconnected)?;

    let mut sent: u64 = 0;
    for chunk in payload.chunks(IO_CHUNK) {
        stream
            .write_all(chunk)
            .await
            .map_err(|_| NetworkError::Disconnected)?;
        sent += chunk.len() as u64;
        if let Some(callback) = progress.as_mut() {
            callback(sent);
        }
    }
    stream
        .flush()
        .await
        .map_err(|_| NetworkError::Disconnected)?;

    let status = match timeout(APPLY_TIMEOUT, wire::read_status(stream)).await {
        Err(_) => return Err(NetworkError::Disconnected.into()),
        Ok(result) => result?,
    };
    match status {
        Status::Ok => {
            info!("device confirmed apply, rebooting");
            Ok(())
        }
        other => Err(other
            .into_error()
            .unwrap_or_else(|| NetworkError::Disconnected.into())),
    }
}
