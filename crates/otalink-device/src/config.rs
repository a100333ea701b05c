//! Environment-driven configuration for the update service.
//!
//! Network join (WiFi credentials, hostname) is an external collaborator;
//! only the OTA password feeds the protocol core.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use otalink_proto::wire::DEFAULT_PORT;

/// Default storage capacity when `OTALINK_CAPACITY_BYTES` is unset: 16 MiB.
const DEFAULT_CAPACITY: u64 = 16 * 1024 * 1024;

/// Runtime settings for the update service.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub bind_addr: SocketAddr,
    /// Shared OTA secret. Read at session start, never transmitted.
    pub password: String,
    /// Live application tree the update is applied to.
    pub app_root: PathBuf,
    /// Storage the device can dedicate to an update, uncompressed.
    pub capacity_bytes: u64,
    /// Deadline for each socket read during a session.
    pub io_timeout: Duration,
}

impl DeviceConfig {
    /// Load settings from the environment. The caller is expected to have
    /// loaded `.env` already (see `main`).
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("OTALINK_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("OTALINK_PORT")
            .unwrap_or_else(|_| DEFAULT_PORT.to_string())
            .parse()?;

        let password = std::env::var("OTALINK_PASSWORD").unwrap_or_default();
        anyhow::ensure!(
            !password.is_empty(),
            "OTALINK_PASSWORD must be set; the device refuses to run without a credential"
        );

        let app_root: PathBuf = std::env::var("OTALINK_APP_ROOT")
            .unwrap_or_else(|_| "./app".into())
            .into();
        let capacity_bytes: u64 = std::env::var("OTALINK_CAPACITY_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CAPACITY);
        let io_timeout_secs: u64 = std::env::var("OTALINK_IO_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            bind_addr: format!("{host}:{port}").parse()?,
            password,
            app_root,
            capacity_bytes,
            io_timeout: Duration::from_secs(io_timeout_secs),
        })
    }
}
