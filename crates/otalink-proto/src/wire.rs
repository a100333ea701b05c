//! Length-prefixed framing for the update exchange.
//!
//! Wire order on one TCP stream, all integers big-endian:
//!
//! ```text
//! S -> C   challenge            (16 bytes)
//! C -> S   response digest      (32 bytes)
//! S -> C   auth status          (1 byte)
//! C -> S   transfer header      (manifest_len u32, payload_len u32)
//! C -> S   manifest             (manifest_len bytes, JSON)
//! C -> S   compressed payload   (payload_len bytes)
//! S -> C   final status         (1 byte)
//! ```
//!
//! The receiver always reads the exact declared byte counts. It never uses
//! connection close to delimit data, which would be indistinguishable from
//! a dropped connection.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AuthError, NetworkError, TransferError, UpdateError};

/// Default OTA service port.
pub const DEFAULT_PORT: u16 = 8266;

/// Payload bytes per socket write on the host side; the progress callback
/// fires after each chunk.
pub const IO_CHUNK: usize = 1024;

/// Deadline for a single protocol read.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Sanity cap for the serialized manifest.
pub const MAX_MANIFEST_LEN: u32 = 1024 * 1024;

/// Sanity cap for the compressed payload; device flash is small.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Header sent after authentication: sizes of the two sections that follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub manifest_len: u32,
    pub payload_len: u32,
}

impl TransferHeader {
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, UpdateError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 8];
        read_exact(reader, &mut buf).await?;
        Ok(Self {
            manifest_len: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            payload_len: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.manifest_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        writer.write_all(&buf).await
    }

    /// Check the declared lengths against the sanity caps.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.manifest_len == 0 || self.manifest_len > MAX_MANIFEST_LEN {
            return Err(TransferError::CorruptPayload);
        }
        if self.payload_len == 0 || self.payload_len > MAX_PAYLOAD_LEN {
            return Err(TransferError::CorruptPayload);
        }
        Ok(())
    }
}

/// One-byte session status, sent after authentication and again at the end
/// of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    AuthRejected = 0x01,
    Truncated = 0x02,
    CorruptPayload = 0x03,
    InsufficientSpace = 0x04,
    WriteFailed = 0x05,
}

impl Status {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::AuthRejected),
            0x02 => Some(Self::Truncated),
            0x03 => Some(Self::CorruptPayload),
            0x04 => Some(Self::InsufficientSpace),
            0x05 => Some(Self::WriteFailed),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Status the device reports for a failed session. Connection-level
    /// failures map to `Truncated`; they are rarely deliverable anyway.
    pub fn for_error(err: &UpdateError) -> Self {
        match err {
            UpdateError::Auth(_) => Self::AuthRejected,
            UpdateError::Transfer(TransferError::Truncated) => Self::Truncated,
            UpdateError::Transfer(TransferError::CorruptPayload) => Self::CorruptPayload,
            UpdateError::Transfer(TransferError::InsufficientSpace) => Self::InsufficientSpace,
            UpdateError::Transfer(TransferError::WriteFailed) => Self::WriteFailed,
            UpdateError::Network(_) => Self::Truncated,
        }
    }

    /// Error the host surfaces when the device reports a failure status.
    pub fn into_error(self) -> Option<UpdateError> {
        match self {
            Self::Ok => None,
            Self::AuthRejected => Some(AuthError::Rejected.into()),
            Self::Truncated => Some(TransferError::Truncated.into()),
            Self::CorruptPayload => Some(TransferError::CorruptPayload.into()),
            Self::InsufficientSpace => Some(TransferError::InsufficientSpace.into()),
            Self::WriteFailed => Some(TransferError::WriteFailed.into()),
        }
    }
}

/// Read exactly `buf.len()` bytes. EOF short of that is a truncated stream;
/// any other failure is a dropped connection.
pub async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), UpdateError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransferError::Truncated.into()),
        Err(_) => Err(NetworkError::Disconnected.into()),
    }
}

pub async fn write_status<W>(writer: &mut W, status: Status) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[status.as_byte()]).await?;
    writer.flush().await
}

/// Write a status byte, ignoring failures; the peer may already be gone.
pub async fn write_status_best_effort<W>(writer: &mut W, status: Status)
where
    W: AsyncWrite + Unpin,
{
    let _ = write_status(writer, status).await;
}

pub async fn read_status<R>(reader: &mut R) -> Result<Status, UpdateError>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    read_exact(reader, &mut byte).await?;
    Status::from_byte(byte[0]).ok_or_else(|| TransferError::CorruptPayload.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn header_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let header = TransferHeader {
            manifest_len: 412,
            payload_len: 9_000_001,
        };
        header.write_to(&mut client).await.unwrap();
        let parsed = TransferHeader::read_from(&mut server).await.unwrap();
        assert_eq!(parsed, header);
    }

    #[tokio::test]
    async fn header_is_big_endian() {
        let (mut client, mut server) = tokio::io::duplex(64);
        TransferHeader {
            manifest_len: 0x0102_0304,
            payload_len: 0x0A0B_0C0D,
        }
        .write_to(&mut client)
        .await
        .unwrap();

        let mut raw = [0u8; 8];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0x01, 0x02, 0x03, 0x04, 0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[tokio::test]
    async fn short_read_is_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0u8; 5]).await.unwrap();
        drop(client);

        let mut buf = [0u8; 8];
        let err = read_exact(&mut server, &mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Transfer(TransferError::Truncated)
        ));
    }

    #[tokio::test]
    async fn status_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(8);
        write_status(&mut client, Status::InsufficientSpace)
            .await
            .unwrap();
        let status = read_status(&mut server).await.unwrap();
        assert_eq!(status, Status::InsufficientSpace);
        assert!(matches!(
            status.into_error(),
            Some(UpdateError::Transfer(TransferError::InsufficientSpace))
        ));
    }

    #[tokio::test]
    async fn unknown_status_byte_refused() {
        let (mut client, mut server) = tokio::io::duplex(8);
        client.write_all(&[0x7F]).await.unwrap();
        assert!(read_status(&mut server).await.is_err());
    }

    #[test]
    fn header_caps_enforced() {
        assert!(
            TransferHeader {
                manifest_len: 0,
                payload_len: 1
            }
            .validate()
            .is_err()
        );
        assert!(
            TransferHeader {
                manifest_len: 1,
                payload_len: MAX_PAYLOAD_LEN + 1
            }
            .validate()
            .is_err()
        );
        assert!(
            TransferHeader {
                manifest_len: 1,
                payload_len: 1
            }
            .validate()
            .is_ok()
        );
    }
}
