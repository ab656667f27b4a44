//! TXFR wire protocol implementation.
//!
//! Torrxfer uses a lightweight binary frame protocol over TCP, optionally
//! wrapped in TLS 1.3.
//!
//! ## Frame format
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬─────────────────────┐
//! │   Magic    │  Version   │    Type    │      Length         │
//! │  4 bytes   │  2 bytes   │   1 byte   │   4 bytes (BE)      │
//! ├────────────┴────────────┴────────────┴─────────────────────┤
//! │                        Payload                             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x54 0x58 0x46 0x52` ("TXFR")
//! - Version: `0x01 0x00` (1.0)
//!
//! ## Calls
//!
//! A query is one round trip on its own connection:
//! `Query { client_id, file }` → `QueryAck { file }` or `Error`.
//!
//! A transfer stream is `TransferBegin { client_id }`, any number of
//! `TransferChunk` frames in file-offset order, then `TransferDone`; the
//! server answers with `TransferAck` once its writer has drained, or with
//! `Error`. The `client_id` is the job correlation UUID that routes the
//! stream to the file registered by the preceding query.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use uuid::Uuid;

use crate::crypto;
use crate::error::{Error, Result};
use crate::fsutil;

/// Protocol magic bytes: "TXFR"
pub const MAGIC: [u8; 4] = [0x54, 0x58, 0x46, 0x52];

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 11;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Error code for missing or malformed request metadata.
pub const ERROR_CODE_INVALID_ARGUMENT: &str = "invalid_argument";

/// Error code for any internal server failure.
pub const ERROR_CODE_INTERNAL: &str = "internal";

/// Message types in the TXFR protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// File metadata query
    Query = 0x01,
    /// Query response carrying the server's view of the file
    QueryAck = 0x02,
    /// Opens a transfer stream for a previously queried file
    TransferBegin = 0x10,
    /// One block of file data
    TransferChunk = 0x11,
    /// End of the transfer stream
    TransferDone = 0x12,
    /// Server acknowledgment that all bytes were written
    TransferAck = 0x13,
    /// Error response
    Error = 0xFF,
}

impl MessageType {
    /// Parse a message type from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Query),
            0x02 => Some(Self::QueryAck),
            0x10 => Some(Self::TransferBegin),
            0x11 => Some(Self::TransferChunk),
            0x12 => Some(Self::TransferDone),
            0x13 => Some(Self::TransferAck),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// A protocol frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Message type
    pub message_type: MessageType,
    /// Payload length
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.message_type as u8;
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::ProtocolError("invalid magic bytes".to_string()));
        }

        let version = (buf[4], buf[5]);
        let message_type = MessageType::from_byte(buf[6])
            .ok_or_else(|| Error::ProtocolError(format!("unknown message type: {:#x}", buf[6])))?;
        let payload_length = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);

        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::ProtocolError(format!(
                "payload too large: {payload_length} bytes"
            )));
        }

        Ok(Self {
            version,
            message_type,
            payload_length,
        })
    }
}

/// Wire file record exchanged by query calls.
///
/// On a request, `data_hash` is the SHA-256 of the full local file (empty if
/// hashing failed) and `size_on_disk` is zero. On the response, `data_hash`
/// is the SHA-256 of the server's current on-disk partial file and
/// `size_on_disk` its length; the client hashes its local prefix against it
/// to decide whether the partial can be continued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// File base name
    pub name: String,
    /// Hex SHA-256; see type docs for request/response meaning
    #[serde(default)]
    pub data_hash: String,
    /// Sub-path preserved beneath the server's media root
    #[serde(default)]
    pub media_directory: String,
    /// Creation time, if known
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_time: Option<DateTime<Utc>>,
    /// Last modification time, if known
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub modified_time: Option<DateTime<Utc>>,
    /// Size declared by the client
    pub size: u64,
    /// Current on-disk size at the server
    #[serde(default)]
    pub size_on_disk: u64,
}

impl FileInfo {
    /// Build a wire record for a local file, hashing its full content.
    ///
    /// A hashing failure is not fatal: the record is sent with an empty
    /// `data_hash` and the server falls back to size comparison.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be stat'ed.
    pub async fn from_local_file(path: &Path, media_prefix: &str) -> Result<Self> {
        let path = fsutil::clean_path(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?
            .to_string();

        let metadata = tokio::fs::metadata(&path).await?;
        let data_hash = match crypto::sha256_file(&path).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "hashing failed, sending empty hash");
                String::new()
            }
        };

        Ok(Self {
            name,
            data_hash,
            media_directory: media_prefix.to_string(),
            created_time: metadata.created().ok().map(DateTime::from),
            modified_time: metadata.modified().ok().map(DateTime::from),
            size: metadata.len(),
            size_on_disk: 0,
        })
    }
}

/// Query request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPayload {
    /// Job correlation UUID
    pub client_id: Uuid,
    /// The client's view of the file
    pub file: FileInfo,
}

/// Transfer stream opening payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferBeginPayload {
    /// Correlation UUID of the query that registered the file
    pub client_id: Uuid,
}

/// Transfer acknowledgment payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferAckPayload {
    /// Bytes the server wrote during this stream
    pub bytes_written: u64,
}

/// Error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code (`invalid_argument` or `internal`)
    pub code: String,
    /// Human-readable message
    pub message: String,
}

/// One block of file data (binary payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    /// Absolute file offset of this block
    pub offset: u64,
    /// Block data
    pub data: Vec<u8>,
}

/// Encode a message payload to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message payload from JSON bytes.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode a chunk payload (binary format).
///
/// Format: offset (8 bytes BE) | size (4 bytes BE) | data
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_chunk(payload: &ChunkPayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + payload.data.len());
    buf.extend_from_slice(&payload.offset.to_be_bytes());
    buf.extend_from_slice(&(payload.data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload.data);
    buf
}

/// Decode a chunk payload (binary format).
///
/// # Errors
///
/// Returns an error if the payload is truncated or the declared size does
/// not match the data length.
pub fn decode_chunk(data: &[u8]) -> Result<ChunkPayload> {
    if data.len() < 12 {
        return Err(Error::ProtocolError("chunk payload too short".to_string()));
    }

    let offset = u64::from_be_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]);
    let size = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
    if data.len() - 12 != size {
        return Err(Error::ProtocolError(format!(
            "chunk size mismatch: declared {size}, got {}",
            data.len() - 12
        )));
    }

    Ok(ChunkPayload {
        offset,
        data: data[12..].to_vec(),
    })
}

/// Read a complete frame from a stream.
///
/// # Errors
///
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame<R>(reader: &mut R) -> Result<(FrameHeader, Vec<u8>)>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    if header.payload_length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok((header, payload))
}

/// Write a complete frame to a stream.
///
/// # Errors
///
/// Returns an error if writing fails.
pub async fn write_frame<W>(writer: &mut W, message_type: MessageType, payload: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    #[allow(clippy::cast_possible_truncation)]
    let header = FrameHeader {
        version: crate::PROTOCOL_VERSION,
        message_type,
        payload_length: payload.len() as u32,
    };

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read a complete frame from a stream with a timeout.
///
/// # Errors
///
/// Returns `Error::Timeout` if the operation exceeds the specified duration.
pub async fn read_frame_with_timeout<R>(
    reader: &mut R,
    duration: Duration,
) -> Result<(FrameHeader, Vec<u8>)>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    timeout(duration, read_frame(reader))
        .await
        .map_err(|_| Error::Timeout(duration.as_secs()))?
}

/// Decode an `Error` frame into the matching crate error for its phase.
#[must_use]
pub fn error_from_frame(payload: &[u8], during_query: bool) -> Error {
    let decoded: ErrorPayload = decode_payload(payload).unwrap_or_else(|_| ErrorPayload {
        code: ERROR_CODE_INTERNAL.to_string(),
        message: "unreadable error payload".to_string(),
    });
    let text = format!("{}: {}", decoded.code, decoded.message);
    if during_query {
        Error::QueryFailed(text)
    } else {
        Error::TransferFailed(text)
    }
}
