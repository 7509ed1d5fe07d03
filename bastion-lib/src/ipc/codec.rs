//! Frame codec for protobuf messages with CRC32 integrity validation.
//!
//! Frame format:
//! - u32 length (N) of protobuf message bytes (little-endian)
//! - u32 crc32 checksum over the message bytes (little-endian)
//! - N bytes protobuf message (prost-encoded)

use bytes::{BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, timeout};

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Errors raised by the codec and the local-socket transport
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IpcError {
    #[error("Timeout occurred during {operation}")]
    Timeout { operation: &'static str },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    TooLarge { size: usize, max_size: usize },

    #[error("CRC32 mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    Encode(String),

    #[error("Peer connection closed")]
    PeerClosed,

    #[error("Invalid message length: {length}")]
    InvalidLength { length: u32 },

    #[error("No message handler set")]
    NoHandler,

    #[error("Request handler panicked while serving {command}")]
    HandlerPanicked { command: String },
}

impl IpcError {
    /// Whether the failure was a connect/read/write timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Codec for encoding and decoding protobuf messages with CRC32 validation
pub struct IpcCodec {
    max_frame_len: usize,
    read_buf: BytesMut,
}

impl IpcCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    /// Write a protobuf message with framing and CRC32 validation
    pub async fn write_message<T, W>(
        &mut self,
        writer: &mut W,
        message: &T,
        write_timeout: Duration,
    ) -> IpcResult<()>
    where
        T: prost::Message,
        W: AsyncWrite + Unpin,
    {
        let mut message_bytes = BytesMut::new();
        message
            .encode(&mut message_bytes)
            .map_err(|e| IpcError::Encode(e.to_string()))?;

        let message_len = message_bytes.len();
        if message_len == 0 {
            return Err(IpcError::InvalidLength { length: 0 });
        }
        if message_len > self.max_frame_len {
            return Err(IpcError::TooLarge {
                size: message_len,
                max_size: self.max_frame_len,
            });
        }
        let frame_len_field = u32::try_from(message_len).map_err(|_| IpcError::TooLarge {
            size: message_len,
            max_size: self.max_frame_len,
        })?;

        let crc32 = crc32fast::hash(&message_bytes);

        let mut frame = BytesMut::with_capacity(8 + message_len);
        frame.put_u32_le(frame_len_field);
        frame.put_u32_le(crc32);
        frame.extend_from_slice(&message_bytes);

        timeout(write_timeout, writer.write_all(&frame))
            .await
            .map_err(|_| IpcError::Timeout { operation: "write" })??;

        timeout(write_timeout, writer.flush())
            .await
            .map_err(|_| IpcError::Timeout { operation: "flush" })??;

        Ok(())
    }

    /// Read a protobuf message with framing and CRC32 validation
    pub async fn read_message<T, R>(
        &mut self,
        reader: &mut R,
        read_timeout: Duration,
    ) -> IpcResult<T>
    where
        T: prost::Message + Default,
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 8];
        timeout(read_timeout, reader.read_exact(&mut header))
            .await
            .map_err(|_| IpcError::Timeout { operation: "read" })?
            .map_err(map_read_error)?;

        let [l0, l1, l2, l3, c0, c1, c2, c3] = header;
        let raw_len = u32::from_le_bytes([l0, l1, l2, l3]);
        let expected_crc32 = u32::from_le_bytes([c0, c1, c2, c3]);
        let message_len = usize::try_from(raw_len).unwrap_or(usize::MAX);

        if message_len == 0 {
            return Err(IpcError::InvalidLength { length: 0 });
        }
        if message_len > self.max_frame_len {
            return Err(IpcError::TooLarge {
                size: message_len,
                max_size: self.max_frame_len,
            });
        }

        self.read_buf.clear();
        self.read_buf.resize(message_len, 0);

        timeout(read_timeout, reader.read_exact(&mut self.read_buf))
            .await
            .map_err(|_| IpcError::Timeout { operation: "read" })?
            .map_err(map_read_error)?;

        let actual_crc32 = crc32fast::hash(&self.read_buf);
        if expected_crc32 != actual_crc32 {
            return Err(IpcError::CrcMismatch {
                expected: expected_crc32,
                actual: actual_crc32,
            });
        }

        Ok(T::decode(&self.read_buf[..])?)
    }
}

impl Default for IpcCodec {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

fn map_read_error(e: io::Error) -> IpcError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        IpcError::PeerClosed
    } else {
        IpcError::Io(e)
    }
}
