//! Frame encoding and decoding for the worker stream.
//!
//! Wire format: an 8-byte frame header followed by the rkyv-serialised
//! [`StreamingMessage`].
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────────────┐
//! │  Version (2) │   Kind (2)   │    Payload Length (4)      │
//! ├──────────────┴──────────────┴────────────────────────────┤
//! │              rkyv-serialised StreamingMessage            │
//! └──────────────────────────────────────────────────────────┘
//! ```

use rkyv::rancor::Error as RkyvError;

use crate::error::ProtocolError;
use crate::streaming::{MessageKind, StreamingMessage};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum message size (10 MB). Larger payloads go through shared memory.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Current protocol version.
pub const CURRENT_VERSION: u16 = 1;

/// Minimum supported protocol version.
pub const MIN_SUPPORTED_VERSION: u16 = 1;

/// Frame header for stream messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version.
    pub version: u16,
    /// Message kind discriminant.
    pub kind: MessageKind,
    /// Length of the payload in bytes.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Creates a new frame header at the current version.
    #[must_use]
    pub const fn new(kind: MessageKind, payload_len: u32) -> Self {
        Self {
            version: CURRENT_VERSION,
            kind,
            payload_len,
        }
    }

    /// Encodes the frame header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.kind.as_u16().to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decodes a frame header from bytes.
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        let kind_raw = u16::from_be_bytes([bytes[2], bytes[3]]);
        let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let kind =
            MessageKind::from_u16(kind_raw).ok_or(ProtocolError::UnknownMessageKind(kind_raw))?;

        Ok(Self {
            version,
            kind,
            payload_len,
        })
    }

    /// Checks if this header's version is supported.
    #[must_use]
    pub const fn is_version_supported(&self) -> bool {
        self.version >= MIN_SUPPORTED_VERSION && self.version <= CURRENT_VERSION
    }

    /// Validates the payload length against the size limit.
    pub fn validate_payload_len(&self) -> Result<(), ProtocolError> {
        let len = self.payload_len as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }
}

/// Codec for encoding and decoding stream messages.
#[derive(Debug, Default)]
pub struct Codec {
    /// Reusable buffer for encoding.
    buffer: Vec<u8>,
}

impl Codec {
    /// Creates a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Creates a codec with pre-allocated buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Encodes a message to bytes (frame header + payload).
    ///
    /// Returns the complete frame including the 8-byte header.
    pub fn encode(&mut self, message: &StreamingMessage) -> Result<&[u8], ProtocolError> {
        let payload = rkyv::to_bytes::<RkyvError>(message)
            .map_err(|e| ProtocolError::Serialisation(e.to_string()))?;

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let header = FrameHeader::new(message.kind(), payload.len() as u32);
        self.buffer.clear();
        self.buffer.extend_from_slice(&header.encode());
        self.buffer.extend_from_slice(&payload);

        Ok(&self.buffer)
    }

    /// Decodes a message from payload bytes.
    ///
    /// The bytes should NOT include the frame header, just the payload.
    pub fn decode(bytes: &[u8]) -> Result<StreamingMessage, ProtocolError> {
        rkyv::from_bytes::<StreamingMessage, RkyvError>(bytes)
            .map_err(|e| ProtocolError::Deserialisation(e.to_string()))
    }
}
