//! Checksummed framing of transport messages.
//!
//! Every message handed to the transport is framed as:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────┐
//! │   Length     │   Checksum   │            Payload               │
//! │   (4 bytes)  │   (4 bytes)  │         (variable)               │
//! └──────────────┴──────────────┴──────────────────────────────────┘
//! ```
//!
//! - **Length**: Big-endian u32 of payload size (excludes header)
//! - **Checksum**: CRC32 of the payload
//! - **Payload**: bincode-serialized [`MessagePayload`]
//!
//! Transports deliver whole messages, so unlike a stream decoder there is
//! no partial-frame state: a frame either decodes completely or is rejected.

use crate::message::MessagePayload;

/// Size of the frame header in bytes (length + checksum).
pub const HEADER_SIZE: usize = 8;

/// Errors that can occur while framing messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Frame shorter than its header or its declared length.
    #[error("truncated frame: have {have} bytes, need {need} bytes")]
    Truncated { have: usize, need: usize },

    /// Payload longer than a u32 length can express.
    #[error("message too large: {size} bytes")]
    MessageTooLarge { size: usize },

    /// Payload checksum doesn't match.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Failed to deserialize the payload.
    #[error("deserialization failed: {0}")]
    Deserialize(String),

    /// Failed to serialize the payload.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// Encodes a message into a framed byte buffer.
pub fn encode(message: &MessagePayload) -> Result<Vec<u8>, CodecError> {
    let payload =
        bincode::serialize(message).map_err(|e| CodecError::Serialize(e.to_string()))?;

    let payload_len = u32::try_from(payload.len()).map_err(|_| CodecError::MessageTooLarge {
        size: payload.len(),
    })?;
    let checksum = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&payload_len.to_be_bytes());
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(&payload);

    debug_assert_eq!(frame.len(), HEADER_SIZE + payload.len());

    Ok(frame)
}

/// Returns the framed size of a message without building the frame.
#[cfg(test)]
pub(crate) fn encoded_len(message: &MessagePayload) -> Result<usize, CodecError> {
    let size =
        bincode::serialized_size(message).map_err(|e| CodecError::Serialize(e.to_string()))?;
    Ok(HEADER_SIZE + size as usize)
}

/// Decodes one framed message.
///
/// Trailing bytes beyond the declared length are rejected as corruption.
pub fn decode(frame: &[u8]) -> Result<MessagePayload, CodecError> {
    if frame.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            have: frame.len(),
            need: HEADER_SIZE,
        });
    }

    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let checksum = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

    let total = HEADER_SIZE + length;
    if frame.len() < total {
        return Err(CodecError::Truncated {
            have: frame.len(),
            need: total,
        });
    }
    if frame.len() > total {
        return Err(CodecError::Deserialize(format!(
            "{} trailing bytes after frame",
            frame.len() - total
        )));
    }

    let payload = &frame[HEADER_SIZE..total];
    let actual = crc32fast::hash(payload);
    if actual != checksum {
        return Err(CodecError::ChecksumMismatch {
            expected: checksum,
            actual,
        });
    }

    bincode::deserialize(payload).map_err(|e| CodecError::Deserialize(e.to_string()))
}
