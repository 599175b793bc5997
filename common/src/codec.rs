//! Wire framing used once the handshake has finished.
//!
//! ```text
//! frame   := length(4, big-endian) || payload
//! payload := msg_type(4, big-endian) || data            (plaintext)
//!          | seal(msg_type(4, big-endian) || data)      (encrypted)
//! ```

use std::io::{Read, Write};

use crate::{
    crypto::{Encryption, SEAL_OVERHEAD},
    error::FrameError,
    message::{Message, CONTROL_MSG_TYPE},
};

/// Bytes in the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;
/// Bytes in the message type tag
pub const TYPE_TAG_SIZE: usize = 4;

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Reserved type 0, consumed by the protocol layer
    Control(Vec<u8>),
    /// Application payload
    Message(Message),
}

/// Largest length prefix a reader accepts for the given message size limit
pub fn inbound_limit(max_msg_size: usize, encrypted: bool) -> usize {
    let overhead = if encrypted { SEAL_OVERHEAD } else { 0 };
    TYPE_TAG_SIZE + max_msg_size + overhead
}

/// Builds a complete frame, length prefix included, in a single buffer
pub fn encode_frame(
    msg_type: u32,
    data: &[u8],
    encryption: Option<&Encryption>,
) -> Result<Vec<u8>, FrameError> {
    let mut payload = Vec::with_capacity(TYPE_TAG_SIZE + data.len());
    payload.extend_from_slice(&msg_type.to_be_bytes());
    payload.extend_from_slice(data);

    if let Some(encryption) = encryption {
        payload = encryption.seal(&payload)?;
    }

    let len = u32::try_from(payload.len()).map_err(|_| FrameError::Oversized {
        len:   payload.len(),
        limit: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Writes one frame with a single `write_all` followed by a flush
pub fn write_frame<W: Write>(
    writer: &mut W,
    msg_type: u32,
    data: &[u8],
    encryption: Option<&Encryption>,
) -> Result<(), FrameError> {
    let frame = encode_frame(msg_type, data, encryption)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads exactly one frame.
///
/// Any I/O error, including end of stream, is returned as
/// [`FrameError::Io`]. Length prefixes outside `TYPE_TAG_SIZE..=limit` are
/// rejected before the payload is read.
pub fn read_frame<R: Read>(
    reader: &mut R,
    encryption: Option<&Encryption>,
    limit: usize,
) -> Result<Frame, FrameError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > limit {
        return Err(FrameError::Oversized { len, limit });
    }
    if len < TYPE_TAG_SIZE {
        return Err(FrameError::Truncated(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    if let Some(encryption) = encryption {
        payload = encryption.open(&payload)?;
        if payload.len() < TYPE_TAG_SIZE {
            return Err(FrameError::Truncated(payload.len()));
        }
    }

    let data = payload.split_off(TYPE_TAG_SIZE);
    let msg_type = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

    if msg_type == CONTROL_MSG_TYPE {
        Ok(Frame::Control(data))
    } else {
        Ok(Frame::Message(Message { msg_type, data }))
    }
}
