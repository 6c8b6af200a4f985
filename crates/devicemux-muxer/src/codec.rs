//! usbmuxd frame codec.
//!
//! # Frame layout
//!
//! ```text
//! [4 bytes: total length incl. header (LE u32)]
//! [4 bytes: protocol version = 1      (LE u32)]
//! [4 bytes: message kind = 8 (plist)  (LE u32)]
//! [4 bytes: tag                       (LE u32)]
//! [N bytes: property list document]
//! ```
//!
//! Reads never consume more than one frame from the stream, so the stream
//! can be handed over as a raw tunnel after a successful `Connect`.

use std::io::Cursor;

use plist::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MuxerError, Result};
use crate::protocol::{MuxerEnvelope, MuxerMessage};

/// Size of the frame header.
pub const HEADER_LEN: usize = 16;

/// Protocol version for property list frames.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message kind for property list frames.
pub const PLIST_MESSAGE: u32 = 8;

/// Largest frame accepted from the muxer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length, header included.
    pub length: u32,
    /// Protocol version.
    pub version: u32,
    /// Message kind.
    pub message: u32,
    /// Request tag, echoed by the muxer in its reply.
    pub tag: u32,
}

impl FrameHeader {
    /// Encode the header.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.message.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.tag.to_le_bytes());
        bytes
    }

    /// Decode a header.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            length: word(0),
            version: word(4),
            message: word(8),
            tag: word(12),
        }
    }

    /// Length of the payload following the header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header describes a frame that is shorter than
    /// the header, larger than [`MAX_FRAME_LEN`], or not a property list frame.
    pub fn payload_len(&self) -> Result<usize> {
        let length = self.length as usize;
        if length < HEADER_LEN {
            return Err(MuxerError::InvalidFrame(format!(
                "frame length {length} is shorter than the header"
            )));
        }
        if length > MAX_FRAME_LEN {
            return Err(MuxerError::InvalidFrame(format!(
                "frame length {length} exceeds maximum {MAX_FRAME_LEN}"
            )));
        }
        if self.version != PROTOCOL_VERSION || self.message != PLIST_MESSAGE {
            return Err(MuxerError::InvalidFrame(format!(
                "unsupported frame version {} kind {}",
                self.version, self.message
            )));
        }
        Ok(length - HEADER_LEN)
    }
}

/// Encode a message into a complete frame.
///
/// # Errors
///
/// Returns an error if the property list cannot be serialized.
pub fn encode_frame(message: &MuxerMessage, envelope: &MuxerEnvelope, tag: u32) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    Value::Dictionary(message.to_dictionary(envelope)).to_writer_xml(&mut payload)?;

    let length = u32::try_from(HEADER_LEN + payload.len())
        .map_err(|_| MuxerError::InvalidFrame("message too large".to_string()))?;
    let header = FrameHeader {
        length,
        version: PROTOCOL_VERSION,
        message: PLIST_MESSAGE,
        tag,
    };

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame payload into a message.
///
/// # Errors
///
/// Returns an error if the payload is not a property list dictionary or is
/// not a known message.
pub fn decode_payload(payload: &[u8]) -> Result<MuxerMessage> {
    let value = Value::from_reader(Cursor::new(payload))?;
    let dict = value
        .as_dictionary()
        .ok_or_else(|| MuxerError::InvalidFrame("payload is not a dictionary".to_string()))?;
    MuxerMessage::from_dictionary(dict)
}

/// Write a message as a single frame.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub async fn write_message<W>(
    writer: &mut W,
    message: &MuxerMessage,
    envelope: &MuxerEnvelope,
    tag: u32,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(message, envelope, tag)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a single frame and decode it.
///
/// Returns `Ok(None)` when the peer closed the connection before sending a
/// header. A connection closed in the middle of a frame is an error.
///
/// # Errors
///
/// Returns an error if reading fails or the frame is malformed.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<(FrameHeader, MuxerMessage)>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_bytes = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(MuxerError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }

    let header = FrameHeader::from_bytes(&header_bytes);
    let mut payload = vec![0u8; header.payload_len()?];
    reader.read_exact(&mut payload).await?;

    let message = decode_payload(&payload)?;
    Ok(Some((header, message)))
}
