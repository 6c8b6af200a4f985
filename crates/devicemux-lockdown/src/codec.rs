//! Lockdown frame codec.
//!
//! Lockdown and the services it starts exchange XML property lists, each
//! prefixed by its length as a 4-byte big-endian integer.

use std::io::Cursor;

use plist::{Dictionary, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{LockdownError, Result};

/// Largest message accepted from a device.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Write a dictionary as one length-prefixed XML property list.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub async fn write_plist<W>(writer: &mut W, dict: &Dictionary) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut payload = Vec::new();
    Value::Dictionary(dict.clone()).to_writer_xml(&mut payload)?;

    let length = u32::try_from(payload.len())
        .map_err(|_| LockdownError::InvalidFrame("message too large".to_string()))?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed property list dictionary.
///
/// # Errors
///
/// Returns `LockdownError::ConnectionClosed` if the stream ends before a
/// length prefix, or an error if the frame is malformed.
pub async fn read_plist<R>(reader: &mut R) -> Result<Dictionary>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(LockdownError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(len_bytes) as usize;
    if length > MAX_MESSAGE_LEN {
        return Err(LockdownError::InvalidFrame(format!(
            "message length {length} exceeds maximum {MAX_MESSAGE_LEN}"
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    trace!(length, "Read lockdown message");

    Value::from_reader(Cursor::new(payload))?
        .into_dictionary()
        .ok_or_else(|| LockdownError::InvalidFrame("message is not a dictionary".to_string()))
}

/// A stream carrying length-prefixed property lists.
///
/// The stream can be borrowed for raw transfers (image uploads) and taken
/// back out for a TLS upgrade.
#[derive(Debug)]
pub struct PlistChannel<S> {
    stream: S,
}

impl<S> PlistChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Send a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be written.
    pub async fn send(&mut self, dict: &Dictionary) -> Result<()> {
        write_plist(&mut self.stream, dict).await
    }

    /// Receive a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream closes or the message is malformed.
    pub async fn receive(&mut self) -> Result<Dictionary> {
        read_plist(&mut self.stream).await
    }

    /// Send a message and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if either direction fails.
    pub async fn exchange(&mut self, dict: &Dictionary) -> Result<Dictionary> {
        self.send(dict).await?;
        self.receive().await
    }

    /// Write raw bytes to the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_has_big_endian_length_prefix() {
        let mut dict = Dictionary::new();
        dict.insert("Request".to_string(), Value::String("QueryType".to_string()));

        let mut buf = Vec::new();
        write_plist(&mut buf, &dict).await.unwrap();

        let length = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(length, buf.len() - 4);
        assert!(std::str::from_utf8(&buf[4..]).unwrap().contains("<key>Request</key>"));

        let mut reader: &[u8] = &buf;
        assert_eq!(read_plist(&mut reader).await.unwrap(), dict);
    }

    #[tokio::test]
    async fn closed_stream_is_reported() {
        let mut empty: &[u8] = &[];
        assert!(matches!(
            read_plist(&mut empty).await,
            Err(LockdownError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let mut reader: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            read_plist(&mut reader).await,
            Err(LockdownError::InvalidFrame(_))
        ));
    }

    #[tokio::test]
    async fn non_dictionary_message_is_rejected() {
        let mut payload = Vec::new();
        Value::String("hello".to_string())
            .to_writer_xml(&mut payload)
            .unwrap();
        let mut buf = u32::try_from(payload.len()).unwrap().to_be_bytes().to_vec();
        buf.extend_from_slice(&payload);

        let mut reader: &[u8] = &buf;
        assert!(matches!(
            read_plist(&mut reader).await,
            Err(LockdownError::InvalidFrame(_))
        ));
    }
}
