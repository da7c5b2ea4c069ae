//! Length-delimited framing for the bridge wire protocol
//!
//! Every message on the wire is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! payload. The codec knows nothing about message semantics; see `bridge_messages` for those.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bridge_messages::BridgeError;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum payload size accepted on the wire (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the buffer used for each socket read
const READ_CHUNK_SIZE: usize = 8192;

/// Encodes a payload into a frame
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
    encode_frame_with_limit(payload, MAX_MESSAGE_SIZE)
}

/// Encodes a payload into a frame, rejecting payloads above `max_size`
pub fn encode_frame_with_limit(payload: &[u8], max_size: usize) -> Result<Vec<u8>, BridgeError> {
    if payload.len() > max_size || payload.len() > i32::MAX as usize {
        return Err(BridgeError::FramingError(format!(
            "Message of {} bytes exceeds maximum size of {} bytes",
            payload.len(),
            max_size
        )));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Serializes a message to JSON and frames it
pub fn encode_message<T: Serialize>(message: &T, max_size: usize) -> Result<Vec<u8>, BridgeError> {
    let payload = serde_json::to_vec(message)?;
    encode_frame_with_limit(&payload, max_size)
}

/// Parses a JSON message out of a frame payload
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BridgeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Incremental frame decoder
///
/// Bytes are pushed in whatever chunks the socket delivers them, frames are pulled out once
/// complete. A partial length prefix or payload stays buffered until the next push.
/// After a malformed length prefix the decoder is poisoned and every later call fails.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_size: usize,
    poisoned: Option<String>,
}

impl FrameDecoder {
    /// Creates a decoder with the default maximum message size
    pub fn new() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }

    /// Creates a decoder with a custom maximum message size
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size,
            poisoned: None,
        }
    }

    /// Appends received bytes to the internal buffer
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet returned as a frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pulls the next complete payload out of the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, BridgeError> {
        if let Some(reason) = &self.poisoned {
            return Err(BridgeError::FramingError(reason.clone()));
        }

        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let prefix = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
        let length = i32::from_be_bytes(prefix);
        if length < 0 {
            return Err(self.poison(format!("Negative frame length {}", length)));
        }

        let length = length as usize;
        if length > self.max_size {
            return Err(self.poison(format!(
                "Frame length {} exceeds maximum size of {} bytes",
                length, self.max_size
            )));
        }

        if self.buffer.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        let payload = self.buffer[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length].to_vec();
        self.buffer.drain(..LENGTH_PREFIX_SIZE + length);
        Ok(Some(payload))
    }

    fn poison(&mut self, reason: String) -> BridgeError {
        self.buffer.clear();
        self.poisoned = Some(reason.clone());
        BridgeError::FramingError(reason)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads frames from an async byte stream
///
/// Calling `next_frame` repeatedly yields payloads in order. The method is cancel-safe: if the
/// future is dropped inside `select!`, already-read bytes stay in the decoder.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a reader with the default maximum message size
    pub fn new(reader: R) -> Self {
        Self::with_max_size(reader, MAX_MESSAGE_SIZE)
    }

    /// Creates a reader with a custom maximum message size
    pub fn with_max_size(reader: R, max_size: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::with_max_size(max_size),
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Waits for the next payload
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between frames, and
    /// `ConnectionLost` when it closed in the middle of a frame.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, BridgeError> {
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return Ok(Some(payload));
            }

            let read = self.reader.read(&mut self.chunk).await?;
            if read == 0 {
                if self.decoder.buffered_len() == 0 {
                    return Ok(None);
                }
                return Err(BridgeError::ConnectionLost(format!(
                    "Stream closed with {} bytes of an incomplete frame",
                    self.decoder.buffered_len()
                )));
            }
            self.decoder.push(&self.chunk[..read]);
        }
    }

    /// Gives back the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes a single frame and flushes the writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), BridgeError> {
    let frame = encode_frame(payload)?;
    write_encoded(writer, &frame).await
}

/// Writes bytes that are already framed and flushes the writer
pub async fn write_encoded<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), BridgeError> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "frame_codec_tests.rs"]
mod frame_codec_tests;
