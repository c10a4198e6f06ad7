//! Length framing for the wire protocol.
//!
//! Every frame is a big-endian `u32` length followed by the content. The
//! length counts itself, so a frame carrying `n` content bytes declares
//! `n + 4`. A declared length of zero is a heartbeat.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::MAX_NO_LOAD_LEN;

/// Size of the length prefix
pub const LENGTH_SIZE: usize = 4;

/// Default maximum content size (1 MiB)
pub const DEFAULT_MAX_CONTENT_SIZE: usize = 1024 * 1024;

/// A heartbeat frame (length field of zero)
pub const HEARTBEAT_FRAME: [u8; LENGTH_SIZE] = [0; LENGTH_SIZE];

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Liveness frame with no content
    Heartbeat,
    /// Request or response content
    Content(Bytes),
}

/// Get the encoded size of a frame carrying `content_len` bytes
pub fn encoded_size(content_len: usize) -> usize {
    LENGTH_SIZE + content_len
}

/// Encode content into a length-prefixed frame
pub fn encode_frame(content: &[u8]) -> Bytes {
    let total = encoded_size(content.len());
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(total as u32);
    buf.put_slice(content);
    buf.freeze()
}

/// Build a heartbeat frame
pub fn heartbeat_frame() -> Bytes {
    Bytes::from_static(&HEARTBEAT_FRAME)
}

/// Streaming frame decoder
#[derive(Debug)]
pub struct FrameDecoder {
    max_content_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder accepting the default content size
    pub fn new() -> Self {
        Self::with_max_content(DEFAULT_MAX_CONTENT_SIZE)
    }

    /// Create a decoder that accepts responses carrying up to `max_bytes`
    /// of application data
    pub fn with_max_content(max_bytes: usize) -> Self {
        Self {
            max_content_size: max_bytes.saturating_add(MAX_NO_LOAD_LEN),
        }
    }

    /// Maximum accepted content size
    pub fn max_content_size(&self) -> usize {
        self.max_content_size
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a frame; the
    /// partial bytes are left in place for the next call.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        if buf.len() < LENGTH_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len == 0 {
            buf.advance(LENGTH_SIZE);
            return Ok(Some(Frame::Heartbeat));
        }

        if frame_len < LENGTH_SIZE {
            return Err(crate::WireError::Malformed);
        }

        let content_len = frame_len - LENGTH_SIZE;
        if content_len > self.max_content_size {
            return Err(crate::WireError::Size(content_len));
        }

        if buf.len() < frame_len {
            return Ok(None);
        }

        buf.advance(LENGTH_SIZE);
        let content = buf.split_to(content_len).freeze();

        Ok(Some(Frame::Content(content)))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
