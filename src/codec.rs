// Link framing codec - length-prefixed typed frames over a byte stream.
//
// This module owns the wire format of the ship<->offshore link and nothing
// else. Payload bytes are opaque here; the HTTP layer above decides what
// they mean. The decoder is a stateful partial-buffer consumer so the read
// loop can feed it raw socket chunks of any size.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Frame header size: u32 big-endian payload length plus one type byte.
pub const HEADER_LEN: usize = 5;

/// Default cap on a single frame payload.
///
/// The wire format allows up to `u32::MAX` bytes; anything above this cap is
/// treated as a fatal protocol error so a corrupt length prefix cannot make
/// the decoder wait on gigabytes that will never arrive.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Wire frame type discriminant.
///
/// In message mode a REQUEST carries a complete HTTP request blob and a
/// RESPONSE a complete HTTP response blob; in tunnel mode both carry opaque
/// tunnel bytes (REQUEST towards the origin, RESPONSE towards the client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Request = 0,
    Response = 1,
}

/// One self-delimiting record on the link.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(payload: impl Into<Bytes>) -> Self {
        Frame {
            frame_type: FrameType::Request,
            payload: payload.into(),
        }
    }

    pub fn response(payload: impl Into<Bytes>) -> Self {
        Frame {
            frame_type: FrameType::Response,
            payload: payload.into(),
        }
    }

    /// Size of this frame once encoded, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Codec errors. All of these are fatal to the link that produced them.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown frame type byte {0:#04x}")]
    UnknownFrameType(u8),

    #[error("frame payload of {len} bytes exceeds the {max} byte cap")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("payload of {0} bytes cannot be carried in a single frame")]
    PayloadTooLarge(usize),

    #[error("decoder fed after close")]
    Closed,
}

/// Encode one frame into a contiguous buffer of `HEADER_LEN + payload` bytes.
///
/// The only failure mode is a payload too large for the u32 length prefix;
/// the type byte is statically valid by construction.
pub fn encode(frame: &Frame) -> Result<Bytes, CodecError> {
    let len = u32::try_from(frame.payload.len())
        .map_err(|_| CodecError::PayloadTooLarge(frame.payload.len()))?;

    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    buf.put_u32(len);
    buf.put_u8(frame.frame_type.into());
    buf.put_slice(&frame.payload);
    Ok(buf.freeze())
}

/// Stateful frame extractor fed chunk-by-chunk from a socket.
///
/// Single-producer, single-consumer: exactly one read loop pushes into a
/// given decoder. Partial frames stay buffered across pushes; `close()`
/// drops any partial state and refuses further input.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: u32,
    closed: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: u32) -> Self {
        FrameDecoder {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_len,
            closed: false,
        }
    }

    /// Append a chunk and drain every complete frame it makes available.
    ///
    /// Feeding a chunk that only partially covers a frame yields an empty
    /// vec; the remainder is consumed on a later push. The chunk boundaries
    /// never matter: any partition of the same byte stream produces the same
    /// frame sequence.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, CodecError> {
        self.extend(chunk)?;
        let mut frames = Vec::new();
        while let Some(frame) = self.try_next()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Append raw bytes without extracting anything yet.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Extract the next complete frame, if the buffer holds one.
    ///
    /// Frames already complete when a corrupt header enters the buffer are
    /// still yielded; the error surfaces once extraction reaches it.
    pub fn try_next(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);

        // Validate the header before waiting for the payload, so a corrupt
        // length or type byte fails fast instead of stalling the link.
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let frame_type = FrameType::try_from(self.buffer[4])
            .map_err(|_| CodecError::UnknownFrameType(self.buffer[4]))?;

        if self.buffer.len() < HEADER_LEN + len as usize {
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(len as usize).freeze();
        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }

    /// Drop buffered partial state and refuse further input.
    pub fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }

    /// Bytes currently buffered waiting for the rest of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
