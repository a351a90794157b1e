//! Stream framing for the remote wire protocol.
//!
//! Frame format: [length varint][flags byte][payload bytes]
//! Flags: DATA(bit 0), END_STREAM(bit 1), ERROR(bit 2)

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size (4MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Longest valid varint encoding of a u64
const MAX_VARINT_LEN: usize = 10;

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const DATA: u8 = 0b0000_0001;
    pub const END_STREAM: u8 = 0b0000_0010;
    pub const ERROR: u8 = 0b0000_0100;

    pub fn new(flags: u8) -> Self {
        Self(flags)
    }

    pub fn is_data(&self) -> bool {
        self.0 & Self::DATA != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.0 & Self::END_STREAM != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// A frame of a response stream
#[derive(Debug, Clone)]
pub struct Frame {
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Data frame carrying one encoded message
    pub fn data(payload: Bytes) -> Self {
        Self {
            flags: FrameFlags::new(FrameFlags::DATA),
            payload,
        }
    }

    /// End-of-stream frame carrying encoded trailer metadata (may be empty)
    pub fn end_stream(trailers: Bytes) -> Self {
        Self {
            flags: FrameFlags::new(FrameFlags::END_STREAM),
            payload: trailers,
        }
    }

    /// Error frame carrying an encoded status
    ///
    /// No DATA frame may follow; the END_STREAM frame with the trailers still does.
    pub fn error(status: Bytes) -> Self {
        Self {
            flags: FrameFlags::new(FrameFlags::ERROR),
            payload: status,
        }
    }

    /// Encode this frame to bytes
    pub fn encode(&self) -> Bytes {
        let payload_len = self.payload.len();
        let mut buf = BytesMut::with_capacity(payload_len + MAX_VARINT_LEN + 1);

        encode_varint(payload_len as u64, &mut buf);
        buf.put_u8(self.flags.as_u8());
        buf.put_slice(&self.payload);

        buf.freeze()
    }
}

/// Frame parser for decoding frames from a byte stream
pub struct FrameParser {
    buffer: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// True when no partial frame is buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Try to parse a complete frame from the buffer
    pub fn parse_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut cursor = std::io::Cursor::new(&self.buffer[..]);

        let payload_len = match decode_varint(&mut cursor)? {
            Some(len) => len as usize,
            None => return Ok(None),
        };

        if payload_len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        let header_len = cursor.position() as usize;

        // +1 for flags byte
        let total_len = header_len + 1 + payload_len;
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let flags = FrameFlags::new(self.buffer[header_len]);
        self.buffer.advance(header_len + 1);
        let payload = self.buffer.split_to(payload_len).freeze();

        Ok(Some(Frame { flags, payload }))
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid varint encoding")]
    InvalidVarint,

    #[error("Stream ended inside a frame")]
    Truncated,
}

/// Encode a u64 as a protobuf varint
fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    loop {
        if value < 0x80 {
            buf.put_u8(value as u8);
            break;
        } else {
            buf.put_u8(((value & 0x7F) | 0x80) as u8);
            value >>= 7;
        }
    }
}

/// Decode a protobuf varint; `Ok(None)` means more data is needed
fn decode_varint<B: Buf>(buf: &mut B) -> Result<Option<u64>, FrameError> {
    let mut value = 0u64;

    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << (7 * i);

        if byte < 0x80 {
            return Ok(Some(value));
        }
    }

    Err(FrameError::InvalidVarint)
}
