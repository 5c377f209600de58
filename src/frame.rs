//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Outgoing data is described by two types:
//!
//! - [`Payload`]: the canonical byte-chunk sequence every write operation accepts. Strings,
//!   byte slices, `Bytes` and lists of `Bytes` all convert into it.
//! - [`Frame`]: one outgoing wire frame (FIN flag, opcode, optional mask key and payload),
//!   serialized by [`FrameEncoder`](crate::codec::FrameEncoder).
//!
//! Incoming data is reassembled into [`Message`](crate::message::Message) values by the
//! decoders in [`decoder`](crate::decoder).
use bytes::{Bytes, BytesMut};

use crate::{close::CloseCode, WebSocketError};

/// The largest possible frame header: 2 base bytes, 8 extended length bytes and a 4-byte mask.
pub const MAX_HEAD_SIZE: usize = 14;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code (OpCode) that determines the semantic meaning of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected as invalid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes of payload.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// An ordered list of byte chunks forming one outgoing payload.
///
/// Chunks are reference counted [`Bytes`], so building a payload from existing buffers
/// never copies them. The chunks are written back to back and masked as one contiguous
/// stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload {
    chunks: Vec<Bytes>,
}

impl Payload {
    /// An empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Total length in bytes across all chunks.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Returns `true` if the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Bytes::is_empty)
    }

    /// The chunks in write order.
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Appends a chunk at the end of the payload.
    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    /// Joins all chunks into a single contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut out = BytesMut::with_capacity(self.len());
                for chunk in chunks {
                    out.extend_from_slice(chunk);
                }
                out.freeze()
            }
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        let mut payload = Self::default();
        payload.push(value);
        payload
    }
}

impl From<BytesMut> for Payload {
    fn from(value: BytesMut) -> Self {
        Self::from(value.freeze())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::from(Bytes::from(value))
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Self::from(Bytes::copy_from_slice(value))
    }
}

impl<const N: usize> From<&[u8; N]> for Payload {
    fn from(value: &[u8; N]) -> Self {
        Self::from(&value[..])
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::from(Bytes::from(value))
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::from(value.as_bytes())
    }
}

impl From<Vec<Bytes>> for Payload {
    fn from(value: Vec<Bytes>) -> Self {
        let mut payload = Self::default();
        for chunk in value {
            payload.push(chunk);
        }
        payload
    }
}

impl From<CloseCode> for Payload {
    /// The two byte big-endian reason code of a `Close` frame.
    fn from(code: CloseCode) -> Self {
        Self::from(u16::from(code).to_be_bytes().to_vec())
    }
}

/// One outgoing WebSocket frame.
///
/// **Note: this low-level struct should rarely be used directly.** The connection builds
/// frames itself from the `write_*` calls; direct frame manipulation is only needed when
/// encoding frames outside of a connection, for example in tests or tooling.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key applied when the frame is encoded, if any.
    pub mask: Option<[u8; 4]>,
    /// The unmasked payload of the frame.
    pub payload: Payload,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Payload>) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// A final text frame.
    pub fn text(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// A final binary frame.
    pub fn binary(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// A continuation frame, final unless changed with [`Frame::with_fin`].
    pub fn continuation(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    /// A ping frame.
    pub fn ping(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// A pong frame.
    pub fn pong(payload: impl Into<Payload>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// A close frame carrying only the two byte reason code.
    pub fn close(code: CloseCode) -> Self {
        Self::new(true, OpCode::Close, None, code)
    }

    /// Sets the FIN flag.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets the masking key.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }
}
