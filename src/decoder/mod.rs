//! Incoming frame decoders.
//!
//! Every decoder is a resumable state machine fed with arbitrary chunks of the byte stream.
//! Headers cut at any byte are kept in a 14-byte scratch buffer, payloads are unmasked in
//! place and handed out as zero-copy slices of the received chunk.
//!
//! The three decoders share the header parsing and differ in how frames become messages:
//!
//! | Mode | Output | Fragmented messages |
//! |---|---|---|
//! | [`Standard`](FrameReceiveMode::Standard) | [`MessageReadStream`](crate::MessageReadStream), emitted at the first header | reassembled as a stream |
//! | [`Simple`](FrameReceiveMode::Simple) | [`SimpleMessage`](crate::SimpleMessage), emitted at FIN | buffered |
//! | [`Lite`](FrameReceiveMode::Lite) | [`SimpleMessage`](crate::SimpleMessage), one per frame | rejected |
use bytes::{Buf, Bytes, BytesMut};

use crate::{
    frame::{OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask,
    message::Message,
    Result, WebSocketError,
};

mod lite;
mod simple;
mod standard;

pub use lite::LiteDecoder;
pub use simple::SimpleDecoder;
pub use standard::StandardDecoder;

/// Selects how incoming frames are turned into messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrameReceiveMode {
    /// Messages are streamed chunk by chunk as frames arrive.
    #[default]
    Standard,
    /// Every frame is a complete message; fragmented frames are rejected.
    Lite,
    /// All frames of a message are buffered and the message is emitted at its final frame.
    Simple,
}

/// A frame decoder running one of the [`FrameReceiveMode`] strategies.
pub struct Decoder {
    inner: Inner,
}

enum Inner {
    Standard(StandardDecoder),
    Lite(LiteDecoder),
    Simple(SimpleDecoder),
}

impl Decoder {
    /// Creates a decoder for `mode` rejecting messages above `max_message_size` bytes.
    pub fn new(mode: FrameReceiveMode, max_message_size: usize) -> Self {
        let inner = match mode {
            FrameReceiveMode::Standard => Inner::Standard(StandardDecoder::new(max_message_size)),
            FrameReceiveMode::Lite => Inner::Lite(LiteDecoder::new(max_message_size)),
            FrameReceiveMode::Simple => Inner::Simple(SimpleDecoder::new(max_message_size)),
        };
        Self { inner }
    }

    /// Consumes `chunk`, appending every message it produces to `out`.
    ///
    /// Messages produced before a failure stay in `out`. After a failure the decoder is
    /// reset, so an open [`MessageReadStream`](crate::MessageReadStream) ends with
    /// [`WebSocketError::MessageAborted`].
    pub fn decode(&mut self, chunk: BytesMut, out: &mut Vec<Message>) -> Result<()> {
        let res = match &mut self.inner {
            Inner::Standard(decoder) => decoder.decode(chunk, out),
            Inner::Lite(decoder) => decoder.decode(chunk, out),
            Inner::Simple(decoder) => decoder.decode(chunk, out),
        };
        if res.is_err() {
            self.reset();
        }
        res
    }

    /// Drops the partial header, the partial payload and the open message, if any.
    pub fn reset(&mut self) {
        match &mut self.inner {
            Inner::Standard(decoder) => decoder.reset(),
            Inner::Lite(decoder) => decoder.reset(),
            Inner::Simple(decoder) => decoder.reset(),
        }
    }
}

/// The parsed header of an incoming frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameHead {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

/// Accumulates header bytes across chunk boundaries.
///
/// The first two bytes are validated as soon as they are available; the extended length and
/// the masking key follow when the first two bytes announce them.
pub(crate) struct HeaderReader {
    buf: [u8; MAX_HEAD_SIZE],
    filled: usize,
}

impl HeaderReader {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_HEAD_SIZE],
            filled: 0,
        }
    }

    pub fn reset(&mut self) {
        self.filled = 0;
    }

    /// Consumes header bytes from `src`, returning the header once it is complete.
    pub fn read(&mut self, src: &mut BytesMut) -> Result<Option<FrameHead>> {
        if self.filled < 2 {
            self.fill(src, 2);
            if self.filled < 2 {
                return Ok(None);
            }

            if self.buf[0] & 0b0111_0000 != 0 {
                return Err(WebSocketError::ReservedBitsNotZero);
            }
            OpCode::try_from(self.buf[0] & 0b0000_1111)?;
        }

        let header_size = self.header_size();
        self.fill(src, header_size);
        if self.filled < header_size {
            return Ok(None);
        }
        self.filled = 0;

        let fin = self.buf[0] & 0b1000_0000 != 0;
        let opcode = OpCode::try_from(self.buf[0] & 0b0000_1111)?;
        let masked = self.buf[1] & 0b1000_0000 != 0;

        let (payload_len, at) = match self.buf[1] & 0x7F {
            126 => (u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]])), 4),
            127 => {
                let mut len = [0; 8];
                len.copy_from_slice(&self.buf[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            len => (u64::from(len), 2),
        };

        if payload_len >> 63 != 0 {
            return Err(WebSocketError::MessageTooLarge);
        }

        let mask = masked.then(|| {
            [
                self.buf[at],
                self.buf[at + 1],
                self.buf[at + 2],
                self.buf[at + 3],
            ]
        });

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }

        Ok(Some(FrameHead {
            fin,
            opcode,
            mask,
            payload_len,
        }))
    }

    fn header_size(&self) -> usize {
        let extra = match self.buf[1] & 0x7F {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask = if self.buf[1] & 0b1000_0000 != 0 { 4 } else { 0 };
        2 + extra + mask
    }

    fn fill(&mut self, src: &mut BytesMut, upto: usize) {
        let n = (upto - self.filled).min(src.len());
        self.buf[self.filled..self.filled + n].copy_from_slice(&src[..n]);
        src.advance(n);
        self.filled += n;
    }
}

/// Reads the payload of one frame, unmasking it as it arrives.
pub(crate) struct PayloadReader {
    remaining: u64,
    mask: Option<[u8; 4]>,
    offset: usize,
}

impl PayloadReader {
    pub fn new(head: &FrameHead) -> Self {
        Self {
            remaining: head.payload_len,
            mask: head.mask,
            offset: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Splits the next part of the payload off `src`, or returns `None` when `src` is empty
    /// or the payload is complete.
    pub fn read(&mut self, src: &mut BytesMut) -> Option<Bytes> {
        if self.remaining == 0 || src.is_empty() {
            return None;
        }

        let n = usize::try_from(self.remaining).map_or(src.len(), |remaining| remaining.min(src.len()));
        let mut chunk = src.split_to(n);
        if let Some(key) = self.mask {
            mask::apply_mask(&mut chunk, key, self.offset);
        }

        self.offset += n;
        self.remaining -= n as u64;
        Some(chunk.freeze())
    }
}
