//! Frame serialization and the [`tokio_util::codec`] glue used by connections.
//!
//! [`FrameEncoder`] builds frame headers and masks payloads. [`Codec`] pairs it with a
//! [`Decoder`] so a socket can be wrapped in a [`Framed`](tokio_util::codec::Framed) that
//! yields [`Message`] values.
use std::{collections::VecDeque, ops::Deref};

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    decoder::Decoder,
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    mask,
    message::Message,
    Result, WebSocketError,
};

/// Converts a byte slice into a masking key.
pub(crate) fn parse_mask_key(key: &[u8]) -> Result<[u8; 4]> {
    <[u8; 4]>::try_from(key).map_err(|_| WebSocketError::InvalidMaskKey)
}

/// A serialized frame header, between 2 and 14 bytes long.
#[derive(Clone, Copy)]
pub struct FrameHeader {
    buf: [u8; MAX_HEAD_SIZE],
    len: usize,
}

impl Deref for FrameHeader {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsRef<[u8]> for FrameHeader {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FrameHeader").field(&&self.buf[..self.len]).finish()
    }
}

/// WebSocket frame encoder.
///
/// `FrameEncoder` writes frame headers using the smallest length encoding that fits the payload
/// and applies masking keys. It also implements [`codec::Encoder`] for whole [`Frame`] values.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    /// Builds the header of a frame.
    ///
    /// The payload length is encoded inline up to 125 bytes, with a 16-bit extension up to
    /// 65535 bytes, and with a 64-bit extension above that. When `mask_key` is given the MASK
    /// bit is set and the key is appended.
    ///
    /// # Errors
    /// Returns [`WebSocketError::InvalidMaskKey`] if the key is not exactly 4 bytes long.
    pub fn create_header(
        &self,
        opcode: OpCode,
        payload_size: u64,
        is_fin: bool,
        mask_key: Option<&[u8]>,
    ) -> Result<FrameHeader> {
        let mask_key = mask_key.map(parse_mask_key).transpose()?;

        let mut buf = [0; MAX_HEAD_SIZE];
        buf[0] = (is_fin as u8) << 7 | u8::from(opcode);

        let mut len = if payload_size < 126 {
            buf[1] = payload_size as u8;
            2
        } else if payload_size < 65536 {
            buf[1] = 126;
            buf[2..4].copy_from_slice(&(payload_size as u16).to_be_bytes());
            4
        } else {
            buf[1] = 127;
            buf[2..10].copy_from_slice(&payload_size.to_be_bytes());
            10
        };

        if let Some(key) = mask_key {
            buf[1] |= 0x80;
            buf[len..len + 4].copy_from_slice(&key);
            len += 4;
        }

        Ok(FrameHeader { buf, len })
    }

    /// Masks `buffer` in place. `offset` is the position of the buffer inside the payload.
    pub fn mask(&self, buffer: &mut [u8], key: &[u8], offset: usize) -> Result<()> {
        mask::apply_mask(buffer, parse_mask_key(key)?, offset);
        Ok(())
    }

    /// Masks several chunks as one contiguous payload and returns the total length.
    pub fn bulk_mask(&self, chunks: &mut [BytesMut], key: &[u8]) -> Result<usize> {
        let key = parse_mask_key(key)?;
        Ok(mask::bulk_mask(chunks.iter_mut().map(|c| &mut c[..]), key))
    }
}

impl codec::Encoder<Frame> for FrameEncoder {
    type Error = WebSocketError;

    /// Writes the header followed by the (masked) payload of `frame` into `dst`.
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let payload_len = frame.payload.len();
        let header = self.create_header(
            frame.opcode,
            payload_len as u64,
            frame.fin,
            frame.mask.as_ref().map(|k| &k[..]),
        )?;

        dst.reserve(header.len() + payload_len);
        dst.extend_from_slice(&header);

        let start = dst.len();
        for chunk in frame.payload.chunks() {
            dst.extend_from_slice(chunk);
        }
        if let Some(key) = frame.mask {
            mask::apply_mask(&mut dst[start..], key, 0);
        }

        Ok(())
    }
}

/// A combined codec that decodes incoming bytes into [`Message`]s and encodes outgoing [`Frame`]s.
///
/// A single read may complete several messages, and may complete some before hitting a protocol
/// error. Completed messages are queued and handed out one by one; a decoding error is reported
/// only after the messages decoded before it.
pub struct Codec {
    decoder: Decoder,
    encoder: FrameEncoder,
    pending: VecDeque<Message>,
    error: Option<WebSocketError>,
    activity: bool,
}

impl From<(Decoder, FrameEncoder)> for Codec {
    fn from((decoder, encoder): (Decoder, FrameEncoder)) -> Self {
        Self {
            decoder,
            encoder,
            pending: VecDeque::new(),
            error: None,
            activity: false,
        }
    }
}

impl Codec {
    /// Creates a codec around `decoder`.
    pub fn new(decoder: Decoder) -> Self {
        Self::from((decoder, FrameEncoder))
    }

    /// Returns `true` if bytes were read since the last call, whether or not they completed
    /// a message.
    pub fn take_activity(&mut self) -> bool {
        std::mem::take(&mut self.activity)
    }

    /// Decodes bytes that arrived before the connection took over the socket.
    pub fn prime(&mut self, early_data: BytesMut) {
        if early_data.has_remaining() {
            self.feed(early_data);
        }
    }

    /// Takes the next decoded message, or the deferred decoding error once all messages
    /// decoded before it were taken.
    pub fn next_pending(&mut self) -> Option<Result<Message>> {
        if let Some(message) = self.pending.pop_front() {
            return Some(Ok(message));
        }
        self.error.take().map(Err)
    }

    /// Drops every partially decoded frame and message. See [`Decoder::reset`].
    pub fn reset(&mut self) {
        self.decoder.reset();
    }

    fn feed(&mut self, chunk: BytesMut) {
        if self.error.is_some() {
            return;
        }

        let mut out = Vec::new();
        let res = self.decoder.decode(chunk, &mut out);
        self.pending.extend(out);
        if let Err(err) = res {
            self.error = Some(err);
        }
    }
}

impl codec::Decoder for Codec {
    type Item = Message;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.has_remaining() {
            self.activity = true;
            self.feed(src.split());
        }
        self.next_pending().transpose()
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        self.encoder.encode(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decoder::FrameReceiveMode, frame::Payload};
    use bytes::Bytes;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    #[test]
    fn test_header_width_classes() {
        let encoder = FrameEncoder;

        let header = encoder.create_header(OpCode::Text, 0, true, None).unwrap();
        assert_eq!(&header[..], &[0x81, 0x00]);

        let header = encoder.create_header(OpCode::Text, 125, true, None).unwrap();
        assert_eq!(&header[..], &[0x81, 125]);

        let header = encoder.create_header(OpCode::Binary, 126, true, None).unwrap();
        assert_eq!(&header[..], &[0x82, 126, 0x00, 0x7E]);

        let header = encoder.create_header(OpCode::Binary, 65535, true, None).unwrap();
        assert_eq!(&header[..], &[0x82, 126, 0xFF, 0xFF]);

        let header = encoder.create_header(OpCode::Binary, 65536, false, None).unwrap();
        assert_eq!(&header[..], &[0x02, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_header_with_mask() {
        let encoder = FrameEncoder;
        let key = [0x37, 0xfa, 0x21, 0x3d];

        let header = encoder
            .create_header(OpCode::Text, 5, true, Some(&key))
            .unwrap();
        assert_eq!(&header[..], &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d]);

        let header = encoder
            .create_header(OpCode::Ping, 300, true, Some(&key))
            .unwrap();
        assert_eq!(header.len(), 8);
        assert_eq!(header[1], 0x80 | 126);
        assert_eq!(&header[4..], &key);
    }

    #[test]
    fn test_invalid_mask_key() {
        let encoder = FrameEncoder;
        assert!(matches!(
            encoder.create_header(OpCode::Text, 1, true, Some(&[1, 2, 3])),
            Err(WebSocketError::InvalidMaskKey)
        ));
        assert!(matches!(
            encoder.mask(&mut [0u8; 4], &[1, 2, 3, 4, 5], 0),
            Err(WebSocketError::InvalidMaskKey)
        ));
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 section 5.7: a single-frame masked text message containing "Hello"
        let mut dst = BytesMut::new();
        let frame = Frame::text("Hello").with_mask([0x37, 0xfa, 0x21, 0x3d]);
        FrameEncoder.encode(frame, &mut dst).unwrap();

        assert_eq!(
            &dst[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_encode_chunked_payload_masks_continuously() {
        let key = [1, 2, 3, 4];
        let payload = Payload::from(vec![
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"defgh"),
        ]);

        let mut chunked = BytesMut::new();
        FrameEncoder
            .encode(Frame::binary(payload).with_mask(key), &mut chunked)
            .unwrap();

        let mut contiguous = BytesMut::new();
        FrameEncoder
            .encode(Frame::binary("abcdefgh").with_mask(key), &mut contiguous)
            .unwrap();

        assert_eq!(chunked, contiguous);
    }

    #[test]
    fn test_bulk_mask() {
        let key = [9, 8, 7, 6];
        let mut chunks = vec![BytesMut::from(&b"hel"[..]), BytesMut::from(&b"lo world"[..])];
        let total = FrameEncoder.bulk_mask(&mut chunks, &key).unwrap();
        assert_eq!(total, 11);

        let mut joined = BytesMut::from(&b"hello world"[..]);
        FrameEncoder.mask(&mut joined, &key, 0).unwrap();
        assert_eq!(&[&chunks[0][..], &chunks[1][..]].concat()[..], &joined[..]);
    }

    #[test]
    fn test_codec_defers_error_after_messages() {
        let mut codec = Codec::new(Decoder::new(FrameReceiveMode::Simple, 1024));

        let mut src = BytesMut::new();
        FrameEncoder.encode(Frame::text("one"), &mut src).unwrap();
        FrameEncoder.encode(Frame::text("two"), &mut src).unwrap();
        // reserved bit set
        src.extend_from_slice(&[0xC1, 0x00]);

        let first = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(first.opcode(), OpCode::Text);
        assert!(src.is_empty());

        let second = codec.decode(&mut src).unwrap();
        assert!(second.is_some());

        assert!(matches!(
            codec.decode(&mut src),
            Err(WebSocketError::ReservedBitsNotZero)
        ));
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_codec_prime() {
        let mut codec = Codec::new(Decoder::new(FrameReceiveMode::Lite, 1024));

        let mut early = BytesMut::new();
        FrameEncoder.encode(Frame::binary("early"), &mut early).unwrap();
        codec.prime(early);

        let message = codec.next_pending().unwrap().unwrap();
        assert_eq!(message.opcode(), OpCode::Binary);
        assert!(codec.next_pending().is_none());
    }

    #[test]
    fn test_codec_reports_partial_frames_as_activity() {
        let mut codec = Codec::new(Decoder::new(FrameReceiveMode::Simple, 1024));
        assert!(!codec.take_activity());

        // header of a 10 byte binary frame and its first payload byte
        let mut src = BytesMut::from(&[0x82, 0x0A, 0x00][..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(codec.take_activity());
        assert!(!codec.take_activity());

        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(!codec.take_activity());
    }
}
