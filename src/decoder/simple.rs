use bytes::{Bytes, BytesMut};

use super::{FrameHead, FrameReceiveMode, HeaderReader, PayloadReader};
use crate::{
    frame::OpCode,
    message::{Message, SimpleMessage},
    Result, WebSocketError,
};

/// Decoder buffering all frames of a message and emitting it once the final frame is complete.
///
/// Control frames may arrive between the fragments of a data message; they are emitted as
/// their own messages and leave the buffered message untouched.
pub struct SimpleDecoder {
    header: HeaderReader,
    frame: Option<PartialFrame>,
    message: Option<Assembly>,
    max_message_size: usize,
}

struct PartialFrame {
    fin: bool,
    payload: PayloadReader,
    /// Payload of a control frame. Data frames write into the open [`Assembly`].
    control: Option<(OpCode, Vec<Bytes>)>,
}

struct Assembly {
    opcode: OpCode,
    chunks: Vec<Bytes>,
    size: u64,
}

impl SimpleDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            header: HeaderReader::new(),
            frame: None,
            message: None,
            max_message_size,
        }
    }

    pub fn decode(&mut self, mut chunk: BytesMut, out: &mut Vec<Message>) -> Result<()> {
        loop {
            let Some(frame) = self.frame.as_mut() else {
                let Some(head) = self.header.read(&mut chunk)? else {
                    return Ok(());
                };
                let frame = self.on_header(head)?;
                self.frame = Some(frame);
                continue;
            };

            while let Some(data) = frame.payload.read(&mut chunk) {
                match (&mut frame.control, &mut self.message) {
                    (Some((_, chunks)), _) => chunks.push(data),
                    (None, Some(message)) => message.chunks.push(data),
                    (None, None) => unreachable!("data frame without an open message"),
                }
            }
            if !frame.payload.is_done() {
                return Ok(());
            }

            let Some(frame) = self.frame.take() else {
                continue;
            };
            if let Some((opcode, chunks)) = frame.control {
                out.push(Message::Simple(SimpleMessage::new(
                    opcode,
                    FrameReceiveMode::Simple,
                    chunks,
                )));
            } else if frame.fin {
                if let Some(message) = self.message.take() {
                    out.push(Message::Simple(SimpleMessage::new(
                        message.opcode,
                        FrameReceiveMode::Simple,
                        message.chunks,
                    )));
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.header.reset();
        self.frame = None;
        self.message = None;
    }

    fn on_header(&mut self, head: FrameHead) -> Result<PartialFrame> {
        let payload = PayloadReader::new(&head);

        if head.opcode.is_control() {
            return Ok(PartialFrame {
                fin: head.fin,
                payload,
                control: Some((head.opcode, Vec::new())),
            });
        }

        match (head.opcode, self.message.as_mut()) {
            (OpCode::Continuation, None) => return Err(WebSocketError::InvalidContinuationFrame),
            (OpCode::Continuation, Some(message)) => {
                message.size += head.payload_len;
                if message.size > self.max_message_size as u64 {
                    return Err(WebSocketError::MessageTooLarge);
                }
            }
            (_, Some(_)) => return Err(WebSocketError::InvalidFragment),
            (opcode, None) => {
                if head.payload_len > self.max_message_size as u64 {
                    return Err(WebSocketError::MessageTooLarge);
                }
                self.message = Some(Assembly {
                    opcode,
                    chunks: Vec::new(),
                    size: head.payload_len,
                });
            }
        }

        Ok(PartialFrame {
            fin: head.fin,
            payload,
            control: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::testing::{chunks, frame};

    fn simple(message: Message) -> SimpleMessage {
        match message {
            Message::Simple(m) => m,
            Message::Stream(_) => panic!("simple decoder produced a stream"),
        }
    }

    fn fragmented() -> Vec<u8> {
        let mut data = frame(false, OpCode::Text, b"Hel", Some([1, 2, 3, 4]));
        data.extend(frame(true, OpCode::Ping, b"ping", Some([9, 9, 9, 9])));
        data.extend(frame(false, OpCode::Continuation, b"lo, ", Some([4, 3, 2, 1])));
        data.extend(frame(true, OpCode::Continuation, b"world", Some([0, 1, 0, 1])));
        data
    }

    #[test]
    fn test_reassembles_with_interleaved_control() {
        let data = fragmented();

        for size in [1, 3, 5, 8, data.len()] {
            let mut decoder = SimpleDecoder::new(1024);
            let mut out = Vec::new();
            for part in chunks(&data, size) {
                decoder.decode(part, &mut out).unwrap();
            }

            assert_eq!(out.len(), 2, "chunk size {size}");
            let mut out = out.into_iter().map(simple);

            let ping = out.next().unwrap();
            assert_eq!(ping.opcode(), OpCode::Ping);
            assert_eq!(ping.to_bytes(), Bytes::from_static(b"ping"));

            let text = out.next().unwrap();
            assert_eq!(text.opcode(), OpCode::Text);
            assert_eq!(text.mode(), FrameReceiveMode::Simple);
            assert_eq!(text.to_bytes(), Bytes::from_static(b"Hello, world"));
        }
    }

    #[test]
    fn test_nothing_emitted_before_fin() {
        let mut decoder = SimpleDecoder::new(1024);
        let mut out = Vec::new();

        let data = frame(false, OpCode::Binary, b"", None);
        decoder.decode(BytesMut::from(&data[..]), &mut out).unwrap();
        assert!(out.is_empty());

        let data = frame(true, OpCode::Continuation, b"", None);
        decoder.decode(BytesMut::from(&data[..]), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(simple(out.remove(0)).is_empty());
    }

    #[test]
    fn test_cumulative_size_limit() {
        let mut decoder = SimpleDecoder::new(8);
        let mut out = Vec::new();

        let mut data = frame(false, OpCode::Binary, &[0; 5], None);
        data.extend(frame(true, OpCode::Continuation, &[0; 4], None));

        let res = decoder.decode(BytesMut::from(&data[..]), &mut out);
        assert!(matches!(res, Err(WebSocketError::MessageTooLarge)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalid_sequences() {
        let mut decoder = SimpleDecoder::new(1024);
        let data = frame(true, OpCode::Continuation, b"x", None);
        assert!(matches!(
            decoder.decode(BytesMut::from(&data[..]), &mut Vec::new()),
            Err(WebSocketError::InvalidContinuationFrame)
        ));

        let mut decoder = SimpleDecoder::new(1024);
        let mut data = frame(false, OpCode::Text, b"a", None);
        data.extend(frame(true, OpCode::Text, b"b", None));
        assert!(matches!(
            decoder.decode(BytesMut::from(&data[..]), &mut Vec::new()),
            Err(WebSocketError::InvalidFragment)
        ));
    }

    #[test]
    fn test_reset_drops_open_message() {
        let mut decoder = SimpleDecoder::new(1024);
        let mut out = Vec::new();

        let data = frame(false, OpCode::Text, b"a", None);
        decoder.decode(BytesMut::from(&data[..]), &mut out).unwrap();
        decoder.reset();

        // a continuation is no longer valid once the open message was dropped
        let data = frame(true, OpCode::Continuation, b"b", None);
        assert!(matches!(
            decoder.decode(BytesMut::from(&data[..]), &mut out),
            Err(WebSocketError::InvalidContinuationFrame)
        ));
    }
}
