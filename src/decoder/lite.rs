use bytes::{Bytes, BytesMut};

use super::{FrameHead, FrameReceiveMode, HeaderReader, PayloadReader};
use crate::{
    frame::OpCode,
    message::{Message, SimpleMessage},
    Result, WebSocketError,
};

/// Decoder turning every frame into one [`SimpleMessage`].
///
/// Frames without the FIN bit fail with [`WebSocketError::FrameBroken`], and the size limit
/// applies to each frame on its own.
pub struct LiteDecoder {
    header: HeaderReader,
    frame: Option<PartialFrame>,
    max_message_size: usize,
}

struct PartialFrame {
    opcode: OpCode,
    payload: PayloadReader,
    chunks: Vec<Bytes>,
}

impl LiteDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            header: HeaderReader::new(),
            frame: None,
            max_message_size,
        }
    }

    pub fn decode(&mut self, mut chunk: BytesMut, out: &mut Vec<Message>) -> Result<()> {
        loop {
            let Some(frame) = self.frame.as_mut() else {
                let Some(head) = self.header.read(&mut chunk)? else {
                    return Ok(());
                };
                self.frame = Some(self.on_header(head)?);
                continue;
            };

            while let Some(data) = frame.payload.read(&mut chunk) {
                frame.chunks.push(data);
            }
            if !frame.payload.is_done() {
                return Ok(());
            }

            if let Some(frame) = self.frame.take() {
                out.push(Message::Simple(SimpleMessage::new(
                    frame.opcode,
                    FrameReceiveMode::Lite,
                    frame.chunks,
                )));
            }
        }
    }

    pub fn reset(&mut self) {
        self.header.reset();
        self.frame = None;
    }

    fn on_header(&self, head: FrameHead) -> Result<PartialFrame> {
        if !head.fin {
            return Err(WebSocketError::FrameBroken);
        }
        if head.opcode == OpCode::Continuation {
            return Err(WebSocketError::InvalidContinuationFrame);
        }
        if head.payload_len > self.max_message_size as u64 {
            return Err(WebSocketError::MessageTooLarge);
        }

        Ok(PartialFrame {
            opcode: head.opcode,
            payload: PayloadReader::new(&head),
            chunks: Vec::new(),
        })
    }
}
