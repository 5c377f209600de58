use bytes::BytesMut;

use super::{FrameHead, HeaderReader, PayloadReader};
use crate::{
    frame::OpCode,
    message::{ChunkSender, Message, MessageReadStream},
    Result, WebSocketError,
};

/// Streaming decoder.
///
/// A [`MessageReadStream`] is emitted as soon as the header of the first frame of a message is
/// complete. Payload chunks are pushed into it as they arrive, continuation frames keep
/// appending, and the stream ends once the final frame is complete.
pub struct StandardDecoder {
    header: HeaderReader,
    frame: Option<PartialFrame>,
    message: Option<OpenMessage>,
    max_message_size: usize,
}

struct PartialFrame {
    fin: bool,
    payload: PayloadReader,
    /// Stream of a control frame. Data frames push into the [`OpenMessage`].
    control: Option<ChunkSender>,
}

struct OpenMessage {
    sender: ChunkSender,
    size: u64,
}

impl StandardDecoder {
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
                let frame = self.on_header(head, out)?;
                self.frame = Some(frame);
                continue;
            };

            while let Some(data) = frame.payload.read(&mut chunk) {
                let sender = match (&frame.control, &self.message) {
                    (Some(sender), _) => sender,
                    (None, Some(message)) => &message.sender,
                    (None, None) => unreachable!("data frame without an open message"),
                };
                // the consumer may have dropped the stream, the rest of the payload is discarded
                let _ = sender.unbounded_send(Ok(data));
            }
            if !frame.payload.is_done() {
                return Ok(());
            }

            let Some(frame) = self.frame.take() else {
                continue;
            };
            if frame.control.is_none() && frame.fin {
                self.message = None;
            }
        }
    }

    /// Drops all partial state. A stream still waiting for payload receives
    /// [`WebSocketError::MessageAborted`].
    pub fn reset(&mut self) {
        self.header.reset();
        if let Some(PartialFrame {
            control: Some(sender),
            ..
        }) = self.frame.take()
        {
            let _ = sender.unbounded_send(Err(WebSocketError::MessageAborted));
        }
        if let Some(message) = self.message.take() {
            let _ = message.sender.unbounded_send(Err(WebSocketError::MessageAborted));
        }
    }

    fn on_header(&mut self, head: FrameHead, out: &mut Vec<Message>) -> Result<PartialFrame> {
        let payload = PayloadReader::new(&head);

        if head.opcode.is_control() {
            let (sender, stream) = MessageReadStream::channel(head.opcode);
            out.push(Message::Stream(stream));
            return Ok(PartialFrame {
                fin: head.fin,
                payload,
                control: Some(sender),
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
                let (sender, stream) = MessageReadStream::channel(opcode);
                out.push(Message::Stream(stream));
                self.message = Some(OpenMessage {
                    sender,
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
