//! Incoming messages.
//!
//! A [`Message`] is produced by the decoders for every data message and every control frame.
//! Depending on the [`FrameReceiveMode`] its payload is either already complete
//! ([`SimpleMessage`]) or still arriving ([`MessageReadStream`]).
use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    Stream, StreamExt,
};

use crate::{close::CloseCode, decoder::FrameReceiveMode, frame::OpCode, Result, WebSocketError};

/// Sending side of a [`MessageReadStream`], owned by the standard decoder.
pub(crate) type ChunkSender = UnboundedSender<Result<Bytes>>;

/// A message received from the peer.
#[derive(Debug)]
pub enum Message {
    /// Payload delivered incrementally, produced by [`FrameReceiveMode::Standard`].
    Stream(MessageReadStream),
    /// Complete payload, produced by [`FrameReceiveMode::Simple`] and [`FrameReceiveMode::Lite`].
    Simple(SimpleMessage),
}

impl Message {
    /// The opcode of the first frame of the message.
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::Stream(stream) => stream.opcode(),
            Self::Simple(message) => message.opcode(),
        }
    }

    /// The receive mode of the decoder that produced this message.
    pub fn mode(&self) -> FrameReceiveMode {
        match self {
            Self::Stream(_) => FrameReceiveMode::Standard,
            Self::Simple(message) => message.mode(),
        }
    }

    /// Returns `true` for `Close`, `Ping` and `Pong` messages.
    pub fn is_control(&self) -> bool {
        self.opcode().is_control()
    }

    /// Waits for the whole payload and returns its chunks in order.
    pub async fn into_chunks(self) -> Result<Vec<Bytes>> {
        match self {
            Self::Stream(stream) => stream.into_chunks().await,
            Self::Simple(message) => Ok(message.into_chunks()),
        }
    }

    /// Waits for the whole payload and joins it into one buffer.
    pub async fn into_bytes(self) -> Result<Bytes> {
        let chunks = self.into_chunks().await?;
        Ok(join(chunks))
    }

    /// Waits for the whole payload and decodes it as UTF-8.
    pub async fn into_text(self) -> Result<String> {
        let bytes = self.into_bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WebSocketError::InvalidUTF8)
    }
}

fn join(mut chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.swap_remove(0),
        _ => {
            let mut out = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in &chunks {
                out.extend_from_slice(chunk);
            }
            out.freeze()
        }
    }
}

/// A fully received message whose payload is kept as the list of received slices.
#[derive(Clone, Debug)]
pub struct SimpleMessage {
    opcode: OpCode,
    mode: FrameReceiveMode,
    chunks: Vec<Bytes>,
}

impl SimpleMessage {
    pub(crate) fn new(opcode: OpCode, mode: FrameReceiveMode, chunks: Vec<Bytes>) -> Self {
        Self {
            opcode,
            mode,
            chunks,
        }
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn mode(&self) -> FrameReceiveMode {
        self.mode
    }

    /// The payload slices in the order they were received.
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Bytes::is_empty)
    }

    pub fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }

    /// Joins the payload into one buffer. Free when the payload arrived in a single slice.
    pub fn to_bytes(&self) -> Bytes {
        join(self.chunks.clone())
    }

    /// The reason code of a `Close` message, if it carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        if self.opcode != OpCode::Close {
            return None;
        }
        let bytes = self.to_bytes();
        (bytes.len() >= 2).then(|| CloseCode::from(u16::from_be_bytes([bytes[0], bytes[1]])))
    }
}

/// A message whose payload is still being received.
///
/// Yields the payload slices in order and ends after the final frame. If the connection drops
/// the message before it is complete, the last item is [`WebSocketError::MessageAborted`].
///
/// The stream is fed while the connection is polled, so a task reading a large message should
/// keep the connection's event stream polled as well.
#[derive(Debug)]
pub struct MessageReadStream {
    opcode: OpCode,
    receiver: UnboundedReceiver<Result<Bytes>>,
}

impl MessageReadStream {
    pub(crate) fn channel(opcode: OpCode) -> (ChunkSender, Self) {
        let (sender, receiver) = mpsc::unbounded();
        (sender, Self { opcode, receiver })
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Collects every remaining chunk of the message.
    pub async fn into_chunks(mut self) -> Result<Vec<Bytes>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }
}

impl Stream for MessageReadStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}
