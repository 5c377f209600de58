//! Outbound frame writing.
//!
//! [`FrameWriter`] encodes frames straight into the write buffer of the connection's
//! [`Framed`] socket. [`MessageWriter`] sends one message as a sequence of fragments; while it
//! is active every other write on the connection is parked in a FIFO queue of [`Deferred`]
//! writes and replayed once the writer ends.
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use tokio_util::codec::Framed;

use crate::{
    close::CloseCode,
    codec::{Codec, FrameEncoder},
    connection::WebSocket,
    frame::{OpCode, Payload},
    mask,
    options::Masking,
    stream::Transport,
    Result, WebSocketError,
};

/// Completion callback of a write.
///
/// Called with `Ok(())` once the frame was flushed to the socket, or with
/// [`WebSocketError::ConnectionLost`] if the socket went away before that.
pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Encodes frames into the outbound buffer of a socket.
pub(crate) struct FrameWriter {
    encoder: FrameEncoder,
    masking: Masking,
    high_water_mark: usize,
    /// Callbacks of frames written since the last completed flush.
    callbacks: Vec<WriteCallback>,
}

impl FrameWriter {
    pub fn new(masking: Masking, high_water_mark: usize) -> Self {
        Self {
            encoder: FrameEncoder,
            masking,
            high_water_mark,
            callbacks: Vec::new(),
        }
    }

    pub fn set_masking(&mut self, masking: Masking) {
        self.masking = masking;
    }

    /// Appends one frame to the outbound buffer of `socket`.
    ///
    /// Returns `false` if the buffer is at or above the high-water mark afterwards, or if there
    /// is no socket, in which case `callback` receives [`WebSocketError::ConnectionLost`].
    pub fn write<S>(
        &mut self,
        socket: Option<&mut Framed<S, Codec>>,
        opcode: OpCode,
        is_fin: bool,
        payload: &Payload,
        callback: Option<WriteCallback>,
    ) -> bool {
        let Some(socket) = socket else {
            if let Some(callback) = callback {
                callback(Err(WebSocketError::ConnectionLost));
            }
            return false;
        };

        let payload_len = payload.len();
        let key = self.masking.key();
        let header = match self.encoder.create_header(
            opcode,
            payload_len as u64,
            is_fin,
            key.as_ref().map(|k| &k[..]),
        ) {
            Ok(header) => header,
            Err(err) => {
                if let Some(callback) = callback {
                    callback(Err(err));
                }
                return false;
            }
        };

        let buf = socket.write_buffer_mut();
        buf.reserve(header.len() + payload_len);
        buf.extend_from_slice(&header);

        let start = buf.len();
        for chunk in payload.chunks() {
            buf.extend_from_slice(chunk);
        }
        if let Some(key) = key {
            mask::apply_mask(&mut buf[start..], key, 0);
        }

        if let Some(callback) = callback {
            self.callbacks.push(callback);
        }

        buf.len() < self.high_water_mark
    }

    /// Resolves the callbacks of every frame written so far.
    pub fn on_flushed(&mut self) {
        for callback in self.callbacks.drain(..) {
            callback(Ok(()));
        }
    }

    /// Fails the callbacks of every frame that did not reach the socket.
    pub fn on_lost(&mut self) {
        for callback in self.callbacks.drain(..) {
            callback(Err(WebSocketError::ConnectionLost));
        }
    }
}

/// A write parked while a [`MessageWriter`] is active.
pub(crate) enum Deferred {
    Frame {
        opcode: OpCode,
        payload: Payload,
        callback: Option<WriteCallback>,
    },
    End(CloseCode),
}

/// Writer ids are unique across connections so a writer cannot be used on the wrong one.
static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(0);

/// The connection's view of its active [`MessageWriter`].
pub(crate) struct ActiveWriter {
    pub id: u64,
    /// Set once the first fragment was sent.
    pub started: bool,
    live: Arc<AtomicBool>,
}

impl ActiveWriter {
    /// Returns `true` if the writer was dropped before sending its final frame.
    pub fn is_dropped(&self) -> bool {
        !self.live.load(Ordering::Acquire)
    }
}

/// Writes a single message as a sequence of fragments.
///
/// Obtained from [`WebSocket::message_writer`]. Each [`write`](MessageWriter::write) sends one
/// non-final frame, [`end`](MessageWriter::end) sends the final one. Until the writer ends,
/// other writes on the connection are queued and sent afterwards in call order.
///
/// If a writer is dropped without calling `end`, the next operation on the connection
/// terminates the message with an empty final frame and replays the queued writes.
///
/// # Example
/// ```no_run
/// use wscore::{OpCode, WebSocket, Transport};
///
/// fn send_in_parts<S: Transport>(ws: &mut WebSocket<S>) -> wscore::Result<()> {
///     let mut writer = ws.message_writer(OpCode::Text)?;
///     writer.write(ws, "Hello, ")?;
///     ws.write_text("queued until the message is complete")?;
///     writer.end(ws, "world!")?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MessageWriter {
    id: u64,
    opcode: OpCode,
    frames: usize,
    sent: usize,
    max_message_size: usize,
    ended: bool,
    live: Arc<AtomicBool>,
}

impl MessageWriter {
    pub(crate) fn new(opcode: OpCode, max_message_size: usize) -> (Self, ActiveWriter) {
        let id = NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));

        let writer = Self {
            id,
            opcode,
            frames: 0,
            sent: 0,
            max_message_size,
            ended: false,
            live: live.clone(),
        };
        let active = ActiveWriter {
            id,
            started: false,
            live,
        };
        (writer, active)
    }

    /// The opcode of the message.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Payload bytes sent so far.
    pub fn sent_bytes(&self) -> usize {
        self.sent
    }

    /// Returns `true` once the final frame was sent.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Sends `chunk` as a non-final frame.
    ///
    /// # Errors
    /// - [`WebSocketError::WriterEnded`] after [`end`](MessageWriter::end).
    /// - [`WebSocketError::MessageTooLarge`] if the message would exceed the maximum size.
    ///   Nothing is sent in that case.
    /// - [`WebSocketError::ConnectionLost`] or [`WebSocketError::ConnectionReadonly`] if the
    ///   connection can no longer send.
    /// - [`WebSocketError::ForeignWriter`] if `ws` is not the connection the writer came from.
    pub fn write<S: Transport>(
        &mut self,
        ws: &mut WebSocket<S>,
        chunk: impl Into<Payload>,
    ) -> Result<bool> {
        self.send(ws, chunk.into(), false)
    }

    /// Sends the final frame, carrying `last` (which may be empty), and releases the connection.
    ///
    /// Writes queued while the writer was active are replayed afterwards.
    pub fn end<S: Transport>(
        &mut self,
        ws: &mut WebSocket<S>,
        last: impl Into<Payload>,
    ) -> Result<bool> {
        self.send(ws, last.into(), true)
    }

    fn send<S: Transport>(
        &mut self,
        ws: &mut WebSocket<S>,
        payload: Payload,
        is_fin: bool,
    ) -> Result<bool> {
        if self.ended {
            return Err(WebSocketError::WriterEnded);
        }

        let len = payload.len();
        if self.sent + len > self.max_message_size {
            return Err(WebSocketError::MessageTooLarge);
        }

        if let Err(err) = ws.check_writable() {
            if is_fin {
                self.ended = true;
                ws.release_writer(self.id);
            }
            return Err(err);
        }
        if !ws.owns_writer(self.id) {
            return Err(WebSocketError::ForeignWriter);
        }

        let opcode = if self.frames == 0 {
            self.opcode
        } else {
            OpCode::Continuation
        };

        let res = ws.send_fragment(opcode, is_fin, &payload);
        self.frames += 1;
        self.sent += len;

        if is_fin {
            self.ended = true;
            ws.release_writer(self.id);
        }

        Ok(res)
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if !self.ended {
            self.live.store(false, Ordering::Release);
        }
    }
}
