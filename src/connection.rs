use std::{
    collections::VecDeque,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll, Waker},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::{future::poll_fn, Sink, Stream, StreamExt};
use tokio::{
    io::AsyncWrite,
    time::{Instant, Sleep},
};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_util::codec::Framed;

use crate::{
    close::CloseCode,
    codec::Codec,
    decoder::{Decoder, FrameReceiveMode},
    frame::{Frame, OpCode, Payload, MAX_CONTROL_PAYLOAD},
    message::Message,
    options::{Masking, Options},
    stream::Transport,
    writer::{ActiveWriter, Deferred, FrameWriter, MessageWriter, WriteCallback},
    Result, WebSocketError,
};

/// The side of the connection this endpoint plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Something that happened on a connection.
#[derive(Debug)]
pub enum Event {
    /// A message or control frame from the peer.
    Message(Message),
    /// A protocol, I/O or write error. Decoding errors are followed by a close frame carrying
    /// [`WebSocketError::close_code`].
    Error(WebSocketError),
    /// The outbound buffer was flushed after a write reported backpressure.
    Drain,
    /// The peer finished sending.
    End,
    /// The local write side was shut down.
    Finish,
    /// No traffic within the idle timeout. The connection sends a close frame and is destroyed.
    Timeout,
    /// The socket is gone. This is the last event.
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteState {
    Open,
    /// A close frame (or the peer's EOF) ended writing; the buffer is being flushed before
    /// the write side is shut down.
    Closing,
    Finished,
}

/// A WebSocket connection over a [`Transport`].
///
/// The connection is driven by polling it as a [`Stream`] of [`Event`]s: polling reads and
/// decodes incoming frames, flushes the outbound buffer, runs the idle timer and completes
/// shutdown. Writes never wait; they append encoded frames to the outbound buffer and return
/// `false` once it passes the high-water mark, after which [`Event::Drain`] tells when it has
/// been flushed.
///
/// # Lifecycle
/// A connection starts open. [`WebSocket::end`] sends a close frame and shuts the write side
/// down while reading continues; writes then fail with
/// [`WebSocketError::ConnectionReadonly`]. Once both directions are done, or after
/// [`WebSocket::destroy`], the socket is dropped, [`Event::Close`] is emitted and writes fail
/// with [`WebSocketError::ConnectionLost`].
///
/// A close frame from the peer is answered with a close frame automatically. Pings are
/// surfaced as messages and left to the application.
///
/// # Example
/// An echo loop for a connection in [`FrameReceiveMode::Simple`]. In standard mode a message
/// payload is only fed while the connection is polled, so it has to be read from another task.
/// ```no_run
/// use futures::StreamExt;
/// use wscore::{Event, OpCode, Transport, WebSocket};
///
/// async fn echo<S: Transport>(mut ws: WebSocket<S>) -> wscore::Result<()> {
///     while let Some(event) = ws.next().await {
///         match event {
///             Event::Message(message) => match message.opcode() {
///                 OpCode::Text => {
///                     let text = message.into_text().await?;
///                     ws.write_text(text)?;
///                 }
///                 OpCode::Ping => {
///                     let data = message.into_bytes().await?;
///                     ws.pong(data)?;
///                 }
///                 _ => {}
///             },
///             Event::Close => break,
///             _ => {}
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct WebSocket<S> {
    socket: Option<Framed<S, Codec>>,
    role: Role,
    tls: bool,
    frame_receive_mode: FrameReceiveMode,
    max_message_size: usize,
    timeout: Duration,
    idle: Option<Pin<Box<Sleep>>>,
    timed_out: bool,
    writer: FrameWriter,
    active_writer: Option<ActiveWriter>,
    /// Writes issued while a [`MessageWriter`] is active, in call order.
    deferred: VecDeque<Deferred>,
    events: VecDeque<Event>,
    write_state: WriteState,
    read_ended: bool,
    flush_pending: bool,
    need_drain: bool,
    close_emitted: bool,
    waker: Option<Waker>,
}

impl<S: Transport> WebSocket<S> {
    /// Creates a connection over a stream on which the handshake has already completed.
    ///
    /// `early_data` holds bytes read past the end of the handshake; they are decoded before
    /// anything is read from `stream`.
    pub fn from_stream(stream: S, role: Role, early_data: Bytes, options: Options) -> Self {
        let tls = stream.is_tls();

        let mut codec = Codec::new(Decoder::new(
            options.frame_receive_mode,
            options.max_message_size,
        ));
        codec.prime(BytesMut::from(&early_data[..]));

        let mut socket = Framed::new(stream, codec);
        socket.set_backpressure_boundary(options.high_water_mark);

        let masking = match role {
            Role::Server => Masking::None,
            Role::Client => options.masking,
        };

        Self {
            socket: Some(socket),
            role,
            tls,
            frame_receive_mode: options.frame_receive_mode,
            max_message_size: options.max_message_size,
            timeout: options.timeout,
            idle: None,
            timed_out: false,
            writer: FrameWriter::new(masking, options.high_water_mark),
            active_writer: None,
            deferred: VecDeque::new(),
            events: VecDeque::new(),
            write_state: WriteState::Open,
            read_ended: false,
            flush_pending: false,
            need_drain: false,
            close_emitted: false,
            waker: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// Returns `true` if the connection was established over TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// The certificate presented by the peer, while the socket is open.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.socket.as_ref()?.get_ref().peer_certificate()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()?.get_ref().peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()?.get_ref().local_addr()
    }

    /// Returns `true` until the socket is dropped.
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Returns `true` while frames can be written.
    pub fn is_writable(&self) -> bool {
        self.socket.is_some() && self.write_state == WriteState::Open
    }

    /// Returns `true` once the local write side was shut down.
    pub fn is_finished(&self) -> bool {
        self.socket.is_none() || self.write_state == WriteState::Finished
    }

    /// Returns `true` once the peer finished sending.
    pub fn is_ended(&self) -> bool {
        self.socket.is_none() || self.read_ended
    }

    pub fn frame_receive_mode(&self) -> FrameReceiveMode {
        self.frame_receive_mode
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// The idle timeout. Zero means disabled.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Changes the idle timeout and restarts the timer. [`Duration::ZERO`] disables it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.idle = None;
        self.timed_out = false;
    }

    /// Changes the masking of outgoing frames. Ignored on server connections, which never mask.
    pub fn set_masking(&mut self, masking: Masking) {
        if self.role == Role::Client {
            self.writer.set_masking(masking);
        }
    }

    /// Sends a text message in a single frame.
    ///
    /// Returns `false` if the outbound buffer passed its high-water mark.
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionLost`] once the socket is gone, and
    /// [`WebSocketError::ConnectionReadonly`] once the write side was closed.
    pub fn write_text(&mut self, text: impl Into<String>) -> Result<bool> {
        self.write_message(OpCode::Text, Payload::from(text.into()))
    }

    /// Sends a binary message in a single frame.
    pub fn write_binary(&mut self, data: impl Into<Payload>) -> Result<bool> {
        self.write_message(OpCode::Binary, data.into())
    }

    /// Sends a ping. The payload may not exceed 125 bytes.
    pub fn ping(&mut self, data: impl Into<Payload>) -> Result<bool> {
        self.write_message(OpCode::Ping, data.into())
    }

    /// Sends a pong. The payload may not exceed 125 bytes.
    pub fn pong(&mut self, data: impl Into<Payload>) -> Result<bool> {
        self.write_message(OpCode::Pong, data.into())
    }

    /// Sends a single final frame and reports its completion through `callback`.
    ///
    /// If the connection cannot write, `callback` receives [`WebSocketError::ConnectionLost`]
    /// right away and `false` is returned.
    pub fn write_with_callback<F>(
        &mut self,
        opcode: OpCode,
        payload: impl Into<Payload>,
        callback: F,
    ) -> bool
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let payload = payload.into();
        let callback: WriteCallback = Box::new(callback);
        self.reclaim_dropped_writer();

        if self.check_writable().is_err() {
            callback(Err(WebSocketError::ConnectionLost));
            return false;
        }
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            callback(Err(WebSocketError::ControlFrameTooLarge));
            return false;
        }

        if self.active_writer.is_some() {
            self.deferred.push_back(Deferred::Frame {
                opcode,
                payload,
                callback: Some(callback),
            });
            return true;
        }

        self.send_frame(opcode, true, &payload, Some(callback))
    }

    /// Starts a fragmented message.
    ///
    /// # Errors
    /// - [`WebSocketError::FragmentationUnsupported`] on connections in lite mode.
    /// - [`WebSocketError::InvalidOpCode`] unless `opcode` is `Text` or `Binary`.
    /// - [`WebSocketError::ConnectionBusy`] while another writer is active.
    pub fn message_writer(&mut self, opcode: OpCode) -> Result<MessageWriter> {
        if self.frame_receive_mode == FrameReceiveMode::Lite {
            return Err(WebSocketError::FragmentationUnsupported);
        }
        if !matches!(opcode, OpCode::Text | OpCode::Binary) {
            return Err(WebSocketError::InvalidOpCode(opcode.into()));
        }
        self.check_writable()?;
        self.reclaim_dropped_writer();
        if self.active_writer.is_some() {
            return Err(WebSocketError::ConnectionBusy);
        }

        let (writer, active) = MessageWriter::new(opcode, self.max_message_size);
        self.active_writer = Some(active);
        Ok(writer)
    }

    /// Sends a close frame with `code` and shuts the write side down once it is flushed.
    ///
    /// Reading continues until the peer closes its side. Returns `false` if the connection
    /// is not writable or the outbound buffer passed its high-water mark.
    pub fn end(&mut self, code: CloseCode) -> bool {
        if !self.is_writable() {
            return false;
        }
        self.reclaim_dropped_writer();
        if self.active_writer.is_some() {
            self.deferred.push_back(Deferred::End(code));
            return true;
        }
        self.close_now(code)
    }

    /// Drops the socket immediately, without a close handshake.
    ///
    /// Pending write callbacks receive [`WebSocketError::ConnectionLost`] and an open message
    /// stream ends with [`WebSocketError::MessageAborted`].
    pub fn destroy(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };

        #[cfg(feature = "logging")]
        log::debug!("<{}> destroying connection", self.role);

        socket.codec_mut().reset();
        drop(socket);

        self.writer.on_lost();
        self.active_writer = None;
        for deferred in self.deferred.drain(..) {
            if let Deferred::Frame {
                callback: Some(callback),
                ..
            } = deferred
            {
                callback(Err(WebSocketError::ConnectionLost));
            }
        }
        self.idle = None;
        self.wake();
    }

    /// Writes the outbound buffer to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_flush_buffer(cx)).await
    }

    /// Waits for the next event. Equivalent to [`StreamExt::next`].
    pub async fn next_event(&mut self) -> Option<Event> {
        self.next().await
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.socket.is_none() {
            Err(WebSocketError::ConnectionLost)
        } else if self.write_state != WriteState::Open {
            Err(WebSocketError::ConnectionReadonly)
        } else {
            Ok(())
        }
    }

    pub(crate) fn send_frame(
        &mut self,
        opcode: OpCode,
        is_fin: bool,
        payload: &Payload,
        callback: Option<WriteCallback>,
    ) -> bool {
        let below = self
            .writer
            .write(self.socket.as_mut(), opcode, is_fin, payload, callback);

        if self.socket.is_some() {
            self.flush_pending = true;
            if !below {
                self.need_drain = true;
            }
            self.touch();
            self.wake();
        }

        below
    }

    pub(crate) fn owns_writer(&self, id: u64) -> bool {
        self.active_writer.as_ref().is_some_and(|active| active.id == id)
    }

    /// Sends a fragment of the active message writer.
    pub(crate) fn send_fragment(&mut self, opcode: OpCode, is_fin: bool, payload: &Payload) -> bool {
        if let Some(active) = self.active_writer.as_mut() {
            active.started = true;
        }
        self.send_frame(opcode, is_fin, payload, None)
    }

    /// Marks the writer `id` as finished and replays the writes queued behind it.
    pub(crate) fn release_writer(&mut self, id: u64) {
        if !self.owns_writer(id) {
            return;
        }
        self.active_writer = None;

        while let Some(deferred) = self.deferred.pop_front() {
            match deferred {
                Deferred::Frame {
                    opcode,
                    payload,
                    callback,
                } => {
                    if self.check_writable().is_err() {
                        match callback {
                            Some(callback) => callback(Err(WebSocketError::ConnectionLost)),
                            None => self
                                .events
                                .push_back(Event::Error(WebSocketError::ConnectionLost)),
                        }
                        continue;
                    }
                    self.send_frame(opcode, true, &payload, callback);
                }
                Deferred::End(code) => {
                    self.close_now(code);
                }
            }
        }
    }

    /// Releases a message writer that was dropped before its final frame. A message that
    /// already went out in part is terminated with an empty final fragment.
    fn reclaim_dropped_writer(&mut self) {
        let Some(active) = self.active_writer.as_ref() else {
            return;
        };
        if !active.is_dropped() {
            return;
        }
        let (id, started) = (active.id, active.started);

        #[cfg(feature = "logging")]
        log::debug!("<{}> message writer dropped before its final frame", self.role);

        if started && self.is_writable() {
            self.send_frame(OpCode::Continuation, true, &Payload::empty(), None);
        }
        self.release_writer(id);
    }

    fn write_message(&mut self, opcode: OpCode, payload: Payload) -> Result<bool> {
        self.check_writable()?;
        self.reclaim_dropped_writer();
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        if self.active_writer.is_some() {
            self.deferred.push_back(Deferred::Frame {
                opcode,
                payload,
                callback: None,
            });
            return Ok(true);
        }

        Ok(self.send_frame(opcode, true, &payload, None))
    }

    /// Sends a close frame right away, even between the fragments of an active writer.
    fn close_now(&mut self, code: CloseCode) -> bool {
        if !self.is_writable() {
            return false;
        }

        #[cfg(feature = "logging")]
        log::debug!("<{}> sending close frame ({code})", self.role);

        let below = self.send_frame(OpCode::Close, true, &Payload::from(code), None);
        self.write_state = WriteState::Closing;
        below
    }

    fn touch(&mut self) {
        if let Some(idle) = self.idle.as_mut() {
            idle.as_mut().reset(Instant::now() + self.timeout);
        }
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake_by_ref();
        }
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        match &self.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => self.waker = Some(cx.waker().clone()),
        }

        if self.socket.is_some() {
            self.reclaim_dropped_writer();
        }

        loop {
            if let Some(event) = self.events.pop_front() {
                return Poll::Ready(Some(event));
            }

            if self.socket.is_none() {
                if self.close_emitted {
                    return Poll::Ready(None);
                }
                self.close_emitted = true;
                return Poll::Ready(Some(Event::Close));
            }

            let mut progress = self.poll_write_side(cx);
            if self.events.is_empty() && self.socket.is_some() {
                progress |= self.poll_read_side(cx);
            }
            if self.events.is_empty() && self.socket.is_some() {
                progress |= self.poll_idle(cx);
            }

            if self.read_ended && self.write_state == WriteState::Finished {
                self.destroy();
                continue;
            }

            if !progress && self.events.is_empty() {
                return Poll::Pending;
            }
        }
    }

    fn poll_flush_buffer(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(socket) = self.socket.as_mut() else {
            return Poll::Ready(Err(WebSocketError::ConnectionLost));
        };

        match Sink::<Frame>::poll_flush(Pin::new(socket), cx) {
            Poll::Ready(Ok(())) => {
                self.flush_pending = false;
                self.writer.on_flushed();
                if self.need_drain {
                    self.need_drain = false;
                    self.events.push_back(Event::Drain);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                #[cfg(feature = "logging")]
                log::debug!("<{}> write failed: {err}", self.role);

                self.destroy();
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Flushes, then completes a pending shutdown of the write side.
    fn poll_write_side(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;

        if self.flush_pending {
            match self.poll_flush_buffer(cx) {
                Poll::Ready(Ok(())) => progress = true,
                Poll::Ready(Err(err)) => {
                    self.events.push_back(Event::Error(err));
                    return true;
                }
                Poll::Pending => return false,
            }
        }

        if self.write_state == WriteState::Closing {
            let Some(socket) = self.socket.as_mut() else {
                return progress;
            };
            match Pin::new(socket.get_mut()).poll_shutdown(cx) {
                Poll::Ready(res) => {
                    self.write_state = WriteState::Finished;
                    if let Err(err) = res {
                        self.events.push_back(Event::Error(err.into()));
                    }
                    self.events.push_back(Event::Finish);
                    progress = true;
                }
                Poll::Pending => {}
            }
        }

        progress
    }

    fn poll_read_side(&mut self, cx: &mut Context<'_>) -> bool {
        if self.read_ended {
            return false;
        }
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };

        let polled = match socket.codec_mut().next_pending() {
            Some(item) => Poll::Ready(Some(item)),
            None => socket.poll_next_unpin(cx),
        };
        // partial frames count as traffic too
        if socket.codec_mut().take_activity() {
            self.touch();
        }
        let Poll::Ready(item) = polled else {
            return false;
        };

        match item {
            Some(Ok(message)) => self.on_message(message),
            Some(Err(err)) => self.on_read_error(err),
            None => self.on_read_end(),
        }

        true
    }

    fn poll_idle(&mut self, cx: &mut Context<'_>) -> bool {
        if self.timeout.is_zero() || self.timed_out {
            return false;
        }

        let timeout = self.timeout;
        let idle = self
            .idle
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        if idle.as_mut().poll(cx).is_pending() {
            return false;
        }

        #[cfg(feature = "logging")]
        log::debug!("<{}> idle for {timeout:?}, closing", self.role);

        self.timed_out = true;
        self.idle = None;
        self.events.push_back(Event::Timeout);

        // the close frame gets a single flush attempt, the socket is dropped either way
        self.close_now(CloseCode::Normal);
        if self.flush_pending {
            let _ = self.poll_flush_buffer(cx);
        }
        self.destroy();
        true
    }

    fn on_message(&mut self, message: Message) {
        self.touch();

        if message.opcode() == OpCode::Close {
            #[cfg(feature = "logging")]
            log::debug!("<{}> received close frame", self.role);

            self.close_now(CloseCode::Normal);
        }

        self.events.push_back(Event::Message(message));
    }

    fn on_read_error(&mut self, err: WebSocketError) {
        self.read_ended = true;

        if let WebSocketError::IoError(_) = err {
            #[cfg(feature = "logging")]
            log::debug!("<{}> read failed: {err}", self.role);

            self.events.push_back(Event::Error(err));
            self.destroy();
            return;
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "<{}> decoding failed: {err}, closing with {}",
            self.role,
            err.close_code()
        );

        self.close_now(err.close_code());
        self.events.push_back(Event::Error(err));
    }

    fn on_read_end(&mut self) {
        #[cfg(feature = "logging")]
        log::debug!("<{}> peer finished sending", self.role);

        self.read_ended = true;
        self.events.push_back(Event::End);
        if self.write_state == WriteState::Open {
            self.write_state = WriteState::Closing;
        }
    }
}

impl<S: Transport> Stream for WebSocket<S> {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn server(options: Options) -> (WebSocket<DuplexStream>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(1 << 20);
        (
            WebSocket::from_stream(local, Role::Server, Bytes::new(), options),
            remote,
        )
    }

    async fn read_exact(remote: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0; n];
        remote.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_write_text_bytes() {
        let (mut ws, mut remote) = server(Options::default());

        assert!(ws.write_text("hello").unwrap());
        ws.flush().await.unwrap();

        assert_eq!(
            read_exact(&mut remote, 7).await,
            [0x81, 0x05, b'h', b'e', b'l', b'l', b'o']
        );
    }

    #[tokio::test]
    async fn test_control_payload_limit() {
        let (mut ws, _remote) = server(Options::default());
        assert!(matches!(
            ws.ping(vec![0u8; 126]),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
        assert!(ws.ping(vec![0u8; 125]).unwrap());
    }

    #[tokio::test]
    async fn test_end_makes_connection_readonly() {
        let (mut ws, mut remote) = server(Options::default());

        assert!(ws.end(CloseCode::Normal));
        assert!(!ws.is_writable());
        assert!(matches!(
            ws.write_text("late"),
            Err(WebSocketError::ConnectionReadonly)
        ));
        assert!(!ws.end(CloseCode::Normal));

        ws.flush().await.unwrap();
        assert_eq!(read_exact(&mut remote, 4).await, [0x88, 0x02, 0x03, 0xE8]);
    }

    #[tokio::test]
    async fn test_destroy() {
        let (mut ws, _remote) = server(Options::default());

        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        ws.write_with_callback(OpCode::Binary, "pending", move |res| {
            *slot.lock().unwrap() = Some(res.is_ok());
        });

        ws.destroy();
        assert_eq!(*result.lock().unwrap(), Some(false));
        assert!(!ws.is_connected());
        assert!(matches!(
            ws.write_binary("x"),
            Err(WebSocketError::ConnectionLost)
        ));

        let called = Arc::new(Mutex::new(None));
        let slot = called.clone();
        assert!(!ws.write_with_callback(OpCode::Text, "x", move |res| {
            *slot.lock().unwrap() = Some(matches!(res, Err(WebSocketError::ConnectionLost)));
        }));
        assert_eq!(*called.lock().unwrap(), Some(true));

        assert!(matches!(ws.next().await, Some(Event::Close)));
        assert!(ws.next().await.is_none());
    }

    #[tokio::test]
    async fn test_callback_resolves_on_flush() {
        let (mut ws, _remote) = server(Options::default());

        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        assert!(ws.write_with_callback(OpCode::Text, "hi", move |res| {
            *slot.lock().unwrap() = Some(res.is_ok());
        }));
        assert_eq!(*result.lock().unwrap(), None);

        ws.flush().await.unwrap();
        assert_eq!(*result.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_message_writer_rules() {
        let (mut ws, _remote) = server(Options::default());

        assert!(matches!(
            ws.message_writer(OpCode::Ping),
            Err(WebSocketError::InvalidOpCode(0x9))
        ));

        let mut writer = ws.message_writer(OpCode::Binary).unwrap();
        assert!(matches!(
            ws.message_writer(OpCode::Text),
            Err(WebSocketError::ConnectionBusy)
        ));

        writer.end(&mut ws, Payload::empty()).unwrap();
        assert!(matches!(
            writer.write(&mut ws, "more"),
            Err(WebSocketError::WriterEnded)
        ));
        assert!(ws.message_writer(OpCode::Text).is_ok());

        let (mut lite, _remote) =
            server(Options::default().with_frame_receive_mode(FrameReceiveMode::Lite));
        assert!(matches!(
            lite.message_writer(OpCode::Text),
            Err(WebSocketError::FragmentationUnsupported)
        ));
    }

    #[tokio::test]
    async fn test_queued_callback_fails_on_destroy() {
        let (mut ws, _remote) = server(Options::default());

        let mut writer = ws.message_writer(OpCode::Text).unwrap();
        writer.write(&mut ws, "part").unwrap();

        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        assert!(ws.write_with_callback(OpCode::Binary, "queued", move |res| {
            *slot.lock().unwrap() = Some(matches!(res, Err(WebSocketError::ConnectionLost)));
        }));
        assert_eq!(*result.lock().unwrap(), None);

        ws.destroy();
        assert_eq!(*result.lock().unwrap(), Some(true));
        assert!(matches!(
            writer.end(&mut ws, "rest"),
            Err(WebSocketError::ConnectionLost)
        ));
        assert!(writer.is_ended());
    }

    #[tokio::test]
    async fn test_message_writer_size_limit() {
        let (mut ws, _remote) = server(Options::default().with_max_message_size(8));

        let mut writer = ws.message_writer(OpCode::Binary).unwrap();
        writer.write(&mut ws, vec![0u8; 5]).unwrap();
        assert!(matches!(
            writer.write(&mut ws, vec![0u8; 4]),
            Err(WebSocketError::MessageTooLarge)
        ));
        assert_eq!(writer.sent_bytes(), 5);
        writer.end(&mut ws, vec![0u8; 3]).unwrap();
    }

    #[tokio::test]
    async fn test_high_water_mark_and_drain() {
        let (mut ws, _remote) = server(Options::default().with_high_water_mark(8));

        assert!(!ws.write_binary(vec![0u8; 16]).unwrap());
        assert!(matches!(ws.next().await, Some(Event::Drain)));
    }

    #[tokio::test]
    async fn test_early_data_is_decoded_first() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let early = Bytes::from_static(&[0x81, 0x05, b'e', b'a', b'r', b'l', b'y']);
        let mut ws = WebSocket::from_stream(
            local,
            Role::Client,
            early,
            Options::default().with_frame_receive_mode(FrameReceiveMode::Simple),
        );

        remote.write_all(&[0x82, 0x01, 0xFF]).await.unwrap();

        let Some(Event::Message(first)) = ws.next().await else {
            panic!("expected a message");
        };
        assert_eq!(first.into_text().await.unwrap(), "early");

        let Some(Event::Message(second)) = ws.next().await else {
            panic!("expected a message");
        };
        assert_eq!(second.opcode(), OpCode::Binary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (mut ws, mut remote) = server(Options::default().with_timeout(Duration::from_secs(5)));

        assert!(matches!(ws.next().await, Some(Event::Timeout)));
        assert!(matches!(ws.next().await, Some(Event::Close)));
        assert!(!ws.is_connected());

        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, [0x88, 0x02, 0x03, 0xE8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_reset_by_partial_frames() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut ws = WebSocket::from_stream(
            local,
            Role::Client,
            Bytes::new(),
            Options::default()
                .with_frame_receive_mode(FrameReceiveMode::Simple)
                .with_timeout(Duration::from_secs(3)),
        );

        // a 10 byte frame trickling in one byte per second
        tokio::spawn(async move {
            remote.write_all(&[0x82, 0x0A]).await.unwrap();
            for byte in 0..10u8 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                remote.write_all(&[byte]).await.unwrap();
            }
            std::future::pending::<()>().await;
        });

        let Some(Event::Message(message)) = ws.next().await else {
            panic!("expected the message");
        };
        assert_eq!(&message.into_bytes().await.unwrap()[..], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(ws.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_with_blocked_flush() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut ws = WebSocket::from_stream(
            local,
            Role::Server,
            Bytes::new(),
            Options::default().with_timeout(Duration::from_secs(1)),
        );

        // the peer never reads, so this never leaves the buffer
        ws.write_binary(vec![0u8; 4096]).unwrap();

        assert!(matches!(ws.next().await, Some(Event::Timeout)));
        assert!(!ws.is_connected());
        assert!(matches!(ws.next().await, Some(Event::Close)));
        assert!(ws.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_writer_is_reclaimed() {
        let (mut ws, mut remote) = server(Options::default());

        let result: Result<()> = (|| {
            let mut writer = ws.message_writer(OpCode::Text)?;
            writer.write(&mut ws, "par")?;
            Err(WebSocketError::MessageAborted)
        })();
        assert!(result.is_err());

        assert!(ws.write_binary("next").unwrap());
        // dropped before sending anything
        drop(ws.message_writer(OpCode::Text).unwrap());
        assert!(ws.end(CloseCode::Normal));
        ws.flush().await.unwrap();

        assert_eq!(
            read_exact(&mut remote, 17).await,
            [
                0x01, 0x03, b'p', b'a', b'r', 0x80, 0x00, 0x82, 0x04, b'n', b'e', b'x', b't', 0x88,
                0x02, 0x03, 0xE8,
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_writer_releases_queue_on_poll() {
        let (mut ws, mut remote) = server(Options::default());

        let writer = ws.message_writer(OpCode::Binary).unwrap();
        assert!(ws.write_text("queued").unwrap());
        drop(writer);

        let polled = tokio::time::timeout(Duration::from_millis(50), ws.next()).await;
        assert!(polled.is_err());
        assert_eq!(
            read_exact(&mut remote, 8).await,
            [0x81, 0x06, b'q', b'u', b'e', b'u', b'e', b'd']
        );
    }

    #[tokio::test]
    async fn test_writer_rejected_on_other_connection() {
        let (mut first, _first_remote) = server(Options::default());
        let (mut second, _second_remote) = server(Options::default());

        let mut writer = first.message_writer(OpCode::Binary).unwrap();
        assert!(matches!(
            writer.write(&mut second, "x"),
            Err(WebSocketError::ForeignWriter)
        ));

        let _other = second.message_writer(OpCode::Binary).unwrap();
        assert!(matches!(
            writer.end(&mut second, "x"),
            Err(WebSocketError::ForeignWriter)
        ));
        assert!(!writer.is_ended());
        assert!(matches!(
            second.message_writer(OpCode::Text),
            Err(WebSocketError::ConnectionBusy)
        ));

        writer.end(&mut first, "done").unwrap();
        assert!(first.message_writer(OpCode::Text).is_ok());
    }
}
