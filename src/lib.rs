//! # wscore
//! A protocol engine for WebSocket (RFC 6455) connections over any async byte stream, with three
//! interchangeable receive strategies, fragmented message writing and handshake helpers for both
//! clients and servers.
//!
//! # Receive modes
//! Incoming frames are turned into [`Message`] values by one of three decoders, selected with
//! [`Options::with_frame_receive_mode`]:
//!
//! - [`FrameReceiveMode::Standard`]: a message is surfaced as soon as its first frame header is
//!   parsed. The payload arrives incrementally through a [`MessageReadStream`], so large or
//!   fragmented messages never need to be buffered by the connection.
//! - [`FrameReceiveMode::Simple`]: all frames of a message are collected and surfaced once, as a
//!   [`SimpleMessage`] holding the zero-copy chunk list.
//! - [`FrameReceiveMode::Lite`]: one frame is one message. Fragmented messages are rejected.
//!
//! # Features
//! - `logging`: Enables debug logging for the handshake, decode failures and connection shutdown
//!   using the `log` crate. Enabled by default.
//!
//! # Client Example
//! ```no_run
//! use futures::StreamExt;
//! use wscore::{Event, FrameReceiveMode, Options, WebSocket};
//!
//! async fn client() -> wscore::Result<()> {
//!     let mut ws = WebSocket::connect("ws://127.0.0.1:9000/chat".parse()?)
//!         .with_options(Options::default().with_frame_receive_mode(FrameReceiveMode::Simple))
//!         .await?;
//!     ws.write_text("hello")?;
//!     ws.flush().await?;
//!
//!     while let Some(event) = ws.next().await {
//!         if let Event::Message(message) = event {
//!             let text = message.into_text().await?;
//!             println!("received {text}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Server Example
//! ```no_run
//! use http_body_util::Empty;
//! use hyper::{body::{Bytes, Incoming}, Request, Response};
//! use futures::StreamExt;
//! use wscore::{Event, WebSocket};
//!
//! async fn server_upgrade(
//!     mut req: Request<Incoming>,
//! ) -> wscore::Result<Response<Empty<Bytes>>> {
//!     let (response, fut) = WebSocket::upgrade(&mut req)?;
//!
//!     tokio::spawn(async move {
//!         if let Ok(mut ws) = fut.await {
//!             while let Some(event) = ws.next().await {
//!                 // Process events from the client here
//!             }
//!         }
//!     });
//!
//!     Ok(response)
//! }
//! ```
//!
//! # Driving a connection
//! Writes only append encoded frames to the outbound buffer. The buffer reaches the socket while
//! the connection is polled as a [`futures::Stream`] of [`Event`]s, or when [`WebSocket::flush`]
//! is awaited. A write returning `false` means the buffer passed its high-water mark; wait for
//! [`Event::Drain`] before writing more.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
pub mod decoder;
pub mod frame;
pub mod mask;
pub mod message;

mod builder;
mod connection;
mod options;
mod stream;
mod upgrade;
mod writer;

use thiserror::Error;

pub use builder::WebSocketBuilder;
pub use close::CloseCode;
pub use connection::{Event, Role, WebSocket};
pub use decoder::FrameReceiveMode;
pub use frame::{Frame, OpCode, Payload};
pub use message::{Message, MessageReadStream, SimpleMessage};
pub use options::{AcceptOptions, Masking, Options, RejectOptions};
pub use stream::{MaybeTlsStream, Transport};
pub use upgrade::{
    accept_hash, is_websocket_request, requested_sub_protocols, HttpRequest, HttpRequestBuilder,
    HttpResponse, UpgradeFut, UpgradeResult,
};
pub use writer::{MessageWriter, WriteCallback};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Connection state errors (the socket is gone, read-only, or busy with a fragmented message)
/// - Protocol errors raised by the decoders while parsing frames
/// - Handshake errors, which never produce a connection
/// - I/O, HTTP and URL errors from the underlying libraries
///
/// Decoding failures map to the close code sent to the peer through
/// [`WebSocketError::close_code`].
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The socket is closed or was destroyed. No further communication is possible.
    #[error("Connection lost")]
    ConnectionLost,

    /// The local write side has been shut down (a close frame was sent), while
    /// the connection may still be reading.
    #[error("Connection is read-only")]
    ConnectionReadonly,

    /// A [`MessageWriter`] is already active on the connection.
    #[error("Connection is busy with another message writer")]
    ConnectionBusy,

    /// The [`MessageWriter`] was obtained from a different connection.
    #[error("Message writer belongs to another connection")]
    ForeignWriter,

    /// The [`MessageWriter`] has already sent its final frame.
    #[error("Message writer has ended")]
    WriterEnded,

    /// The message stream was cut off before its final frame arrived.
    #[error("Message aborted")]
    MessageAborted,

    /// A fragmented frame was received by a decoder that only accepts complete
    /// single-frame messages.
    #[error("Frame broken")]
    FrameBroken,

    /// Indicates that reserved bits in the WebSocket frame header are set when they
    /// should be 0 per RFC 6455.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Indicates receipt of a frame with an invalid opcode value.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Occurs when a new text or binary frame starts while a fragmented message is still open.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit
    /// not set. RFC 6455 requires that control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeds 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A fragmented write was requested on a connection using the lite receive mode.
    #[error("Fragmentation is not supported in lite mode")]
    FragmentationUnsupported,

    /// A received or written message exceeds the configured maximum size.
    #[error("Message too large")]
    MessageTooLarge,

    /// A masking key is not exactly 4 bytes long.
    #[error("Invalid mask key")]
    InvalidMaskKey,

    /// Text message payload is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// The connection attempt or the connection itself timed out.
    #[error("Timeout")]
    Timeout,

    /// The server's handshake response was rejected. The message names the offending part.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Occurs during handshake when the required "Sec-WebSocket-Key" header is missing from
    /// the client request.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// Returned when the "Sec-WebSocket-Version" header is present and not set to 13.
    #[error("Sec-Websocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// The "Upgrade" header of the request is missing or is not "websocket".
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The "Connection" header of the request is missing or does not contain "upgrade".
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// Returned when attempting to establish a WebSocket connection with an invalid URL scheme.
    /// Only "ws://" and "wss://" schemes are valid.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// Wraps errors from URL parsing that may occur when processing WebSocket URLs.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps standard I/O errors that may occur during WebSocket communication.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps errors from the hyper HTTP library during the handshake or connection upgrade.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    /// An HTTP request or response could not be built from the supplied parts.
    #[error(transparent)]
    InvalidRequest(#[from] hyper::http::Error),

    /// A configured header value contains characters not allowed in HTTP headers.
    #[error(transparent)]
    InvalidHeaderValue(#[from] hyper::header::InvalidHeaderValue),
}

impl WebSocketError {
    /// Returns `true` for violations of the framing rules by the peer.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ReservedBitsNotZero
                | Self::InvalidOpCode(_)
                | Self::InvalidContinuationFrame
                | Self::InvalidFragment
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge
                | Self::FragmentationUnsupported
                | Self::FrameBroken
        )
    }

    /// The close code sent to the peer when this error ends a connection.
    pub fn close_code(&self) -> CloseCode {
        if self.is_protocol_error() {
            CloseCode::Protocol
        } else if matches!(self, Self::MessageTooLarge) {
            CloseCode::Size
        } else {
            CloseCode::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(WebSocketError::ReservedBitsNotZero.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::InvalidOpCode(3).close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::InvalidContinuationFrame.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::ControlFrameTooLarge.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::FrameBroken.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::MessageTooLarge.close_code(), CloseCode::Size);
        assert_eq!(WebSocketError::ConnectionLost.close_code(), CloseCode::Error);
        assert_eq!(WebSocketError::Timeout.close_code(), CloseCode::Error);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(WebSocketError::InvalidOpCode(7).to_string(), "Invalid opcode (byte=7)");
        assert_eq!(
            WebSocketError::HandshakeFailed("missing Sec-WebSocket-Accept".into()).to_string(),
            "Handshake failed: missing Sec-WebSocket-Accept"
        );
    }
}
