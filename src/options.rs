use std::time::Duration;

use bytes::Bytes;
use hyper::{header::HeaderMap, StatusCode};

use crate::{codec::parse_mask_key, decoder::FrameReceiveMode, Result};

/// Default idle timeout of a connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default limit for establishing a client connection, including the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum size of an incoming or outgoing message: 64 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default size of the outbound buffer above which writes report backpressure: 16 KiB.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// How outgoing frames of a client connection are masked. Servers never mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Masking {
    /// Frames are sent unmasked.
    None,
    /// A fresh random key for every frame.
    #[default]
    Random,
    /// The same key for every frame.
    Fixed([u8; 4]),
}

impl Masking {
    /// A fixed masking key.
    ///
    /// # Errors
    /// Returns [`WebSocketError::InvalidMaskKey`](crate::WebSocketError::InvalidMaskKey) unless
    /// `key` is exactly 4 bytes long.
    pub fn fixed(key: &[u8]) -> Result<Self> {
        Ok(Self::Fixed(parse_mask_key(key)?))
    }

    /// Resolves the policy to the key of the next frame.
    pub(crate) fn key(&self) -> Option<[u8; 4]> {
        match self {
            Self::None => None,
            Self::Random => Some(rand::random()),
            Self::Fixed(key) => Some(*key),
        }
    }
}

/// Configuration options for a WebSocket connection.
///
/// `Options` governs the receive strategy, size limits, timeouts, masking and backpressure of a
/// connection. Every setting has a `with_*` builder method.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use wscore::{FrameReceiveMode, Options};
///
/// let options = Options::default()
///     .with_frame_receive_mode(FrameReceiveMode::Simple)
///     .with_max_message_size(1024 * 1024)
///     .with_timeout(Duration::from_secs(10));
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// Idle time after which the connection emits a timeout, sends a close frame and is
    /// destroyed. [`Duration::ZERO`] disables the timer.
    ///
    /// Default: 60 seconds
    pub timeout: Duration,

    /// Limit for a client to connect and complete the handshake.
    ///
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Maximum size of one message, in bytes. Applies to received messages (per frame in lite
    /// mode, cumulative otherwise) and to messages written through a
    /// [`MessageWriter`](crate::MessageWriter).
    ///
    /// Default: 64 MiB
    pub max_message_size: usize,

    /// How incoming frames are turned into messages.
    ///
    /// Default: [`FrameReceiveMode::Standard`]
    pub frame_receive_mode: FrameReceiveMode,

    /// Masking of outgoing frames on client connections.
    ///
    /// Default: [`Masking::Random`]
    pub masking: Masking,

    /// Size of the outbound buffer above which writes return `false`.
    ///
    /// Default: 16 KiB
    pub high_water_mark: usize,

    /// Sub-protocols offered by a client in `Sec-WebSocket-Protocol`, in preference order.
    pub sub_protocols: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            frame_receive_mode: FrameReceiveMode::default(),
            masking: Masking::default(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            sub_protocols: Vec::new(),
        }
    }
}

impl Options {
    /// Sets the idle timeout. [`Duration::ZERO`] disables it.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Sets the limit for connecting and completing a client handshake.
    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    /// Sets the maximum message size in bytes.
    pub fn with_max_message_size(self, max_message_size: usize) -> Self {
        Self {
            max_message_size,
            ..self
        }
    }

    /// Selects the decoder used for incoming frames.
    pub fn with_frame_receive_mode(self, frame_receive_mode: FrameReceiveMode) -> Self {
        Self {
            frame_receive_mode,
            ..self
        }
    }

    /// Sets the masking policy of client connections.
    pub fn with_masking(self, masking: Masking) -> Self {
        Self { masking, ..self }
    }

    /// Sets the outbound buffer size above which writes report backpressure.
    pub fn with_high_water_mark(self, high_water_mark: usize) -> Self {
        Self {
            high_water_mark,
            ..self
        }
    }

    /// Adds a sub-protocol to the client's offer.
    pub fn with_sub_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.sub_protocols.push(protocol.into());
        self
    }
}

/// Per-connection settings of a server accepting an upgrade request.
#[derive(Clone, Debug, Default)]
pub struct AcceptOptions {
    /// Sub-protocol selected for this connection, sent back in `Sec-WebSocket-Protocol`.
    pub sub_protocol: Option<String>,
    /// Additional headers written in the `101 Switching Protocols` response.
    pub headers: HeaderMap,
    /// Overrides [`Options::timeout`] for this connection.
    pub timeout: Option<Duration>,
}

impl AcceptOptions {
    pub fn with_sub_protocol(self, protocol: impl Into<String>) -> Self {
        Self {
            sub_protocol: Some(protocol.into()),
            ..self
        }
    }

    pub fn with_headers(self, headers: HeaderMap) -> Self {
        Self { headers, ..self }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }
}

/// The HTTP response written when a server refuses an upgrade request.
#[derive(Clone, Debug)]
pub struct RejectOptions {
    /// Default: `400 Bad Request`
    pub status: StatusCode,
    /// Additional response headers. `Content-Length` is always computed from the body.
    pub headers: HeaderMap,
    /// Default: `BAD REQUEST`
    pub body: Bytes,
}

impl Default for RejectOptions {
    fn default() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"BAD REQUEST"),
        }
    }
}

impl RejectOptions {
    pub fn with_status(self, status: StatusCode) -> Self {
        Self { status, ..self }
    }

    pub fn with_headers(self, headers: HeaderMap) -> Self {
        Self { headers, ..self }
    }

    pub fn with_body(self, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WebSocketError;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.timeout, Duration::from_secs(60));
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.max_message_size, 0x4000000);
        assert_eq!(options.frame_receive_mode, FrameReceiveMode::Standard);
        assert_eq!(options.masking, Masking::Random);

        let reject = RejectOptions::default();
        assert_eq!(reject.status, StatusCode::BAD_REQUEST);
        assert_eq!(&reject.body[..], b"BAD REQUEST");
    }

    #[test]
    fn test_fixed_masking() {
        assert_eq!(
            Masking::fixed(&[1, 2, 3, 4]).unwrap(),
            Masking::Fixed([1, 2, 3, 4])
        );
        assert!(matches!(
            Masking::fixed(&[1, 2, 3]),
            Err(WebSocketError::InvalidMaskKey)
        ));
        assert_eq!(Masking::Fixed([1, 2, 3, 4]).key(), Some([1, 2, 3, 4]));
        assert_eq!(Masking::None.key(), None);
        assert!(Masking::Random.key().is_some());
    }

    #[test]
    fn test_builders() {
        let options = Options::default()
            .with_sub_protocol("chat")
            .with_sub_protocol("superchat")
            .with_high_water_mark(1)
            .with_timeout(Duration::ZERO);
        assert_eq!(options.sub_protocols, vec!["chat", "superchat"]);
        assert_eq!(options.high_water_mark, 1);
        assert!(options.timeout.is_zero());
    }
}
