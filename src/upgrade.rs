//! Server side of the opening handshake.
//!
//! There are two ways to turn an HTTP request into a server connection:
//!
//! - [`WebSocket::accept`] writes the `101 Switching Protocols` response straight to a socket
//!   whose request was parsed elsewhere, and [`WebSocket::reject`] answers it with an error.
//! - [`WebSocket::upgrade`] works with a [`hyper`] server: it returns the response to hand
//!   back to hyper together with an [`UpgradeFut`] that resolves to the connection once hyper
//!   has switched protocols.
use std::{
    borrow::BorrowMut,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    upgrade::Upgraded,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    connection::{Role, WebSocket},
    options::{AcceptOptions, Options, RejectOptions},
    stream::Transport,
    Result, WebSocketError,
};

/// A request without a body, as used for the client handshake.
pub type HttpRequest = hyper::http::request::Request<()>;

/// Builder of the client handshake request. Headers set on it are sent along with the
/// WebSocket ones.
pub type HttpRequestBuilder = hyper::http::request::Builder;

/// The `101 Switching Protocols` response produced by [`WebSocket::upgrade`].
pub type HttpResponse = Response<Empty<Bytes>>;

/// The response to send back to the client and the future resolving to the connection.
pub type UpgradeResult = Result<(HttpResponse, UpgradeFut)>;

const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
///
/// ```
/// assert_eq!(
///     wscore::accept_hash(b"dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_hash(key: impl AsRef<[u8]>) -> String {
    use base64::prelude::*;

    let mut sha1 = Sha1::new();
    sha1.update(key.as_ref());
    sha1.update(ACCEPT_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Returns `true` if the headers ask for a WebSocket upgrade: a `Sec-WebSocket-Key`,
/// `Upgrade: websocket` and an `upgrade` token in `Connection`.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    validate_request(headers).is_ok()
}

/// The sub-protocols offered in `Sec-WebSocket-Protocol`, in the client's order.
pub fn requested_sub_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty())
        .map(String::from)
        .collect()
}

/// Checks the upgrade headers and returns the client key.
fn validate_request(headers: &HeaderMap) -> Result<&HeaderValue> {
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;

    if !headers
        .get(header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !headers
        .get(header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .map(|h| {
            h.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false)
    {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    if let Some(version) = headers.get(header::SEC_WEBSOCKET_VERSION) {
        if version.as_bytes() != b"13" {
            return Err(WebSocketError::InvalidSecWebsocketVersion);
        }
    }

    Ok(key)
}

fn is_handshake_header(name: &HeaderName) -> bool {
    name == header::UPGRADE
        || name == header::CONNECTION
        || name == header::SEC_WEBSOCKET_ACCEPT
        || name == header::SEC_WEBSOCKET_PROTOCOL
}

fn write_header(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    out.extend_from_slice(name);
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

impl<S: Transport> WebSocket<S> {
    /// Accepts an upgrade request whose headers were read from `socket` by an HTTP server.
    ///
    /// Writes the `101 Switching Protocols` response and returns a server connection over
    /// `socket`. `early_data` holds bytes the HTTP server read past the request; they are
    /// decoded before anything else.
    ///
    /// # Errors
    /// [`WebSocketError::MissingSecWebSocketKey`], [`WebSocketError::InvalidUpgradeHeader`],
    /// [`WebSocketError::InvalidConnectionHeader`] or
    /// [`WebSocketError::InvalidSecWebsocketVersion`] if the request is not a valid upgrade,
    /// and [`WebSocketError::IoError`] if the response cannot be written. Nothing is written
    /// when validation fails.
    pub async fn accept(
        headers: &HeaderMap,
        mut socket: S,
        early_data: Bytes,
        accept: AcceptOptions,
        options: Options,
    ) -> Result<Self> {
        let key = validate_request(headers)?;

        let mut response = Vec::with_capacity(256);
        response.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        write_header(&mut response, b"Upgrade", b"websocket");
        write_header(&mut response, b"Connection", b"Upgrade");
        write_header(
            &mut response,
            b"Sec-WebSocket-Accept",
            accept_hash(key.as_bytes()).as_bytes(),
        );
        if let Some(protocol) = accept.sub_protocol.as_deref() {
            write_header(&mut response, b"Sec-WebSocket-Protocol", protocol.as_bytes());
        }
        for (name, value) in accept.headers.iter() {
            if !is_handshake_header(name) {
                write_header(&mut response, name.as_str().as_bytes(), value.as_bytes());
            }
        }
        response.extend_from_slice(b"\r\n");

        socket.write_all(&response).await?;

        #[cfg(feature = "logging")]
        log::debug!(
            "accepted websocket upgrade (protocol: {:?}, {} bytes of early data)",
            accept.sub_protocol,
            early_data.len()
        );

        let options = match accept.timeout {
            Some(timeout) => options.with_timeout(timeout),
            None => options,
        };

        Ok(Self::from_stream(socket, Role::Server, early_data, options))
    }
}

impl<S: AsyncWrite + Unpin> WebSocket<S> {
    /// Refuses an upgrade request: writes the HTTP response described by `reject` and shuts
    /// the socket down.
    pub async fn reject(mut socket: S, reject: RejectOptions) -> Result<()> {
        let mut response = Vec::with_capacity(128 + reject.body.len());
        response.extend_from_slice(format!("HTTP/1.1 {}\r\n", reject.status).as_bytes());
        for (name, value) in reject.headers.iter() {
            if name != header::CONTENT_LENGTH {
                write_header(&mut response, name.as_str().as_bytes(), value.as_bytes());
            }
        }
        write_header(
            &mut response,
            b"Content-Length",
            reject.body.len().to_string().as_bytes(),
        );
        response.extend_from_slice(b"\r\n");
        response.extend_from_slice(&reject.body);

        #[cfg(feature = "logging")]
        log::debug!("rejected websocket upgrade with {}", reject.status);

        socket.write_all(&response).await?;
        socket.shutdown().await?;
        Ok(())
    }
}

impl WebSocket<TokioIo<Upgraded>> {
    /// Upgrades a request received by a [`hyper`] server, with default options.
    ///
    /// # Example
    /// ```no_run
    /// use hyper::{body::Incoming, Request};
    /// use wscore::{HttpResponse, WebSocket};
    ///
    /// async fn handle(mut req: Request<Incoming>) -> wscore::Result<HttpResponse> {
    ///     let (response, fut) = WebSocket::upgrade(&mut req)?;
    ///
    ///     tokio::spawn(async move {
    ///         if let Ok(mut ws) = fut.await {
    ///             let _ = ws.write_text("welcome");
    ///             // drive `ws` as a stream of events
    ///         }
    ///     });
    ///
    ///     Ok(response)
    /// }
    /// ```
    pub fn upgrade<B>(request: impl BorrowMut<Request<B>>) -> UpgradeResult {
        Self::upgrade_with_options(request, Options::default())
    }

    /// Upgrades a request received by a [`hyper`] server.
    pub fn upgrade_with_options<B>(
        request: impl BorrowMut<Request<B>>,
        options: Options,
    ) -> UpgradeResult {
        Self::upgrade_with_accept(request, AcceptOptions::default(), options)
    }

    /// Upgrades a request received by a [`hyper`] server, selecting a sub-protocol or adding
    /// response headers through `accept`.
    ///
    /// The returned response must be sent before the [`UpgradeFut`] can complete.
    pub fn upgrade_with_accept<B>(
        mut request: impl BorrowMut<Request<B>>,
        accept: AcceptOptions,
        options: Options,
    ) -> UpgradeResult {
        let request = request.borrow_mut();
        let key = validate_request(request.headers())?;

        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept_hash(key.as_bytes()));

        if let Some(protocol) = accept.sub_protocol.as_deref() {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocol);
        }
        for (name, value) in accept.headers.iter() {
            if !is_handshake_header(name) {
                builder = builder.header(name, value);
            }
        }

        let response = builder.body(Empty::new())?;

        let options = match accept.timeout {
            Some(timeout) => options.with_timeout(timeout),
            None => options,
        };

        let fut = UpgradeFut {
            inner: hyper::upgrade::on(request),
            options: Some(options),
        };

        Ok((response, fut))
    }
}

/// Completes a [`hyper`] upgrade and yields the server connection.
///
/// Returned by [`WebSocket::upgrade`]. It resolves once hyper has sent the `101` response and
/// handed over the connection, so the response has to be returned from the service first.
#[pin_project]
#[derive(Debug)]
pub struct UpgradeFut {
    #[pin]
    inner: hyper::upgrade::OnUpgrade,
    options: Option<Options>,
}

impl Future for UpgradeFut {
    type Output = Result<WebSocket<TokioIo<Upgraded>>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = match this.inner.poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(upgraded) => upgraded?,
        };

        let options = this.options.take().unwrap_or_default();

        #[cfg(feature = "logging")]
        log::debug!("upgraded http connection to websocket");

        // Bytes hyper read past the request are replayed by `Upgraded` itself.
        Poll::Ready(Ok(WebSocket::from_stream(
            TokioIo::new(upgraded),
            Role::Server,
            Bytes::new(),
            options,
        )))
    }
}
