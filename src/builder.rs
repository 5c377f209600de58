//! Client side of the opening handshake.
use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use http_body_util::Empty;
use hyper::{body::Incoming, header, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};
use url::Url;

use crate::{
    connection::{Role, WebSocket},
    options::Options,
    stream::{MaybeTlsStream, Transport},
    upgrade::{accept_hash, HttpRequest, HttpRequestBuilder},
    Result, WebSocketError,
};

/// Builder for client connections opened with [`WebSocket::connect`].
///
/// The builder is a future: configure it, then `.await` it to connect.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use wscore::{FrameReceiveMode, Options, WebSocket};
///
/// async fn connect() -> wscore::Result<()> {
///     let ws = WebSocket::connect("wss://example.com/socket".parse()?)
///         .with_options(
///             Options::default()
///                 .with_frame_receive_mode(FrameReceiveMode::Simple)
///                 .with_connect_timeout(Duration::from_secs(5))
///                 .with_sub_protocol("chat"),
///         )
///         .await?;
///
///     assert!(ws.is_tls());
///     Ok(())
/// }
/// ```
pub struct WebSocketBuilder {
    opts: Option<BuilderOpts>,
    future: Option<BoxFuture<'static, Result<WebSocket<MaybeTlsStream<TcpStream>>>>>,
}

struct BuilderOpts {
    url: Url,
    tcp_address: Option<SocketAddr>,
    connector: Option<TlsConnector>,
    options: Option<Options>,
    http_builder: Option<HttpRequestBuilder>,
}

impl WebSocketBuilder {
    fn new(url: Url) -> Self {
        Self {
            opts: Some(BuilderOpts {
                url,
                tcp_address: None,
                connector: None,
                options: None,
                http_builder: None,
            }),
            future: None,
        }
    }

    fn opts(&mut self) -> &mut BuilderOpts {
        let Some(opts) = &mut self.opts else {
            unreachable!("builder configured after being polled")
        };
        opts
    }

    /// Sets the TLS connector used for `wss://` URLs.
    ///
    /// By default the connector trusts the webpki root certificates and negotiates `http/1.1`.
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        self.opts().connector = Some(connector);
        self
    }

    /// Connects to `address` instead of resolving the host of the URL. The URL still decides
    /// the `Host` header and the TLS server name.
    pub fn with_tcp_address(mut self, address: SocketAddr) -> Self {
        self.opts().tcp_address = Some(address);
        self
    }

    /// Sets the options of the connection.
    pub fn with_options(mut self, options: Options) -> Self {
        self.opts().options = Some(options);
        self
    }

    /// Sets the HTTP request the handshake starts from, for example to add headers.
    ///
    /// ```no_run
    /// use wscore::{HttpRequestBuilder, WebSocket};
    ///
    /// async fn connect() -> wscore::Result<()> {
    ///     let ws = WebSocket::connect("ws://127.0.0.1:8080/".parse()?)
    ///         .with_request(HttpRequestBuilder::new().header("Authorization", "Bearer token"))
    ///         .await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with_request(mut self, builder: HttpRequestBuilder) -> Self {
        self.opts().http_builder = Some(builder);
        self
    }
}

impl Future for WebSocketBuilder {
    type Output = Result<WebSocket<MaybeTlsStream<TcpStream>>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(opts) = this.opts.take() {
            let options = opts.options.unwrap_or_default();
            let connect_timeout = options.connect_timeout;
            let future = WebSocket::connect_priv(
                opts.url,
                opts.tcp_address,
                opts.connector,
                options,
                opts.http_builder.unwrap_or_else(HttpRequest::builder),
            );
            this.future = Some(with_timeout(connect_timeout, future).boxed());
        }

        let Some(future) = &mut this.future else {
            unreachable!()
        };
        future.poll_unpin(cx)
    }
}

/// Bounds `future` by `limit`; zero means no limit.
async fn with_timeout<T>(limit: Duration, future: impl Future<Output = Result<T>>) -> Result<T> {
    if limit.is_zero() {
        return future.await;
    }
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| WebSocketError::Timeout)?
}

impl WebSocket<MaybeTlsStream<TcpStream>> {
    /// Connects to a `ws://` or `wss://` URL.
    ///
    /// Returns a [`WebSocketBuilder`] to configure before awaiting it. Connecting and the
    /// handshake together are bounded by [`Options::connect_timeout`].
    ///
    /// ```no_run
    /// use wscore::WebSocket;
    ///
    /// #[tokio::main]
    /// async fn main() -> wscore::Result<()> {
    ///     let mut ws = WebSocket::connect("ws://127.0.0.1:8080/".parse()?).await?;
    ///     ws.write_text("hello")?;
    ///     ws.flush().await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn connect(url: Url) -> WebSocketBuilder {
        WebSocketBuilder::new(url)
    }

    async fn connect_priv(
        url: Url,
        tcp_address: Option<SocketAddr>,
        connector: Option<TlsConnector>,
        options: Options,
        builder: HttpRequestBuilder,
    ) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or(WebSocketError::UrlParseError(url::ParseError::EmptyHost))?
            .to_string();

        let tcp_stream = match tcp_address {
            Some(address) => TcpStream::connect(address).await?,
            None => {
                let port = url
                    .port_or_known_default()
                    .ok_or(WebSocketError::UrlParseError(url::ParseError::InvalidPort))?;
                TcpStream::connect((host.as_str(), port)).await?
            }
        };
        let _ = tcp_stream.set_nodelay(true);

        let stream = match url.scheme() {
            "ws" => MaybeTlsStream::Plain(tcp_stream),
            "wss" => {
                let connector = match connector {
                    Some(connector) => connector,
                    None => tls_connector()?,
                };
                let domain = ServerName::try_from(host)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;

                MaybeTlsStream::Tls(Box::new(connector.connect(domain, tcp_stream).await?))
            }
            _ => return Err(WebSocketError::InvalidHttpScheme),
        };

        Self::handshake_priv(url, stream, options, builder).await
    }
}

impl<S: Transport> WebSocket<S> {
    /// Performs the client handshake over an already connected stream.
    ///
    /// Useful for transports [`WebSocket::connect`] does not open itself, such as Unix sockets
    /// or streams behind a proxy. The handshake is bounded by [`Options::connect_timeout`].
    pub async fn handshake(url: Url, io: S, options: Options) -> Result<Self> {
        Self::handshake_with_request(url, io, options, HttpRequest::builder()).await
    }

    /// Performs the client handshake starting from a custom HTTP request.
    pub async fn handshake_with_request(
        url: Url,
        io: S,
        options: Options,
        builder: HttpRequestBuilder,
    ) -> Result<Self> {
        let connect_timeout = options.connect_timeout;
        with_timeout(
            connect_timeout,
            Self::handshake_priv(url, io, options, builder),
        )
        .await
    }

    async fn handshake_priv(
        url: Url,
        io: S,
        options: Options,
        mut builder: HttpRequestBuilder,
    ) -> Result<Self> {
        let has_host = builder
            .headers_ref()
            .map(|headers| headers.contains_key(header::HOST))
            .unwrap_or(false);
        if !has_host {
            let host = url
                .host_str()
                .ok_or(WebSocketError::UrlParseError(url::ParseError::EmptyHost))?;
            let host_header = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            builder = builder.header(header::HOST, host_header);
        }

        let key = generate_key();
        let target = &url[url::Position::BeforePath..];

        builder = builder
            .method("GET")
            .uri(target)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_KEY, key.as_str())
            .header(header::SEC_WEBSOCKET_VERSION, "13");
        if !options.sub_protocols.is_empty() {
            builder = builder.header(
                header::SEC_WEBSOCKET_PROTOCOL,
                options.sub_protocols.join(", "),
            );
        }
        let request = builder.body(Empty::<Bytes>::new())?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

        tokio::spawn(async move {
            if let Err(_err) = conn.with_upgrades().await {
                #[cfg(feature = "logging")]
                log::error!("upgrading connection: {:?}", _err);
            }
        });

        let mut response = sender
            .send_request(request)
            .await
            .map_err(closed_before_upgrade)?;
        if let Err(err) = verify(&response, &key) {
            #[cfg(feature = "logging")]
            log::debug!("handshake with {url} failed: {err}");
            return Err(err);
        }

        let upgraded = hyper::upgrade::on(&mut response)
            .await
            .map_err(closed_before_upgrade)?;
        let parts = upgraded.downcast::<TokioIo<S>>().map_err(|_| {
            WebSocketError::HandshakeFailed("upgraded connection has an unexpected type".into())
        })?;

        #[cfg(feature = "logging")]
        log::debug!(
            "handshake with {url} completed ({} bytes of early data)",
            parts.read_buf.len()
        );

        Ok(WebSocket::from_stream(
            parts.io.into_inner(),
            Role::Client,
            parts.read_buf,
            options,
        ))
    }
}

/// Reports a socket that went away in the middle of the handshake as a failed handshake.
fn closed_before_upgrade(err: hyper::Error) -> WebSocketError {
    if err.is_incomplete_message() || err.is_closed() || err.is_canceled() {
        WebSocketError::HandshakeFailed("connection closed before upgrade".into())
    } else {
        err.into()
    }
}

fn verify(response: &Response<Incoming>, key: &str) -> Result<()> {
    verify_parts(response.status(), response.headers(), key)
}

fn verify_parts(status: StatusCode, headers: &header::HeaderMap, key: &str) -> Result<()> {
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(WebSocketError::HandshakeFailed(format!(
            "unexpected status {status}"
        )));
    }

    if !headers
        .get(header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(WebSocketError::HandshakeFailed(
            "missing Upgrade header".into(),
        ));
    }

    if !headers
        .get(header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("upgrade"))
        .unwrap_or(false)
    {
        return Err(WebSocketError::HandshakeFailed(
            "missing Connection header".into(),
        ));
    }

    let Some(accept) = headers.get(header::SEC_WEBSOCKET_ACCEPT) else {
        return Err(WebSocketError::HandshakeFailed(
            "missing Sec-WebSocket-Accept header".into(),
        ));
    };

    if accept.as_bytes() != accept_hash(key).as_bytes() {
        return Err(WebSocketError::HandshakeFailed(
            "Sec-WebSocket-Accept does not match Sec-WebSocket-Key".into(),
        ));
    }

    Ok(())
}

fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// A TLS connector trusting the webpki roots.
fn tls_connector() -> Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}
