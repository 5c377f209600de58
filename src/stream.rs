use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::rustls::pki_types::CertificateDer;

/// A bidirectional byte stream a connection can run on.
///
/// Besides reading and writing, a transport reports whether it is encrypted and, where it
/// applies, the peer certificate and socket addresses. The defaults describe a plain stream
/// without addresses.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Returns `true` if the stream runs over TLS.
    fn is_tls(&self) -> bool {
        false
    }

    /// The first certificate presented by the peer, if any.
    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }
}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {}

impl Transport for DuplexStream {}

impl Transport for TokioIo<Upgraded> {}

impl<S: Transport> Transport for tokio_rustls::client::TlsStream<S> {
    fn is_tls(&self) -> bool {
        true
    }

    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let (_, session) = self.get_ref();
        session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr()
    }
}

impl<S: Transport> Transport for tokio_rustls::server::TlsStream<S> {
    fn is_tls(&self) -> bool {
        true
    }

    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let (_, session) = self.get_ref();
        session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr()
    }
}

/// A stream that is either plain or wrapped in a client TLS session.
///
/// This is the transport of connections opened with [`WebSocket::connect`](crate::WebSocket::connect):
/// `ws://` URLs produce [`MaybeTlsStream::Plain`] and `wss://` URLs [`MaybeTlsStream::Tls`].
pub enum MaybeTlsStream<S> {
    Plain(S),
    Tls(Box<tokio_rustls::client::TlsStream<S>>),
}

impl<S: Transport> Transport for MaybeTlsStream<S> {
    fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(stream) => stream.peer_certificate(),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Plain(stream) => stream.peer_addr(),
            Self::Tls(stream) => Transport::peer_addr(stream.as_ref()),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Plain(stream) => stream.local_addr(),
            Self::Tls(stream) => Transport::local_addr(stream.as_ref()),
        }
    }
}

impl<S> AsyncRead for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
