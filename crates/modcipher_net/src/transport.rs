use crate::hello;
use crate::rewrite;
use anyhow::{Context as _, Result};
use bytes::{Buf, BytesMut};
use modcipher_traits::Preferences;
use socket2::{SockRef, TcpKeepalive};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Protocol-agnostic async stream, so TLS and plain connections share one type.
pub type BoxedStream = Box<dyn RawStream>;

pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// Address queries forwarded by [`CipherConn`] to the stream it wraps.
pub trait SocketInfo {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl SocketInfo for std::net::TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        std::net::TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        std::net::TcpStream::peer_addr(self)
    }
}

impl SocketInfo for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// Connection decorator that reorders the cipher suites of an outbound
/// ClientHello before it reaches the wrapped stream.
///
/// Every write is inspected. A write that starts with a complete ClientHello
/// record is copied into a scratch buffer, rewritten there, and forwarded in
/// full; the caller sees the length of its own buffer, which is unchanged by
/// the rewrite. Any other write is forwarded untouched and its result is
/// returned as-is. Reads, flushes and shutdown go straight through.
///
/// The preferences are shared read-only, so one `Arc<Preferences>` can back
/// any number of connections on any number of threads.
pub struct CipherConn<S> {
    inner: S,
    preferences: Arc<Preferences>,
    scratch: BytesMut,
    /// Length reported to the caller once `scratch` has been drained (async only).
    pending: Option<usize>,
}

impl<S> CipherConn<S> {
    pub fn new(inner: S, preferences: Arc<Preferences>) -> Self {
        Self {
            inner,
            preferences,
            scratch: BytesMut::new(),
            pending: None,
        }
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Copies `buf` into the scratch buffer and rewrites it if it is a
    /// ClientHello. Returns `false`, leaving the scratch buffer empty, for
    /// anything that must be passed through.
    fn stage(&mut self, buf: &[u8]) -> bool {
        let view = match hello::inspect(buf) {
            Ok(view) => view,
            Err(reason) => {
                trace!(%reason, len = buf.len(), "write passed through");
                return false;
            }
        };

        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        if rewrite::apply(&mut self.scratch, view, &self.preferences).is_none() {
            self.scratch.clear();
            return false;
        }
        true
    }
}

impl<S: SocketInfo> SocketInfo for CipherConn<S> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl<S: Read> Read for CipherConn<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<S: Write> Write for CipherConn<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.stage(buf) {
            return self.inner.write(buf);
        }
        let result = self.inner.write_all(&self.scratch);
        self.scratch.clear();
        result.map(|()| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: AsyncWrite + Unpin> CipherConn<S> {
    /// Pushes the staged record into the inner stream. Short writes and
    /// `Pending` keep the remainder staged for the next poll.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        while !self.scratch.is_empty() {
            match ready!(Pin::new(&mut self.inner).poll_write(cx, &self.scratch)) {
                Ok(0) => {
                    self.reset();
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => self.scratch.advance(n),
                Err(e) => {
                    self.reset();
                    return Poll::Ready(Err(e));
                }
            }
        }
        Poll::Ready(Ok(self.pending.take().unwrap_or(0)))
    }

    fn reset(&mut self) {
        self.scratch.clear();
        self.pending = None;
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherConn<S> {
    // While a rewritten record is staged, `buf` is the same bytes the caller
    // is retrying with and is not inspected again.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending.is_none() {
            if !this.stage(buf) {
                return Pin::new(&mut this.inner).poll_write(cx, buf);
            }
            this.pending = Some(buf.len());
        }
        this.poll_drain(cx)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Opens TCP connections and wraps each one in a [`CipherConn`].
#[derive(Debug, Clone)]
pub struct Dialer {
    preferences: Arc<Preferences>,
    connect_timeout: Duration,
    keepalive: Duration,
}

impl Dialer {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

    pub fn new(preferences: Arc<Preferences>) -> Self {
        Self {
            preferences,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            keepalive: Self::DEFAULT_KEEPALIVE,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    /// Resolves `host`, connects within the connect timeout, and applies
    /// `TCP_NODELAY` and keep-alive before any byte is written.
    pub async fn connect(&self, host: &str, port: u16) -> Result<CipherConn<TcpStream>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| {
                format!("connect to {}:{} timed out after {:?}", host, port, self.connect_timeout)
            })?
            .with_context(|| format!("connect to {}:{}", host, port))?;

        stream.set_nodelay(true)?;
        SockRef::from(&stream)
            .set_tcp_keepalive(&TcpKeepalive::new().with_time(self.keepalive))?;

        debug!(peer = ?stream.peer_addr().ok(), "connected");
        Ok(self.wrap(stream))
    }

    /// Wraps an already established stream with this dialer's preferences.
    pub fn wrap<S>(&self, stream: S) -> CipherConn<S> {
        CipherConn::new(stream, self.preferences.clone())
    }
}
