//! Byte streams relayed by the agent.
//!
//! Both sides of a relay are [`LogicalStream`]s: the inbound [`Connection`]
//! delivered through a tunnel and the [`BackendStream`] opened towards the
//! local service. The relay only ever sees `AsyncRead + AsyncWrite`, never the
//! concrete transport.
//!
//! A write against a side whose write direction is closed fails with
//! [`io::ErrorKind::BrokenPipe`], and a zero-byte write of a non-empty buffer
//! is surfaced as [`io::ErrorKind::WriteZero`], so "nothing written" is never
//! confused with "peer closed".

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

/// A bidirectional byte channel with read-close and write-close signaling.
pub trait LogicalStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> LogicalStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream as handed over by a rendezvous implementation.
pub type BoxedStream = Box<dyn LogicalStream>;

/// Lifecycle of one stream's two directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Open,
    /// The peer finished sending; reads return EOF.
    HalfClosedRead,
    /// We finished sending; writes are rejected.
    HalfClosedWrite,
    Closed,
}

impl StreamState {
    const fn after_read_eof(self) -> Self {
        match self {
            Self::Open => Self::HalfClosedRead,
            Self::HalfClosedWrite | Self::Closed => Self::Closed,
            Self::HalfClosedRead => Self::HalfClosedRead,
        }
    }

    const fn after_write_shutdown(self) -> Self {
        match self {
            Self::Open => Self::HalfClosedWrite,
            Self::HalfClosedRead | Self::Closed => Self::Closed,
            Self::HalfClosedWrite => Self::HalfClosedWrite,
        }
    }

    const fn can_write(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedRead)
    }
}

/// Gauge of streams that are currently open.
///
/// Each stream takes one slot when created and gives it back exactly once,
/// on the first [`close`](Connection::close) or on drop.
#[derive(Debug, Clone, Default)]
pub struct OpenStreams(Arc<AtomicUsize>);

impl OpenStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of streams currently holding a slot.
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn acquire(&self) -> StreamSlot {
        self.0.fetch_add(1, Ordering::AcqRel);
        StreamSlot(Some(Arc::clone(&self.0)))
    }
}

struct StreamSlot(Option<Arc<AtomicUsize>>);

impl StreamSlot {
    fn release(&mut self) {
        if let Some(counter) = self.0.take() {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Stream wrapper shared by both relay sides: tracks half-close state and the
/// open-stream gauge slot.
struct TrackedStream {
    inner: BoxedStream,
    state: StreamState,
    slot: StreamSlot,
}

impl TrackedStream {
    fn new(inner: BoxedStream, open: &OpenStreams) -> Self {
        Self {
            inner,
            state: StreamState::Open,
            slot: open.acquire(),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        let result = if self.state.can_write() {
            match self.inner.shutdown().await {
                // The peer may already be gone; the stream is closed either way.
                Err(e) if is_disconnect(&e) => Ok(()),
                other => other,
            }
        } else {
            Ok(())
        };
        self.state = StreamState::Closed;
        self.slot.release();
        result
    }

    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if matches!(self.state, StreamState::HalfClosedRead | StreamState::Closed) {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        if buf.filled().len() == before && buf.remaining() > 0 {
            self.state = self.state.after_read_eof();
        }
        Poll::Ready(Ok(()))
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if !self.state.can_write() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let written = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        if written == 0 && !buf.is_empty() {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        Poll::Ready(Ok(written))
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.state.can_write() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.state.can_write() {
            return Poll::Ready(Ok(()));
        }
        ready!(Pin::new(&mut self.inner).poll_shutdown(cx))?;
        self.state = self.state.after_write_shutdown();
        Poll::Ready(Ok(()))
    }
}

/// Errors that mean the other end of a stream is gone rather than that
/// something went wrong locally.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

macro_rules! delegate_io {
    ($ty:ty) => {
        impl AsyncRead for $ty {
            fn poll_read(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                self.get_mut().stream.poll_read(cx, buf)
            }
        }

        impl AsyncWrite for $ty {
            fn poll_write(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                self.get_mut().stream.poll_write(cx, buf)
            }

            fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                self.get_mut().stream.poll_flush(cx)
            }

            fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                self.get_mut().stream.poll_shutdown(cx)
            }
        }
    };
}

/// One inbound logical connection delivered through a tunnel.
pub struct Connection {
    id: Uuid,
    tunnel_id: String,
    peer_addr: String,
    stream: TrackedStream,
}

impl Connection {
    pub fn new(
        tunnel_id: impl Into<String>,
        peer_addr: impl Into<String>,
        stream: BoxedStream,
        open: &OpenStreams,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tunnel_id: tunnel_id.into(),
            peer_addr: peer_addr.into(),
            stream: TrackedStream::new(stream, open),
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Remote client address as reported by the rendezvous service.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub const fn state(&self) -> StreamState {
        self.stream.state
    }

    /// Close both directions. Closing an already closed connection is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        self.stream.close().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("tunnel_id", &self.tunnel_id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.stream.state)
            .finish_non_exhaustive()
    }
}

delegate_io!(Connection);

/// Connection to the local backend, paired with exactly one [`Connection`].
pub struct BackendStream {
    addr: String,
    stream: TrackedStream,
}

impl BackendStream {
    pub fn new(addr: impl Into<String>, stream: BoxedStream, open: &OpenStreams) -> Self {
        Self {
            addr: addr.into(),
            stream: TrackedStream::new(stream, open),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_open(&self) -> bool {
        self.stream.state != StreamState::Closed
    }

    pub const fn state(&self) -> StreamState {
        self.stream.state
    }

    /// Close the backend socket. Idempotent.
    pub async fn close(&mut self) -> io::Result<()> {
        self.stream.close().await
    }
}

impl std::fmt::Debug for BackendStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendStream")
            .field("addr", &self.addr)
            .field("state", &self.stream.state)
            .finish_non_exhaustive()
    }
}

delegate_io!(BackendStream);
