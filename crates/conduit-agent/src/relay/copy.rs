use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::stream::is_disconnect;

/// How one copy direction stopped.
#[derive(Debug)]
pub enum DirectionEnd {
    /// The reader finished cleanly and the writer was half-closed.
    Eof,
    /// The reader was reset or the writer stopped accepting bytes.
    PeerClosed,
    /// Any other I/O failure.
    Failed(io::Error),
}

impl DirectionEnd {
    pub const fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

/// Forward bytes from `reader` to `writer` in chunks of at most `chunk_size`
/// until either side stops.
///
/// Every chunk is written fully before the next read, so backpressure from the
/// writer suspends the reader. `counter` is bumped after each chunk lands.
pub async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    counter: &AtomicU64,
) -> DirectionEnd
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                return match writer.shutdown().await {
                    Ok(()) => DirectionEnd::Eof,
                    Err(e) if is_disconnect(&e) => DirectionEnd::PeerClosed,
                    Err(e) => DirectionEnd::Failed(e),
                };
            }
            Ok(n) => n,
            Err(e) if is_disconnect(&e) => {
                debug!(error = %e, "Reader disconnected, half-closing writer");
                if let Err(shutdown) = writer.shutdown().await {
                    debug!(error = %shutdown, "Half-close after disconnect failed");
                }
                return DirectionEnd::PeerClosed;
            }
            Err(e) => return DirectionEnd::Failed(e),
        };

        match writer.write_all(&buf[..n]).await {
            Ok(()) => {
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) if is_disconnect(&e) => return DirectionEnd::PeerClosed,
            Err(e) => return DirectionEnd::Failed(e),
        }
    }
}
