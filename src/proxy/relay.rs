//! One direction of a proxied connection: a cancellable byte copy with a
//! shared deadline. Two relays back to back form the tunnel.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::BUFFER_SIZE;

/// I/O budget for one proxied connection.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// Absolute cutoff armed at accept time; idle tunnels die when it passes.
    Fixed(Instant),
    /// Rolling budget renewed by every bounded operation.
    Idle(std::time::Duration),
}

impl Deadline {
    /// Run `fut` under this deadline.
    pub async fn bound<F: std::future::Future>(
        &self,
        fut: F,
    ) -> Result<F::Output, tokio::time::error::Elapsed> {
        match self {
            Deadline::Fixed(at) => timeout_at(*at, fut).await,
            Deadline::Idle(budget) => timeout(*budget, fut).await,
        }
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection deadline exceeded")
}

/// Copy bytes from `src` to `dst` until EOF, an error on either side, the
/// deadline, or cancellation. On any exit the shared token is cancelled so
/// the peer relay stops too, and `dst` is shut down for writes so its reader
/// observes end-of-stream. Returns the number of bytes copied.
pub async fn relay<R, W>(
    mut src: R,
    mut dst: W,
    cancel: CancellationToken,
    deadline: Deadline,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUFFER_SIZE];
    let mut copied = 0u64;
    let result = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break Ok(copied),
            read = deadline.bound(src.read(&mut buf)) => read,
        };
        let n = match read {
            Ok(Ok(0)) => break Ok(copied),
            Ok(Ok(n)) => n,
            Ok(Err(err)) => break Err(err),
            Err(_) => break Err(deadline_exceeded()),
        };
        match deadline.bound(dst.write_all(&buf[..n])).await {
            Ok(Ok(())) => copied += n as u64,
            Ok(Err(err)) => break Err(err),
            Err(_) => break Err(deadline_exceeded()),
        }
    };
    cancel.cancel();
    let _ = dst.shutdown().await;
    result
}
