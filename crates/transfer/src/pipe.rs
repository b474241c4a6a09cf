//! Bounded in-memory byte pipe between two pipeline stages.
//!
//! The writer must call `shutdown()` for the reader to see a clean end of
//! stream. A writer dropped without shutdown, or a dropped reader, breaks
//! the pipe for the other side. Both ends fail promptly once the pipeline's
//! cancellation token fires.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};

/// Largest frame sent through the channel in one write.
const MAX_FRAME: usize = 256 * 1024;

/// Frames buffered by the pipes joining pipeline stages.
pub const DEFAULT_CAPACITY: usize = 16;

/// Why a pipe operation failed, carried inside an [`io::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Broken,
    Cancelled,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Broken => f.write_str("pipe closed by peer"),
            Signal::Cancelled => f.write_str("pipe cancelled"),
        }
    }
}

impl std::error::Error for Signal {}

fn signal_error(signal: Signal) -> io::Error {
    // not Interrupted: std's write_all and io::copy retry that kind forever
    let kind = match signal {
        Signal::Broken => io::ErrorKind::BrokenPipe,
        Signal::Cancelled => io::ErrorKind::Other,
    };
    io::Error::new(kind, signal)
}

/// Finds a pipe [`Signal`] in `err` or anything it wraps.
pub(crate) fn signal_of(err: &io::Error) -> Option<Signal> {
    let mut current: Option<&(dyn std::error::Error + 'static)> =
        err.get_ref().map(|e| e as &(dyn std::error::Error + 'static));
    while let Some(e) = current {
        if let Some(signal) = e.downcast_ref::<Signal>() {
            return Some(*signal);
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if let Some(signal) = signal_of(io_err) {
                return Some(signal);
            }
        }
        current = e.source();
    }
    None
}

struct Cancel {
    token: CancellationToken,
    fut: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Cancel {
    fn new(token: &CancellationToken) -> Self {
        Self {
            token: token.clone(),
            fut: Box::pin(token.clone().cancelled_owned()),
        }
    }

    /// Ready once cancelled; otherwise registers the waker.
    fn poll(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.fut.as_mut().poll(cx).is_ready()
    }
}

/// Creates a pipe holding at most `capacity` frames.
pub fn pipe(capacity: usize, cancel: &CancellationToken) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let finished = Arc::new(AtomicBool::new(false));
    (
        PipeWriter {
            tx: PollSender::new(tx),
            finished: finished.clone(),
            cancel: Cancel::new(cancel),
        },
        PipeReader {
            rx,
            current: Bytes::new(),
            finished,
            eof: false,
            cancel: Cancel::new(cancel),
        },
    )
}

/// Write half of a [`pipe`].
pub struct PipeWriter {
    tx: PollSender<Bytes>,
    finished: Arc<AtomicBool>,
    cancel: Cancel,
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.cancel.poll(cx) {
            return Poll::Ready(Err(signal_error(Signal::Cancelled)));
        }
        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(signal_error(Signal::Broken)));
        }
        let n = buf.len().min(MAX_FRAME);
        if this.tx.send_item(Bytes::copy_from_slice(&buf[..n])).is_err() {
            return Poll::Ready(Err(signal_error(Signal::Broken)));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.finished.store(true, Ordering::Release);
        this.tx.close();
        Poll::Ready(Ok(()))
    }
}

/// Read half of a [`pipe`].
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    finished: Arc<AtomicBool>,
    eof: bool,
    cancel: Cancel,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current[..n]);
                this.current.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            if this.cancel.poll(cx) {
                return Poll::Ready(Err(signal_error(Signal::Cancelled)));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(frame) => this.current = frame,
                None if this.finished.load(Ordering::Acquire) => {
                    this.eof = true;
                }
                None => return Poll::Ready(Err(signal_error(Signal::Broken))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransferError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn clean_shutdown_is_eof() {
        let cancel = CancellationToken::new();
        let (mut w, mut r) = pipe(2, &cancel);

        let writer = tokio::spawn(async move {
            for i in 0..10u8 {
                w.write_all(&[i; 1000]).await.unwrap();
            }
            w.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();

        assert_eq!(out.len(), 10_000);
        assert!(out[..1000].iter().all(|&b| b == 0));
        assert!(out[9000..].iter().all(|&b| b == 9));
    }

    #[tokio::test]
    async fn dropped_writer_breaks_reader() {
        let cancel = CancellationToken::new();
        let (mut w, mut r) = pipe(4, &cancel);
        w.write_all(b"partial").await.unwrap();
        drop(w);

        let mut buf = [0u8; 64];
        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"partial");
        let err = r.read(&mut buf).await.unwrap_err();
        assert_eq!(signal_of(&err), Some(Signal::Broken));
        assert!(matches!(TransferError::from(err), TransferError::Pipe(_)));
    }

    #[tokio::test]
    async fn dropped_reader_breaks_writer() {
        let cancel = CancellationToken::new();
        let (mut w, r) = pipe(1, &cancel);
        drop(r);
        let err = w.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn cancel_wakes_blocked_writer() {
        let cancel = CancellationToken::new();
        let (mut w, _r) = pipe(1, &cancel);
        w.write_all(b"fills the only slot").await.unwrap();

        let c = cancel.clone();
        let blocked = tokio::spawn(async move { w.write_all(b"blocks").await });
        tokio::task::yield_now().await;
        c.cancel();

        let err = blocked.await.unwrap().unwrap_err();
        assert!(matches!(TransferError::from(err), TransferError::Cancelled));
    }

    #[tokio::test]
    async fn cancel_wakes_blocked_reader() {
        let cancel = CancellationToken::new();
        let (_w, mut r) = pipe(1, &cancel);

        let c = cancel.clone();
        let blocked = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            r.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        c.cancel();

        let err = blocked.await.unwrap().unwrap_err();
        assert_eq!(signal_of(&err), Some(Signal::Cancelled));
    }

    #[test]
    fn signal_found_through_wrapping() {
        let inner = signal_error(Signal::Broken);
        let wrapped = io::Error::other(inner);
        assert_eq!(signal_of(&wrapped), Some(Signal::Broken));
        assert_eq!(signal_of(&io::Error::other("plain")), None);
    }
}
