//! Read-activity instrumentation for the raw transport stream
//!
//! The keep-alive engine treats any application traffic read on the session
//! as implicit liveness, so the TCP stream under the SSH session is wrapped
//! to flag successful reads. The flag is only allocated when keep-alive is
//! enabled for the session.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Shared "traffic was read" signal. Cloned between the instrumented stream
/// (producer) and the tunnel client (consumer).
#[derive(Clone)]
pub(crate) struct ActivityFlag(Option<Arc<AtomicBool>>);

impl ActivityFlag {
    pub fn new(enabled: bool) -> ActivityFlag {
        ActivityFlag(enabled.then(|| Arc::new(AtomicBool::new(false))))
    }

    pub fn record(&self) {
        if let Some(flag) = &self.0 {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Consume the signal: true if any read happened since the last call.
    pub fn take(&self) -> bool {
        self.0
            .as_ref()
            .map(|flag| flag.swap(false, Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// AsyncRead/AsyncWrite adapter that records successful non-empty reads.
pub(crate) struct ActivityStream<S> {
    inner: S,
    activity: ActivityFlag,
}

impl<S> ActivityStream<S> {
    pub fn new(inner: S, activity: ActivityFlag) -> ActivityStream<S> {
        ActivityStream { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() > before {
                self.activity.record();
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
