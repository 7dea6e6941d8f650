//! Dial orchestration
//!
//! The public entry point: resolves a target descriptor, acquires a pooled
//! (or dedicated) tunnel session, opens the logical sub-connection, retries
//! once on transport-level failure, and wraps the result in a self-releasing
//! connection handle.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::addr::TunnelAddr;
use crate::error::DialError;
use crate::keepalive::{self, KeepAliveConfig, Reaper};
use crate::pool::{PoolKey, PooledTunnel, SessionPool};
use crate::transport::russh::RusshFactory;
use crate::transport::{BoxedStream, ClientFactory, TunnelClient};

/// Dials logical connections across pooled tunnel sessions.
pub struct Dialer {
    pool: Arc<SessionPool>,
    factory: Arc<dyn ClientFactory>,
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialer {
    /// A dialer backed by the russh transport.
    pub fn new() -> Dialer {
        Self::with_factory(Arc::new(RusshFactory::new()))
    }

    /// A dialer with a custom transport factory.
    pub fn with_factory(factory: Arc<dyn ClientFactory>) -> Dialer {
        Dialer {
            pool: Arc::new(SessionPool::new()),
            factory,
        }
    }

    /// Dial `addr` (see the crate docs for the grammar).
    pub async fn dial(&self, addr: &str) -> Result<TunnelConn, DialError> {
        self.dial_with_cancel(addr, CancellationToken::new()).await
    }

    /// Dial with caller-controlled cancellation. Cancellation releases any
    /// pooled session cleanly — a session that merely saw a cancelled caller
    /// may still be healthy for others — and surfaces
    /// [`DialError::Cancelled`] without retrying.
    pub async fn dial_with_cancel(
        &self,
        addr: &str,
        cancel: CancellationToken,
    ) -> Result<TunnelConn, DialError> {
        let target = TunnelAddr::parse(addr)?;
        self.dial_target(&target, cancel).await
    }

    pub async fn dial_target(
        &self,
        target: &TunnelAddr,
        cancel: CancellationToken,
    ) -> Result<TunnelConn, DialError> {
        target.check_dialable()?;
        let keep_alive = KeepAliveConfig::from_params(&target.params);
        if target.params.mux() {
            self.dial_mux(target, keep_alive, cancel).await
        } else {
            self.dial_dedicated(target, keep_alive, cancel).await
        }
    }

    /// Multiplexed mode: share one session per pool key. A sub-connection
    /// failure invalidates the whole session — every logical connection on
    /// it is doomed anyway — so the session is forgotten and the sequence
    /// retried against a fresh one, twice in total.
    async fn dial_mux(
        &self,
        target: &TunnelAddr,
        keep_alive: KeepAliveConfig,
        cancel: CancellationToken,
    ) -> Result<TunnelConn, DialError> {
        let sub = target.sub.clone().ok_or(DialError::AddrRequired)?;
        let key = PoolKey::new(
            &target.username,
            target.password.as_deref(),
            target.ssh_addr(),
            keep_alive,
        );

        let mut last_err = None;
        for attempt in 0..2 {
            let tunnel = self
                .pool
                .acquire(key.clone(), || {
                    self.factory.connect(target, keep_alive.enabled(), &cancel)
                })
                .await?;

            let opened = tokio::select! {
                result = tunnel.client().open_stream(&sub) => result,
                _ = cancel.cancelled() => Err(DialError::Cancelled),
            };

            match opened {
                Ok(stream) => {
                    if keep_alive.enabled() {
                        tunnel.start_keepalive(&self.pool);
                    }
                    return Ok(TunnelConn::pooled(stream, self.pool.clone(), tunnel));
                }
                Err(DialError::Cancelled) => {
                    if let Err(err) = self.pool.release(&tunnel).await {
                        debug!(error = %err, "release after cancelled dial failed");
                    }
                    return Err(DialError::Cancelled);
                }
                Err(err) => {
                    // The session cannot open channels: treat it as broken
                    // and evict it before trying again.
                    warn!(attempt, error = %err, addr = %target.ssh_addr(), "sub-connection dial failed, evicting session");
                    self.pool.forget(&tunnel).await;
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(DialError::Disconnected))
    }

    /// Dedicated mode: one fresh session per dial, bypassing the pool, for
    /// remotes that cannot multiplex many streams over one transport.
    async fn dial_dedicated(
        &self,
        target: &TunnelAddr,
        keep_alive: KeepAliveConfig,
        cancel: CancellationToken,
    ) -> Result<TunnelConn, DialError> {
        let sub = target.sub.clone().ok_or(DialError::AddrRequired)?;
        let client = self
            .factory
            .connect(target, keep_alive.enabled(), &cancel)
            .await?;

        let opened = tokio::select! {
            result = client.open_stream(&sub) => result,
            _ = cancel.cancelled() => Err(DialError::Cancelled),
        };

        match opened {
            Ok(stream) => {
                if keep_alive.enabled() {
                    keepalive::spawn(client.clone(), keep_alive, Reaper::Dedicated);
                }
                Ok(TunnelConn::dedicated(stream, client))
            }
            Err(err) => {
                if let Err(close_err) = client.close().await {
                    debug!(error = %close_err, "close of dedicated session failed");
                }
                Err(err)
            }
        }
    }
}

/// One logical connection over a tunnel session.
///
/// Reads and writes go to the sub-connection stream. [`TunnelConn::close`]
/// is idempotent and tears down both the stream and the session reference,
/// aggregating errors from both; dropping an unclosed connection releases
/// the session reference in the background.
pub struct TunnelConn {
    stream: BoxedStream,
    guard: Option<ConnGuard>,
}

impl std::fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConn")
            .field("open", &self.guard.is_some())
            .finish()
    }
}

enum ConnGuard {
    Pooled {
        pool: Arc<SessionPool>,
        tunnel: Arc<PooledTunnel>,
    },
    Dedicated {
        client: Arc<dyn TunnelClient>,
    },
}

impl ConnGuard {
    async fn teardown(self) -> Result<(), DialError> {
        match self {
            ConnGuard::Pooled { pool, tunnel } => pool.release(&tunnel).await,
            ConnGuard::Dedicated { client } => client.close().await,
        }
    }
}

impl TunnelConn {
    fn pooled(stream: BoxedStream, pool: Arc<SessionPool>, tunnel: Arc<PooledTunnel>) -> TunnelConn {
        TunnelConn {
            stream,
            guard: Some(ConnGuard::Pooled { pool, tunnel }),
        }
    }

    fn dedicated(stream: BoxedStream, client: Arc<dyn TunnelClient>) -> TunnelConn {
        TunnelConn {
            stream,
            guard: Some(ConnGuard::Dedicated { client }),
        }
    }

    /// Close the sub-connection and release the session reference. Both are
    /// always attempted; their errors are joined rather than one shadowing
    /// the other. Further calls are no-ops.
    pub async fn close(&mut self) -> Result<(), DialError> {
        let mut errs = Vec::new();
        if let Err(err) = self.stream.shutdown().await {
            errs.push(DialError::from(err));
        }
        if let Some(guard) = self.guard.take() {
            if let Err(err) = guard.teardown().await {
                errs.push(err);
            }
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(DialError::many(errs))
        }
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(err) = guard.teardown().await {
                        debug!(error = %err, "release on connection drop failed");
                    }
                });
            }
        }
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
