//! Transport client contract
//!
//! One [`TunnelClient`] is one authenticated tunnel session. Everything above
//! this seam (pool, keep-alive engine, dial orchestration) is written against
//! the trait; the russh-backed implementation lives in [`russh`], and tests
//! substitute their own.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::addr::{SubAddr, TunnelAddr};
use crate::error::DialError;

pub(crate) mod activity;
mod auth;
pub mod known_hosts;
pub mod russh;

/// A bidirectional byte stream opened inside a tunnel session.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// One authenticated tunnel session, shared read/write by every logical
/// connection multiplexed over it. Only the pool's terminal release/forget
/// path may call [`TunnelClient::close`].
#[async_trait]
pub trait TunnelClient: Send + Sync + 'static {
    /// Open a logical sub-connection to `sub` over this session.
    async fn open_stream(&self, sub: &SubAddr) -> Result<BoxedStream, DialError>;

    /// Send one out-of-band liveness probe and await the acknowledgement.
    /// An [`DialError::is_eof`] error means the session is half-closed.
    async fn probe(&self) -> Result<(), DialError>;

    /// Resolves once the session has terminated, however that happened.
    async fn wait_closed(&self);

    /// Close the session. Idempotent.
    async fn close(&self) -> Result<(), DialError>;

    /// Non-blocking: true if application traffic was read on the session
    /// since the last call. Consumes the signal.
    fn take_activity(&self) -> bool;
}

/// Builds authenticated [`TunnelClient`]s. The dial orchestrator owns retry
/// policy; a factory reports each attempt's outcome exactly once.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// Establish a new authenticated session to the descriptor's host.
    /// `keepalive` enables read-activity instrumentation for the liveness
    /// engine. Cancellation closes any partially-established resource.
    async fn connect(
        &self,
        target: &TunnelAddr,
        keepalive: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn TunnelClient>, DialError>;
}
