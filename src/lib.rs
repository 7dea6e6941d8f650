//! sshdial - dial application connections through pooled SSH tunnel sessions
//!
//! Dials logical byte-stream connections (a TCP endpoint or unix socket on a
//! remote host) across SSH, sharing one authenticated session between every
//! concurrent dial to the same target. Sessions are reference-counted and
//! closed exactly once when idle, watched by an application-level keep-alive
//! probe with lag-tolerant timeout accounting, and evicted and redialed when
//! the transport breaks.
//!
//! # Address grammar
//!
//! ```text
//! user[:password]@host[:port]/sub-address[?params]
//! ```
//!
//! `(a)` may stand in for `@` when the calling protocol reserves it. The
//! sub-address is an `ip:port` to reach over `direct-tcpip`, or anything
//! else as a unix socket path over `direct-streamlocal`. Recognized params:
//! `keepalive_interval` (default 5s, 0 disables), `keepalive_count_max`
//! (default 3), `keepalive_timeout` (default = interval), `keepalive_lag`
//! (default 5s), `mux` (default true).
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), sshdial::DialError> {
//! let mut conn = sshdial::dial("alice@bastion/10.0.0.5:5432").await?;
//! // conn implements AsyncRead + AsyncWrite
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

mod addr;
mod dial;
mod error;
mod keepalive;
#[cfg(test)]
mod mock;
pub mod mysql;
mod pool;
mod transport;

use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

pub use addr::{Params, SubAddr, SubNet, TunnelAddr, DEFAULT_PORT};
pub use dial::{Dialer, TunnelConn};
pub use error::DialError;
pub use keepalive::KeepAliveConfig;
pub use pool::{PoolKey, PooledTunnel, SessionPool};
pub use transport::known_hosts::{HostKeyVerification, KnownHostsStore};
pub use transport::russh::RusshFactory;
pub use transport::{BoxedStream, ClientFactory, TunnelClient, TunnelStream};

static DEFAULT_DIALER: OnceLock<Dialer> = OnceLock::new();

/// The process-wide dialer behind [`dial`], sharing one session pool.
pub fn default_dialer() -> &'static Dialer {
    DEFAULT_DIALER.get_or_init(Dialer::new)
}

/// Dial `addr` through the process-wide dialer.
pub async fn dial(addr: &str) -> Result<TunnelConn, DialError> {
    default_dialer().dial(addr).await
}

/// Dial `addr` through the process-wide dialer with caller-controlled
/// cancellation.
pub async fn dial_with_cancel(
    addr: &str,
    cancel: CancellationToken,
) -> Result<TunnelConn, DialError> {
    default_dialer().dial_with_cancel(addr, cancel).await
}
