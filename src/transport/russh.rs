//! russh-backed transport client
//!
//! The authenticated russh [`Handle`] is owned by exactly one task; every
//! user of the session talks to that task over an mpsc command channel. This
//! avoids lock contention on the handle, deadlocks from holding locks across
//! `.await`, and protocol violations from concurrent handle access. A watch
//! channel flipped at task exit is the session's termination signal.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::addr::{SubAddr, SubNet, TunnelAddr};
use crate::error::DialError;

use super::activity::{ActivityFlag, ActivityStream};
use super::auth;
use super::known_hosts::{self, HostKeyVerification};
use super::{BoxedStream, ClientFactory, TunnelClient};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds authenticated russh sessions.
pub struct RusshFactory {
    connect_timeout: Duration,
}

impl RusshFactory {
    pub fn new() -> RusshFactory {
        RusshFactory {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> RusshFactory {
        RusshFactory { connect_timeout }
    }
}

impl Default for RusshFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientFactory for RusshFactory {
    async fn connect(
        &self,
        target: &TunnelAddr,
        keepalive: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn TunnelClient>, DialError> {
        let addr = target.ssh_addr();
        info!(addr = %addr, user = %target.username, "connecting to tunnel endpoint");

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|err| DialError::ConnectionFailed(format!("failed to resolve {}: {}", addr, err)))?
            .next()
            .ok_or_else(|| DialError::ConnectionFailed(format!("no address found for {}", addr)))?;

        // The engine in this crate owns liveness; russh's built-in timers
        // stay off so the two never disagree about a session's health.
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: None,
            ..Default::default()
        });

        // Cancellation drops the in-flight connect future, which closes the
        // partially-established socket.
        let tcp = tokio::select! {
            connected = tokio::time::timeout(self.connect_timeout, TcpStream::connect(socket_addr)) => {
                connected
                    .map_err(|_| DialError::Timeout(format!("connect to {} timed out", addr)))?
                    .map_err(|err| DialError::ConnectionFailed(err.to_string()))?
            }
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
        };

        let activity = ActivityFlag::new(keepalive);
        let stream = ActivityStream::new(tcp, activity.clone());
        let handler = ClientHandler::new(target.host.clone(), resolved_port(target));

        let mut handle = tokio::select! {
            connected = tokio::time::timeout(
                self.connect_timeout,
                client::connect_stream(config, stream, handler),
            ) => {
                connected.map_err(|_| DialError::Timeout(format!("handshake with {} timed out", addr)))??
            }
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
        };

        debug!(addr = %addr, "handshake completed");

        tokio::select! {
            authed = auth::authenticate(&mut handle, target) => authed?,
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
        }

        Ok(Arc::new(RusshClient::spawn(handle, activity)))
    }
}

fn resolved_port(target: &TunnelAddr) -> u16 {
    if target.port == 0 {
        crate::addr::DEFAULT_PORT
    } else {
        target.port
    }
}

/// russh callback handler: host key verification against known_hosts.
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub(crate) fn new(host: String, port: u16) -> ClientHandler {
        ClientHandler { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = DialError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match known_hosts::shared().verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => Ok(true),
            HostKeyVerification::Unknown { fingerprint } => {
                warn!(host = %self.host, port = self.port, fingerprint = %fingerprint, "unknown host key, rejecting");
                Err(DialError::HostKeyVerification(format!(
                    "unknown host {}:{} (fingerprint: {}); add it to known_hosts first",
                    self.host, self.port, fingerprint
                )))
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(DialError::HostKeyVerification(format!(
                "host key for {}:{} has changed (expected {}, got {}); \
                 this could be a man-in-the-middle attack",
                self.host, self.port, expected_fingerprint, actual_fingerprint
            ))),
        }
    }
}

/// Commands handled by the session owner task.
enum OwnerCommand {
    OpenStream {
        sub: SubAddr,
        reply_tx: oneshot::Sender<Result<BoxedStream, DialError>>,
    },
    Probe {
        reply_tx: oneshot::Sender<Result<(), DialError>>,
    },
    Close,
}

/// One authenticated russh session, fronted by its owner task.
pub struct RusshClient {
    cmd_tx: mpsc::Sender<OwnerCommand>,
    closed_rx: watch::Receiver<bool>,
    activity: ActivityFlag,
}

impl RusshClient {
    fn spawn(handle: Handle<ClientHandler>, activity: ActivityFlag) -> RusshClient {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<OwnerCommand>(64);
        let (closed_tx, closed_rx) = watch::channel(false);
        let session_id = uuid::Uuid::new_v4().to_string();

        tokio::spawn(async move {
            let mut handle = handle;
            debug!(session = %session_id, "session owner task started");

            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    OwnerCommand::OpenStream { sub, reply_tx } => {
                        let result = open_channel(&mut handle, &sub).await;
                        let fatal = matches!(&result, Err(err) if err.is_eof());
                        if reply_tx.send(result).is_err() {
                            // Channel drop closes the server-side stream.
                            warn!(session = %session_id, "caller dropped before receiving stream");
                        }
                        if fatal {
                            break;
                        }
                    }
                    OwnerCommand::Probe { reply_tx } => {
                        let result = handle
                            .send_keepalive(true)
                            .await
                            .map_err(DialError::from);
                        let fatal = matches!(&result, Err(err) if err.is_eof());
                        let _ = reply_tx.send(result);
                        if fatal {
                            break;
                        }
                    }
                    OwnerCommand::Close => {
                        debug!(session = %session_id, "close requested");
                        break;
                    }
                }
            }

            drain_pending(&mut cmd_rx);
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
                .await;
            let _ = closed_tx.send(true);
            debug!(session = %session_id, "session owner task terminated");
        });

        RusshClient {
            cmd_tx,
            closed_rx,
            activity,
        }
    }
}

async fn open_channel(
    handle: &mut Handle<ClientHandler>,
    sub: &SubAddr,
) -> Result<BoxedStream, DialError> {
    let channel: Channel<Msg> = match sub.net {
        SubNet::Tcp => {
            let (host, port) = sub.host_port()?;
            handle
                .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
                .await?
        }
        SubNet::Unix => handle.channel_open_direct_streamlocal(&sub.addr).await?,
    };
    Ok(Box::new(channel.into_stream()))
}

/// Refuse everything still queued once the session is going away.
fn drain_pending(cmd_rx: &mut mpsc::Receiver<OwnerCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            OwnerCommand::OpenStream { reply_tx, .. } => {
                let _ = reply_tx.send(Err(DialError::Disconnected));
            }
            OwnerCommand::Probe { reply_tx } => {
                let _ = reply_tx.send(Err(DialError::Disconnected));
            }
            OwnerCommand::Close => {}
        }
    }
}

#[async_trait]
impl TunnelClient for RusshClient {
    async fn open_stream(&self, sub: &SubAddr) -> Result<BoxedStream, DialError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(OwnerCommand::OpenStream {
                sub: sub.clone(),
                reply_tx,
            })
            .await
            .map_err(|_| DialError::Disconnected)?;
        reply_rx.await.map_err(|_| DialError::Disconnected)?
    }

    async fn probe(&self) -> Result<(), DialError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(OwnerCommand::Probe { reply_tx })
            .await
            .map_err(|_| DialError::Disconnected)?;
        reply_rx.await.map_err(|_| DialError::Disconnected)?
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed_rx.clone();
        // Either the flag flips or the owner task is already gone.
        let _ = closed.wait_for(|terminated| *terminated).await;
    }

    async fn close(&self) -> Result<(), DialError> {
        // Already-closed sessions have no receiver; that is fine.
        let _ = self.cmd_tx.send(OwnerCommand::Close).await;
        Ok(())
    }

    fn take_activity(&self) -> bool {
        self.activity.take()
    }
}
