//! Scriptable in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::addr::{SubAddr, TunnelAddr};
use crate::error::DialError;
use crate::transport::{BoxedStream, ClientFactory, TunnelClient};

/// How a mock session answers liveness probes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ProbeBehavior {
    /// Acknowledge immediately.
    Ack,
    /// Acknowledge after a delay (possibly past the probe timeout).
    AckAfter(Duration),
    /// Never answer.
    Stall,
    /// Fail with an end-of-stream error.
    Eof,
    /// Fail with a non-EOF error.
    Fail,
}

pub(crate) struct MockClient {
    probe: ProbeBehavior,
    fail_opens: AtomicBool,
    open_stall: AtomicBool,
    always_active: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicU32,
    open_calls: AtomicU32,
    probe_calls: AtomicU32,
    terminated_tx: watch::Sender<bool>,
    // Keeps the far side of handed-out duplex streams alive.
    peers: Mutex<Vec<tokio::io::DuplexStream>>,
}

impl MockClient {
    pub fn new() -> Arc<MockClient> {
        Self::with_probe(ProbeBehavior::Ack)
    }

    pub fn with_probe(probe: ProbeBehavior) -> Arc<MockClient> {
        let (terminated_tx, _) = watch::channel(false);
        Arc::new(MockClient {
            probe,
            fail_opens: AtomicBool::new(false),
            open_stall: AtomicBool::new(false),
            always_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_calls: AtomicU32::new(0),
            open_calls: AtomicU32::new(0),
            probe_calls: AtomicU32::new(0),
            terminated_tx,
            peers: Mutex::new(Vec::new()),
        })
    }

    /// A fresh always-healthy session, pre-erased to the trait object.
    pub fn healthy() -> Arc<dyn TunnelClient> {
        Self::new()
    }

    pub fn set_fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent open block until the caller gives up.
    pub fn set_open_stall(&self, stall: bool) {
        self.open_stall.store(stall, Ordering::SeqCst);
    }

    pub fn set_always_active(&self, active: bool) {
        self.always_active.store(active, Ordering::SeqCst);
    }

    /// Simulate the session terminating out from under its users.
    pub fn terminate(&self) {
        let _ = self.terminated_tx.send(true);
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> u32 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelClient for MockClient {
    async fn open_stream(&self, _sub: &SubAddr) -> Result<BoxedStream, DialError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(DialError::Disconnected);
        }
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(DialError::ChannelError("mock open failure".into()));
        }
        if self.open_stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (near, far) = tokio::io::duplex(1024);
        self.peers.lock().push(far);
        Ok(Box::new(near))
    }

    async fn probe(&self) -> Result<(), DialError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(DialError::Disconnected);
        }
        match self.probe {
            ProbeBehavior::Ack => Ok(()),
            ProbeBehavior::AckAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            ProbeBehavior::Stall => {
                std::future::pending::<()>().await;
                Ok(())
            }
            ProbeBehavior::Eof => Err(DialError::Disconnected),
            ProbeBehavior::Fail => Err(DialError::Protocol("mock probe failure".into())),
        }
    }

    async fn wait_closed(&self) {
        let mut rx = self.terminated_tx.subscribe();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }

    async fn close(&self) -> Result<(), DialError> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.terminated_tx.send(true);
        Ok(())
    }

    fn take_activity(&self) -> bool {
        self.always_active.load(Ordering::SeqCst)
    }
}

/// Factory producing scripted [`MockClient`]s, one plan per construction.
pub(crate) struct MockFactory {
    plans: Mutex<VecDeque<MockPlan>>,
    built: Mutex<Vec<Arc<MockClient>>>,
    connect_calls: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MockPlan {
    /// Construction itself fails.
    pub connect_fails: bool,
    /// The constructed session fails every sub-connection open.
    pub fail_opens: bool,
    /// Construction blocks until cancelled.
    pub connect_stalls: bool,
}

impl MockFactory {
    /// Every construction succeeds with a healthy session.
    pub fn healthy() -> Arc<MockFactory> {
        Arc::new(MockFactory {
            plans: Mutex::new(VecDeque::new()),
            built: Mutex::new(Vec::new()),
            connect_calls: AtomicU32::new(0),
        })
    }

    /// Scripted constructions, consumed in order; once exhausted every
    /// further construction succeeds with a healthy session.
    pub fn scripted(plans: impl IntoIterator<Item = MockPlan>) -> Arc<MockFactory> {
        let factory = Self::healthy();
        factory.plans.lock().extend(plans);
        factory
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Every session this factory has constructed, in order.
    pub fn built(&self) -> Vec<Arc<MockClient>> {
        self.built.lock().clone()
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn connect(
        &self,
        _target: &TunnelAddr,
        _keepalive: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn TunnelClient>, DialError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let plan = self.plans.lock().pop_front().unwrap_or_default();
        if plan.connect_stalls {
            cancel.cancelled().await;
            return Err(DialError::Cancelled);
        }
        if plan.connect_fails {
            return Err(DialError::AuthenticationFailed("mock handshake".into()));
        }
        let client = MockClient::new();
        client.set_fail_opens(plan.fail_opens);
        self.built.lock().push(client.clone());
        Ok(client)
    }
}
