//! Session pool
//!
//! Deduplicates and reference-counts tunnel sessions keyed by target
//! identity. Construction of a given key is single-flight: exactly one
//! caller runs the factory while every other caller suspends on the entry's
//! completion signal, never on the pool lock. The lock covers in-memory
//! bookkeeping only; session construction and the terminal close both happen
//! outside it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use md5::{Digest, Md5};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::DialError;
use crate::keepalive::{self, KeepAliveConfig, Reaper};
use crate::transport::TunnelClient;

/// Identity deciding whether two dial requests may share one session.
///
/// Carries a non-reversible fingerprint of the secret, never the secret
/// itself, and the resolved keep-alive configuration: sessions with
/// different liveness behavior must not be conflated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub username: String,
    pub secret: String,
    pub addr: String,
    pub keep_alive: KeepAliveConfig,
}

impl PoolKey {
    pub fn new(
        username: impl Into<String>,
        password: Option<&str>,
        addr: impl Into<String>,
        keep_alive: KeepAliveConfig,
    ) -> PoolKey {
        PoolKey {
            username: username.into(),
            secret: secret_fingerprint(password),
            addr: addr.into(),
            keep_alive,
        }
    }
}

/// Absent, present-but-empty, and present secrets map to distinct,
/// non-reversible key components.
fn secret_fingerprint(password: Option<&str>) -> String {
    match password {
        None => "-".to_string(),
        Some("") => "*".to_string(),
        Some(password) => {
            let digest = Md5::digest(password.as_bytes());
            let mut out = String::with_capacity(2 + digest.len() * 2);
            out.push_str("-*");
            for byte in digest {
                let _ = write!(out, "{byte:02x}");
            }
            out
        }
    }
}

/// A pooled session: the shared client plus the key it was acquired under.
/// Staleness after eviction is detected by pointer identity against the
/// entry's current value.
pub struct PooledTunnel {
    client: Arc<dyn TunnelClient>,
    key: PoolKey,
    keepalive_started: AtomicBool,
}

impl PooledTunnel {
    fn new(client: Arc<dyn TunnelClient>, key: PoolKey) -> PooledTunnel {
        PooledTunnel {
            client,
            key,
            keepalive_started: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &Arc<dyn TunnelClient> {
        &self.client
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Attach the keep-alive engine to this session. At most one engine ever
    /// runs per session, no matter how many callers acquire it concurrently.
    pub(crate) fn start_keepalive(self: &Arc<Self>, pool: &Arc<SessionPool>) {
        if !self.keepalive_started.swap(true, Ordering::SeqCst) {
            keepalive::spawn(
                self.client.clone(),
                self.key.keep_alive,
                Reaper::Pooled {
                    pool: pool.clone(),
                    tunnel: self.clone(),
                },
            );
        }
    }
}

/// One per live or in-construction key.
///
/// The completion signal is the watch sender held by the builder (through
/// [`BuildGuard`]): dropping it — on success, failure, or builder
/// cancellation — fires exactly once and unblocks every waiter. Entry state
/// is only read by waiters after the signal.
struct PoolEntry {
    done: watch::Receiver<bool>,
    slot: Mutex<EntrySlot>,
}

#[derive(Default)]
struct EntrySlot {
    tunnel: Option<Arc<PooledTunnel>>,
    ref_count: i64,
    removed: bool,
}

pub struct SessionPool {
    // Lock order: `entries` before any entry's `slot`. Held for map and
    // refcount bookkeeping only, never across await.
    entries: Mutex<HashMap<PoolKey, Arc<PoolEntry>>>,
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionPool {
    pub fn new() -> SessionPool {
        SessionPool {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the shared session for `key`.
    ///
    /// If an entry exists its construction is awaited and its refcount
    /// incremented. Otherwise this caller becomes the builder: it publishes
    /// an empty entry, runs `ctor` without the lock, records the outcome and
    /// fires the completion signal. A waiter that finds the entry removed
    /// (construction failed, or the session was evicted in between) retries
    /// from the top; a builder's own construction error is returned as-is —
    /// retrying construction is the orchestrator's decision.
    pub async fn acquire<F, Fut>(
        self: &Arc<Self>,
        key: PoolKey,
        ctor: F,
    ) -> Result<Arc<PooledTunnel>, DialError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Arc<dyn TunnelClient>, DialError>>,
    {
        // Resolved under the lock, then acted on after the guard is released,
        // so no non-Send lock guard is ever held across an await below.
        enum Acquired {
            Existing(Arc<PoolEntry>),
            Builder(Arc<PoolEntry>, watch::Sender<bool>),
        }

        loop {
            let acquired = {
                let mut entries = self.entries.lock();
                match entries.get(&key) {
                    Some(entry) => Acquired::Existing(entry.clone()),
                    None => {
                        let (done_tx, done_rx) = watch::channel(false);
                        let entry = Arc::new(PoolEntry {
                            done: done_rx,
                            slot: Mutex::new(EntrySlot::default()),
                        });
                        entries.insert(key.clone(), entry.clone());
                        // !contains_key above, so this caller is the unique
                        // builder for the entry
                        Acquired::Builder(entry, done_tx)
                    }
                }
            };

            let entry = match acquired {
                Acquired::Builder(entry, done_tx) => {
                    return self.build(key, entry, done_tx, ctor).await;
                }
                Acquired::Existing(entry) => entry,
            };

            {
                let mut done = entry.done.clone();
                // The sender side is dropped exactly once when construction
                // finishes; wait for that.
                while done.changed().await.is_ok() {}

                let mut slot = entry.slot.lock();
                if slot.removed {
                    // Construction failed or the session was already evicted.
                    // A fresh entry for the key may legitimately exist by
                    // now, so start over.
                    continue;
                }
                if let Some(tunnel) = slot.tunnel.clone() {
                    slot.ref_count += 1;
                    return Ok(tunnel);
                }
                continue;
            }
        }
    }

    async fn build<F, Fut>(
        self: &Arc<Self>,
        key: PoolKey,
        entry: Arc<PoolEntry>,
        done_tx: watch::Sender<bool>,
        ctor: F,
    ) -> Result<Arc<PooledTunnel>, DialError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Arc<dyn TunnelClient>, DialError>>,
    {
        // If this future is dropped mid-construction the guard unpublishes
        // the entry and releases the signal, so waiters retry instead of
        // hanging on an orphaned entry.
        let mut guard = BuildGuard {
            pool: self.as_ref(),
            key: &key,
            entry: &entry,
            _done: done_tx,
            armed: true,
        };

        match ctor().await {
            Ok(client) => {
                let tunnel = Arc::new(PooledTunnel::new(client, key.clone()));
                {
                    let mut slot = entry.slot.lock();
                    slot.tunnel = Some(tunnel.clone());
                    slot.ref_count = 1;
                }
                guard.armed = false;
                drop(guard); // fires the completion signal
                debug!(key = %key.addr, "tunnel session constructed");
                Ok(tunnel)
            }
            Err(err) => {
                debug!(key = %key.addr, error = %err, "tunnel session construction failed");
                // Guard drop unpublishes the entry and fires the signal.
                Err(err)
            }
        }
    }

    /// Cooperative decrement. The last user out removes the entry and closes
    /// the session outside the lock. Releasing a stale handle (already
    /// forgotten, possibly replaced under the same key) is a safe no-op.
    pub async fn release(&self, tunnel: &Arc<PooledTunnel>) -> Result<(), DialError> {
        if self.try_release(tunnel, false) {
            debug!(key = %tunnel.key.addr, "last release, closing tunnel session");
            return tunnel.client.close().await;
        }
        Ok(())
    }

    /// Forced eviction of a session known to be broken, regardless of how
    /// many logical connections still reference it. Their operations will
    /// fail and their eventual `release` is a no-op.
    pub async fn forget(&self, tunnel: &Arc<PooledTunnel>) {
        if self.try_release(tunnel, true) {
            debug!(key = %tunnel.key.addr, "tunnel session evicted, closing");
            if let Err(err) = tunnel.client.close().await {
                debug!(key = %tunnel.key.addr, error = %err, "close after eviction failed");
            }
        }
    }

    /// Returns true iff this call removed the entry — the caller then owns
    /// the terminal close. Exactly one release/forget ever wins per entry.
    fn try_release(&self, tunnel: &Arc<PooledTunnel>, force: bool) -> bool {
        let mut entries = self.entries.lock();
        let entry = match entries.get(&tunnel.key) {
            Some(entry) => entry.clone(),
            // Already forgotten, nothing to do.
            None => return false,
        };
        let mut slot = entry.slot.lock();

        let is_current = matches!(&slot.tunnel, Some(current) if Arc::ptr_eq(current, tunnel));
        if !is_current || slot.removed {
            // The slot belongs to a newer session under the same key.
            return false;
        }

        if !force {
            slot.ref_count -= 1;
            if slot.ref_count < 0 {
                warn!(key = %tunnel.key.addr, "tunnel refcount went negative");
            }
            if slot.ref_count > 0 {
                return false;
            }
        }

        slot.removed = true;
        drop(slot);
        entries.remove(&tunnel.key);
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

struct BuildGuard<'a> {
    pool: &'a SessionPool,
    key: &'a PoolKey,
    entry: &'a Arc<PoolEntry>,
    // Dropped with the guard; dropping fires the completion signal.
    _done: watch::Sender<bool>,
    armed: bool,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut entries = self.pool.entries.lock();
        self.entry.slot.lock().removed = true;
        if let Some(current) = entries.get(self.key) {
            if Arc::ptr_eq(current, self.entry) {
                entries.remove(self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockClient;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn key(addr: &str) -> PoolKey {
        PoolKey::new("user", None, addr, KeepAliveConfig::default())
    }

    #[test]
    fn test_secret_fingerprint_states() {
        assert_eq!(secret_fingerprint(None), "-");
        assert_eq!(secret_fingerprint(Some("")), "*");
        let hashed = secret_fingerprint(Some("hunter2"));
        assert!(hashed.starts_with("-*"));
        assert_eq!(hashed.len(), 2 + 32);
        assert!(!hashed.contains("hunter2"));
        assert_eq!(hashed, secret_fingerprint(Some("hunter2")));
        assert_ne!(hashed, secret_fingerprint(Some("hunter3")));
    }

    #[test]
    fn test_pool_key_separates_keepalive() {
        let ka_short = KeepAliveConfig {
            interval: Duration::from_secs(1),
            ..Default::default()
        };
        let a = PoolKey::new("user", None, "host:22", KeepAliveConfig::default());
        let b = PoolKey::new("user", None, "host:22", ka_short);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_acquire_single_flight() {
        let pool = Arc::new(SessionPool::new());
        let built = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let built = built.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire(key("host:22"), || {
                    let built = built.clone();
                    async move {
                        built.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(MockClient::healthy())
                    }
                })
                .await
            }));
        }

        let mut tunnels = Vec::new();
        for task in tasks {
            tunnels.push(task.await.expect("join").expect("acquire"));
        }

        assert_eq!(built.load(Ordering::SeqCst), 1);
        for pair in tunnels.windows(2) {
            assert!(Arc::ptr_eq(pair[0].client(), pair[1].client()));
        }
    }

    #[tokio::test]
    async fn test_builder_failure_returned_waiters_retry() {
        let pool = Arc::new(SessionPool::new());
        let built = Arc::new(AtomicU32::new(0));

        // First construction fails; whoever retries builds a fresh entry.
        let attempt = {
            let built = built.clone();
            move || {
                let built = built.clone();
                async move {
                    if built.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Err(DialError::ConnectionFailed("handshake failed".into()))
                    } else {
                        Ok(MockClient::healthy())
                    }
                }
            }
        };

        let builder = {
            let pool = pool.clone();
            let attempt = attempt.clone();
            tokio::spawn(async move { pool.acquire(key("host:22"), attempt).await })
        };
        // The waiter must find the builder's entry already published.
        while pool.len() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(key("host:22"), attempt).await })
        };

        let builder_result = builder.await.expect("join");
        assert!(matches!(
            builder_result,
            Err(DialError::ConnectionFailed(_))
        ));

        // The waiter saw the removed entry, retried, and built successfully.
        let tunnel = waiter.await.expect("join").expect("acquire");
        assert_eq!(built.load(Ordering::SeqCst), 2);
        pool.release(&tunnel).await.expect("release");
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_release_closes_exactly_once() {
        let pool = Arc::new(SessionPool::new());
        let client = MockClient::new();

        let t1 = pool
            .acquire(key("host:22"), || {
                let client = client.clone();
                async move { Ok(client as Arc<dyn TunnelClient>) }
            })
            .await
            .expect("acquire");
        let t2 = pool
            .acquire(key("host:22"), || async {
                panic!("second acquire must not construct")
            })
            .await
            .expect("acquire");
        assert!(Arc::ptr_eq(&t1, &t2));

        pool.release(&t1).await.expect("release");
        assert_eq!(client.close_calls(), 0);
        pool.release(&t2).await.expect("release");
        assert_eq!(client.close_calls(), 1);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_forget_makes_release_a_noop() {
        let pool = Arc::new(SessionPool::new());
        let client = MockClient::new();

        let tunnel = pool
            .acquire(key("host:22"), || {
                let client = client.clone();
                async move { Ok(client as Arc<dyn TunnelClient>) }
            })
            .await
            .expect("acquire");

        pool.forget(&tunnel).await;
        assert_eq!(client.close_calls(), 1);
        assert_eq!(pool.len(), 0);

        // Stale release: no error, no second close.
        pool.release(&tunnel).await.expect("release");
        assert_eq!(client.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_release_does_not_touch_replacement() {
        let pool = Arc::new(SessionPool::new());
        let old_client = MockClient::new();
        let new_client = MockClient::new();

        let old = pool
            .acquire(key("host:22"), || {
                let client = old_client.clone();
                async move { Ok(client as Arc<dyn TunnelClient>) }
            })
            .await
            .expect("acquire");
        pool.forget(&old).await;

        // Same key, fresh entry.
        let new = pool
            .acquire(key("host:22"), || {
                let client = new_client.clone();
                async move { Ok(client as Arc<dyn TunnelClient>) }
            })
            .await
            .expect("acquire");

        // The stale handle must not decrement the replacement's refcount.
        pool.release(&old).await.expect("stale release");
        assert_eq!(new_client.close_calls(), 0);
        assert_eq!(pool.len(), 1);

        pool.release(&new).await.expect("release");
        assert_eq!(new_client.close_calls(), 1);
        assert_eq!(old_client.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_builder_unblocks_waiters() {
        let pool = Arc::new(SessionPool::new());

        let builder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(key("host:22"), || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(MockClient::healthy())
                })
                .await
            })
        };
        while pool.len() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(key("host:22"), || async { Ok(MockClient::healthy()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Cancel the builder mid-construction; the guard must unpublish the
        // entry and wake the waiter, which then builds its own session.
        builder.abort();
        let tunnel = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must not hang")
            .expect("join")
            .expect("acquire");
        pool.release(&tunnel).await.expect("release");
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_release_closes_every_session_once() {
        let pool = Arc::new(SessionPool::new());
        let clients: Arc<Mutex<Vec<Arc<MockClient>>>> = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for task_id in 0..8u64 {
            let pool = pool.clone();
            let clients = clients.clone();
            tasks.push(tokio::spawn(async move {
                for iteration in 0..50u64 {
                    let addr = format!("host{}:22", (task_id + iteration) % 3);
                    let tunnel = pool
                        .acquire(key(&addr), || {
                            let clients = clients.clone();
                            async move {
                                let client = MockClient::new();
                                clients.lock().push(client.clone());
                                Ok(client as Arc<dyn TunnelClient>)
                            }
                        })
                        .await
                        .expect("acquire");
                    if iteration % 2 == 0 {
                        tokio::task::yield_now().await;
                    }
                    if iteration % 17 == 0 {
                        pool.forget(&tunnel).await;
                        // Stale release afterwards must stay a no-op.
                        pool.release(&tunnel).await.expect("stale release");
                    } else {
                        pool.release(&tunnel).await.expect("release");
                    }
                }
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }

        assert_eq!(pool.len(), 0);
        for client in clients.lock().iter() {
            assert_eq!(client.close_calls(), 1, "every session closed exactly once");
        }
    }
}
