//! Keep-alive liveness engine
//!
//! Detects a tunnel session that has gone silent without relying on
//! TCP-level failure, which may take arbitrarily long to surface. One
//! background loop per session, started at most once through the pooled
//! handle's latch, running until the session terminates or the engine
//! declares it dead.
//!
//! Timeouts are judged against a monotonic clock: a probe timeout whose
//! measured wait ran far past the configured timeout was a scheduling pause
//! (debugger, suspended laptop), not a dead peer, and is discarded instead
//! of counted as a miss.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::addr::Params;
use crate::error::DialError;
use crate::pool::{PooledTunnel, SessionPool};
use crate::transport::TunnelClient;

const PARAM_INTERVAL: &str = "keepalive_interval";
const PARAM_COUNT_MAX: &str = "keepalive_count_max";
const PARAM_TIMEOUT: &str = "keepalive_timeout";
const PARAM_LAG: &str = "keepalive_lag";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_COUNT_MAX: u32 = 3;
const DEFAULT_LAG: Duration = Duration::from_secs(5);

/// Liveness tuning, resolved from the dial address params. Part of the pool
/// key: sessions with different liveness behavior are never conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeepAliveConfig {
    /// Probe interval. Zero disables the engine.
    pub interval: Duration,
    /// Maximum tolerated consecutive misses; the session is declared dead
    /// when misses exceed this.
    pub count_max: u32,
    /// Per-probe response timeout.
    pub timeout: Duration,
    /// Measured waits of timeout + lag or more are scheduling artifacts.
    pub lag: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            interval: DEFAULT_INTERVAL,
            count_max: DEFAULT_COUNT_MAX,
            timeout: DEFAULT_INTERVAL,
            lag: DEFAULT_LAG,
        }
    }
}

impl KeepAliveConfig {
    /// Resolve from params. Each setting is independently optional; an
    /// unparseable value logs a warning and keeps the default, and the probe
    /// timeout defaults to the interval unless set explicitly.
    pub fn from_params(params: &Params) -> KeepAliveConfig {
        let mut config = KeepAliveConfig::default();
        if let Some(value) = params.single(PARAM_INTERVAL) {
            match parse_duration(value) {
                Some(interval) => config.interval = interval,
                None => warn!(value, "invalid {}, ignoring", PARAM_INTERVAL),
            }
        }
        config.timeout = config.interval;
        if let Some(value) = params.single(PARAM_TIMEOUT) {
            match parse_duration(value) {
                Some(timeout) => config.timeout = timeout,
                None => warn!(value, "invalid {}, ignoring", PARAM_TIMEOUT),
            }
        }
        if let Some(value) = params.single(PARAM_LAG) {
            match parse_duration(value) {
                Some(lag) => config.lag = lag,
                None => warn!(value, "invalid {}, ignoring", PARAM_LAG),
            }
        }
        if let Some(value) = params.single(PARAM_COUNT_MAX) {
            match value.parse() {
                Ok(count_max) => config.count_max = count_max,
                Err(_) => warn!(value, "invalid {}, ignoring", PARAM_COUNT_MAX),
            }
        }
        config
    }

    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Durations as `500ms` / `5s` / `2m`; a bare integer is seconds.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "" | "s" => Some(Duration::from_secs(amount)),
        "ms" => Some(Duration::from_millis(amount)),
        "m" => Some(Duration::from_secs(amount * 60)),
        _ => None,
    }
}

/// What to do with the session once the engine declares it dead.
pub(crate) enum Reaper {
    /// Evict from the pool (which owns the terminal close) so no future
    /// acquire returns the dead session.
    Pooled {
        pool: Arc<SessionPool>,
        tunnel: Arc<PooledTunnel>,
    },
    /// Dedicated session: just close it.
    Dedicated,
}

impl Reaper {
    async fn reap(self, client: &Arc<dyn TunnelClient>) {
        match self {
            Reaper::Pooled { pool, tunnel } => pool.forget(&tunnel).await,
            Reaper::Dedicated => {
                if let Err(err) = client.close().await {
                    debug!(error = %err, "close of dead dedicated session failed");
                }
            }
        }
    }
}

pub(crate) fn spawn(client: Arc<dyn TunnelClient>, config: KeepAliveConfig, reaper: Reaper) {
    if !config.enabled() {
        return;
    }
    tokio::spawn(run(client, config, reaper));
}

enum Tick {
    Alive,
    Dead,
}

async fn run(client: Arc<dyn TunnelClient>, config: KeepAliveConfig, reaper: Reaper) {
    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut misses: u32 = 0;
    // At most one probe is ever in flight; a probe that outlives its timeout
    // stays here and its result is consumed on a later tick instead of
    // racing a second probe.
    let mut pending: Option<oneshot::Receiver<Result<(), DialError>>> = None;

    loop {
        tokio::select! {
            _ = client.wait_closed() => {
                debug!("session terminated, stopping keep-alive");
                reaper.reap(&client).await;
                return;
            }
            _ = ticker.tick() => {
                match tick(&client, &config, &mut misses, &mut pending).await {
                    Tick::Alive => {}
                    Tick::Dead => {
                        debug!(misses, "session declared dead by keep-alive");
                        reaper.reap(&client).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn tick(
    client: &Arc<dyn TunnelClient>,
    config: &KeepAliveConfig,
    misses: &mut u32,
    pending: &mut Option<oneshot::Receiver<Result<(), DialError>>>,
) -> Tick {
    if client.take_activity() {
        // Traffic was read since the last tick: implicit liveness. Skip the
        // probe; a pending one stays for the next tick.
        *misses = 0;
        return Tick::Alive;
    }

    let mut rx = match pending.take() {
        Some(rx) => rx,
        None => {
            let (tx, rx) = oneshot::channel();
            let probing = client.clone();
            tokio::spawn(async move {
                let _ = tx.send(probing.probe().await);
            });
            rx
        }
    };

    let wait_started = Instant::now();
    tokio::select! {
        result = &mut rx => {
            match result {
                Ok(Ok(())) => {
                    *misses = 0;
                }
                Ok(Err(err)) if err.is_eof() => {
                    // Half-closed transport: dead immediately, no miss
                    // accounting.
                    debug!(error = %err, "keep-alive probe hit end of stream");
                    return Tick::Dead;
                }
                Ok(Err(err)) => {
                    debug!(error = %err, "keep-alive probe failed");
                    *misses += 1;
                    if *misses > config.count_max {
                        return Tick::Dead;
                    }
                }
                Err(_) => {
                    // Prober vanished without reporting; count it as a miss.
                    *misses += 1;
                    if *misses > config.count_max {
                        return Tick::Dead;
                    }
                }
            }
        }
        _ = client.wait_closed() => {
            return Tick::Dead;
        }
        _ = tokio::time::sleep(config.timeout) => {
            let elapsed = wait_started.elapsed();
            // Wait again for the same probe at the next tick.
            *pending = Some(rx);
            if timeout_is_miss(elapsed, config) {
                *misses += 1;
                if *misses > config.count_max {
                    return Tick::Dead;
                }
            } else {
                debug!(?elapsed, "probe timeout discarded as scheduling lag");
            }
        }
    }
    Tick::Alive
}

/// A timed-out wait counts as a miss only when the wait ran roughly on
/// schedule; a wait that overshot into the grace lag was a scheduling pause
/// (debugger, suspended machine), not a silent peer.
fn timeout_is_miss(elapsed: std::time::Duration, config: &KeepAliveConfig) -> bool {
    elapsed < config.timeout + config.lag
}
