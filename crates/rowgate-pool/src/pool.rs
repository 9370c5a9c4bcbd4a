//! Per-user connection pool.
//!
//! # Architecture
//!
//! ```text
//! checkout()
//!   → idle connection available → validate → hand out (invalid ones destroyed)
//!   → below maximum_size        → create through the ConnectionFactory
//!   → at maximum_size           → wait ≤ maximum_retry_wait for a check-in, retry
//!                                 until checkout_timeout, then PoolError::Exhausted
//!
//! checkin(conn)
//!   → transaction open → handed back to the caller
//!   → pool open, enabled and conn valid → back to idle
//!   → otherwise → destroyed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use rowgate_core::{ConnectionFactory, EntityConnection, User, epoch_millis};
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;

use crate::error::{PoolError, PoolResult};
use crate::settings::PoolSettings;
use crate::statistics::{PoolSample, PoolStatistics};

/// Ring size of the fine-grained sample buffer.
const FINE_GRAINED_CAPACITY: usize = 1000;

/// A backend connection checked out of a pool.
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    username: String,
    created_at: Instant,
    last_used: Instant,
    /// How many waits the checkout that produced this connection needed.
    retries: u32,
    connection: Box<dyn EntityConnection>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl Deref for PooledConnection {
    type Target = dyn EntityConnection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    created: u64,
    destroyed: u64,
    requests: u64,
    delayed: u64,
    failed: u64,
}

/// Counter values at the previous `statistics` call.
#[derive(Debug)]
struct Window {
    at: Instant,
    counters: Counters,
}

#[derive(Debug)]
struct PoolState {
    settings: PoolSettings,
    /// Oldest check-in at the front.
    idle: VecDeque<PooledConnection>,
    in_use: usize,
    /// Connections being created; they count toward the size.
    pending: usize,
    counters: Counters,
    window: Window,
    checkout_times: Vec<Duration>,
    samples: VecDeque<PoolSample>,
    reset_date: u64,
}

impl PoolState {
    fn size(&self) -> usize {
        self.idle.len() + self.in_use + self.pending
    }

    fn record_checkout(&mut self, elapsed: Duration) {
        self.checkout_times.push(elapsed);
        if self.settings.collect_fine_grained {
            if self.samples.len() >= FINE_GRAINED_CAPACITY {
                self.samples.pop_front();
            }
            self.samples.push_back(PoolSample {
                timestamp: epoch_millis(),
                size: self.size(),
                in_use: self.in_use,
            });
        }
    }
}

/// What a checkout attempt decided while holding the state lock.
enum Step {
    Reuse(PooledConnection),
    Create,
    Wait(Duration),
    Exhausted,
}

/// Result of one cleanup pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Maintenance {
    pub closed: usize,
    pub opened: usize,
}

/// Bounded pool of backend connections for one database user.
pub struct ConnectionPool {
    user: User,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    /// Signalled whenever a connection is returned or a slot frees up.
    returned: Notify,
    enabled: AtomicBool,
    closed: AtomicBool,
    next_id: AtomicU64,
    creation_date: u64,
}

impl ConnectionPool {
    /// Create a pool and warm it up to `minimum_size` connections.
    pub async fn open(
        user: User,
        settings: PoolSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> PoolResult<Self> {
        settings.validate()?;
        let now = epoch_millis();
        let pool = Self {
            user,
            factory,
            state: Mutex::new(PoolState {
                settings,
                idle: VecDeque::new(),
                in_use: 0,
                pending: 0,
                counters: Counters::default(),
                window: Window {
                    at: Instant::now(),
                    counters: Counters::default(),
                },
                checkout_times: Vec::new(),
                samples: VecDeque::new(),
                reset_date: now,
            }),
            returned: Notify::new(),
            enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            creation_date: now,
        };

        if let Err(e) = pool.warm_up().await {
            pool.close().await;
            return Err(e);
        }

        let settings = pool.settings().await;
        tracing::info!(
            user = %pool.user.username,
            minimum_size = settings.minimum_size,
            maximum_size = settings.maximum_size,
            "connection pool created"
        );
        Ok(pool)
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn warm_up(&self) -> PoolResult<()> {
        let target = self.state.lock().await.settings.minimum_size;
        for _ in 0..target {
            let conn = self.create().await?;
            let mut state = self.state.lock().await;
            state.counters.created += 1;
            state.idle.push_back(conn);
        }
        Ok(())
    }

    async fn create(&self) -> PoolResult<PooledConnection> {
        let connection = self.factory.connect(&self.user).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        tracing::debug!(
            user = %self.user.username,
            connection_id = id,
            "created pooled connection"
        );
        Ok(PooledConnection {
            id,
            username: self.user.username.clone(),
            created_at: now,
            last_used: now,
            retries: 0,
            connection,
        })
    }

    async fn destroy(&self, mut conn: PooledConnection) {
        conn.connection.disconnect().await;
        tracing::debug!(
            user = %self.user.username,
            connection_id = conn.id,
            "destroyed pooled connection"
        );
    }

    /// Check a connection out of the pool.
    ///
    /// Waits in steps of at most `maximum_retry_wait` for a check-in while
    /// the pool is at `maximum_size`, failing with `PoolError::Exhausted`
    /// once `checkout_timeout` has elapsed.
    pub async fn checkout(&self) -> PoolResult<PooledConnection> {
        let started = Instant::now();
        let (deadline, retry_wait) = {
            let mut state = self.state.lock().await;
            state.counters.requests += 1;
            (
                started + state.settings.checkout_timeout,
                state.settings.maximum_retry_wait,
            )
        };
        let mut retries: u32 = 0;

        loop {
            if self.is_closed() {
                return Err(PoolError::Closed(self.user.username.clone()));
            }
            if !self.is_enabled() {
                return Err(PoolError::Disabled(self.user.username.clone()));
            }

            // Register interest before inspecting the state so a check-in
            // between the inspection and the wait is not missed.
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.state.lock().await;
                if let Some(conn) = state.idle.pop_back() {
                    state.in_use += 1;
                    Step::Reuse(conn)
                } else if state.size() < state.settings.maximum_size {
                    state.pending += 1;
                    Step::Create
                } else {
                    let now = Instant::now();
                    if now >= deadline {
                        state.counters.failed += 1;
                        Step::Exhausted
                    } else {
                        if retries == 0 {
                            state.counters.delayed += 1;
                        }
                        Step::Wait(retry_wait.min(deadline - now))
                    }
                }
            };

            match step {
                Step::Reuse(mut conn) => {
                    if conn.connection.is_valid().await {
                        conn.retries = retries;
                        conn.last_used = Instant::now();
                        self.state
                            .lock()
                            .await
                            .record_checkout(started.elapsed());
                        tracing::debug!(
                            user = %self.user.username,
                            connection_id = conn.id,
                            retries = retries,
                            "reused idle connection from pool"
                        );
                        return Ok(conn);
                    }
                    tracing::debug!(
                        user = %self.user.username,
                        connection_id = conn.id,
                        "discarded invalid idle connection"
                    );
                    {
                        let mut state = self.state.lock().await;
                        state.in_use = state.in_use.saturating_sub(1);
                        state.counters.destroyed += 1;
                    }
                    self.destroy(conn).await;
                }
                Step::Create => {
                    let created = self.create().await;
                    let mut state = self.state.lock().await;
                    state.pending = state.pending.saturating_sub(1);
                    match created {
                        Ok(mut conn) => {
                            state.in_use += 1;
                            state.counters.created += 1;
                            state.record_checkout(started.elapsed());
                            conn.retries = retries;
                            return Ok(conn);
                        }
                        Err(e) => {
                            state.counters.failed += 1;
                            drop(state);
                            self.returned.notify_waiters();
                            tracing::warn!(
                                user = %self.user.username,
                                error = %e,
                                "failed to create pooled connection"
                            );
                            return Err(e);
                        }
                    }
                }
                Step::Wait(wait) => {
                    retries += 1;
                    let _ = tokio::time::timeout(wait, notified).await;
                }
                Step::Exhausted => {
                    let waited = started.elapsed();
                    tracing::warn!(
                        user = %self.user.username,
                        retries = retries,
                        waited_ms = waited.as_millis() as u64,
                        "connection pool exhausted"
                    );
                    return Err(PoolError::Exhausted {
                        user: self.user.username.clone(),
                        retries,
                        waited,
                    });
                }
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// A connection with an open transaction is refused and handed back.
    /// Connections returned invalid, or to a closed or disabled pool, are
    /// destroyed.
    pub async fn checkin(&self, mut conn: PooledConnection) -> Result<(), PooledConnection> {
        if conn.connection.is_transaction_open() {
            tracing::warn!(
                user = %self.user.username,
                connection_id = conn.id,
                "refused check-in of connection with open transaction"
            );
            return Err(conn);
        }

        let reusable = !self.is_closed()
            && self.is_enabled()
            && conn.connection.is_connected()
            && conn.connection.is_valid().await;

        let mut state = self.state.lock().await;
        state.in_use = state.in_use.saturating_sub(1);
        if reusable {
            conn.last_used = Instant::now();
            tracing::debug!(
                user = %self.user.username,
                connection_id = conn.id,
                idle_count = state.idle.len() + 1,
                "returned connection to pool"
            );
            state.idle.push_back(conn);
            drop(state);
        } else {
            state.counters.destroyed += 1;
            drop(state);
            self.destroy(conn).await;
        }
        self.returned.notify_waiters();
        Ok(())
    }

    /// Destroy a checked-out connection instead of returning it.
    pub async fn discard(&self, conn: PooledConnection) {
        {
            let mut state = self.state.lock().await;
            state.in_use = state.in_use.saturating_sub(1);
            state.counters.destroyed += 1;
        }
        self.destroy(conn).await;
        self.returned.notify_waiters();
    }

    // ── Tuning ───────────────────────────────────────────────────────

    pub async fn settings(&self) -> PoolSettings {
        self.state.lock().await.settings.clone()
    }

    async fn update(&self, change: impl FnOnce(&mut PoolSettings)) -> PoolResult<()> {
        {
            let mut state = self.state.lock().await;
            let mut next = state.settings.clone();
            change(&mut next);
            next.validate()?;
            if !next.collect_fine_grained {
                state.samples.clear();
            }
            state.settings = next;
        }
        // A larger maximum may let waiters create connections.
        self.returned.notify_waiters();
        Ok(())
    }

    pub async fn set_minimum_size(&self, minimum_size: usize) -> PoolResult<()> {
        self.update(|s| s.minimum_size = minimum_size).await
    }

    pub async fn set_maximum_size(&self, maximum_size: usize) -> PoolResult<()> {
        self.update(|s| s.maximum_size = maximum_size).await
    }

    pub async fn resize(&self, minimum_size: usize, maximum_size: usize) -> PoolResult<()> {
        self.update(|s| {
            s.minimum_size = minimum_size;
            s.maximum_size = maximum_size;
        })
        .await
    }

    pub async fn set_checkout_timeout(&self, timeout: Duration) -> PoolResult<()> {
        self.update(|s| s.checkout_timeout = timeout).await
    }

    pub async fn set_maximum_retry_wait(&self, wait: Duration) -> PoolResult<()> {
        self.update(|s| s.maximum_retry_wait = wait).await
    }

    pub async fn set_idle_timeout(&self, timeout: Duration) -> PoolResult<()> {
        self.update(|s| s.idle_timeout = timeout).await
    }

    pub async fn set_cleanup_interval(&self, interval: Duration) -> PoolResult<()> {
        self.update(|s| s.cleanup_interval = interval).await
    }

    pub async fn set_collect_fine_grained(&self, collect: bool) -> PoolResult<()> {
        self.update(|s| s.collect_fine_grained = collect).await
    }

    /// Disabling closes the idle connections and fails further checkouts.
    /// Connections already checked out stay usable and are destroyed when
    /// returned.
    pub async fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        if !enabled {
            let idle: Vec<PooledConnection> = {
                let mut state = self.state.lock().await;
                let idle: Vec<_> = state.idle.drain(..).collect();
                state.counters.destroyed += idle.len() as u64;
                idle
            };
            for conn in idle {
                self.destroy(conn).await;
            }
            self.returned.notify_waiters();
        }
        tracing::info!(user = %self.user.username, enabled, "connection pool enabled state changed");
    }

    // ── Sizes ────────────────────────────────────────────────────────

    pub async fn size(&self) -> usize {
        self.state.lock().await.size()
    }

    pub async fn in_use(&self) -> usize {
        self.state.lock().await.in_use
    }

    pub async fn available(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Close idle connections past `idle_timeout` (never going below
    /// `minimum_size`) or above a lowered `maximum_size`, then top the pool
    /// up to `minimum_size`.
    pub async fn maintain(&self) -> Maintenance {
        if self.is_closed() || !self.is_enabled() {
            return Maintenance::default();
        }

        let (expired, deficit) = {
            let mut state = self.state.lock().await;
            let mut expired = Vec::new();
            let idle_timeout = state.settings.idle_timeout;
            while state.size() > state.settings.minimum_size {
                let stale = state
                    .idle
                    .front()
                    .is_some_and(|c| c.last_used.elapsed() >= idle_timeout);
                let oversized = state.size() > state.settings.maximum_size && !state.idle.is_empty();
                if !(stale || oversized) {
                    break;
                }
                if let Some(conn) = state.idle.pop_front() {
                    expired.push(conn);
                }
            }
            state.counters.destroyed += expired.len() as u64;
            let deficit = state.settings.minimum_size.saturating_sub(state.size());
            state.pending += deficit;
            (expired, deficit)
        };

        let closed = expired.len();
        for conn in expired {
            self.destroy(conn).await;
        }

        let mut opened = 0;
        for attempt in 0..deficit {
            let created = self.create().await;
            let mut state = self.state.lock().await;
            state.pending = state.pending.saturating_sub(1);
            match created {
                Ok(conn) => {
                    state.counters.created += 1;
                    state.idle.push_back(conn);
                    opened += 1;
                }
                Err(e) => {
                    let skipped = deficit - attempt - 1;
                    state.pending = state.pending.saturating_sub(skipped);
                    tracing::warn!(
                        user = %self.user.username,
                        error = %e,
                        "failed to top up connection pool"
                    );
                    break;
                }
            }
        }
        if opened > 0 {
            self.returned.notify_waiters();
        }

        if closed > 0 || opened > 0 {
            tracing::debug!(
                user = %self.user.username,
                closed = closed,
                opened = opened,
                "connection pool maintenance"
            );
        }
        Maintenance { closed, opened }
    }

    /// Cleanup loop; runs `maintain` every `cleanup_interval` until shutdown.
    pub async fn run_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(user = %self.user.username, "pool cleanup task started");
        loop {
            let interval = self.settings().await.cleanup_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.maintain().await;
                }
                _ = shutdown.changed() => {
                    tracing::debug!(user = %self.user.username, "pool cleanup task shutting down");
                    break;
                }
            }
        }
    }

    // ── Statistics ───────────────────────────────────────────────────

    /// Statistics snapshot. Fine-grained samples are limited to those taken
    /// after `since` (epoch milliseconds).
    pub async fn statistics(&self, since: u64) -> PoolStatistics {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.window.at).as_secs_f64();
        let current = state.counters;
        let previous = state.window.counters;
        let rate = |count: u64, before: u64| {
            if elapsed > 0.0 {
                count.saturating_sub(before) as f64 / elapsed
            } else {
                0.0
            }
        };

        let times = std::mem::take(&mut state.checkout_times);
        let millis = |d: &Duration| d.as_secs_f64() * 1000.0;
        let (average, minimum, maximum) = if times.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let total: f64 = times.iter().map(millis).sum();
            let minimum = times.iter().map(millis).fold(f64::INFINITY, f64::min);
            let maximum = times.iter().map(millis).fold(0.0, f64::max);
            (total / times.len() as f64, minimum, maximum)
        };

        state.window = Window {
            at: now,
            counters: current,
        };

        PoolStatistics {
            username: self.user.username.clone(),
            timestamp: epoch_millis(),
            creation_date: self.creation_date,
            reset_date: state.reset_date,
            enabled: self.is_enabled(),
            size: state.size(),
            available: state.idle.len(),
            in_use: state.in_use,
            created: current.created,
            destroyed: current.destroyed,
            requests: current.requests,
            delayed_requests: current.delayed,
            failed_requests: current.failed,
            requests_per_second: rate(current.requests, previous.requests),
            delayed_requests_per_second: rate(current.delayed, previous.delayed),
            failed_requests_per_second: rate(current.failed, previous.failed),
            average_checkout_time_ms: average,
            minimum_checkout_time_ms: minimum,
            maximum_checkout_time_ms: maximum,
            fine_grained: state
                .samples
                .iter()
                .filter(|s| s.timestamp > since)
                .copied()
                .collect(),
        }
    }

    pub async fn reset_statistics(&self) {
        let mut state = self.state.lock().await;
        state.counters = Counters::default();
        state.window = Window {
            at: Instant::now(),
            counters: Counters::default(),
        };
        state.checkout_times.clear();
        state.samples.clear();
        state.reset_date = epoch_millis();
    }

    /// Close every idle connection and refuse further checkouts.
    /// Checked-out connections are destroyed when returned. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let idle: Vec<PooledConnection> = {
            let mut state = self.state.lock().await;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.counters.destroyed += idle.len() as u64;
            idle
        };
        for conn in idle {
            self.destroy(conn).await;
        }
        self.returned.notify_waiters();
        tracing::info!(user = %self.user.username, "connection pool closed");
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("user", &self.user.username)
            .field("enabled", &self.is_enabled())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
