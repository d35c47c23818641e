//! Dedicated-connection pool for blocking stream reads
//!
//! Durable subscriptions park inside blocking read calls, so they cannot
//! share a multiplexed command connection: each gets a dedicated one from
//! this pool. Command traffic (publish, fetch, ack) stays on the regular
//! command pool and never comes through here.
//!
//! The pool is bounded with an optional autoscaler: grow on exhaustion up
//! to a cap, shrink back toward a floor when load drops and the cooldown
//! has passed. At the cap it degrades instead of failing: the caller gets
//! a lease on the pool's shared base connection (`shared = true`) and a
//! rate-limited warning is logged.
//!
//! The pool is generic over a [`ConnectionFactory`] so its behavior is
//! testable without a live server; production uses the Redis factory in
//! `bus::redis`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::PoolError;

/// Minimum interval between pool-exhaustion warnings
const EXHAUSTION_WARN_INTERVAL: Duration = Duration::from_secs(30);

/// Opens connections for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Conn, PoolError>;
}

/// Autoscaling parameters
#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    /// Multiplier applied to `max` on exhaustion
    pub grow_factor: f64,
    /// Upper bound for `max`
    pub cap: usize,
    /// Shrink is considered when `in_use <= max / shrink_divisor`
    pub shrink_divisor: usize,
    /// Divisor applied to `max` on shrink
    pub shrink_factor: f64,
    /// Lower bound for `max`
    pub floor: usize,
    /// Minimum time after a grow before shrinking again
    pub cooldown: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            grow_factor: 2.0,
            cap: 256,
            shrink_divisor: 2,
            shrink_factor: 2.0,
            floor: 4,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Pool construction parameters
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Initial maximum number of dedicated connections
    pub max: usize,
    /// Connections to open eagerly in the background (best-effort)
    pub warmup: usize,
    pub autoscale: Option<AutoscaleConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 8,
            warmup: 0,
            autoscale: None,
        }
    }
}

/// Observational snapshot of pool state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max: usize,
    pub created: usize,
    pub available: usize,
    pub in_use: usize,
}

struct PoolState<C> {
    max: usize,
    created: usize,
    idle: Vec<C>,
    in_use: usize,
    grew_at: Option<Instant>,
}

struct WarnWindow {
    last: Option<Instant>,
    suppressed: u64,
}

/// Bounded, autoscaling pool of dedicated connections
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    shared: F::Conn,
    state: Mutex<PoolState<F::Conn>>,
    warn: Mutex<WarnWindow>,
    autoscale: Option<AutoscaleConfig>,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("closed", &self.closed)
            .finish()
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create the pool. Opens the shared base connection up front; warm-up
    /// of dedicated connections runs in the background and failures there
    /// only log.
    pub async fn new(factory: F, config: PoolConfig) -> Result<Arc<Self>, PoolError> {
        let shared = factory.connect().await?;

        let pool = Arc::new(Self {
            factory,
            shared,
            state: Mutex::new(PoolState {
                max: config.max.max(1),
                created: 0,
                idle: Vec::new(),
                in_use: 0,
                grew_at: None,
            }),
            warn: Mutex::new(WarnWindow {
                last: None,
                suppressed: 0,
            }),
            autoscale: config.autoscale,
            closed: AtomicBool::new(false),
        });

        if config.warmup > 0 {
            let warm = Arc::clone(&pool);
            let count = config.warmup;
            tokio::spawn(async move {
                warm.warm_up(count).await;
            });
        }

        Ok(pool)
    }

    async fn warm_up(&self, count: usize) {
        for _ in 0..count {
            {
                let mut state = self.state.lock();
                if self.closed.load(Ordering::SeqCst) || state.created >= state.max {
                    return;
                }
                state.created += 1;
            }
            match self.factory.connect().await {
                Ok(conn) => self.state.lock().idle.push(conn),
                Err(e) => {
                    self.state.lock().created -= 1;
                    tracing::debug!(error = %e, "Pool warm-up connection failed");
                    return;
                }
            }
        }
    }

    /// Acquire a lease. Reuses an idle connection, creates a new one up to
    /// `max` (growing `max` when autoscaling), and at the cap falls back to
    /// the shared connection.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease<F>, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let create = {
            let mut state = self.state.lock();

            if let Some(conn) = state.idle.pop() {
                state.in_use += 1;
                return Ok(Lease::dedicated(conn, Arc::clone(self)));
            }

            if state.created >= state.max {
                // Try to raise the ceiling before degrading
                if let Some(scale) = &self.autoscale
                    && state.max < scale.cap
                {
                    let grown = ((state.max as f64) * scale.grow_factor).ceil() as usize;
                    state.max = grown.clamp(state.max + 1, scale.cap);
                    state.grew_at = Some(Instant::now());
                    tracing::debug!(max = state.max, "Connection pool grown");
                }
            }

            if state.created < state.max {
                state.created += 1;
                state.in_use += 1;
                true
            } else {
                false
            }
        };

        if !create {
            self.warn_exhausted();
            return Ok(Lease::shared(self.shared.clone(), Arc::clone(self)));
        }

        match self.factory.connect().await {
            Ok(conn) => Ok(Lease::dedicated(conn, Arc::clone(self))),
            Err(e) => {
                let mut state = self.state.lock();
                state.created -= 1;
                state.in_use -= 1;
                Err(e)
            }
        }
    }

    fn warn_exhausted(&self) {
        let mut warn = self.warn.lock();
        let due = warn
            .last
            .is_none_or(|last| last.elapsed() >= EXHAUSTION_WARN_INTERVAL);
        if due {
            let suppressed = warn.suppressed;
            warn.last = Some(Instant::now());
            warn.suppressed = 0;
            drop(warn);
            let stats = self.stats();
            tracing::warn!(
                max = stats.max,
                in_use = stats.in_use,
                suppressed,
                "Connection pool exhausted, falling back to shared connection"
            );
        } else {
            warn.suppressed += 1;
        }
    }

    fn release(&self, conn: F::Conn, unhealthy: bool) {
        let mut dropped: Vec<F::Conn> = Vec::new();
        {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            if unhealthy || self.closed.load(Ordering::SeqCst) {
                state.created = state.created.saturating_sub(1);
                dropped.push(conn);
            } else {
                state.idle.push(conn);
            }

            if let Some(scale) = &self.autoscale {
                self.maybe_shrink(&mut state, scale, &mut dropped);
            }
        }
        drop(dropped);
    }

    fn maybe_shrink(
        &self,
        state: &mut PoolState<F::Conn>,
        scale: &AutoscaleConfig,
        dropped: &mut Vec<F::Conn>,
    ) {
        let divisor = scale.shrink_divisor.max(1);
        if state.in_use > state.max / divisor {
            return;
        }
        let cooled = state
            .grew_at
            .is_none_or(|grew| grew.elapsed() >= scale.cooldown);
        if !cooled {
            return;
        }

        let shrunk = ((state.max as f64) / scale.shrink_factor).ceil() as usize;
        let new_max = shrunk.max(scale.floor).max(1);
        if new_max >= state.max {
            return;
        }
        state.max = new_max;
        while state.created > new_max {
            match state.idle.pop() {
                Some(conn) => {
                    state.created -= 1;
                    dropped.push(conn);
                }
                None => break,
            }
        }
        tracing::debug!(max = state.max, created = state.created, "Connection pool shrunk");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            max: state.max,
            created: state.created,
            available: state.idle.len(),
            in_use: state.in_use,
        }
    }

    /// Close the pool: drop all idle connections and refuse further
    /// acquires. In-flight leases drain through `release`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        let idle = std::mem::take(&mut state.idle);
        state.created = state.created.saturating_sub(idle.len());
        drop(state);
        drop(idle);
    }
}

/// A leased connection. `shared == true` means the lease wraps the pool's
/// base connection: release is a no-op and the connection may be used
/// concurrently by others.
pub struct Lease<F: ConnectionFactory> {
    conn: Option<F::Conn>,
    shared: bool,
    pool: Arc<ConnectionPool<F>>,
}

impl<F: ConnectionFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("shared", &self.shared)
            .finish()
    }
}

impl<F: ConnectionFactory> Lease<F> {
    fn dedicated(conn: F::Conn, pool: Arc<ConnectionPool<F>>) -> Self {
        Self {
            conn: Some(conn),
            shared: false,
            pool,
        }
    }

    fn shared(conn: F::Conn, pool: Arc<ConnectionPool<F>>) -> Self {
        Self {
            conn: Some(conn),
            shared: true,
            pool,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn conn(&mut self) -> &mut F::Conn {
        self.conn.as_mut().expect("lease connection taken")
    }

    /// Return the connection to the pool. Unhealthy releases close it and
    /// shrink the live count instead.
    pub fn release(mut self, unhealthy: bool) {
        if let Some(conn) = self.conn.take()
            && !self.shared
        {
            self.pool.release(conn, unhealthy);
        }
    }
}

impl<F: ConnectionFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        // A lease dropped without an explicit release is an abnormal path
        // (task aborted mid-read); treat the connection as unhealthy so a
        // possibly wedged socket is closed rather than reused.
        if let Some(conn) = self.conn.take()
            && !self.shared
        {
            self.pool.release(conn, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ConnGuard {
        live: Arc<AtomicUsize>,
    }

    impl Drop for ConnGuard {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone)]
    struct TestConn {
        _guard: Arc<ConnGuard>,
    }

    struct TestFactory {
        opened: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    impl TestFactory {
        fn new() -> Self {
            Self {
                opened: Arc::new(AtomicUsize::new(0)),
                live: Arc::new(AtomicUsize::new(0)),
                fail: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        type Conn = TestConn;

        async fn connect(&self) -> Result<TestConn, PoolError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PoolError::Connect("refused".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(TestConn {
                _guard: Arc::new(ConnGuard {
                    live: Arc::clone(&self.live),
                }),
            })
        }
    }

    fn no_cooldown_autoscale(floor: usize, cap: usize) -> AutoscaleConfig {
        AutoscaleConfig {
            cap,
            floor,
            cooldown: Duration::ZERO,
            ..AutoscaleConfig::default()
        }
    }

    #[tokio::test]
    async fn acquire_reuses_idle_connection() {
        let factory = TestFactory::new();
        let opened = Arc::clone(&factory.opened);
        let pool = ConnectionPool::new(factory, PoolConfig::default()).await.unwrap();

        let lease = pool.acquire().await.unwrap();
        assert!(!lease.is_shared());
        lease.release(false);

        let lease = pool.acquire().await.unwrap();
        lease.release(false);

        // one shared + one dedicated
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(
            pool.stats(),
            PoolStats {
                max: 8,
                created: 1,
                available: 1,
                in_use: 0
            }
        );
    }

    #[tokio::test]
    async fn exhaustion_falls_back_to_shared() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(
            factory,
            PoolConfig {
                max: 2,
                warmup: 0,
                autoscale: None,
            },
        )
        .await
        .unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert!(!a.is_shared());
        assert!(!b.is_shared());
        assert!(c.is_shared());

        // shared release is a no-op
        c.release(false);
        assert_eq!(pool.stats().in_use, 2);
        a.release(false);
        b.release(false);
    }

    #[tokio::test]
    async fn unhealthy_release_closes_connection() {
        let factory = TestFactory::new();
        let live = Arc::clone(&factory.live);
        let pool = ConnectionPool::new(factory, PoolConfig::default()).await.unwrap();

        let lease = pool.acquire().await.unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 2); // shared + dedicated
        lease.release(true);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().created, 0);
    }

    #[tokio::test]
    async fn dropped_lease_counts_as_unhealthy() {
        let factory = TestFactory::new();
        let live = Arc::clone(&factory.live);
        let pool = ConnectionPool::new(factory, PoolConfig::default()).await.unwrap();

        let lease = pool.acquire().await.unwrap();
        drop(lease);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn grow_then_shrink_back_to_floor() {
        let factory = TestFactory::new();
        let live = Arc::clone(&factory.live);
        let pool = ConnectionPool::new(
            factory,
            PoolConfig {
                max: 4,
                warmup: 0,
                autoscale: Some(no_cooldown_autoscale(4, 256)),
            },
        )
        .await
        .unwrap();

        let mut leases = Vec::new();
        for _ in 0..16 {
            let lease = pool.acquire().await.unwrap();
            assert!(!lease.is_shared());
            leases.push(lease);
        }
        assert_eq!(pool.stats().created, 16);
        assert_eq!(pool.stats().max, 16);

        for lease in leases {
            lease.release(false);
        }

        assert_eq!(
            pool.stats(),
            PoolStats {
                max: 4,
                created: 4,
                available: 4,
                in_use: 0
            }
        );
        // 12 trimmed connections were closed; shared + 4 idle remain
        assert_eq!(live.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn cooldown_defers_shrink_after_grow() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(
            factory,
            PoolConfig {
                max: 2,
                warmup: 0,
                autoscale: Some(AutoscaleConfig {
                    floor: 2,
                    cooldown: Duration::from_secs(3600),
                    ..AutoscaleConfig::default()
                }),
            },
        )
        .await
        .unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap(); // triggers grow to 4
        assert!(!c.is_shared());
        assert_eq!(pool.stats().max, 4);

        a.release(false);
        b.release(false);
        c.release(false);

        // still inside the cooldown window
        assert_eq!(pool.stats().max, 4);
        assert_eq!(pool.stats().created, 3);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_and_frees_slot() {
        let factory = TestFactory::new();
        let fail = Arc::clone(&factory.fail);
        let pool = ConnectionPool::new(factory, PoolConfig::default()).await.unwrap();

        fail.store(true, Ordering::SeqCst);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Connect(_)));
        assert_eq!(pool.stats().created, 0);
        assert_eq!(pool.stats().in_use, 0);

        fail.store(false, Ordering::SeqCst);
        let lease = pool.acquire().await.unwrap();
        lease.release(false);
    }

    #[tokio::test]
    async fn close_drops_idle_and_rejects_acquire() {
        let factory = TestFactory::new();
        let live = Arc::clone(&factory.live);
        let pool = ConnectionPool::new(factory, PoolConfig::default()).await.unwrap();

        let lease = pool.acquire().await.unwrap();
        lease.release(false);
        assert_eq!(pool.stats().available, 1);

        pool.close();
        assert_eq!(pool.stats().available, 0);
        assert_eq!(live.load(Ordering::SeqCst), 1); // shared only
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }
}
