//! A connection pool for daemon clients.
//!
//! The pool maintains `active + idle <= capacity` at all times. Guards
//! return their connection on drop; poisoned connections are discarded and
//! their slot freed for a waiter.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use syrinx_store_core::StoreDir;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::client::metrics::PoolMetrics;
use crate::client::{DaemonClientBuilder, UnixDaemonClient};
use crate::error::ProtocolError;

#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections.
    pub max_size: usize,
    /// Idle connections older than this are closed instead of reused.
    pub max_idle_time: Duration,
    /// How long `acquire` waits for a slot before giving up.
    pub acquire_timeout: Duration,
    /// How long connection establishment may take.
    pub connection_timeout: Duration,
    pub metrics: Option<Arc<PoolMetrics>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let max_size = std::thread::available_parallelism()
            .map(|n| n.get() + 1)
            .unwrap_or(5);
        PoolConfig {
            max_size,
            max_idle_time: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            metrics: None,
        }
    }
}

struct PooledConnection {
    client: UnixDaemonClient,
    last_used: Instant,
}

impl PooledConnection {
    fn is_expired(&self, max_idle_time: Duration) -> bool {
        self.last_used.elapsed() > max_idle_time
    }
}

struct PoolState {
    idle: VecDeque<PooledConnection>,
    active_count: usize,
    capacity: usize,
}

impl PoolState {
    fn invariant(&self) -> bool {
        self.active_count + self.idle.len() <= self.capacity && self.capacity > 0
    }

    fn update_metrics(&self, metrics: &PoolMetrics) {
        metrics.idle_connections.set(self.idle.len() as i64);
        metrics.active_connections.set(self.active_count as i64);
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    state: Arc<Mutex<PoolState>>,
    socket_path: PathBuf,
    store_dir: StoreDir,
    config: PoolConfig,
    available: Arc<Notify>,
}

impl ConnectionPool {
    /// # Panics
    /// Panics if `config.max_size` is 0.
    pub fn new(socket_path: impl AsRef<Path>, store_dir: StoreDir, config: PoolConfig) -> Self {
        assert!(config.max_size > 0, "pool capacity must be positive");
        ConnectionPool {
            state: Arc::new(Mutex::new(PoolState {
                idle: VecDeque::new(),
                active_count: 0,
                capacity: config.max_size,
            })),
            socket_path: socket_path.as_ref().to_owned(),
            store_dir,
            config,
            available: Arc::new(Notify::new()),
        }
    }

    /// Acquire a connection, reusing an idle one when possible.
    pub async fn acquire(&self) -> Result<PooledConnectionGuard, ProtocolError> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        loop {
            match self.try_acquire() {
                Acquired::Reused(conn) => {
                    self.observe_acquire(started, "reused");
                    return Ok(PooledConnectionGuard::new(conn, self.clone()));
                }
                Acquired::SlotFree => {
                    let result = timeout(
                        self.config.connection_timeout,
                        DaemonClientBuilder::new()
                            .socket_path(&self.socket_path)
                            .store_dir(self.store_dir.clone())
                            .connect(),
                    )
                    .await;
                    let client = match result {
                        Ok(Ok(client)) => client,
                        Ok(Err(err)) => {
                            self.release_slot();
                            self.count_created("failure");
                            return Err(err);
                        }
                        Err(_) => {
                            self.release_slot();
                            self.count_created("timeout");
                            return Err(ProtocolError::io(
                                "connecting to daemon",
                                std::io::Error::new(
                                    std::io::ErrorKind::TimedOut,
                                    "connection timed out",
                                ),
                            ));
                        }
                    };
                    self.count_created("success");
                    self.observe_acquire(started, "created");
                    return Ok(PooledConnectionGuard::new(
                        PooledConnection {
                            client,
                            last_used: Instant::now(),
                        },
                        self.clone(),
                    ));
                }
                Acquired::Full => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ProtocolError::io(
                            "acquiring pooled connection",
                            std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "pool exhausted",
                            ),
                        ));
                    }
                    if timeout(remaining, self.available.notified()).await.is_err() {
                        return Err(ProtocolError::io(
                            "acquiring pooled connection",
                            std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "pool exhausted",
                            ),
                        ));
                    }
                }
            }
        }
    }

    fn try_acquire(&self) -> Acquired {
        let mut state = self.state.lock().expect("pool lock");
        debug_assert!(state.invariant());
        while let Some(conn) = state.idle.pop_front() {
            if conn.is_expired(self.config.max_idle_time) {
                debug!("dropping expired idle connection");
                continue;
            }
            if conn.client.is_poisoned() {
                self.count_error("poisoned");
                continue;
            }
            state.active_count += 1;
            if let Some(metrics) = &self.config.metrics {
                state.update_metrics(metrics);
            }
            return Acquired::Reused(conn);
        }
        if state.active_count < state.capacity {
            state.active_count += 1;
            if let Some(metrics) = &self.config.metrics {
                state.update_metrics(metrics);
            }
            Acquired::SlotFree
        } else {
            Acquired::Full
        }
    }

    fn release_slot(&self) {
        let mut state = self.state.lock().expect("pool lock");
        state.active_count -= 1;
        if let Some(metrics) = &self.config.metrics {
            state.update_metrics(metrics);
        }
        drop(state);
        self.available.notify_one();
    }

    fn give_back(&self, mut conn: PooledConnection) {
        if conn.client.is_poisoned() {
            self.count_error("poisoned");
            warn!("discarding poisoned connection");
            self.release_slot();
            return;
        }
        conn.last_used = Instant::now();
        let mut state = self.state.lock().expect("pool lock");
        state.active_count -= 1;
        state.idle.push_back(conn);
        debug_assert!(state.invariant());
        if let Some(metrics) = &self.config.metrics {
            state.update_metrics(metrics);
        }
        drop(state);
        self.available.notify_one();
    }

    fn observe_acquire(&self, started: Instant, source: &str) {
        if let Some(metrics) = &self.config.metrics {
            metrics
                .acquire_duration
                .with_label_values(&[source])
                .observe(started.elapsed().as_secs_f64());
        }
    }

    fn count_created(&self, outcome: &str) {
        if let Some(metrics) = &self.config.metrics {
            metrics
                .connections_created
                .with_label_values(&[outcome])
                .inc();
        }
    }

    fn count_error(&self, reason: &str) {
        if let Some(metrics) = &self.config.metrics {
            metrics.connection_errors.with_label_values(&[reason]).inc();
        }
    }
}

enum Acquired {
    Reused(PooledConnection),
    SlotFree,
    Full,
}

/// RAII handle to a pooled connection. Dropping it returns the connection
/// to the pool, or discards it if the connection was poisoned.
pub struct PooledConnectionGuard {
    conn: Option<PooledConnection>,
    pool: ConnectionPool,
}

impl PooledConnectionGuard {
    fn new(conn: PooledConnection, pool: ConnectionPool) -> Self {
        PooledConnectionGuard {
            conn: Some(conn),
            pool,
        }
    }

    pub fn client(&mut self) -> &mut UnixDaemonClient {
        &mut self
            .conn
            .as_mut()
            .expect("connection present until drop")
            .client
    }
}

impl Drop for PooledConnectionGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}
