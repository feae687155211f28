//! Per-device connection pool.
//!
//! Owns at most one live transport per device. Callers never hold a raw
//! connection: [`ConnectionPool::acquire`] hands out a [`ConnectionLease`]
//! that carries the device's exchange lock, so all command traffic to one
//! device is serialized and the eviction sweep can prove a connection is not
//! in use before touching it.
//!
//! # Liveness checks
//!
//! On acquire, a cached connection passes checks in increasing cost order:
//!
//! 1. Clock comparison against idle TTL and max age (no syscall).
//! 2. Non-blocking peek: EOF means the peer silently closed; pending bytes
//!    mean an idle-period prompt or garbage that must never be mistaken for
//!    a fresh response.
//!
//! Anything short of fully healthy is closed and replaced with a fresh dial.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::config::{KeepaliveConfig, PoolConfig};
use crate::error::{Error, Result};
use crate::identifiers::DeviceKey;
use crate::transport::connection::{PeerState, PooledConnection};

// ============================================================================
// Slot
// ============================================================================

/// Per-device state behind the exchange lock.
#[derive(Debug, Default)]
struct Slot {
    /// Cached connection, if any. `None` while checked out or empty.
    conn: Option<PooledConnection>,

    /// When the last command frame was written to this device. Consulted by
    /// the command client to enforce minimum spacing.
    last_command: Option<Instant>,
}

/// Map entry: the exchange lock shared by every caller targeting the device.
#[derive(Debug, Default)]
struct DeviceEntry {
    slot: Arc<tokio::sync::Mutex<Slot>>,
}

// ============================================================================
// ConnectionDiagnostics
// ============================================================================

/// Point-in-time view of one device's pooled connection.
///
/// Consumed by the external diagnostics/status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDiagnostics {
    /// The device.
    pub device: DeviceKey,

    /// Whether a transport exists (cached or checked out).
    pub connected: bool,

    /// Whether a caller currently holds the connection.
    pub checked_out: bool,

    /// Transport lifetime; `None` while checked out or absent.
    pub age: Option<Duration>,

    /// Time since last successful exchange; `None` while checked out or
    /// absent.
    pub idle: Option<Duration>,
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Process-scoped pool holding at most one transport per device.
///
/// # Example
///
/// ```ignore
/// let pool = ConnectionPool::new(PoolConfig::default(), KeepaliveConfig::default());
///
/// let mut lease = pool.acquire(&key).await?;
/// lease.write_frame(b"DOD?\r\n").await?;
/// let line = lease.read_line(Duration::from_secs(3)).await?;
/// lease.release();
/// ```
pub struct ConnectionPool {
    /// Pool tunables.
    config: PoolConfig,

    /// Keepalive applied to every dialed socket.
    keepalive: KeepaliveConfig,

    /// Device → entry map. The structural lock is only held for map
    /// insertion and lookup, never across I/O.
    entries: RwLock<FxHashMap<DeviceKey, Arc<DeviceEntry>>>,

    /// Shutdown flag.
    shutdown: AtomicBool,

    /// Background sweep task handle.
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates a pool and starts its periodic eviction sweep.
    ///
    /// Must be called within a Tokio runtime; the sweep runs as a spawned
    /// task until [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn new(config: PoolConfig, keepalive: KeepaliveConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            keepalive,
            entries: RwLock::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
            sweep_task: Mutex::new(None),
        });

        if pool.config.enabled {
            let sweep_pool = Arc::clone(&pool);
            let handle = tokio::spawn(async move {
                sweep_pool.sweep_loop().await;
            });
            *pool.sweep_task.lock() = Some(handle);
        }

        info!(
            enabled = pool.config.enabled,
            idle_ttl_s = pool.config.idle_ttl.as_secs(),
            max_age_s = pool.config.max_age.as_secs(),
            "ConnectionPool started"
        );

        pool
    }
}

// ============================================================================
// ConnectionPool - Acquire
// ============================================================================

impl ConnectionPool {
    /// Acquires the device's connection, dialing if necessary.
    ///
    /// Waits on the per-device exchange lock, so concurrent callers for the
    /// same device are served strictly one at a time while callers for
    /// distinct devices proceed in parallel. A cached connection is returned
    /// only after passing every liveness check; otherwise it is closed and a
    /// fresh one dialed.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolDisabled`] if the master switch is off
    /// - [`Error::Connect`] / [`Error::ConnectTimeout`] if dialing fails
    pub async fn acquire(&self, device: &DeviceKey) -> Result<ConnectionLease<'_>> {
        if !self.config.enabled {
            return Err(Error::PoolDisabled);
        }

        let entry = self.entry(device);
        let mut guard = entry.slot.clone().lock_owned().await;

        if let Some(mut conn) = guard.conn.take() {
            if conn.is_expired(self.config.idle_ttl, self.config.max_age) {
                debug!(
                    device = %device,
                    idle_s = conn.idle().as_secs(),
                    age_s = conn.age().as_secs(),
                    "Cached connection expired"
                );
                conn.close().await;
            } else {
                match conn.peer_state().await {
                    PeerState::Quiet => {
                        trace!(device = %device, "Reusing cached connection");
                        return Ok(ConnectionLease::new(self, device.clone(), guard, conn));
                    }
                    state => {
                        debug!(device = %device, ?state, "Cached connection unusable");
                        conn.close().await;
                    }
                }
            }
        }

        let conn = PooledConnection::dial(device, &self.config, &self.keepalive).await?;
        Ok(ConnectionLease::new(self, device.clone(), guard, conn))
    }

    /// Returns the entry for a device, creating it on first use.
    fn entry(&self, device: &DeviceKey) -> Arc<DeviceEntry> {
        if let Some(entry) = self.entries.read().get(device) {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write();
        Arc::clone(entries.entry(device.clone()).or_default())
    }
}

// ============================================================================
// ConnectionPool - Eviction
// ============================================================================

impl ConnectionPool {
    /// Closes any cached connection for the device now.
    ///
    /// Waits for an in-flight exchange to finish first. Used before opening
    /// a streaming session, since the device accepts only one control
    /// session at a time. Returns `true` if a connection was evicted.
    pub async fn evict(&self, device: &DeviceKey) -> bool {
        let entry = {
            let entries = self.entries.read();
            entries.get(device).map(Arc::clone)
        };

        let Some(entry) = entry else {
            return false;
        };

        let mut slot = entry.slot.lock().await;
        match slot.conn.take() {
            Some(conn) => {
                drop(slot);
                conn.close().await;
                debug!(device = %device, "Evicted pooled connection");
                true
            }
            None => false,
        }
    }

    /// Background task driving the periodic sweep.
    async fn sweep_loop(self: Arc<Self>) {
        debug!(period_s = self.config.sweep_interval.as_secs(), "Sweep loop started");

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.sweep_once();
        }

        debug!("Sweep loop terminated");
    }

    /// Runs one eviction pass over every cached, not-checked-out connection.
    ///
    /// `try_lock` proves the connection is not in use; a held lock means a
    /// caller has it checked out and the entry is skipped. The lock is held
    /// only for the instant of the check.
    pub fn sweep_once(&self) -> usize {
        let entries: Vec<(DeviceKey, Arc<DeviceEntry>)> = {
            let map = self.entries.read();
            map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut evicted = 0;
        for (device, entry) in entries {
            let Ok(mut slot) = entry.slot.try_lock() else {
                continue;
            };

            let expired = slot
                .conn
                .as_ref()
                .is_some_and(|c| c.is_expired(self.config.idle_ttl, self.config.max_age));

            if expired {
                // Dropping the stream closes the socket.
                let conn = slot.conn.take();
                drop(slot);
                drop(conn);
                evicted += 1;
                debug!(device = %device, "Sweep evicted idle connection");
            }
        }

        if evicted > 0 {
            info!(evicted, "Sweep pass complete");
        }
        evicted
    }
}

// ============================================================================
// ConnectionPool - Diagnostics
// ============================================================================

impl ConnectionPool {
    /// Returns a snapshot of every known device's connection state.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<ConnectionDiagnostics> {
        let entries: Vec<(DeviceKey, Arc<DeviceEntry>)> = {
            let map = self.entries.read();
            map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        entries
            .into_iter()
            .map(|(device, entry)| match entry.slot.try_lock() {
                Ok(slot) => ConnectionDiagnostics {
                    connected: slot.conn.is_some(),
                    checked_out: false,
                    age: slot.conn.as_ref().map(PooledConnection::age),
                    idle: slot.conn.as_ref().map(PooledConnection::idle),
                    device,
                },
                Err(_) => ConnectionDiagnostics {
                    device,
                    connected: true,
                    checked_out: true,
                    age: None,
                    idle: None,
                },
            })
            .collect()
    }

    /// Returns the number of cached (not checked out) connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        let map = self.entries.read();
        map.values()
            .filter(|e| e.slot.try_lock().is_ok_and(|s| s.conn.is_some()))
            .count()
    }
}

// ============================================================================
// ConnectionPool - Lifecycle
// ============================================================================

impl ConnectionPool {
    /// Shuts the pool down: stops the sweep and closes every cached
    /// connection. In-flight leases finish their exchange and their
    /// connections are closed when released back to the stopped pool.
    pub async fn shutdown(&self) {
        info!("ConnectionPool shutting down");
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.sweep_task.lock().take() {
            handle.abort();
        }

        let entries: Vec<Arc<DeviceEntry>> = {
            let mut map = self.entries.write();
            map.drain().map(|(_, v)| v).collect()
        };

        for entry in entries {
            let mut slot = entry.slot.lock().await;
            if let Some(conn) = slot.conn.take() {
                drop(slot);
                conn.close().await;
            }
        }

        info!("ConnectionPool shutdown complete");
    }

    /// Returns `true` once shutdown has begun.
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

// ============================================================================
// ConnectionLease
// ============================================================================

/// Exclusive use of one device's connection for the duration of an exchange.
///
/// Holds the device's exchange lock; dropping the lease releases the lock.
/// Every exit path must end in [`release`](Self::release) (healthy) or
/// [`discard`](Self::discard) (confirmed failure); a lease dropped without
/// either closes the connection, which is always safe.
pub struct ConnectionLease<'a> {
    pool: &'a ConnectionPool,
    device: DeviceKey,
    guard: OwnedMutexGuard<Slot>,
    conn: Option<PooledConnection>,
}

impl std::fmt::Debug for ConnectionLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("device", &self.device)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl<'a> ConnectionLease<'a> {
    fn new(
        pool: &'a ConnectionPool,
        device: DeviceKey,
        guard: OwnedMutexGuard<Slot>,
        conn: PooledConnection,
    ) -> Self {
        Self {
            pool,
            device,
            guard,
            conn: Some(conn),
        }
    }

    fn conn_mut(&mut self) -> Result<&mut PooledConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::connection_closed(self.device.clone()))
    }

    /// Writes a complete command frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on write failure.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.conn_mut()?.write_frame(frame).await
    }

    /// Reads one response line bounded by `read_timeout`.
    ///
    /// # Errors
    ///
    /// See [`PooledConnection::read_line`].
    pub async fn read_line(&mut self, read_timeout: Duration) -> Result<String> {
        self.conn_mut()?.read_line(read_timeout).await
    }

    /// When the last command frame was written to this device.
    #[inline]
    #[must_use]
    pub fn last_command(&self) -> Option<Instant> {
        self.guard.last_command
    }

    /// Records that a command frame was just written.
    #[inline]
    pub fn mark_command(&mut self) {
        self.guard.last_command = Some(Instant::now());
    }

    /// Replaces the connection with a freshly dialed one.
    ///
    /// The exchange lock stays held throughout, so no other caller can slip
    /// a command between the failed attempt and its retry.
    ///
    /// # Errors
    ///
    /// Returns the dial failure; the lease then holds no connection.
    pub async fn redial(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        let conn =
            PooledConnection::dial(&self.device, &self.pool.config, &self.pool.keepalive).await?;
        self.conn = Some(conn);
        Ok(())
    }

    /// Returns a still-healthy connection to the pool cache.
    pub fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            if self.pool.is_shutdown() {
                // Pool is tearing down; drop closes the socket.
                drop(conn);
            } else {
                conn.touch();
                self.guard.conn = Some(conn);
            }
        }
    }

    /// Closes the connection and leaves the device's slot empty.
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Mock device: accepts connections, counts dials, answers every line
    /// with `R+0000`.
    async fn mock_device(dials: Arc<AtomicUsize>) -> DeviceKey {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                dials.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if sock.write_all(b"R+0000\r\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        DeviceKey::new("127.0.0.1", port)
    }

    fn quick_pool(idle_ttl: Duration) -> Arc<ConnectionPool> {
        ConnectionPool::new(
            PoolConfig {
                idle_ttl,
                ..PoolConfig::default()
            },
            KeepaliveConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let pool = quick_pool(Duration::from_secs(300));

        let lease = pool.acquire(&device).await.expect("acquire");
        lease.release();
        assert_eq!(pool.connection_count(), 1);

        let lease = pool.acquire(&device).await.expect("acquire");
        lease.release();

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_discard_forces_fresh_dial() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let pool = quick_pool(Duration::from_secs(300));

        let lease = pool.acquire(&device).await.expect("acquire");
        lease.discard().await;
        assert_eq!(pool.connection_count(), 0);

        let lease = pool.acquire(&device).await.expect("acquire");
        lease.release();

        assert_eq!(dials.load(Ordering::SeqCst), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_pool_refuses_acquire() {
        let pool = ConnectionPool::new(
            PoolConfig {
                enabled: false,
                ..PoolConfig::default()
            },
            KeepaliveConfig::default(),
        );

        let device = DeviceKey::new("127.0.0.1", 2255);
        let err = pool.acquire(&device).await.expect_err("disabled");
        assert!(matches!(err, Error::PoolDisabled));
    }

    #[tokio::test]
    async fn test_idle_ttl_expiry_replaces_connection() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let pool = quick_pool(Duration::from_millis(100));

        let lease = pool.acquire(&device).await.expect("acquire");
        lease.release();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let lease = pool.acquire(&device).await.expect("acquire");
        lease.release();

        assert_eq!(dials.load(Ordering::SeqCst), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_closed_detected_and_replaced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let device = DeviceKey::new("127.0.0.1", port);

        // First accept is dropped immediately (silent close); the second is
        // kept open.
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.expect("accept");
            drop(sock);
            let (sock, _) = listener.accept().await.expect("accept");
            // Hold the second connection open.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let pool = quick_pool(Duration::from_secs(300));

        let lease = pool.acquire(&device).await.expect("acquire");
        lease.release();

        tokio::time::sleep(Duration::from_millis(50)).await;

        // The cached connection's peer is gone; acquire must transparently
        // replace it.
        let lease = pool.acquire(&device).await.expect("acquire");
        lease.release();

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_boundary() {
        let dials = Arc::new(AtomicUsize::new(0));
        let fresh_device = mock_device(Arc::clone(&dials)).await;
        let stale_device = mock_device(Arc::clone(&dials)).await;
        let pool = quick_pool(Duration::from_millis(200));

        let lease = pool.acquire(&stale_device).await.expect("acquire");
        lease.release();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let lease = pool.acquire(&fresh_device).await.expect("acquire");
        lease.release();

        tokio::time::sleep(Duration::from_millis(100)).await;

        // stale_device idle ≈250ms > 200ms TTL; fresh_device idle ≈100ms.
        let evicted = pool.sweep_once();
        assert_eq!(evicted, 1);
        assert_eq!(pool.connection_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_skips_checked_out_connection() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let pool = quick_pool(Duration::ZERO);

        let mut lease = pool.acquire(&device).await.expect("acquire");

        // Zero TTL means everything cached is expired, but a checked-out
        // connection must be untouchable.
        assert_eq!(pool.sweep_once(), 0);

        lease.write_frame(b"DOD?\r\n").await.expect("write");
        let line = lease.read_line(Duration::from_secs(1)).await.expect("read");
        assert_eq!(line, "R+0000");
        lease.release();

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_device_serialized_distinct_devices_parallel() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device_a = mock_device(Arc::clone(&dials)).await;
        let device_b = mock_device(Arc::clone(&dials)).await;
        let pool = quick_pool(Duration::from_secs(300));

        let lease_a = pool.acquire(&device_a).await.expect("acquire a");

        // Same device: a second acquire must wait for the lease.
        let pool2 = Arc::clone(&pool);
        let key_a = device_a.clone();
        let blocked = tokio::spawn(async move { pool2.acquire(&key_a).await.map(|l| l.release()) });

        // Distinct device: proceeds while A's lease is held.
        let lease_b = tokio::time::timeout(Duration::from_secs(1), pool.acquire(&device_b))
            .await
            .expect("no cross-device blocking")
            .expect("acquire b");
        lease_b.release();

        assert!(!blocked.is_finished());
        lease_a.release();
        blocked.await.expect("join").expect("acquire after release");

        // One dial per device, no duplicates.
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_diagnostics_reports_checked_out() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let pool = quick_pool(Duration::from_secs(300));

        let lease = pool.acquire(&device).await.expect("acquire");
        let diag = pool.diagnostics();
        assert_eq!(diag.len(), 1);
        assert!(diag[0].checked_out);
        assert!(diag[0].connected);

        lease.release();
        let diag = pool.diagnostics();
        assert!(!diag[0].checked_out);
        assert!(diag[0].idle.is_some());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_cached_connections() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let pool = quick_pool(Duration::from_secs(300));

        let lease = pool.acquire(&device).await.expect("acquire");
        lease.release();
        assert_eq!(pool.connection_count(), 1);

        pool.shutdown().await;
        assert_eq!(pool.connection_count(), 0);
    }
}
