//! Protocol command client.
//!
//! Builds and sends command frames over pooled connections, parses the
//! two-line response, enforces per-device minimum command spacing, and
//! performs one transparent retry on transport failure.
//!
//! # Retry policy
//!
//! An idle cellular NAT session can silently kill a cached connection; the
//! first write or read against it then fails even though the device is
//! fine. On any transport-level failure the client discards the connection
//! and repeats the whole exchange once on a fresh dial, without releasing
//! the device's exchange lock in between. The caller never sees the first
//! failure; if the retry also fails, the retry's own error is surfaced
//! wrapped in [`Error::RetryExhausted`]. A non-success result code is a
//! completed exchange and is never retried.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::CommandConfig;
use crate::error::{Error, Result};
use crate::identifiers::DeviceKey;
use crate::protocol::{Command, CommandResult, ResultCode, strip_prompt};
use crate::transport::pool::{ConnectionLease, ConnectionPool};

// ============================================================================
// Snapshot
// ============================================================================

/// A parsed `DOD?` snapshot: the raw payload line of a single reading.
///
/// Field meanings are device-model specific and left to the caller; this
/// layer only guarantees the payload is non-empty and comma-structured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    raw: String,
}

impl Snapshot {
    /// Returns the raw payload line.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Splits the payload into trimmed, non-empty comma-separated fields.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        self.raw
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .collect()
    }
}

// ============================================================================
// DeviceClient
// ============================================================================

/// Command client over the connection pool.
///
/// Cheap to clone via [`Arc`]; all state lives in the pool.
///
/// # Example
///
/// ```ignore
/// let client = DeviceClient::new(pool, CommandConfig::default());
/// let result = client.send(&key, Command::measure_start()).await?;
/// assert!(result.is_ok());
/// ```
pub struct DeviceClient {
    pool: Arc<ConnectionPool>,
    config: CommandConfig,
}

impl DeviceClient {
    /// Creates a client over the given pool.
    #[inline]
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, config: CommandConfig) -> Self {
        Self { pool, config }
    }

    /// Returns the underlying pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

// ============================================================================
// DeviceClient - Send
// ============================================================================

impl DeviceClient {
    /// Sends one command and returns the device's answer.
    ///
    /// Serializes on the device's exchange lock, waits out the minimum
    /// command spacing, writes the frame in a single write, and reads the
    /// result line plus, for request commands, the payload line. See the
    /// module docs for the retry policy.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the command text is not wire-safe
    /// - [`Error::PoolDisabled`] if the pool master switch is off
    /// - [`Error::RetryExhausted`] if a transport failure survived the retry
    /// - [`Error::Protocol`] on an unrecognizable result line
    ///
    /// A non-success result code is returned in `Ok`, not as an error.
    pub async fn send(&self, device: &DeviceKey, command: Command) -> Result<CommandResult> {
        command
            .validate()
            .map_err(|reason| Error::config(format!("command {command}: {reason}")))?;

        let mut lease = self.pool.acquire(device).await?;
        debug!(device = %device, command = %command, "Sending command");

        match self.exchange(&mut lease, device, &command).await {
            Ok(result) => {
                lease.release();
                Ok(result)
            }
            Err(e) if e.is_transport() && self.config.retry_on_transport_failure => {
                debug!(device = %device, error = %e, "Transport failure, retrying on fresh connection");

                if let Err(redial_err) = lease.redial().await {
                    lease.discard().await;
                    return Err(Error::retry_exhausted(device.clone(), redial_err));
                }

                match self.exchange(&mut lease, device, &command).await {
                    Ok(result) => {
                        info!(device = %device, command = %command, "Retry on fresh connection succeeded");
                        lease.release();
                        Ok(result)
                    }
                    Err(retry_err) => {
                        warn!(device = %device, error = %retry_err, "Retry on fresh connection failed");
                        lease.discard().await;
                        Err(Error::retry_exhausted(device.clone(), retry_err))
                    }
                }
            }
            Err(e) => {
                if e.is_transport() {
                    lease.discard().await;
                } else {
                    // Protocol-level outcome on a healthy transport.
                    lease.release();
                }
                Err(e)
            }
        }
    }

    /// Runs one complete exchange on the leased connection.
    async fn exchange(
        &self,
        lease: &mut ConnectionLease<'_>,
        device: &DeviceKey,
        command: &Command,
    ) -> Result<CommandResult> {
        self.enforce_spacing(lease, device).await;

        lease.mark_command();
        lease.write_frame(&command.encode()).await?;

        let line = lease.read_line(self.config.response_timeout).await?;
        let line = strip_prompt(&line);
        let code = ResultCode::parse(line).ok_or_else(|| {
            Error::protocol(device.clone(), format!("unrecognized result line: {line:?}"))
        })?;

        if !code.is_ok() {
            debug!(device = %device, %code, "Device rejected command");
            return Ok(CommandResult::new(code));
        }

        if !command.expects_payload() {
            return Ok(CommandResult::new(ResultCode::Ok));
        }

        let payload = lease.read_line(self.config.response_timeout).await?;
        let payload = strip_prompt(&payload);
        Ok(CommandResult::with_payload(payload))
    }

    /// Waits until the minimum spacing since this device's last command has
    /// elapsed. Runs under the exchange lock, so the wait also preserves
    /// submission order.
    async fn enforce_spacing(&self, lease: &ConnectionLease<'_>, device: &DeviceKey) {
        if let Some(last) = lease.last_command() {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_spacing {
                let wait = self.config.min_spacing - elapsed;
                debug!(device = %device, wait_ms = wait.as_millis() as u64, "Spacing wait");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

// ============================================================================
// DeviceClient - Convenience Commands
// ============================================================================

impl DeviceClient {
    /// Sends a request command (`name?`).
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn query(&self, device: &DeviceKey, name: &str) -> Result<CommandResult> {
        self.send(device, Command::request(name)).await
    }

    /// Sends a setting command (`name,param`).
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn set(&self, device: &DeviceKey, name: &str, param: &str) -> Result<CommandResult> {
        self.send(device, Command::set(name, param)).await
    }

    /// Queries several fields independently.
    ///
    /// Each field's outcome stands alone: a failure on one never discards
    /// results already obtained for others. Non-success result codes are
    /// reported as [`Error::Device`] per field.
    pub async fn query_many(
        &self,
        device: &DeviceKey,
        names: &[&str],
    ) -> Vec<(String, Result<CommandResult>)> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let outcome = match self.query(device, name).await {
                Ok(result) if result.is_ok() => Ok(result),
                Ok(result) => Err(Error::device(device.clone(), result.code)),
                Err(e) => Err(e),
            };
            results.push(((*name).to_owned(), outcome));
        }
        results
    }

    /// Requests a `DOD?` snapshot of the current reading.
    ///
    /// # Errors
    ///
    /// - [`Error::Device`] if the device answers with a non-success code
    /// - [`Error::Protocol`] if the payload is empty or not comma-structured
    pub async fn snapshot(&self, device: &DeviceKey) -> Result<Snapshot> {
        let result = self.send(device, Command::dod()).await?;
        if !result.is_ok() {
            return Err(Error::device(device.clone(), result.code));
        }

        let raw = result.payload.unwrap_or_default();
        let snapshot = Snapshot { raw };
        if snapshot.fields().len() < 2 {
            return Err(Error::protocol(
                device.clone(),
                format!("malformed DOD payload: {:?}", snapshot.raw),
            ));
        }
        Ok(snapshot)
    }

    /// Starts a measurement (`Measure,Start`).
    ///
    /// # Errors
    ///
    /// [`Error::Device`] if the device refuses (already measuring, wrong
    /// state).
    pub async fn start_measurement(&self, device: &DeviceKey) -> Result<()> {
        let result = self.send(device, Command::measure_start()).await?;
        if !result.is_ok() {
            return Err(Error::device(device.clone(), result.code));
        }
        Ok(())
    }

    /// Stops the running measurement (`Measure,Stop`).
    ///
    /// # Errors
    ///
    /// [`Error::Device`] if the device refuses.
    pub async fn stop_measurement(&self, device: &DeviceKey) -> Result<()> {
        let result = self.send(device, Command::measure_stop()).await?;
        if !result.is_ok() {
            return Err(Error::device(device.clone(), result.code));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::config::{KeepaliveConfig, PoolConfig};

    /// Reads one CR LF frame from the socket.
    async fn read_frame(sock: &mut TcpStream) -> Option<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match sock.read(&mut byte).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        return Some(String::from_utf8_lossy(&line).into_owned());
                    }
                    line.push(byte[0]);
                }
            }
        }
    }

    /// Mock device answering per NL-43 rules: `R+0000` plus a payload for
    /// `?` commands, `R+0004` for `Bogus` commands.
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
                    while let Some(frame) = read_frame(&mut sock).await {
                        let reply: &[u8] = if frame.starts_with("Bogus") {
                            b"R+0004\r\n"
                        } else if frame.ends_with('?') {
                            b"R+0000\r\n53.4,54.1,61.0,60.2,48.9\r\n"
                        } else {
                            b"R+0000\r\n"
                        };
                        if sock.write_all(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        DeviceKey::new("127.0.0.1", port)
    }

    fn quick_client(pool: Arc<ConnectionPool>, min_spacing: Duration) -> DeviceClient {
        DeviceClient::new(
            pool,
            CommandConfig {
                min_spacing,
                response_timeout: Duration::from_secs(1),
                retry_on_transport_failure: true,
            },
        )
    }

    fn test_pool() -> Arc<ConnectionPool> {
        ConnectionPool::new(PoolConfig::default(), KeepaliveConfig::default())
    }

    #[tokio::test]
    async fn test_measure_start_on_fresh_connection() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let client = quick_client(test_pool(), Duration::ZERO);

        let result = client
            .send(&device, Command::measure_start())
            .await
            .expect("send");
        assert!(result.is_ok());
        assert!(result.payload.is_none());
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_dod_dials_once_and_caches() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let client = quick_client(test_pool(), Duration::ZERO);

        let first = client.snapshot(&device).await.expect("snapshot");
        assert_eq!(first.fields()[0], "53.4");

        // Second DOD within the idle TTL reuses the cached connection.
        let second = client.snapshot(&device).await.expect("snapshot");
        assert_eq!(second.fields().len(), 5);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_device_error_code_is_not_retried() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let client = quick_client(test_pool(), Duration::ZERO);

        let result = client
            .send(&device, Command::set("Bogus", "Value"))
            .await
            .expect("send");
        assert_eq!(result.code, ResultCode::StatusError);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        client.pool().shutdown().await;
    }

    /// Device that accepts the first connection and drops it on the first
    /// frame without replying; subsequent connections behave.
    async fn flaky_device(dials: Arc<AtomicUsize>) -> DeviceKey {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let dial_no = dials.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(async move {
                    if dial_no == 1 {
                        // Read the frame, then vanish without answering.
                        let _ = read_frame(&mut sock).await;
                        return;
                    }
                    while let Some(_frame) = read_frame(&mut sock).await {
                        if sock.write_all(b"R+0000\r\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        DeviceKey::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_transport_failure_retried_once_and_hidden() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = flaky_device(Arc::clone(&dials)).await;
        let client = quick_client(test_pool(), Duration::ZERO);

        // First exchange hits the vanishing connection, retry dials fresh
        // and succeeds; the caller sees clean success.
        let result = client
            .send(&device, Command::measure_start())
            .await
            .expect("send succeeds via retry");
        assert!(result.is_ok());
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_initial_dial_failure_surfaced_directly() {
        // Dead endpoint: every dial is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let device = DeviceKey::new("127.0.0.1", port);
        drop(listener);

        let client = quick_client(test_pool(), Duration::ZERO);

        // No exchange ever started, so there is nothing to retry.
        let err = client
            .send(&device, Command::measure_start())
            .await
            .expect_err("dial refused");
        assert!(err.is_transport());
        client.pool().shutdown().await;
    }

    /// Device that reads frames but never answers.
    async fn mute_device(dials: Arc<AtomicUsize>) -> DeviceKey {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                dials.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    while read_frame(&mut sock).await.is_some() {}
                });
            }
        });

        DeviceKey::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_double_timeout_reports_retry_exhausted() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mute_device(Arc::clone(&dials)).await;

        let client = DeviceClient::new(
            test_pool(),
            CommandConfig {
                min_spacing: Duration::ZERO,
                response_timeout: Duration::from_millis(100),
                retry_on_transport_failure: true,
            },
        );

        let err = client
            .send(&device, Command::measure_start())
            .await
            .expect_err("both attempts time out");
        assert!(err.is_retry_exhausted());
        // The wrapped source is the retry's own timeout.
        if let Error::RetryExhausted { source, .. } = &err {
            assert!(source.is_timeout());
        }
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_disabled_surfaces_first_failure() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mute_device(Arc::clone(&dials)).await;

        let client = DeviceClient::new(
            test_pool(),
            CommandConfig {
                min_spacing: Duration::ZERO,
                response_timeout: Duration::from_millis(100),
                retry_on_transport_failure: false,
            },
        );

        let err = client
            .send(&device, Command::measure_start())
            .await
            .expect_err("fails");
        assert!(err.is_timeout());
        assert!(!err.is_retry_exhausted());
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_minimum_spacing_between_commands() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let client = quick_client(test_pool(), Duration::from_millis(200));

        let start = Instant::now();
        client
            .send(&device, Command::measure_start())
            .await
            .expect("first");
        client
            .send(&device, Command::measure_stop())
            .await
            .expect("second");

        assert!(start.elapsed() >= Duration::from_millis(200));
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_sends_not_interleaved() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let client = Arc::new(quick_client(test_pool(), Duration::ZERO));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let client = Arc::clone(&client);
            let key = device.clone();
            handles.push(tokio::spawn(async move {
                client.send(&key, Command::dod()).await
            }));
        }

        for handle in handles {
            let result = handle.await.expect("join").expect("send");
            // Interleaved frames would garble responses; every caller must
            // read its own complete two-line answer.
            assert!(result.is_ok());
            assert!(result.payload.is_some());
        }

        // One shared connection for all four callers.
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_query_many_partial_failure() {
        let dials = Arc::new(AtomicUsize::new(0));
        let device = mock_device(Arc::clone(&dials)).await;
        let client = quick_client(test_pool(), Duration::ZERO);

        let results = client.query_many(&device, &["DOD", "Bogus", "BAT"]).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(Error::Device { .. })));
        // The later field still succeeded despite the middle failure.
        assert!(results[2].1.is_ok());
        client.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_command_text_rejected() {
        let client = quick_client(test_pool(), Duration::ZERO);
        let device = DeviceKey::new("127.0.0.1", 2255);

        let err = client
            .send(&device, Command::request("DOD\r\nMeasure,Start"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, Error::Config { .. }));
        client.pool().shutdown().await;
    }
}
