//! Dedicated streaming transport.
//!
//! A `DRD?` request puts the device into continuous output: it emits one
//! payload line roughly every 100 ms until told to stop. Such a session
//! holds its transport open indefinitely, so it bypasses the pool entirely
//! and owns a dedicated connection with OS keepalive applied.
//!
//! The device accepts only one control session at a time, so opening a
//! stream first evicts any pooled connection to the same device.
//!
//! # Termination
//!
//! The frame sequence ends when the device stops sending (EOF or stream
//! read timeout), when a read fails, or when the caller requests
//! cancellation, which sends the single stop sentinel byte 0x1A and closes
//! the transport.

// ============================================================================
// Imports
// ============================================================================

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::identifiers::DeviceKey;
use crate::protocol::{Command, ResultCode, STOP_SENTINEL, strip_prompt};
use crate::transport::connection::PooledConnection;
use crate::transport::pool::ConnectionPool;

// ============================================================================
// Constants
// ============================================================================

/// A healthy device emits a frame every ~100 ms; 30 s of silence means the
/// stream is dead.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Backpressure bound on undelivered frames.
const FRAME_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// StreamFrame
// ============================================================================

/// One payload line from a streaming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// The raw payload line, prompt stripped.
    raw: String,
}

impl StreamFrame {
    /// Returns the raw payload line.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Splits the frame into trimmed, non-empty comma-separated fields.
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
// StreamSession
// ============================================================================

/// A live streaming session against one device.
///
/// Yields frames as a lazy, unbounded sequence, either via
/// [`next`](Self::next) or through the [`Stream`] impl. Dropping the session
/// requests cancellation.
///
/// # Example
///
/// ```ignore
/// let mut session = StreamSession::open(&key, &pool, &config).await?;
/// while let Some(frame) = session.next().await {
///     println!("{}", frame?.raw());
/// }
/// ```
pub struct StreamSession {
    device: DeviceKey,
    frames: mpsc::Receiver<Result<StreamFrame>>,
    stop_tx: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

// ============================================================================
// StreamSession - Open
// ============================================================================

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("device", &self.device)
            .finish()
    }
}

impl StreamSession {
    /// Opens a streaming session.
    ///
    /// Evicts any pooled connection to the device first (one control session
    /// per device), dials a dedicated transport, drains idle-period leftovers
    /// so they are never parsed as stream data, and issues `DRD?`.
    ///
    /// # Errors
    ///
    /// - [`Error::Connect`] / [`Error::ConnectTimeout`] if dialing fails
    /// - [`Error::Device`] if the device rejects `DRD?`
    /// - [`Error::Protocol`] on an unrecognizable result line
    pub async fn open(
        device: &DeviceKey,
        pool: &ConnectionPool,
        config: &LinkConfig,
    ) -> Result<Self> {
        pool.evict(device).await;

        let mut conn = PooledConnection::dial(device, &config.pool, &config.keepalive).await?;
        conn.drain_pending().await;

        let command = Command::drd();
        conn.write_frame(&command.encode()).await?;

        let line = conn.read_line(config.command.response_timeout).await?;
        let line = strip_prompt(&line);
        let code = ResultCode::parse(line).ok_or_else(|| {
            Error::protocol(device.clone(), format!("unrecognized result line: {line:?}"))
        })?;
        if !code.is_ok() {
            return Err(Error::device(device.clone(), code));
        }

        info!(device = %device, "Streaming session opened");

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();

        let key = device.clone();
        let reader = tokio::spawn(async move {
            Self::read_loop(key, conn, frame_tx, stop_rx).await;
        });

        Ok(Self {
            device: device.clone(),
            frames: frame_rx,
            stop_tx: Some(stop_tx),
            reader: Some(reader),
        })
    }
}

// ============================================================================
// StreamSession - Consuming
// ============================================================================

impl StreamSession {
    /// Returns the device this session streams from.
    #[inline]
    #[must_use]
    pub fn device(&self) -> &DeviceKey {
        &self.device
    }

    /// Receives the next frame.
    ///
    /// Returns `None` once the session has ended; a final `Err` frame
    /// reports the reason when the end was not a clean stop.
    pub async fn next(&mut self) -> Option<Result<StreamFrame>> {
        self.frames.recv().await
    }

    /// Requests cancellation and waits for the reader to finish.
    ///
    /// Sends the stop sentinel (0x1A) and closes the transport. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        debug!(device = %self.device, "Streaming session stopped");
    }
}

impl Stream for StreamSession {
    type Item = Result<StreamFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_recv(cx)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        // Signal the reader so it sends the sentinel and closes the
        // transport; the task outlives the handle.
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

// ============================================================================
// StreamSession - Reader Task
// ============================================================================

impl StreamSession {
    async fn read_loop(
        device: DeviceKey,
        mut conn: PooledConnection,
        frame_tx: mpsc::Sender<Result<StreamFrame>>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    Self::send_sentinel(&device, &mut conn).await;
                    break;
                }

                line = conn.read_line(STREAM_READ_TIMEOUT) => {
                    match line {
                        Ok(line) => {
                            let raw = strip_prompt(&line).to_owned();
                            if raw.is_empty() {
                                continue;
                            }
                            let frame = StreamFrame { raw };
                            if frame_tx.send(Ok(frame)).await.is_err() {
                                // Consumer is gone; treat as cancellation.
                                Self::send_sentinel(&device, &mut conn).await;
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(device = %device, error = %e, "Stream read ended");
                            let _ = frame_tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
            }
        }

        conn.close().await;
        debug!(device = %device, "Stream reader terminated");
    }

    async fn send_sentinel(device: &DeviceKey, conn: &mut PooledConnection) {
        if let Err(e) = conn.write_byte(STOP_SENTINEL).await {
            debug!(device = %device, error = %e, "Stop sentinel not delivered");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::config::{KeepaliveConfig, PoolConfig};

    /// Mock device: answers `DRD?` with `R+0000` then emits numbered frames
    /// every 10 ms until it receives the stop sentinel.
    async fn streaming_device(saw_sentinel: Arc<AtomicBool>) -> DeviceKey {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");

            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.expect("read command");
            assert_eq!(&buf[..n], b"DRD?\r\n");
            sock.write_all(b"R+0000\r\n").await.expect("result line");

            let mut seq = 0u32;
            loop {
                tokio::select! {
                    read = sock.read(&mut buf) => {
                        match read {
                            Ok(n) if n > 0 && buf[..n].contains(&STOP_SENTINEL) => {
                                saw_sentinel.store(true, Ordering::SeqCst);
                                break;
                            }
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                    () = tokio::time::sleep(Duration::from_millis(10)) => {
                        seq += 1;
                        let line = format!("{seq}.0,54.1,60.2\r\n");
                        if sock.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        DeviceKey::new("127.0.0.1", port)
    }

    fn test_pool() -> Arc<ConnectionPool> {
        ConnectionPool::new(PoolConfig::default(), KeepaliveConfig::default())
    }

    #[tokio::test]
    async fn test_stream_yields_frames_then_stops_with_sentinel() {
        let saw_sentinel = Arc::new(AtomicBool::new(false));
        let device = streaming_device(Arc::clone(&saw_sentinel)).await;
        let pool = test_pool();
        let config = LinkConfig::default();

        let mut session = StreamSession::open(&device, &pool, &config)
            .await
            .expect("open");

        let first = session.next().await.expect("frame").expect("ok");
        let second = session.next().await.expect("frame").expect("ok");
        assert_eq!(first.fields().len(), 3);
        assert_ne!(first.raw(), second.raw());

        session.stop().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(saw_sentinel.load(Ordering::SeqCst));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_rejected_by_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let device = DeviceKey::new("127.0.0.1", port);

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
            // Wrong state: a measurement is not running.
            sock.write_all(b"R+0004\r\n").await.expect("write");
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let pool = test_pool();
        let err = StreamSession::open(&device, &pool, &LinkConfig::default())
            .await
            .expect_err("rejected");
        assert!(matches!(
            err,
            Error::Device {
                code: ResultCode::StatusError,
                ..
            }
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_open_evicts_pooled_connection() {
        let saw_sentinel = Arc::new(AtomicBool::new(false));
        let device = streaming_device(Arc::clone(&saw_sentinel)).await;
        let pool = test_pool();

        let config = LinkConfig::default();
        let mut session = StreamSession::open(&device, &pool, &config)
            .await
            .expect("open");
        assert_eq!(pool.connection_count(), 0);

        session.stop().await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_ends_on_device_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let device = DeviceKey::new("127.0.0.1", port);

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"R+0000\r\n53.4,54.1\r\n").await.expect("write");
            // Device goes away mid-stream.
        });

        let pool = test_pool();
        let mut session = StreamSession::open(&device, &pool, &LinkConfig::default())
            .await
            .expect("open");

        let frame = session.next().await.expect("frame").expect("ok");
        assert_eq!(frame.raw(), "53.4,54.1");

        // Next item reports the broken stream, then the sequence ends.
        let end = session.next().await.expect("error frame");
        assert!(end.is_err());
        assert!(session.next().await.is_none());
        pool.shutdown().await;
    }
}
