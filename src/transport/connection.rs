//! Pooled connection and liveness checks.
//!
//! A [`PooledConnection`] is an open TCP transport to one device plus the
//! metadata the pool needs for eviction decisions: creation time, last-used
//! time, and a small read buffer that survives between exchanges.
//!
//! # Staleness
//!
//! Idle cellular NAT sessions and device-side faults can leave a socket that
//! looks open but is dead, or that carries leftover bytes (typically an
//! unread `$` prompt) from a previous exchange. [`PooledConnection::peer_state`]
//! detects both without blocking so the pool can replace the connection
//! before a caller ever writes to it.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::{KeepaliveConfig, PoolConfig};
use crate::error::{Error, Result};
use crate::identifiers::DeviceKey;

// ============================================================================
// Constants
// ============================================================================

/// Hard cap on a single response line; anything longer is a protocol fault.
const MAX_LINE_BYTES: usize = 4096;

/// Read chunk size for line assembly.
const READ_CHUNK_BYTES: usize = 512;

// ============================================================================
// PeerState
// ============================================================================

/// Result of the non-blocking peer probe on a cached connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No pending bytes; the peer looks alive.
    Quiet,

    /// The peer has closed its end (peek returned EOF).
    Closed,

    /// Unread bytes are sitting in the socket; the connection is stale and
    /// must not be reused as-is.
    StaleBytes,

    /// The probe itself failed at the transport level.
    Failed,
}

// ============================================================================
// PooledConnection
// ============================================================================

/// An open transport to one device plus pool metadata.
///
/// Owned exclusively by the pool; callers only ever touch it through a
/// `ConnectionLease`, which holds the device's exchange lock.
#[derive(Debug)]
pub struct PooledConnection {
    /// The TCP transport.
    stream: TcpStream,

    /// Device this transport is dialed to.
    device: DeviceKey,

    /// When the transport was dialed.
    created_at: Instant,

    /// When the transport last completed a successful exchange.
    last_used: Instant,

    /// Bytes read past the last consumed line. Normally empty between
    /// exchanges; non-empty means the device sent something unsolicited.
    read_buf: Vec<u8>,
}

// ============================================================================
// PooledConnection - Dialing
// ============================================================================

impl PooledConnection {
    /// Dials a fresh transport to the device.
    ///
    /// Applies `TCP_NODELAY` (command frames are tiny and latency-bound) and
    /// OS keepalive so idle NAT mappings stay alive and a dead peer is
    /// noticed early.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectTimeout`] if the dial exceeds the connect timeout
    /// - [`Error::Connect`] on any other dial failure
    pub async fn dial(
        device: &DeviceKey,
        pool_config: &PoolConfig,
        keepalive: &KeepaliveConfig,
    ) -> Result<Self> {
        let addr = device.to_socket_addr()?;

        let stream = match timeout(pool_config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::connect(device.clone(), e.to_string())),
            Err(_) => {
                return Err(Error::connect_timeout(
                    device.clone(),
                    pool_config.connect_timeout.as_millis() as u64,
                ));
            }
        };

        stream
            .set_nodelay(true)
            .map_err(|e| Error::connect(device.clone(), format!("set_nodelay: {e}")))?;

        apply_keepalive(&stream, keepalive)
            .map_err(|e| Error::connect(device.clone(), format!("keepalive: {e}")))?;

        let now = Instant::now();
        debug!(device = %device, "Dialed fresh connection");

        Ok(Self {
            stream,
            device: device.clone(),
            created_at: now,
            last_used: now,
            read_buf: Vec::new(),
        })
    }
}

// ============================================================================
// PooledConnection - Metadata
// ============================================================================

impl PooledConnection {
    /// Returns the device this transport is dialed to.
    #[inline]
    #[must_use]
    pub fn device(&self) -> &DeviceKey {
        &self.device
    }

    /// Returns the total lifetime of the transport.
    #[inline]
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns the time since the last successful exchange.
    #[inline]
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Marks the transport as just used.
    #[inline]
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Returns `true` if idle time or age exceeds the configured bounds.
    #[inline]
    #[must_use]
    pub fn is_expired(&self, idle_ttl: Duration, max_age: Duration) -> bool {
        self.idle() > idle_ttl || self.age() > max_age
    }
}

// ============================================================================
// PooledConnection - Liveness
// ============================================================================

impl PooledConnection {
    /// Probes the peer without blocking.
    ///
    /// A zero-duration timeout around `peek` turns the readiness check into
    /// a pure poll: if the socket has nothing pending the probe times out
    /// immediately and the peer is presumed alive.
    pub async fn peer_state(&mut self) -> PeerState {
        if !self.read_buf.is_empty() {
            return PeerState::StaleBytes;
        }

        let mut probe = [0u8; 64];
        match timeout(Duration::ZERO, self.stream.peek(&mut probe)).await {
            Err(_) => PeerState::Quiet,
            Ok(Ok(0)) => PeerState::Closed,
            Ok(Ok(n)) => {
                trace!(device = %self.device, bytes = n, "Stale bytes on cached connection");
                PeerState::StaleBytes
            }
            Ok(Err(e)) => {
                trace!(device = %self.device, error = %e, "Peer probe failed");
                PeerState::Failed
            }
        }
    }

    /// Drains any bytes buffered locally or pending on the socket.
    ///
    /// Returns the number of bytes thrown away. Used on the streaming path
    /// so idle-period leftovers are never parsed as stream data.
    pub async fn drain_pending(&mut self) -> usize {
        let mut drained = self.read_buf.len();
        self.read_buf.clear();

        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            match timeout(Duration::ZERO, self.stream.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => drained += n,
                // EOF, error, or nothing pending: stop draining.
                _ => break,
            }
        }

        if drained > 0 {
            debug!(device = %self.device, bytes = drained, "Drained stale bytes");
        }
        drained
    }
}

// ============================================================================
// PooledConnection - I/O
// ============================================================================

impl PooledConnection {
    /// Writes a complete frame with a single `write_all`.
    ///
    /// One write guarantees the device never observes an inter-character gap
    /// beyond its 100 ms limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on any write failure.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        trace!(device = %self.device, bytes = frame.len(), "Frame sent");
        Ok(())
    }

    /// Reads one LF-terminated line, bounded by `read_timeout`.
    ///
    /// The returned line has its terminator removed; decoding is lossy ASCII
    /// (the device occasionally emits a stray high byte on a weak link).
    ///
    /// # Errors
    ///
    /// - [`Error::ResponseTimeout`] if no complete line arrives in time
    /// - [`Error::ConnectionClosed`] on EOF mid-line
    /// - [`Error::Protocol`] if the line exceeds the size cap
    pub async fn read_line(&mut self, read_timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + read_timeout;

        loop {
            if let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.read_buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                trace!(device = %self.device, line = %text, "Line received");
                return Ok(text);
            }

            if self.read_buf.len() > MAX_LINE_BYTES {
                return Err(Error::protocol(
                    self.device.clone(),
                    format!("response line exceeds {MAX_LINE_BYTES} bytes"),
                ));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::response_timeout(
                    self.device.clone(),
                    read_timeout.as_millis() as u64,
                ));
            }

            let mut chunk = [0u8; READ_CHUNK_BYTES];
            match timeout(remaining, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(Error::connection_closed(self.device.clone())),
                Ok(Ok(n)) => self.read_buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    return Err(Error::response_timeout(
                        self.device.clone(),
                        read_timeout.as_millis() as u64,
                    ));
                }
            }
        }
    }

    /// Sends a single raw byte (the streaming stop sentinel).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on write failure.
    pub async fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.stream.write_all(&[byte]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shuts the transport down, best effort.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
        debug!(device = %self.device, "Connection closed");
    }
}

// ============================================================================
// Keepalive
// ============================================================================

/// Applies OS-level TCP keepalive to a socket.
fn apply_keepalive(stream: &TcpStream, config: &KeepaliveConfig) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(config.idle)
        .with_interval(config.interval)
        .with_retries(config.probes);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

// ============================================================================
// Tests
// ============================================================================
