//! slm-devlink - Device communication layer for sound level meter fleets.
//!
//! This library talks to remote acoustic measurement instruments (NL-43
//! class sound level meters) over their line-oriented ASCII TCP control
//! protocol, typically across cellular WAN links with NAT and intermittent
//! connectivity.
//!
//! # Architecture
//!
//! Many concurrent callers are multiplexed onto at most one physical
//! connection per device:
//!
//! - [`ConnectionPool`] owns one transport per device, silently repairing
//!   staleness caused by idle NAT timeouts or device faults
//! - [`DeviceClient`] frames commands, parses the two-line response,
//!   enforces per-device command spacing, and retries once on transport
//!   failure
//! - [`StreamSession`] holds a dedicated, non-pooled transport for
//!   continuous output
//! - [`Poller`] keeps a reachability/health picture of every configured
//!   device on its own interval
//!
//! Key design principles:
//!
//! - Per-device mutual exclusion, never a global lock: one wedged device
//!   cannot stall work for others
//! - Every I/O wait is bounded by a timeout
//! - A transport failure is presumed staleness first: discard, redial,
//!   retry once, and only then surface the failure
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use slm_devlink::{
//!     ConnectionPool, DeviceClient, DeviceKey, LinkConfig, Poller, PollConfig, Result,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = LinkConfig::default();
//!     let pool = ConnectionPool::new(config.pool.clone(), config.keepalive.clone());
//!     let client = Arc::new(DeviceClient::new(Arc::clone(&pool), config.command.clone()));
//!
//!     // On-demand command
//!     let key = DeviceKey::new("192.168.0.10", 2255);
//!     let snapshot = client.snapshot(&key).await?;
//!     println!("reading: {}", snapshot.raw());
//!
//!     // Background health polling
//!     let poller = Poller::new(Arc::clone(&client));
//!     poller.set_config(&key, PollConfig::default())?;
//!     poller.start();
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Protocol command client: [`DeviceClient`], [`Snapshot`] |
//! | [`config`] | Process-wide tunables |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe device identity |
//! | [`poller`] | Background polling scheduler |
//! | [`protocol`] | Line protocol message types |
//! | [`transport`] | TCP transport layer (pool + streaming) |

// ============================================================================
// Modules
// ============================================================================

/// Protocol command client.
///
/// [`DeviceClient`] is the single entry point for on-demand commands and
/// the scheduler's status polls.
pub mod client;

/// Process-wide link configuration.
///
/// Supplied by the external configuration store at startup.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe device identity.
///
/// [`DeviceKey`] addresses one instrument's control endpoint.
pub mod identifiers;

/// Background polling scheduler.
///
/// Keeps [`PollState`] current for every enabled device.
pub mod poller;

/// Line protocol message types.
///
/// Command framing and response parsing for the device's ASCII protocol.
pub mod protocol;

/// TCP transport layer.
///
/// Internal module handling the connection pool and streaming transport.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{DeviceClient, Snapshot};

// Configuration types
pub use config::{CommandConfig, KeepaliveConfig, LinkConfig, PoolConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{DEFAULT_CONTROL_PORT, DeviceKey};

// Poller types
pub use poller::{PollConfig, PollState, Poller};

// Protocol types
pub use protocol::{Command, CommandResult, ResultCode};

// Transport types
pub use transport::{ConnectionDiagnostics, ConnectionPool, StreamFrame, StreamSession};
