//! TCP transport layer.
//!
//! Internal module handling the per-device connection pool and the dedicated
//! streaming transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            ConnectionPool                │
//! │  ┌────────────────────────────────────┐  │
//! │  │ 10.0.0.5:2255  → PooledConnection  │  │
//! │  │ 10.0.0.7:2255  → PooledConnection  │  │
//! │  │ meter-03:2255  → (empty slot)      │  │
//! │  └────────────────────────────────────┘  │
//! └──────────────────────────────────────────┘
//!          StreamSession (not pooled)
//! ```
//!
//! At most one physical connection exists per device. A [`ConnectionLease`]
//! holds the device's exchange lock for the duration of one command, so the
//! eviction sweep can never touch a connection a caller is using. The
//! [`StreamSession`] bypasses the pool because it holds its transport open
//! indefinitely.

// ============================================================================
// Submodules
// ============================================================================

/// Pooled connection and liveness checks.
pub mod connection;

/// Per-device connection pool.
pub mod pool;

/// Dedicated streaming transport.
pub mod stream;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{PeerState, PooledConnection};
pub use pool::{ConnectionDiagnostics, ConnectionLease, ConnectionPool};
pub use stream::{StreamFrame, StreamSession};
