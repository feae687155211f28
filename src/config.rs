//! Process-wide link configuration.
//!
//! All tunables are supplied by the external configuration store at startup
//! and handed to [`crate::ConnectionPool`], [`crate::DeviceClient`] and
//! [`crate::StreamSession`] on construction. Defaults match the observed
//! field deployment: cellular WAN links whose NAT mappings die silently
//! after a few minutes of idle.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use slm_devlink::LinkConfig;
//!
//! let config = LinkConfig::new()
//!     .with_idle_ttl(Duration::from_secs(300))
//!     .with_response_timeout(Duration::from_secs(3));
//! assert!(config.pool.enabled);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// PoolConfig
// ============================================================================

/// Connection pool tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Master switch; a disabled pool refuses every acquire.
    pub enabled: bool,

    /// Maximum time a cached connection may sit unused before it is
    /// considered unusable.
    pub idle_ttl: Duration,

    /// Maximum total lifetime of a cached connection regardless of activity.
    pub max_age: Duration,

    /// Period of the background eviction sweep.
    pub sweep_interval: Duration,

    /// Bound on a single TCP dial.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_ttl: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// KeepaliveConfig
// ============================================================================

/// TCP keepalive tunables.
///
/// Keepalive probes keep cellular NAT mappings alive on otherwise idle
/// transports and detect a dead peer early. Applied to every socket the
/// link opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe.
    pub idle: Duration,

    /// Interval between probes once probing has started.
    pub interval: Duration,

    /// Failed probes before the peer is declared dead.
    pub probes: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            probes: 3,
        }
    }
}

// ============================================================================
// CommandConfig
// ============================================================================

/// Command client tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Minimum spacing between commands to one device. The device drops or
    /// garbles commands that arrive faster.
    pub min_spacing: Duration,

    /// Bound on reading each response line.
    pub response_timeout: Duration,

    /// Whether a transport failure is retried once on a fresh connection
    /// before being surfaced. Disabling trades transparent stale-connection
    /// repair for one dial less of latency on a truly unreachable device.
    pub retry_on_transport_failure: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_secs(1),
            response_timeout: Duration::from_secs(3),
            retry_on_transport_failure: true,
        }
    }
}

// ============================================================================
// LinkConfig
// ============================================================================

/// Aggregate configuration for the device link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Connection pool tunables.
    pub pool: PoolConfig,

    /// TCP keepalive tunables.
    pub keepalive: KeepaliveConfig,

    /// Command client tunables.
    pub command: CommandConfig,
}

// ============================================================================
// LinkConfig - Builder Methods
// ============================================================================

impl LinkConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disables the connection pool master switch.
    #[inline]
    #[must_use]
    pub fn with_pool_disabled(mut self) -> Self {
        self.pool.enabled = false;
        self
    }

    /// Sets the pool idle TTL.
    #[inline]
    #[must_use]
    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.pool.idle_ttl = idle_ttl;
        self
    }

    /// Sets the maximum connection age.
    #[inline]
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.pool.max_age = max_age;
        self
    }

    /// Sets the eviction sweep period.
    #[inline]
    #[must_use]
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.pool.sweep_interval = sweep_interval;
        self
    }

    /// Sets the TCP connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.pool.connect_timeout = connect_timeout;
        self
    }

    /// Sets the minimum per-device command spacing.
    #[inline]
    #[must_use]
    pub fn with_min_spacing(mut self, min_spacing: Duration) -> Self {
        self.command.min_spacing = min_spacing;
        self
    }

    /// Sets the response timeout.
    #[inline]
    #[must_use]
    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.command.response_timeout = response_timeout;
        self
    }

    /// Disables the transparent retry on transport failure.
    #[inline]
    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.command.retry_on_transport_failure = false;
        self
    }

    /// Sets the keepalive parameters.
    #[inline]
    #[must_use]
    pub fn with_keepalive(mut self, idle: Duration, interval: Duration, probes: u32) -> Self {
        self.keepalive = KeepaliveConfig {
            idle,
            interval,
            probes,
        };
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
