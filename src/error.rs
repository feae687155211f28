//! Error types for the device link.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use slm_devlink::{Result, DeviceClient, DeviceKey};
//!
//! async fn example(client: &DeviceClient, key: &DeviceKey) -> Result<()> {
//!     let snapshot = client.snapshot(key).await?;
//!     println!("{}", snapshot.raw());
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::PoolDisabled`], [`Error::UnknownDevice`] |
//! | Transport | [`Error::Connect`], [`Error::ConnectTimeout`], [`Error::ResponseTimeout`], [`Error::ConnectionClosed`], [`Error::Io`] |
//! | Transport (terminal) | [`Error::RetryExhausted`] |
//! | Protocol | [`Error::Protocol`], [`Error::Device`] |
//!
//! Transport errors are recovered locally by the command client (discard +
//! one retry on a fresh connection). [`Error::RetryExhausted`] marks the
//! point where recovery gave up: the wrapped source is the *retry's* failure,
//! so external monitoring can tell a device that fails reproducibly from one
//! that failed once on a stale connection.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::DeviceKey;
use crate::protocol::ResultCode;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes the device the operation targeted where one exists.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when link configuration is invalid (bad host, out-of-range
    /// poll interval, zero timeout).
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// The connection pool master switch is off.
    ///
    /// Returned by `acquire` when the pool was constructed disabled.
    #[error("Connection pool is disabled")]
    PoolDisabled,

    /// No configuration exists for the device key.
    ///
    /// Returned by the scheduler for devices it has never been given.
    #[error("Unknown device: {device}")]
    UnknownDevice {
        /// The unconfigured device.
        device: DeviceKey,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// TCP connect to the device failed.
    #[error("Connect to {device} failed: {message}")]
    Connect {
        /// Target device.
        device: DeviceKey,
        /// Description of the dial failure.
        message: String,
    },

    /// TCP connect did not complete within the connect timeout.
    #[error("Connect to {device} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Target device.
        device: DeviceKey,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The device did not produce a complete response line in time.
    #[error("{device} did not respond within {timeout_ms}ms")]
    ResponseTimeout {
        /// Target device.
        device: DeviceKey,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The peer closed the connection mid-exchange.
    #[error("Connection to {device} closed")]
    ConnectionClosed {
        /// Target device.
        device: DeviceKey,
    },

    /// A transport failure survived the transparent retry.
    ///
    /// The wrapped source is the failure of the retry attempt on a freshly
    /// dialed connection, never the first attempt's.
    #[error("Command to {device} failed after retry on a fresh connection: {source}")]
    RetryExhausted {
        /// Target device.
        device: DeviceKey,
        /// The retry attempt's own failure.
        source: Box<Error>,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Response did not match the line protocol.
    ///
    /// Returned for an unrecognized result line or a malformed payload.
    #[error("Protocol error from {device}: {message}")]
    Protocol {
        /// Responding device.
        device: DeviceKey,
        /// Description of the protocol violation.
        message: String,
    },

    /// The device answered with a non-success result code.
    ///
    /// This is a protocol-level outcome, not a transport failure: the
    /// exchange completed and is never retried.
    #[error("{device} returned {code}: {}", .code.meaning())]
    Device {
        /// Responding device.
        device: DeviceKey,
        /// The non-success result code.
        code: ResultCode,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an unknown device error.
    #[inline]
    pub fn unknown_device(device: DeviceKey) -> Self {
        Self::UnknownDevice { device }
    }

    /// Creates a connect error.
    #[inline]
    pub fn connect(device: DeviceKey, message: impl Into<String>) -> Self {
        Self::Connect {
            device,
            message: message.into(),
        }
    }

    /// Creates a connect timeout error.
    #[inline]
    pub fn connect_timeout(device: DeviceKey, timeout_ms: u64) -> Self {
        Self::ConnectTimeout { device, timeout_ms }
    }

    /// Creates a response timeout error.
    #[inline]
    pub fn response_timeout(device: DeviceKey, timeout_ms: u64) -> Self {
        Self::ResponseTimeout { device, timeout_ms }
    }

    /// Creates a connection closed error.
    #[inline]
    pub fn connection_closed(device: DeviceKey) -> Self {
        Self::ConnectionClosed { device }
    }

    /// Wraps a retry attempt's failure.
    #[inline]
    pub fn retry_exhausted(device: DeviceKey, source: Error) -> Self {
        Self::RetryExhausted {
            device,
            source: Box::new(source),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(device: DeviceKey, message: impl Into<String>) -> Self {
        Self::Protocol {
            device,
            message: message.into(),
        }
    }

    /// Creates a device result-code error.
    #[inline]
    pub fn device(device: DeviceKey, code: ResultCode) -> Self {
        Self::Device { device, code }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::ResponseTimeout { .. }
        )
    }

    /// Returns `true` if this is a transport-level failure.
    ///
    /// Transport failures are candidates for the command client's
    /// discard-and-retry recovery; protocol and configuration errors are not.
    #[inline]
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::ResponseTimeout { .. }
                | Self::ConnectionClosed { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if a transport failure survived the retry.
    ///
    /// A device that repeatedly produces this has stopped accepting control
    /// commands outright, rather than merely holding a stale NAT mapping.
    #[inline]
    #[must_use]
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
