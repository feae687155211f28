//! Type-safe device identity.
//!
//! A device is addressed by its control endpoint (host + TCP control port).
//! The key is stable for the process lifetime of a configuration entry and
//! is used to index the connection pool, the command spacing table, and the
//! polling scheduler.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Standard control port for NL-43 class instruments.
pub const DEFAULT_CONTROL_PORT: u16 = 2255;

// ============================================================================
// DeviceKey
// ============================================================================

/// Identity of a device: host and TCP control port.
///
/// Used as the key for the connection pool, the command client's spacing
/// table, and the polling scheduler. Two keys are equal iff both host and
/// port are equal; no DNS normalization is performed.
///
/// # Example
///
/// ```
/// use slm_devlink::DeviceKey;
///
/// let key = DeviceKey::new("192.168.0.10", 2255);
/// assert_eq!(key.to_string(), "192.168.0.10:2255");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Hostname or IP address of the device.
    host: String,

    /// TCP control port (standard: 2255).
    port: u16,
}

// ============================================================================
// DeviceKey - Constructors
// ============================================================================

impl DeviceKey {
    /// Creates a new device key.
    #[inline]
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Creates a device key on the standard control port.
    #[inline]
    #[must_use]
    pub fn with_default_port(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_CONTROL_PORT)
    }
}

// ============================================================================
// DeviceKey - Accessors
// ============================================================================

impl DeviceKey {
    /// Returns the device host.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the control port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the key to a socket address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the host does not resolve.
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::config(format!("cannot resolve {self}: {e}")))?
            .next()
            .ok_or_else(|| Error::config(format!("no address for {self}")))
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Tests
// ============================================================================
