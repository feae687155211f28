//! Command frames and wire encoding.
//!
//! Every frame is plain ASCII terminated by CR LF. Two shapes exist:
//!
//! - **Setting**: `Command,Param` changes device state and is answered by a
//!   result line only (`Measure,Start`, `Measure,Stop`).
//! - **Request**: `Command?` queries the device and is answered by a result
//!   line followed by one comma-separated payload line (`DOD?`, `DRD?`).
//!
//! The device enforces a maximum inter-character gap of 100 ms within a
//! frame; the transport always writes a frame with a single `write_all`, so
//! no gap can occur.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Frame terminator: CR (0x0D) LF (0x0A).
pub const CRLF: &[u8] = b"\r\n";

/// Single byte that terminates a streaming session (SUB, 0x1A).
pub const STOP_SENTINEL: u8 = 0x1A;

// ============================================================================
// Command
// ============================================================================

/// A single protocol command.
///
/// # Example
///
/// ```
/// use slm_devlink::protocol::Command;
///
/// assert_eq!(Command::request("DOD").encode(), b"DOD?\r\n");
/// assert_eq!(Command::set("Measure", "Start").encode(), b"Measure,Start\r\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Setting command: `Command,Param`.
    Set {
        /// Command name (for example `Measure`).
        name: String,
        /// Parameter value (for example `Start`).
        param: String,
    },

    /// Request command: `Command?`.
    Request {
        /// Command name (for example `DOD`).
        name: String,
    },
}

// ============================================================================
// Command - Constructors
// ============================================================================

impl Command {
    /// Creates a setting command (`name,param`).
    #[inline]
    #[must_use]
    pub fn set(name: impl Into<String>, param: impl Into<String>) -> Self {
        Self::Set {
            name: name.into(),
            param: param.into(),
        }
    }

    /// Creates a request command (`name?`).
    #[inline]
    #[must_use]
    pub fn request(name: impl Into<String>) -> Self {
        Self::Request { name: name.into() }
    }

    /// On-demand display snapshot request.
    #[inline]
    #[must_use]
    pub fn dod() -> Self {
        Self::request("DOD")
    }

    /// Continuous streaming request.
    #[inline]
    #[must_use]
    pub fn drd() -> Self {
        Self::request("DRD")
    }

    /// Starts a measurement.
    #[inline]
    #[must_use]
    pub fn measure_start() -> Self {
        Self::set("Measure", "Start")
    }

    /// Stops the running measurement.
    #[inline]
    #[must_use]
    pub fn measure_stop() -> Self {
        Self::set("Measure", "Stop")
    }
}

// ============================================================================
// Command - Accessors
// ============================================================================

impl Command {
    /// Returns the command name without parameter or `?` suffix.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Set { name, .. } | Self::Request { name } => name,
        }
    }

    /// Returns `true` if the device answers this command with a payload line.
    #[inline]
    #[must_use]
    pub fn expects_payload(&self) -> bool {
        matches!(self, Self::Request { .. })
    }

    /// Encodes the command as a wire frame terminated by CR LF.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = match self {
            Self::Set { name, param } => format!("{name},{param}").into_bytes(),
            Self::Request { name } => format!("{name}?").into_bytes(),
        };
        frame.extend_from_slice(CRLF);
        frame
    }

    /// Validates that the command text is wire-safe.
    ///
    /// The protocol is pure ASCII; CR, LF, the `?` / `,` structure characters
    /// and the stop sentinel must not appear inside names or parameters.
    ///
    /// # Errors
    ///
    /// Returns a description of the offending character.
    pub fn validate(&self) -> Result<(), String> {
        let (name, param) = match self {
            Self::Set { name, param } => (name.as_str(), Some(param.as_str())),
            Self::Request { name } => (name.as_str(), None),
        };

        if name.is_empty() {
            return Err("command name is empty".to_owned());
        }

        for text in [Some(name), param].into_iter().flatten() {
            for ch in text.chars() {
                if !ch.is_ascii() || ch.is_ascii_control() || matches!(ch, '?' | ',') {
                    return Err(format!("invalid character {ch:?} in {text:?}"));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set { name, param } => write!(f, "{name},{param}"),
            Self::Request { name } => write!(f, "{name}?"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
