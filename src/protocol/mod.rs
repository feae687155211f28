//! Line protocol message types.
//!
//! This module defines the ASCII command protocol spoken by NL-43 class
//! instruments over their TCP control port.
//!
//! # Protocol Overview
//!
//! | Message | Direction | Format |
//! |---------|-----------|--------|
//! | Command frame | Host → Device | ASCII text + CR LF |
//! | Result line | Device → Host | `R+` + four decimal digits |
//! | Payload line | Device → Host | Comma-separated fields (request commands only) |
//! | Stop sentinel | Host → Device | Single byte 0x1A (ends a stream) |
//!
//! Setting commands encode as `Command,Param` (for example `Measure,Start`);
//! request commands encode as `Command?` (for example `DOD?`). A device that
//! sat idle may re-emit its `$ ` prompt ahead of a line; parsers strip it.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Command frames and encoding |
//! | `response` | Result codes and command results |

// ============================================================================
// Submodules
// ============================================================================

/// Command frames and wire encoding.
pub mod command;

/// Result codes and command results.
pub mod response;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{CRLF, Command, STOP_SENTINEL};
pub use response::{CommandResult, ResultCode, strip_prompt};
