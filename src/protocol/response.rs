//! Result codes and command results.
//!
//! The first line of every response is `R+` followed by four decimal digits.
//! Request commands are followed by a second line carrying comma-separated
//! payload fields. An idle device may re-emit its `$ ` prompt ahead of
//! either line; [`strip_prompt`] removes it before parsing.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// ResultCode
// ============================================================================

/// Four-digit device result code following `R+`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// `R+0000`: command accepted.
    Ok,
    /// `R+0001`: command not recognized.
    CommandError,
    /// `R+0002`: parameter value invalid.
    ParameterError,
    /// `R+0003`: command not supported by this device model.
    SpecError,
    /// `R+0004`: device is in the wrong state for this command.
    StatusError,
}

impl ResultCode {
    /// Parses a result line (prompt already stripped).
    ///
    /// Returns `None` for anything that is not one of the five known codes.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "R+0000" => Some(Self::Ok),
            "R+0001" => Some(Self::CommandError),
            "R+0002" => Some(Self::ParameterError),
            "R+0003" => Some(Self::SpecError),
            "R+0004" => Some(Self::StatusError),
            _ => None,
        }
    }

    /// Returns the wire representation (`R+0000` through `R+0004`).
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "R+0000",
            Self::CommandError => "R+0001",
            Self::ParameterError => "R+0002",
            Self::SpecError => "R+0003",
            Self::StatusError => "R+0004",
        }
    }

    /// Returns a human-readable description of the code.
    #[must_use]
    pub const fn meaning(self) -> &'static str {
        match self {
            Self::Ok => "success",
            Self::CommandError => "command error - device did not recognize command",
            Self::ParameterError => "parameter error - invalid parameter value",
            Self::SpecError => "spec error - command not supported by this device model",
            Self::StatusError => "status error - device is in wrong state for this command",
        }
    }

    /// Returns `true` for `R+0000`.
    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CommandResult
// ============================================================================

/// Outcome of one command exchange.
///
/// A non-success code is a completed protocol exchange, not a transport
/// failure: the command client returns it to the caller unmodified and never
/// retries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Device result code.
    pub code: ResultCode,

    /// Payload line for request commands (`None` for setting commands and
    /// for non-success results).
    pub payload: Option<String>,
}

impl CommandResult {
    /// Creates a result with no payload line.
    #[inline]
    #[must_use]
    pub const fn new(code: ResultCode) -> Self {
        Self {
            code,
            payload: None,
        }
    }

    /// Creates a success result carrying a payload line.
    #[inline]
    #[must_use]
    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Ok,
            payload: Some(payload.into()),
        }
    }

    /// Returns `true` if the device accepted the command.
    #[inline]
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Splits the payload into trimmed, non-empty comma-separated fields.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        self.payload
            .as_deref()
            .map(|p| {
                p.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ============================================================================
// Prompt Stripping
// ============================================================================

/// Strips a leading `$` prompt and surrounding whitespace from a line.
///
/// A device that sat idle re-emits its prompt character ahead of the next
/// response line; it is never part of the response itself.
#[must_use]
pub fn strip_prompt(line: &str) -> &str {
    let line = line.trim();
    line.strip_prefix('$').map_or(line, str::trim_start)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_parse_known_codes() {
        assert_eq!(ResultCode::parse("R+0000"), Some(ResultCode::Ok));
        assert_eq!(ResultCode::parse("R+0001"), Some(ResultCode::CommandError));
        assert_eq!(
            ResultCode::parse("R+0002"),
            Some(ResultCode::ParameterError)
        );
        assert_eq!(ResultCode::parse("R+0003"), Some(ResultCode::SpecError));
        assert_eq!(ResultCode::parse("R+0004"), Some(ResultCode::StatusError));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(ResultCode::parse("R+0005"), None);
        assert_eq!(ResultCode::parse("R-0000"), None);
        assert_eq!(ResultCode::parse(""), None);
        assert_eq!(ResultCode::parse("OK"), None);
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        assert_eq!(ResultCode::parse("  R+0000 \r"), Some(ResultCode::Ok));
    }

    #[test]
    fn test_strip_prompt() {
        assert_eq!(strip_prompt("$ R+0000"), "R+0000");
        assert_eq!(strip_prompt("$R+0000"), "R+0000");
        assert_eq!(strip_prompt("R+0000"), "R+0000");
        assert_eq!(strip_prompt("  $ 12.3, 45.6 "), "12.3, 45.6");
    }

    #[test]
    fn test_fields_split() {
        let result = CommandResult::with_payload(" 53.4, 54.1,, 60.2 ,48.9");
        assert_eq!(result.fields(), vec!["53.4", "54.1", "60.2", "48.9"]);
    }

    #[test]
    fn test_fields_empty_without_payload() {
        let result = CommandResult::new(ResultCode::StatusError);
        assert!(result.fields().is_empty());
        assert!(!result.is_ok());
    }

    #[test]
    fn test_display_roundtrip() {
        for code in [
            ResultCode::Ok,
            ResultCode::CommandError,
            ResultCode::ParameterError,
            ResultCode::SpecError,
            ResultCode::StatusError,
        ] {
            assert_eq!(ResultCode::parse(code.as_str()), Some(code));
        }
    }

    proptest! {
        // Arbitrary junk must never parse as a result code unless it is
        // exactly one of the five known lines.
        #[test]
        fn prop_parse_only_known_lines(line in "\\PC{0,16}") {
            let parsed = ResultCode::parse(&line);
            let trimmed = line.trim();
            let known = ["R+0000", "R+0001", "R+0002", "R+0003", "R+0004"];
            prop_assert_eq!(parsed.is_some(), known.contains(&trimmed));
        }
    }
}
