//! Error types shared by every device driver.
//!
//! This module defines `DaqError`, the single error type produced by the transport,
//! codec, polling and driver layers. Using the `thiserror` crate it gives drivers a
//! consistent vocabulary for the ways a serial round trip or a device state machine
//! can fail.
//!
//! ## Error Hierarchy
//!
//! - **`CommunicationFailure`**: the transport timed out, returned no bytes or hit an I/O
//!   error. Any cached state confirmed by the device must be considered stale afterwards.
//! - **`Protocol`**: a reply arrived but matched neither the acknowledge nor the
//!   negative-acknowledge grammar of the dialect.
//! - **`Device`**: the device rejected a command with a numeric code. The code is already
//!   translated into the local code space (vendor code plus the dialect offset).
//! - **`NotCalibrated`** / **`NotLocked`**: autofocus state-machine outcomes.
//! - **`UnsupportedCommand`**: the controller does not know the command, or the firmware
//!   lacks the feature.
//! - **`ProtocolMismatch`**: neither the modern nor the legacy framing got an answer.
//! - **`Timeout`**: a wait for a hardware transition exhausted its deadline.
//! - **`Cancelled`**: a long-running operation observed its cancellation token.
//! - **`InvalidParameter`** / **`Configuration`**: caller supplied bad values.
//!
//! Driver code returns [`Result<T>`]; the composition root wraps these in `anyhow`
//! with context.

use std::time::Duration;
use thiserror::Error;

/// Offset added to negative-acknowledge codes reported by ASI controllers.
///
/// `:N-21` therefore surfaces as `Device { code: 10079 }`.
pub const ASI_ERR_OFFSET: i32 = 10100;

// =============================================================================
// Error Kind (for logging and metrics labels)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Communication,
    Protocol,
    Device,
    Autofocus,
    Unsupported,
    Timeout,
    Cancelled,
    InvalidParameter,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Communication => "communication",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Device => "device",
            ErrorKind::Autofocus => "autofocus",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidParameter => "invalid_parameter",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, DaqError>;

/// Primary error type for device drivers.
///
/// # Error Categories
///
/// 1. **Link errors** - `CommunicationFailure`, `ProtocolMismatch`
///    - The serial link did not carry a usable answer
///    - Recovery: check cabling and port settings, re-run detection
///
/// 2. **Reply errors** - `Protocol`, `Device`, `UnsupportedCommand`
///    - The controller answered, but not with success
///    - Recovery: inspect the code, correct the command or firmware settings
///
/// 3. **State-machine errors** - `NotCalibrated`, `NotLocked`, `Cancelled`
///    - A composite operation could not reach its goal
///    - Recovery: recalibrate, refocus, or retry after the cancelling condition clears
///
/// # Example
///
/// ```rust
/// use daq_core::error::{DaqError, Result};
///
/// fn check_speed(mm_per_s: f64) -> Result<f64> {
///     if !(0.0..=7.5).contains(&mm_per_s) {
///         return Err(DaqError::InvalidParameter(format!(
///             "speed {mm_per_s} mm/s outside 0..=7.5"
///         )));
///     }
///     Ok(mm_per_s)
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    /// The transport could not complete the round trip.
    ///
    /// Covers read timeouts, zero-byte reads and operating-system I/O errors.
    ///
    /// **Error Type**: Usually transient.
    ///
    /// **Recovery Strategy**: Retry once the link is healthy. Any `Confirmed` state
    /// cached by the caller is stale.
    #[error("Communication failure on {port}: {message}")]
    CommunicationFailure {
        /// Port name the exchange ran on
        port: String,
        /// What went wrong
        message: String,
    },

    /// The reply matched none of the grammars the dialect knows.
    ///
    /// Includes garbled replies and state characters missing from a decode table.
    #[error("Unrecognized reply: {0:?}")]
    Protocol(String),

    /// The controller rejected the command with a numeric code.
    ///
    /// The code lives in the local code space, see [`ASI_ERR_OFFSET`].
    #[error("Device reported error code {code}")]
    Device {
        /// Local error code
        code: i32,
    },

    /// Autofocus calibration did not reach a good state.
    #[error("Autofocus is not calibrated")]
    NotCalibrated,

    /// Autofocus did not reach lock within the allotted time.
    #[error("Autofocus failed to lock within {0:?}")]
    NotLocked(Duration),

    /// The controller does not support the command or feature.
    #[error("Command not supported by this controller: {0}")]
    UnsupportedCommand(String),

    /// Neither the modern nor the legacy framing produced an answer.
    #[error("Controller did not answer in any known protocol on {0}")]
    ProtocolMismatch(String),

    /// The hardware did not finish a transition (motion, settling) in time.
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// Time budget that ran out
        after: Duration,
    },

    /// A long-running operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// A caller-supplied value was out of range or malformed.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Driver configuration is semantically wrong.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl DaqError {
    /// Build a communication failure for `port`.
    pub fn communication(port: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::CommunicationFailure {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Label used in structured log fields.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::CommunicationFailure { .. } | DaqError::ProtocolMismatch(_) => {
                ErrorKind::Communication
            }
            DaqError::Protocol(_) => ErrorKind::Protocol,
            DaqError::Device { .. } => ErrorKind::Device,
            DaqError::NotCalibrated | DaqError::NotLocked(_) => ErrorKind::Autofocus,
            DaqError::UnsupportedCommand(_) => ErrorKind::Unsupported,
            DaqError::Timeout { .. } => ErrorKind::Timeout,
            DaqError::Cancelled => ErrorKind::Cancelled,
            DaqError::InvalidParameter(_) | DaqError::Configuration(_) => {
                ErrorKind::InvalidParameter
            }
        }
    }

    /// True when the link itself failed and cached device state must be dropped.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, DaqError::CommunicationFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_displays_local_code() {
        let err = DaqError::Device { code: ASI_ERR_OFFSET - 21 };
        assert_eq!(err.to_string(), "Device reported error code 10079");
        assert_eq!(err.kind(), ErrorKind::Device);
    }

    #[test]
    fn link_failure_is_flagged() {
        let err = DaqError::communication("COM3", "read timed out");
        assert!(err.is_link_failure());
        assert_eq!(err.kind().to_string(), "communication");
        assert!(!DaqError::NotCalibrated.is_link_failure());
    }
}
