//! Atomic Hardware Capabilities
//!
//! Instead of one monolithic trait per device class, adapters implement the
//! capabilities they actually support:
//!
//! - an XY stage implements: `XyStage`
//! - a Z drive with a ring buffer implements: `Stage + Sequenceable`
//! - an autofocus unit implements: `Autofocus`
//! - an LED or laser implements: `ShutterControl`, lasers also `EmissionControl` and
//!   `WavelengthSelect`
//! - a turret implements: `StateDevice`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses [`crate::error::Result`] for errors
//! - Focuses on ONE thing

use crate::error::{DaqError, Result};
use async_trait::async_trait;
use std::time::Duration;

// =============================================================================
// Motion
// =============================================================================

/// Capability: Two-axis stage.
///
/// # Contract
/// - Positions are in micrometres
/// - Moves return once the controller accepted the command, not when motion ends
/// - `wait_settled` polls until the controller reports idle or a deadline passes
#[async_trait]
pub trait XyStage: Send + Sync {
    /// Move both axes to an absolute position.
    async fn set_position_um(&self, x: f64, y: f64) -> Result<()>;

    /// Move both axes relative to the current position.
    async fn set_relative_position_um(&self, dx: f64, dy: f64) -> Result<()>;

    /// Current position.
    async fn position_um(&self) -> Result<(f64, f64)>;

    /// Declare the current position the origin.
    async fn set_origin(&self) -> Result<()>;

    /// Drive to the limit switches.
    async fn home(&self) -> Result<()>;

    /// Halt motion immediately.
    async fn stop(&self) -> Result<()>;

    /// Wait for motion to finish.
    async fn wait_settled(&self) -> Result<()>;
}

/// Capability: Single-axis stage (focus drive).
#[async_trait]
pub trait Stage: Send + Sync {
    /// Move to an absolute position in micrometres.
    async fn set_position_um(&self, position: f64) -> Result<()>;

    /// Current position in micrometres.
    async fn position_um(&self) -> Result<f64>;

    /// Declare the current position the origin.
    async fn set_origin(&self) -> Result<()>;
}

/// Capability: Hardware-triggered position sequences.
///
/// The sequence is built locally with `add_to_sequence`, uploaded with
/// `send_sequence` and played back on external triggers after `start_sequence`.
#[async_trait]
pub trait Sequenceable: Send + Sync {
    /// Maximum number of entries the device stores.
    fn sequence_max_length(&self) -> usize;

    /// Clear the local and device-side sequence.
    async fn clear_sequence(&self) -> Result<()>;

    /// Append one position (micrometres) to the local sequence.
    async fn add_to_sequence(&self, position: f64) -> Result<()>;

    /// Upload the local sequence to the device.
    async fn send_sequence(&self) -> Result<()>;

    /// Arm trigger-driven playback.
    async fn start_sequence(&self) -> Result<()>;

    /// Disarm playback.
    async fn stop_sequence(&self) -> Result<()>;
}

// =============================================================================
// Autofocus
// =============================================================================

/// Capability: Hardware autofocus.
#[async_trait]
pub trait Autofocus: Send + Sync {
    /// Turn continuous focus locking on or off.
    async fn set_continuous_focusing(&self, on: bool) -> Result<()>;

    /// Whether continuous focusing is currently engaged.
    async fn continuous_focusing(&self) -> Result<bool>;

    /// Whether the unit reports a lock.
    async fn is_locked(&self) -> Result<bool>;

    /// Lock once, then release.
    async fn full_focus(&self) -> Result<()>;

    /// Refine an existing focus.
    async fn incremental_focus(&self) -> Result<()>;

    /// Score of the most recent focus.
    async fn last_focus_score(&self) -> Result<f64>;

    /// Current focus score.
    async fn current_focus_score(&self) -> Result<f64> {
        self.last_focus_score().await
    }

    /// Focus offset in device units.
    ///
    /// # Default Implementation
    /// Returns `UnsupportedCommand`.
    async fn offset(&self) -> Result<f64> {
        Err(DaqError::UnsupportedCommand("focus offset".into()))
    }

    /// Set the focus offset.
    async fn set_offset(&self, _offset: f64) -> Result<()> {
        Err(DaqError::UnsupportedCommand("focus offset".into()))
    }
}

// =============================================================================
// Light sources
// =============================================================================

/// Capability: Shutter Control
///
/// For LEDs and lasers without a mechanical shutter the "shutter" switches the
/// output itself.
#[async_trait]
pub trait ShutterControl: Send + Sync {
    /// Open the shutter (allow light to pass)
    ///
    /// # Safety
    /// Opening a laser shutter creates an immediate eye/skin hazard.
    async fn open_shutter(&self) -> Result<()>;

    /// Close the shutter (block light)
    async fn close_shutter(&self) -> Result<()>;

    /// Query shutter state
    async fn is_shutter_open(&self) -> Result<bool>;

    /// Open for `duration`, then close.
    ///
    /// # Default Implementation
    /// Open, sleep, close. Not cancellable.
    async fn fire(&self, duration: Duration) -> Result<()> {
        self.open_shutter().await?;
        tokio::time::sleep(duration).await;
        self.close_shutter().await
    }
}

/// Capability: Emission Control
///
/// Switches the source itself on and off (all lasers of a multi-laser unit).
#[async_trait]
pub trait EmissionControl: Send + Sync {
    /// Enable emission
    ///
    /// # Safety
    /// Requires proper PPE and a verified beam path.
    async fn enable_emission(&self) -> Result<()>;

    /// Disable emission
    async fn disable_emission(&self) -> Result<()>;

    /// Query emission state
    async fn is_emission_enabled(&self) -> Result<bool>;
}

/// Capability: Selecting one of several fixed wavelengths.
#[async_trait]
pub trait WavelengthSelect: Send + Sync {
    /// Wavelength labels in the order the device reported them.
    fn wavelengths(&self) -> Vec<String>;

    /// Currently selected wavelength label.
    fn active_wavelength(&self) -> Option<String>;

    /// Make `wavelength` the active output.
    async fn select_wavelength(&self, wavelength: &str) -> Result<()>;
}

// =============================================================================
// Discrete positions
// =============================================================================

/// Capability: Device with a fixed number of discrete positions.
#[async_trait]
pub trait StateDevice: Send + Sync {
    /// Number of positions.
    fn position_count(&self) -> usize;

    /// Label of `position`.
    fn label(&self, position: usize) -> Option<String>;

    /// Move to `position` (zero-based).
    async fn set_state(&self, position: usize) -> Result<()>;

    /// Current position (zero-based).
    async fn state(&self) -> Result<usize>;
}
