//! Driver Factory and Component Types
//!
//! Drivers implement [`DriverFactory`] and are registered with the device registry at
//! startup via explicit `registry.register_factory(factory)` calls.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Composition Root (main.rs)                    │
//! │  registry.register_factory(AsiXyStageFactory);                  │
//! │  registry.register_factory(SkyraFactory);                       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DeviceRegistry                           │
//! │  factories: HashMap<driver_type, Box<dyn DriverFactory>>        │
//! │  devices: HashMap<device_id, DeviceComponents>                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    DriverFactory::build()                       │
//! │  Parses TOML config, initializes driver, returns capabilities   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::capabilities::{
    Autofocus, EmissionControl, Sequenceable, ShutterControl, Stage, StateDevice,
    WavelengthSelect, XyStage,
};
use crate::device::Device;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Two-axis motion, see [`crate::capabilities::XyStage`]
    XyStage,
    /// Single-axis motion, see [`crate::capabilities::Stage`]
    Stage,
    /// Triggered position sequences, see [`crate::capabilities::Sequenceable`]
    Sequenceable,
    /// Hardware autofocus, see [`crate::capabilities::Autofocus`]
    Autofocus,
    /// Shutter or output gate, see [`crate::capabilities::ShutterControl`]
    ShutterControl,
    /// Source on/off, see [`crate::capabilities::EmissionControl`]
    EmissionControl,
    /// Fixed-line selection, see [`crate::capabilities::WavelengthSelect`]
    WavelengthSelect,
    /// Discrete positions, see [`crate::capabilities::StateDevice`]
    StateDevice,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::XyStage => "XY Stage",
            Self::Stage => "Stage",
            Self::Sequenceable => "Sequenceable",
            Self::Autofocus => "Autofocus",
            Self::ShutterControl => "Shutter Control",
            Self::EmissionControl => "Emission Control",
            Self::WavelengthSelect => "Wavelength Select",
            Self::StateDevice => "State Device",
        }
    }
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Container for the trait objects a driver exposes.
///
/// Each capability is stored separately so callers get compile-time typed access
/// without downcasting, and a driver only fills in what it implements.
#[derive(Default)]
pub struct DeviceComponents {
    /// Lifecycle and property access
    pub device: Option<Arc<dyn Device>>,
    pub xy_stage: Option<Arc<dyn XyStage>>,
    pub stage: Option<Arc<dyn Stage>>,
    pub sequenceable: Option<Arc<dyn Sequenceable>>,
    pub autofocus: Option<Arc<dyn Autofocus>>,
    pub shutter_control: Option<Arc<dyn ShutterControl>>,
    pub emission_control: Option<Arc<dyn EmissionControl>>,
    pub wavelength_select: Option<Arc<dyn WavelengthSelect>>,
    pub state_device: Option<Arc<dyn StateDevice>>,
    /// Capability-specific metadata (units and the like)
    pub metadata: DeviceMetadata,
}

impl DeviceComponents {
    /// Create a new empty DeviceComponents
    pub fn new() -> Self {
        Self::default()
    }

    /// Get list of capabilities this device supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let slots = [
            (self.xy_stage.is_some(), Capability::XyStage),
            (self.stage.is_some(), Capability::Stage),
            (self.sequenceable.is_some(), Capability::Sequenceable),
            (self.autofocus.is_some(), Capability::Autofocus),
            (self.shutter_control.is_some(), Capability::ShutterControl),
            (self.emission_control.is_some(), Capability::EmissionControl),
            (self.wavelength_select.is_some(), Capability::WavelengthSelect),
            (self.state_device.is_some(), Capability::StateDevice),
        ];
        slots
            .into_iter()
            .filter_map(|(present, cap)| present.then_some(cap))
            .collect()
    }

    // Builder methods

    pub fn with_device(mut self, d: Arc<dyn Device>) -> Self {
        self.device = Some(d);
        self
    }

    pub fn with_xy_stage(mut self, s: Arc<dyn XyStage>) -> Self {
        self.xy_stage = Some(s);
        self
    }

    pub fn with_stage(mut self, s: Arc<dyn Stage>) -> Self {
        self.stage = Some(s);
        self
    }

    pub fn with_sequenceable(mut self, s: Arc<dyn Sequenceable>) -> Self {
        self.sequenceable = Some(s);
        self
    }

    pub fn with_autofocus(mut self, a: Arc<dyn Autofocus>) -> Self {
        self.autofocus = Some(a);
        self
    }

    pub fn with_shutter_control(mut self, s: Arc<dyn ShutterControl>) -> Self {
        self.shutter_control = Some(s);
        self
    }

    pub fn with_emission_control(mut self, e: Arc<dyn EmissionControl>) -> Self {
        self.emission_control = Some(e);
        self
    }

    pub fn with_wavelength_select(mut self, w: Arc<dyn WavelengthSelect>) -> Self {
        self.wavelength_select = Some(w);
        self
    }

    pub fn with_state_device(mut self, s: Arc<dyn StateDevice>) -> Self {
        self.state_device = Some(s);
        self
    }

    /// Set device metadata
    pub fn with_metadata(mut self, metadata: DeviceMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// =============================================================================
// Device Metadata
// =============================================================================

/// Capability-specific metadata for a device.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata {
    /// Serial port the device talks through
    pub port: Option<String>,

    /// For stages: position units
    pub position_units: Option<String>,

    /// For stages: smallest addressable step in position units
    pub step_size: Option<f64>,

    /// Firmware or identification string read during initialization
    pub firmware: Option<String>,
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Trait for driver factories that create device instances.
///
/// Each driver crate implements this trait to register itself with the
/// device registry. The factory is responsible for:
///
/// 1. Declaring what driver type it handles (matching TOML `type` field)
/// 2. Validating configuration before instantiation
/// 3. Asynchronously creating and initializing the driver
///
/// # Thread Safety
///
/// `build()` takes `&self` and returns a `BoxFuture<'static, ...>`; shared state such
/// as serial endpoints lives in [`crate::ports`], not in the factory.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in TOML config `type` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// List of capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without instantiating.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Open the port, initialize the device and return its capabilities.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_name() {
        assert_eq!(Capability::XyStage.name(), "XY Stage");
        assert_eq!(Capability::WavelengthSelect.name(), "Wavelength Select");
    }

    #[test]
    fn test_device_components_capabilities() {
        let empty = DeviceComponents::new();
        assert!(empty.capabilities().is_empty());
    }

    #[test]
    fn test_capability_serde() {
        let cap: Capability = toml::Value::String("state_device".into()).try_into().unwrap();
        assert_eq!(cap, Capability::StateDevice);
    }
}
