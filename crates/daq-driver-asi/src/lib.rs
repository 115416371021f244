//! ASI MS-2000 / LX-4000 controller drivers.
//!
//! This crate provides drivers for devices behind an ASI controller:
//! - XY stage (`asi_xy_stage`)
//! - Z stage with ring-buffer sequences (`asi_z_stage`)
//! - CRIF and CRISP reflection autofocus (`asi_crif`, `asi_crisp`)
//! - AZ100 objective turret (`asi_az100_turret`)
//! - LED illuminator on the TTL output (`asi_led`)
//!
//! Devices on the same controller share one serial endpoint through
//! [`daq_core::ports`], so their exchanges never interleave.
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_driver_asi::{AsiXyStageFactory, AsiZStageFactory};
//!
//! registry.register_factory(Box::new(AsiXyStageFactory));
//! registry.register_factory(Box::new(AsiZStageFactory));
//! ```

pub mod config;
mod crif;
mod crisp;
mod led;
pub mod port;
mod turret;
mod xy_stage;
mod z_stage;

pub use config::PortConfig;
pub use crif::{AsiCrif, AsiCrifConfig, AsiCrifFactory, CrifState};
pub use crisp::{AsiCrisp, AsiCrispConfig, AsiCrispFactory, CrispState, FOCUS_CURVE_BUFFERS};
pub use led::{AsiLed, AsiLedConfig, AsiLedFactory, MAX_INTENSITY};
pub use port::{detect_controller, AsiPort, ASI_DEFAULT_BAUD};
pub use turret::{AsiTurret, AsiTurretConfig, AsiTurretFactory, TURRET_POSITIONS};
pub use xy_stage::{
    AsiXyStage, AsiXyStageConfig, AsiXyStageFactory, CalibrationStatus, JoystickSettings,
    XyFeatures, XY_STEP_SIZE_UM,
};
pub use z_stage::{
    AsiZStage, AsiZStageConfig, AsiZStageFactory, ZAxis, RING_BUFFER_CAPACITY, Z_STEP_SIZE_UM,
};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factories are
/// linked into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box((
        std::any::TypeId::of::<AsiXyStageFactory>(),
        std::any::TypeId::of::<AsiZStageFactory>(),
        std::any::TypeId::of::<AsiCrifFactory>(),
        std::any::TypeId::of::<AsiCrispFactory>(),
        std::any::TypeId::of::<AsiTurretFactory>(),
        std::any::TypeId::of::<AsiLedFactory>(),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
