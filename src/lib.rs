//! # scope-daq
//!
//! Composition root for the serial device adapters in this workspace:
//!
//! - **`config`**: loads `config/scope.toml` plus `SCOPE_DAQ_` environment overrides
//!   into [`config::AppConfig`].
//! - **`logging`**: installs the `tracing` subscriber described by the `[application]`
//!   section.
//! - **`registry`**: [`registry::DeviceRegistry`] turns device definitions into
//!   capability trait objects through the driver factories.
//!
//! Protocol handling lives in the member crates: `daq-core` (transport, codecs,
//! polling, detection), `daq-driver-asi` and `daq-driver-skyra`.

pub mod config;
pub mod logging;
pub mod registry;

pub use config::AppConfig;
pub use registry::DeviceRegistry;
