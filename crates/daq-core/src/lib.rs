//! `daq-core`
//!
//! Shared building blocks for the serial device adapters of scope-daq.
//!
//! ## Layers
//!
//! - **Transport**: [`transport::Transport`] and the shared [`transport::SerialEndpoint`]
//! - **Codec**: per-family framing and reply classification in [`codec`]
//! - **Waiting**: deadline- and cancellation-aware polling in [`poll`]
//! - **Detection**: baud-rate cycling in [`detect`]
//! - **Device model**: [`device::Device`], capability traits and driver factories
//!
//! ## Key Types
//!
//! - [`DaqError`]: error taxonomy shared by all drivers
//! - [`codec::CommandReply`]: one classified reply
//! - [`state::Confirmed`] / [`state::LastCommanded`]: cached state with provenance

pub mod capabilities;
pub mod codec;
pub mod detect;
pub mod device;
pub mod driver;
pub mod error;
pub mod mock;
pub mod poll;
pub mod ports;
pub mod state;
pub mod transport;

pub use error::{DaqError, Result};
pub use tokio_util::sync::CancellationToken;
