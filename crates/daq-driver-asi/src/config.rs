//! Configuration shared by the ASI driver factories.

use crate::port::ASI_DEFAULT_BAUD;
use anyhow::{anyhow, Result};
use daq_core::detect::is_configured_port;
use serde::Deserialize;
use std::time::Duration;

pub(crate) fn default_baud_rate() -> u32 {
    ASI_DEFAULT_BAUD
}

pub(crate) fn default_motion_timeout() -> Duration {
    Duration::from_secs(60)
}

pub(crate) fn default_lock_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Serial settings every ASI device section carries.
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl PortConfig {
    /// Reject placeholder port names and a zero baud rate.
    pub fn validate(&self) -> Result<()> {
        if !is_configured_port(&self.port) {
            return Err(anyhow!("serial port is not configured (got {:?})", self.port));
        }
        if self.baud_rate == 0 {
            return Err(anyhow!("baud rate must be positive"));
        }
        Ok(())
    }
}
