//! Host-facing device contract.
//!
//! Every adapter implements [`Device`]: lifecycle, busy query and a string-typed
//! property interface. The property interface is what a host application binds its
//! generic property browser to; typed access goes through the capability traits in
//! [`crate::capabilities`].

use crate::error::{DaqError, Result};
use async_trait::async_trait;
use std::str::FromStr;

/// Direction of a property access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyAction {
    /// Read the current value
    Get,
    /// Write a new value, given in its textual form
    Set(String),
}

/// Lifecycle and property access shared by all adapters.
#[async_trait]
pub trait Device: Send + Sync {
    /// Device name as shown to the host
    fn name(&self) -> &str;

    /// Establish communication and read initial state.
    async fn initialize(&self) -> Result<()>;

    /// Release the device. Safe to call more than once.
    async fn shutdown(&self) -> Result<()>;

    /// Whether the device is still executing a command.
    ///
    /// Transport failures read as "not busy" so a dead link cannot hang a host
    /// that spins on this.
    async fn busy(&self) -> bool;

    /// Names accepted by [`Device::on_property`].
    fn property_names(&self) -> Vec<&'static str>;

    /// Read or write one property. Returns the value after the action.
    async fn on_property(&self, name: &str, action: PropertyAction) -> Result<String>;
}

/// Parse a property value, reporting the property name on failure.
pub fn parse_property<T: FromStr>(property: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        DaqError::InvalidParameter(format!("{property}: cannot parse {value:?}"))
    })
}

/// Error for a property name the device does not know.
pub fn unknown_property(device: &str, property: &str) -> DaqError {
    DaqError::InvalidParameter(format!("{device} has no property {property:?}"))
}

/// Error for writing a read-only property.
pub fn read_only(property: &str) -> DaqError {
    DaqError::InvalidParameter(format!("{property} is read-only"))
}

/// Map `Yes`/`No` style property values onto a bool.
pub fn parse_switch(property: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "1" => Ok(true),
        "no" | "off" | "false" | "0" => Ok(false),
        _ => Err(DaqError::InvalidParameter(format!(
            "{property}: expected Yes or No, got {value:?}"
        ))),
    }
}

/// Textual form of a bool property.
pub fn switch_label(on: bool) -> &'static str {
    if on {
        "Yes"
    } else {
        "No"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_parsing_reports_name() {
        assert_eq!(parse_property::<f64>("Speed", " 2.5 ").unwrap(), 2.5);
        let err = parse_property::<i64>("Wait", "fast").unwrap_err();
        assert!(err.to_string().contains("Wait"));
    }

    #[test]
    fn switches_accept_common_spellings() {
        assert!(parse_switch("MotorOnOff", "Yes").unwrap());
        assert!(!parse_switch("MotorOnOff", "off").unwrap());
        assert!(parse_switch("MotorOnOff", "maybe").is_err());
        assert_eq!(switch_label(true), "Yes");
    }
}
