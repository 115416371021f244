//! Cached device state with explicit provenance.
//!
//! - [`Confirmed<T>`]: a value the device reported. It is dropped back to
//!   `Unconfirmed` whenever the link fails, because the device may have changed
//!   behind our back.
//! - [`LastCommanded<T>`]: a value we sent but cannot read back (motor enable,
//!   shutter state on controllers without a query). It is only ever an
//!   approximation of the hardware.

use crate::error::Result;

/// Value confirmed by a successful round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confirmed<T> {
    Unconfirmed,
    Confirmed(T),
}

impl<T> Default for Confirmed<T> {
    fn default() -> Self {
        Confirmed::Unconfirmed
    }
}

impl<T: Clone> Confirmed<T> {
    pub fn confirm(&mut self, value: T) {
        *self = Confirmed::Confirmed(value);
    }

    pub fn invalidate(&mut self) {
        *self = Confirmed::Unconfirmed;
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Confirmed::Confirmed(value) => Some(value),
            Confirmed::Unconfirmed => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Confirmed::Confirmed(_))
    }

    /// Record the outcome of a query: success confirms, a link failure invalidates.
    ///
    /// Device-level rejections leave the cached value alone.
    pub fn track(&mut self, result: &Result<T>) {
        match result {
            Ok(value) => self.confirm(value.clone()),
            Err(e) if e.is_link_failure() => self.invalidate(),
            Err(_) => {}
        }
    }
}

/// Value last written to a device that offers no readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastCommanded<T>(Option<T>);

impl<T> Default for LastCommanded<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T: Copy> LastCommanded<T> {
    /// Nothing commanded yet.
    pub fn new() -> Self {
        Self(None)
    }

    /// Assume `value` until something is commanded.
    pub fn assumed(value: T) -> Self {
        Self(Some(value))
    }

    pub fn record(&mut self, value: T) {
        self.0 = Some(value);
    }

    pub fn get(&self) -> Option<T> {
        self.0
    }

    pub fn get_or(&self, default: T) -> T {
        self.0.unwrap_or(default)
    }
}
