//! ASI LED illuminator on the TTL output, driven as a shutter
//!
//! `TTL Y` selects the output mode: `0` off, `1` on at full power, `9 <n>` on at
//! `n` percent. Below full power the intensity is also programmed with `LED X=<n>`.

use crate::config::PortConfig;
use crate::port::AsiPort;
use anyhow::Context;
use async_trait::async_trait;
use daq_core::capabilities::ShutterControl;
use daq_core::codec::{lenient_i64, AsiCommand, Dialect};
use daq_core::device::{parse_property, unknown_property, Device, PropertyAction};
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{DaqError, Result};
use daq_core::state::LastCommanded;
use daq_core::transport::SerialEndpoint;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

const STATE_PROPERTY: &str = "State";
const INTENSITY_PROPERTY: &str = "Intensity";
const OPEN: &str = "Open";
const CLOSED: &str = "Closed";

pub const MAX_INTENSITY: u8 = 100;

/// Configuration for the LED shutter
#[derive(Debug, Clone, Deserialize)]
pub struct AsiLedConfig {
    #[serde(flatten)]
    pub serial: PortConfig,
}

pub struct AsiLedFactory;

static LED_CAPABILITIES: &[Capability] = &[Capability::ShutterControl];

impl DriverFactory for AsiLedFactory {
    fn driver_type(&self) -> &'static str {
        "asi_led"
    }

    fn name(&self) -> &'static str {
        "ASI LED"
    }

    fn capabilities(&self) -> &'static [Capability] {
        LED_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: AsiLedConfig = config.clone().try_into()?;
        cfg.serial.validate()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        let validated = self.validate(&config);
        Box::pin(async move {
            validated?;
            let cfg: AsiLedConfig = config.try_into().context("Invalid ASI LED config")?;
            let endpoint = daq_core::ports::get_or_open_endpoint(
                &cfg.serial.port,
                cfg.serial.baud_rate,
                "ASI LED",
            )
            .await?;

            let led = Arc::new(AsiLed::new(endpoint));
            led.initialize()
                .await
                .with_context(|| format!("ASI LED on {} failed to initialize", cfg.serial.port))?;

            Ok(DeviceComponents::new()
                .with_device(led.clone())
                .with_shutter_control(led)
                .with_metadata(DeviceMetadata {
                    port: Some(cfg.serial.port),
                    ..Default::default()
                }))
        })
    }
}

#[derive(Debug)]
struct LedState {
    /// No readback is used after initialization
    open: LastCommanded<bool>,
    intensity: u8,
}

pub struct AsiLed {
    port: AsiPort,
    state: Mutex<LedState>,
}

impl AsiLed {
    pub const NAME: &'static str = "LED";

    pub fn new(endpoint: SerialEndpoint) -> Self {
        Self {
            port: AsiPort::new(endpoint, None),
            state: Mutex::new(LedState {
                open: LastCommanded::assumed(false),
                intensity: 1,
            }),
        }
    }

    pub fn intensity(&self) -> u8 {
        self.state.lock().intensity
    }

    /// Last commanded output state.
    pub fn is_open(&self) -> bool {
        self.state.lock().open.get_or(false)
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn set_open(&self, open: bool) -> Result<()> {
        let intensity = self.intensity();
        let command = match (open, intensity) {
            (false, _) => "TTL Y=0".to_string(),
            (true, MAX_INTENSITY) => "TTL Y=1".to_string(),
            (true, n) => format!("TTL Y=9 {n}"),
        };
        self.port.clear_port().await?;
        let reply = self.port.query_reply(&command).await?;
        if reply.is_nak() {
            reply.check()?;
        }
        self.state.lock().open.record(open);
        Ok(())
    }

    /// Read the output mode back from the controller.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn query_open(&self) -> Result<bool> {
        self.port.clear_port().await?;
        let reply = self.port.query_reply("TTL Y?").await?;
        if reply.is_nak() {
            reply.check()?;
        }
        // ":A Y=0" is off, anything else counts as on
        let closed = reply.is_ack()
            && reply
                .tokens()
                .first()
                .is_some_and(|token| token.get(2..3) == Some("0"));
        Ok(!closed)
    }

    /// Intensity in percent, from a `X=nn :A` reply, clamped to the settable 1-100.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn query_intensity(&self) -> Result<u8> {
        self.port.clear_port().await?;
        let reply = self.port.query("LED X?").await?;
        let mut tokens = reply.split_whitespace();
        let value = tokens.next().unwrap_or_default();
        let status = tokens.next().unwrap_or_default();
        if status.starts_with(":A") || status.get(1..3) == Some(":A") {
            return Ok(lenient_i64(value.get(2..).unwrap_or_default())
                .clamp(1, i64::from(MAX_INTENSITY)) as u8);
        }
        let parsed = self.port.dialect().parse(&reply);
        if parsed.is_nak() {
            parsed.check()?;
        }
        Ok(1)
    }

    /// Program a new intensity and re-apply it if the LED is on.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn set_intensity(&self, intensity: u8) -> Result<()> {
        if !(1..=MAX_INTENSITY).contains(&intensity) {
            return Err(DaqError::InvalidParameter(format!(
                "LED intensity must be within 1-100, got {intensity}"
            )));
        }
        self.state.lock().intensity = intensity;
        if intensity < MAX_INTENSITY {
            self.port.clear_port().await?;
            let reply = self
                .port
                .query_reply(&AsiCommand::new("LED").value("X", intensity).build())
                .await?;
            if reply.is_nak() {
                reply.check()?;
            }
        }
        if self.is_open() {
            self.set_open(true).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Device for AsiLed {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.port.clear_port().await?;
        self.port.check_device_status().await?;

        let open = self.query_open().await?;
        let intensity = self.query_intensity().await?;
        {
            let mut state = self.state.lock();
            state.open.record(open);
            state.intensity = intensity;
        }
        tracing::info!(port = self.port.name(), open, intensity, "ASI LED initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn busy(&self) -> bool {
        false
    }

    fn property_names(&self) -> Vec<&'static str> {
        vec![STATE_PROPERTY, INTENSITY_PROPERTY]
    }

    async fn on_property(&self, name: &str, action: PropertyAction) -> Result<String> {
        match name {
            STATE_PROPERTY => {
                if let PropertyAction::Set(value) = action {
                    self.set_open(value.trim() != CLOSED).await?;
                }
                Ok(if self.is_open() { OPEN } else { CLOSED }.to_string())
            }
            INTENSITY_PROPERTY => {
                if let PropertyAction::Set(value) = action {
                    self.set_intensity(parse_property(name, &value)?).await?;
                }
                Ok(self.intensity().to_string())
            }
            _ => Err(unknown_property(Self::NAME, name)),
        }
    }
}

#[async_trait]
impl ShutterControl for AsiLed {
    async fn open_shutter(&self) -> Result<()> {
        self.set_open(true).await
    }

    async fn close_shutter(&self) -> Result<()> {
        self.set_open(false).await
    }

    async fn is_shutter_open(&self) -> Result<bool> {
        Ok(self.is_open())
    }

    /// Timed exposures are not supported by the LED output.
    async fn fire(&self, _duration: Duration) -> Result<()> {
        Ok(())
    }
}
