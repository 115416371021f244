//! ASI MS-2000 / LX-4000 XY Stage Driver
//!
//! Protocol Overview:
//! - Format: ASCII verb plus `AXIS=value` pairs, CR terminated
//! - Baud: 9600, 8N1, no flow control
//! - Positions travel in tenths of a micrometre; the driver counts in steps of
//!   0.01 µm, so a serial value is the step count divided by 10
//! - Example: `M X=1234.500000 Y=-67.800000` then `W X Y` answers `:A 1234.5 -67.8`
//!
//! Controller settings (wait cycles, speed, backlash, drift and finish error,
//! overshoot) are only offered when the firmware knows the matching query.
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_driver_asi::AsiXyStageFactory;
//! use daq_core::driver::DriverFactory;
//!
//! let config = toml::toml! {
//!     port = "/dev/ttyUSB0"
//!     motion_timeout = "30s"
//! };
//! let components = AsiXyStageFactory.build(config.into()).await?;
//! let stage = components.xy_stage.unwrap();
//! stage.set_position_um(100.0, -25.0).await?;
//! stage.wait_settled().await?;
//! ```

use crate::config::{default_motion_timeout, PortConfig};
use crate::port::AsiPort;
use anyhow::Context;
use async_trait::async_trait;
use daq_core::capabilities::XyStage;
use daq_core::codec::{numeric_fields, AsiCommand, AxisProtocol, ReplyStatus};
use daq_core::device::{parse_property, read_only, unknown_property, Device, PropertyAction};
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{DaqError, Result, ASI_ERR_OFFSET};
use daq_core::poll::{poll_until, PollOutcome, PollSettings};
use daq_core::state::{Confirmed, LastCommanded};
use daq_core::transport::SerialEndpoint;
use daq_core::CancellationToken;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Smallest addressable step.
pub const XY_STEP_SIZE_UM: f64 = 0.01;

/// Steps per serial unit (the controller talks in tenths of a micrometre).
const SERIAL_UNIT: f64 = 10.0;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `:N-21`: halt requested while nothing was moving.
const ALREADY_STOPPED: i32 = ASI_ERR_OFFSET - 21;

// =============================================================================
// AsiXyStageFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the XY stage driver
#[derive(Debug, Clone, Deserialize)]
pub struct AsiXyStageConfig {
    #[serde(flatten)]
    pub serial: PortConfig,
    /// Upper bound for [`AsiXyStage::wait_until_idle`] (default: 60s)
    #[serde(default = "default_motion_timeout", with = "humantime_serde")]
    pub motion_timeout: Duration,
}

/// Factory for creating XY stage driver instances.
pub struct AsiXyStageFactory;

/// Static capabilities for the XY stage
static XY_STAGE_CAPABILITIES: &[Capability] = &[Capability::XyStage];

impl DriverFactory for AsiXyStageFactory {
    fn driver_type(&self) -> &'static str {
        "asi_xy_stage"
    }

    fn name(&self) -> &'static str {
        "ASI XY Stage"
    }

    fn capabilities(&self) -> &'static [Capability] {
        XY_STAGE_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: AsiXyStageConfig = config.clone().try_into()?;
        cfg.serial.validate()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: AsiXyStageConfig = config.try_into().context("Invalid ASI XY stage config")?;
            cfg.serial.validate()?;
            let endpoint = daq_core::ports::get_or_open_endpoint(
                &cfg.serial.port,
                cfg.serial.baud_rate,
                "ASI XY stage",
            )
            .await?;

            let stage = Arc::new(AsiXyStage::new(endpoint, cfg.motion_timeout));
            stage
                .initialize()
                .await
                .with_context(|| format!("ASI XY stage on {} failed to initialize", cfg.serial.port))?;
            let firmware = stage.firmware_version().await.ok();

            Ok(DeviceComponents::new()
                .with_device(stage.clone())
                .with_xy_stage(stage)
                .with_metadata(DeviceMetadata {
                    port: Some(cfg.serial.port),
                    position_units: Some("µm".into()),
                    step_size: Some(XY_STEP_SIZE_UM),
                    firmware,
                }))
        })
    }
}

// =============================================================================
// State
// =============================================================================

/// Controller settings the firmware answered to during initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XyFeatures {
    pub wait_cycles: bool,
    pub speed: bool,
    pub backlash: bool,
    pub drift_error: bool,
    pub finish_error: bool,
    pub overshoot: bool,
}

/// Joystick settings. The controller offers no readback, so these are the values last sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoystickSettings {
    /// Fast-knob speed, 1-100 %
    pub fast_speed: u8,
    /// Slow-knob speed, 1-100 %
    pub slow_speed: u8,
    /// Both axes reversed
    pub mirrored: bool,
}

impl Default for JoystickSettings {
    fn default() -> Self {
        Self {
            fast_speed: 60,
            slow_speed: 5,
            mirrored: false,
        }
    }
}

impl JoystickSettings {
    fn command(&self) -> String {
        let sign = if self.mirrored { "-" } else { "" };
        AsiCommand::new("JS")
            .value("X", format!("{sign}{}", self.fast_speed))
            .value("Y", format!("{sign}{}", self.slow_speed))
            .build()
    }
}

/// Outcome of [`AsiXyStage::calibrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStatus {
    Completed,
    /// [`AsiXyStage::stop`] was called while calibrating
    Cancelled,
}

#[derive(Debug)]
struct XyState {
    position_steps: Confirmed<(i64, i64)>,
    protocol: Confirmed<AxisProtocol>,
    features: XyFeatures,
    motor_enabled: LastCommanded<bool>,
    joystick: LastCommanded<JoystickSettings>,
}

impl Default for XyState {
    fn default() -> Self {
        Self {
            position_steps: Confirmed::Unconfirmed,
            protocol: Confirmed::Unconfirmed,
            features: XyFeatures::default(),
            motor_enabled: LastCommanded::assumed(true),
            joystick: LastCommanded::assumed(JoystickSettings::default()),
        }
    }
}

// =============================================================================
// Properties
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XyProperty {
    Version,
    StepSizeX,
    StepSizeY,
    WaitCycles,
    Speed,
    Backlash,
    DriftError,
    FinishError,
    Overshoot,
    MotorOnOff,
    JoystickReverse,
    JoystickFastSpeed,
    JoystickSlowSpeed,
}

const XY_PROPERTIES: &[(XyProperty, &str)] = &[
    (XyProperty::Version, "Version"),
    (XyProperty::StepSizeX, "StepSizeX_um"),
    (XyProperty::StepSizeY, "StepSizeY_um"),
    (XyProperty::WaitCycles, "Wait_Cycles"),
    (XyProperty::Speed, "Speed-S"),
    (XyProperty::Backlash, "Backlash-B"),
    (XyProperty::DriftError, "Error-E(nm)"),
    (XyProperty::FinishError, "FinishError-PCROS(nm)"),
    (XyProperty::Overshoot, "OverShoot(um)"),
    (XyProperty::MotorOnOff, "MotorOnOff"),
    (XyProperty::JoystickReverse, "JoyStick Reverse"),
    (XyProperty::JoystickFastSpeed, "JoyStick Fast Speed"),
    (XyProperty::JoystickSlowSpeed, "JoyStick Slow Speed"),
];

impl XyProperty {
    fn label(self) -> &'static str {
        XY_PROPERTIES
            .iter()
            .find(|(p, _)| *p == self)
            .map_or("", |(_, label)| label)
    }

    fn from_label(label: &str) -> Option<Self> {
        XY_PROPERTIES
            .iter()
            .find(|(_, l)| *l == label)
            .map(|(p, _)| *p)
    }

    /// Whether the firmware supports the setting behind this property.
    fn available(self, features: &XyFeatures) -> bool {
        match self {
            XyProperty::WaitCycles => features.wait_cycles,
            XyProperty::Speed => features.speed,
            XyProperty::Backlash => features.backlash,
            XyProperty::DriftError => features.drift_error,
            XyProperty::FinishError => features.finish_error,
            XyProperty::Overshoot => features.overshoot,
            _ => true,
        }
    }
}

fn on_off_label(on: bool) -> &'static str {
    if on {
        "On"
    } else {
        "Off"
    }
}

fn parse_on_off(property: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "On" => Ok(true),
        "Off" => Ok(false),
        other => Err(DaqError::InvalidParameter(format!(
            "{property}: expected On or Off, got {other:?}"
        ))),
    }
}

// =============================================================================
// AsiXyStage
// =============================================================================

/// Driver for the XY stage card of an ASI controller.
pub struct AsiXyStage {
    port: AsiPort,
    motion_timeout: Duration,
    state: Mutex<XyState>,
    /// Stop signal for a running calibration; replaced at the start of each one
    calibration: Mutex<CancellationToken>,
}

impl AsiXyStage {
    /// Device name reported to the host
    pub const NAME: &'static str = "XYStage";

    /// Create a driver on a shared endpoint. Call [`Device::initialize`] before use.
    pub fn new(endpoint: SerialEndpoint, motion_timeout: Duration) -> Self {
        Self {
            port: AsiPort::new(endpoint, Some("2H")),
            motion_timeout,
            state: Mutex::new(XyState::default()),
            calibration: Mutex::new(CancellationToken::new()),
        }
    }

    /// Controller settings found during initialization.
    pub fn features(&self) -> XyFeatures {
        self.state.lock().features
    }

    /// Last position confirmed by the controller, in steps.
    pub fn cached_position_steps(&self) -> Option<(i64, i64)> {
        self.state.lock().position_steps.value().copied()
    }

    fn track_position(&self, result: &Result<(i64, i64)>) {
        self.state.lock().position_steps.track(result);
    }

    // -------------------------------------------------------------------------
    // Motion
    // -------------------------------------------------------------------------

    /// Move to an absolute position in steps.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn set_position_steps(&self, x: i64, y: i64) -> Result<()> {
        self.port.clear_port().await?;
        let command = AsiCommand::new("M")
            .fixed("X", x as f64 / SERIAL_UNIT)
            .fixed("Y", y as f64 / SERIAL_UNIT)
            .build();
        let result = self.motion_command(&command).await;
        if result.is_ok() {
            self.state.lock().position_steps.confirm((x, y));
        }
        result
    }

    /// Move relative to the current position, in steps.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn set_relative_position_steps(&self, dx: i64, dy: i64) -> Result<()> {
        self.port.clear_port().await?;
        let command = AsiCommand::new("R")
            .fixed("X", dx as f64 / SERIAL_UNIT)
            .fixed("Y", dy as f64 / SERIAL_UNIT)
            .build();
        let result = self.motion_command(&command).await;
        if result.is_ok() {
            let mut state = self.state.lock();
            if let Some(&(x, y)) = state.position_steps.value() {
                state.position_steps.confirm((x + dx, y + dy));
            }
        }
        result
    }

    async fn motion_command(&self, command: &str) -> Result<()> {
        let reply = self.port.query_reply(command).await;
        if let Err(e) = &reply {
            if e.is_link_failure() {
                self.state.lock().position_steps.invalidate();
            }
        }
        reply?.check()
    }

    /// Current position in steps, rounded to the nearest step.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn position_steps(&self) -> Result<(i64, i64)> {
        let result = self.read_position().await;
        self.track_position(&result);
        result
    }

    async fn read_position(&self) -> Result<(i64, i64)> {
        self.port.clear_port().await?;
        let reply = self.port.query_reply("W X Y").await?;
        if reply.is_nak() {
            reply.check()?;
        }
        match numeric_fields(&reply.raw)[..] {
            [x, y, ..] => Ok((
                (x * SERIAL_UNIT).round() as i64,
                (y * SERIAL_UNIT).round() as i64,
            )),
            _ => Err(DaqError::Protocol(reply.raw)),
        }
    }

    /// Whether the controller reports motion.
    ///
    /// Only `N` reads as idle. Any other answer, or no answer, reads as busy.
    pub async fn is_busy(&self) -> bool {
        if self.port.clear_port().await.is_err() {
            return true;
        }
        match self.port.query("/").await {
            Ok(reply) => !reply.starts_with('N'),
            Err(_) => true,
        }
    }

    /// Poll the status every 100 ms until the controller answers `N`.
    pub async fn wait_until_idle(&self) -> Result<()> {
        self.wait_until_idle_with(&CancellationToken::new()).await
    }

    async fn wait_until_idle_with(&self, cancel: &CancellationToken) -> Result<()> {
        let settings = PollSettings::new(STATUS_POLL_INTERVAL, self.motion_timeout);
        let outcome = poll_until(
            &settings,
            cancel,
            || async {
                self.port.clear_port().await?;
                self.port.query("/").await
            },
            // Anything but an explicit "not busy" keeps us waiting
            |reply| matches!(reply, Ok(status) if status.starts_with('N')),
        )
        .await;

        match outcome {
            PollOutcome::Ready(_) => Ok(()),
            PollOutcome::Cancelled => Err(DaqError::Cancelled),
            PollOutcome::TimedOut(last) => {
                tracing::warn!(port = self.port.name(), last = ?last, "Stage did not settle");
                Err(DaqError::Timeout {
                    what: "XY stage to stop moving".into(),
                    after: self.motion_timeout,
                })
            }
        }
    }

    /// Drive both axes to their limit switches.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn home_axes(&self) -> Result<()> {
        self.port.clear_port().await?;
        self.home_command().await
    }

    async fn home_command(&self) -> Result<()> {
        let reply = self.port.query_reply("! X Y").await?;
        self.state.lock().position_steps.invalidate();
        match reply.status {
            ReplyStatus::Nak => reply.check(),
            _ => Ok(()),
        }
    }

    /// Declare the current position `(0, 0)`.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn set_origin_here(&self) -> Result<()> {
        self.port.query_reply("H X=0 Y=0").await?.check()?;
        self.state.lock().position_steps.confirm((0, 0));
        Ok(())
    }

    /// Halt motion and abort a running calibration.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn halt(&self) -> Result<()> {
        self.calibration.lock().cancel();
        self.port.clear_port().await?;
        let reply = self.port.query_reply("HALT").await?;
        self.state.lock().position_steps.invalidate();
        match (reply.status, reply.error_code) {
            (ReplyStatus::Nak, Some(ALREADY_STOPPED)) => Ok(()),
            (ReplyStatus::Nak, _) => reply.check(),
            _ => Ok(()),
        }
    }

    /// Read the position, wait for the stage to settle, then home.
    ///
    /// [`AsiXyStage::halt`] aborts the sequence between steps.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn calibrate(&self) -> Result<CalibrationStatus> {
        let cancel = {
            let mut token = self.calibration.lock();
            *token = CancellationToken::new();
            token.clone()
        };

        self.position_steps().await?;
        match self.wait_until_idle_with(&cancel).await {
            Err(DaqError::Cancelled) => return Ok(CalibrationStatus::Cancelled),
            other => other?,
        }
        if cancel.is_cancelled() {
            return Ok(CalibrationStatus::Cancelled);
        }

        self.home_command().await?;
        Ok(CalibrationStatus::Completed)
    }

    // -------------------------------------------------------------------------
    // Controller settings
    // -------------------------------------------------------------------------

    fn require(&self, available: bool, what: &str) -> Result<()> {
        if available {
            Ok(())
        } else {
            Err(DaqError::UnsupportedCommand(format!("{what} (not offered by this firmware)")))
        }
    }

    async fn set_both_axes(&self, verb: &str, value: String) -> Result<()> {
        let command = AsiCommand::new(verb)
            .value("X", &value)
            .value("Y", &value)
            .build();
        self.port.query_reply(&command).await?.check()
    }

    /// Firmware version string.
    pub async fn firmware_version(&self) -> Result<String> {
        self.port.query_reply("V").await?.into_result()
    }

    /// Servo wait cycles after a move.
    pub async fn wait_cycles(&self) -> Result<i64> {
        self.require(self.features().wait_cycles, "wait cycles")?;
        Ok(self.port.query_setting("WT X?").await? as i64)
    }

    /// Set wait cycles on both axes, clamped to 0-255.
    #[instrument(skip(self), err)]
    pub async fn set_wait_cycles(&self, cycles: i64) -> Result<()> {
        self.require(self.features().wait_cycles, "wait cycles")?;
        self.set_both_axes("WT", cycles.clamp(0, 255).to_string()).await
    }

    /// Maximum speed in mm/s.
    pub async fn speed_mm_s(&self) -> Result<f64> {
        self.require(self.features().speed, "speed")?;
        self.port.query_setting("S X?").await
    }

    /// Set the maximum speed of both axes, clamped to 0-7.5 mm/s.
    #[instrument(skip(self), err)]
    pub async fn set_speed_mm_s(&self, speed: f64) -> Result<()> {
        self.require(self.features().speed, "speed")?;
        self.set_both_axes("S", format!("{:.6}", speed.clamp(0.0, 7.5))).await
    }

    /// Backlash compensation distance in mm.
    pub async fn backlash_mm(&self) -> Result<f64> {
        self.require(self.features().backlash, "backlash")?;
        self.port.query_setting("B X?").await
    }

    #[instrument(skip(self), err)]
    pub async fn set_backlash_mm(&self, backlash: f64) -> Result<()> {
        self.require(self.features().backlash, "backlash")?;
        if backlash < 0.0 {
            return Err(DaqError::InvalidParameter(format!(
                "backlash must not be negative, got {backlash}"
            )));
        }
        self.set_both_axes("B", backlash.to_string()).await
    }

    /// Drift error in nm (the controller stores mm).
    pub async fn drift_error_nm(&self) -> Result<f64> {
        self.require(self.features().drift_error, "drift error")?;
        Ok(self.port.query_setting("E X?").await? * 1e6)
    }

    #[instrument(skip(self), err)]
    pub async fn set_drift_error_nm(&self, error_nm: f64) -> Result<()> {
        self.require(self.features().drift_error, "drift error")?;
        self.set_both_axes("E", format!("{:.6}", error_nm / 1e6)).await
    }

    /// Finish error in nm (the controller stores mm).
    pub async fn finish_error_nm(&self) -> Result<f64> {
        self.require(self.features().finish_error, "finish error")?;
        Ok(self.port.query_setting("PC X?").await? * 1e6)
    }

    #[instrument(skip(self), err)]
    pub async fn set_finish_error_nm(&self, error_nm: f64) -> Result<()> {
        self.require(self.features().finish_error, "finish error")?;
        self.set_both_axes("PC", format!("{:.6}", error_nm / 1e6)).await
    }

    /// Overshoot in µm (the controller stores mm).
    pub async fn overshoot_um(&self) -> Result<f64> {
        self.require(self.features().overshoot, "overshoot")?;
        Ok(self.port.query_setting("OS X?").await? * 1000.0)
    }

    #[instrument(skip(self), err)]
    pub async fn set_overshoot_um(&self, overshoot_um: f64) -> Result<()> {
        self.require(self.features().overshoot, "overshoot")?;
        self.set_both_axes("OS", format!("{:.6}", overshoot_um / 1000.0)).await
    }

    /// Motor power as last commanded (the controller has no readback).
    pub fn motor_enabled(&self) -> bool {
        self.state.lock().motor_enabled.get_or(true)
    }

    #[instrument(skip(self), err)]
    pub async fn set_motor_enabled(&self, on: bool) -> Result<()> {
        let sign = if on { "+" } else { "-" };
        let command = AsiCommand::new("MC")
            .arg(&format!("X{sign}"))
            .arg(&format!("Y{sign}"))
            .build();
        self.state.lock().motor_enabled.record(on);
        self.port.query_ack(&command).await
    }

    pub fn joystick(&self) -> JoystickSettings {
        self.state.lock().joystick.get_or(JoystickSettings::default())
    }

    /// Send new joystick settings. Speeds must be 1-100.
    #[instrument(skip(self), err)]
    pub async fn set_joystick(&self, settings: JoystickSettings) -> Result<()> {
        for speed in [settings.fast_speed, settings.slow_speed] {
            if !(1..=100).contains(&speed) {
                return Err(DaqError::InvalidParameter(format!(
                    "joystick speed must be 1-100, got {speed}"
                )));
            }
        }
        self.state.lock().joystick.record(settings);
        let reply = self.port.query_reply(&settings.command()).await?;
        // Some firmware puts the acknowledge at the end of the line
        if reply.raw.ends_with('A') {
            return Ok(());
        }
        reply.check()
    }

    /// Reverse both joystick axes. Nothing is sent when the setting does not change.
    pub async fn set_joystick_mirrored(&self, mirrored: bool) -> Result<()> {
        let current = self.joystick();
        if current.mirrored == mirrored {
            return Ok(());
        }
        self.set_joystick(JoystickSettings { mirrored, ..current }).await
    }

    async fn set_axis_direction(&self) -> Result<()> {
        self.port.query_ack("UM X=-10000 Y=10000").await
    }

    async fn probe_features(&self) -> XyFeatures {
        XyFeatures {
            wait_cycles: self.port.has_command("WT X?").await,
            speed: self.port.has_command("S X?").await,
            backlash: self.port.has_command("B X?").await,
            drift_error: self.port.has_command("E X?").await,
            finish_error: self.port.has_command("PC X?").await,
            overshoot: self.port.has_command("OS X?").await,
        }
    }

    async fn get_property(&self, property: XyProperty) -> Result<String> {
        Ok(match property {
            XyProperty::Version => self.firmware_version().await?,
            XyProperty::StepSizeX | XyProperty::StepSizeY => XY_STEP_SIZE_UM.to_string(),
            XyProperty::WaitCycles => self.wait_cycles().await?.to_string(),
            XyProperty::Speed => self.speed_mm_s().await?.to_string(),
            XyProperty::Backlash => self.backlash_mm().await?.to_string(),
            XyProperty::DriftError => self.drift_error_nm().await?.to_string(),
            XyProperty::FinishError => self.finish_error_nm().await?.to_string(),
            XyProperty::Overshoot => self.overshoot_um().await?.to_string(),
            XyProperty::MotorOnOff => on_off_label(self.motor_enabled()).to_string(),
            XyProperty::JoystickReverse => on_off_label(self.joystick().mirrored).to_string(),
            XyProperty::JoystickFastSpeed => self.joystick().fast_speed.to_string(),
            XyProperty::JoystickSlowSpeed => self.joystick().slow_speed.to_string(),
        })
    }

    async fn set_property(&self, property: XyProperty, value: &str) -> Result<()> {
        let label = property.label();
        match property {
            XyProperty::Version | XyProperty::StepSizeX | XyProperty::StepSizeY => {
                Err(read_only(label))
            }
            XyProperty::WaitCycles => self.set_wait_cycles(parse_property(label, value)?).await,
            XyProperty::Speed => self.set_speed_mm_s(parse_property(label, value)?).await,
            XyProperty::Backlash => self.set_backlash_mm(parse_property(label, value)?).await,
            XyProperty::DriftError => self.set_drift_error_nm(parse_property(label, value)?).await,
            XyProperty::FinishError => {
                self.set_finish_error_nm(parse_property(label, value)?).await
            }
            XyProperty::Overshoot => self.set_overshoot_um(parse_property(label, value)?).await,
            XyProperty::MotorOnOff => self.set_motor_enabled(parse_on_off(label, value)?).await,
            XyProperty::JoystickReverse => {
                self.set_joystick_mirrored(parse_on_off(label, value)?).await
            }
            XyProperty::JoystickFastSpeed => {
                let fast_speed = parse_property(label, value)?;
                self.set_joystick(JoystickSettings { fast_speed, ..self.joystick() }).await
            }
            XyProperty::JoystickSlowSpeed => {
                let slow_speed = parse_property(label, value)?;
                self.set_joystick(JoystickSettings { slow_speed, ..self.joystick() }).await
            }
        }
    }
}

// =============================================================================
// Device and capability traits
// =============================================================================

#[async_trait]
impl Device for AsiXyStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.port.clear_port().await?;
        let protocol = self.port.check_device_status().await;
        self.state.lock().protocol.track(&protocol);
        let protocol = protocol?;

        self.set_axis_direction().await?;
        let features = self.probe_features().await;
        self.state.lock().features = features;

        tracing::info!(
            port = self.port.name(),
            protocol = protocol.label(),
            ?features,
            "ASI XY stage initialized"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.calibration.lock().cancel();
        Ok(())
    }

    async fn busy(&self) -> bool {
        self.is_busy().await
    }

    fn property_names(&self) -> Vec<&'static str> {
        let features = self.features();
        XY_PROPERTIES
            .iter()
            .filter(|(p, _)| p.available(&features))
            .map(|(_, label)| *label)
            .collect()
    }

    async fn on_property(&self, name: &str, action: PropertyAction) -> Result<String> {
        let property = XyProperty::from_label(name)
            .filter(|p| p.available(&self.features()))
            .ok_or_else(|| unknown_property(Self::NAME, name))?;
        if let PropertyAction::Set(value) = action {
            self.set_property(property, &value).await?;
        }
        self.get_property(property).await
    }
}

fn um_to_steps(um: f64) -> i64 {
    (um / XY_STEP_SIZE_UM).round() as i64
}

#[async_trait]
impl XyStage for AsiXyStage {
    async fn set_position_um(&self, x: f64, y: f64) -> Result<()> {
        self.set_position_steps(um_to_steps(x), um_to_steps(y)).await
    }

    async fn set_relative_position_um(&self, dx: f64, dy: f64) -> Result<()> {
        self.set_relative_position_steps(um_to_steps(dx), um_to_steps(dy))
            .await
    }

    async fn position_um(&self) -> Result<(f64, f64)> {
        let (x, y) = self.position_steps().await?;
        Ok((x as f64 * XY_STEP_SIZE_UM, y as f64 * XY_STEP_SIZE_UM))
    }

    async fn set_origin(&self) -> Result<()> {
        self.set_origin_here().await
    }

    async fn home(&self) -> Result<()> {
        self.home_axes().await
    }

    async fn stop(&self) -> Result<()> {
        self.halt().await
    }

    async fn wait_settled(&self) -> Result<()> {
        self.wait_until_idle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::mock::ScriptedTransport;

    fn stage() -> (Arc<ScriptedTransport>, Arc<AsiXyStage>) {
        let mock = Arc::new(ScriptedTransport::new("COM1"));
        let stage = AsiXyStage::new(SerialEndpoint::new(mock.clone()), Duration::from_secs(2));
        (mock, Arc::new(stage))
    }

    /// Fake controller that remembers the last absolute move.
    fn echoing_controller(mock: &ScriptedTransport) {
        let mut position = (0.0_f64, 0.0_f64);
        mock.with_responder(move |command| {
            if let Some(args) = command.strip_prefix("M ") {
                let values: Vec<f64> = args
                    .split_whitespace()
                    .map(|pair| pair[2..].parse().unwrap())
                    .collect();
                position = (values[0], values[1]);
                Some(vec![":A".to_string()])
            } else if command == "W X Y" {
                Some(vec![format!(":A {} {}", position.0, position.1)])
            } else {
                None
            }
        });
    }

    #[tokio::test]
    async fn absolute_move_reads_back_within_one_step() {
        let (mock, stage) = stage();
        echoing_controller(&mock);

        stage.set_position_steps(12_345, -678).await.unwrap();
        assert_eq!(mock.sent_commands()[0], "M X=1234.500000 Y=-67.800000");

        let (x, y) = stage.position_steps().await.unwrap();
        assert!((x - 12_345).abs() <= 1);
        assert!((y + 678).abs() <= 1);
        assert_eq!(stage.cached_position_steps(), Some((x, y)));
    }

    #[tokio::test]
    async fn micrometre_api_converts_through_step_size() {
        let (mock, stage) = stage();
        echoing_controller(&mock);

        stage.set_position_um(100.0, -25.5).await.unwrap();
        assert_eq!(mock.sent_commands()[0], "M X=1000.000000 Y=-255.000000");
        let (x, y) = stage.position_um().await.unwrap();
        assert!((x - 100.0).abs() < XY_STEP_SIZE_UM);
        assert!((y + 25.5).abs() < XY_STEP_SIZE_UM);
    }

    #[tokio::test]
    async fn rejected_move_reports_device_code() {
        let (mock, stage) = stage();
        mock.expect("R X=0.100000 Y=0.000000", ":N-4");

        let err = stage.set_relative_position_steps(1, 0).await.unwrap_err();
        assert_eq!(err, DaqError::Device { code: ASI_ERR_OFFSET - 4 });
    }

    #[tokio::test]
    async fn garbled_move_reply_is_protocol_error() {
        let (mock, stage) = stage();
        mock.expect("M X=0.000000 Y=0.000000", "garbage");

        let err = stage.set_position_steps(0, 0).await.unwrap_err();
        assert!(matches!(err, DaqError::Protocol(_)));
    }

    #[tokio::test]
    async fn position_failure_drops_cached_position() {
        let (mock, stage) = stage();
        mock.expect("W X Y", ":A 10 20").expect_silence("W X Y");

        assert_eq!(stage.position_steps().await.unwrap(), (100, 200));
        assert!(stage.position_steps().await.unwrap_err().is_link_failure());
        assert_eq!(stage.cached_position_steps(), None);
    }

    #[tokio::test]
    async fn initialize_probes_protocol_direction_and_features() {
        let (mock, stage) = stage();
        mock.expect("/", "N")
            .expect("UM X=-10000 Y=10000", ":A")
            .expect("WT X?", ":X 5")
            .expect("S X?", ":N-1")
            .expect("B X?", ":A X=0.04")
            .expect("E X?", ":X 0.0004")
            .expect_silence("PC X?")
            .expect("OS X?", "?");

        stage.initialize().await.unwrap();

        assert!(mock.remaining_expectations().is_empty());
        assert_eq!(
            stage.features(),
            XyFeatures {
                wait_cycles: true,
                speed: false,
                backlash: true,
                drift_error: true,
                finish_error: false,
                overshoot: true,
            }
        );
        let names = stage.property_names();
        assert!(names.contains(&"Wait_Cycles"));
        assert!(!names.contains(&"Speed-S"));
        assert!(!names.contains(&"FinishError-PCROS(nm)"));
    }

    #[tokio::test]
    async fn busy_reads_only_n_as_idle() {
        let (mock, stage) = stage();
        mock.expect("/", "B").expect("/", "N").expect("/", "?");

        assert!(stage.busy().await);
        assert!(!stage.busy().await);
        assert!(stage.busy().await);
        // Silent controller
        assert!(stage.busy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_polls_until_not_busy() {
        let (mock, stage) = stage();
        mock.expect("/", "B").expect("/", "?").expect("/", "N");

        stage.wait_until_idle().await.unwrap();
        assert_eq!(mock.count("/"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_at_deadline() {
        let (mock, stage) = stage();
        mock.on("/", "B");

        let start = tokio::time::Instant::now();
        let err = stage.wait_until_idle().await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
        assert!(start.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn home_accepts_anything_but_nak() {
        let (mock, stage) = stage();
        mock.expect("! X Y", "?").expect("! X Y", ":N-2");

        stage.home().await.unwrap();
        assert_eq!(
            stage.home().await.unwrap_err(),
            DaqError::Device { code: ASI_ERR_OFFSET - 2 }
        );
    }

    #[tokio::test]
    async fn stop_treats_only_already_stopped_as_success() {
        let (mock, stage) = stage();
        mock.expect("HALT", ":N-21")
            .expect("HALT", ":N-5")
            .expect("HALT", ":A");

        stage.stop().await.unwrap();
        assert_eq!(
            stage.stop().await.unwrap_err(),
            DaqError::Device { code: ASI_ERR_OFFSET - 5 }
        );
        stage.stop().await.unwrap();
    }

    #[tokio::test]
    async fn calibrate_reads_waits_and_homes() {
        let (mock, stage) = stage();
        mock.expect("W X Y", ":A 0 0")
            .expect("/", "N")
            .expect("! X Y", ":A");

        assert_eq!(stage.calibrate().await.unwrap(), CalibrationStatus::Completed);
        assert_eq!(mock.sent_commands(), vec!["W X Y", "/", "! X Y"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_running_calibration() {
        let (mock, stage) = stage();
        mock.on("W X Y", ":A 0 0").on("/", "B").on("HALT", ":A");

        let calibrating = tokio::spawn({
            let stage = stage.clone();
            async move { stage.calibrate().await }
        });
        tokio::time::sleep(Duration::from_millis(350)).await;
        stage.stop().await.unwrap();

        let status = calibrating.await.unwrap().unwrap();
        assert_eq!(status, CalibrationStatus::Cancelled);
        assert_eq!(mock.count("! X Y"), 0);
    }

    #[tokio::test]
    async fn settings_convert_units_and_clamp() {
        let (mock, stage) = stage();
        stage.state.lock().features = XyFeatures {
            wait_cycles: true,
            speed: true,
            backlash: true,
            drift_error: true,
            finish_error: true,
            overshoot: true,
        };
        mock.expect("WT X=255 Y=255", ":A")
            .expect("S X=7.500000 Y=7.500000", ":A")
            .expect("E X=0.000050 Y=0.000050", ":A")
            .expect("PC X?", ":A X=0.000012")
            .expect("OS X?", ":A X=0.015")
            .expect("WT X?", ":X 12")
            .expect("B X=0.04 Y=0.04", ":A");

        stage.set_wait_cycles(300).await.unwrap();
        stage.set_speed_mm_s(9.0).await.unwrap();
        stage.set_drift_error_nm(50.0).await.unwrap();
        assert!((stage.finish_error_nm().await.unwrap() - 12.0).abs() < 1e-6);
        assert!((stage.overshoot_um().await.unwrap() - 15.0).abs() < 1e-9);
        assert_eq!(stage.wait_cycles().await.unwrap(), 12);
        stage.set_backlash_mm(0.04).await.unwrap();
        assert!(stage.set_backlash_mm(-1.0).await.is_err());
        assert!(mock.unexpected().is_empty());
    }

    #[tokio::test]
    async fn missing_feature_is_unsupported() {
        let (mock, stage) = stage();
        let err = stage.speed_mm_s().await.unwrap_err();
        assert!(matches!(err, DaqError::UnsupportedCommand(_)));
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn motor_and_joystick_properties() {
        let (mock, stage) = stage();
        mock.expect("MC X- Y-", ":A")
            .expect("JS X=-60 Y=-5", ":A")
            .expect("JS X=-80 Y=-5", "X=80 :A");

        let value = stage
            .on_property("MotorOnOff", PropertyAction::Set("Off".into()))
            .await
            .unwrap();
        assert_eq!(value, "Off");

        // Unchanged mirror setting sends nothing
        stage
            .on_property("JoyStick Reverse", PropertyAction::Set("Off".into()))
            .await
            .unwrap();
        stage
            .on_property("JoyStick Reverse", PropertyAction::Set("On".into()))
            .await
            .unwrap();
        stage
            .on_property("JoyStick Fast Speed", PropertyAction::Set("80".into()))
            .await
            .unwrap();

        assert_eq!(mock.sent_commands(), vec!["MC X- Y-", "JS X=-60 Y=-5", "JS X=-80 Y=-5"]);
        assert!(stage
            .on_property("JoyStick Slow Speed", PropertyAction::Set("0".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn version_is_payload_after_ack() {
        let (mock, stage) = stage();
        mock.expect("V", ":A Version: USB-9.2g");

        let version = stage
            .on_property("Version", PropertyAction::Get)
            .await
            .unwrap();
        assert_eq!(version, "Version: USB-9.2g");
        assert!(stage
            .on_property("Version", PropertyAction::Set("x".into()))
            .await
            .is_err());
    }

    #[test]
    fn factory_validates_config() {
        let factory = AsiXyStageFactory;
        let valid = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            motion_timeout = "30s"
        });
        assert!(factory.validate(&valid).is_ok());
        let cfg: AsiXyStageConfig = valid.try_into().unwrap();
        assert_eq!(cfg.motion_timeout, Duration::from_secs(30));

        let missing_port = toml::Value::Table(toml::toml! { baud_rate = 9600 });
        assert!(factory.validate(&missing_port).is_err());
    }
}
