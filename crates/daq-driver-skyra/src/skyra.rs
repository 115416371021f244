//! Cobolt / Skyra laser controller driver
//!
//! A Skyra houses up to four lasers addressed by a one digit slot prefix
//! (`2p?` reads the power setpoint of slot 2). A plain Cobolt laser answers the
//! same verbs without a prefix. Replies carry no ack marker: anything except
//! `Syntax error: illegal command` is an answer, setters reply `OK`.
//!
//! Protocol Reference: Cobolt 06-01 / Skyra OEM serial command manual
//!
//! ```text
//! l1 / l0         all lasers on / off
//! {id}glw?        wavelength of slot {id}
//! {id}cp|ci|em    constant power / constant current / modulation mode
//! {id}p <W>       power setpoint in watts
//! {id}slc <mA>    current setpoint
//! ```

use crate::status::{
    decode_first, enabled_label, flag, on_label, ControlMode, Fault, ModulationFlags,
    ModulationKind, OperatingStatus, MODULATION_KINDS,
};
use anyhow::Context;
use async_trait::async_trait;
use daq_core::capabilities::{EmissionControl, ShutterControl, WavelengthSelect};
use daq_core::codec::{lenient_f64, CommandReply, Dialect, SkyraDialect};
use daq_core::detect::{self, DetectionPlan, DetectionStatus};
use daq_core::device::{parse_property, read_only, unknown_property, Device, PropertyAction};
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

/// Baud rates tried by detection, in order.
pub const SKYRA_BAUD_RATES: [u32; 2] = [115_200, 19_200];

/// Laser slots a Skyra can hold.
const LASER_SLOTS: std::ops::RangeInclusive<u8> = 1..=4;

const DETECT_ANSWER_TIMEOUT: Duration = Duration::from_millis(500);

fn default_baud_rate() -> u32 {
    SKYRA_BAUD_RATES[0]
}

// =============================================================================
// SkyraFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the Skyra driver
#[derive(Debug, Clone, Deserialize)]
pub struct SkyraConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate (default: 115200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Current in mA a modulated laser idles at while the shutter is closed
    #[serde(default)]
    pub minimum_current: f64,
    /// Control mode selected during initialization (default: constant_power)
    #[serde(default)]
    pub control_mode: ControlMode,
}

pub struct SkyraFactory;

static SKYRA_CAPABILITIES: &[Capability] = &[
    Capability::ShutterControl,
    Capability::EmissionControl,
    Capability::WavelengthSelect,
];

impl DriverFactory for SkyraFactory {
    fn driver_type(&self) -> &'static str {
        "skyra"
    }

    fn name(&self) -> &'static str {
        "Cobolt Skyra Laser Controller"
    }

    fn capabilities(&self) -> &'static [Capability] {
        SKYRA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: SkyraConfig = config.clone().try_into()?;
        if !detect::is_configured_port(&cfg.port) {
            anyhow::bail!("serial port is not configured (got {:?})", cfg.port);
        }
        if cfg.minimum_current < 0.0 {
            anyhow::bail!("minimum_current must not be negative");
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        let validated = self.validate(&config);
        Box::pin(async move {
            validated?;
            let cfg: SkyraConfig = config.try_into().context("Invalid Skyra config")?;
            let endpoint =
                daq_core::ports::get_or_open_endpoint(&cfg.port, cfg.baud_rate, "Skyra").await?;

            let skyra = Arc::new(Skyra::new(endpoint, &cfg));
            skyra
                .initialize()
                .await
                .with_context(|| format!("Skyra on {} failed to initialize", cfg.port))?;

            let firmware = skyra.identity().firmware;
            Ok(DeviceComponents::new()
                .with_device(skyra.clone())
                .with_shutter_control(skyra.clone())
                .with_emission_control(skyra.clone())
                .with_wavelength_select(skyra)
                .with_metadata(DeviceMetadata {
                    port: Some(cfg.port),
                    firmware: Some(firmware),
                    ..Default::default()
                }))
        })
    }
}

/// Look for a Cobolt or Skyra controller: `@cob0` and `l0` must both answer `OK`.
pub async fn detect_skyra(endpoint: &SerialEndpoint) -> DetectionStatus {
    let plan = DetectionPlan {
        baud_rates: SKYRA_BAUD_RATES.to_vec(),
        answer_timeout: DETECT_ANSWER_TIMEOUT,
        settle: Duration::from_millis(10),
    };
    detect::detect(endpoint, &plan, |endpoint| async move {
        for probe in ["@cob0", "l0"] {
            let reply = endpoint
                .query(
                    probe,
                    SkyraDialect.send_terminator(),
                    SkyraDialect.receive_terminator(),
                )
                .await?;
            if SkyraDialect.parse(&reply).payload != "OK" {
                return Err(DaqError::Protocol(reply));
            }
        }
        Ok(())
    })
    .await
}

// =============================================================================
// Records
// =============================================================================

/// One laser found in a Skyra slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LaserRecord {
    /// Slot digit used as command prefix
    pub laser_id: String,
    pub wavelength: String,
    pub laser_type: String,
    /// Current setpoint the laser reports (`glc?`)
    pub current_on: String,
    pub current_minimum: String,
    /// Maximum current (`gmlc?`)
    pub current_maximum: String,
    pub control_mode: ControlMode,
    /// Last power setpoint in mW
    pub power_on: i64,
    pub modulation_supported: bool,
}

/// Fixed facts read once during initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitIdentity {
    pub serial_number: String,
    pub model: String,
    pub firmware: String,
}

/// Readings of the active laser, refreshed on every wavelength switch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveReadings {
    pub current: String,
    pub output_power_mw: i64,
    /// `None` when the controller could not tell
    pub active: Option<bool>,
    pub modulation: ModulationFlags,
}

#[derive(Debug, Default)]
struct SkyraState {
    identity: UnitIdentity,
    lasers: Vec<LaserRecord>,
    /// Index into `lasers`
    active: usize,
    /// Modulation support of a single-laser unit
    unit_modulation: bool,
    impedance_supported: bool,
    /// Control mode of a single-laser unit
    unit_mode: ControlMode,
    all_lasers: LastCommanded<bool>,
    open: LastCommanded<bool>,
    readings: ActiveReadings,
}

impl SkyraState {
    fn active_laser(&self) -> Option<&LaserRecord> {
        self.lasers.get(self.active)
    }

    fn active_laser_mut(&mut self) -> Option<&mut LaserRecord> {
        self.lasers.get_mut(self.active)
    }

    fn prefix(&self) -> String {
        self.active_laser()
            .map(|laser| laser.laser_id.clone())
            .unwrap_or_default()
    }

    fn modulation_supported(&self) -> bool {
        match self.active_laser() {
            Some(laser) => laser.modulation_supported,
            None => self.unit_modulation,
        }
    }

    fn control_mode(&self) -> ControlMode {
        self.active_laser()
            .map_or(self.unit_mode, |laser| laser.control_mode)
    }
}

// =============================================================================
// Properties
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkyraProperty {
    AllLasers,
    Hours,
    KeyStatus,
    Interlock,
    Fault,
    OperatingStatus,
    SerialNumber,
    Model,
    FirmwareVersion,
    Autostart,
    AutostartStatus,
    Power,
    OutputPower,
    Current,
    OutputCurrent,
    ControlMode,
    Wavelength,
    LaserType,
    Active,
    Laser,
    LaserStatus,
    AnalogImpedance,
    AnalogImpedanceStatus,
    Modulation(ModulationKind),
}

const SKYRA_PROPERTIES: &[(SkyraProperty, &str)] = &[
    (SkyraProperty::AllLasers, "All Lasers"),
    (SkyraProperty::Hours, "Hours"),
    (SkyraProperty::KeyStatus, "Key On/Off"),
    (SkyraProperty::Interlock, "Interlock"),
    (SkyraProperty::Fault, "Fault"),
    (SkyraProperty::OperatingStatus, "Operating Status"),
    (SkyraProperty::SerialNumber, "Serial Number"),
    (SkyraProperty::Model, "Model"),
    (SkyraProperty::FirmwareVersion, "Firmware Version"),
    (SkyraProperty::Autostart, "Autostart"),
    (SkyraProperty::AutostartStatus, "Autostart Status"),
    (SkyraProperty::Power, "Power (mW)"),
    (SkyraProperty::OutputPower, "Output Power (mW)"),
    (SkyraProperty::Current, "Current (mA)"),
    (SkyraProperty::OutputCurrent, "Output Current (mA)"),
    (SkyraProperty::ControlMode, "Control Mode"),
    (SkyraProperty::Wavelength, "Wavelength"),
    (SkyraProperty::LaserType, "Laser Type"),
    (SkyraProperty::Active, "Active"),
    (SkyraProperty::Laser, "Laser"),
    (SkyraProperty::LaserStatus, "Laser Status"),
    (SkyraProperty::AnalogImpedance, "Analog Impedance"),
    (SkyraProperty::AnalogImpedanceStatus, "Analog Impedance Status"),
    (SkyraProperty::Modulation(ModulationKind::Status), "Modulation Status"),
    (SkyraProperty::Modulation(ModulationKind::Analog), "Analog Modulation"),
    (SkyraProperty::Modulation(ModulationKind::Digital), "Digital Modulation"),
    (SkyraProperty::Modulation(ModulationKind::Internal), "Internal Modulation"),
];

impl SkyraProperty {
    /// Whether the property exists on a unit with these capabilities.
    fn available(self, multi_laser: bool, modulation: bool, impedance: bool) -> bool {
        match self {
            SkyraProperty::Wavelength
            | SkyraProperty::LaserType
            | SkyraProperty::Active
            | SkyraProperty::Laser
            | SkyraProperty::LaserStatus => multi_laser,
            SkyraProperty::AnalogImpedance | SkyraProperty::AnalogImpedanceStatus => impedance,
            SkyraProperty::Modulation(_) => modulation,
            _ => true,
        }
    }
}

fn parse_enabled(property: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "Enabled" => Ok(true),
        "Disabled" => Ok(false),
        other => Err(DaqError::InvalidParameter(format!(
            "{property}: expected Enabled or Disabled, got {other:?}"
        ))),
    }
}

fn parse_on(property: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "On" => Ok(true),
        "Off" => Ok(false),
        other => Err(DaqError::InvalidParameter(format!(
            "{property}: expected On or Off, got {other:?}"
        ))),
    }
}

// =============================================================================
// Skyra
// =============================================================================

/// Cobolt single laser or Skyra multi-laser controller.
pub struct Skyra {
    endpoint: SerialEndpoint,
    minimum_current: f64,
    initial_mode: ControlMode,
    state: Mutex<SkyraState>,
}

impl Skyra {
    pub const NAME: &'static str = "Skyra";

    pub fn new(endpoint: SerialEndpoint, config: &SkyraConfig) -> Self {
        Self {
            endpoint,
            minimum_current: config.minimum_current,
            initial_mode: config.control_mode,
            state: Mutex::new(SkyraState::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Wire access
    // -------------------------------------------------------------------------

    async fn exchange(&self, command: &str) -> Result<CommandReply> {
        let raw = self
            .endpoint
            .query(
                command,
                SkyraDialect.send_terminator(),
                SkyraDialect.receive_terminator(),
            )
            .await?;
        log::debug!("Skyra command '{}' response: {}", command, raw.trim());
        Ok(SkyraDialect.parse(&raw))
    }

    /// Send `command`; an illegal-command reply is an error.
    async fn query(&self, command: &str) -> Result<String> {
        self.exchange(command).await?.into_result()
    }

    /// Send `command`; an illegal-command reply reads as `None`.
    async fn query_supported(&self, command: &str) -> Result<Option<String>> {
        let reply = self.exchange(command).await?;
        Ok(if reply.is_nak() {
            None
        } else {
            Some(reply.payload)
        })
    }

    /// Prefix `verb` with the active laser slot.
    fn addressed(&self, verb: &str) -> String {
        SkyraDialect::addressed(&self.state.lock().prefix(), verb)
    }

    // -------------------------------------------------------------------------
    // Cached state
    // -------------------------------------------------------------------------

    pub fn identity(&self) -> UnitIdentity {
        self.state.lock().identity.clone()
    }

    /// Lasers found during initialization, in slot order.
    pub fn lasers(&self) -> Vec<LaserRecord> {
        self.state.lock().lasers.clone()
    }

    pub fn is_multi_laser(&self) -> bool {
        !self.state.lock().lasers.is_empty()
    }

    /// Slot prefix of the active laser; empty on a single-laser unit.
    pub fn active_laser_id(&self) -> String {
        self.state.lock().prefix()
    }

    pub fn active_laser(&self) -> Option<LaserRecord> {
        self.state.lock().active_laser().cloned()
    }

    pub fn readings(&self) -> ActiveReadings {
        self.state.lock().readings.clone()
    }

    pub fn control_mode(&self) -> ControlMode {
        self.state.lock().control_mode()
    }

    pub fn modulation_supported(&self) -> bool {
        self.state.lock().modulation_supported()
    }

    pub fn impedance_supported(&self) -> bool {
        self.state.lock().impedance_supported
    }

    /// Last commanded shutter state.
    pub fn is_open(&self) -> bool {
        self.state.lock().open.get_or(false)
    }

    // -------------------------------------------------------------------------
    // Initialization
    // -------------------------------------------------------------------------

    /// Probe slots 1-4. A slot holds a laser when it reports both a model and a
    /// wavelength other than `0`.
    async fn probe_lasers(&self) -> Result<Vec<LaserRecord>> {
        let mut lasers = Vec::new();
        for slot in LASER_SLOTS {
            let id = slot.to_string();
            let model = match self.query_supported(&SkyraDialect::addressed(&id, "glm?")).await? {
                Some(model) if model != "0" => model,
                _ => continue,
            };
            let wavelength = match self.query_supported(&SkyraDialect::addressed(&id, "glw?")).await? {
                Some(wavelength) if wavelength != "0" => wavelength,
                _ => continue,
            };

            let current_on = self
                .query_supported(&SkyraDialect::addressed(&id, "glc?"))
                .await?
                .unwrap_or_else(|| "0".to_string());
            let current_maximum = self
                .query_supported(&SkyraDialect::addressed(&id, "gmlc?"))
                .await?
                .unwrap_or_else(|| "0".to_string());
            let modulation_supported = self
                .query_supported(&SkyraDialect::addressed(&id, "gmes?"))
                .await?
                .is_some();

            tracing::debug!(slot = %id, %wavelength, %model, "Found laser");
            lasers.push(LaserRecord {
                laser_id: id,
                wavelength,
                laser_type: model,
                current_on,
                current_minimum: self.minimum_current.to_string(),
                current_maximum,
                control_mode: ControlMode::ConstantPower,
                power_on: 0,
                modulation_supported,
            });
        }
        Ok(lasers)
    }

    // -------------------------------------------------------------------------
    // Control mode, power and current
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(port = self.endpoint.name()), err)]
    pub async fn set_control_mode(&self, mode: ControlMode) -> Result<()> {
        if mode == ControlMode::Modulation && !self.modulation_supported() {
            return Err(DaqError::UnsupportedCommand(format!(
                "laser {:?} has no modulation mode",
                self.active_laser_id()
            )));
        }
        self.query(&self.addressed(mode.verb())).await?;

        let mut state = self.state.lock();
        match state.active_laser_mut() {
            Some(laser) => laser.control_mode = mode,
            None => state.unit_mode = mode,
        }
        state.readings.modulation.status = mode == ControlMode::Modulation;
        Ok(())
    }

    /// Power setpoint in mW.
    pub async fn power_setpoint_mw(&self) -> Result<i64> {
        let reply = self.query(&self.addressed("p?")).await?;
        Ok((lenient_f64(&reply) * 1000.0) as i64)
    }

    /// Switch to constant power and set the setpoint in mW.
    #[instrument(skip(self), fields(port = self.endpoint.name()), err)]
    pub async fn set_power_setpoint_mw(&self, power_mw: i64) -> Result<()> {
        self.set_control_mode(ControlMode::ConstantPower).await?;
        let watts = power_mw as f64 / 1000.0;
        self.query(&self.addressed(&format!("p {watts}"))).await?;
        if let Some(laser) = self.state.lock().active_laser_mut() {
            laser.power_on = power_mw;
        }
        Ok(())
    }

    /// Emitted power in mW.
    pub async fn output_power_mw(&self) -> Result<i64> {
        let reply = self.query(&self.addressed("pa?")).await?;
        Ok((lenient_f64(&reply) * 1000.0) as i64)
    }

    /// Drive current in mA as reported.
    pub async fn output_current(&self) -> Result<String> {
        self.query(&self.addressed("i?")).await
    }

    /// Switch to constant current and set the current in mA.
    #[instrument(skip(self), fields(port = self.endpoint.name()), err)]
    pub async fn set_current_ma(&self, current_ma: f64) -> Result<()> {
        self.set_control_mode(ControlMode::ConstantCurrent).await?;
        self.query(&self.addressed(&format!("slc {current_ma}")))
            .await?;
        let mut state = self.state.lock();
        state.readings.current = current_ma.to_string();
        state.readings.modulation.status = false;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Per-laser and unit switches
    // -------------------------------------------------------------------------

    /// Whether the active laser takes part when all lasers are switched on.
    pub async fn is_laser_active(&self) -> Result<bool> {
        Ok(flag(&self.query(&self.addressed("gla?")).await?))
    }

    pub async fn set_laser_active(&self, active: bool) -> Result<()> {
        let verb = if active { "sla 1" } else { "sla 0" };
        self.query(&self.addressed(verb)).await?;
        self.state.lock().readings.active = Some(active);
        Ok(())
    }

    /// Whether the active laser is on.
    pub async fn is_laser_on(&self) -> Result<bool> {
        Ok(flag(&self.query(&self.addressed("l?")).await?))
    }

    pub async fn set_laser_on(&self, on: bool) -> Result<()> {
        let verb = if on { "l1" } else { "l0" };
        self.query(&self.addressed(verb)).await.map(|_| ())
    }

    /// Switch every laser of the unit.
    #[instrument(skip(self), fields(port = self.endpoint.name()), err)]
    pub async fn set_all_lasers(&self, on: bool) -> Result<()> {
        self.query(if on { "l1" } else { "l0" }).await?;
        self.state.lock().all_lasers.record(on);
        Ok(())
    }

    pub fn all_lasers_on(&self) -> bool {
        self.state.lock().all_lasers.get_or(false)
    }

    pub async fn hours(&self) -> Result<String> {
        self.query("hrs?").await
    }

    pub async fn key_on(&self) -> Result<bool> {
        let reply = self.query("@cobasks?").await?;
        decode_first(&reply, |c| match c {
            '0' => Some(false),
            '1' => Some(true),
            _ => None,
        })
    }

    pub async fn interlock_open(&self) -> Result<bool> {
        let reply = self.query("ilk?").await?;
        decode_first(&reply, |c| match c {
            '0' => Some(false),
            '1' => Some(true),
            _ => None,
        })
    }

    pub async fn operating_status(&self) -> Result<OperatingStatus> {
        let multi_laser = self.is_multi_laser();
        let reply = self.query("gom?").await?;
        decode_first(&reply, |c| OperatingStatus::from_code(c, multi_laser))
    }

    pub async fn fault(&self) -> Result<Fault> {
        let reply = self.query("f?").await?;
        decode_first(&reply, Fault::from_code)
    }

    pub async fn autostart(&self) -> Result<bool> {
        Ok(flag(&self.query("@cobas?").await?))
    }

    pub async fn set_autostart(&self, enabled: bool) -> Result<()> {
        self.query(if enabled { "@cobas 1" } else { "@cobas 0" })
            .await
            .map(|_| ())
    }

    pub async fn analog_impedance(&self) -> Result<bool> {
        self.require_impedance()?;
        Ok(flag(&self.query("galis?").await?))
    }

    pub async fn set_analog_impedance(&self, enabled: bool) -> Result<()> {
        self.require_impedance()?;
        self.query(if enabled { "salis 1" } else { "salis 0" })
            .await
            .map(|_| ())
    }

    fn require_impedance(&self) -> Result<()> {
        if self.impedance_supported() {
            Ok(())
        } else {
            Err(DaqError::UnsupportedCommand("galis?".to_string()))
        }
    }

    // -------------------------------------------------------------------------
    // Modulation
    // -------------------------------------------------------------------------

    pub async fn modulation(&self, kind: ModulationKind) -> Result<bool> {
        let on = flag(&self.query(&self.addressed(kind.query())).await?);
        self.state.lock().readings.modulation.set(kind, on);
        Ok(on)
    }

    /// Analog and digital modulation may run together; internal modulation runs alone.
    #[instrument(skip(self), fields(port = self.endpoint.name()), err)]
    pub async fn set_modulation(&self, kind: ModulationKind, on: bool) -> Result<()> {
        let commands: &[&str] = match (kind, on) {
            (ModulationKind::Status, true) => {
                return self.set_control_mode(ControlMode::Modulation).await;
            }
            (ModulationKind::Status, false) => {
                return Err(DaqError::InvalidParameter(
                    "modulation cannot be switched off, select constant power or constant current"
                        .to_string(),
                ));
            }
            (ModulationKind::Analog, true) => &["eswm 0", "sames 1"],
            (ModulationKind::Analog, false) => &["sames 0"],
            (ModulationKind::Digital, true) => &["eswm 0", "sdmes 1"],
            (ModulationKind::Digital, false) => &["sdmes 0"],
            (ModulationKind::Internal, true) => &["sames 0", "sdmes 0", "eswm 1"],
            (ModulationKind::Internal, false) => &["eswm 0"],
        };
        for verb in commands {
            self.query(&self.addressed(verb)).await?;
        }

        let mut state = self.state.lock();
        let flags = &mut state.readings.modulation;
        if on && kind != ModulationKind::Internal {
            flags.internal = false;
        }
        if on && kind == ModulationKind::Internal {
            flags.analog = false;
            flags.digital = false;
        }
        flags.set(kind, on);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Wavelength switching
    // -------------------------------------------------------------------------

    /// Make the laser at `wavelength` active and refresh its readings.
    ///
    /// Each reading is queried live; a failed query keeps the value stored in the
    /// laser record.
    #[instrument(skip(self), fields(port = self.endpoint.name()), err)]
    pub async fn set_wavelength(&self, wavelength: &str) -> Result<()> {
        let record = {
            let mut state = self.state.lock();
            let index = state
                .lasers
                .iter()
                .position(|laser| laser.wavelength == wavelength.trim())
                .ok_or_else(|| {
                    DaqError::InvalidParameter(format!("no laser at wavelength {wavelength:?}"))
                })?;
            state.active = index;
            state.lasers[index].clone()
        };
        tracing::info!(laser = %record.laser_id, wavelength = %record.wavelength, "Active laser");

        let current = match self.output_current().await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(error = %e, "Using recorded current");
                record.current_on.clone()
            }
        };
        let output_power_mw = match self.output_power_mw().await {
            Ok(power) => power,
            Err(e) => {
                tracing::warn!(error = %e, "Using recorded power");
                record.power_on
            }
        };
        let active = self.is_laser_active().await.ok();

        let mut modulation = ModulationFlags {
            status: record.control_mode == ControlMode::Modulation,
            ..Default::default()
        };
        for (kind, _, _) in MODULATION_KINDS {
            match self.query(&self.addressed(kind.query())).await {
                Ok(reply) => modulation.set(*kind, flag(&reply)),
                Err(e) => tracing::debug!(kind = kind.label(), error = %e, "Modulation flag kept"),
            }
        }

        self.state.lock().readings = ActiveReadings {
            current,
            output_power_mw,
            active,
            modulation,
        };
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shutter
    // -------------------------------------------------------------------------

    /// A modulation-capable laser is gated by dropping to its minimum current, so it
    /// never has to be switched off. Anything else switches all lasers.
    #[instrument(skip(self), fields(port = self.endpoint.name()), err)]
    pub async fn set_open(&self, open: bool) -> Result<()> {
        let gate_current = {
            let state = self.state.lock();
            state
                .active_laser()
                .filter(|laser| laser.modulation_supported)
                .map(|laser| {
                    if open {
                        laser.current_maximum.clone()
                    } else {
                        laser.current_minimum.clone()
                    }
                })
        };

        match gate_current {
            Some(current) => self.set_current_ma(lenient_f64(&current)).await?,
            None => self.set_all_lasers(open).await?,
        }
        self.state.lock().open.record(open);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    fn property_available(&self, property: SkyraProperty) -> bool {
        let state = self.state.lock();
        property.available(
            !state.lasers.is_empty(),
            state.modulation_supported(),
            state.impedance_supported,
        )
    }

    async fn get_property(&self, property: SkyraProperty) -> Result<String> {
        Ok(match property {
            SkyraProperty::AllLasers => on_label(self.all_lasers_on()).to_string(),
            SkyraProperty::Hours => self.hours().await?,
            SkyraProperty::KeyStatus => on_label(self.key_on().await?).to_string(),
            SkyraProperty::Interlock => match self.interlock_open().await? {
                true => "Open".to_string(),
                false => "Closed".to_string(),
            },
            SkyraProperty::Fault => self.fault().await?.label().to_string(),
            SkyraProperty::OperatingStatus => self.operating_status().await?.label().to_string(),
            SkyraProperty::SerialNumber => self.identity().serial_number,
            SkyraProperty::Model => self.identity().model,
            SkyraProperty::FirmwareVersion => self.identity().firmware,
            SkyraProperty::Autostart | SkyraProperty::AutostartStatus => {
                enabled_label(self.autostart().await?).to_string()
            }
            SkyraProperty::Power => self.power_setpoint_mw().await?.to_string(),
            SkyraProperty::OutputPower => self.output_power_mw().await?.to_string(),
            SkyraProperty::Current => self.readings().current,
            SkyraProperty::OutputCurrent => self.output_current().await?,
            SkyraProperty::ControlMode => self.control_mode().label().to_string(),
            SkyraProperty::Wavelength => self.active_laser().map(|l| l.wavelength).unwrap_or_default(),
            SkyraProperty::LaserType => self.active_laser().map(|l| l.laser_type).unwrap_or_default(),
            SkyraProperty::Active => match self.is_laser_active().await? {
                true => "Active".to_string(),
                false => "Inactive".to_string(),
            },
            SkyraProperty::Laser | SkyraProperty::LaserStatus => {
                on_label(self.is_laser_on().await?).to_string()
            }
            SkyraProperty::AnalogImpedance | SkyraProperty::AnalogImpedanceStatus => {
                enabled_label(self.analog_impedance().await?).to_string()
            }
            SkyraProperty::Modulation(kind) => enabled_label(self.modulation(kind).await?).to_string(),
        })
    }

    async fn set_property(&self, property: SkyraProperty, label: &str, value: &str) -> Result<()> {
        match property {
            SkyraProperty::AllLasers => self.set_all_lasers(parse_on(label, value)?).await,
            SkyraProperty::Autostart => self.set_autostart(parse_enabled(label, value)?).await,
            SkyraProperty::Power => self.set_power_setpoint_mw(parse_property(label, value)?).await,
            SkyraProperty::Current => self.set_current_ma(parse_property(label, value)?).await,
            SkyraProperty::ControlMode => self.set_control_mode(ControlMode::from_label(value)?).await,
            SkyraProperty::Wavelength => self.set_wavelength(value).await,
            SkyraProperty::Active => match value.trim() {
                "Active" => self.set_laser_active(true).await,
                "Inactive" => self.set_laser_active(false).await,
                other => Err(DaqError::InvalidParameter(format!(
                    "{label}: expected Active or Inactive, got {other:?}"
                ))),
            },
            SkyraProperty::Laser => self.set_laser_on(parse_on(label, value)?).await,
            SkyraProperty::AnalogImpedance => {
                self.set_analog_impedance(parse_enabled(label, value)?).await
            }
            SkyraProperty::Modulation(kind) => {
                self.set_modulation(kind, parse_enabled(label, value)?).await
            }
            _ => Err(read_only(label)),
        }
    }
}

// =============================================================================
// Device and capability traits
// =============================================================================

#[async_trait]
impl Device for Skyra {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self), fields(port = self.endpoint.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.set_all_lasers(true).await?;

        let identity = UnitIdentity {
            serial_number: self.query("sn?").await?,
            model: self.query("glm?").await?,
            firmware: self.query("ver?").await?,
        };
        let autostart = self.autostart().await?;

        let lasers = self.probe_lasers().await?;
        let unit_modulation = if lasers.is_empty() {
            // A single laser answers `em` only if it can modulate
            let supported = self.query_supported("em").await?.is_some();
            if supported {
                self.query("cp").await?;
            }
            supported
        } else {
            false
        };
        let impedance_supported = self.query_supported("galis?").await?.is_some();

        let laser_count = lasers.len();
        {
            let mut state = self.state.lock();
            state.identity = identity.clone();
            state.lasers = lasers;
            state.active = 0;
            state.unit_modulation = unit_modulation;
            state.impedance_supported = impedance_supported;
        }

        self.set_control_mode(self.initial_mode).await?;

        tracing::info!(
            port = self.endpoint.name(),
            serial = %identity.serial_number,
            model = %identity.model,
            lasers = laser_count,
            autostart,
            "Skyra initialized"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn busy(&self) -> bool {
        false
    }

    fn property_names(&self) -> Vec<&'static str> {
        SKYRA_PROPERTIES
            .iter()
            .filter(|(property, _)| self.property_available(*property))
            .map(|(_, label)| *label)
            .collect()
    }

    async fn on_property(&self, name: &str, action: PropertyAction) -> Result<String> {
        let (property, label) = SKYRA_PROPERTIES
            .iter()
            .find(|(property, label)| *label == name && self.property_available(*property))
            .copied()
            .ok_or_else(|| unknown_property(Self::NAME, name))?;
        if let PropertyAction::Set(value) = action {
            self.set_property(property, label, &value).await?;
        }
        self.get_property(property).await
    }
}

#[async_trait]
impl ShutterControl for Skyra {
    async fn open_shutter(&self) -> Result<()> {
        self.set_open(true).await
    }

    async fn close_shutter(&self) -> Result<()> {
        self.set_open(false).await
    }

    async fn is_shutter_open(&self) -> Result<bool> {
        Ok(self.is_open())
    }
}

#[async_trait]
impl EmissionControl for Skyra {
    async fn enable_emission(&self) -> Result<()> {
        self.set_all_lasers(true).await
    }

    async fn disable_emission(&self) -> Result<()> {
        self.set_all_lasers(false).await
    }

    async fn is_emission_enabled(&self) -> Result<bool> {
        Ok(self.all_lasers_on())
    }
}

#[async_trait]
impl WavelengthSelect for Skyra {
    fn wavelengths(&self) -> Vec<String> {
        self.state
            .lock()
            .lasers
            .iter()
            .map(|laser| laser.wavelength.clone())
            .collect()
    }

    fn active_wavelength(&self) -> Option<String> {
        self.active_laser().map(|laser| laser.wavelength)
    }

    async fn select_wavelength(&self, wavelength: &str) -> Result<()> {
        self.set_wavelength(wavelength).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::codec::skyra::UNSUPPORTED_REPLY;
    use daq_core::mock::ScriptedTransport;
    use std::collections::HashMap;

    fn config() -> SkyraConfig {
        toml::Value::Table(toml::toml! {
            port = "COM7"
            minimum_current = 5.0
        })
        .try_into()
        .unwrap()
    }

    /// Fake unit: queries answer from `table`, setters answer `OK`, anything
    /// else is an illegal command.
    fn fake_unit(mock: &ScriptedTransport, table: &[(&str, &str)]) {
        let table: HashMap<String, String> = table
            .iter()
            .map(|(c, r)| (c.to_string(), r.to_string()))
            .collect();
        mock.with_responder(move |command| {
            let reply = match table.get(command) {
                Some(reply) => reply.clone(),
                None if command.ends_with('?') => UNSUPPORTED_REPLY.to_string(),
                None => "OK".to_string(),
            };
            Some(vec![reply])
        });
    }

    const TWO_LASERS: &[(&str, &str)] = &[
        ("sn?", "24601"),
        ("glm?", "SKYRA-4"),
        ("ver?", "9.001"),
        ("@cobas?", "1"),
        ("1glm?", "0488-06-01-0060"),
        ("1glw?", "488"),
        ("1glc?", "110.0"),
        ("1gmlc?", "150.0"),
        ("1gmes?", "0"),
        ("2glm?", "0561-06-01-0050"),
        ("2glw?", "561"),
        ("2glc?", "95.0"),
        ("2gmlc?", "130.0"),
        ("3glm?", "0"),
        ("4glm?", "0"),
        ("galis?", "0"),
        ("2i?", "96.5"),
        ("2pa?", "0.0498"),
        ("2gla?", "1"),
        ("2games?", "1"),
        ("2gdmes?", "0"),
        ("2gswm?", "0"),
    ];

    async fn two_laser_unit() -> (Arc<ScriptedTransport>, Skyra) {
        let mock = Arc::new(ScriptedTransport::new("COM7"));
        fake_unit(&mock, TWO_LASERS);
        let skyra = Skyra::new(SerialEndpoint::new(mock.clone()), &config());
        skyra.initialize().await.unwrap();
        (mock, skyra)
    }

    #[tokio::test]
    async fn initialize_finds_two_lasers_in_slot_order() {
        let (mock, skyra) = two_laser_unit().await;

        let lasers = skyra.lasers();
        assert_eq!(lasers.len(), 2);
        assert_eq!(lasers[0].laser_id, "1");
        assert_eq!(lasers[0].wavelength, "488");
        assert_eq!(lasers[0].current_maximum, "150.0");
        assert_eq!(lasers[0].current_minimum, "5");
        assert!(lasers[0].modulation_supported);
        assert_eq!(lasers[1].laser_id, "2");
        assert_eq!(lasers[1].laser_type, "0561-06-01-0050");
        assert!(!lasers[1].modulation_supported);

        assert_eq!(skyra.identity().serial_number, "24601");
        assert_eq!(skyra.active_laser_id(), "1");
        assert!(skyra.all_lasers_on());
        assert!(skyra.impedance_supported());
        assert_eq!(mock.sent_commands()[0], "l1");
        assert_eq!(mock.count("1cp"), 1);
        // Empty slots are never asked for a wavelength
        assert_eq!(mock.count("3glw?"), 0);
    }

    #[tokio::test]
    async fn slot_reporting_zero_wavelength_is_empty() {
        let mut table: Vec<(&str, &str)> = TWO_LASERS
            .iter()
            .copied()
            .filter(|(command, _)| *command != "3glm?")
            .collect();
        table.push(("3glm?", "0640-06-01-0100"));
        table.push(("3glw?", "0"));

        let mock = Arc::new(ScriptedTransport::new("COM7"));
        fake_unit(&mock, &table);
        let skyra = Skyra::new(SerialEndpoint::new(mock.clone()), &config());
        skyra.initialize().await.unwrap();

        let ids: Vec<_> = skyra.lasers().into_iter().map(|l| l.laser_id).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(mock.count("3glw?"), 1);
        assert_eq!(mock.count("3glc?"), 0);
    }

    #[tokio::test]
    async fn wavelength_switch_repoints_and_refreshes() {
        let (_mock, skyra) = two_laser_unit().await;

        skyra.select_wavelength("561").await.unwrap();

        assert_eq!(skyra.active_laser_id(), "2");
        assert_eq!(skyra.active_wavelength().as_deref(), Some("561"));
        let readings = skyra.readings();
        assert_eq!(readings.current, "96.5");
        assert_eq!(readings.output_power_mw, 49);
        assert_eq!(readings.active, Some(true));
        assert!(readings.modulation.analog);
        assert!(!readings.modulation.internal);
    }

    #[tokio::test]
    async fn wavelength_switch_falls_back_to_record() {
        let (_mock, skyra) = two_laser_unit().await;

        // Slot 1 has no live readings in the table
        skyra.set_wavelength("561").await.unwrap();
        skyra.set_wavelength("488").await.unwrap();

        let readings = skyra.readings();
        assert_eq!(skyra.active_laser_id(), "1");
        assert_eq!(readings.current, "110.0");
        assert_eq!(readings.active, None);
        assert!(skyra.set_wavelength("640").await.is_err());
        assert_eq!(skyra.active_laser_id(), "1");
    }

    #[tokio::test]
    async fn modulated_laser_is_gated_by_current() {
        let (mock, skyra) = two_laser_unit().await;
        mock.clear_log();

        skyra.open_shutter().await.unwrap();
        skyra.close_shutter().await.unwrap();

        assert_eq!(
            mock.sent_commands(),
            vec!["1ci", "1slc 150", "1ci", "1slc 5"]
        );
        assert!(!skyra.is_shutter_open().await.unwrap());
        assert_eq!(skyra.control_mode(), ControlMode::ConstantCurrent);
    }

    #[tokio::test(start_paused = true)]
    async fn unmodulated_laser_fires_all_lasers() {
        let (mock, skyra) = two_laser_unit().await;
        skyra.set_wavelength("561").await.unwrap();
        mock.clear_log();

        skyra.fire(Duration::from_millis(20)).await.unwrap();

        assert_eq!(mock.sent_commands(), vec!["l1", "l0"]);
        assert!(!skyra.is_open());
        assert!(!skyra.is_emission_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn modulation_mode_requires_support() {
        let (mock, skyra) = two_laser_unit().await;
        skyra.set_wavelength("561").await.unwrap();
        mock.clear_log();

        assert!(matches!(
            skyra.set_control_mode(ControlMode::Modulation).await,
            Err(DaqError::UnsupportedCommand(_))
        ));
        assert!(mock.sent_commands().is_empty());
    }

    #[tokio::test]
    async fn power_setpoint_forces_constant_power() {
        let (mock, skyra) = two_laser_unit().await;
        skyra.set_control_mode(ControlMode::ConstantCurrent).await.unwrap();
        mock.clear_log();

        skyra.set_power_setpoint_mw(50).await.unwrap();

        assert_eq!(mock.sent_commands(), vec!["1cp", "1p 0.05"]);
        assert_eq!(skyra.active_laser().unwrap().power_on, 50);
        assert_eq!(skyra.control_mode(), ControlMode::ConstantPower);
    }

    #[tokio::test]
    async fn modulation_switches_follow_exclusion_rules() {
        let (mock, skyra) = two_laser_unit().await;
        mock.clear_log();

        skyra
            .set_modulation(ModulationKind::Internal, true)
            .await
            .unwrap();
        skyra
            .set_modulation(ModulationKind::Analog, true)
            .await
            .unwrap();
        assert!(skyra
            .set_modulation(ModulationKind::Status, false)
            .await
            .is_err());

        assert_eq!(
            mock.sent_commands(),
            vec!["1sames 0", "1sdmes 0", "1eswm 1", "1eswm 0", "1sames 1"]
        );
        let flags = skyra.readings().modulation;
        assert!(flags.analog);
        assert!(!flags.internal);
    }

    #[tokio::test]
    async fn single_laser_probes_modulation_and_returns_to_constant_power() {
        let mock = Arc::new(ScriptedTransport::new("COM7"));
        fake_unit(
            &mock,
            &[
                ("sn?", "1001"),
                ("glm?", "06-01"),
                ("ver?", "4.2"),
                ("@cobas?", "0"),
                ("gom?", "3"),
            ],
        );
        let skyra = Skyra::new(SerialEndpoint::new(mock.clone()), &config());
        skyra.initialize().await.unwrap();

        assert!(!skyra.is_multi_laser());
        assert!(skyra.modulation_supported());
        assert!(!skyra.impedance_supported());
        assert_eq!(skyra.active_laser_id(), "");
        assert_eq!(mock.count("em"), 1);
        // Once after the probe, once for the configured mode
        assert_eq!(mock.count("cp"), 2);
        assert_eq!(
            skyra.operating_status().await.unwrap(),
            OperatingStatus::OnOffModulation
        );
        assert!(!skyra.property_names().contains(&"Wavelength"));
        assert!(skyra
            .on_property("Analog Impedance", PropertyAction::Get)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unit_status_properties() {
        let mock = Arc::new(ScriptedTransport::new("COM7"));
        let mut table = TWO_LASERS.to_vec();
        table.extend([
            ("hrs?", "1234.5"),
            ("@cobasks?", "1"),
            ("ilk?", "0"),
            ("f?", "3"),
            ("gom?", "2"),
        ]);
        fake_unit(&mock, &table);
        let skyra = Skyra::new(SerialEndpoint::new(mock.clone()), &config());
        skyra.initialize().await.unwrap();

        let get = |name: &'static str| skyra.on_property(name, PropertyAction::Get);
        assert_eq!(get("Hours").await.unwrap(), "1234.5");
        assert_eq!(get("Key On/Off").await.unwrap(), "On");
        assert_eq!(get("Interlock").await.unwrap(), "Closed");
        assert_eq!(get("Fault").await.unwrap(), "Open Interlock");
        assert_eq!(get("Operating Status").await.unwrap(), "Waiting for key");
        assert_eq!(get("Autostart Status").await.unwrap(), "Enabled");
        assert_eq!(get("Firmware Version").await.unwrap(), "9.001");
        assert!(skyra
            .on_property("Hours", PropertyAction::Set("1".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn detection_tries_both_baud_rates() {
        let mock = Arc::new(ScriptedTransport::new("COM7"));
        // Silent at 115200, answers at 19200
        mock.expect_silence("@cob0")
            .expect("@cob0", "OK")
            .expect("l0", "OK");
        let endpoint = SerialEndpoint::new(mock.clone());

        let status = detect_skyra(&endpoint).await;

        assert_eq!(status, DetectionStatus::CanCommunicate { baud_rate: 19_200 });
    }

    #[tokio::test]
    async fn detection_rejects_other_devices() {
        let mock = Arc::new(ScriptedTransport::new("COM7"));
        mock.on("@cob0", ":N-1");

        let status = detect_skyra(&SerialEndpoint::new(mock)).await;
        assert_eq!(status, DetectionStatus::CanNotCommunicate);
    }

    #[test]
    fn factory_validates_port() {
        let factory = SkyraFactory;
        assert_eq!(factory.driver_type(), "skyra");
        assert!(factory
            .validate(&toml::Value::Table(toml::toml! { port = "undefined" }))
            .is_err());
        assert!(factory
            .validate(&toml::Value::Table(toml::toml! {
                port = "/dev/ttyUSB1"
                control_mode = "constant_current"
            }))
            .is_ok());
        assert!(factory
            .validate(&toml::Value::Table(toml::toml! {
                port = "/dev/ttyUSB1"
                minimum_current = -1.0
            }))
            .is_err());
    }
}
