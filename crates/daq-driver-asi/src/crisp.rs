//! ASI CRISP continuous reflection autofocus
//!
//! State is the character at offset 3 of the `LK X?` reply. Transitions are
//! requested with `LK F=<code>`, where the code is the ASCII value of the key
//! the front panel menu would use (`O` idle, `U` unlock, `S` lock, ...).
//!
//! Tuning parameters (calibration gain, lock range, averaging, gain multiplier)
//! are read back from the controller on every access. LED intensity and
//! objective NA are only kept locally.

use crate::config::{default_lock_timeout, PortConfig};
use crate::port::AsiPort;
use crate::z_stage::ZAxis;
use anyhow::Context;
use async_trait::async_trait;
use daq_core::capabilities::Autofocus;
use daq_core::codec::{lenient_f64, number_after_prefix, AsiCommand};
use daq_core::device::{parse_property, read_only, unknown_property, Device, PropertyAction};
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{DaqError, Result};
use daq_core::poll::{poll_until, PollOutcome, PollSettings};
use daq_core::state::Confirmed;
use daq_core::transport::SerialEndpoint;
use daq_core::CancellationToken;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Focus curve dumps are split into chunks a host property can hold.
const FOCUS_CURVE_CHUNK: usize = 975;
pub const FOCUS_CURVE_BUFFERS: usize = 5;
/// Upper bound on dump lines, far above what the firmware sends.
const FOCUS_CURVE_MAX_LINES: usize = 1024;

fn default_crisp_settle() -> Duration {
    Duration::from_millis(1000)
}

fn default_numerical_aperture() -> f64 {
    0.65
}

fn default_led_intensity() -> u8 {
    50
}

// =============================================================================
// CrispState
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrispState {
    Idle,
    Ready,
    Dim,
    Lock,
    /// Locked and within the focus window
    InFocus,
    Inhibit,
    Error,
    LogAmpCalibration,
    /// Can be requested but is never reported
    GainCalibration,
    Calibrating,
    Dither,
    Curve,
    Balance,
    ResetFocusOffset,
}

const CRISP_CODES: &[(char, CrispState)] = &[
    ('I', CrispState::Idle),
    ('R', CrispState::Ready),
    ('1', CrispState::Calibrating),
    ('2', CrispState::Calibrating),
    ('3', CrispState::Calibrating),
    ('4', CrispState::Calibrating),
    ('5', CrispState::Calibrating),
    ('g', CrispState::Calibrating),
    ('h', CrispState::Calibrating),
    ('i', CrispState::Calibrating),
    ('j', CrispState::Calibrating),
    ('D', CrispState::Dim),
    ('K', CrispState::Lock),
    ('F', CrispState::InFocus),
    ('N', CrispState::Inhibit),
    ('E', CrispState::Error),
    ('G', CrispState::LogAmpCalibration),
    ('f', CrispState::Dither),
    ('C', CrispState::Curve),
    ('B', CrispState::Balance),
    ('l', CrispState::ResetFocusOffset),
];

const CRISP_LABELS: &[(CrispState, &str)] = &[
    (CrispState::Idle, "Idle"),
    (CrispState::Ready, "Ready"),
    (CrispState::Dim, "Dim"),
    (CrispState::Lock, "Lock"),
    (CrispState::InFocus, "In Focus"),
    (CrispState::Inhibit, "Inhibit"),
    (CrispState::Error, "Error"),
    (CrispState::LogAmpCalibration, "loG_cal"),
    (CrispState::GainCalibration, "gain_Cal"),
    (CrispState::Calibrating, "Calibrating"),
    (CrispState::Dither, "Dither"),
    (CrispState::Curve, "Curve"),
    (CrispState::Balance, "Balance"),
    (CrispState::ResetFocusOffset, "Reset Focus Offset"),
];

impl CrispState {
    pub fn from_code(code: char) -> Option<Self> {
        CRISP_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, state)| *state)
    }

    pub fn label(self) -> &'static str {
        CRISP_LABELS
            .iter()
            .find(|(state, _)| *state == self)
            .map_or("", |(_, label)| label)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        CRISP_LABELS
            .iter()
            .find(|(_, l)| *l == label)
            .map(|(state, _)| *state)
    }

    /// `LK F=` code that requests this state, if it can be requested directly.
    fn request_code(self) -> Option<u8> {
        match self {
            CrispState::Idle => Some(b'O'),
            CrispState::Ready => Some(b'U'),
            CrispState::Lock => Some(b'S'),
            CrispState::LogAmpCalibration => Some(b'H'),
            CrispState::GainCalibration => Some(b'C'),
            CrispState::Dither => Some(b'f'),
            CrispState::ResetFocusOffset => Some(b'l'),
            _ => None,
        }
    }
}

// =============================================================================
// Properties
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrispProperty {
    State,
    WaitAfterLock,
    NumericalAperture,
    LockRange,
    CalibrationGain,
    LedIntensity,
    GainMultiplier,
    NumberOfAverages,
    ObtainFocusCurve,
    FocusCurveData(usize),
    SignalNoiseRatio,
}

const CRISP_PROPERTIES: &[(CrispProperty, &str)] = &[
    (CrispProperty::State, "CRISP State"),
    (CrispProperty::WaitAfterLock, "Wait ms after Lock"),
    (CrispProperty::NumericalAperture, "Objective NA"),
    (CrispProperty::LockRange, "Max Lock Range(mm)"),
    (CrispProperty::CalibrationGain, "Calibration Gain"),
    (CrispProperty::LedIntensity, "LED Intensity"),
    (CrispProperty::GainMultiplier, "GainMultiplier"),
    (CrispProperty::NumberOfAverages, "Number of Averages"),
    (CrispProperty::ObtainFocusCurve, "Obtain Focus Curve"),
    (CrispProperty::FocusCurveData(0), "Focus Curve Data0"),
    (CrispProperty::FocusCurveData(1), "Focus Curve Data1"),
    (CrispProperty::FocusCurveData(2), "Focus Curve Data2"),
    (CrispProperty::FocusCurveData(3), "Focus Curve Data3"),
    (CrispProperty::FocusCurveData(4), "Focus Curve Data4"),
    (CrispProperty::SignalNoiseRatio, "Signal Noise Ratio"),
];

const OBTAIN_FOCUS_CURVE: &str = "Do it";

// =============================================================================
// AsiCrispFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the CRISP driver
#[derive(Debug, Clone, Deserialize)]
pub struct AsiCrispConfig {
    #[serde(flatten)]
    pub serial: PortConfig,
    /// Axis the gain multiplier is read from (default: Z)
    #[serde(default)]
    pub axis: ZAxis,
    /// Hold after lock before judging a focus (default: 1s)
    #[serde(default = "default_crisp_settle", with = "humantime_serde")]
    pub wait_after_lock: Duration,
    /// How long a focus may take to lock (default: 3s)
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Objective numerical aperture, 0-1.65 (default: 0.65)
    #[serde(default = "default_numerical_aperture")]
    pub numerical_aperture: f64,
    /// LED intensity in percent (default: 50)
    #[serde(default = "default_led_intensity")]
    pub led_intensity: u8,
}

pub struct AsiCrispFactory;

static CRISP_CAPABILITIES: &[Capability] = &[Capability::Autofocus];

impl DriverFactory for AsiCrispFactory {
    fn driver_type(&self) -> &'static str {
        "asi_crisp"
    }

    fn name(&self) -> &'static str {
        "ASI CRISP Autofocus"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CRISP_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: AsiCrispConfig = config.clone().try_into()?;
        cfg.serial.validate()?;
        if !(0.0..=1.65).contains(&cfg.numerical_aperture) {
            anyhow::bail!("numerical_aperture must be within 0-1.65");
        }
        if cfg.led_intensity > 100 {
            anyhow::bail!("led_intensity must be within 0-100");
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        let validated = self.validate(&config);
        Box::pin(async move {
            validated?;
            let cfg: AsiCrispConfig = config.try_into().context("Invalid ASI CRISP config")?;
            let endpoint = daq_core::ports::get_or_open_endpoint(
                &cfg.serial.port,
                cfg.serial.baud_rate,
                "ASI CRISP",
            )
            .await?;

            let crisp = Arc::new(AsiCrisp::new(endpoint, &cfg));
            crisp
                .initialize()
                .await
                .with_context(|| format!("ASI CRISP on {} failed to initialize", cfg.serial.port))?;

            Ok(DeviceComponents::new()
                .with_device(crisp.clone())
                .with_autofocus(crisp)
                .with_metadata(DeviceMetadata {
                    port: Some(cfg.serial.port),
                    ..Default::default()
                }))
        })
    }
}

// =============================================================================
// AsiCrisp
// =============================================================================

#[derive(Debug)]
struct CrispSettings {
    settle: Duration,
    numerical_aperture: f64,
    led_intensity: u8,
    phase: Confirmed<CrispState>,
    focus_curve: [String; FOCUS_CURVE_BUFFERS],
}

pub struct AsiCrisp {
    port: AsiPort,
    axis: ZAxis,
    lock_timeout: Duration,
    settings: Mutex<CrispSettings>,
}

impl AsiCrisp {
    pub const NAME: &'static str = "CRISP";

    pub fn new(endpoint: SerialEndpoint, config: &AsiCrispConfig) -> Self {
        Self {
            port: AsiPort::new(endpoint, None),
            axis: config.axis,
            lock_timeout: config.lock_timeout,
            settings: Mutex::new(CrispSettings {
                settle: config.wait_after_lock,
                numerical_aperture: config.numerical_aperture,
                led_intensity: config.led_intensity,
                phase: Confirmed::Unconfirmed,
                focus_curve: Default::default(),
            }),
        }
    }

    pub fn wait_after_lock(&self) -> Duration {
        self.settings.lock().settle
    }

    pub fn set_wait_after_lock(&self, settle: Duration) {
        self.settings.lock().settle = settle;
    }

    pub fn numerical_aperture(&self) -> f64 {
        self.settings.lock().numerical_aperture
    }

    pub fn set_numerical_aperture(&self, na: f64) -> Result<()> {
        if !(0.0..=1.65).contains(&na) {
            return Err(DaqError::InvalidParameter(format!(
                "objective NA must be within 0-1.65, got {na}"
            )));
        }
        self.settings.lock().numerical_aperture = na;
        Ok(())
    }

    pub fn led_intensity(&self) -> u8 {
        self.settings.lock().led_intensity
    }

    pub fn set_led_intensity(&self, intensity: u8) -> Result<()> {
        if intensity > 100 {
            return Err(DaqError::InvalidParameter(format!(
                "LED intensity must be within 0-100, got {intensity}"
            )));
        }
        self.settings.lock().led_intensity = intensity;
        Ok(())
    }

    pub fn cached_focus_state(&self) -> Option<CrispState> {
        self.settings.lock().phase.value().copied()
    }

    /// Chunks of the most recent focus curve dump.
    pub fn focus_curve(&self) -> [String; FOCUS_CURVE_BUFFERS] {
        self.settings.lock().focus_curve.clone()
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn focus_state(&self) -> Result<CrispState> {
        let result = self.read_focus_state().await;
        self.settings.lock().phase.track(&result);
        result
    }

    async fn read_focus_state(&self) -> Result<CrispState> {
        self.port.clear_port().await?;
        let reply = self.port.query("LK X?").await?;
        reply
            .chars()
            .nth(3)
            .and_then(CrispState::from_code)
            .ok_or(DaqError::Protocol(reply))
    }

    /// Request `target`. Nothing is sent when the unit already reports it.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn set_focus_state(&self, target: CrispState) -> Result<()> {
        if self.focus_state().await? == target {
            return Ok(());
        }
        match target {
            CrispState::Ready => self.set_continuous_focusing(false).await,
            CrispState::Lock => self.set_continuous_focusing(true).await,
            other => match other.request_code() {
                Some(code) => self.port.query_ack(&format!("LK F={code}")).await,
                None => Ok(()),
            },
        }
    }

    /// Read one numeric parameter, skipping whatever precedes the first digit.
    async fn value(&self, command: &str) -> Result<f64> {
        let reply = self.port.query_reply(command).await?;
        if reply.is_nak() {
            reply.check()?;
        }
        number_after_prefix(&reply.raw)
    }

    /// Calibration gain (`LR X`).
    pub async fn calibration_gain(&self) -> Result<i64> {
        Ok(self.value("LR X?").await? as i64)
    }

    pub async fn set_calibration_gain(&self, gain: i64) -> Result<()> {
        self.port
            .query_ack(&AsiCommand::new("LR").value("X", gain).build())
            .await
    }

    /// Maximum lock range in mm (`LR Z`).
    pub async fn lock_range_mm(&self) -> Result<f64> {
        self.value("LR Z?").await
    }

    pub async fn set_lock_range_mm(&self, range: f64) -> Result<()> {
        self.port
            .query_ack(&AsiCommand::new("LR").fixed("Z", range).build())
            .await
    }

    /// Number of samples averaged per reading, 0-10 (`RT F`).
    pub async fn number_of_averages(&self) -> Result<i64> {
        Ok(self.value("RT F?").await? as i64)
    }

    pub async fn set_number_of_averages(&self, count: i64) -> Result<()> {
        if !(0..=10).contains(&count) {
            return Err(DaqError::InvalidParameter(format!(
                "number of averages must be within 0-10, got {count}"
            )));
        }
        self.port
            .query_ack(&AsiCommand::new("RT").value("F", count).build())
            .await
    }

    /// Loop gain multiplier, 1-100 (`KA`).
    pub async fn gain_multiplier(&self) -> Result<i64> {
        let command = AsiCommand::new("KA")
            .arg(&format!("{}?", self.axis.letter()))
            .build();
        Ok(self.value(&command).await? as i64)
    }

    pub async fn set_gain_multiplier(&self, gain: i64) -> Result<()> {
        if !(1..=100).contains(&gain) {
            return Err(DaqError::InvalidParameter(format!(
                "gain multiplier must be within 1-100, got {gain}"
            )));
        }
        // The firmware only takes the multiplier on Z
        self.port
            .query_ack(&AsiCommand::new("KA").value("Z", gain).build())
            .await
    }

    /// Signal to noise ratio of the reflected beam.
    pub async fn signal_noise_ratio(&self) -> Result<f64> {
        Ok(lenient_f64(&self.port.query("EXTRA Y?").await?))
    }

    /// Record a focus curve and keep it in chunks of just under 1000 characters.
    ///
    /// The controller streams the curve after acknowledging `LK F=97` and then falls
    /// silent, so the first failed read ends the dump.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn obtain_focus_curve(&self) -> Result<()> {
        let lines = self
            .port
            .query_dump("LK F=97", FOCUS_CURVE_MAX_LINES)
            .await?;

        let mut chunks: [String; FOCUS_CURVE_BUFFERS] = Default::default();
        let mut index = 0;
        for line in lines {
            if index == FOCUS_CURVE_BUFFERS {
                tracing::warn!("Focus curve longer than the chunk buffers, rest dropped");
                break;
            }
            chunks[index].push_str(&line);
            chunks[index].push_str("\r\n");
            if chunks[index].len() > FOCUS_CURVE_CHUNK {
                index += 1;
            }
        }
        self.settings.lock().focus_curve = chunks;
        Ok(())
    }

    async fn get_property(&self, property: CrispProperty) -> Result<String> {
        Ok(match property {
            CrispProperty::State => self.focus_state().await?.label().to_string(),
            CrispProperty::WaitAfterLock => self.wait_after_lock().as_millis().to_string(),
            CrispProperty::NumericalAperture => self.numerical_aperture().to_string(),
            CrispProperty::LockRange => self.lock_range_mm().await?.to_string(),
            CrispProperty::CalibrationGain => self.calibration_gain().await?.to_string(),
            CrispProperty::LedIntensity => self.led_intensity().to_string(),
            CrispProperty::GainMultiplier => self.gain_multiplier().await?.to_string(),
            CrispProperty::NumberOfAverages => self.number_of_averages().await?.to_string(),
            CrispProperty::ObtainFocusCurve => " ".to_string(),
            CrispProperty::FocusCurveData(index) => self.settings.lock().focus_curve[index].clone(),
            CrispProperty::SignalNoiseRatio => self.signal_noise_ratio().await?.to_string(),
        })
    }

    async fn set_property(&self, property: CrispProperty, label: &str, value: &str) -> Result<()> {
        match property {
            CrispProperty::State => {
                let target = CrispState::from_label(value.trim()).ok_or_else(|| {
                    DaqError::InvalidParameter(format!("{label}: unknown state {value:?}"))
                })?;
                self.set_focus_state(target).await
            }
            CrispProperty::WaitAfterLock => {
                let ms: u64 = parse_property(label, value)?;
                self.set_wait_after_lock(Duration::from_millis(ms));
                Ok(())
            }
            CrispProperty::NumericalAperture => {
                self.set_numerical_aperture(parse_property(label, value)?)
            }
            CrispProperty::LockRange => self.set_lock_range_mm(parse_property(label, value)?).await,
            CrispProperty::CalibrationGain => {
                // Accepts fractional input, the controller stores an integer
                let gain: f64 = parse_property(label, value)?;
                self.set_calibration_gain(gain as i64).await
            }
            CrispProperty::LedIntensity => self.set_led_intensity(parse_property(label, value)?),
            CrispProperty::GainMultiplier => {
                self.set_gain_multiplier(parse_property(label, value)?).await
            }
            CrispProperty::NumberOfAverages => {
                self.set_number_of_averages(parse_property(label, value)?).await
            }
            CrispProperty::ObtainFocusCurve => {
                if value.trim() == OBTAIN_FOCUS_CURVE {
                    self.obtain_focus_curve().await
                } else {
                    Ok(())
                }
            }
            CrispProperty::FocusCurveData(_) | CrispProperty::SignalNoiseRatio => {
                Err(read_only(label))
            }
        }
    }
}

// =============================================================================
// Device and capability traits
// =============================================================================

#[async_trait]
impl Device for AsiCrisp {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.port.check_device_status().await?;
        tracing::info!(port = self.port.name(), axis = self.axis.letter(), "ASI CRISP initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// The CRISP offers no busy query.
    async fn busy(&self) -> bool {
        false
    }

    fn property_names(&self) -> Vec<&'static str> {
        CRISP_PROPERTIES.iter().map(|(_, label)| *label).collect()
    }

    async fn on_property(&self, name: &str, action: PropertyAction) -> Result<String> {
        let (property, label) = CRISP_PROPERTIES
            .iter()
            .find(|(_, label)| *label == name)
            .copied()
            .ok_or_else(|| unknown_property(Self::NAME, name))?;
        if let PropertyAction::Set(value) = action {
            self.set_property(property, label, &value).await?;
        }
        self.get_property(property).await
    }
}

#[async_trait]
impl Autofocus for AsiCrisp {
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn set_continuous_focusing(&self, on: bool) -> Result<()> {
        self.port.clear_port().await?;
        let state = if on { CrispState::Lock } else { CrispState::Ready };
        let code = state.request_code().unwrap_or(b'U');
        self.port.query_ack(&format!("LK F={code}")).await
    }

    async fn continuous_focusing(&self) -> Result<bool> {
        Ok(matches!(
            self.focus_state().await?,
            CrispState::Lock | CrispState::InFocus
        ))
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.focus_state().await? == CrispState::InFocus)
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn full_focus(&self) -> Result<()> {
        self.set_continuous_focusing(true).await?;

        let settings = PollSettings::new(LOCK_POLL_INTERVAL, self.lock_timeout);
        let outcome = poll_until(
            &settings,
            &CancellationToken::new(),
            || self.focus_state(),
            |state| match state {
                Ok(state) => *state == CrispState::InFocus,
                Err(e) => e.is_link_failure(),
            },
        )
        .await;

        let failure = match outcome {
            PollOutcome::Ready(Err(e)) => e,
            _ => {
                tokio::time::sleep(self.wait_after_lock()).await;
                match self.focus_state().await {
                    Ok(CrispState::InFocus) => return self.set_continuous_focusing(false).await,
                    Err(e) if e.is_link_failure() => e,
                    _ => DaqError::NotLocked(self.lock_timeout),
                }
            }
        };

        if let Err(e) = self.set_continuous_focusing(false).await {
            tracing::warn!(error = %e, "Unlock after failed focus");
        }
        Err(failure)
    }

    async fn incremental_focus(&self) -> Result<()> {
        self.full_focus().await
    }

    async fn last_focus_score(&self) -> Result<f64> {
        self.port.clear_port().await?;
        let reply = self.port.query("LK Y?").await?;
        let score = lenient_f64(reply.get(2..).unwrap_or_default());
        if score == 0.0 {
            return Err(DaqError::Protocol(reply));
        }
        Ok(score)
    }

    /// Offset in controller units (not micrometres).
    async fn offset(&self) -> Result<f64> {
        Ok((self.value("LK Z?").await? as i64) as f64)
    }

    async fn set_offset(&self, offset: f64) -> Result<()> {
        self.port
            .query_ack(&AsiCommand::new("LK").value("Z", offset as i64).build())
            .await
    }
}
