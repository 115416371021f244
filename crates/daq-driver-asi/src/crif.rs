//! ASI CRIF reflection autofocus
//!
//! The CRIF reports its state as a single character at offset 3 of the
//! `LOCK X?` reply. Every state change is driven by `LK Z` (advance laser and
//! calibration), `LK`/`RL` (lock with fresh or stored reference) and `UL X`
//! (unlock, laser off).
//!
//! Typical session:
//!
//! ```text
//! Idle --LK Z--> Laser On --LK Z--> Calibrating --> Calibration Succeeded --LK--> Lock
//! ```

use crate::config::{default_lock_timeout, PortConfig};
use crate::port::AsiPort;
use anyhow::Context;
use async_trait::async_trait;
use daq_core::capabilities::Autofocus;
use daq_core::codec::{lenient_f64, numeric_fields, AsiCommand};
use daq_core::device::{parse_property, unknown_property, Device, PropertyAction};
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

const STATE_PROPERTY: &str = "CRIF State";
const WAIT_AFTER_LOCK_PROPERTY: &str = "Wait ms after Lock";

const CALIBRATION_POLL_INTERVAL: Duration = Duration::from_millis(250);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Focus drive step, used to remember and restore Z around a failed lock.
const Z_STEP_SIZE_UM: f64 = 0.1;

fn default_crif_settle() -> Duration {
    Duration::from_millis(3000)
}

// =============================================================================
// CrifState
// =============================================================================

/// States the CRIF firmware reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrifState {
    Idle,
    LaserOn,
    Calibrating,
    CalibrationGood,
    CalibrationBad,
    Locking,
    Locked,
    Error,
    LaserOff,
}

const CRIF_CODES: &[(char, CrifState)] = &[
    ('I', CrifState::Idle),
    ('L', CrifState::LaserOn),
    ('1', CrifState::Calibrating),
    ('2', CrifState::Calibrating),
    ('3', CrifState::Calibrating),
    ('G', CrifState::CalibrationGood),
    ('B', CrifState::CalibrationBad),
    ('k', CrifState::Locking),
    ('K', CrifState::Locked),
    ('E', CrifState::Error),
    ('O', CrifState::LaserOff),
];

const CRIF_LABELS: &[(CrifState, &str)] = &[
    (CrifState::Idle, "Unlock (Laser Off)"),
    (CrifState::LaserOn, "Laser On"),
    (CrifState::Calibrating, "Calibrate"),
    (CrifState::CalibrationGood, "Calibration Succeeded"),
    (CrifState::CalibrationBad, "Calibration Failed"),
    (CrifState::Locking, "Locking"),
    (CrifState::Locked, "Lock"),
    (CrifState::Error, "Error"),
    (CrifState::LaserOff, "Laser Off"),
];

impl CrifState {
    /// Decode the state character of a `LOCK X?` reply.
    pub fn from_code(code: char) -> Option<Self> {
        CRIF_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, state)| *state)
    }

    pub fn label(self) -> &'static str {
        CRIF_LABELS
            .iter()
            .find(|(state, _)| *state == self)
            .map_or("", |(_, label)| label)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        CRIF_LABELS
            .iter()
            .find(|(_, l)| *l == label)
            .map(|(state, _)| *state)
    }
}

// =============================================================================
// AsiCrifFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the CRIF driver
#[derive(Debug, Clone, Deserialize)]
pub struct AsiCrifConfig {
    #[serde(flatten)]
    pub serial: PortConfig,
    /// Hold after lock before judging a focus (default: 3s)
    #[serde(default = "default_crif_settle", with = "humantime_serde")]
    pub wait_after_lock: Duration,
    /// How long a focus may take to lock (default: 3s)
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// How long calibration may run (default: 3s)
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub calibration_timeout: Duration,
}

pub struct AsiCrifFactory;

static CRIF_CAPABILITIES: &[Capability] = &[Capability::Autofocus];

impl DriverFactory for AsiCrifFactory {
    fn driver_type(&self) -> &'static str {
        "asi_crif"
    }

    fn name(&self) -> &'static str {
        "ASI CRIF Autofocus"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CRIF_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: AsiCrifConfig = config.clone().try_into()?;
        cfg.serial.validate()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: AsiCrifConfig = config.try_into().context("Invalid ASI CRIF config")?;
            cfg.serial.validate()?;
            let endpoint = daq_core::ports::get_or_open_endpoint(
                &cfg.serial.port,
                cfg.serial.baud_rate,
                "ASI CRIF",
            )
            .await?;

            let crif = Arc::new(AsiCrif::new(endpoint, &cfg));
            crif.initialize()
                .await
                .with_context(|| format!("ASI CRIF on {} failed to initialize", cfg.serial.port))?;

            Ok(DeviceComponents::new()
                .with_device(crif.clone())
                .with_autofocus(crif)
                .with_metadata(DeviceMetadata {
                    port: Some(cfg.serial.port),
                    ..Default::default()
                }))
        })
    }
}

// =============================================================================
// AsiCrif
// =============================================================================

#[derive(Debug, Default)]
struct CrifStatus {
    phase: Confirmed<CrifState>,
    /// The next lock must take a fresh reference (`LK`) instead of the stored one (`RL`)
    just_calibrated: bool,
}

pub struct AsiCrif {
    port: AsiPort,
    settle: Mutex<Duration>,
    lock_timeout: Duration,
    calibration_timeout: Duration,
    status: Mutex<CrifStatus>,
}

impl AsiCrif {
    pub const NAME: &'static str = "CRIF";

    pub fn new(endpoint: SerialEndpoint, config: &AsiCrifConfig) -> Self {
        Self {
            // The CRIF has no known LX-4000 card address
            port: AsiPort::new(endpoint, None),
            settle: Mutex::new(config.wait_after_lock),
            lock_timeout: config.lock_timeout,
            calibration_timeout: config.calibration_timeout,
            status: Mutex::new(CrifStatus::default()),
        }
    }

    pub fn wait_after_lock(&self) -> Duration {
        *self.settle.lock()
    }

    pub fn set_wait_after_lock(&self, settle: Duration) {
        *self.settle.lock() = settle;
    }

    pub fn just_calibrated(&self) -> bool {
        self.status.lock().just_calibrated
    }

    /// State seen by the most recent successful query.
    pub fn cached_focus_state(&self) -> Option<CrifState> {
        self.status.lock().phase.value().copied()
    }

    /// Query the current state.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn focus_state(&self) -> Result<CrifState> {
        let result = self.read_focus_state().await;
        self.status.lock().phase.track(&result);
        result
    }

    async fn read_focus_state(&self) -> Result<CrifState> {
        self.port.clear_port().await?;
        let reply = self.port.query("LOCK X?").await?;
        reply
            .chars()
            .nth(3)
            .and_then(CrifState::from_code)
            .ok_or(DaqError::Protocol(reply))
    }

    /// Drive the unit toward `target`, starting from whatever state it reports.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn set_focus_state(&self, target: CrifState) -> Result<()> {
        let mut current = self.focus_state().await?;

        match target {
            CrifState::Idle | CrifState::LaserOff => self.set_continuous_focusing(false).await,
            CrifState::LaserOn => {
                if matches!(current, CrifState::Idle | CrifState::LaserOff) {
                    self.port.query_ack("LK Z").await?;
                }
                Ok(())
            }
            CrifState::Calibrating => {
                if matches!(current, CrifState::CalibrationBad | CrifState::LaserOff) {
                    self.port.query_ack("LK Z").await?;
                    current = self.focus_state().await?;
                }
                // From idle the laser has to come on first
                if current == CrifState::Idle {
                    self.port.query_ack("LK Z").await?;
                    current = self.focus_state().await?;
                }
                if current == CrifState::LaserOn {
                    self.port.query_ack("LK Z").await?;
                }
                self.await_calibration().await
            }
            CrifState::Locking | CrifState::Locked => match current {
                CrifState::CalibrationGood | CrifState::LaserOff => {
                    self.set_continuous_focusing(true).await
                }
                CrifState::Locking | CrifState::Locked => Ok(()),
                _ => Err(DaqError::NotCalibrated),
            },
            CrifState::CalibrationGood | CrifState::CalibrationBad | CrifState::Error => Ok(()),
        }
    }

    async fn await_calibration(&self) -> Result<()> {
        let settings =
            PollSettings::new(CALIBRATION_POLL_INTERVAL, self.calibration_timeout).sleep_first();
        let outcome = poll_until(
            &settings,
            &CancellationToken::new(),
            || self.focus_state(),
            |state| {
                matches!(
                    state,
                    Ok(CrifState::CalibrationGood | CrifState::CalibrationBad)
                )
            },
        )
        .await;
        self.status.lock().just_calibrated = true;

        match outcome {
            PollOutcome::Ready(Ok(CrifState::CalibrationGood)) => {
                tracing::info!(port = self.port.name(), "CRIF calibrated");
                Ok(())
            }
            other => {
                tracing::warn!(port = self.port.name(), outcome = ?other, "CRIF calibration failed");
                Err(DaqError::NotCalibrated)
            }
        }
    }

    async fn z_position_um(&self) -> Result<f64> {
        self.port.clear_port().await?;
        let reply = self.port.query_reply("W Z").await?;
        if reply.is_nak() {
            reply.check()?;
        }
        numeric_fields(&reply.raw)
            .first()
            .map(|steps| steps * Z_STEP_SIZE_UM)
            .ok_or(DaqError::Protocol(reply.raw))
    }

    async fn move_z_um(&self, position: f64) -> Result<()> {
        self.port.clear_port().await?;
        let command = AsiCommand::new("M")
            .fixed("Z", position / Z_STEP_SIZE_UM)
            .build();
        self.port.query_reply(&command).await?.check()
    }

    async fn get_property(&self, name: &str) -> Result<String> {
        match name {
            STATE_PROPERTY => Ok(self.focus_state().await?.label().to_string()),
            _ => Ok(self.wait_after_lock().as_millis().to_string()),
        }
    }
}

// =============================================================================
// Device and capability traits
// =============================================================================

#[async_trait]
impl Device for AsiCrif {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.port.check_device_status().await?;
        tracing::info!(port = self.port.name(), "ASI CRIF initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// The CRIF offers no busy query.
    async fn busy(&self) -> bool {
        false
    }

    fn property_names(&self) -> Vec<&'static str> {
        vec![STATE_PROPERTY, WAIT_AFTER_LOCK_PROPERTY]
    }

    async fn on_property(&self, name: &str, action: PropertyAction) -> Result<String> {
        match (name, action) {
            (STATE_PROPERTY, PropertyAction::Set(value)) => {
                let target = CrifState::from_label(value.trim()).ok_or_else(|| {
                    DaqError::InvalidParameter(format!("{STATE_PROPERTY}: unknown state {value:?}"))
                })?;
                self.set_focus_state(target).await?;
            }
            (WAIT_AFTER_LOCK_PROPERTY, PropertyAction::Set(value)) => {
                let ms: u64 = parse_property(name, &value)?;
                self.set_wait_after_lock(Duration::from_millis(ms));
            }
            (STATE_PROPERTY | WAIT_AFTER_LOCK_PROPERTY, PropertyAction::Get) => {}
            _ => return Err(unknown_property(Self::NAME, name)),
        }
        self.get_property(name).await
    }
}

#[async_trait]
impl Autofocus for AsiCrif {
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn set_continuous_focusing(&self, on: bool) -> Result<()> {
        self.port.clear_port().await?;
        let command = match (on, self.just_calibrated()) {
            (true, true) => "LK",
            // Lock on the stored reference
            (true, false) => "RL",
            (false, _) => "UL X",
        };
        self.port.query_ack(command).await?;
        self.status.lock().just_calibrated = false;
        Ok(())
    }

    async fn continuous_focusing(&self) -> Result<bool> {
        Ok(self.focus_state().await? == CrifState::Locked)
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.focus_state().await? == CrifState::Locked)
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn full_focus(&self) -> Result<()> {
        let position = self.z_position_um().await?;
        self.set_continuous_focusing(true).await?;

        let settings = PollSettings::new(LOCK_POLL_INTERVAL, self.lock_timeout);
        let outcome = poll_until(
            &settings,
            &CancellationToken::new(),
            || self.focus_state(),
            |state| match state {
                Ok(state) => *state == CrifState::Locked,
                Err(e) => e.is_link_failure(),
            },
        )
        .await;

        let failure = match outcome {
            PollOutcome::Ready(Err(e)) => e,
            _ => {
                tokio::time::sleep(self.wait_after_lock()).await;
                match self.focus_state().await {
                    Ok(CrifState::Locked) => return self.set_continuous_focusing(false).await,
                    Err(e) if e.is_link_failure() => e,
                    _ => DaqError::NotLocked(self.lock_timeout),
                }
            }
        };

        if let Err(e) = self.set_continuous_focusing(false).await {
            tracing::warn!(error = %e, "Unlock after failed focus");
        }
        if let Err(e) = self.move_z_um(position).await {
            tracing::warn!(error = %e, position, "Could not restore Z after failed focus");
        }
        Err(failure)
    }

    async fn incremental_focus(&self) -> Result<()> {
        self.full_focus().await
    }

    async fn last_focus_score(&self) -> Result<f64> {
        self.port.clear_port().await?;
        let reply = self.port.query("LOCK Y?").await?;
        let score = lenient_f64(reply.get(2..).unwrap_or_default());
        if score == 0.0 {
            return Err(DaqError::Protocol(reply));
        }
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::mock::ScriptedTransport;

    fn config() -> AsiCrifConfig {
        toml::Value::Table(toml::toml! { port = "COM3" })
            .try_into()
            .unwrap()
    }

    fn crif() -> (Arc<ScriptedTransport>, AsiCrif) {
        let mock = Arc::new(ScriptedTransport::new("COM3"));
        let crif = AsiCrif::new(SerialEndpoint::new(mock.clone()), &config());
        (mock, crif)
    }

    #[test]
    fn state_codes_decode_row_by_row() {
        let expected = [
            ('I', CrifState::Idle),
            ('L', CrifState::LaserOn),
            ('1', CrifState::Calibrating),
            ('2', CrifState::Calibrating),
            ('3', CrifState::Calibrating),
            ('G', CrifState::CalibrationGood),
            ('B', CrifState::CalibrationBad),
            ('k', CrifState::Locking),
            ('K', CrifState::Locked),
            ('E', CrifState::Error),
            ('O', CrifState::LaserOff),
        ];
        for (code, state) in expected {
            assert_eq!(CrifState::from_code(code), Some(state), "code {code}");
        }
        assert_eq!(CrifState::from_code('4'), None);
        assert_eq!(CrifState::from_code('F'), None);
    }

    #[test]
    fn labels_round_trip() {
        for (state, label) in CRIF_LABELS {
            assert_eq!(CrifState::from_label(label), Some(*state));
        }
        assert_eq!(CrifState::Idle.label(), "Unlock (Laser Off)");
    }

    #[tokio::test]
    async fn focus_state_is_stable_without_commands() {
        let (mock, crif) = crif();
        mock.on("LOCK X?", ":A K");

        let first = crif.focus_state().await.unwrap();
        let second = crif.focus_state().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(crif.cached_focus_state(), Some(CrifState::Locked));
    }

    #[tokio::test]
    async fn unknown_state_character_is_protocol_error() {
        let (mock, crif) = crif();
        mock.expect("LOCK X?", ":A Z").expect("LOCK X?", ":A");

        assert!(matches!(crif.focus_state().await, Err(DaqError::Protocol(_))));
        assert!(matches!(crif.focus_state().await, Err(DaqError::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_from_idle_toggles_laser_then_polls_within_bound() {
        let (mock, crif) = crif();
        mock.expect("LOCK X?", ":A I")
            .expect("LK Z", ":A")
            .expect("LOCK X?", ":A L")
            .expect("LK Z", ":A")
            .on("LOCK X?", ":A 2");

        let start = tokio::time::Instant::now();
        let err = crif.set_focus_state(CrifState::Calibrating).await.unwrap_err();

        assert_eq!(err, DaqError::NotCalibrated);
        assert!(start.elapsed() <= Duration::from_secs(3));
        assert_eq!(
            mock.sent_commands()[..4],
            ["LOCK X?", "LK Z", "LOCK X?", "LK Z"]
        );
        assert_eq!(mock.count("LK Z"), 2);
        assert!(crif.just_calibrated());
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_success_then_lock_uses_fresh_reference() {
        let (mock, crif) = crif();
        mock.expect("LOCK X?", ":A L")
            .expect("LK Z", ":A")
            .expect("LOCK X?", ":A 1")
            .expect("LOCK X?", ":A G")
            .expect("LOCK X?", ":A G")
            .expect("LK", ":A");

        crif.set_focus_state(CrifState::Calibrating).await.unwrap();
        crif.set_focus_state(CrifState::Locked).await.unwrap();

        assert!(!crif.just_calibrated());
        assert!(mock.remaining_expectations().is_empty());
    }

    #[tokio::test]
    async fn lock_without_calibration_is_refused() {
        let (mock, crif) = crif();
        mock.expect("LOCK X?", ":A I").expect("LOCK X?", ":A k");

        assert_eq!(
            crif.set_focus_state(CrifState::Locked).await.unwrap_err(),
            DaqError::NotCalibrated
        );
        // Already locking: nothing to do
        crif.set_focus_state(CrifState::Locked).await.unwrap();
        assert_eq!(mock.sent_commands(), vec!["LOCK X?", "LOCK X?"]);
    }

    #[tokio::test]
    async fn continuous_focusing_commands() {
        let (mock, crif) = crif();
        mock.expect("RL", ":A").expect("UL X", ":A").expect("RL", "?");

        crif.set_continuous_focusing(true).await.unwrap();
        crif.set_continuous_focusing(false).await.unwrap();
        assert!(matches!(
            crif.set_continuous_focusing(true).await,
            Err(DaqError::Protocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn full_focus_that_never_locks_restores_z() {
        let (mock, crif) = crif();
        mock.expect("W Z", ":A 500")
            .expect("RL", ":A")
            .on("LOCK X?", ":A k")
            .on("UL X", ":A")
            .on("M Z=500.000000", ":A");

        let start = tokio::time::Instant::now();
        let err = crif.full_focus().await.unwrap_err();

        assert!(matches!(err, DaqError::NotLocked(_)));
        assert!(start.elapsed() <= crif.lock_timeout + crif.wait_after_lock());
        assert_eq!(mock.count("UL X"), 1);
        assert_eq!(mock.count("M Z=500.000000"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_focus_surfaces_link_failure_after_rollback() {
        let (mock, crif) = crif();
        mock.expect("W Z", ":A 500")
            .expect("RL", ":A")
            .expect("UL X", ":A")
            .expect("M Z=500.000000", ":A");

        let start = tokio::time::Instant::now();
        let err = crif.full_focus().await.unwrap_err();

        assert!(err.is_link_failure(), "{err:?}");
        assert!(start.elapsed() < crif.lock_timeout);
        assert_eq!(mock.count("LOCK X?"), 1);
        assert_eq!(
            mock.sent_commands(),
            vec!["W Z", "RL", "LOCK X?", "UL X", "M Z=500.000000"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_focus_locks_then_releases() {
        let (mock, crif) = crif();
        crif.set_wait_after_lock(Duration::from_millis(10));
        mock.expect("W Z", ":A 500")
            .expect("RL", ":A")
            .on("LOCK X?", ":A K")
            .expect("UL X", ":A");

        crif.full_focus().await.unwrap();
        assert_eq!(mock.count("M Z=500.000000"), 0);
    }

    #[tokio::test]
    async fn score_must_be_nonzero() {
        let (mock, crif) = crif();
        mock.expect("LOCK Y?", ":A 123.5").expect("LOCK Y?", ":A 0");

        assert_eq!(crif.last_focus_score().await.unwrap(), 123.5);
        assert!(matches!(
            crif.last_focus_score().await,
            Err(DaqError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn offset_is_unsupported() {
        let (_mock, crif) = crif();
        assert!(matches!(
            crif.offset().await,
            Err(DaqError::UnsupportedCommand(_))
        ));
    }

    #[tokio::test]
    async fn properties() {
        let (mock, crif) = crif();
        mock.expect("LOCK X?", ":A O");

        assert_eq!(
            crif.on_property("CRIF State", PropertyAction::Get).await.unwrap(),
            "Laser Off"
        );
        assert_eq!(
            crif.on_property("Wait ms after Lock", PropertyAction::Set("500".into()))
                .await
                .unwrap(),
            "500"
        );
        assert!(crif.on_property("Focus", PropertyAction::Get).await.is_err());
    }
}
