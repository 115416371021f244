//! ASI Z (focus) drive with optional ring-buffer sequencing
//!
//! Positions travel in tenths of a micrometre, which is also the step size.
//! Controllers that list `RING BUFFER` in their `BU X` build info can store up to
//! 50 Z targets and step through them on TTL triggers:
//!
//! ```text
//! RM X=0          clear the device buffer
//! LD Z=125        load one entry (12.5 µm), repeated per target
//! RM Y=4 Z=0      rewind, trigger only the Z axis
//! TTL X=1         arm TTL triggering
//! TTL X=0         disarm
//! ```

use crate::config::PortConfig;
use crate::port::AsiPort;
use anyhow::Context;
use async_trait::async_trait;
use daq_core::capabilities::{Sequenceable, Stage};
use daq_core::codec::{numeric_fields, AsiCommand, AxisProtocol};
use daq_core::device::{parse_switch, switch_label, unknown_property, Device, PropertyAction};
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{DaqError, Result};
use daq_core::state::Confirmed;
use daq_core::transport::SerialEndpoint;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

/// One step is a tenth of a micrometre.
pub const Z_STEP_SIZE_UM: f64 = 0.1;

/// Entries the controller ring buffer holds.
pub const RING_BUFFER_CAPACITY: usize = 50;

const USE_SEQUENCE: &str = "Use Sequence";

/// Axis letter the focus drive answers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ZAxis {
    #[default]
    Z,
    F,
}

impl ZAxis {
    pub fn letter(self) -> &'static str {
        match self {
            ZAxis::Z => "Z",
            ZAxis::F => "F",
        }
    }
}

// =============================================================================
// AsiZStageFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the Z stage driver
#[derive(Debug, Clone, Deserialize)]
pub struct AsiZStageConfig {
    #[serde(flatten)]
    pub serial: PortConfig,
    /// Axis letter (default: Z)
    #[serde(default)]
    pub axis: ZAxis,
}

/// Factory for creating Z stage driver instances.
pub struct AsiZStageFactory;

static Z_STAGE_CAPABILITIES: &[Capability] = &[Capability::Stage, Capability::Sequenceable];

impl DriverFactory for AsiZStageFactory {
    fn driver_type(&self) -> &'static str {
        "asi_z_stage"
    }

    fn name(&self) -> &'static str {
        "ASI Z Stage"
    }

    fn capabilities(&self) -> &'static [Capability] {
        Z_STAGE_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: AsiZStageConfig = config.clone().try_into()?;
        cfg.serial.validate()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: AsiZStageConfig = config.try_into().context("Invalid ASI Z stage config")?;
            cfg.serial.validate()?;
            let endpoint = daq_core::ports::get_or_open_endpoint(
                &cfg.serial.port,
                cfg.serial.baud_rate,
                "ASI Z stage",
            )
            .await?;

            let stage = Arc::new(AsiZStage::new(endpoint, cfg.axis));
            stage
                .initialize()
                .await
                .with_context(|| format!("ASI Z stage on {} failed to initialize", cfg.serial.port))?;

            let mut components = DeviceComponents::new()
                .with_device(stage.clone())
                .with_stage(stage.clone())
                .with_metadata(DeviceMetadata {
                    port: Some(cfg.serial.port),
                    position_units: Some("µm".into()),
                    step_size: Some(Z_STEP_SIZE_UM),
                    firmware: None,
                });
            if stage.has_ring_buffer() {
                components = components.with_sequenceable(stage);
            }
            Ok(components)
        })
    }
}

// =============================================================================
// AsiZStage
// =============================================================================

#[derive(Debug, Default)]
struct ZState {
    position_steps: Confirmed<i64>,
    protocol: Confirmed<AxisProtocol>,
    has_ring_buffer: bool,
    use_sequence: bool,
    /// Targets in µm, uploaded by `send_sequence`
    sequence: Vec<f64>,
}

/// Driver for the Z/F axis card of an ASI controller.
pub struct AsiZStage {
    port: AsiPort,
    axis: ZAxis,
    state: Mutex<ZState>,
}

impl AsiZStage {
    pub const NAME: &'static str = "ZStage";

    pub fn new(endpoint: SerialEndpoint, axis: ZAxis) -> Self {
        Self {
            port: AsiPort::new(endpoint, Some("1H")),
            axis,
            state: Mutex::new(ZState::default()),
        }
    }

    pub fn has_ring_buffer(&self) -> bool {
        self.state.lock().has_ring_buffer
    }

    /// Whether the host asked to drive this stage through sequences.
    pub fn use_sequence(&self) -> bool {
        self.state.lock().use_sequence
    }

    /// Targets waiting to be uploaded, in µm.
    pub fn pending_sequence(&self) -> Vec<f64> {
        self.state.lock().sequence.clone()
    }

    pub fn cached_position_steps(&self) -> Option<i64> {
        self.state.lock().position_steps.value().copied()
    }

    fn require_ring_buffer(&self) -> Result<()> {
        if self.has_ring_buffer() {
            Ok(())
        } else {
            Err(DaqError::UnsupportedCommand(
                "stage sequences (controller has no ring buffer)".into(),
            ))
        }
    }

    /// Move to an absolute position in steps.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn set_position_steps(&self, steps: i64) -> Result<()> {
        let command = AsiCommand::new("M").value(self.axis.letter(), steps).build();
        self.port.query_reply(&command).await?.check()?;
        self.state.lock().position_steps.confirm(steps);
        Ok(())
    }

    /// Current position in steps.
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn position_steps(&self) -> Result<i64> {
        let result = self.read_position().await;
        self.state.lock().position_steps.track(&result);
        result
    }

    async fn read_position(&self) -> Result<i64> {
        self.port.clear_port().await?;
        let command = AsiCommand::new("W").arg(self.axis.letter()).build();
        let reply = self.port.query_reply(&command).await?;
        if reply.is_nak() {
            reply.check()?;
        }
        // Truncated like the firmware's own integer conversion
        numeric_fields(&reply.raw)
            .first()
            .map(|value| *value as i64)
            .ok_or(DaqError::Protocol(reply.raw))
    }

    /// Read the `BU X` build info and look for the ring buffer module.
    async fn read_controller_info(&self) -> Result<bool> {
        let info = self.port.query("BU X").await?;
        tracing::debug!(port = self.port.name(), info = %info.escape_debug(), "Controller build");
        Ok(info
            .split('\r')
            .any(|line| line.trim_matches('\n') == "RING BUFFER"))
    }

    async fn send_ack(&self, command: &str) -> Result<()> {
        self.port.query_reply(command).await?.check()
    }
}

// =============================================================================
// Device and capability traits
// =============================================================================

#[async_trait]
impl Device for AsiZStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self), fields(port = self.port.name(), axis = self.axis.letter()), err)]
    async fn initialize(&self) -> Result<()> {
        self.port.clear_port().await?;
        let protocol = self.port.check_device_status().await;
        self.state.lock().protocol.track(&protocol);
        protocol?;

        match self.read_controller_info().await {
            Ok(ring_buffer) => self.state.lock().has_ring_buffer = ring_buffer,
            Err(e) => tracing::warn!(port = self.port.name(), error = %e, "No controller build info"),
        }

        // Detection on other devices can leave junk on a shared port
        if self.position_steps().await.is_err() {
            if let Err(e) = self.position_steps().await {
                tracing::warn!(port = self.port.name(), error = %e, "Z position unknown after initialize");
            }
        }

        tracing::info!(
            port = self.port.name(),
            ring_buffer = self.has_ring_buffer(),
            "ASI Z stage initialized"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn busy(&self) -> bool {
        if self.port.clear_port().await.is_err() {
            return true;
        }
        // Only an explicit `N` is idle
        !matches!(self.port.query("/").await, Ok(reply) if reply.starts_with('N'))
    }

    fn property_names(&self) -> Vec<&'static str> {
        if self.has_ring_buffer() {
            vec![USE_SEQUENCE]
        } else {
            Vec::new()
        }
    }

    async fn on_property(&self, name: &str, action: PropertyAction) -> Result<String> {
        if name != USE_SEQUENCE || !self.has_ring_buffer() {
            return Err(unknown_property(Self::NAME, name));
        }
        if let PropertyAction::Set(value) = action {
            self.state.lock().use_sequence = parse_switch(name, &value)?;
        }
        Ok(switch_label(self.use_sequence()).to_string())
    }
}

#[async_trait]
impl Stage for AsiZStage {
    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn set_position_um(&self, position: f64) -> Result<()> {
        self.port.clear_port().await?;
        let command = AsiCommand::new("M")
            .fixed(self.axis.letter(), position / Z_STEP_SIZE_UM)
            .build();
        self.port.query_reply(&command).await?.check()?;
        let steps = (position / Z_STEP_SIZE_UM).round() as i64;
        self.state.lock().position_steps.confirm(steps);
        Ok(())
    }

    async fn position_um(&self) -> Result<f64> {
        Ok(self.position_steps().await? as f64 * Z_STEP_SIZE_UM)
    }

    async fn set_origin(&self) -> Result<()> {
        self.port.clear_port().await?;
        let command = AsiCommand::new("H").arg(self.axis.letter()).build();
        self.send_ack(&command).await?;
        self.state.lock().position_steps.confirm(0);
        Ok(())
    }
}

#[async_trait]
impl Sequenceable for AsiZStage {
    fn sequence_max_length(&self) -> usize {
        if self.has_ring_buffer() {
            RING_BUFFER_CAPACITY
        } else {
            0
        }
    }

    async fn clear_sequence(&self) -> Result<()> {
        self.require_ring_buffer()?;
        self.state.lock().sequence.clear();
        self.send_ack("RM X=0").await
    }

    async fn add_to_sequence(&self, position: f64) -> Result<()> {
        self.require_ring_buffer()?;
        let mut state = self.state.lock();
        if state.sequence.len() >= RING_BUFFER_CAPACITY {
            return Err(DaqError::InvalidParameter(format!(
                "sequence is full ({RING_BUFFER_CAPACITY} entries)"
            )));
        }
        state.sequence.push(position);
        Ok(())
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn send_sequence(&self) -> Result<()> {
        self.require_ring_buffer()?;
        let targets = self.pending_sequence();
        self.send_ack("RM X=0").await?;
        for (index, position) in targets.iter().enumerate() {
            // The ring buffer always loads the Z axis
            let command = AsiCommand::new("LD").rounded("Z", position * 10.0).build();
            if let Err(e) = self.send_ack(&command).await {
                tracing::warn!(entry = index, error = %e, "Sequence upload aborted");
                return Err(e);
            }
        }
        tracing::debug!(entries = targets.len(), "Sequence uploaded");
        Ok(())
    }

    async fn start_sequence(&self) -> Result<()> {
        self.require_ring_buffer()?;
        // Rewind and trigger only the Z axis
        self.send_ack("RM Y=4 Z=0").await?;
        self.send_ack("TTL X=1").await
    }

    async fn stop_sequence(&self) -> Result<()> {
        self.require_ring_buffer()?;
        // Any answer means triggering is off
        self.port.query("TTL X=0").await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::error::ASI_ERR_OFFSET;
    use daq_core::mock::ScriptedTransport;

    fn stage(axis: ZAxis) -> (Arc<ScriptedTransport>, AsiZStage) {
        let mock = Arc::new(ScriptedTransport::new("COM2"));
        let stage = AsiZStage::new(SerialEndpoint::new(mock.clone()), axis);
        (mock, stage)
    }

    fn with_ring_buffer(axis: ZAxis) -> (Arc<ScriptedTransport>, AsiZStage) {
        let (mock, stage) = stage(axis);
        stage.state.lock().has_ring_buffer = true;
        (mock, stage)
    }

    #[tokio::test]
    async fn initialize_reads_build_info_and_retries_position() {
        let (mock, stage) = stage(ZAxis::Z);
        mock.expect("/", "N")
            .expect("BU X", "TIGER_COMM\rRING BUFFER\rMOTOR CLEAR")
            .expect("W Z", "garbage")
            .expect("W Z", ":A 1234");

        stage.initialize().await.unwrap();

        assert!(stage.has_ring_buffer());
        assert_eq!(stage.cached_position_steps(), Some(1234));
        assert_eq!(stage.sequence_max_length(), RING_BUFFER_CAPACITY);
        assert_eq!(stage.property_names(), vec!["Use Sequence"]);
        assert!(mock.remaining_expectations().is_empty());
    }

    #[tokio::test]
    async fn initialize_falls_back_to_legacy_card_prefix() {
        let (mock, stage) = stage(ZAxis::Z);
        mock.expect_silence("/")
            .expect("1H/", "N")
            .expect("1HBU X", "STD_ZF")
            .expect("1HW Z", ":A 10");

        stage.initialize().await.unwrap();
        assert!(!stage.has_ring_buffer());
        assert_eq!(stage.sequence_max_length(), 0);
        assert!(stage.property_names().is_empty());
    }

    #[tokio::test]
    async fn moves_use_tenths_of_a_micrometre() {
        let (mock, stage) = stage(ZAxis::F);
        mock.expect("M F=125.000000", ":A")
            .expect("W F", ":A 125")
            .expect("M F=-40", " :A")
            .expect("H F", ":A");

        stage.set_position_um(12.5).await.unwrap();
        assert!((stage.position_um().await.unwrap() - 12.5).abs() < 1e-9);
        stage.set_position_steps(-40).await.unwrap();
        assert_eq!(stage.cached_position_steps(), Some(-40));
        stage.set_origin().await.unwrap();
        assert_eq!(stage.cached_position_steps(), Some(0));
    }

    #[tokio::test]
    async fn rejected_move_and_read() {
        let (mock, stage) = stage(ZAxis::Z);
        mock.expect("M Z=10", ":N-3").expect("W Z", ":N-5").expect("M Z=1", "?");

        assert_eq!(
            stage.set_position_steps(10).await.unwrap_err(),
            DaqError::Device { code: ASI_ERR_OFFSET - 3 }
        );
        assert_eq!(
            stage.position_steps().await.unwrap_err(),
            DaqError::Device { code: ASI_ERR_OFFSET - 5 }
        );
        assert!(matches!(
            stage.set_position_steps(1).await,
            Err(DaqError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn busy_follows_status_letter() {
        let (mock, stage) = stage(ZAxis::Z);
        mock.expect("/", "B").expect("/", "N").expect("/", "?");

        assert!(stage.busy().await);
        assert!(!stage.busy().await);
        assert!(stage.busy().await);
        // Silent controller
        assert!(stage.busy().await);
    }

    #[tokio::test]
    async fn sequence_upload_loads_every_entry() {
        let (mock, stage) = with_ring_buffer(ZAxis::Z);
        mock.on("RM X=0", ":A").with_responder(|cmd| {
            cmd.starts_with("LD Z=").then(|| vec![":A".to_string()])
        });

        for position in [1.0, 2.5, -3.0] {
            stage.add_to_sequence(position).await.unwrap();
        }
        stage.send_sequence().await.unwrap();

        assert_eq!(
            mock.sent_commands(),
            vec!["RM X=0", "LD Z=10", "LD Z=25", "LD Z=-30"]
        );
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn sequence_upload_stops_at_first_rejected_entry() {
        let (mock, stage) = with_ring_buffer(ZAxis::Z);
        mock.expect("RM X=0", ":A")
            .expect("LD Z=10", ":A")
            .expect("LD Z=20", ":A")
            .expect("LD Z=30", ":N-4");

        for position in [1.0, 2.0, 3.0, 4.0, 5.0] {
            stage.add_to_sequence(position).await.unwrap();
        }
        let err = tokio_test::assert_err!(stage.send_sequence().await);

        assert_eq!(err, DaqError::Device { code: ASI_ERR_OFFSET - 4 });
        assert_eq!(mock.count("LD Z=40"), 0);
        assert_eq!(stage.pending_sequence(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(logs_contain("Sequence upload aborted"));
    }

    #[tokio::test]
    async fn start_stop_and_clear() {
        let (mock, stage) = with_ring_buffer(ZAxis::Z);
        mock.expect("RM Y=4 Z=0", ":A")
            .expect("TTL X=1", ":A")
            .expect("TTL X=0", ":N-1")
            .expect("RM X=0", ":A");

        stage.add_to_sequence(7.0).await.unwrap();
        stage.start_sequence().await.unwrap();
        stage.stop_sequence().await.unwrap();
        stage.clear_sequence().await.unwrap();
        assert!(stage.pending_sequence().is_empty());
    }

    #[tokio::test]
    async fn start_requires_rewind_ack() {
        let (mock, stage) = with_ring_buffer(ZAxis::Z);
        mock.expect("RM Y=4 Z=0", "?");

        assert!(matches!(
            stage.start_sequence().await,
            Err(DaqError::Protocol(_))
        ));
        assert_eq!(mock.count("TTL X=1"), 0);
    }

    #[tokio::test]
    async fn sequences_need_a_ring_buffer() {
        let (mock, stage) = stage(ZAxis::Z);
        assert!(matches!(
            stage.add_to_sequence(1.0).await,
            Err(DaqError::UnsupportedCommand(_))
        ));
        assert!(stage.send_sequence().await.is_err());
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn buffer_holds_fifty_entries() {
        let (_mock, stage) = with_ring_buffer(ZAxis::Z);
        for i in 0..RING_BUFFER_CAPACITY {
            stage.add_to_sequence(i as f64).await.unwrap();
        }
        assert!(stage.add_to_sequence(0.0).await.is_err());
    }

    #[tokio::test]
    async fn use_sequence_property() {
        let (_mock, stage) = with_ring_buffer(ZAxis::Z);
        let value = stage
            .on_property("Use Sequence", PropertyAction::Set("Yes".into()))
            .await
            .unwrap();
        assert_eq!(value, "Yes");
        assert!(stage.use_sequence());
    }

    #[test]
    fn axis_defaults_to_z() {
        let cfg: AsiZStageConfig = toml::Value::Table(toml::toml! { port = "COM4" })
            .try_into()
            .unwrap();
        assert_eq!(cfg.axis, ZAxis::Z);

        let cfg: AsiZStageConfig = toml::Value::Table(toml::toml! {
            port = "COM4"
            axis = "F"
        })
        .try_into()
        .unwrap();
        assert_eq!(cfg.axis.letter(), "F");
    }
}
