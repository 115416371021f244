//! ASI AZ100 objective turret
//!
//! Four positions, selected with `MTUR X=<1..4>`. The controller cannot report the
//! turret position, so the driver remembers the last position it moved to.

use crate::config::PortConfig;
use crate::port::AsiPort;
use anyhow::Context;
use async_trait::async_trait;
use daq_core::capabilities::StateDevice;
use daq_core::codec::{lenient_i64, AsiCommand};
use daq_core::device::{parse_property, unknown_property, Device, PropertyAction};
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{DaqError, Result};
use daq_core::state::LastCommanded;
use daq_core::transport::SerialEndpoint;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

pub const TURRET_POSITIONS: usize = 4;

const STATE_PROPERTY: &str = "State";
const LABEL_PROPERTY: &str = "Label";

/// Configuration for the AZ100 turret
#[derive(Debug, Clone, Deserialize)]
pub struct AsiTurretConfig {
    #[serde(flatten)]
    pub serial: PortConfig,
}

pub struct AsiTurretFactory;

static TURRET_CAPABILITIES: &[Capability] = &[Capability::StateDevice];

impl DriverFactory for AsiTurretFactory {
    fn driver_type(&self) -> &'static str {
        "asi_az100_turret"
    }

    fn name(&self) -> &'static str {
        "ASI AZ100 Turret"
    }

    fn capabilities(&self) -> &'static [Capability] {
        TURRET_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: AsiTurretConfig = config.clone().try_into()?;
        cfg.serial.validate()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        let validated = self.validate(&config);
        Box::pin(async move {
            validated?;
            let cfg: AsiTurretConfig = config.try_into().context("Invalid AZ100 turret config")?;
            let endpoint = daq_core::ports::get_or_open_endpoint(
                &cfg.serial.port,
                cfg.serial.baud_rate,
                "ASI AZ100 Turret",
            )
            .await?;

            let turret = Arc::new(AsiTurret::new(endpoint));
            turret
                .initialize()
                .await
                .with_context(|| format!("AZ100 turret on {} failed to initialize", cfg.serial.port))?;

            Ok(DeviceComponents::new()
                .with_device(turret.clone())
                .with_state_device(turret)
                .with_metadata(DeviceMetadata {
                    port: Some(cfg.serial.port),
                    ..Default::default()
                }))
        })
    }
}

pub struct AsiTurret {
    port: AsiPort,
    position: Mutex<LastCommanded<usize>>,
}

impl AsiTurret {
    pub const NAME: &'static str = "AZ100 Turret";

    pub fn new(endpoint: SerialEndpoint) -> Self {
        Self {
            port: AsiPort::new(endpoint, None),
            position: Mutex::new(LastCommanded::assumed(0)),
        }
    }

    fn label_for(position: usize) -> String {
        format!("Position-{}", position + 1)
    }

    fn position_for_label(label: &str) -> Option<usize> {
        (0..TURRET_POSITIONS).find(|&p| Self::label_for(p) == label.trim())
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    pub async fn set_position(&self, position: usize) -> Result<()> {
        if position >= TURRET_POSITIONS {
            return Err(DaqError::InvalidParameter(format!(
                "turret position {position} out of range 0-{}",
                TURRET_POSITIONS - 1
            )));
        }
        self.port.clear_port().await?;
        let reply = self
            .port
            .query_reply(&AsiCommand::new("MTUR").value("X", position + 1).build())
            .await?;
        reply.check()?;
        self.position.lock().record(position);
        Ok(())
    }

    pub fn position(&self) -> usize {
        self.position.lock().get_or(0)
    }
}

#[async_trait]
impl Device for AsiTurret {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self), fields(port = self.port.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.port.check_device_status().await?;
        tracing::info!(port = self.port.name(), "AZ100 turret initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Bit 0 of the `RS F` status byte; a failed query reads as idle.
    async fn busy(&self) -> bool {
        if self.port.clear_port().await.is_err() {
            return false;
        }
        match self.port.query("RS F").await {
            Ok(reply) => lenient_i64(reply.get(2..).unwrap_or_default()) & 1 == 1,
            Err(e) => {
                tracing::debug!(error = %e, "Turret status query failed");
                false
            }
        }
    }

    fn property_names(&self) -> Vec<&'static str> {
        vec![STATE_PROPERTY, LABEL_PROPERTY]
    }

    async fn on_property(&self, name: &str, action: PropertyAction) -> Result<String> {
        match name {
            STATE_PROPERTY => {
                if let PropertyAction::Set(value) = action {
                    self.set_position(parse_property(name, &value)?).await?;
                }
                Ok(self.position().to_string())
            }
            LABEL_PROPERTY => {
                if let PropertyAction::Set(value) = action {
                    let position = Self::position_for_label(&value).ok_or_else(|| {
                        DaqError::InvalidParameter(format!("{name}: unknown label {value:?}"))
                    })?;
                    self.set_position(position).await?;
                }
                Ok(Self::label_for(self.position()))
            }
            _ => Err(unknown_property(Self::NAME, name)),
        }
    }
}

#[async_trait]
impl StateDevice for AsiTurret {
    fn position_count(&self) -> usize {
        TURRET_POSITIONS
    }

    fn label(&self, position: usize) -> Option<String> {
        (position < TURRET_POSITIONS).then(|| Self::label_for(position))
    }

    async fn set_state(&self, position: usize) -> Result<()> {
        self.set_position(position).await
    }

    async fn state(&self) -> Result<usize> {
        Ok(self.position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::error::ASI_ERR_OFFSET;
    use daq_core::mock::ScriptedTransport;

    fn turret() -> (Arc<ScriptedTransport>, AsiTurret) {
        let mock = Arc::new(ScriptedTransport::new("COM4"));
        let turret = AsiTurret::new(SerialEndpoint::new(mock.clone()));
        (mock, turret)
    }

    #[tokio::test]
    async fn move_is_one_based_on_the_wire() {
        let (mock, turret) = turret();
        mock.expect("MTUR X=3", ":A");

        turret.set_state(2).await.unwrap();
        assert_eq!(turret.state().await.unwrap(), 2);
        assert_eq!(mock.sent_commands(), vec!["MTUR X=3"]);
    }

    #[tokio::test]
    async fn rejected_move_keeps_position() {
        let (mock, turret) = turret();
        mock.expect("MTUR X=2", ":N-4");

        assert_eq!(
            turret.set_position(1).await.unwrap_err(),
            DaqError::Device { code: ASI_ERR_OFFSET - 4 }
        );
        assert_eq!(turret.position(), 0);
    }

    #[tokio::test]
    async fn out_of_range_position_sends_nothing() {
        let (mock, turret) = turret();
        assert!(matches!(
            turret.set_position(4).await,
            Err(DaqError::InvalidParameter(_))
        ));
        assert!(mock.sent_commands().is_empty());
    }

    #[tokio::test]
    async fn busy_reads_low_bit() {
        let (mock, turret) = turret();
        mock.expect("RS F", ":A3").expect("RS F", ":A2");

        assert!(turret.busy().await);
        assert!(!turret.busy().await);
        // Silent controller
        assert!(!turret.busy().await);
    }

    #[tokio::test]
    async fn labels_and_properties() {
        let (mock, turret) = turret();
        mock.expect("MTUR X=4", ":A");

        assert_eq!(turret.label(0).as_deref(), Some("Position-1"));
        assert_eq!(turret.label(4), None);
        assert_eq!(
            turret
                .on_property("Label", PropertyAction::Set("Position-4".into()))
                .await
                .unwrap(),
            "Position-4"
        );
        assert_eq!(
            turret.on_property("State", PropertyAction::Get).await.unwrap(),
            "3"
        );
        assert!(turret
            .on_property("Label", PropertyAction::Set("Position-9".into()))
            .await
            .is_err());
    }
}
