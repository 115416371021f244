//! Device registry
//!
//! Holds the driver factories known to the binary and the devices built from
//! configuration. Each built device is a [`DeviceComponents`] bag; callers ask
//! for the capability they need and get `None` when the device lacks it.
//!
//! ```rust,ignore
//! let registry = DeviceRegistry::with_default_factories();
//! registry.build_from_config(&config).await;
//! if let Some(stage) = registry.get_xy_stage("stage") {
//!     stage.set_position_um(100.0, 0.0).await?;
//! }
//! ```

use crate::config::AppConfig;
use anyhow::{anyhow, bail, Context, Result};
use daq_core::capabilities::{
    Autofocus, EmissionControl, Sequenceable, ShutterControl, Stage, StateDevice,
    WavelengthSelect, XyStage,
};
use daq_core::device::Device;
use daq_core::driver::{Capability, DeviceComponents, DriverFactory};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A device built by a factory.
pub struct RegisteredDevice {
    /// Configured id
    pub id: String,
    /// Factory that built it
    pub driver_type: String,
    /// Capabilities the driver exposed
    pub components: DeviceComponents,
}

/// Summary of a registered device for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub driver_type: String,
    /// Device name reported by the driver
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub port: Option<String>,
}

/// Summary of a registered factory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryInfo {
    pub driver_type: String,
    pub name: String,
    pub capabilities: Vec<Capability>,
}

/// Registry of driver factories and built devices
#[derive(Default)]
pub struct DeviceRegistry {
    factories: RwLock<HashMap<String, Arc<dyn DriverFactory>>>,
    devices: RwLock<HashMap<String, Arc<RegisteredDevice>>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every factory this workspace ships
    pub fn with_default_factories() -> Self {
        let registry = Self::new();
        registry.register_factory(Box::new(daq_driver_asi::AsiXyStageFactory));
        registry.register_factory(Box::new(daq_driver_asi::AsiZStageFactory));
        registry.register_factory(Box::new(daq_driver_asi::AsiCrifFactory));
        registry.register_factory(Box::new(daq_driver_asi::AsiCrispFactory));
        registry.register_factory(Box::new(daq_driver_asi::AsiTurretFactory));
        registry.register_factory(Box::new(daq_driver_asi::AsiLedFactory));
        registry.register_factory(Box::new(daq_driver_skyra::SkyraFactory));
        registry
    }

    // =========================================================================
    // Driver Factory Management
    // =========================================================================

    /// Register a driver factory, replacing any factory for the same driver type.
    ///
    /// Returns `true` when an earlier factory was replaced.
    pub fn register_factory(&self, factory: Box<dyn DriverFactory>) -> bool {
        let driver_type = factory.driver_type().to_string();
        tracing::info!(
            driver_type = %driver_type,
            name = %factory.name(),
            capabilities = ?factory.capabilities(),
            "Registering driver factory"
        );
        self.factories
            .write()
            .insert(driver_type, Arc::from(factory))
            .is_some()
    }

    /// Check if a factory is registered for a driver type.
    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.read().contains_key(driver_type)
    }

    /// Registered driver types, sorted
    pub fn list_factories(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn factory_info(&self, driver_type: &str) -> Option<FactoryInfo> {
        self.factories.read().get(driver_type).map(|factory| FactoryInfo {
            driver_type: factory.driver_type().to_string(),
            name: factory.name().to_string(),
            capabilities: factory.capabilities().to_vec(),
        })
    }

    // =========================================================================
    // Device Management
    // =========================================================================

    /// Validate `config` with the factory for `driver_type`, build the device and
    /// register it under `device_id`.
    pub async fn register_from_toml(
        &self,
        device_id: &str,
        driver_type: &str,
        config: toml::Value,
    ) -> Result<()> {
        if self.contains(device_id) {
            bail!("Device '{device_id}' is already registered");
        }

        let factory = self.factories.read().get(driver_type).cloned();
        let factory = factory.ok_or_else(|| {
            anyhow!(
                "No factory registered for driver_type '{}'. Available factories: {:?}",
                driver_type,
                self.list_factories()
            )
        })?;

        factory.validate(&config).with_context(|| {
            format!("Configuration validation failed for device '{device_id}' ({driver_type})")
        })?;

        tracing::info!(device_id, driver_type, "Building device from factory");
        let components = factory
            .build(config)
            .await
            .with_context(|| format!("Factory build failed for device '{device_id}' ({driver_type})"))?;

        let registered = Arc::new(RegisteredDevice {
            id: device_id.to_string(),
            driver_type: driver_type.to_string(),
            components,
        });
        let mut devices = self.devices.write();
        if devices.contains_key(device_id) {
            bail!("Device '{device_id}' is already registered");
        }
        devices.insert(device_id.to_string(), registered);
        tracing::info!(device_id, "Device registered successfully");
        Ok(())
    }

    /// Build every enabled device in `config`.
    ///
    /// A device that fails is logged and skipped so one unplugged controller does not
    /// take the rest down. Returns the ids that failed with their errors.
    pub async fn build_from_config(&self, config: &AppConfig) -> Vec<(String, anyhow::Error)> {
        let mut failures = Vec::new();
        for device in config.enabled_devices() {
            if let Err(e) = self
                .register_from_toml(&device.id, &device.r#type, device.config.clone())
                .await
            {
                let message = format!("{e:#}");
                tracing::error!(device_id = %device.id, error = %message, "Device not available");
                failures.push((device.id.clone(), e));
            }
        }
        failures
    }

    /// Remove a device; returns whether it was registered
    pub fn unregister(&self, id: &str) -> bool {
        self.devices.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<RegisteredDevice>> {
        self.devices.read().get(id).cloned()
    }

    /// Registered devices, sorted by id
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<DeviceInfo> = self
            .devices
            .read()
            .values()
            .map(|device| DeviceInfo {
                id: device.id.clone(),
                driver_type: device.driver_type.clone(),
                name: device
                    .components
                    .device
                    .as_ref()
                    .map(|d| d.name().to_string())
                    .unwrap_or_default(),
                capabilities: device.components.capabilities(),
                port: device.components.metadata.port.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Ids of devices exposing `capability`, sorted
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .read()
            .values()
            .filter(|device| device.components.capabilities().contains(&capability))
            .map(|device| device.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Shut every device down, logging failures.
    pub async fn shutdown_all(&self) {
        let devices: Vec<Arc<RegisteredDevice>> = self.devices.read().values().cloned().collect();
        for registered in devices {
            if let Some(device) = &registered.components.device {
                if let Err(e) = device.shutdown().await {
                    tracing::warn!(device_id = %registered.id, error = %e, "Shutdown failed");
                }
            }
        }
    }

    // =========================================================================
    // Capability Accessors
    // =========================================================================

    fn component<T: ?Sized>(
        &self,
        id: &str,
        pick: impl FnOnce(&DeviceComponents) -> Option<Arc<T>>,
    ) -> Option<Arc<T>> {
        self.devices
            .read()
            .get(id)
            .and_then(|device| pick(&device.components))
    }

    pub fn get_device(&self, id: &str) -> Option<Arc<dyn Device>> {
        self.component(id, |c| c.device.clone())
    }

    pub fn get_xy_stage(&self, id: &str) -> Option<Arc<dyn XyStage>> {
        self.component(id, |c| c.xy_stage.clone())
    }

    pub fn get_stage(&self, id: &str) -> Option<Arc<dyn Stage>> {
        self.component(id, |c| c.stage.clone())
    }

    pub fn get_sequenceable(&self, id: &str) -> Option<Arc<dyn Sequenceable>> {
        self.component(id, |c| c.sequenceable.clone())
    }

    pub fn get_autofocus(&self, id: &str) -> Option<Arc<dyn Autofocus>> {
        self.component(id, |c| c.autofocus.clone())
    }

    pub fn get_shutter_control(&self, id: &str) -> Option<Arc<dyn ShutterControl>> {
        self.component(id, |c| c.shutter_control.clone())
    }

    pub fn get_emission_control(&self, id: &str) -> Option<Arc<dyn EmissionControl>> {
        self.component(id, |c| c.emission_control.clone())
    }

    pub fn get_wavelength_select(&self, id: &str) -> Option<Arc<dyn WavelengthSelect>> {
        self.component(id, |c| c.wavelength_select.clone())
    }

    pub fn get_state_device(&self, id: &str) -> Option<Arc<dyn StateDevice>> {
        self.component(id, |c| c.state_device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::mock::ScriptedTransport;
    use daq_core::transport::SerialEndpoint;
    use daq_driver_asi::AsiTurret;
    use futures::future::BoxFuture;

    /// Builds a turret on a scripted controller that accepts everything.
    struct ScriptedTurretFactory {
        mock: Arc<ScriptedTransport>,
    }

    impl DriverFactory for ScriptedTurretFactory {
        fn driver_type(&self) -> &'static str {
            "scripted_turret"
        }

        fn name(&self) -> &'static str {
            "Scripted turret"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::StateDevice]
        }

        fn validate(&self, config: &toml::Value) -> Result<()> {
            match config.get("port").and_then(|p| p.as_str()) {
                Some(_) => Ok(()),
                None => bail!("port is required"),
            }
        }

        fn build(&self, _config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
            let endpoint = SerialEndpoint::new(self.mock.clone());
            Box::pin(async move {
                let turret = Arc::new(AsiTurret::new(endpoint));
                Ok(DeviceComponents::new()
                    .with_device(turret.clone())
                    .with_state_device(turret))
            })
        }
    }

    fn registry() -> (Arc<ScriptedTransport>, DeviceRegistry) {
        let mock = Arc::new(ScriptedTransport::new("COM4"));
        mock.with_responder(|_| Some(vec![":A".to_string()]));
        let registry = DeviceRegistry::new();
        registry.register_factory(Box::new(ScriptedTurretFactory { mock: mock.clone() }));
        (mock, registry)
    }

    fn port_config() -> toml::Value {
        toml::Value::Table(toml::toml! { port = "COM4" })
    }

    #[test]
    fn test_default_factories() {
        let registry = DeviceRegistry::with_default_factories();
        assert_eq!(
            registry.list_factories(),
            vec![
                "asi_az100_turret",
                "asi_crif",
                "asi_crisp",
                "asi_led",
                "asi_xy_stage",
                "asi_z_stage",
                "skyra",
            ]
        );
        let info = registry.factory_info("skyra").unwrap();
        assert!(info.capabilities.contains(&Capability::WavelengthSelect));
    }

    #[tokio::test]
    async fn test_register_and_use_capability() {
        let (mock, registry) = registry();
        registry
            .register_from_toml("turret", "scripted_turret", port_config())
            .await
            .unwrap();

        let turret = registry.get_state_device("turret").unwrap();
        turret.set_state(1).await.unwrap();

        assert!(mock.sent_commands().contains(&"MTUR X=2".to_string()));
        assert!(registry.get_xy_stage("turret").is_none());
        assert_eq!(
            registry.devices_with_capability(Capability::StateDevice),
            vec!["turret"]
        );
        let listed = registry.list_devices();
        assert_eq!(listed[0].name, "AZ100 Turret");
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown() {
        let (_mock, registry) = registry();
        registry
            .register_from_toml("turret", "scripted_turret", port_config())
            .await
            .unwrap();

        assert!(registry
            .register_from_toml("turret", "scripted_turret", port_config())
            .await
            .is_err());
        assert!(registry
            .register_from_toml("laser", "skyra", port_config())
            .await
            .is_err());
        assert!(registry
            .register_from_toml(
                "other",
                "scripted_turret",
                toml::Value::Table(toml::map::Map::new())
            )
            .await
            .is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister("turret"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_build_from_config_skips_failures() {
        let (_mock, registry) = registry();
        let config: AppConfig = toml::from_str(
            r#"
            [[devices]]
            id = "turret"
            type = "scripted_turret"
            config = { port = "COM4" }

            [[devices]]
            id = "broken"
            type = "scripted_turret"

            [[devices]]
            id = "off"
            type = "scripted_turret"
            enabled = false
            config = { port = "COM4" }
            "#,
        )
        .unwrap();

        let failures = registry.build_from_config(&config).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");
        assert!(registry.contains("turret"));
        assert!(!registry.contains("off"));
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_factory_registration_is_logged() {
        let registry = DeviceRegistry::with_default_factories();

        assert!(registry.has_factory("asi_crisp"));
        assert!(logs_contain("Registering driver factory"));
        assert!(logs_contain("skyra"));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_unavailable_device_is_logged() {
        let registry = DeviceRegistry::with_default_factories();
        let config: AppConfig = toml::from_str(
            r#"
            [[devices]]
            id = "stage"
            type = "asi_xy_stage"
            config = { port = "undefined" }
            "#,
        )
        .unwrap();

        let failures = registry.build_from_config(&config).await;

        assert_eq!(failures.len(), 1);
        assert!(registry.is_empty());
        assert!(logs_contain("Device not available"));
    }
}
