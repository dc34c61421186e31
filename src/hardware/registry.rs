//! Driver Factories and Device Registry
//!
//! Drivers implement [`DriverFactory`] and are registered with a
//! [`DriverRegistry`] value at startup. There is no global registry: the
//! composition root builds one and passes it by reference.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Composition Root (main.rs)                  │
//! │  let registry = DriverRegistry::with_mock_drivers();           │
//! │  let devices = registry.assemble(&config.hardware).await?;     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DriverRegistry                           │
//! │  factories: HashMap<driver_type, Box<dyn DriverFactory>>       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    DriverFactory::build()                       │
//! │  Parses TOML config, instantiates driver, returns capabilities │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          DeviceSet                              │
//! │  X/Y/Z/Theta stage axes, camera, illumination, metadata probes  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{DeviceConfig, HardwareConfig};
use crate::hardware::capabilities::{
    Camera, Homeable, Illumination, Movable, Readable, VelocityControl,
};
use crate::hardware::mock::{
    MockCamera, MockCameraConfig, MockReadable, MockReadableConfig, MockShutter,
    MockShutterConfig, MockStage, MockStageConfig,
};
use crate::hardware::{DeviceSet, StageAxis};
use crate::sequence::Axis;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Can move to positions (stages, rotation mounts)
    Movable,
    /// Has settable travel velocity
    VelocityControl,
    /// Can run a homing routine
    Homeable,
    /// Single-shot and streaming image capture
    Camera,
    /// Shutter and auto-shutter control
    Illumination,
    /// Can read scalar values (temperature probes, power meters)
    Readable,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Movable => "Movable",
            Self::VelocityControl => "Velocity Control",
            Self::Homeable => "Homeable",
            Self::Camera => "Camera",
            Self::Illumination => "Illumination",
            Self::Readable => "Readable",
        }
    }
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Container for capability trait objects returned by drivers.
///
/// ```rust,ignore
/// let stage = Arc::new(MockStage::new());
///
/// let components = DeviceComponents::new()
///     .with_movable(stage.clone())
///     .with_velocity(stage.clone())
///     .with_homing(stage);
/// ```
#[derive(Default)]
pub struct DeviceComponents {
    /// Motion control
    pub movable: Option<Arc<dyn Movable>>,
    /// Velocity control
    pub velocity: Option<Arc<dyn VelocityControl>>,
    /// Homing
    pub homing: Option<Arc<dyn Homeable>>,
    /// Snapshot + streaming camera
    pub camera: Option<Arc<dyn Camera>>,
    /// Shutter + auto-shutter
    pub illumination: Option<Arc<dyn Illumination>>,
    /// Scalar readout
    pub readable: Option<Arc<dyn Readable>>,
}

impl DeviceComponents {
    /// Create a new empty DeviceComponents
    pub fn new() -> Self {
        Self::default()
    }

    /// Get list of capabilities this device supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.movable.is_some() {
            caps.push(Capability::Movable);
        }
        if self.velocity.is_some() {
            caps.push(Capability::VelocityControl);
        }
        if self.homing.is_some() {
            caps.push(Capability::Homeable);
        }
        if self.camera.is_some() {
            caps.push(Capability::Camera);
        }
        if self.illumination.is_some() {
            caps.push(Capability::Illumination);
        }
        if self.readable.is_some() {
            caps.push(Capability::Readable);
        }
        caps
    }

    /// Set Movable implementation
    pub fn with_movable(mut self, m: Arc<dyn Movable>) -> Self {
        self.movable = Some(m);
        self
    }

    /// Set VelocityControl implementation
    pub fn with_velocity(mut self, v: Arc<dyn VelocityControl>) -> Self {
        self.velocity = Some(v);
        self
    }

    /// Set Homeable implementation
    pub fn with_homing(mut self, h: Arc<dyn Homeable>) -> Self {
        self.homing = Some(h);
        self
    }

    /// Set Camera implementation
    pub fn with_camera(mut self, c: Arc<dyn Camera>) -> Self {
        self.camera = Some(c);
        self
    }

    /// Set Illumination implementation
    pub fn with_illumination(mut self, i: Arc<dyn Illumination>) -> Self {
        self.illumination = Some(i);
        self
    }

    /// Set Readable implementation
    pub fn with_readable(mut self, r: Arc<dyn Readable>) -> Self {
        self.readable = Some(r);
        self
    }

    /// Turn the motion capabilities into a stage axis
    pub fn into_axis(self, id: &str) -> Result<StageAxis> {
        let movable = self
            .movable
            .ok_or_else(|| anyhow!("device '{}' is not movable", id))?;
        let mut axis = StageAxis::new(id, movable);
        axis.velocity = self.velocity;
        axis.homing = self.homing;
        Ok(axis)
    }
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Trait for driver factories that create device instances.
///
/// Factories are registered once at startup. `build()` takes `&self` and
/// returns a `'static` future, so a factory must not hold mutable state
/// across builds.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in the config `driver` field
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages
    fn name(&self) -> &'static str;

    /// Capabilities this driver type provides
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without instantiating
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Async instantiation of the driver
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}

fn parse_config<T: serde::de::DeserializeOwned>(driver: &str, config: &toml::Value) -> Result<T> {
    config
        .clone()
        .try_into()
        .with_context(|| format!("invalid '{}' configuration", driver))
}

/// Factory for [`MockStage`].
pub struct MockStageFactory;

impl DriverFactory for MockStageFactory {
    fn driver_type(&self) -> &'static str {
        "mock_stage"
    }

    fn name(&self) -> &'static str {
        "Simulated Linear Stage"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::Movable,
            Capability::VelocityControl,
            Capability::Homeable,
        ]
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockStageConfig = parse_config(self.driver_type(), config)?;
        if cfg.speed_um_per_sec < 0.0 {
            anyhow::bail!("speed_um_per_sec must not be negative");
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockStageConfig = parse_config("mock_stage", &config)?;
            let stage = Arc::new(MockStage::from_config(&cfg));
            Ok(DeviceComponents::new()
                .with_movable(stage.clone())
                .with_velocity(stage.clone())
                .with_homing(stage))
        })
    }
}

/// Factory for [`MockCamera`].
pub struct MockCameraFactory;

impl DriverFactory for MockCameraFactory {
    fn driver_type(&self) -> &'static str {
        "mock_camera"
    }

    fn name(&self) -> &'static str {
        "Simulated sCMOS Camera"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Camera]
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockCameraConfig = parse_config(self.driver_type(), config)?;
        if cfg.width == 0 || cfg.height == 0 {
            anyhow::bail!("camera resolution must be non-zero");
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockCameraConfig = parse_config("mock_camera", &config)?;
            Ok(DeviceComponents::new().with_camera(Arc::new(MockCamera::from_config(&cfg))))
        })
    }
}

/// Factory for [`MockShutter`].
pub struct MockShutterFactory;

impl DriverFactory for MockShutterFactory {
    fn driver_type(&self) -> &'static str {
        "mock_shutter"
    }

    fn name(&self) -> &'static str {
        "Simulated Laser Shutter"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Illumination]
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        parse_config::<MockShutterConfig>(self.driver_type(), config).map(|_| ())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockShutterConfig = parse_config("mock_shutter", &config)?;
            Ok(DeviceComponents::new()
                .with_illumination(Arc::new(MockShutter::new(cfg.auto_shutter))))
        })
    }
}

/// Factory for [`MockReadable`].
pub struct MockReadableFactory;

impl DriverFactory for MockReadableFactory {
    fn driver_type(&self) -> &'static str {
        "mock_readable"
    }

    fn name(&self) -> &'static str {
        "Simulated Scalar Probe"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Readable]
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        parse_config::<MockReadableConfig>(self.driver_type(), config).map(|_| ())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockReadableConfig = parse_config("mock_readable", &config)?;
            Ok(DeviceComponents::new().with_readable(Arc::new(MockReadable::new(cfg.value))))
        })
    }
}

// =============================================================================
// Driver Registry
// =============================================================================

/// Information about a registered driver type
#[derive(Debug, Clone)]
pub struct DriverInfo {
    /// Driver type tag
    pub driver_type: &'static str,
    /// Human-readable name
    pub name: &'static str,
    /// Capabilities the driver provides
    pub capabilities: Vec<Capability>,
}

/// Maps driver type tags to factories.
pub struct DriverRegistry {
    factories: HashMap<&'static str, Box<dyn DriverFactory>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every mock driver registered
    pub fn with_mock_drivers() -> Self {
        let mut registry = Self::new();
        registry.register_factory(MockStageFactory);
        registry.register_factory(MockCameraFactory);
        registry.register_factory(MockShutterFactory);
        registry.register_factory(MockReadableFactory);
        registry
    }

    /// Register a driver factory, replacing any factory with the same tag
    pub fn register_factory<F: DriverFactory>(&mut self, factory: F) {
        let driver_type = factory.driver_type();
        if self.factories.insert(driver_type, Box::new(factory)).is_some() {
            tracing::warn!(driver_type, "Driver factory replaced");
        }
    }

    /// Check if a driver type is registered
    pub fn contains(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// List all registered driver types
    pub fn list_drivers(&self) -> Vec<DriverInfo> {
        let mut drivers: Vec<DriverInfo> = self
            .factories
            .values()
            .map(|f| DriverInfo {
                driver_type: f.driver_type(),
                name: f.name(),
                capabilities: f.capabilities().to_vec(),
            })
            .collect();
        drivers.sort_by_key(|d| d.driver_type);
        drivers
    }

    /// Validate one device entry without instantiating it
    pub fn validate_device(&self, device: &DeviceConfig) -> Result<()> {
        let factory = self
            .factories
            .get(device.driver.as_str())
            .ok_or_else(|| anyhow!("Unknown driver '{}' for device '{}'", device.driver, device.id))?;
        factory
            .validate(&device.config)
            .with_context(|| format!("device '{}'", device.id))
    }

    /// Validate and instantiate one device
    pub async fn build_device(&self, device: &DeviceConfig) -> Result<DeviceComponents> {
        self.validate_device(device)?;
        let factory = self
            .factories
            .get(device.driver.as_str())
            .ok_or_else(|| anyhow!("Unknown driver '{}'", device.driver))?;

        tracing::debug!(id = %device.id, driver = %device.driver, "Building device");
        factory
            .build(device.config.clone())
            .await
            .with_context(|| format!("failed to build device '{}'", device.id))
    }

    /// Build every enabled device and wire them into a [`DeviceSet`]
    /// according to the role assignments in `hardware`.
    pub async fn assemble(&self, hardware: &HardwareConfig) -> Result<DeviceSet> {
        let mut built: HashMap<String, DeviceComponents> = HashMap::new();
        for device in hardware.devices.iter().filter(|d| d.enabled) {
            let components = self.build_device(device).await?;
            built.insert(device.id.clone(), components);
        }

        let camera_components = built
            .remove(&hardware.camera)
            .ok_or_else(|| anyhow!("camera device '{}' is not configured", hardware.camera))?;
        let camera = camera_components
            .camera
            .ok_or_else(|| anyhow!("device '{}' is not a camera", hardware.camera))?;

        let light_components = built.remove(&hardware.illumination).ok_or_else(|| {
            anyhow!(
                "illumination device '{}' is not configured",
                hardware.illumination
            )
        })?;
        let illumination = light_components.illumination.ok_or_else(|| {
            anyhow!("device '{}' has no shutter control", hardware.illumination)
        })?;

        let mut set = DeviceSet::new(
            hardware.camera.clone(),
            camera,
            hardware.illumination.clone(),
            illumination,
        );

        for (axis, id) in hardware.axis_assignments() {
            let components = built
                .remove(id)
                .ok_or_else(|| anyhow!("{} axis device '{}' is not configured", axis, id))?;
            set = set.with_axis(axis, components.into_axis(id)?);
        }

        for (id, components) in built {
            if let Some(readable) = components.readable {
                set = set.with_readable(id, readable);
            }
        }

        tracing::info!(
            axes = set.axes().count(),
            readables = set.readable_names().count(),
            "Device set assembled"
        );
        Ok(set)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::{AutoShutter, FrameProducer};

    fn device(id: &str, driver: &str, config: &str) -> DeviceConfig {
        DeviceConfig {
            id: id.to_string(),
            driver: driver.to_string(),
            enabled: true,
            config: toml::from_str(config).unwrap(),
        }
    }

    fn hardware() -> HardwareConfig {
        HardwareConfig {
            devices: vec![
                device("stage_x", "mock_stage", ""),
                device("stage_z", "mock_stage", "initial_position = 5.0"),
                device("cam", "mock_camera", "width = 16\nheight = 8"),
                device("laser", "mock_shutter", "auto_shutter = true"),
                device("temp", "mock_readable", "value = 21.0"),
            ],
            x: Some("stage_x".into()),
            y: None,
            z: Some("stage_z".into()),
            theta: None,
            camera: "cam".into(),
            illumination: "laser".into(),
        }
    }

    #[test]
    fn test_capability_name() {
        assert_eq!(Capability::Movable.name(), "Movable");
        assert_eq!(Capability::VelocityControl.name(), "Velocity Control");
    }

    #[test]
    fn test_device_components_capabilities() {
        assert!(DeviceComponents::new().capabilities().is_empty());

        let stage = Arc::new(MockStage::new());
        let caps = DeviceComponents::new()
            .with_movable(stage.clone())
            .with_homing(stage)
            .capabilities();
        assert_eq!(caps, vec![Capability::Movable, Capability::Homeable]);
    }

    #[test]
    fn test_list_mock_drivers() {
        let registry = DriverRegistry::with_mock_drivers();
        let drivers = registry.list_drivers();

        assert_eq!(drivers.len(), 4);
        assert_eq!(drivers[0].driver_type, "mock_camera");
        assert!(registry.contains("mock_stage"));
        assert!(!registry.contains("esp300"));
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let registry = DriverRegistry::with_mock_drivers();

        let bad = device("cam", "mock_camera", "width = 0");
        assert!(registry.validate_device(&bad).is_err());

        let unknown = device("x", "esp300", "");
        assert!(registry.validate_device(&unknown).is_err());
    }

    #[tokio::test]
    async fn test_assemble_device_set() {
        let registry = DriverRegistry::with_mock_drivers();
        let set = registry.assemble(&hardware()).await.unwrap();

        assert!(set.axis(Axis::X).is_some());
        assert!(set.axis(Axis::Y).is_none());
        let z = set.axis(Axis::Z).unwrap();
        assert_eq!(z.movable.position().await.unwrap(), 5.0);
        assert!(z.velocity.is_some());

        assert_eq!(set.camera().resolution(), (16, 8));
        assert!(set.illumination().auto_shutter().await.unwrap());
        assert_eq!(set.readable("temp").unwrap().read().await.unwrap(), 21.0);
    }

    #[tokio::test]
    async fn test_assemble_skips_disabled_devices() {
        let registry = DriverRegistry::with_mock_drivers();
        let mut config = hardware();
        config.devices[4].enabled = false;

        let set = registry.assemble(&config).await.unwrap();
        assert!(set.readable("temp").is_none());

        config.devices[0].enabled = false;
        assert!(registry.assemble(&config).await.is_err());
    }
}
