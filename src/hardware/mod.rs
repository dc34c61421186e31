//! Hardware Abstraction Layer
//!
//! Capability traits, the frame type, the driver registry and mock devices,
//! plus [`DeviceSet`]: the concrete set of devices one acquisition drives.

pub mod capabilities;
pub mod frame;
pub mod mock;
pub mod registry;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use capabilities::{
    AutoShutter, Camera, FrameProducer, Homeable, Illumination, Movable, Readable,
    ShutterControl, Snapshot, VelocityControl,
};
pub use frame::Frame;
pub use registry::{Capability, DeviceComponents, DriverFactory, DriverRegistry};

use crate::sequence::Axis;

/// One motorised axis of the microscope.
#[derive(Clone)]
pub struct StageAxis {
    /// Device id (for logs and error context)
    pub id: String,
    /// Position control
    pub movable: Arc<dyn Movable>,
    /// Velocity control, required for continuously swept stacks
    pub velocity: Option<Arc<dyn VelocityControl>>,
    /// Homing routine, if the device has one
    pub homing: Option<Arc<dyn Homeable>>,
}

impl StageAxis {
    /// Axis with position control only
    pub fn new(id: impl Into<String>, movable: Arc<dyn Movable>) -> Self {
        Self {
            id: id.into(),
            movable,
            velocity: None,
            homing: None,
        }
    }

    /// Axis backed by a device offering every motion capability
    pub fn full<T>(id: impl Into<String>, device: Arc<T>) -> Self
    where
        T: Movable + VelocityControl + Homeable + 'static,
    {
        Self {
            id: id.into(),
            movable: device.clone(),
            velocity: Some(device.clone()),
            homing: Some(device),
        }
    }
}

impl std::fmt::Debug for StageAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageAxis")
            .field("id", &self.id)
            .field("velocity", &self.velocity.is_some())
            .field("homing", &self.homing.is_some())
            .finish()
    }
}

/// Stages, camera, light source and metadata probes of one microscope.
#[derive(Clone)]
pub struct DeviceSet {
    axes: BTreeMap<Axis, StageAxis>,
    camera_id: String,
    camera: Arc<dyn Camera>,
    illumination_id: String,
    illumination: Arc<dyn Illumination>,
    readables: BTreeMap<String, Arc<dyn Readable>>,
}

impl DeviceSet {
    /// Device set with a camera and light source and no axes yet
    pub fn new(
        camera_id: impl Into<String>,
        camera: Arc<dyn Camera>,
        illumination_id: impl Into<String>,
        illumination: Arc<dyn Illumination>,
    ) -> Self {
        Self {
            axes: BTreeMap::new(),
            camera_id: camera_id.into(),
            camera,
            illumination_id: illumination_id.into(),
            illumination,
            readables: BTreeMap::new(),
        }
    }

    /// Assign a stage to an axis
    pub fn with_axis(mut self, axis: Axis, stage: StageAxis) -> Self {
        self.axes.insert(axis, stage);
        self
    }

    /// Add a named metadata probe
    pub fn with_readable(mut self, name: impl Into<String>, readable: Arc<dyn Readable>) -> Self {
        self.readables.insert(name.into(), readable);
        self
    }

    /// Stage assigned to `axis`
    pub fn axis(&self, axis: Axis) -> Option<&StageAxis> {
        self.axes.get(&axis)
    }

    /// All assigned axes in X, Y, Z, Theta order
    pub fn axes(&self) -> impl Iterator<Item = (Axis, &StageAxis)> {
        self.axes.iter().map(|(axis, stage)| (*axis, stage))
    }

    /// The camera
    pub fn camera(&self) -> &Arc<dyn Camera> {
        &self.camera
    }

    /// Camera device id
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// The laser/shutter
    pub fn illumination(&self) -> &Arc<dyn Illumination> {
        &self.illumination
    }

    /// Illumination device id
    pub fn illumination_id(&self) -> &str {
        &self.illumination_id
    }

    /// Metadata probe by name
    pub fn readable(&self, name: &str) -> Option<&Arc<dyn Readable>> {
        self.readables.get(name)
    }

    /// Names of all metadata probes
    pub fn readable_names(&self) -> impl Iterator<Item = &str> {
        self.readables.keys().map(String::as_str)
    }

    /// Home every axis that supports homing, one after another.
    ///
    /// Returns the axes that were homed.
    pub async fn home_all(&self) -> Result<Vec<Axis>> {
        let mut homed = Vec::new();
        for (axis, stage) in self.axes() {
            let Some(homing) = &stage.homing else {
                tracing::debug!(%axis, id = %stage.id, "Axis has no homing routine");
                continue;
            };
            tracing::info!(%axis, id = %stage.id, "Homing axis");
            homing
                .home()
                .await
                .with_context(|| format!("homing {} axis '{}'", axis, stage.id))?;
            stage
                .movable
                .wait_settled()
                .await
                .with_context(|| format!("settling {} axis '{}'", axis, stage.id))?;
            homed.push(axis);
        }
        Ok(homed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCamera, MockShutter, MockStage};

    #[tokio::test]
    async fn test_home_all_skips_axes_without_homing() {
        let x = Arc::new(MockStage::with_position(3.0));
        let theta = Arc::new(MockStage::with_position(90.0));

        let set = DeviceSet::new(
            "cam",
            Arc::new(MockCamera::new(4, 4)),
            "laser",
            Arc::new(MockShutter::default()),
        )
        .with_axis(Axis::X, StageAxis::full("x", x.clone()))
        .with_axis(Axis::Theta, StageAxis::new("theta", theta.clone()));

        let homed = set.home_all().await.unwrap();
        assert_eq!(homed, vec![Axis::X]);
        assert_eq!(x.current_position(), 0.0);
        assert_eq!(theta.current_position(), 90.0);
    }
}
