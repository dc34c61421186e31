//! One stage position's motion program.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::AxisValueSet;
use crate::drift::Vector3;

/// Stage axes a row can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Lateral X
    X,
    /// Lateral Y
    Y,
    /// Detection axis
    Z,
    /// Sample rotation
    Theta,
}

impl Axis {
    /// All axes in motion order
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::Theta];

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
            Axis::Theta => "Theta",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a drift estimate in image units maps onto this row's stages.
///
/// Stage mounting orientation differs per position, so inversion is row
/// metadata rather than part of the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftHandoff {
    /// Flip the sign of X corrections
    #[serde(default)]
    pub invert_x: bool,
    /// Flip the sign of Y corrections
    #[serde(default)]
    pub invert_y: bool,
    /// Flip the sign of Z corrections
    #[serde(default)]
    pub invert_z: bool,
    /// Stage units per image pixel (X and Y)
    #[serde(default = "unit_scale")]
    pub pixel_size: f64,
    /// Stage units per slice; the row's own Z step when unset
    #[serde(default)]
    pub z_step: Option<f64>,
}

fn unit_scale() -> f64 {
    1.0
}

impl Default for DriftHandoff {
    fn default() -> Self {
        Self {
            invert_x: false,
            invert_y: false,
            invert_z: false,
            pixel_size: unit_scale(),
            z_step: None,
        }
    }
}

impl DriftHandoff {
    /// Convert an offset in (pixels, pixels, slices) to stage units.
    ///
    /// `row_z_spacing` is the row's signed Z travel per slice. A descending
    /// stack maps increasing slice index to decreasing stage Z, and an
    /// explicit `z_step` takes its direction from it.
    pub fn to_stage(&self, offset: Vector3, row_z_spacing: Option<f64>) -> Vector3 {
        let direction = row_z_spacing.map_or(1.0, f64::signum);
        let z_scale = match self.z_step {
            Some(step) => step.abs() * direction,
            None => row_z_spacing.unwrap_or(1.0),
        };
        let sign = |invert: bool| if invert { -1.0 } else { 1.0 };
        Vector3::new(
            offset.x * self.pixel_size * sign(self.invert_x),
            offset.y * self.pixel_size * sign(self.invert_y),
            offset.z * z_scale * sign(self.invert_z),
        )
    }
}

/// Mapping from axis to motion program, plus drift hand-off metadata.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    axes: BTreeMap<Axis, AxisValueSet>,
    /// Drift correction hand-off
    pub handoff: DriftHandoff,
}

impl Row {
    /// Row that drives no axes
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the program for one axis
    pub fn with(mut self, axis: Axis, values: AxisValueSet) -> Self {
        self.axes.insert(axis, values);
        self
    }

    /// Set the drift hand-off metadata
    pub fn with_handoff(mut self, handoff: DriftHandoff) -> Self {
        self.handoff = handoff;
        self
    }

    /// Program for `axis`, if this row drives it
    pub fn get(&self, axis: Axis) -> Option<&AxisValueSet> {
        self.axes.get(&axis)
    }

    /// Driven axes in motion order
    pub fn axes(&self) -> impl Iterator<Item = (Axis, &AxisValueSet)> {
        self.axes.iter().map(|(axis, values)| (*axis, values))
    }

    /// Z program
    pub fn z(&self) -> Option<&AxisValueSet> {
        self.get(Axis::Z)
    }

    /// First Z position
    pub fn z_start(&self) -> Option<f64> {
        self.z().map(AxisValueSet::start)
    }

    /// Last Z position
    pub fn z_end(&self) -> Option<f64> {
        self.z().map(AxisValueSet::end)
    }

    /// Z step size, for stepped stacks
    pub fn z_step(&self) -> Option<f64> {
        self.z()
            .filter(|z| !z.is_fixed())
            .and_then(AxisValueSet::step)
    }

    /// Signed Z travel from one slice to the next, for stepped stacks
    pub fn z_spacing(&self) -> Option<f64> {
        let z = self.z().filter(|z| !z.is_fixed())?;
        z.step().map(|step| z.direction() * step)
    }

    /// Z sweep velocity, for continuous stacks
    pub fn z_velocity(&self) -> Option<f64> {
        self.z().and_then(AxisValueSet::speed)
    }

    /// Whether Z is continuously swept
    pub fn is_z_continuous(&self) -> bool {
        self.z().is_some_and(AxisValueSet::is_continuous)
    }

    /// Whether the stack is one plane (no Z program, or Z start == end)
    pub fn is_single_plane(&self) -> bool {
        match self.z() {
            None => true,
            Some(z) => !z.is_continuous() && z.steps() == 1,
        }
    }

    /// Whether Z is a stepped range of more than one plane
    pub fn is_z_stepped(&self) -> bool {
        !self.is_z_continuous() && !self.is_single_plane()
    }

    /// Number of discrete slices (`-1` for a swept stack)
    pub fn z_steps(&self) -> i64 {
        self.z().map_or(1, AxisValueSet::steps)
    }

    /// Shift the X/Y/Z programs in place. Axes this row does not drive are
    /// left alone.
    pub fn translate(&mut self, dx: f64, dy: f64, dz: f64) {
        for (axis, delta) in [(Axis::X, dx), (Axis::Y, dy), (Axis::Z, dz)] {
            if let Some(values) = self.axes.get_mut(&axis) {
                values.translate(delta);
            }
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (axis, values) in self.axes() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", axis, values)?;
            first = false;
        }
        Ok(())
    }
}
