//! Drift estimation and compensation.
//!
//! A stack is reduced to 2-D projections one frame at a time
//! ([`Projections`]). When the stack is complete an [`OffsetEstimator`]
//! compares it to a reference stack of the same row and yields a 3-D offset
//! in image units (pixels, pixels, slices). A [`DriftController`] owns that
//! cycle per row, passes the offset through an optional [`ManualReview`],
//! and converts it to stage units at the hand-off.
//!
//! Estimators never see physical units or stage orientation.

pub mod centroid;
pub mod controller;
pub mod correlation;
pub mod projections;

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Neg, Sub};
use thiserror::Error;

pub use centroid::CentroidEstimator;
pub use controller::{
    AcceptAll, DriftController, DriftControllerFactory, ManualReview, ProjectionDriftController,
    ProjectionDriftFactory,
};
pub use correlation::CorrelationEstimator;
pub use projections::{Plane, Projections};

/// Errors from projection tallying and offset estimation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriftError {
    /// A frame's size differs from the stack's first frame
    #[error("frame is {got_width}x{got_height}, stack is {width}x{height}")]
    FrameSize {
        /// Stack width
        width: u32,
        /// Stack height
        height: u32,
        /// Offending frame width
        got_width: u32,
        /// Offending frame height
        got_height: u32,
    },

    /// A frame with no pixels
    #[error("frame has no pixels")]
    EmptyFrame,

    /// No frames were tallied into one of the compared stacks
    #[error("stack has no slices")]
    EmptyStack,

    /// Reference and latest stacks have different lateral sizes
    #[error("stacks differ in lateral size: {0}x{1} vs {2}x{3}")]
    ShapeMismatch(u32, u32, u32, u32),
}

/// 3-D offset or position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    /// X component
    pub x: f64,
    /// Y component
    pub y: f64,
    /// Z component
    pub z: f64,
}

impl Vector3 {
    /// Build a vector
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The zero vector
    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Whether every component is exactly zero
    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }

    /// Component-wise product
    pub fn mul_elem(self, other: Vector3) -> Vector3 {
        Vector3::new(self.x * other.x, self.y * other.y, self.z * other.z)
    }

    /// Euclidean length
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Largest absolute component difference to `other`
    pub fn max_abs_diff(&self, other: &Vector3) -> f64 {
        (self.x - other.x)
            .abs()
            .max((self.y - other.y).abs())
            .max((self.z - other.z).abs())
    }
}

impl Add for Vector3 {
    type Output = Vector3;

    fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vector3 {
    fn add_assign(&mut self, rhs: Vector3) {
        *self = *self + rhs;
    }
}

impl Sub for Vector3 {
    type Output = Vector3;

    fn sub(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Neg for Vector3 {
    type Output = Vector3;

    fn neg(self) -> Vector3 {
        Vector3::new(-self.x, -self.y, -self.z)
    }
}

impl Mul<f64> for Vector3 {
    type Output = Vector3;

    fn mul(self, rhs: f64) -> Vector3 {
        Vector3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl std::fmt::Display for Vector3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Which stack drift is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    /// Replace the reference with each completed stack; the raw estimate
    /// is relative to the previous cycle and is added to the last applied
    /// correction.
    #[default]
    Previous,
    /// Keep the row's first stack as the reference; the raw estimate is
    /// the full residual.
    First,
}

/// Applied-correction bookkeeping for one row, in image units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriftCorrection {
    /// Correction handed over at the end of the last cycle
    pub last_applied: Vector3,
    /// Sum of all corrections since the last reset
    pub cumulative: Vector3,
}

impl DriftCorrection {
    /// Record an applied correction
    pub fn apply(&mut self, offset: Vector3) {
        self.last_applied = offset;
        self.cumulative += offset;
    }

    /// Forget all corrections
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Computes the translation of `latest` relative to `first`.
///
/// The result is in image units: pixels along X and Y, slices along Z. A
/// feature at index `p` in `first` is expected at `p + offset` in `latest`.
pub trait OffsetEstimator: Send + Sync {
    /// Estimate the offset between two completed stacks
    fn estimate(&self, first: &Projections, latest: &Projections) -> Result<Vector3, DriftError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_arithmetic() {
        let a = Vector3::new(1.0, 2.0, 3.0);
        let b = Vector3::new(0.5, -1.0, 2.0);

        assert_eq!(a + b, Vector3::new(1.5, 1.0, 5.0));
        assert_eq!(a - b, Vector3::new(0.5, 3.0, 1.0));
        assert_eq!(-a, Vector3::new(-1.0, -2.0, -3.0));
        assert_eq!(a * 2.0, Vector3::new(2.0, 4.0, 6.0));
        assert_eq!(a.mul_elem(b), Vector3::new(0.5, -2.0, 6.0));
        assert!((Vector3::new(3.0, 4.0, 0.0).norm() - 5.0).abs() < 1e-12);
        assert!(Vector3::zero().is_zero());
    }

    #[test]
    fn correction_accumulates() {
        let mut correction = DriftCorrection::default();
        correction.apply(Vector3::new(1.0, 0.0, 0.0));
        correction.apply(Vector3::new(0.5, 1.0, 0.0));

        assert_eq!(correction.last_applied, Vector3::new(0.5, 1.0, 0.0));
        assert_eq!(correction.cumulative, Vector3::new(1.5, 1.0, 0.0));

        correction.reset();
        assert!(correction.cumulative.is_zero());
    }

    #[test]
    fn reference_policy_defaults_to_previous() {
        assert_eq!(ReferencePolicy::default(), ReferencePolicy::Previous);
        let parsed: ReferencePolicy = serde_json::from_str("\"first\"").unwrap();
        assert_eq!(parsed, ReferencePolicy::First);
    }
}
