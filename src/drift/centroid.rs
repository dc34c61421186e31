//! Centroid (center-of-gravity) estimator.
//!
//! Computes the intensity-weighted centre of each projection and returns the
//! difference. O(n), naturally sub-pixel, and adequate for a single bright
//! object on a dark background. Offsets are in index space, so stacks of
//! different depth need no centre correction.

use super::correlation::check_compatible;
use super::{DriftError, OffsetEstimator, Plane, Projections, Vector3};

/// Default fraction of the projection maximum below which pixels are ignored.
const DEFAULT_THRESHOLD: f64 = 0.1;

/// Difference of intensity-weighted centroids.
#[derive(Debug, Clone)]
pub struct CentroidEstimator {
    threshold: f64,
}

impl CentroidEstimator {
    /// Estimator with the default relative threshold
    pub fn new() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Ignore background-subtracted pixels below `threshold × max`
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Weighted centre (column, row) of `plane`.
    ///
    /// A plane with no signal yields its geometric centre.
    pub fn centroid(&self, plane: &Plane) -> (f64, f64) {
        let geometric = (plane.width as f64 / 2.0, plane.height as f64 / 2.0);
        let subtracted = plane.background_subtracted();
        let max_val = subtracted.max_value();
        if max_val <= 0.0 {
            return geometric;
        }
        let cutoff = self.threshold * max_val;

        let (mut sum_x, mut sum_y, mut sum_w) = (0.0, 0.0, 0.0);
        for (y, row) in subtracted.data.chunks_exact(plane.width).enumerate() {
            for (x, &v) in row.iter().enumerate() {
                if v > cutoff {
                    sum_x += x as f64 * v;
                    sum_y += y as f64 * v;
                    sum_w += v;
                }
            }
        }

        if sum_w > 0.0 {
            (sum_x / sum_w, sum_y / sum_w)
        } else {
            geometric
        }
    }
}

impl Default for CentroidEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetEstimator for CentroidEstimator {
    fn estimate(&self, first: &Projections, latest: &Projections) -> Result<Vector3, DriftError> {
        check_compatible(first, latest)?;

        let diff = |a: &Plane, b: &Plane| {
            let (ax, ay) = self.centroid(a);
            let (bx, by) = self.centroid(b);
            (bx - ax, by - ay)
        };

        let (xy_x, xy_y) = diff(&first.xy_max(), &latest.xy_max());
        let (xz_x, xz_z) = diff(&first.xz_max(), &latest.xz_max());
        let (yz_y, yz_z) = diff(&first.yz_max(), &latest.yz_max());

        Ok(Vector3::new(
            (xy_x + xz_x) / 2.0,
            (xy_y + yz_y) / 2.0,
            (xz_z + yz_z) / 2.0,
        ))
    }

    fn name(&self) -> &'static str {
        "centroid"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centroid_of_single_pixel() {
        let mut plane = Plane::zeros(5, 4);
        plane.data[2 * 5 + 3] = 10.0;

        let (x, y) = CentroidEstimator::new().centroid(&plane);
        assert_eq!((x, y), (3.0, 2.0));
    }

    #[test]
    fn centroid_ignores_flat_background() {
        let mut plane = Plane {
            width: 4,
            height: 4,
            data: vec![50.0; 16],
        };
        plane.data[5] = 150.0;
        plane.data[6] = 150.0;

        let (x, y) = CentroidEstimator::new().centroid(&plane);
        assert!((x - 1.5).abs() < 1e-12);
        assert!((y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_plane_returns_geometric_centre() {
        let plane = Plane::zeros(6, 4);
        assert_eq!(CentroidEstimator::new().centroid(&plane), (3.0, 2.0));
    }
}
