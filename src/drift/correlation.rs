//! FFT cross-power correlation estimator.
//!
//! Each projection pair is background-subtracted, centred in a zero-padded
//! buffer twice the larger extent, and correlated through
//! `IFFT(FFT(latest) · conj(FFT(first)))` with a whitened spectrum. The
//! integer peak is refined with a parabola through its neighbours. XY
//! yields (x, y), XZ yields (x, z), YZ yields (y, z); each axis is the mean
//! of the two estimates it appears in.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use super::{DriftError, OffsetEstimator, Plane, Projections, Vector3};

/// Default whitening floor, relative to the largest cross-power magnitude.
const DEFAULT_WHITENING_FLOOR: f64 = 1e-3;

/// Cross-correlation of max projections.
#[derive(Debug, Clone)]
pub struct CorrelationEstimator {
    whitening_floor: f64,
}

impl CorrelationEstimator {
    /// Estimator with the default whitening floor
    pub fn new() -> Self {
        Self {
            whitening_floor: DEFAULT_WHITENING_FLOOR,
        }
    }

    /// Override the relative whitening floor. `0.0` gives pure phase
    /// correlation; larger values move towards plain cross-correlation.
    pub fn with_whitening_floor(mut self, floor: f64) -> Self {
        self.whitening_floor = floor.max(0.0);
        self
    }

    /// Shift of `latest` relative to `first` as (columns, rows).
    ///
    /// Both planes are centred in the padded buffer; the returned shift is
    /// in index space of the original planes.
    pub fn correlate_planes(&self, first: &Plane, latest: &Plane) -> (f64, f64) {
        let centre = |p: &Plane| (p.width / 2, p.height / 2);
        self.correlate_about(first, centre(first), latest, centre(latest))
    }

    /// As [`correlate_planes`](Self::correlate_planes), placing each
    /// plane's `(column, row)` centre at the middle of the padded buffer.
    fn correlate_about(
        &self,
        first: &Plane,
        first_centre: (usize, usize),
        latest: &Plane,
        latest_centre: (usize, usize),
    ) -> (f64, f64) {
        let nx = 2 * first.width.max(latest.width).max(1);
        let ny = 2 * first.height.max(latest.height).max(1);

        let mut planner = FftPlanner::<f64>::new();
        let fwd_x = planner.plan_fft_forward(nx);
        let fwd_y = planner.plan_fft_forward(ny);
        let inv_x = planner.plan_fft_inverse(nx);
        let inv_y = planner.plan_fft_inverse(ny);

        let (mut f, fo) = embed(&first.background_subtracted(), first_centre, nx, ny);
        let (mut l, lo) = embed(&latest.background_subtracted(), latest_centre, nx, ny);
        fft_2d(&mut f, nx, ny, &fwd_x, &fwd_y);
        fft_2d(&mut l, nx, ny, &fwd_x, &fwd_y);

        let mut cross: Vec<Complex<f64>> =
            l.iter().zip(f.iter()).map(|(a, b)| a * b.conj()).collect();
        let peak_power = cross.iter().map(|c| c.norm()).fold(0.0, f64::max);
        if peak_power == 0.0 {
            return (0.0, 0.0);
        }
        let floor = self.whitening_floor * peak_power;
        for c in cross.iter_mut() {
            *c /= c.norm() + floor;
        }

        fft_2d(&mut cross, nx, ny, &inv_x, &inv_y);
        let surface: Vec<f64> = cross.iter().map(|c| c.re).collect();

        let mut best = 0;
        for (i, &v) in surface.iter().enumerate() {
            if v > surface[best] {
                best = i;
            }
        }
        let (px, py) = (best % nx, best / nx);

        let at = |x: usize, y: usize| surface[y * nx + x];
        let dx = parabolic(
            at((px + nx - 1) % nx, py),
            at(px, py),
            at((px + 1) % nx, py),
        );
        let dy = parabolic(
            at(px, (py + ny - 1) % ny),
            at(px, py),
            at(px, (py + 1) % ny),
        );

        let shift_x = wrap(px, nx) + dx - (lo.0 as f64 - fo.0 as f64);
        let shift_y = wrap(py, ny) + dy - (lo.1 as f64 - fo.1 as f64);
        (shift_x, shift_y)
    }
}

impl Default for CorrelationEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetEstimator for CorrelationEstimator {
    fn estimate(&self, first: &Projections, latest: &Projections) -> Result<Vector3, DriftError> {
        check_compatible(first, latest)?;

        let (fc, lc) = (first.center(), latest.center());
        let (xy_x, xy_y) = self.correlate_about(
            &first.xy_max(),
            centre_of(fc.x, fc.y),
            &latest.xy_max(),
            centre_of(lc.x, lc.y),
        );
        let (xz_x, xz_z) = self.correlate_about(
            &first.xz_max(),
            centre_of(fc.x, fc.z),
            &latest.xz_max(),
            centre_of(lc.x, lc.z),
        );
        let (yz_y, yz_z) = self.correlate_about(
            &first.yz_max(),
            centre_of(fc.y, fc.z),
            &latest.yz_max(),
            centre_of(lc.y, lc.z),
        );

        let offset = Vector3::new(
            (xy_x + xz_x) / 2.0,
            (xy_y + yz_y) / 2.0,
            (xz_z + yz_z) / 2.0,
        );
        tracing::trace!(
            xy = ?(xy_x, xy_y),
            xz = ?(xz_x, xz_z),
            yz = ?(yz_y, yz_z),
            "Projection correlation"
        );
        Ok(offset)
    }

    fn name(&self) -> &'static str {
        "correlation"
    }
}

/// Both stacks must be non-empty and share a lateral size.
pub(crate) fn check_compatible(first: &Projections, latest: &Projections) -> Result<(), DriftError> {
    if first.is_empty() || latest.is_empty() {
        return Err(DriftError::EmptyStack);
    }
    let (fw, fh) = first.dimensions();
    let (lw, lh) = latest.dimensions();
    if (fw, fh) != (lw, lh) {
        return Err(DriftError::ShapeMismatch(fw, fh, lw, lh));
    }
    Ok(())
}

/// Index-space centre coordinates as a (column, row) pair.
fn centre_of(column: f64, row: f64) -> (usize, usize) {
    (column as usize, row as usize)
}

/// Copy `plane` into an `nx × ny` complex buffer with `centre` at the
/// buffer's middle. Returns the buffer and the (column, row) where the
/// plane's origin landed.
fn embed(
    plane: &Plane,
    centre: (usize, usize),
    nx: usize,
    ny: usize,
) -> (Vec<Complex<f64>>, (usize, usize)) {
    let ox = nx / 2 - centre.0;
    let oy = ny / 2 - centre.1;
    let mut buf = vec![Complex::new(0.0, 0.0); nx * ny];
    for (y, row) in plane.data.chunks_exact(plane.width.max(1)).enumerate() {
        let start = (y + oy) * nx + ox;
        for (x, &v) in row.iter().enumerate() {
            buf[start + x] = Complex::new(v, 0.0);
        }
    }
    (buf, (ox, oy))
}

/// In-place 2-D transform: rows, then columns.
fn fft_2d(
    buf: &mut [Complex<f64>],
    nx: usize,
    ny: usize,
    along_x: &Arc<dyn Fft<f64>>,
    along_y: &Arc<dyn Fft<f64>>,
) {
    for row in buf.chunks_exact_mut(nx) {
        along_x.process(row);
    }
    let mut column = vec![Complex::new(0.0, 0.0); ny];
    for x in 0..nx {
        for y in 0..ny {
            column[y] = buf[y * nx + x];
        }
        along_y.process(&mut column);
        for y in 0..ny {
            buf[y * nx + x] = column[y];
        }
    }
}

/// Circular index to signed shift.
fn wrap(index: usize, n: usize) -> f64 {
    if index > n / 2 {
        index as f64 - n as f64
    } else {
        index as f64
    }
}

/// Vertex offset of the parabola through three equally spaced samples.
fn parabolic(left: f64, centre: f64, right: f64) -> f64 {
    let denom = left - 2.0 * centre + right;
    if denom.abs() < f64::EPSILON * centre.abs().max(1.0) {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(width: usize, height: usize, cx: f64, cy: f64, sigma: f64) -> Plane {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                data.push(1000.0 * (-r2 / (2.0 * sigma * sigma)).exp());
            }
        }
        Plane {
            width,
            height,
            data,
        }
    }

    #[test]
    fn recovers_integer_shift() {
        let estimator = CorrelationEstimator::new();
        let first = blob(64, 64, 20.0, 24.0, 2.0);
        let latest = blob(64, 64, 25.0, 21.0, 2.0);

        let (dx, dy) = estimator.correlate_planes(&first, &latest);
        assert!((dx - 5.0).abs() < 1e-6, "dx = {dx}");
        assert!((dy + 3.0).abs() < 1e-6, "dy = {dy}");
    }

    #[test]
    fn identical_planes_give_zero() {
        let estimator = CorrelationEstimator::new();
        let plane = blob(32, 32, 10.0, 20.0, 3.0);
        let (dx, dy) = estimator.correlate_planes(&plane, &plane);
        assert!(dx.abs() < 1e-9 && dy.abs() < 1e-9);
    }

    #[test]
    fn different_heights_share_index_space() {
        let estimator = CorrelationEstimator::new();
        let first = blob(32, 12, 12.0, 5.0, 1.0);
        let latest = blob(32, 19, 14.0, 7.0, 1.0);

        let (dx, dy) = estimator.correlate_planes(&first, &latest);
        assert!((dx - 2.0).abs() < 1e-3, "dx = {dx}");
        assert!((dy - 2.0).abs() < 1e-3, "dy = {dy}");
    }

    fn stack(slices: usize, centre: Vector3) -> Projections {
        let (w, h) = (24u32, 20u32);
        let mut projections = Projections::new();
        for z in 0..slices {
            let mut pixels = Vec::with_capacity((w * h) as usize);
            for y in 0..h {
                for x in 0..w {
                    let r2 = (x as f64 - centre.x).powi(2)
                        + (y as f64 - centre.y).powi(2)
                        + (z as f64 - centre.z).powi(2);
                    pixels.push((4000.0 * (-r2 / 4.0).exp()) as u16);
                }
            }
            projections
                .tally(&crate::hardware::Frame::from_u16(w, h, pixels))
                .unwrap();
        }
        projections
    }

    #[test]
    fn stacks_of_different_depth_align_on_their_centres() {
        let first = stack(8, Vector3::new(10.0, 9.0, 3.0));
        let latest = stack(12, Vector3::new(10.0, 9.0, 5.0));
        assert_eq!(latest.center().z - first.center().z, 2.0);

        let offset = CorrelationEstimator::new().estimate(&first, &latest).unwrap();
        assert!(offset.x.abs() < 1e-2, "x = {}", offset.x);
        assert!(offset.y.abs() < 1e-2, "y = {}", offset.y);
        assert!((offset.z - 2.0).abs() < 1e-2, "z = {}", offset.z);
    }

    #[test]
    fn flat_planes_do_not_move() {
        let estimator = CorrelationEstimator::new();
        let flat = Plane::zeros(8, 8);
        assert_eq!(estimator.correlate_planes(&flat, &flat), (0.0, 0.0));
    }

    #[test]
    fn wrap_and_parabola() {
        assert_eq!(wrap(3, 16), 3.0);
        assert_eq!(wrap(8, 16), 8.0);
        assert_eq!(wrap(9, 16), -7.0);
        assert_eq!(parabolic(1.0, 2.0, 1.0), 0.0);
        assert!((parabolic(0.0, 1.0, 1.0) - 0.5).abs() < 1e-12);
    }
}
