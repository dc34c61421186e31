//! Incremental stack projections.
//!
//! Each tallied frame updates the XY maximum and running XY sum in place and
//! appends one row to each of the XZ and YZ maximum projections. Work per
//! frame is O(width × height); the XY accumulators do not grow with depth.

use super::{DriftError, Vector3};
use crate::hardware::Frame;

/// A 2-D `f64` image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    /// Columns
    pub width: usize,
    /// Rows
    pub height: usize,
    /// `width * height` samples
    pub data: Vec<f64>,
}

impl Plane {
    /// Zero-filled plane
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    /// Plane from row-major samples; `None` if the length does not match
    pub fn from_vec(width: usize, height: usize, data: Vec<f64>) -> Option<Self> {
        (data.len() == width * height).then_some(Self {
            width,
            height,
            data,
        })
    }

    /// Sample at column `x`, row `y`
    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y * self.width + x).copied()
    }

    /// Smallest sample (0.0 for an empty plane)
    pub fn min_value(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Largest sample (0.0 for an empty plane)
    pub fn max_value(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Column and row of the largest sample
    pub fn argmax(&self) -> (usize, usize) {
        let mut best = 0;
        for (i, &v) in self.data.iter().enumerate() {
            if v > self.data[best] {
                best = i;
            }
        }
        if self.width == 0 {
            return (0, 0);
        }
        (best % self.width, best / self.width)
    }

    /// Copy with the minimum subtracted so the background sits at zero
    pub fn background_subtracted(&self) -> Plane {
        let floor = self.min_value();
        Plane {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|v| v - floor).collect(),
        }
    }
}

/// Running projections of one stack.
#[derive(Debug, Clone, Default)]
pub struct Projections {
    width: u32,
    height: u32,
    slices: usize,
    xy_max: Vec<f64>,
    xy_sum: Vec<f64>,
    xz_max: Vec<f64>,
    yz_max: Vec<f64>,
}

impl Projections {
    /// Empty accumulator; the first tallied frame fixes the lateral size
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one slice into the projections. Slices are expected in
    /// acquisition order.
    pub fn tally(&mut self, frame: &Frame) -> Result<(), DriftError> {
        if frame.is_empty() || frame.width == 0 || frame.height == 0 {
            return Err(DriftError::EmptyFrame);
        }
        if self.slices == 0 {
            self.width = frame.width;
            self.height = frame.height;
            let pixels = frame.len();
            self.xy_max = vec![f64::NEG_INFINITY; pixels];
            self.xy_sum = vec![0.0; pixels];
        } else if frame.width != self.width || frame.height != self.height {
            return Err(DriftError::FrameSize {
                width: self.width,
                height: self.height,
                got_width: frame.width,
                got_height: frame.height,
            });
        }

        let w = self.width as usize;
        let h = self.height as usize;
        let mut xz_row = vec![f64::NEG_INFINITY; w];
        let mut yz_row = vec![f64::NEG_INFINITY; h];

        for (y, row) in frame.pixels().chunks_exact(w).enumerate() {
            for (x, &raw) in row.iter().enumerate() {
                let v = raw as f64;
                let i = y * w + x;
                if v > self.xy_max[i] {
                    self.xy_max[i] = v;
                }
                self.xy_sum[i] += v;
                if v > xz_row[x] {
                    xz_row[x] = v;
                }
                if v > yz_row[y] {
                    yz_row[y] = v;
                }
            }
        }

        self.xz_max.extend_from_slice(&xz_row);
        self.yz_max.extend_from_slice(&yz_row);
        self.slices += 1;
        Ok(())
    }

    /// Number of tallied slices
    pub fn slices(&self) -> usize {
        self.slices
    }

    /// True until the first slice is tallied
    pub fn is_empty(&self) -> bool {
        self.slices == 0
    }

    /// Lateral size (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Maximum intensity along Z (width × height)
    pub fn xy_max(&self) -> Plane {
        Plane {
            width: self.width as usize,
            height: self.height as usize,
            data: self.xy_max.clone(),
        }
    }

    /// Mean intensity along Z (width × height)
    pub fn xy_mean(&self) -> Plane {
        let n = self.slices.max(1) as f64;
        Plane {
            width: self.width as usize,
            height: self.height as usize,
            data: self.xy_sum.iter().map(|s| s / n).collect(),
        }
    }

    /// Maximum along Y: columns are X, rows are slices
    pub fn xz_max(&self) -> Plane {
        Plane {
            width: self.width as usize,
            height: self.slices,
            data: self.xz_max.clone(),
        }
    }

    /// Maximum along X: columns are Y, rows are slices
    pub fn yz_max(&self) -> Plane {
        Plane {
            width: self.height as usize,
            height: self.slices,
            data: self.yz_max.clone(),
        }
    }

    /// Index-space centre of the stack (integer halves of each extent).
    ///
    /// Correlation aligns stacks on these centres, so stacks of different
    /// depth are compared in a common frame.
    pub fn center(&self) -> Vector3 {
        Vector3::new(
            (self.width / 2) as f64,
            (self.height / 2) as f64,
            (self.slices / 2) as f64,
        )
    }
}
