//! Image frame type shared by cameras, the drift reducer and output sinks.

/// Represents a single camera frame.
///
/// # Storage
/// Pixels are held row-major as `u16`, whatever the sensor bit depth.
/// - 8-bit sensors: values in `0..=255`.
/// - 12/16-bit sensors: values in `0..=4095` / `0..=65535`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bits per pixel (e.g., 8, 12, 16)
    pub bit_depth: u32,

    /// Raw pixel data, `width * height` entries
    pub data: Vec<u16>,
}

impl Frame {
    /// Create a new 16-bit frame.
    ///
    /// Missing pixels are zero-filled and extra pixels are truncated so the
    /// buffer always matches `width * height`.
    pub fn from_u16(width: u32, height: u32, pixels: Vec<u16>) -> Self {
        let mut data = pixels;
        data.resize(width as usize * height as usize, 0);
        Self {
            width,
            height,
            bit_depth: 16,
            data,
        }
    }

    /// Create a new frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, pixels: &[u8]) -> Self {
        let mut data: Vec<u16> = pixels.iter().map(|&v| v as u16).collect();
        data.resize(width as usize * height as usize, 0);
        Self {
            width,
            height,
            bit_depth: 8,
            data,
        }
    }

    /// Create a frame with every pixel set to `value`.
    pub fn filled(width: u32, height: u32, value: u16) -> Self {
        Self {
            width,
            height,
            bit_depth: 16,
            data: vec![value; width as usize * height as usize],
        }
    }

    /// Get pixel value at (x, y).
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get((y * self.width + x) as usize).copied()
    }

    /// Row-major pixel slice.
    pub fn pixels(&self) -> &[u16] {
        &self.data
    }

    /// One image row.
    pub fn row(&self, y: u32) -> Option<&[u16]> {
        if y >= self.height {
            return None;
        }
        let start = (y * self.width) as usize;
        self.data.get(start..start + self.width as usize)
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the frame has no pixels.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Calculate mean pixel value.
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&v| v as u64).sum();
        sum as f64 / self.data.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u16_pads_short_buffers() {
        let frame = Frame::from_u16(3, 2, vec![1, 2, 3]);
        assert_eq!(frame.len(), 6);
        assert_eq!(frame.get(2, 0), Some(3));
        assert_eq!(frame.get(0, 1), Some(0));
        assert_eq!(frame.get(3, 0), None);
    }

    #[test]
    fn test_row_and_mean() {
        let frame = Frame::from_u8(2, 2, &[0, 2, 4, 6]);
        assert_eq!(frame.bit_depth, 8);
        assert_eq!(frame.row(1), Some(&[4u16, 6][..]));
        assert_eq!(frame.row(2), None);
        assert!((frame.mean() - 3.0).abs() < f64::EPSILON);
    }
}
