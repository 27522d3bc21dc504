/*!
Frame data structures.

A [`Frame`] is one complete image acquisition: a frame number plus a
row-major pixel buffer whose length always equals `rows * cols`.
*/

use crate::error::{ProtocolError, Result};
use crate::tier::{BitDepth, TierParams};

/// One complete image acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub number: u32,
    pub rows: usize,
    pub cols: usize,
    pub bit_depth: BitDepth,
    pixels: Vec<u16>,
}

/// First pixel that differs from a reference pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelMismatch {
    pub row: usize,
    pub col: usize,
    pub expected: u16,
    pub actual: u16,
}

impl Frame {
    /// Create a frame, checking the length and value-range invariants
    pub fn new(number: u32, rows: usize, cols: usize, bit_depth: BitDepth, pixels: Vec<u16>) -> Result<Self> {
        if pixels.len() != rows * cols {
            return Err(ProtocolError::invalid_frame(format!(
                "pixel buffer holds {} values, expected {}x{}={}",
                pixels.len(),
                rows,
                cols,
                rows * cols
            )));
        }

        let max = bit_depth.max_value();
        if let Some(pos) = pixels.iter().position(|&p| p > max) {
            return Err(ProtocolError::invalid_frame(format!(
                "pixel {} value {} exceeds {}-bit range",
                pos,
                pixels[pos],
                bit_depth.bits()
            )));
        }

        Ok(Self {
            number,
            rows,
            cols,
            bit_depth,
            pixels,
        })
    }

    /// All-zero frame with the tier's geometry
    pub fn zeroed(number: u32, params: &TierParams) -> Self {
        Self {
            number,
            rows: params.rows,
            cols: params.cols,
            bit_depth: params.bit_depth,
            pixels: vec![0; params.num_pixels()],
        }
    }

    /// Rebuild a frame from its wire form (16-bit little-endian pixels)
    pub fn from_le_bytes(number: u32, params: &TierParams, data: &[u8]) -> Result<Self> {
        if data.len() != params.frame_bytes() {
            return Err(ProtocolError::invalid_frame(format!(
                "frame payload is {} bytes, expected {}",
                data.len(),
                params.frame_bytes()
            )));
        }

        let pixels = data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Self::new(number, params.rows, params.cols, params.bit_depth, pixels)
    }

    /// Wire form of the whole pixel buffer
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u16> {
        self.pixels
    }

    pub fn num_pixels(&self) -> usize {
        self.pixels.len()
    }

    /// Pixels of one row, `None` past the last row
    pub fn row(&self, row: usize) -> Option<&[u16]> {
        if row >= self.rows {
            return None;
        }
        let start = row * self.cols;
        Some(&self.pixels[start..start + self.cols])
    }

    /// Compare against a known pattern; used only in verification runs
    pub fn first_mismatch(&self, expected: &[u16]) -> Option<PixelMismatch> {
        if expected.len() != self.pixels.len() {
            return Some(PixelMismatch {
                row: self.rows,
                col: 0,
                expected: 0,
                actual: 0,
            });
        }

        self.pixels
            .iter()
            .zip(expected)
            .position(|(actual, expected)| actual != expected)
            .map(|pos| PixelMismatch {
                row: pos / self.cols,
                col: pos % self.cols,
                expected: expected[pos],
                actual: self.pixels[pos],
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::Tier;

    fn small_params() -> TierParams {
        TierParams {
            rows: 4,
            cols: 8,
            ..Tier::Minimum.params()
        }
    }

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(42, 2, 3, BitDepth::Sixteen, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(frame.number, 42);
        assert_eq!(frame.num_pixels(), 6);
        assert_eq!(frame.row(1), Some(&[4u16, 5, 6][..]));
        assert_eq!(frame.row(2), None);
    }

    #[test]
    fn test_length_invariant_enforced() {
        let err = Frame::new(0, 2, 2, BitDepth::Sixteen, vec![0; 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));
    }

    #[test]
    fn test_fourteen_bit_range_enforced() {
        assert!(Frame::new(0, 1, 2, BitDepth::Fourteen, vec![0x3FFF, 0]).is_ok());
        assert!(Frame::new(0, 1, 2, BitDepth::Fourteen, vec![0x4000, 0]).is_err());
    }

    #[test]
    fn test_wire_form_is_little_endian() {
        let params = small_params();
        let pixels: Vec<u16> = (0..32).map(|i| i * 0x101).collect();
        let frame = Frame::new(7, 4, 8, params.bit_depth, pixels).unwrap();
        let bytes = frame.to_le_bytes();
        assert_eq!(&bytes[2..4], &[0x01, 0x01]);
        assert_eq!(Frame::from_le_bytes(7, &params, &bytes).unwrap(), frame);
        assert!(Frame::from_le_bytes(7, &params, &bytes[1..]).is_err());
    }

    #[test]
    fn test_first_mismatch_location() {
        let params = small_params();
        let frame = Frame::zeroed(1, &params);
        let mut expected = vec![0u16; 32];
        assert_eq!(frame.first_mismatch(&expected), None);
        expected[10] = 9;
        let mismatch = frame.first_mismatch(&expected).unwrap();
        assert_eq!((mismatch.row, mismatch.col, mismatch.expected), (1, 2, 9));
    }
}
