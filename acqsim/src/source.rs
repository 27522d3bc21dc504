/*!
Pixel sources feeding the acquisition engine.

Pattern and noise generation live outside the core; the engine only needs
something that hands over `rows * cols` pixels within the bit-depth range
on each trigger. [`TestPattern`] is the deterministic source used for
verification runs and golden traces.
*/

use shared::TierParams;

/// Supplies one pixel matrix per acquisition trigger
pub trait PixelSource: Send {
    fn acquire(&mut self, frame_number: u32, params: &TierParams) -> Vec<u16>;
}

impl<F> PixelSource for F
where
    F: FnMut(u32, &TierParams) -> Vec<u16> + Send,
{
    fn acquire(&mut self, frame_number: u32, params: &TierParams) -> Vec<u16> {
        self(frame_number, params)
    }
}

/// Deterministic gradient that changes with every frame number
#[derive(Debug, Clone, Copy, Default)]
pub struct TestPattern;

impl TestPattern {
    pub fn pixel(frame_number: u32, row: usize, col: usize, params: &TierParams) -> u16 {
        let value = (row as u32)
            .wrapping_mul(31)
            .wrapping_add((col as u32).wrapping_mul(7))
            .wrapping_add(frame_number.wrapping_mul(13));
        (value & params.bit_depth.max_value() as u32) as u16
    }

    /// The full frame the source produces for `frame_number`
    pub fn expected(frame_number: u32, params: &TierParams) -> Vec<u16> {
        let mut pixels = Vec::with_capacity(params.num_pixels());
        for row in 0..params.rows {
            for col in 0..params.cols {
                pixels.push(Self::pixel(frame_number, row, col, params));
            }
        }
        pixels
    }
}

impl PixelSource for TestPattern {
    fn acquire(&mut self, frame_number: u32, params: &TierParams) -> Vec<u16> {
        Self::expected(frame_number, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Frame, Tier};

    #[test]
    fn test_pattern_respects_bit_depth() {
        let params = TierParams {
            rows: 64,
            cols: 600,
            ..Tier::Minimum.params()
        };
        let pixels = TestPattern.acquire(1000, &params);
        assert_eq!(pixels.len(), params.num_pixels());
        assert!(Frame::new(1000, params.rows, params.cols, params.bit_depth, pixels).is_ok());
    }

    #[test]
    fn test_frames_differ() {
        let params = TierParams {
            rows: 2,
            cols: 2,
            ..Tier::Minimum.params()
        };
        assert_ne!(TestPattern::expected(0, &params), TestPattern::expected(1, &params));
    }
}
