//! Frame normalisation before descriptor extraction.

use image::imageops;

use crate::types::Frame;

/// Turns a raw camera frame into the frame handed to the descriptor model.
pub trait Preprocess {
    fn preprocess(&self, frame: &Frame) -> Frame;
}

/// Luminance-percentile contrast stretch.
///
/// The `low`/`high` luminance percentiles are mapped to 0 and 255 and every
/// channel is rescaled with the same linear map, which evens out dim or
/// washed-out lighting without shifting hue much.
#[derive(Debug, Clone, Copy)]
pub struct LightingNormalizer {
    pub low_percentile: f32,
    pub high_percentile: f32,
}

impl Default for LightingNormalizer {
    fn default() -> Self {
        Self {
            low_percentile: 0.01,
            high_percentile: 0.99,
        }
    }
}

impl LightingNormalizer {
    fn luminance_bounds(&self, frame: &Frame) -> Option<(u8, u8)> {
        let mut histogram = [0u64; 256];
        for pixel in frame.pixels() {
            histogram[luma(pixel.0) as usize] += 1;
        }
        let total: u64 = histogram.iter().sum();
        if total == 0 {
            return None;
        }

        let low_target = (total as f64 * f64::from(self.low_percentile)).ceil().max(1.0) as u64;
        let high_target = (total as f64 * f64::from(self.high_percentile)).ceil().max(1.0) as u64;

        let mut cumulative = 0u64;
        let mut low = None;
        let mut high = None;
        for (value, count) in histogram.iter().enumerate() {
            cumulative += count;
            if low.is_none() && cumulative >= low_target {
                low = Some(value as u8);
            }
            if cumulative >= high_target {
                high = Some(value as u8);
                break;
            }
        }
        Some((low?, high?))
    }
}

impl Preprocess for LightingNormalizer {
    fn preprocess(&self, frame: &Frame) -> Frame {
        let Some((low, high)) = self.luminance_bounds(frame) else {
            return frame.clone();
        };
        if high <= low {
            return frame.clone();
        }

        let scale = 255.0 / f32::from(high - low);
        let mut lut = [0u8; 256];
        for (value, slot) in lut.iter_mut().enumerate() {
            let stretched = (value as f32 - f32::from(low)) * scale;
            *slot = stretched.round().clamp(0.0, 255.0) as u8;
        }

        let mut out = frame.clone();
        for pixel in out.pixels_mut() {
            for channel in pixel.0.iter_mut() {
                *channel = lut[*channel as usize];
            }
        }
        out
    }
}

/// Horizontal flip, matching the mirrored live preview.
pub fn mirror(frame: &Frame) -> Frame {
    imageops::flip_horizontal(frame)
}

fn luma([r, g, b]: [u8; 3]) -> u8 {
    let y = 0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b);
    y.round().clamp(0.0, 255.0) as u8
}
