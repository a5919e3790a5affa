//! Box-filter resampling of direct-color bitmaps.

use crate::bitmap::{bytes_per_sample, max_sample, push_sample, read_sample, Bitmap, ColorModel};
use crate::error::{OptimizeError, Result};

/// How the source samples covered by one output pixel are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AverageAlgorithm {
    /// Area-weighted arithmetic mean
    #[default]
    Mean,
    /// Area-weighted median; keeps hard edges crisper than `Mean`
    Median,
}

/// Resamples a direct-color bitmap by a fixed factor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingProcessor {
    factor: f64,
    algorithm: AverageAlgorithm,
}

/// Source pixel index and the length of its overlap with an output pixel
type Span = (usize, f64);

impl ScalingProcessor {
    pub fn new(factor: f64, algorithm: AverageAlgorithm) -> Result<Self> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(OptimizeError::IncompatibleChain(format!(
                "scaling factor must be positive, got {}",
                factor
            )));
        }
        Ok(ScalingProcessor { factor, algorithm })
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn algorithm(&self) -> AverageAlgorithm {
        self.algorithm
    }

    /// Output dimensions for a source of `width` x `height`, never below 1x1
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = |v: u32| ((v as f64 * self.factor).round() as u32).max(1);
        (scale(width), scale(height))
    }

    pub fn scale(&self, bitmap: &Bitmap) -> Result<Bitmap> {
        let ColorModel::Direct {
            channels,
            bit_depth,
        } = bitmap.color_model()
        else {
            return Err(OptimizeError::UnsupportedColorModel(
                "scaling requires a direct-color bitmap; deindex first".into(),
            ));
        };

        let (width, height) = (bitmap.width(), bitmap.height());
        let (new_width, new_height) = self.target_dimensions(width, height);
        if (new_width, new_height) == (width, height) {
            return Ok(bitmap.clone());
        }

        let columns = spans(width as usize, new_width as usize);
        let rows = spans(height as usize, new_height as usize);

        let bps = bytes_per_sample(bit_depth);
        let channels = channels as usize;
        let stride = width as usize * channels;
        let max = max_sample(bit_depth) as f64;
        let src = bitmap.pixels();

        let mut out = Vec::with_capacity(new_width as usize * new_height as usize * channels * bps);
        let mut covered: Vec<(u16, f64)> = Vec::new();

        for row_spans in &rows {
            for column_spans in &columns {
                for channel in 0..channels {
                    covered.clear();
                    for &(sy, wy) in row_spans {
                        for &(sx, wx) in column_spans {
                            let idx = (sy * stride + sx * channels + channel) * bps;
                            covered.push((read_sample(src, idx, bps), wx * wy));
                        }
                    }
                    let value = match self.algorithm {
                        AverageAlgorithm::Mean => weighted_mean(&covered),
                        AverageAlgorithm::Median => weighted_median(&mut covered),
                    };
                    push_sample(&mut out, value.round().clamp(0.0, max) as u16, bps);
                }
            }
        }

        Bitmap::direct(
            new_width,
            new_height,
            channels as u8,
            bit_depth,
            bitmap.has_alpha(),
            out,
        )
    }
}

/// For every output index, the source pixels its box covers with fractional
/// overlap weights. Boxes are clipped to the source extent.
fn spans(source_len: usize, target_len: usize) -> Vec<Vec<Span>> {
    let ratio = source_len as f64 / target_len as f64;
    let limit = source_len as f64;
    (0..target_len)
        .map(|o| {
            let start = (o as f64 * ratio).min(limit);
            let end = ((o + 1) as f64 * ratio).min(limit);
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(source_len);
            let mut covered: Vec<Span> = (first..last)
                .filter_map(|s| {
                    let overlap = end.min(s as f64 + 1.0) - start.max(s as f64);
                    (overlap > 1e-9).then_some((s, overlap))
                })
                .collect();
            if covered.is_empty() {
                covered.push((first.min(source_len - 1), 1.0));
            }
            covered
        })
        .collect()
}

fn weighted_mean(samples: &[(u16, f64)]) -> f64 {
    let (sum, total) = samples
        .iter()
        .fold((0.0, 0.0), |(sum, total), &(v, w)| (sum + v as f64 * w, total + w));
    sum / total
}

fn weighted_median(samples: &mut [(u16, f64)]) -> f64 {
    samples.sort_by_key(|&(v, _)| v);
    let half = samples.iter().map(|&(_, w)| w).sum::<f64>() / 2.0;
    let mut cumulative = 0.0;
    for &(v, w) in samples.iter() {
        cumulative += w;
        if cumulative >= half {
            return v as f64;
        }
    }
    samples.last().map(|&(v, _)| v as f64).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Palette;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn uniform(width: u32, height: u32, color: [u8; 3]) -> Bitmap {
        let pixels = color
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Bitmap::direct(width, height, 3, 8, false, pixels).unwrap()
    }

    #[test]
    fn test_uniform_downscale_stays_uniform() {
        let scaler = ScalingProcessor::new(0.5, AverageAlgorithm::Mean).unwrap();
        let scaled = scaler.scale(&uniform(100, 100, [200, 100, 50])).unwrap();
        assert_eq!((scaled.width(), scaled.height()), (50, 50));
        assert!(scaled
            .pixels()
            .chunks_exact(3)
            .all(|p| p == [200, 100, 50]));
    }

    #[test]
    fn test_half_scale_averages_blocks() {
        let gray = Bitmap::direct(2, 2, 1, 8, false, vec![0, 100, 200, 100]).unwrap();
        let scaler = ScalingProcessor::new(0.5, AverageAlgorithm::Mean).unwrap();
        let scaled = scaler.scale(&gray).unwrap();
        assert_eq!(scaled.pixels(), &[100]);
    }

    #[test]
    fn test_fractional_overlap_is_weighted() {
        // 3 -> 2 columns: the middle source pixel is split between both outputs
        let gray = Bitmap::direct(3, 1, 1, 8, false, vec![0, 90, 180]).unwrap();
        let scaler = ScalingProcessor::new(2.0 / 3.0, AverageAlgorithm::Mean).unwrap();
        let scaled = scaler.scale(&gray).unwrap();
        // (0*1 + 90*0.5)/1.5 = 30, (90*0.5 + 180*1)/1.5 = 150
        assert_eq!(scaled.pixels(), &[30, 150]);
    }

    #[test]
    fn test_alpha_averaged_independently() {
        let la = Bitmap::direct(2, 1, 2, 8, true, vec![100, 0, 100, 255]).unwrap();
        let scaler = ScalingProcessor::new(0.5, AverageAlgorithm::Mean).unwrap();
        let scaled = scaler.scale(&la).unwrap();
        assert!(scaled.has_alpha());
        assert_eq!(scaled.pixels(), &[100, 128]);
    }

    #[test]
    fn test_median_picks_majority() {
        let gray = Bitmap::direct(3, 1, 1, 8, false, vec![0, 0, 255]).unwrap();
        let scaler = ScalingProcessor::new(1.0 / 3.0, AverageAlgorithm::Median).unwrap();
        assert_eq!(scaler.scale(&gray).unwrap().pixels(), &[0]);
    }

    #[test]
    fn test_tiny_factor_clamps_to_one_pixel() {
        let scaler = ScalingProcessor::new(0.001, AverageAlgorithm::Mean).unwrap();
        let scaled = scaler.scale(&uniform(10, 4, [1, 2, 3])).unwrap();
        assert_eq!((scaled.width(), scaled.height()), (1, 1));
        assert_eq!(scaled.pixels(), &[1, 2, 3]);
    }

    #[test]
    fn test_upscale_replicates_pixels() {
        let gray = Bitmap::direct(2, 1, 1, 8, false, vec![10, 20]).unwrap();
        let scaler = ScalingProcessor::new(2.0, AverageAlgorithm::Mean).unwrap();
        let scaled = scaler.scale(&gray).unwrap();
        assert_eq!((scaled.width(), scaled.height()), (4, 2));
        assert_eq!(scaled.pixels(), &[10, 10, 20, 20, 10, 10, 20, 20]);
    }

    #[test]
    fn test_sixteen_bit_samples() {
        let pixels = [1000u16, 3000]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        let gray = Bitmap::direct(2, 1, 1, 16, false, pixels).unwrap();
        let scaler = ScalingProcessor::new(0.5, AverageAlgorithm::Mean).unwrap();
        assert_eq!(scaler.scale(&gray).unwrap().pixels(), &2000u16.to_be_bytes());
    }

    #[test]
    fn test_rejects_indexed_input() {
        let palette = Palette::new(1, vec![0, 255]).unwrap();
        let indexed = Bitmap::indexed(2, 1, 1, palette, vec![0, 1]).unwrap();
        let scaler = ScalingProcessor::new(0.5, AverageAlgorithm::Mean).unwrap();
        assert!(matches!(
            scaler.scale(&indexed),
            Err(OptimizeError::UnsupportedColorModel(_))
        ));
    }

    #[test]
    fn test_rejects_non_positive_factor() {
        assert!(ScalingProcessor::new(0.0, AverageAlgorithm::Mean).is_err());
        assert!(ScalingProcessor::new(f64::NAN, AverageAlgorithm::Mean).is_err());
    }

    proptest! {
        #[test]
        fn prop_unit_factor_is_identity(
            width in 1u32..12,
            height in 1u32..12,
            seed in any::<u8>(),
        ) {
            let pixels: Vec<u8> = (0..width * height * 3)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect();
            let bitmap = Bitmap::direct(width, height, 3, 8, false, pixels).unwrap();
            let scaler = ScalingProcessor::new(1.0, AverageAlgorithm::Mean).unwrap();
            prop_assert_eq!(scaler.scale(&bitmap).unwrap(), bitmap);
        }
    }
}
