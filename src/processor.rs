//! Composable bitmap processors.

use crate::bitmap::{Bitmap, ColorKind};
use crate::error::{OptimizeError, Result};
use crate::palette;
use crate::scaling::{AverageAlgorithm, ScalingProcessor};

/// One stage of image processing. Processors never mutate their input.
#[derive(Debug, Clone, PartialEq)]
pub enum Processor {
    /// Indexed -> direct color
    Deindex,
    /// Direct -> indexed, lossless; fails with `PaletteOverflow` on too many colors
    Index { max_palette_size: usize },
    /// Direct -> indexed with precision reduction so the colors always fit
    Quantize { max_colors: usize },
    /// Direct -> direct resampling
    Scale(ScalingProcessor),
    /// Direct -> single-channel luma (alpha kept)
    Grayscale,
}

impl Processor {
    pub fn scale(factor: f64, algorithm: AverageAlgorithm) -> Result<Self> {
        Ok(Processor::Scale(ScalingProcessor::new(factor, algorithm)?))
    }

    /// Color model family this stage accepts
    pub fn input_kind(&self) -> ColorKind {
        match self {
            Processor::Deindex => ColorKind::Indexed,
            _ => ColorKind::Direct,
        }
    }

    /// Color model family this stage produces
    pub fn output_kind(&self) -> ColorKind {
        match self {
            Processor::Index { .. } | Processor::Quantize { .. } => ColorKind::Indexed,
            _ => ColorKind::Direct,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Processor::Deindex => "deindex",
            Processor::Index { .. } => "index",
            Processor::Quantize { .. } => "quantize",
            Processor::Scale(_) => "scale",
            Processor::Grayscale => "grayscale",
        }
    }

    pub fn apply(&self, bitmap: &Bitmap) -> Result<Bitmap> {
        match self {
            Processor::Deindex => palette::deindex(bitmap),
            Processor::Index { max_palette_size } => palette::index(bitmap, *max_palette_size),
            Processor::Quantize { max_colors } => palette::quantize(bitmap, *max_colors),
            Processor::Scale(scaler) => scaler.scale(bitmap),
            Processor::Grayscale => to_grayscale(bitmap),
        }
    }
}

/// Ordered, validated sequence of processors applied left to right
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessorChain {
    stages: Vec<Processor>,
}

impl ProcessorChain {
    /// The empty chain; applying it returns the input unchanged
    pub fn identity() -> Self {
        Self::default()
    }

    /// Validate that each stage's output satisfies the next stage's input
    pub fn new(stages: Vec<Processor>) -> Result<Self> {
        for pair in stages.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.output_kind() != next.input_kind() {
                return Err(OptimizeError::IncompatibleChain(format!(
                    "{} produces {:?} color but {} requires {:?}",
                    prev.name(),
                    prev.output_kind(),
                    next.name(),
                    next.input_kind()
                )));
            }
        }
        Ok(ProcessorChain { stages })
    }

    pub fn builder() -> ChainBuilder {
        ChainBuilder::default()
    }

    pub fn stages(&self) -> &[Processor] {
        &self.stages
    }

    pub fn is_identity(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether the first stage can take a bitmap of this kind
    pub fn accepts(&self, kind: ColorKind) -> bool {
        self.stages
            .first()
            .map_or(true, |stage| stage.input_kind() == kind)
    }

    /// Color family of the chain output for an input of `input` kind
    pub fn output_kind(&self, input: ColorKind) -> ColorKind {
        self.stages.last().map_or(input, Processor::output_kind)
    }

    /// The chain with its trailing indexing stage removed, so results are
    /// kept in direct color. `None` if the chain does not end by indexing.
    pub fn direct_fallback(&self) -> Option<ProcessorChain> {
        match self.stages.last() {
            Some(Processor::Index { .. }) | Some(Processor::Quantize { .. }) => {
                Some(ProcessorChain {
                    stages: self.stages[..self.stages.len() - 1].to_vec(),
                })
            }
            _ => None,
        }
    }

    pub fn apply(&self, input: &Bitmap) -> Result<Bitmap> {
        let Some((first, rest)) = self.stages.split_first() else {
            return Ok(input.clone());
        };
        rest.iter()
            .try_fold(first.apply(input)?, |bitmap, stage| stage.apply(&bitmap))
    }
}

/// Incremental chain construction; validation happens in `build`
#[derive(Debug, Default)]
pub struct ChainBuilder {
    stages: Vec<Processor>,
}

impl ChainBuilder {
    pub fn add(mut self, processor: Processor) -> Self {
        self.stages.push(processor);
        self
    }

    pub fn build(self) -> Result<ProcessorChain> {
        ProcessorChain::new(self.stages)
    }
}

fn to_grayscale(bitmap: &Bitmap) -> Result<Bitmap> {
    if bitmap.kind() != ColorKind::Direct {
        return Err(OptimizeError::UnsupportedColorModel(
            "grayscale requires a direct-color bitmap".into(),
        ));
    }
    let color = bitmap.color_channels();
    if color == 1 {
        return Ok(bitmap.clone());
    }
    let source = bitmap.to_depth8()?;
    let channels = source.channels() as usize;
    let alpha = source.has_alpha();

    let mut pixels = Vec::with_capacity(source.pixel_count() * (1 + usize::from(alpha)));
    for px in source.pixels().chunks_exact(channels) {
        let (r, g, b) = match color {
            3 => (px[0] as f32, px[1] as f32, px[2] as f32),
            4 => {
                let k = px[3] as f32 / 255.0;
                (
                    (255.0 - px[0] as f32) * (1.0 - k),
                    (255.0 - px[1] as f32) * (1.0 - k),
                    (255.0 - px[2] as f32) * (1.0 - k),
                )
            }
            _ => {
                return Err(OptimizeError::UnsupportedColorModel(format!(
                    "{} color channels",
                    color
                )))
            }
        };
        pixels.push((0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8);
        if alpha {
            pixels.push(px[channels - 1]);
        }
    }

    Bitmap::direct(
        source.width(),
        source.height(),
        1 + u8::from(alpha),
        8,
        alpha,
        pixels,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Palette;
    use pretty_assertions::assert_eq;

    fn indexed_stripes() -> Bitmap {
        let palette = Palette::new(3, vec![255, 0, 0, 0, 0, 255]).unwrap();
        Bitmap::indexed(4, 4, 1, palette, (0..16).map(|i| (i % 2) as u8).collect()).unwrap()
    }

    #[test]
    fn test_incompatible_chain_rejected_at_construction() {
        let err = ProcessorChain::builder()
            .add(Processor::Index {
                max_palette_size: 16,
            })
            .add(Processor::scale(0.5, AverageAlgorithm::Mean).unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, OptimizeError::IncompatibleChain(_)));

        assert!(ProcessorChain::new(vec![Processor::Deindex, Processor::Deindex]).is_err());
    }

    #[test]
    fn test_identity_chain_returns_input() {
        let bitmap = indexed_stripes();
        assert_eq!(ProcessorChain::identity().apply(&bitmap).unwrap(), bitmap);
    }

    #[test]
    fn test_deindex_scale_index_chain() {
        let chain = ProcessorChain::builder()
            .add(Processor::Deindex)
            .add(Processor::scale(0.5, AverageAlgorithm::Median).unwrap())
            .add(Processor::Index {
                max_palette_size: 2,
            })
            .build()
            .unwrap();
        assert!(chain.accepts(ColorKind::Indexed));
        assert!(!chain.accepts(ColorKind::Direct));

        let out = chain.apply(&indexed_stripes()).unwrap();
        assert_eq!((out.width(), out.height()), (2, 2));
        assert_eq!(out.kind(), ColorKind::Indexed);
        assert!(out.palette().unwrap().len() <= 2);
    }

    #[test]
    fn test_direct_fallback_drops_trailing_index() {
        let chain = ProcessorChain::new(vec![
            Processor::Deindex,
            Processor::Index {
                max_palette_size: 4,
            },
        ])
        .unwrap();
        let fallback = chain.direct_fallback().unwrap();
        assert_eq!(fallback.stages(), &[Processor::Deindex]);
        assert!(ProcessorChain::identity().direct_fallback().is_none());
    }

    #[test]
    fn test_grayscale_luma() {
        let rgb = Bitmap::direct(2, 1, 3, 8, false, vec![255, 255, 255, 255, 0, 0]).unwrap();
        let gray = Processor::Grayscale.apply(&rgb).unwrap();
        assert_eq!(gray.channels(), 1);
        assert_eq!(gray.pixels(), &[255, 76]);
    }
}
