//! In-memory raster data with its color model.
//!
//! Samples are stored unpacked: one byte per sample for bit depths up to 8
//! (holding values `0..2^depth`), two big-endian bytes per sample for 16-bit
//! images. Indexed bitmaps store one byte per pixel holding the palette index.

use crate::error::{OptimizeError, Result};

/// Broad color model family, used to validate processor chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorKind {
    Direct,
    Indexed,
}

/// How pixel values are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorModel {
    /// Every pixel carries `channels` samples inline (alpha, if any, is the last one)
    Direct { channels: u8, bit_depth: u8 },
    /// Every pixel is an index into a palette of `palette_size` entries
    Indexed { palette_size: usize, bit_depth: u8 },
}

impl ColorModel {
    pub fn kind(&self) -> ColorKind {
        match self {
            ColorModel::Direct { .. } => ColorKind::Direct,
            ColorModel::Indexed { .. } => ColorKind::Indexed,
        }
    }

    pub fn bit_depth(&self) -> u8 {
        match *self {
            ColorModel::Direct { bit_depth, .. } | ColorModel::Indexed { bit_depth, .. } => {
                bit_depth
            }
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match *self {
            ColorModel::Direct {
                channels,
                bit_depth,
            } => channels as usize * bytes_per_sample(bit_depth),
            ColorModel::Indexed { .. } => 1,
        }
    }
}

/// Bytes used to store one unpacked sample of the given depth
pub fn bytes_per_sample(bit_depth: u8) -> usize {
    if bit_depth > 8 {
        2
    } else {
        1
    }
}

/// Largest sample value representable at the given depth
pub fn max_sample(bit_depth: u8) -> u32 {
    (1u32 << bit_depth) - 1
}

fn validate_depth(bit_depth: u8, allow_16: bool) -> Result<()> {
    match bit_depth {
        1 | 2 | 4 | 8 => Ok(()),
        16 if allow_16 => Ok(()),
        other => Err(OptimizeError::UnsupportedColorModel(format!(
            "{} bits per component",
            other
        ))),
    }
}

/// Ordered palette of 8-bit color entries with a fixed channel count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    channels: u8,
    entries: Vec<u8>,
}

impl Palette {
    pub fn new(channels: u8, entries: Vec<u8>) -> Result<Self> {
        if channels == 0 || entries.len() % channels as usize != 0 {
            return Err(OptimizeError::CorruptPalette(format!(
                "{} bytes is not a whole number of {}-channel entries",
                entries.len(),
                channels
            )));
        }
        Ok(Palette { channels, entries })
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.entries.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&[u8]> {
        let c = self.channels as usize;
        self.entries.get(index * c..(index + 1) * c)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.chunks(self.channels as usize)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.entries
    }
}

/// Decoded raster image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    color_model: ColorModel,
    pixels: Vec<u8>,
    has_alpha: bool,
    palette: Option<Palette>,
}

impl Bitmap {
    /// Create a direct-color bitmap. `channels` includes the alpha channel when `has_alpha`.
    pub fn direct(
        width: u32,
        height: u32,
        channels: u8,
        bit_depth: u8,
        has_alpha: bool,
        pixels: Vec<u8>,
    ) -> Result<Self> {
        validate_depth(bit_depth, true)?;
        if channels == 0 || (has_alpha && channels < 2) {
            return Err(OptimizeError::UnsupportedColorModel(format!(
                "{} channels (alpha: {})",
                channels, has_alpha
            )));
        }
        let color_model = ColorModel::Direct {
            channels,
            bit_depth,
        };
        Self::checked(width, height, color_model, pixels, has_alpha, None)
    }

    /// Create an indexed bitmap. Index values are not range-checked here;
    /// lookups of out-of-range indices fail when the bitmap is deindexed.
    pub fn indexed(
        width: u32,
        height: u32,
        bit_depth: u8,
        palette: Palette,
        indices: Vec<u8>,
    ) -> Result<Self> {
        validate_depth(bit_depth, false)?;
        let color_model = ColorModel::Indexed {
            palette_size: palette.len(),
            bit_depth,
        };
        Self::checked(width, height, color_model, indices, false, Some(palette))
    }

    /// Create an indexed bitmap whose palette entries carry a trailing alpha sample.
    pub fn indexed_with_alpha(
        width: u32,
        height: u32,
        bit_depth: u8,
        palette: Palette,
        indices: Vec<u8>,
    ) -> Result<Self> {
        let mut bitmap = Self::indexed(width, height, bit_depth, palette, indices)?;
        bitmap.has_alpha = true;
        Ok(bitmap)
    }

    fn checked(
        width: u32,
        height: u32,
        color_model: ColorModel,
        pixels: Vec<u8>,
        has_alpha: bool,
        palette: Option<Palette>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(OptimizeError::ResourceDecodeFailed(format!(
                "invalid dimensions {}x{}",
                width, height
            )));
        }
        let expected = width as usize * height as usize * color_model.bytes_per_pixel();
        if pixels.len() != expected {
            return Err(OptimizeError::ResourceDecodeFailed(format!(
                "pixel buffer has {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }
        Ok(Bitmap {
            width,
            height,
            color_model,
            pixels,
            has_alpha,
            palette,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_model(&self) -> ColorModel {
        self.color_model
    }

    pub fn kind(&self) -> ColorKind {
        self.color_model.kind()
    }

    pub fn bit_depth(&self) -> u8 {
        self.color_model.bit_depth()
    }

    /// Samples per pixel; for indexed bitmaps the channel count of the palette
    pub fn channels(&self) -> u8 {
        match (&self.color_model, &self.palette) {
            (ColorModel::Direct { channels, .. }, _) => *channels,
            (ColorModel::Indexed { .. }, Some(palette)) => palette.channels(),
            (ColorModel::Indexed { .. }, None) => 1,
        }
    }

    /// Channels that carry color, excluding alpha
    pub fn color_channels(&self) -> u8 {
        self.channels() - u8::from(self.has_alpha)
    }

    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    pub fn palette(&self) -> Option<&Palette> {
        self.palette.as_ref()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Read sample `channel` of the pixel at `(x, y)` of a direct-color bitmap
    pub fn sample(&self, x: u32, y: u32, channel: u8) -> u16 {
        let depth = self.bit_depth();
        let bps = bytes_per_sample(depth);
        let idx = ((y as usize * self.width as usize + x as usize) * self.channels() as usize
            + channel as usize)
            * bps;
        read_sample(&self.pixels, idx, bps)
    }

    /// The same pixels with every sample widened to 8 bits; a no-op for 8-bit bitmaps
    pub fn to_depth8(&self) -> Result<Bitmap> {
        let ColorModel::Direct {
            channels,
            bit_depth,
        } = self.color_model
        else {
            return Err(OptimizeError::UnsupportedColorModel(
                "cannot widen samples of an indexed bitmap".into(),
            ));
        };
        if bit_depth == 8 {
            return Ok(self.clone());
        }
        let pixels = if bit_depth == 16 {
            self.pixels.chunks_exact(2).map(|s| s[0]).collect()
        } else {
            let max = max_sample(bit_depth);
            self.pixels
                .iter()
                .map(|&v| ((v as u32 * 255 + max / 2) / max) as u8)
                .collect()
        };
        Bitmap::direct(
            self.width,
            self.height,
            channels,
            8,
            self.has_alpha,
            pixels,
        )
    }
}

pub(crate) fn read_sample(buf: &[u8], idx: usize, bytes: usize) -> u16 {
    if bytes == 2 {
        u16::from_be_bytes([buf[idx], buf[idx + 1]])
    } else {
        buf[idx] as u16
    }
}

pub(crate) fn push_sample(buf: &mut Vec<u8>, value: u16, bytes: usize) {
    if bytes == 2 {
        buf.extend_from_slice(&value.to_be_bytes());
    } else {
        buf.push(value as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_checks_buffer_length() {
        assert!(Bitmap::direct(2, 2, 3, 8, false, vec![0; 12]).is_ok());
        let err = Bitmap::direct(2, 2, 3, 8, false, vec![0; 11]).unwrap_err();
        assert!(matches!(err, OptimizeError::ResourceDecodeFailed(_)));
        // 16-bit samples take two bytes
        assert!(Bitmap::direct(2, 2, 1, 16, false, vec![0; 8]).is_ok());
    }

    #[test]
    fn test_rejects_unsupported_depth() {
        let err = Bitmap::direct(1, 1, 1, 3, false, vec![0]).unwrap_err();
        assert!(matches!(err, OptimizeError::UnsupportedColorModel(_)));
    }

    #[test]
    fn test_indexed_model_tracks_palette() {
        let palette = Palette::new(3, vec![255, 0, 0, 0, 0, 255]).unwrap();
        let bitmap = Bitmap::indexed(2, 1, 1, palette, vec![0, 1]).unwrap();
        assert_eq!(
            bitmap.color_model(),
            ColorModel::Indexed {
                palette_size: 2,
                bit_depth: 1
            }
        );
        assert_eq!(bitmap.channels(), 3);
        assert_eq!(bitmap.kind(), ColorKind::Indexed);
    }

    #[test]
    fn test_palette_rejects_partial_entry() {
        assert!(Palette::new(3, vec![1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_to_depth8_widens_small_samples() {
        let bitmap = Bitmap::direct(2, 1, 1, 1, false, vec![0, 1]).unwrap();
        let wide = bitmap.to_depth8().unwrap();
        assert_eq!(wide.pixels(), &[0, 255]);
        assert_eq!(wide.bit_depth(), 8);
    }
}
