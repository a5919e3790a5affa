//! Conversion between indexed and direct-color bitmaps.

use std::collections::HashMap;

use crate::bitmap::{Bitmap, ColorModel, Palette};
use crate::error::{OptimizeError, Result};

/// Largest palette an indexed bitmap can reference (one byte per index)
pub const MAX_PALETTE_SIZE: usize = 256;

/// Expand an indexed bitmap into 8-bit direct color using its palette
pub fn deindex(bitmap: &Bitmap) -> Result<Bitmap> {
    let ColorModel::Indexed { .. } = bitmap.color_model() else {
        return Err(OptimizeError::UnsupportedColorModel(
            "deindex requires an indexed bitmap".into(),
        ));
    };
    let palette = bitmap
        .palette()
        .ok_or_else(|| OptimizeError::CorruptPalette("indexed bitmap has no palette".into()))?;

    let mut pixels = Vec::with_capacity(bitmap.pixel_count() * palette.channels() as usize);
    for &index in bitmap.pixels() {
        let entry = palette.entry(index as usize).ok_or_else(|| {
            OptimizeError::CorruptPalette(format!(
                "index {} outside palette of {} entries",
                index,
                palette.len()
            ))
        })?;
        pixels.extend_from_slice(entry);
    }

    Bitmap::direct(
        bitmap.width(),
        bitmap.height(),
        palette.channels(),
        8,
        bitmap.has_alpha(),
        pixels,
    )
}

/// Build a palette from the exact colors of a direct-color bitmap.
///
/// Palette entries appear in first-use order. Fails with `PaletteOverflow`
/// when the bitmap has more distinct colors than `max_palette_size`.
pub fn index(bitmap: &Bitmap, max_palette_size: usize) -> Result<Bitmap> {
    let ColorModel::Direct { bit_depth, .. } = bitmap.color_model() else {
        return Err(OptimizeError::UnsupportedColorModel(
            "index requires a direct-color bitmap".into(),
        ));
    };
    if bit_depth > 8 {
        return Err(OptimizeError::UnsupportedColorModel(
            "16-bit samples cannot be indexed without loss".into(),
        ));
    }
    let source = bitmap.to_depth8()?;
    let max = max_palette_size.min(MAX_PALETTE_SIZE);
    let channels = source.channels() as usize;

    let mut lookup: HashMap<&[u8], u8> = HashMap::new();
    let mut entries: Vec<u8> = Vec::new();
    let mut indices = Vec::with_capacity(source.pixel_count());

    for color in source.pixels().chunks_exact(channels) {
        let next = lookup.len();
        let index = match lookup.get(color) {
            Some(&index) => index,
            None => {
                if next >= max {
                    return Err(OptimizeError::PaletteOverflow {
                        distinct: count_distinct(source.pixels(), channels),
                        max,
                    });
                }
                lookup.insert(color, next as u8);
                entries.extend_from_slice(color);
                next as u8
            }
        };
        indices.push(index);
    }

    let palette = Palette::new(channels as u8, entries)?;
    let depth = index_depth(palette.len());
    if source.has_alpha() {
        Bitmap::indexed_with_alpha(source.width(), source.height(), depth, palette, indices)
    } else {
        Bitmap::indexed(source.width(), source.height(), depth, palette, indices)
    }
}

/// Lossy indexing: reduce per-channel precision until the colors fit
/// `max_colors`, then index the result.
pub fn quantize(bitmap: &Bitmap, max_colors: usize) -> Result<Bitmap> {
    if bitmap.kind() != crate::bitmap::ColorKind::Direct {
        return Err(OptimizeError::UnsupportedColorModel(
            "quantize requires a direct-color bitmap".into(),
        ));
    }
    let max = max_colors.clamp(1, MAX_PALETTE_SIZE);
    let source = bitmap.to_depth8()?;
    let channels = source.channels() as usize;

    for shift in 0..=8u32 {
        let reduced = if shift == 0 {
            source.pixels().to_vec()
        } else {
            let keep = (0xFFu32 << shift) & 0xFF;
            let mid = (1u32 << shift) >> 1;
            source
                .pixels()
                .iter()
                .map(|&v| ((v as u32 & keep) | mid) as u8)
                .collect()
        };
        if count_distinct(&reduced, channels) <= max {
            let reduced = Bitmap::direct(
                source.width(),
                source.height(),
                source.channels(),
                8,
                source.has_alpha(),
                reduced,
            )?;
            return index(&reduced, max);
        }
    }

    Err(OptimizeError::PaletteOverflow {
        distinct: count_distinct(source.pixels(), channels),
        max,
    })
}

fn count_distinct(pixels: &[u8], channels: usize) -> usize {
    let mut seen: HashMap<&[u8], ()> = HashMap::new();
    for color in pixels.chunks_exact(channels) {
        seen.insert(color, ());
    }
    seen.len()
}

/// Smallest PDF-compatible index depth able to address `palette_len` entries
fn index_depth(palette_len: usize) -> u8 {
    match palette_len {
        0..=2 => 1,
        3..=4 => 2,
        5..=16 => 4,
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn two_color_indexed() -> Bitmap {
        let palette = Palette::new(3, vec![10, 20, 30, 200, 100, 50]).unwrap();
        Bitmap::indexed(3, 2, 1, palette, vec![0, 1, 1, 0, 0, 1]).unwrap()
    }

    #[test]
    fn test_deindex_looks_up_palette() {
        let direct = deindex(&two_color_indexed()).unwrap();
        assert_eq!(
            direct.color_model(),
            ColorModel::Direct {
                channels: 3,
                bit_depth: 8
            }
        );
        assert_eq!(&direct.pixels()[..6], &[10, 20, 30, 200, 100, 50]);
    }

    #[test]
    fn test_deindex_rejects_direct_bitmap() {
        let direct = Bitmap::direct(1, 1, 3, 8, false, vec![1, 2, 3]).unwrap();
        assert!(matches!(
            deindex(&direct),
            Err(OptimizeError::UnsupportedColorModel(_))
        ));
    }

    #[test]
    fn test_deindex_out_of_range_index_is_corrupt() {
        let palette = Palette::new(1, vec![0, 255]).unwrap();
        let bitmap = Bitmap::indexed(2, 1, 2, palette, vec![1, 3]).unwrap();
        assert!(matches!(
            deindex(&bitmap),
            Err(OptimizeError::CorruptPalette(_))
        ));
    }

    #[test]
    fn test_index_overflow() {
        let direct = Bitmap::direct(3, 1, 1, 8, false, vec![1, 2, 3]).unwrap();
        assert_eq!(
            index(&direct, 2).unwrap_err(),
            OptimizeError::PaletteOverflow {
                distinct: 3,
                max: 2
            }
        );
    }

    #[test]
    fn test_index_keeps_alpha_in_palette() {
        let direct = Bitmap::direct(2, 1, 2, 8, true, vec![50, 255, 50, 0]).unwrap();
        let indexed = index(&direct, 16).unwrap();
        assert!(indexed.has_alpha());
        assert_eq!(indexed.palette().unwrap().len(), 2);
        assert_eq!(deindex(&indexed).unwrap(), direct);
    }

    #[test]
    fn test_quantize_fits_many_colors() {
        let pixels: Vec<u8> = (0..=255u8).flat_map(|v| [v, 255 - v, v / 2]).collect();
        let direct = Bitmap::direct(16, 16, 3, 8, false, pixels).unwrap();
        assert!(index(&direct, 16).is_err());
        let quantized = quantize(&direct, 16).unwrap();
        assert!(quantized.palette().unwrap().len() <= 16);
    }

    proptest! {
        #[test]
        fn prop_index_deindex_round_trip(
            palette_bytes in proptest::collection::vec(any::<u8>(), 3..=48),
            raw_indices in proptest::collection::vec(any::<u8>(), 12),
        ) {
            let usable = palette_bytes.len() / 3 * 3;
            let palette = Palette::new(3, palette_bytes[..usable].to_vec()).unwrap();
            let size = palette.len();
            let indices: Vec<u8> = raw_indices.iter().map(|i| (*i as usize % size) as u8).collect();
            let original = Bitmap::indexed(4, 3, 8, palette, indices).unwrap();

            let direct = deindex(&original).unwrap();
            let reindexed = index(&direct, size).unwrap();
            prop_assert!(reindexed.palette().unwrap().len() <= size);
            prop_assert_eq!(deindex(&reindexed).unwrap(), direct);
        }
    }
}
