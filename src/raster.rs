//! Decoding of PDF image XObjects into bitmaps and re-encoding them.
//!
//! Supported inputs: unfiltered and FlateDecode samples (optionally with PNG
//! predictors) in gray, RGB, CMYK, ICC-based and indexed color spaces at 1, 2,
//! 4, 8 or 16 bits per component, and DCTDecode (JPEG) data. A soft mask with
//! matching dimensions is merged into the bitmap as an alpha channel.

use flate2::read::ZlibDecoder;
use image::{DynamicImage, ImageFormat};
use lopdf::{Dictionary, Object, Stream};
use std::io::{Read, Write};

use crate::bitmap::{bytes_per_sample, max_sample, Bitmap, ColorKind, ColorModel, Palette};
use crate::error::{OptimizeError, Result};
use crate::palette::deindex;

/// How the samples of an image stream are currently stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEncoding {
    Raw,
    Flate,
    Dct,
}

impl SourceEncoding {
    /// Encoding of an image stream, or `None` for filters this crate does not handle
    pub fn of(stream: &Stream) -> Option<SourceEncoding> {
        let filters = filter_names(&stream.dict);
        match filters.as_slice() {
            [] => Some(SourceEncoding::Raw),
            [f] if f == "FlateDecode" || f == "Fl" => Some(SourceEncoding::Flate),
            [f] if f == "DCTDecode" || f == "DCT" => Some(SourceEncoding::Dct),
            _ => None,
        }
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self, SourceEncoding::Dct)
    }
}

/// Target encoding for rewritten images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// DCTDecode at the given quality (1-100)
    Jpeg { quality: u8 },
    /// FlateDecode, lossless
    Flate,
}

impl Encoding {
    pub fn matches(&self, source: SourceEncoding) -> bool {
        matches!(
            (self, source),
            (Encoding::Jpeg { .. }, SourceEncoding::Dct) | (Encoding::Flate, SourceEncoding::Flate)
        )
    }
}

/// Result of decoding an image XObject
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub bitmap: Bitmap,
    pub encoding: SourceEncoding,
    /// Whether the soft mask was folded into the bitmap's alpha channel
    pub smask_merged: bool,
}

/// A re-encoded image stream plus its soft mask, if the bitmap had alpha
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub stream: Stream,
    pub smask: Option<Stream>,
}

impl EncodedImage {
    pub fn len(&self) -> usize {
        self.stream.content.len() + self.smask.as_ref().map_or(0, |s| s.content.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parsed color space of an image
#[derive(Debug, Clone, PartialEq)]
enum ColorSpace {
    Device(u8),
    Indexed { base: u8, palette: Vec<u8> },
}

/// Collect the filter names of a stream dictionary
pub fn filter_names(dict: &Dictionary) -> Vec<String> {
    match dict.get(b"Filter") {
        Ok(Object::Name(n)) => vec![String::from_utf8_lossy(n).to_string()],
        Ok(Object::Array(arr)) => arr
            .iter()
            .filter_map(|f| match f {
                Object::Name(n) => Some(String::from_utf8_lossy(n).to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn dict_integer(dict: &Dictionary, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Ok(Object::Integer(n)) => Some(*n),
        Ok(Object::Real(r)) => Some(*r as i64),
        _ => None,
    }
}

fn name_of(obj: &Object) -> Option<&[u8]> {
    match obj {
        Object::Name(n) => Some(n),
        _ => None,
    }
}

/// Decompress a stream's content, undoing Flate and PNG predictors
fn decompress_stream(stream: &Stream, components: usize, bits: usize, width: usize) -> Result<Vec<u8>> {
    match SourceEncoding::of(stream) {
        Some(SourceEncoding::Raw) => Ok(stream.content.clone()),
        Some(SourceEncoding::Flate) => {
            let mut decoder = ZlibDecoder::new(&stream.content[..]);
            let mut decoded = Vec::new();
            decoder
                .read_to_end(&mut decoded)
                .map_err(|e| OptimizeError::ResourceDecodeFailed(format!("FlateDecode: {}", e)))?;
            apply_predictor(&stream.dict, decoded, components, bits, width)
        }
        _ => Err(OptimizeError::ResourceDecodeFailed(format!(
            "unsupported filter {:?}",
            filter_names(&stream.dict)
        ))),
    }
}

fn decode_parms(dict: &Dictionary) -> Option<&Dictionary> {
    match dict.get(b"DecodeParms") {
        Ok(Object::Dictionary(d)) => Some(d),
        Ok(Object::Array(arr)) => arr.iter().find_map(|o| match o {
            Object::Dictionary(d) => Some(d),
            _ => None,
        }),
        _ => None,
    }
}

fn apply_predictor(
    dict: &Dictionary,
    data: Vec<u8>,
    components: usize,
    bits: usize,
    width: usize,
) -> Result<Vec<u8>> {
    let Some(parms) = decode_parms(dict) else {
        return Ok(data);
    };
    let predictor = dict_integer(parms, b"Predictor").unwrap_or(1);
    if predictor <= 1 {
        return Ok(data);
    }
    if predictor < 10 {
        return Err(OptimizeError::ResourceDecodeFailed(format!(
            "TIFF predictor {} not supported",
            predictor
        )));
    }
    let parm = |key: &[u8], default: usize| {
        dict_integer(parms, key).map_or(Some(default), |v| usize::try_from(v).ok())
    };
    let (colors, bpc, columns) = match (
        parm(b"Colors", components),
        parm(b"BitsPerComponent", bits),
        parm(b"Columns", width),
    ) {
        (Some(colors), Some(bpc), Some(columns)) => (colors, bpc, columns),
        _ => {
            return Err(OptimizeError::ResourceDecodeFailed(
                "negative predictor parameter".into(),
            ))
        }
    };

    let pixel_bits = colors.checked_mul(bpc);
    let row_len = pixel_bits
        .and_then(|b| b.checked_mul(columns))
        .map(|b| b.div_ceil(8));
    let image_row_len = components
        .checked_mul(bits)
        .and_then(|b| b.checked_mul(width))
        .map(|b| b.div_ceil(8));
    let row_len = match (row_len, image_row_len) {
        (Some(row), Some(image_row)) if row > 0 && (width == 0 || row == image_row) => row,
        _ => {
            return Err(OptimizeError::ResourceDecodeFailed(format!(
                "predictor rows of {} colors x {} bits x {} columns do not match the image",
                colors, bpc, columns
            )))
        }
    };
    let bpp = pixel_bits.unwrap_or(8).div_ceil(8).max(1);
    let mut out = Vec::with_capacity(data.len());
    let mut prev = vec![0u8; row_len];

    for chunk in data.chunks(row_len + 1) {
        if chunk.len() < row_len + 1 {
            break;
        }
        let (kind, raw) = (chunk[0], &chunk[1..]);
        let mut row = raw.to_vec();
        for i in 0..row_len {
            let left = if i >= bpp { row[i - bpp] } else { 0 };
            let up = prev[i];
            let up_left = if i >= bpp { prev[i - bpp] } else { 0 };
            row[i] = match kind {
                0 => row[i],
                1 => row[i].wrapping_add(left),
                2 => row[i].wrapping_add(up),
                3 => row[i].wrapping_add(((left as u16 + up as u16) / 2) as u8),
                4 => row[i].wrapping_add(paeth(left, up, up_left)),
                other => {
                    return Err(OptimizeError::ResourceDecodeFailed(format!(
                        "invalid PNG filter type {}",
                        other
                    )))
                }
            };
        }
        out.extend_from_slice(&row);
        prev = row;
    }
    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let (pa, pb, pc) = ((p - a as i16).abs(), (p - b as i16).abs(), (p - c as i16).abs());
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

fn device_components(name: &[u8]) -> Option<u8> {
    match name {
        b"DeviceGray" | b"G" | b"CalGray" => Some(1),
        b"DeviceRGB" | b"RGB" | b"CalRGB" => Some(3),
        b"DeviceCMYK" | b"CMYK" => Some(4),
        _ => None,
    }
}

/// Parse a color space whose references have already been resolved
fn parse_color_space(obj: Option<&Object>) -> Result<ColorSpace> {
    let unsupported = |what: &str| OptimizeError::UnsupportedColorModel(what.to_string());
    let Some(obj) = obj else {
        return Ok(ColorSpace::Device(3));
    };
    match obj {
        Object::Name(name) => device_components(name)
            .map(ColorSpace::Device)
            .ok_or_else(|| unsupported(&String::from_utf8_lossy(name))),
        Object::Array(arr) => {
            let family = arr.first().and_then(name_of).unwrap_or(b"");
            match family {
                b"ICCBased" => {
                    let n = match arr.get(1) {
                        Some(Object::Stream(s)) => dict_integer(&s.dict, b"N"),
                        Some(Object::Dictionary(d)) => dict_integer(d, b"N"),
                        _ => None,
                    };
                    match n {
                        Some(n @ (1 | 3 | 4)) => Ok(ColorSpace::Device(n as u8)),
                        _ => Err(unsupported("ICCBased without a usable /N")),
                    }
                }
                b"CalRGB" | b"CalGray" => Ok(ColorSpace::Device(
                    device_components(family).unwrap_or(3),
                )),
                b"Indexed" | b"I" => {
                    let base = match parse_color_space(arr.get(1))? {
                        ColorSpace::Device(n) => n,
                        ColorSpace::Indexed { .. } => {
                            return Err(unsupported("Indexed base cannot be Indexed"))
                        }
                    };
                    let hival = match arr.get(2) {
                        Some(Object::Integer(h)) if (0..=255).contains(h) => *h as usize,
                        _ => {
                            return Err(OptimizeError::CorruptPalette(
                                "missing or invalid hival".into(),
                            ))
                        }
                    };
                    let lookup = match arr.get(3) {
                        Some(Object::String(bytes, _)) => bytes.clone(),
                        Some(Object::Stream(stream)) => decompress_stream(stream, 1, 8, 0)?,
                        _ => {
                            return Err(OptimizeError::CorruptPalette(
                                "missing lookup table".into(),
                            ))
                        }
                    };
                    let needed = (hival + 1) * base as usize;
                    if lookup.len() < needed {
                        return Err(OptimizeError::CorruptPalette(format!(
                            "lookup has {} bytes, expected {}",
                            lookup.len(),
                            needed
                        )));
                    }
                    Ok(ColorSpace::Indexed {
                        base,
                        palette: lookup[..needed].to_vec(),
                    })
                }
                other => Err(unsupported(&String::from_utf8_lossy(other))),
            }
        }
        _ => Err(unsupported("malformed color space")),
    }
}

/// Unpack byte-aligned rows of `bits`-sized samples into one byte per sample.
/// 8- and 16-bit data is returned as-is.
fn unpack_samples(data: &[u8], width: usize, height: usize, comps: usize, bits: usize) -> Result<Vec<u8>> {
    let too_large = || {
        OptimizeError::ResourceDecodeFailed(format!(
            "{}x{} image with {} components is too large",
            width, height, comps
        ))
    };
    let row_samples = width.checked_mul(comps).ok_or_else(too_large)?;
    if bits >= 8 {
        let needed = row_samples
            .checked_mul(height)
            .and_then(|n| n.checked_mul(bits / 8))
            .ok_or_else(too_large)?;
        if data.len() < needed {
            return Err(OptimizeError::ResourceDecodeFailed(format!(
                "image data has {} bytes, expected {}",
                data.len(),
                needed
            )));
        }
        return Ok(data[..needed].to_vec());
    }
    let row_bytes = row_samples
        .checked_mul(bits)
        .map(|b| b.div_ceil(8))
        .filter(|&b| b > 0)
        .ok_or_else(too_large)?;
    let needed = row_bytes.checked_mul(height).ok_or_else(too_large)?;
    if data.len() < needed {
        return Err(OptimizeError::ResourceDecodeFailed(format!(
            "image data has {} bytes, expected {}",
            data.len(),
            needed
        )));
    }
    let mask = max_sample(bits as u8) as u8;
    let mut out = Vec::with_capacity(row_samples * height);
    for row in data.chunks(row_bytes).take(height) {
        for s in 0..row_samples {
            let bit = s * bits;
            let shift = 8 - bits - (bit % 8);
            out.push((row[bit / 8] >> shift) & mask);
        }
    }
    Ok(out)
}

/// Pack one-byte samples into byte-aligned rows of `bits`-sized samples
fn pack_samples(samples: &[u8], width: usize, comps: usize, bits: usize) -> Vec<u8> {
    if bits >= 8 {
        return samples.to_vec();
    }
    let row_samples = width * comps;
    let row_bytes = (row_samples * bits).div_ceil(8);
    let mut out = Vec::with_capacity(row_bytes * samples.len() / row_samples.max(1));
    for row in samples.chunks(row_samples) {
        let mut packed = vec![0u8; row_bytes];
        for (s, &v) in row.iter().enumerate() {
            let bit = s * bits;
            packed[bit / 8] |= v << (8 - bits - (bit % 8));
        }
        out.extend_from_slice(&packed);
    }
    out
}

fn check_default_decode(dict: &Dictionary, indexed: bool, bits: u8, comps: u8) -> Result<()> {
    let Ok(Object::Array(decode)) = dict.get(b"Decode") else {
        return Ok(());
    };
    let high = if indexed { max_sample(bits) as f32 } else { 1.0 };
    let is_default = decode.len() == comps as usize * 2
        && decode.chunks(2).all(|pair| {
            let value = |o: &Object| match o {
                Object::Integer(i) => Some(*i as f32),
                Object::Real(r) => Some(*r),
                _ => None,
            };
            value(&pair[0]) == Some(0.0) && value(&pair[1]) == Some(high)
        });
    if is_default {
        Ok(())
    } else {
        Err(OptimizeError::ResourceDecodeFailed(
            "non-default /Decode array".into(),
        ))
    }
}

/// Positive `/Width` or `/Height` that fits in a `u32`
fn dimension(dict: &Dictionary, key: &[u8]) -> Result<u32> {
    let value = dict_integer(dict, key).unwrap_or(0);
    u32::try_from(value)
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| {
            OptimizeError::ResourceDecodeFailed(format!(
                "invalid /{} {}",
                String::from_utf8_lossy(key),
                value
            ))
        })
}

fn bits_per_component(dict: &Dictionary) -> Result<u8> {
    match dict_integer(dict, b"BitsPerComponent").unwrap_or(8) {
        bits @ (1 | 2 | 4 | 8 | 16) => Ok(bits as u8),
        other => Err(OptimizeError::ResourceDecodeFailed(format!(
            "unsupported /BitsPerComponent {}",
            other
        ))),
    }
}

fn from_dynamic(img: DynamicImage) -> Result<Bitmap> {
    let (width, height) = (img.width(), img.height());
    match img {
        DynamicImage::ImageLuma8(gray) => Bitmap::direct(width, height, 1, 8, false, gray.into_raw()),
        other => Bitmap::direct(width, height, 3, 8, false, other.to_rgb8().into_raw()),
    }
}

/// Decode an image XObject. `color_space` must have its references resolved.
pub fn decode_image(
    stream: &Stream,
    color_space: Option<&Object>,
    smask: Option<&Stream>,
) -> Result<DecodedImage> {
    let dict = &stream.dict;
    if matches!(dict.get(b"ImageMask"), Ok(Object::Boolean(true))) {
        return Err(OptimizeError::ResourceDecodeFailed(
            "stencil image masks are not decoded".into(),
        ));
    }
    let encoding = SourceEncoding::of(stream).ok_or_else(|| {
        OptimizeError::ResourceDecodeFailed(format!(
            "unsupported filter {:?}",
            filter_names(dict)
        ))
    })?;
    let width = dimension(dict, b"Width")?;
    let height = dimension(dict, b"Height")?;

    let bitmap = if encoding == SourceEncoding::Dct {
        let img = image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
            .map_err(|e| OptimizeError::ResourceDecodeFailed(format!("JPEG: {}", e)))?;
        let bitmap = from_dynamic(img)?;
        // CMYK JPEGs decode to RGB, so count components from the declared space
        let comps = match parse_color_space(color_space) {
            Ok(ColorSpace::Device(n)) => n,
            _ => bitmap.channels(),
        };
        check_default_decode(dict, false, 8, comps)?;
        bitmap
    } else {
        let bits = bits_per_component(dict)?;
        let space = parse_color_space(color_space)?;
        match space {
            ColorSpace::Device(comps) => {
                check_default_decode(dict, false, bits, comps)?;
                let raw = decompress_stream(stream, comps as usize, bits as usize, width as usize)?;
                let samples =
                    unpack_samples(&raw, width as usize, height as usize, comps as usize, bits as usize)?;
                Bitmap::direct(width, height, comps, bits, false, samples)?
            }
            ColorSpace::Indexed { base, palette } => {
                check_default_decode(dict, true, bits, 1)?;
                let raw = decompress_stream(stream, 1, bits as usize, width as usize)?;
                let indices = unpack_samples(&raw, width as usize, height as usize, 1, bits as usize)?;
                Bitmap::indexed(width, height, bits, Palette::new(base, palette)?, indices)?
            }
        }
    };

    match smask.map(|mask| merge_smask(&bitmap, mask)) {
        Some(Ok(merged)) => Ok(DecodedImage {
            bitmap: merged,
            encoding,
            smask_merged: true,
        }),
        _ => Ok(DecodedImage {
            bitmap,
            encoding,
            smask_merged: false,
        }),
    }
}

/// Fold a soft mask into a direct-color bitmap as its last channel
fn merge_smask(bitmap: &Bitmap, smask: &Stream) -> Result<Bitmap> {
    if bitmap.kind() != ColorKind::Direct || bitmap.has_alpha() {
        return Err(OptimizeError::UnsupportedColorModel(
            "soft mask only merged into opaque direct-color images".into(),
        ));
    }
    let gray = Object::Name(b"DeviceGray".to_vec());
    let alpha = decode_image(smask, Some(&gray), None)?.bitmap.to_depth8()?;
    if (alpha.width(), alpha.height()) != (bitmap.width(), bitmap.height()) {
        return Err(OptimizeError::UnsupportedColorModel(
            "soft mask dimensions differ from image".into(),
        ));
    }
    let color = bitmap.to_depth8()?;
    let channels = color.channels() as usize;
    let mut pixels = Vec::with_capacity(color.pixel_count() * (channels + 1));
    for (px, a) in color.pixels().chunks_exact(channels).zip(alpha.pixels()) {
        pixels.extend_from_slice(px);
        pixels.push(*a);
    }
    Bitmap::direct(
        color.width(),
        color.height(),
        channels as u8 + 1,
        8,
        true,
        pixels,
    )
}

fn device_name(components: u8) -> Result<Object> {
    let name: &[u8] = match components {
        1 => b"DeviceGray",
        3 => b"DeviceRGB",
        4 => b"DeviceCMYK",
        other => {
            return Err(OptimizeError::ResourceEncodeFailed(format!(
                "no device color space with {} components",
                other
            )))
        }
    };
    Ok(Object::Name(name.to_vec()))
}

fn image_dict(width: u32, height: u32, color_space: Object, bits: u8, filter: &[u8], len: usize) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"XObject".to_vec()));
    dict.set("Subtype", Object::Name(b"Image".to_vec()));
    dict.set("Width", Object::Integer(width as i64));
    dict.set("Height", Object::Integer(height as i64));
    dict.set("ColorSpace", color_space);
    dict.set("BitsPerComponent", Object::Integer(bits as i64));
    dict.set("Filter", Object::Name(filter.to_vec()));
    dict.set("Length", Object::Integer(len as i64));
    dict
}

fn flate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| OptimizeError::ResourceEncodeFailed(format!("compress: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| OptimizeError::ResourceEncodeFailed(format!("finish compression: {}", e)))
}

/// Compress arbitrary stream data with Flate at the given level
pub fn flate_with_level(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| OptimizeError::ResourceEncodeFailed(format!("compress: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| OptimizeError::ResourceEncodeFailed(format!("finish compression: {}", e)))
}

fn jpeg(samples: &[u8], width: u32, height: u32, color: jpeg_encoder::ColorType, quality: u8) -> Result<Vec<u8>> {
    if width > u16::MAX as u32 || height > u16::MAX as u32 {
        return Err(OptimizeError::ResourceEncodeFailed(format!(
            "{}x{} too large for JPEG",
            width, height
        )));
    }
    let mut jpeg_bytes = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut jpeg_bytes, quality.clamp(1, 100));
    if matches!(color, jpeg_encoder::ColorType::Rgb) {
        encoder.set_sampling_factor(jpeg_encoder::SamplingFactor::R_4_2_0);
    }
    encoder
        .encode(samples, width as u16, height as u16, color)
        .map_err(|e| OptimizeError::ResourceEncodeFailed(format!("JPEG: {}", e)))?;
    Ok(jpeg_bytes)
}

/// Separate the trailing alpha channel of a direct bitmap from its color samples
fn split_alpha(bitmap: &Bitmap) -> (Vec<u8>, Option<Vec<u8>>) {
    if !bitmap.has_alpha() {
        return (bitmap.pixels().to_vec(), None);
    }
    let bps = bytes_per_sample(bitmap.bit_depth());
    let pixel = bitmap.channels() as usize * bps;
    let color_len = pixel - bps;
    let mut color = Vec::with_capacity(bitmap.pixel_count() * color_len);
    let mut alpha = Vec::with_capacity(bitmap.pixel_count() * bps);
    for px in bitmap.pixels().chunks_exact(pixel) {
        color.extend_from_slice(&px[..color_len]);
        alpha.extend_from_slice(&px[color_len..]);
    }
    (color, Some(alpha))
}

fn cmyk_to_rgb(samples: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(samples.len() / 4 * 3);
    for chunk in samples.chunks_exact(4) {
        let c = chunk[0] as f32 / 255.0;
        let m = chunk[1] as f32 / 255.0;
        let y = chunk[2] as f32 / 255.0;
        let k = chunk[3] as f32 / 255.0;
        rgb.push(((1.0 - c) * (1.0 - k) * 255.0) as u8);
        rgb.push(((1.0 - m) * (1.0 - k) * 255.0) as u8);
        rgb.push(((1.0 - y) * (1.0 - k) * 255.0) as u8);
    }
    rgb
}

/// Encode a bitmap as an image XObject stream (plus soft mask for alpha)
pub fn encode_image(bitmap: &Bitmap, encoding: Encoding) -> Result<EncodedImage> {
    match encoding {
        Encoding::Jpeg { quality } => encode_jpeg(bitmap, quality),
        Encoding::Flate => encode_flate(bitmap),
    }
}

fn encode_jpeg(bitmap: &Bitmap, quality: u8) -> Result<EncodedImage> {
    let direct = match bitmap.kind() {
        ColorKind::Indexed => deindex(bitmap)?,
        ColorKind::Direct => bitmap.to_depth8()?,
    };
    let (width, height) = (direct.width(), direct.height());
    let (color, alpha) = split_alpha(&direct);

    let (samples, color_type, space) = match direct.color_channels() {
        1 => (color, jpeg_encoder::ColorType::Luma, device_name(1)?),
        3 => (color, jpeg_encoder::ColorType::Rgb, device_name(3)?),
        4 => (cmyk_to_rgb(&color), jpeg_encoder::ColorType::Rgb, device_name(3)?),
        other => {
            return Err(OptimizeError::ResourceEncodeFailed(format!(
                "cannot JPEG-encode {} color channels",
                other
            )))
        }
    };
    let bytes = jpeg(&samples, width, height, color_type, quality)?;
    let dict = image_dict(width, height, space, 8, b"DCTDecode", bytes.len());

    let smask = match alpha {
        Some(alpha) => {
            let bytes = jpeg(&alpha, width, height, jpeg_encoder::ColorType::Luma, quality)?;
            let dict = image_dict(width, height, device_name(1)?, 8, b"DCTDecode", bytes.len());
            Some(Stream::new(dict, bytes))
        }
        None => None,
    };

    Ok(EncodedImage {
        stream: Stream::new(dict, bytes),
        smask,
    })
}

fn encode_flate(bitmap: &Bitmap) -> Result<EncodedImage> {
    let (width, height) = (bitmap.width(), bitmap.height());
    let bits = bitmap.bit_depth();

    let (samples, space, comps, alpha, alpha_bits) = match bitmap.color_model() {
        ColorModel::Direct { .. } => {
            let (color, alpha) = split_alpha(bitmap);
            let comps = bitmap.color_channels();
            (color, device_name(comps)?, comps, alpha, bits)
        }
        ColorModel::Indexed { .. } => {
            let palette = bitmap.palette().ok_or_else(|| {
                OptimizeError::ResourceEncodeFailed("indexed bitmap has no palette".into())
            })?;
            let base = bitmap.color_channels();
            let mut lookup = Vec::with_capacity(palette.len() * base as usize);
            for entry in palette.iter() {
                lookup.extend_from_slice(&entry[..base as usize]);
            }
            let alpha = if bitmap.has_alpha() {
                let alpha_of = |i: &u8| {
                    palette
                        .entry(*i as usize)
                        .map(|e| e[base as usize])
                        .ok_or_else(|| OptimizeError::CorruptPalette(format!("index {}", i)))
                };
                Some(bitmap.pixels().iter().map(alpha_of).collect::<Result<Vec<u8>>>()?)
            } else {
                None
            };
            let space = Object::Array(vec![
                Object::Name(b"Indexed".to_vec()),
                device_name(base)?,
                Object::Integer(palette.len() as i64 - 1),
                Object::String(lookup, lopdf::StringFormat::Hexadecimal),
            ]);
            (bitmap.pixels().to_vec(), space, 1, alpha, 8)
        }
    };

    let packed = pack_samples(&samples, width as usize, comps as usize, bits as usize);
    let bytes = flate(&packed)?;
    let dict = image_dict(width, height, space, bits, b"FlateDecode", bytes.len());

    let smask = match alpha {
        Some(alpha) => {
            let packed = pack_samples(&alpha, width as usize, 1, alpha_bits as usize);
            let bytes = flate(&packed)?;
            let dict = image_dict(width, height, device_name(1)?, alpha_bits, b"FlateDecode", bytes.len());
            Some(Stream::new(dict, bytes))
        }
        None => None,
    };

    Ok(EncodedImage {
        stream: Stream::new(dict, bytes),
        smask,
    })
}
