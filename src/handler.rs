//! Optimization handlers: decide per resource whether and how to rewrite it.
//!
//! Handlers are pure with respect to the document: they receive a snapshot of
//! one resource and return a replacement, which the optimizer commits.

use lopdf::{Dictionary, Object, ObjectId, Stream};
use tracing::debug;

use crate::error::{OptimizeError, Result};
use crate::processor::ProcessorChain;
use crate::raster::{self, Encoding, SourceEncoding};

/// What kind of page resource a stream is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Image XObject
    Image,
    /// Form XObject (including annotation appearance streams)
    Form,
    /// Embedded font program
    FontFile,
}

/// Snapshot of one resource taken from the document
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: ObjectId,
    pub kind: ResourceKind,
    pub stream: Stream,
    /// Soft mask of an image, if it has one
    pub smask: Option<Stream>,
    /// Image color space with references resolved
    pub color_space: Option<Object>,
}

impl Resource {
    /// Stored size of the resource, counting its soft mask
    pub fn stored_len(&self) -> usize {
        self.stream.content.len() + self.smask.as_ref().map_or(0, |s| s.content.len())
    }
}

/// New content for a resource. A soft mask, if present, is added as a new object.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub stream: Stream,
    pub smask: Option<Stream>,
}

/// Why a handler left a resource untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    KindNotHandled,
    BelowMinimumSize,
    NoRuleForSource,
    AlreadyCompatible,
    ColorModelNotAccepted,
    ColorKeyMasked,
    NotSmaller,
    NothingToChange,
}

#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Replace(Replacement),
    Skip(SkipReason),
}

/// Whether a replacement must shrink the resource to be kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacePolicy {
    Always,
    #[default]
    OnlyIfSmaller,
}

/// Predicate selecting which images a handler touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    /// Only resources stored in at least this many bytes
    pub min_size_bytes: usize,
}

/// Processing applied to one family of source images
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRule {
    pub chain: ProcessorChain,
    pub encoding: Encoding,
}

/// Decodes images, runs them through a processor chain and re-encodes them.
///
/// Lossless sources (Flate or unfiltered) and lossy sources (DCT) each have
/// their own optional rule.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageQualityOptimizer {
    pub lossless: Option<ImageRule>,
    pub lossy: Option<ImageRule>,
    pub selection: Selection,
    pub policy: ReplacePolicy,
}

/// Keys of an image dictionary that survive re-encoding
const CARRIED_IMAGE_KEYS: &[&[u8]] = &[
    b"Intent",
    b"Interpolate",
    b"Metadata",
    b"OC",
    b"StructParent",
    b"ID",
    b"Name",
];

impl ImageQualityOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lossless(mut self, chain: ProcessorChain, encoding: Encoding) -> Self {
        self.lossless = Some(ImageRule { chain, encoding });
        self
    }

    pub fn with_lossy(mut self, chain: ProcessorChain, encoding: Encoding) -> Self {
        self.lossy = Some(ImageRule { chain, encoding });
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_policy(mut self, policy: ReplacePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn optimize(&self, resource: &Resource) -> Result<HandlerOutcome> {
        if resource.kind != ResourceKind::Image {
            return Ok(HandlerOutcome::Skip(SkipReason::KindNotHandled));
        }
        let original_len = resource.stored_len();
        if original_len < self.selection.min_size_bytes {
            return Ok(HandlerOutcome::Skip(SkipReason::BelowMinimumSize));
        }
        if matches!(resource.stream.dict.get(b"Mask"), Ok(Object::Array(_))) {
            return Ok(HandlerOutcome::Skip(SkipReason::ColorKeyMasked));
        }

        let source = SourceEncoding::of(&resource.stream).ok_or_else(|| {
            OptimizeError::ResourceDecodeFailed(format!(
                "unsupported filter {:?}",
                raster::filter_names(&resource.stream.dict)
            ))
        })?;
        let rule = if source.is_lossy() {
            self.lossy.as_ref()
        } else {
            self.lossless.as_ref()
        };
        let Some(rule) = rule else {
            return Ok(HandlerOutcome::Skip(SkipReason::NoRuleForSource));
        };
        if rule.chain.is_identity() && rule.encoding.matches(source) {
            return Ok(HandlerOutcome::Skip(SkipReason::AlreadyCompatible));
        }

        let decoded = raster::decode_image(
            &resource.stream,
            resource.color_space.as_ref(),
            resource.smask.as_ref(),
        )?;
        if !rule.chain.accepts(decoded.bitmap.kind()) {
            return Ok(HandlerOutcome::Skip(SkipReason::ColorModelNotAccepted));
        }

        let processed = match rule.chain.apply(&decoded.bitmap) {
            Err(OptimizeError::PaletteOverflow { distinct, max }) => {
                let Some(fallback) = rule.chain.direct_fallback() else {
                    return Err(OptimizeError::PaletteOverflow { distinct, max });
                };
                debug!(
                    id = ?resource.id,
                    distinct,
                    max,
                    "Palette overflow, keeping direct color"
                );
                fallback.apply(&decoded.bitmap)?
            }
            other => other?,
        };

        let encoded = raster::encode_image(&processed, rule.encoding)?;
        let compared_len = if decoded.smask_merged {
            original_len
        } else {
            resource.stream.content.len()
        };
        if self.policy == ReplacePolicy::OnlyIfSmaller && encoded.len() >= compared_len {
            return Ok(HandlerOutcome::Skip(SkipReason::NotSmaller));
        }

        let mut stream = encoded.stream;
        carry_keys(&resource.stream.dict, &mut stream.dict, CARRIED_IMAGE_KEYS);
        if let Ok(mask @ Object::Reference(_)) = resource.stream.dict.get(b"Mask") {
            stream.dict.set("Mask", mask.clone());
        }
        if !decoded.smask_merged {
            carry_keys(&resource.stream.dict, &mut stream.dict, &[b"SMask".as_slice()]);
        }

        Ok(HandlerOutcome::Replace(Replacement {
            stream,
            smask: encoded.smask,
        }))
    }
}

fn carry_keys(from: &Dictionary, to: &mut Dictionary, keys: &[&[u8]]) {
    for key in keys {
        if let Ok(value) = from.get(key) {
            to.set(key.to_vec(), value.clone());
        }
    }
}

/// Flate-compresses streams stored without any filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOptimizer {
    /// zlib level, 0-9
    pub level: u32,
}

impl Default for CompressionOptimizer {
    fn default() -> Self {
        Self { level: 9 }
    }
}

impl CompressionOptimizer {
    fn optimize(&self, resource: &Resource) -> Result<HandlerOutcome> {
        if resource.stream.dict.has(b"Filter") {
            return Ok(HandlerOutcome::Skip(SkipReason::AlreadyCompatible));
        }
        let compressed = raster::flate_with_level(&resource.stream.content, self.level)?;
        if compressed.len() >= resource.stream.content.len() {
            return Ok(HandlerOutcome::Skip(SkipReason::NotSmaller));
        }
        let mut dict = resource.stream.dict.clone();
        dict.remove(b"DecodeParms");
        dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
        dict.set("Length", Object::Integer(compressed.len() as i64));
        Ok(HandlerOutcome::Replace(Replacement {
            stream: Stream::new(dict, compressed),
            smask: None,
        }))
    }
}

/// Dictionary entries removed by [`OptimizationHandler::MetadataRemoval`]
const METADATA_KEYS: &[&[u8]] = &[b"Metadata", b"PieceInfo"];

/// One optimization step applied to every targeted resource
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationHandler {
    ImageQuality(ImageQualityOptimizer),
    StreamCompression(CompressionOptimizer),
    /// Strips XMP metadata and private application data from resources
    MetadataRemoval,
}

impl OptimizationHandler {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizationHandler::ImageQuality(_) => "image-quality",
            OptimizationHandler::StreamCompression(_) => "stream-compression",
            OptimizationHandler::MetadataRemoval => "metadata-removal",
        }
    }

    /// Evaluate the handler on one resource. Never touches the document.
    pub fn optimize(&self, resource: &Resource) -> Result<HandlerOutcome> {
        match self {
            OptimizationHandler::ImageQuality(handler) => handler.optimize(resource),
            OptimizationHandler::StreamCompression(handler) => handler.optimize(resource),
            OptimizationHandler::MetadataRemoval => {
                let dict = &resource.stream.dict;
                if !METADATA_KEYS.iter().any(|key| dict.has(key)) {
                    return Ok(HandlerOutcome::Skip(SkipReason::NothingToChange));
                }
                let mut stream = resource.stream.clone();
                for key in METADATA_KEYS {
                    stream.dict.remove(key);
                }
                Ok(HandlerOutcome::Replace(Replacement {
                    stream,
                    smask: None,
                }))
            }
        }
    }
}
