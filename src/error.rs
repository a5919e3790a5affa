//! Error type shared by the optimizer, flattener and merger.

use thiserror::Error;

/// Error type for PDF optimization, flattening and merging
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizeError {
    #[error("Unsupported color model: {0}")]
    UnsupportedColorModel(String),

    #[error("Corrupt palette: {0}")]
    CorruptPalette(String),

    #[error("Palette overflow: {distinct} distinct colors exceed palette size {max}")]
    PaletteOverflow { distinct: usize, max: usize },

    #[error("Incompatible processor chain: {0}")]
    IncompatibleChain(String),

    #[error("Unknown optimizer profile: {0}")]
    UnknownProfile(String),

    #[error("Page range {start}-{end} out of bounds for document with {page_count} pages")]
    PageRangeOutOfBounds {
        start: usize,
        end: usize,
        page_count: usize,
    },

    #[error("Empty page range: start {start} > end {end}")]
    EmptyRange { start: usize, end: usize },

    #[error("Failed to decode resource: {0}")]
    ResourceDecodeFailed(String),

    #[error("Failed to encode resource: {0}")]
    ResourceEncodeFailed(String),

    #[error("Malformed document structure: {0}")]
    Structure(String),

    #[error("Failed to load PDF: {0}")]
    Load(String),

    #[error("Failed to save PDF: {0}")]
    Save(String),
}

impl OptimizeError {
    /// Whether this error only concerns a single resource and can be recovered
    /// by leaving that resource unchanged.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OptimizeError::ResourceDecodeFailed(_)
                | OptimizeError::ResourceEncodeFailed(_)
                | OptimizeError::CorruptPalette(_)
                | OptimizeError::UnsupportedColorModel(_)
                | OptimizeError::PaletteOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OptimizeError>;
