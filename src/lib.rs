//! PDF Optimization Library
//!
//! Shrinks PDFs by re-encoding the images and streams their pages use, and
//! combines form-flattened page ranges from several PDFs into one. Shared
//! between CLI and WASM targets.
//!
//! The core works on an in-memory [`lopdf::Document`]; the `*_bytes` helpers
//! and [`file_ops`] wrap loading and saving around it.

pub mod bitmap;
pub mod error;
pub mod flatten;
pub mod handler;
pub mod merge;
pub mod optimizer;
pub mod palette;
pub mod processor;
pub mod profile;
pub mod raster;
pub mod scaling;

#[cfg(test)]
mod test_support;

#[cfg(target_arch = "wasm32")]
pub mod wasm;

use lopdf::Document;
use tracing::info;

pub use bitmap::{Bitmap, ColorKind, ColorModel, Palette};
pub use error::{OptimizeError, Result};
pub use flatten::{flatten, FlattenReport};
pub use handler::{
    CompressionOptimizer, ImageQualityOptimizer, OptimizationHandler, ReplacePolicy, ResourceKind,
    Selection, SkipReason,
};
pub use merge::{merge, MergeReport, MergeUnit};
pub use optimizer::{
    CancellationToken, OptimizationReport, OptimizeOptions, Optimizer, OutcomeStatus,
};
pub use processor::{Processor, ProcessorChain};
pub use profile::{Profile, ProfileRegistry};
pub use raster::Encoding;
pub use scaling::{AverageAlgorithm, ScalingProcessor};

/// Options applied when writing a document back out
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Flate-compress every stream still stored without a filter
    pub compress_streams: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            compress_streams: true,
        }
    }
}

/// One input of [`flatten_and_merge_bytes`]: a PDF and the 0-based inclusive
/// page range to take from it
#[derive(Debug, Clone)]
pub struct MergeInput<'a> {
    pub bytes: &'a [u8],
    pub start: usize,
    pub end: usize,
}

/// Result of flattening and merging several inputs
#[derive(Debug, Clone, Default)]
pub struct FlattenMergeReport {
    /// One entry per input, in input order
    pub flattened: Vec<FlattenReport>,
    pub merge: MergeReport,
    /// Present when the merged document was optimized before saving
    pub optimized: Option<OptimizationReport>,
}

pub fn load_pdf(bytes: &[u8]) -> Result<Document> {
    Document::load_mem(bytes).map_err(|e| OptimizeError::Load(e.to_string()))
}

/// Serialize a document. Objects no longer reachable, such as replaced soft
/// masks, are dropped first.
pub fn save_pdf(doc: &mut Document, options: &SaveOptions) -> Result<Vec<u8>> {
    doc.prune_objects();
    if options.compress_streams {
        doc.compress();
    }
    let mut output_bytes = Vec::new();
    doc.save_to(&mut output_bytes)
        .map_err(|e| OptimizeError::Save(e.to_string()))?;
    Ok(output_bytes)
}

/// Optimize a PDF from bytes and return the optimized PDF bytes
pub fn optimize_pdf_bytes(
    input_bytes: &[u8],
    optimizer: &Optimizer,
    save: &SaveOptions,
) -> Result<(Vec<u8>, OptimizationReport)> {
    let mut doc = load_pdf(input_bytes)?;
    let report = optimizer.optimize(&mut doc);
    let output_bytes = save_pdf(&mut doc, save)?;
    info!(
        input = input_bytes.len(),
        output = output_bytes.len(),
        "Optimized PDF"
    );
    Ok((output_bytes, report))
}

/// Flatten the forms of every input, then merge the selected page ranges
/// into a new document, optionally optimizing the result
pub fn flatten_and_merge_bytes(
    inputs: &[MergeInput<'_>],
    optimizer: Option<&Optimizer>,
    save: &SaveOptions,
) -> Result<(Vec<u8>, FlattenMergeReport)> {
    let mut report = FlattenMergeReport::default();
    let mut sources = Vec::with_capacity(inputs.len());
    for input in inputs {
        let mut doc = load_pdf(input.bytes)?;
        report.flattened.push(flatten(&mut doc)?);
        sources.push(doc);
    }

    let units: Vec<MergeUnit<'_>> = sources
        .iter()
        .zip(inputs)
        .map(|(doc, input)| MergeUnit::new(doc, input.start, input.end))
        .collect();
    let mut output = Document::with_version("1.7");
    report.merge = merge(&mut output, &units)?;
    report.optimized = optimizer.map(|optimizer| optimizer.optimize(&mut output));

    let output_bytes = save_pdf(&mut output, save)?;
    Ok((output_bytes, report))
}

#[cfg(not(target_arch = "wasm32"))]
pub mod file_ops {
    use super::*;
    use std::path::{Path, PathBuf};

    fn load_file(path: &Path) -> Result<Document> {
        Document::load(path).map_err(|e| OptimizeError::Load(format!("{:?}: {}", path, e)))
    }

    fn save_file(doc: &mut Document, path: &Path, options: &SaveOptions) -> Result<()> {
        doc.prune_objects();
        if options.compress_streams {
            doc.compress();
        }
        doc.save(path)
            .map_err(|e| OptimizeError::Save(format!("{:?}: {}", path, e)))?;
        Ok(())
    }

    /// Optimize a PDF from file path to file path
    pub fn optimize_pdf_file(
        input_path: &Path,
        output_path: &Path,
        optimizer: &Optimizer,
        save: &SaveOptions,
    ) -> Result<OptimizationReport> {
        let mut doc = load_file(input_path)?;
        let report = optimizer.optimize(&mut doc);
        save_file(&mut doc, output_path, save)?;
        Ok(report)
    }

    /// Flatten and merge page ranges of several files into `output_path`.
    /// A missing range takes every page of that file.
    pub fn flatten_and_merge_files(
        inputs: &[(PathBuf, Option<(usize, usize)>)],
        output_path: &Path,
        optimizer: Option<&Optimizer>,
        save: &SaveOptions,
    ) -> Result<FlattenMergeReport> {
        let mut report = FlattenMergeReport::default();
        let mut sources = Vec::with_capacity(inputs.len());
        for (path, _) in inputs {
            let mut doc = load_file(path)?;
            report.flattened.push(flatten(&mut doc)?);
            sources.push(doc);
        }

        let units: Vec<MergeUnit<'_>> = sources
            .iter()
            .zip(inputs)
            .map(|(doc, (_, range))| match range {
                Some((start, end)) => MergeUnit::new(doc, *start, *end),
                None => MergeUnit::all_pages(doc),
            })
            .collect();
        let mut output = Document::with_version("1.7");
        report.merge = merge(&mut output, &units)?;
        report.optimized = optimizer.map(|optimizer| optimizer.optimize(&mut output));
        save_file(&mut output, output_path, save)?;
        Ok(report)
    }
}
