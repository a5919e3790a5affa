//! WebAssembly bindings for the PDF optimizer

use serde::Serialize;
use wasm_bindgen::prelude::*;

use crate::{
    flatten_and_merge_bytes, optimize_pdf_bytes, MergeInput, OptimizationReport, OptimizeOptions,
    Optimizer, OutcomeStatus, SaveOptions,
};

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceJson {
    object_id: String,
    kind: String,
    handler: &'static str,
    status: &'static str,
    before: Option<usize>,
    after: Option<usize>,
    detail: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OptimizeJson {
    total_resources: usize,
    replaced: usize,
    skipped: usize,
    failed: usize,
    bytes_saved: i64,
    resources: Vec<ResourceJson>,
}

fn report_to_json(report: &OptimizationReport) -> OptimizeJson {
    let resources = report
        .outcomes
        .iter()
        .map(|outcome| {
            let (status, before, after, detail) = match &outcome.status {
                OutcomeStatus::Replaced { before, after } => {
                    ("replaced", Some(*before), Some(*after), None)
                }
                OutcomeStatus::Skipped(reason) => ("skipped", None, None, Some(format!("{:?}", reason))),
                OutcomeStatus::Failed(err) => ("failed", None, None, Some(err.to_string())),
            };
            ResourceJson {
                object_id: format!("{} {}", outcome.id.0, outcome.id.1),
                kind: format!("{:?}", outcome.kind),
                handler: outcome.handler,
                status,
                before,
                after,
                detail,
            }
        })
        .collect();
    OptimizeJson {
        total_resources: report.total_resources,
        replaced: report.replaced_count(),
        skipped: report.skipped_count(),
        failed: report.failed_count(),
        bytes_saved: report.bytes_saved(),
        resources,
    }
}

/// Optimize a PDF with a named profile
///
/// # Arguments
/// * `pdf_bytes` - The input PDF file as a byte array
/// * `profile` - Profile name (default: "high-compression")
///
/// # Returns
/// An `OptimizeResultJs` holding the optimized PDF and a JSON report
#[wasm_bindgen]
pub fn optimize_pdf(pdf_bytes: &[u8], profile: Option<String>) -> Result<OptimizeResultJs, JsError> {
    let profile = profile.unwrap_or_else(|| "high-compression".to_string());
    // No worker threads in the browser
    let optimizer = Optimizer::from_profile(&profile)
        .map_err(|e| JsError::new(&e.to_string()))?
        .with_options(OptimizeOptions {
            parallel: false,
            cancel: None,
        });

    let (output_bytes, report) = optimize_pdf_bytes(pdf_bytes, &optimizer, &SaveOptions::default())
        .map_err(|e| JsError::new(&e.to_string()))?;

    if report.failed_count() > 0 {
        web_sys::console::warn_1(&JsValue::from_str(&format!(
            "{} resources could not be optimized and were left unchanged",
            report.failed_count()
        )));
    }

    let report_json = serde_json::to_string(&report_to_json(&report))
        .unwrap_or_else(|_| "{}".to_string());
    Ok(OptimizeResultJs {
        pdf_bytes: output_bytes,
        report_json,
    })
}

/// Flatten the form fields of each PDF and merge the selected pages
///
/// # Arguments
/// * `pdfs` - Array of `Uint8Array` PDF files
/// * `ranges` - Flat list of 0-based inclusive `start, end` pairs, one per PDF
/// * `profile` - Optional profile to optimize the merged PDF with
///
/// # Returns
/// An `OptimizeResultJs` holding the merged PDF and a JSON report
#[wasm_bindgen]
pub fn flatten_and_merge(
    pdfs: js_sys::Array,
    ranges: &[u32],
    profile: Option<String>,
) -> Result<OptimizeResultJs, JsError> {
    let files: Vec<Vec<u8>> = pdfs
        .iter()
        .map(|value| js_sys::Uint8Array::new(&value).to_vec())
        .collect();
    if ranges.len() != files.len() * 2 {
        return Err(JsError::new("expected one start/end pair per PDF"));
    }
    let inputs: Vec<MergeInput<'_>> = files
        .iter()
        .zip(ranges.chunks_exact(2))
        .map(|(bytes, range)| MergeInput {
            bytes,
            start: range[0] as usize,
            end: range[1] as usize,
        })
        .collect();

    let optimizer = profile
        .map(|name| {
            Optimizer::from_profile(&name).map(|optimizer| {
                optimizer.with_options(OptimizeOptions {
                    parallel: false,
                    cancel: None,
                })
            })
        })
        .transpose()
        .map_err(|e| JsError::new(&e.to_string()))?;
    let (output_bytes, report) =
        flatten_and_merge_bytes(&inputs, optimizer.as_ref(), &SaveOptions::default())
            .map_err(|e| JsError::new(&e.to_string()))?;

    let report_json = serde_json::json!({
        "pages": report.merge.pages_appended,
        "objectsCopied": report.merge.objects_copied,
        "flattened": report.flattened.iter().map(|r| &r.flattened).collect::<Vec<_>>(),
        "skipped": report.flattened.iter().map(|r| &r.skipped).collect::<Vec<_>>(),
        "optimized": report.optimized.as_ref().map(report_to_json),
    })
    .to_string();
    Ok(OptimizeResultJs {
        pdf_bytes: output_bytes,
        report_json,
    })
}

/// Output PDF plus a JSON report
#[wasm_bindgen]
pub struct OptimizeResultJs {
    pdf_bytes: Vec<u8>,
    report_json: String,
}

#[wasm_bindgen]
impl OptimizeResultJs {
    /// Get the output PDF bytes
    #[wasm_bindgen(getter)]
    pub fn pdf_bytes(&self) -> Vec<u8> {
        self.pdf_bytes.clone()
    }

    /// Get the report as a JSON string
    #[wasm_bindgen(getter)]
    pub fn report_json(&self) -> String {
        self.report_json.clone()
    }
}
