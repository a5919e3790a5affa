//! Applies optimization handlers to every resource reachable from a
//! document's pages.
//!
//! The document's object table is the resource arena: pages reference
//! resources by object id, so replacing the object stored under an id is seen
//! by every page that uses it. Handlers run on snapshots, possibly in
//! parallel; the arena lock is only held to take a snapshot and to swap in a
//! replacement.

use lopdf::{Dictionary, Document, Object, ObjectId};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

use crate::error::{OptimizeError, Result};
use crate::handler::{
    HandlerOutcome, OptimizationHandler, Replacement, Resource, ResourceKind, Selection,
    SkipReason,
};
use crate::profile::{self, ProfileRegistry};
use crate::scaling::AverageAlgorithm;

/// Shared flag used to stop scheduling further resources
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for an optimization run
#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    /// Evaluate independent resources on the rayon thread pool
    pub parallel: bool,
    /// Checked before each resource is scheduled
    pub cancel: Option<CancellationToken>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            cancel: None,
        }
    }
}

/// What happened to one resource under one handler
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Replaced { before: usize, after: usize },
    Skipped(SkipReason),
    Failed(OptimizeError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOutcome {
    pub id: ObjectId,
    pub kind: ResourceKind,
    pub handler: &'static str,
    pub status: OutcomeStatus,
}

/// Result of an optimization run
#[derive(Debug, Clone, Default)]
pub struct OptimizationReport {
    /// Distinct resources reachable from the pages
    pub total_resources: usize,
    pub outcomes: Vec<ResourceOutcome>,
    /// The run was cancelled before all resources were visited
    pub cancelled: bool,
}

impl OptimizationReport {
    pub fn replaced_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Replaced { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Skipped(_)))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (ObjectId, &OptimizeError)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            OutcomeStatus::Failed(err) => Some((o.id, err)),
            _ => None,
        })
    }

    /// Net bytes saved by all replacements (negative if output grew)
    pub fn bytes_saved(&self) -> i64 {
        self.outcomes
            .iter()
            .map(|o| match o.status {
                OutcomeStatus::Replaced { before, after } => before as i64 - after as i64,
                _ => 0,
            })
            .sum()
    }
}

/// Runs an ordered list of handlers over a document
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    handlers: Vec<OptimizationHandler>,
    options: OptimizeOptions,
}

impl Optimizer {
    pub fn new(handlers: Vec<OptimizationHandler>) -> Self {
        Self {
            handlers,
            options: OptimizeOptions::default(),
        }
    }

    /// Optimizer preconfigured from a named profile
    pub fn from_profile(name: &str) -> Result<Self> {
        let handlers = ProfileRegistry::global()?.lookup(name)?.to_vec();
        Ok(Self::new(handlers))
    }

    /// Optimizer that only rescales palette images. Direct-color images and
    /// other resources are left as they are.
    pub fn indexed_downscale(factor: f64, algorithm: AverageAlgorithm) -> Result<Self> {
        let handler = profile::indexed_downscale(factor, algorithm, Selection::default())?;
        Ok(Self::new(vec![handler]))
    }

    pub fn with_options(mut self, options: OptimizeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn add_handler(mut self, handler: OptimizationHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handlers(&self) -> &[OptimizationHandler] {
        &self.handlers
    }

    fn is_cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Apply every handler, in order, to each resource reachable from the
    /// pages. Per-resource failures are recorded, never returned.
    #[instrument(skip_all, fields(handlers = self.handlers.len()))]
    pub fn optimize(&self, doc: &mut Document) -> OptimizationReport {
        let targets = collect_resources(doc);
        let mut report = OptimizationReport {
            total_resources: targets.len(),
            ..Default::default()
        };
        info!(resources = targets.len(), "Collected page resources");

        if self.handlers.is_empty() || targets.is_empty() {
            return report;
        }

        let arena = ResourceArena::new(doc);
        for handler in &self.handlers {
            let run = |&(id, kind): &(ObjectId, ResourceKind)| {
                if self.is_cancelled() {
                    return None;
                }
                Some(arena.process(handler, id, kind))
            };
            let outcomes: Vec<Option<ResourceOutcome>> = if self.options.parallel {
                targets.par_iter().map(run).collect()
            } else {
                targets.iter().map(run).collect()
            };

            report.cancelled |= outcomes.iter().any(Option::is_none);
            report.outcomes.extend(outcomes.into_iter().flatten());
            if report.cancelled {
                warn!(handler = handler.name(), "Optimization cancelled");
                break;
            }
        }
        arena.finish();

        info!(
            replaced = report.replaced_count(),
            skipped = report.skipped_count(),
            failed = report.failed_count(),
            bytes_saved = report.bytes_saved(),
            "Optimization finished"
        );
        report
    }
}

/// The document's object table behind a lock, plus an id allocator for
/// objects added during the run
struct ResourceArena<'a> {
    objects: Mutex<&'a mut BTreeMap<ObjectId, Object>>,
    next_id: AtomicU32,
    max_id: &'a mut u32,
}

impl<'a> ResourceArena<'a> {
    fn new(doc: &'a mut Document) -> Self {
        let next_id = AtomicU32::new(doc.max_id);
        ResourceArena {
            objects: Mutex::new(&mut doc.objects),
            next_id,
            max_id: &mut doc.max_id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, &'a mut BTreeMap<ObjectId, Object>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(
        &self,
        handler: &OptimizationHandler,
        id: ObjectId,
        kind: ResourceKind,
    ) -> ResourceOutcome {
        let outcome = |status| ResourceOutcome {
            id,
            kind,
            handler: handler.name(),
            status,
        };

        let snapshot = snapshot(&self.lock(), id, kind);
        let Some(resource) = snapshot else {
            return outcome(OutcomeStatus::Failed(OptimizeError::ResourceDecodeFailed(
                format!("object {:?} is not a stream", id),
            )));
        };

        match handler.optimize(&resource) {
            Ok(HandlerOutcome::Replace(replacement)) => {
                let before = resource.stored_len();
                let after = replacement.stream.content.len()
                    + replacement.smask.as_ref().map_or(0, |s| s.content.len());
                debug!(?id, handler = handler.name(), before, after, "Replacing resource");
                self.commit(id, replacement);
                outcome(OutcomeStatus::Replaced { before, after })
            }
            Ok(HandlerOutcome::Skip(reason)) => {
                debug!(?id, handler = handler.name(), ?reason, "Skipping resource");
                outcome(OutcomeStatus::Skipped(reason))
            }
            Err(err) => {
                warn!(?id, handler = handler.name(), error = %err, "Resource left unchanged");
                outcome(OutcomeStatus::Failed(err))
            }
        }
    }

    /// Swap in a replacement; the soft mask and the image land together
    fn commit(&self, id: ObjectId, replacement: Replacement) {
        let Replacement { mut stream, smask } = replacement;
        let mut objects = self.lock();
        if let Some(smask) = smask {
            let smask_id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1, 0);
            objects.insert(smask_id, Object::Stream(smask));
            stream.dict.set("SMask", Object::Reference(smask_id));
        }
        objects.insert(id, Object::Stream(stream));
    }

    fn finish(self) {
        *self.max_id = self.next_id.load(Ordering::SeqCst);
    }
}

fn snapshot(objects: &BTreeMap<ObjectId, Object>, id: ObjectId, kind: ResourceKind) -> Option<Resource> {
    let Some(Object::Stream(stream)) = objects.get(&id) else {
        return None;
    };
    let (smask, color_space) = if kind == ResourceKind::Image {
        let smask = match stream.dict.get(b"SMask") {
            Ok(Object::Reference(smask_id)) => match objects.get(smask_id) {
                Some(Object::Stream(s)) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        };
        let color_space = stream
            .dict
            .get(b"ColorSpace")
            .ok()
            .map(|cs| resolve_deep(objects, cs, 4));
        (smask, color_space)
    } else {
        (None, None)
    };
    Some(Resource {
        id,
        kind,
        stream: stream.clone(),
        smask,
        color_space,
    })
}

/// Replace references inside `obj` with the objects they point to
fn resolve_deep(objects: &BTreeMap<ObjectId, Object>, obj: &Object, depth: u8) -> Object {
    if depth == 0 {
        return obj.clone();
    }
    match obj {
        Object::Reference(id) => objects
            .get(id)
            .map(|o| resolve_deep(objects, o, depth - 1))
            .unwrap_or(Object::Null),
        Object::Array(items) => Object::Array(
            items
                .iter()
                .map(|o| resolve_deep(objects, o, depth - 1))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        _ => Some(obj),
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, obj)? {
        Object::Dictionary(d) => Some(d),
        _ => None,
    }
}

/// Page resources, following the page tree for inherited ones
pub(crate) fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut current = page_id;
    let mut visited = HashSet::new();
    while visited.insert(current) {
        let dict = doc.get_dictionary(current).ok()?;
        if let Ok(resources) = dict.get(b"Resources") {
            return resolve_dict(doc, resources);
        }
        match dict.get(b"Parent") {
            Ok(Object::Reference(parent)) => current = *parent,
            _ => return None,
        }
    }
    None
}

struct ResourceCollector<'a> {
    doc: &'a Document,
    seen: HashSet<ObjectId>,
    soft_masks: HashSet<ObjectId>,
    found: Vec<(ObjectId, ResourceKind)>,
}

impl<'a> ResourceCollector<'a> {
    fn add(&mut self, id: ObjectId, kind: ResourceKind) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.found.push((id, kind));
        true
    }

    fn scan_resources(&mut self, resources: &'a Dictionary) {
        if let Some(xobjects) = resources
            .get(b"XObject")
            .ok()
            .and_then(|x| resolve_dict(self.doc, x))
        {
            for (_, value) in xobjects.iter() {
                if let Object::Reference(id) = value {
                    self.scan_xobject(*id);
                }
            }
        }
        if let Some(fonts) = resources
            .get(b"Font")
            .ok()
            .and_then(|f| resolve_dict(self.doc, f))
        {
            for (_, font) in fonts.iter() {
                self.scan_font(font);
            }
        }
    }

    fn scan_xobject(&mut self, id: ObjectId) {
        let Ok(Object::Stream(stream)) = self.doc.get_object(id) else {
            return;
        };
        match stream.dict.get(b"Subtype") {
            Ok(Object::Name(n)) if n == b"Image" => {
                if let Ok(Object::Reference(smask)) = stream.dict.get(b"SMask") {
                    self.soft_masks.insert(*smask);
                }
                self.add(id, ResourceKind::Image);
            }
            Ok(Object::Name(n)) if n == b"Form" => self.scan_form(id),
            _ => {}
        }
    }

    fn scan_form(&mut self, id: ObjectId) {
        if !self.add(id, ResourceKind::Form) {
            return;
        }
        let Ok(Object::Stream(stream)) = self.doc.get_object(id) else {
            return;
        };
        if let Some(resources) = stream
            .dict
            .get(b"Resources")
            .ok()
            .and_then(|r| resolve_dict(self.doc, r))
        {
            self.scan_resources(resources);
        }
    }

    fn scan_font(&mut self, font: &'a Object) {
        let Some(font) = resolve_dict(self.doc, font) else {
            return;
        };
        if let Ok(descendants) = font.get(b"DescendantFonts") {
            if let Some(Object::Array(list)) = resolve(self.doc, descendants) {
                for descendant in list {
                    self.scan_font(descendant);
                }
            }
        }
        let Some(descriptor) = font
            .get(b"FontDescriptor")
            .ok()
            .and_then(|d| resolve_dict(self.doc, d))
        else {
            return;
        };
        for key in [b"FontFile".as_slice(), b"FontFile2", b"FontFile3"] {
            if let Ok(Object::Reference(id)) = descriptor.get(key) {
                self.add(*id, ResourceKind::FontFile);
            }
        }
    }

    fn scan_annotations(&mut self, page: &'a Dictionary) {
        let Some(Object::Array(annots)) = page.get(b"Annots").ok().and_then(|a| resolve(self.doc, a))
        else {
            return;
        };
        for annot in annots {
            let Some(ap) = resolve_dict(self.doc, annot)
                .and_then(|a| a.get(b"AP").ok())
                .and_then(|ap| resolve_dict(self.doc, ap))
            else {
                continue;
            };
            for (_, appearance) in ap.iter() {
                match appearance {
                    Object::Reference(id) => self.scan_form(*id),
                    Object::Dictionary(states) => {
                        for (_, state) in states.iter() {
                            if let Object::Reference(id) = state {
                                self.scan_form(*id);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Every distinct resource reachable from the pages, in page order.
/// Soft masks are excluded; they are processed together with their image.
pub fn collect_resources(doc: &Document) -> Vec<(ObjectId, ResourceKind)> {
    let mut collector = ResourceCollector {
        doc,
        seen: HashSet::new(),
        soft_masks: HashSet::new(),
        found: Vec::new(),
    };
    for page_id in doc.get_pages().into_values() {
        if let Some(resources) = page_resources(doc, page_id) {
            collector.scan_resources(resources);
        }
        if let Ok(page) = doc.get_dictionary(page_id) {
            collector.scan_annotations(page);
        }
    }
    let soft_masks = collector.soft_masks;
    collector
        .found
        .into_iter()
        .filter(|(id, _)| !soft_masks.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;
    use crate::handler::{ImageQualityOptimizer, ReplacePolicy};
    use crate::processor::{Processor, ProcessorChain};
    use crate::raster::{self, Encoding};
    use crate::scaling::AverageAlgorithm;
    use crate::test_support::{build_pdf, PageSpec};

    fn downscale_handler() -> OptimizationHandler {
        let chain = ProcessorChain::new(vec![
            Processor::scale(0.5, AverageAlgorithm::Mean).unwrap()
        ])
        .unwrap();
        OptimizationHandler::ImageQuality(
            ImageQualityOptimizer::new()
                .with_lossless(chain, Encoding::Flate)
                .with_policy(ReplacePolicy::Always),
        )
    }

    fn width_of(doc: &Document, id: ObjectId) -> i64 {
        let stream = doc.get_object(id).unwrap().as_stream().unwrap();
        match stream.dict.get(b"Width").unwrap() {
            Object::Integer(w) => *w,
            other => panic!("unexpected width {:?}", other),
        }
    }

    #[test]
    fn test_empty_handler_set_is_noop() {
        let (mut doc, _) = build_pdf(&[PageSpec::with_images(&["A"]), PageSpec::with_images(&["A"])]);
        let before = doc.objects.clone();
        let report = Optimizer::new(vec![]).optimize(&mut doc);
        assert_eq!(report.outcomes.len(), 0);
        assert_eq!(doc.objects, before);
    }

    #[test]
    fn test_shared_image_processed_once() {
        let (mut doc, images) =
            build_pdf(&[PageSpec::with_images(&["A"]), PageSpec::with_images(&["A"])]);
        let image_id = images["A"];
        let report = Optimizer::new(vec![downscale_handler()]).optimize(&mut doc);

        assert_eq!(report.total_resources, 1);
        assert_eq!(report.replaced_count(), 1);
        assert_eq!(width_of(&doc, image_id), 8);

        // Both pages still point at the single replaced object
        for page_id in doc.get_pages().into_values() {
            let resources = page_resources(&doc, page_id).unwrap();
            let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
            assert_eq!(xobjects.get(b"A").unwrap(), &Object::Reference(image_id));
        }
    }

    #[test]
    fn test_corrupt_image_isolated() {
        let (mut doc, images) = build_pdf(&[PageSpec::with_images(&["Good", "Bad"])]);
        let bad = images["Bad"];
        if let Ok(Object::Stream(stream)) = doc.get_object_mut(bad) {
            stream.content = vec![0xff; 7];
        }
        let bad_before = doc.get_object(bad).unwrap().clone();

        let report = Optimizer::new(vec![downscale_handler()]).optimize(&mut doc);

        assert_eq!(report.replaced_count(), 1);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.failures().next().unwrap().0, bad);
        assert_eq!(width_of(&doc, images["Good"]), 8);
        assert_eq!(doc.get_object(bad).unwrap(), &bad_before);
    }

    #[test]
    fn test_zero_bit_depth_image_isolated() {
        let (mut doc, images) = build_pdf(&[PageSpec::with_images(&["Good", "Bad"])]);
        let bad = images["Bad"];
        if let Ok(Object::Stream(stream)) = doc.get_object_mut(bad) {
            stream.dict.set("BitsPerComponent", Object::Integer(0));
        }
        let bad_before = doc.get_object(bad).unwrap().clone();

        let report = Optimizer::new(vec![downscale_handler()]).optimize(&mut doc);

        assert_eq!(report.replaced_count(), 1);
        assert!(matches!(
            report.failures().next(),
            Some((id, OptimizeError::ResourceDecodeFailed(_))) if id == bad
        ));
        assert_eq!(width_of(&doc, images["Good"]), 8);
        assert_eq!(doc.get_object(bad).unwrap(), &bad_before);
    }

    fn gray_palette_image() -> lopdf::Stream {
        let mut stream = crate::test_support::image_stream(0);
        let lookup: Vec<u8> = (0..=255).collect();
        stream.dict.set(
            "ColorSpace",
            Object::Array(vec![
                Object::Name(b"Indexed".to_vec()),
                Object::Name(b"DeviceGray".to_vec()),
                Object::Integer(255),
                Object::String(lookup, lopdf::StringFormat::Hexadecimal),
            ]),
        );
        stream.content = (0..=255).collect();
        stream
    }

    #[test]
    fn test_indexed_downscale_rescales_palette_images_only() {
        let (mut doc, images) = build_pdf(&[PageSpec::with_images(&["Palette", "Photo"])]);
        doc.objects
            .insert(images["Palette"], Object::Stream(gray_palette_image()));
        let photo_before = doc.get_object(images["Photo"]).unwrap().clone();

        let report = Optimizer::indexed_downscale(0.5, AverageAlgorithm::Mean)
            .unwrap()
            .optimize(&mut doc);

        assert_eq!(report.replaced_count(), 1);
        assert_eq!(width_of(&doc, images["Palette"]), 8);
        let stream = doc.get_object(images["Palette"]).unwrap().as_stream().unwrap();
        assert!(matches!(stream.dict.get(b"ColorSpace"), Ok(Object::Array(_))));
        assert_eq!(doc.get_object(images["Photo"]).unwrap(), &photo_before);
    }

    #[test]
    fn test_later_handler_sees_replacement() {
        let (mut doc, images) = build_pdf(&[PageSpec::with_images(&["A"])]);
        let optimizer = Optimizer::new(vec![downscale_handler(), downscale_handler()]);
        optimizer.optimize(&mut doc);
        assert_eq!(width_of(&doc, images["A"]), 4);
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let specs = [PageSpec::with_images(&["A", "B"]), PageSpec::with_images(&["C"])];
        let (mut parallel, _) = build_pdf(&specs);
        let (mut sequential, _) = build_pdf(&specs);
        Optimizer::new(vec![downscale_handler()]).optimize(&mut parallel);
        Optimizer::new(vec![downscale_handler()])
            .with_options(OptimizeOptions {
                parallel: false,
                cancel: None,
            })
            .optimize(&mut sequential);
        assert_eq!(parallel.objects, sequential.objects);
    }

    #[test]
    fn test_cancelled_run_leaves_document_untouched() {
        let (mut doc, _) = build_pdf(&[PageSpec::with_images(&["A"])]);
        let before = doc.objects.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = Optimizer::new(vec![downscale_handler()])
            .with_options(OptimizeOptions {
                parallel: true,
                cancel: Some(cancel),
            })
            .optimize(&mut doc);
        assert!(report.cancelled);
        assert_eq!(doc.objects, before);
    }

    #[test]
    fn test_alpha_image_gets_new_soft_mask() {
        let (mut doc, images) = build_pdf(&[PageSpec::with_images(&["A"])]);
        let rgba = Bitmap::direct(4, 4, 4, 8, true, [10, 20, 30, 128].repeat(16)).unwrap();
        let encoded = raster::encode_image(&rgba, Encoding::Flate).unwrap();
        let smask_id = doc.add_object(Object::Stream(encoded.smask.unwrap()));
        let mut stream = encoded.stream;
        stream.dict.set("SMask", Object::Reference(smask_id));
        doc.objects.insert(images["A"], Object::Stream(stream));

        let resources = collect_resources(&doc);
        assert_eq!(resources, vec![(images["A"], ResourceKind::Image)]);

        let max_before = doc.max_id;
        Optimizer::new(vec![downscale_handler()]).optimize(&mut doc);
        let stream = doc.get_object(images["A"]).unwrap().as_stream().unwrap();
        let new_mask = stream.dict.get(b"SMask").unwrap().as_reference().unwrap();
        assert_eq!(new_mask, (max_before + 1, 0));
        assert_eq!(doc.max_id, max_before + 1);
    }

    #[test]
    fn test_profile_lookup() {
        assert!(Optimizer::from_profile("high-compression").is_ok());
        assert!(matches!(
            Optimizer::from_profile("nope"),
            Err(OptimizeError::UnknownProfile(_))
        ));
    }
}
