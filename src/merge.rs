//! Page-range merging across documents.
//!
//! Each merge unit copies the objects reachable from its pages into the
//! output under fresh ids. Objects reached twice within one unit are copied
//! once; separate units never share copies.

use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument};

use crate::error::{OptimizeError, Result};

/// Page attributes a page may inherit from its ancestors
const INHERITABLE_KEYS: &[&[u8]] = &[b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Pages `start..=end` (0-based) of `source`
#[derive(Debug, Clone, Copy)]
pub struct MergeUnit<'a> {
    pub source: &'a Document,
    pub start: usize,
    pub end: usize,
}

impl<'a> MergeUnit<'a> {
    pub fn new(source: &'a Document, start: usize, end: usize) -> Self {
        MergeUnit { source, start, end }
    }

    /// Every page of `source`
    pub fn all_pages(source: &'a Document) -> Self {
        let end = source.get_pages().len().saturating_sub(1);
        MergeUnit { source, start: 0, end }
    }

    fn page_count(&self) -> usize {
        self.end - self.start + 1
    }

    fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(OptimizeError::EmptyRange {
                start: self.start,
                end: self.end,
            });
        }
        let page_count = self.source.get_pages().len();
        if self.end >= page_count {
            return Err(OptimizeError::PageRangeOutOfBounds {
                start: self.start,
                end: self.end,
                page_count,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub pages_appended: usize,
    pub objects_copied: usize,
}

fn type_name(obj: &Object) -> Option<&[u8]> {
    let dict = match obj {
        Object::Dictionary(d) => d,
        _ => return None,
    };
    match dict.get(b"Type") {
        Ok(Object::Name(name)) => Some(name.as_slice()),
        _ => None,
    }
}

/// Copies one unit's object graph into the output document
struct UnitCopier<'a> {
    source: &'a Document,
    map: HashMap<ObjectId, ObjectId>,
    pending: Vec<ObjectId>,
}

impl<'a> UnitCopier<'a> {
    /// Output id for a source object, scheduling it for copying on first use.
    /// Page tree nodes outside the unit become null.
    fn map_reference(&mut self, output: &mut Document, id: ObjectId) -> Object {
        if let Some(mapped) = self.map.get(&id) {
            return Object::Reference(*mapped);
        }
        let Ok(target) = self.source.get_object(id) else {
            return Object::Null;
        };
        if matches!(type_name(target), Some(b"Page") | Some(b"Pages")) {
            return Object::Null;
        }
        let mapped = output.new_object_id();
        self.map.insert(id, mapped);
        self.pending.push(id);
        Object::Reference(mapped)
    }

    fn remap(&mut self, output: &mut Document, obj: &Object) -> Object {
        match obj {
            Object::Reference(id) => self.map_reference(output, *id),
            Object::Array(items) => {
                Object::Array(items.iter().map(|o| self.remap(output, o)).collect())
            }
            Object::Dictionary(dict) => Object::Dictionary(self.remap_dict(output, dict)),
            Object::Stream(stream) => {
                let mut copy = stream.clone();
                copy.dict = self.remap_dict(output, &stream.dict);
                Object::Stream(copy)
            }
            other => other.clone(),
        }
    }

    fn remap_dict(&mut self, output: &mut Document, dict: &Dictionary) -> Dictionary {
        let mut copy = Dictionary::new();
        for (key, value) in dict.iter() {
            copy.set(key.clone(), self.remap(output, value));
        }
        copy
    }

    /// Page dictionary with inherited attributes made explicit
    fn materialized_page(&self, page_id: ObjectId) -> Result<Dictionary> {
        let mut page = self
            .source
            .get_dictionary(page_id)
            .map_err(|e| OptimizeError::Structure(format!("page {:?}: {}", page_id, e)))?
            .clone();
        let mut visited = HashSet::from([page_id]);
        let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
        while let Some(node_id) = parent.filter(|id| visited.insert(*id)) {
            let Ok(node) = self.source.get_dictionary(node_id) else {
                break;
            };
            for key in INHERITABLE_KEYS {
                if !page.has(key) {
                    if let Ok(value) = node.get(key) {
                        page.set(key.to_vec(), value.clone());
                    }
                }
            }
            parent = node.get(b"Parent").and_then(Object::as_reference).ok();
        }
        page.remove(b"Parent");
        Ok(page)
    }

    /// Copy the unit's pages, returning their new ids in order
    fn copy(&mut self, output: &mut Document, page_ids: &[ObjectId], parent: ObjectId) -> Result<Vec<ObjectId>> {
        let new_ids: Vec<ObjectId> = page_ids
            .iter()
            .map(|id| {
                let mapped = output.new_object_id();
                self.map.insert(*id, mapped);
                mapped
            })
            .collect();

        for (source_id, new_id) in page_ids.iter().zip(&new_ids) {
            let page = self.materialized_page(*source_id)?;
            let mut copy = self.remap_dict(output, &page);
            copy.set("Parent", Object::Reference(parent));
            output.objects.insert(*new_id, Object::Dictionary(copy));
        }

        let source = self.source;
        while let Some(source_id) = self.pending.pop() {
            let Some(mapped) = self.map.get(&source_id).copied() else {
                continue;
            };
            let copy = match source.get_object(source_id) {
                Ok(obj) => self.remap(output, obj),
                Err(_) => Object::Null,
            };
            output.objects.insert(mapped, copy);
        }
        Ok(new_ids)
    }
}

/// Root page tree node of `doc`, creating a catalog and page tree if missing
fn ensure_page_tree(doc: &mut Document) -> Result<ObjectId> {
    let catalog_id = doc.trailer.get(b"Root").and_then(Object::as_reference).ok();
    if let Some(catalog_id) = catalog_id {
        let catalog = doc
            .get_dictionary(catalog_id)
            .map_err(|e| OptimizeError::Structure(format!("catalog: {}", e)))?;
        if let Ok(pages_id) = catalog.get(b"Pages").and_then(Object::as_reference) {
            return Ok(pages_id);
        }
    }

    let mut pages = Dictionary::new();
    pages.set("Type", Object::Name(b"Pages".to_vec()));
    pages.set("Kids", Object::Array(Vec::new()));
    pages.set("Count", Object::Integer(0));
    let pages_id = doc.add_object(pages);

    match catalog_id {
        Some(catalog_id) => {
            doc.get_dictionary_mut(catalog_id)
                .map_err(|e| OptimizeError::Structure(format!("catalog: {}", e)))?
                .set("Pages", Object::Reference(pages_id));
        }
        None => {
            let mut catalog = Dictionary::new();
            catalog.set("Type", Object::Name(b"Catalog".to_vec()));
            catalog.set("Pages", Object::Reference(pages_id));
            let catalog_id = doc.add_object(catalog);
            doc.trailer.set("Root", Object::Reference(catalog_id));
        }
    }
    Ok(pages_id)
}

fn append_to_page_tree(doc: &mut Document, pages_id: ObjectId, new_pages: Vec<ObjectId>) -> Result<()> {
    let pages = doc
        .get_dictionary_mut(pages_id)
        .map_err(|e| OptimizeError::Structure(format!("page tree root: {}", e)))?;
    let mut kids = match pages.get(b"Kids") {
        Ok(Object::Array(kids)) => kids.clone(),
        _ => Vec::new(),
    };
    let count = match pages.get(b"Count") {
        Ok(Object::Integer(count)) => *count,
        _ => kids.len() as i64,
    };
    let added = new_pages.len() as i64;
    kids.extend(new_pages.into_iter().map(Object::Reference));
    pages.set("Kids", Object::Array(kids));
    pages.set("Count", Object::Integer(count + added));
    Ok(())
}

/// Append each unit's page range, in order, to `output`.
///
/// All units are validated first; on error the output is not modified.
/// Page content and geometry are copied as-is.
#[instrument(skip_all, fields(units = units.len()))]
pub fn merge(output: &mut Document, units: &[MergeUnit<'_>]) -> Result<MergeReport> {
    for unit in units {
        unit.validate()?;
    }

    let pages_id = ensure_page_tree(output)?;
    let mut report = MergeReport::default();
    for (index, unit) in units.iter().enumerate() {
        let page_ids: Vec<ObjectId> = unit
            .source
            .get_pages()
            .into_values()
            .skip(unit.start)
            .take(unit.page_count())
            .collect();
        let mut copier = UnitCopier {
            source: unit.source,
            map: HashMap::new(),
            pending: Vec::new(),
        };
        let new_pages = copier.copy(output, &page_ids, pages_id)?;
        debug!(
            unit = index,
            pages = new_pages.len(),
            objects = copier.map.len(),
            "Copied page range"
        );
        report.pages_appended += new_pages.len();
        report.objects_copied += copier.map.len();
        append_to_page_tree(output, pages_id, new_pages)?;
    }

    info!(
        pages = report.pages_appended,
        objects = report.objects_copied,
        "Merged documents"
    );
    Ok(report)
}
