//! Form flattening: draws widget appearances into page content and removes
//! the interactive fields.

use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

use crate::error::{OptimizeError, Result};
use crate::optimizer::page_resources;

/// Fields handled by one [`flatten`] call, by fully qualified name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenReport {
    /// Fields drawn into page content (or dropped, if hidden)
    pub flattened: Vec<String>,
    /// Fields left interactive because they have no usable appearance
    pub skipped: Vec<String>,
}

/// Annotation flag: do not display
const HIDDEN_FLAG: i64 = 1 << 1;

/// How a widget ends up on the page
enum Placement {
    Draw { appearance: ObjectId, matrix: [f64; 6] },
    Hide,
}

struct Widget {
    id: ObjectId,
    name: String,
    placement: Option<Placement>,
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

fn numbers<const N: usize>(obj: Option<&Object>) -> Option<[f64; N]> {
    let Some(Object::Array(items)) = obj else {
        return None;
    };
    if items.len() != N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = number(item)?;
    }
    Some(out)
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

/// Fully qualified field name, joining partial names up the `/Parent` chain
fn field_name(doc: &Document, id: ObjectId) -> String {
    let mut parts = Vec::new();
    let mut current = Some(id);
    let mut visited = HashSet::new();
    while let Some(node) = current.filter(|n| visited.insert(*n)) {
        let Ok(dict) = doc.get_dictionary(node) else {
            break;
        };
        if let Ok(Object::String(name, _)) = dict.get(b"T") {
            parts.push(String::from_utf8_lossy(name).into_owned());
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    if parts.is_empty() {
        return format!("{} {} R", id.0, id.1);
    }
    parts.reverse();
    parts.join(".")
}

/// Normal appearance stream of a widget, honouring the `/AS` state
fn normal_appearance(doc: &Document, widget: &Dictionary) -> Option<ObjectId> {
    let ap = match resolve(doc, widget.get(b"AP").ok()?) {
        Object::Dictionary(d) => d,
        _ => return None,
    };
    match ap.get(b"N").ok()? {
        Object::Reference(id) => match doc.get_object(*id).ok()? {
            Object::Stream(_) => Some(*id),
            Object::Dictionary(states) => state_appearance(widget, states),
            _ => None,
        },
        Object::Dictionary(states) => state_appearance(widget, states),
        _ => None,
    }
}

fn state_appearance(widget: &Dictionary, states: &Dictionary) -> Option<ObjectId> {
    let state = match widget.get(b"AS") {
        Ok(Object::Name(name)) => name.as_slice(),
        _ => b"Off".as_slice(),
    };
    states.get(state).and_then(Object::as_reference).ok()
}

fn transform_point(m: &[f64; 6], x: f64, y: f64) -> (f64, f64) {
    (m[0] * x + m[2] * y + m[4], m[1] * x + m[3] * y + m[5])
}

/// Matrix that maps the appearance's transformed bounding box onto the
/// annotation rectangle. The form's own `/Matrix` is applied by `Do`.
fn placement_matrix(doc: &Document, widget: &Dictionary, appearance: ObjectId) -> Option<[f64; 6]> {
    let form = &doc.get_object(appearance).ok()?.as_stream().ok()?.dict;
    let bbox: [f64; 4] = numbers(form.get(b"BBox").ok())?;
    let matrix: [f64; 6] =
        numbers(form.get(b"Matrix").ok()).unwrap_or([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    let rect: [f64; 4] = numbers(widget.get(b"Rect").ok().map(|r| resolve(doc, r)))?;

    let corners = [
        transform_point(&matrix, bbox[0], bbox[1]),
        transform_point(&matrix, bbox[2], bbox[1]),
        transform_point(&matrix, bbox[0], bbox[3]),
        transform_point(&matrix, bbox[2], bbox[3]),
    ];
    let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
    let max_y = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);

    let (rx0, rx1) = (rect[0].min(rect[2]), rect[0].max(rect[2]));
    let (ry0, ry1) = (rect[1].min(rect[3]), rect[1].max(rect[3]));
    let sx = if max_x > min_x { (rx1 - rx0) / (max_x - min_x) } else { 1.0 };
    let sy = if max_y > min_y { (ry1 - ry0) / (max_y - min_y) } else { 1.0 };
    Some([sx, 0.0, 0.0, sy, rx0 - min_x * sx, ry0 - min_y * sy])
}

fn format_number(value: f64) -> String {
    let text = format!("{:.4}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

fn page_widgets(doc: &Document, page: &Dictionary) -> Vec<Widget> {
    let Ok(annots) = page.get(b"Annots") else {
        return Vec::new();
    };
    let Object::Array(annots) = resolve(doc, annots) else {
        return Vec::new();
    };
    annots
        .iter()
        .filter_map(|annot| annot.as_reference().ok())
        .filter_map(|id| {
            let dict = doc.get_dictionary(id).ok()?;
            match dict.get(b"Subtype") {
                Ok(Object::Name(n)) if n == b"Widget" => {}
                _ => return None,
            }
            let hidden = matches!(dict.get(b"F"), Ok(Object::Integer(f)) if f & HIDDEN_FLAG != 0);
            let placement = if hidden {
                Some(Placement::Hide)
            } else {
                normal_appearance(doc, dict).and_then(|appearance| {
                    placement_matrix(doc, dict, appearance)
                        .map(|matrix| Placement::Draw { appearance, matrix })
                })
            };
            Some(Widget {
                id,
                name: field_name(doc, id),
                placement,
            })
        })
        .collect()
}

/// Page resources copied into a direct dictionary owned by the page, with an
/// owned `/XObject` subdictionary
fn page_local_resources(doc: &Document, page_id: ObjectId) -> (Dictionary, Dictionary) {
    let mut resources = page_resources(doc, page_id).cloned().unwrap_or_default();
    let xobjects = match resources.get(b"XObject") {
        Ok(obj) => match resolve(doc, obj) {
            Object::Dictionary(d) => d.clone(),
            _ => Dictionary::new(),
        },
        Err(_) => Dictionary::new(),
    };
    resources.remove(b"XObject");
    (resources, xobjects)
}

fn flatten_page(doc: &mut Document, page_id: ObjectId, report: &mut FlattenReport) -> Result<HashSet<ObjectId>> {
    let page = doc
        .get_dictionary(page_id)
        .map_err(|e| OptimizeError::Structure(format!("page {:?}: {}", page_id, e)))?;
    let widgets = page_widgets(doc, page);
    if widgets.is_empty() {
        return Ok(HashSet::new());
    }

    let (mut resources, mut xobjects) = page_local_resources(doc, page_id);
    let mut overlay = String::from("Q\n");
    let mut removed = HashSet::new();
    let mut counter = 0;
    for widget in widgets {
        match widget.placement {
            Some(Placement::Draw { appearance, matrix }) => {
                let name = loop {
                    counter += 1;
                    let candidate = format!("FlatField{}", counter);
                    if !xobjects.has(candidate.as_bytes()) {
                        break candidate;
                    }
                };
                xobjects.set(name.as_bytes().to_vec(), Object::Reference(appearance));
                let cm: Vec<String> = matrix.iter().map(|v| format_number(*v)).collect();
                overlay.push_str(&format!("q {} cm /{} Do Q\n", cm.join(" "), name));
                debug!(field = %widget.name, "Drawing field appearance");
            }
            Some(Placement::Hide) => debug!(field = %widget.name, "Dropping hidden field"),
            None => {
                report.skipped.push(widget.name);
                continue;
            }
        }
        report.flattened.push(widget.name);
        removed.insert(widget.id);
    }
    if removed.is_empty() {
        return Ok(removed);
    }

    let existing = match doc.get_dictionary(page_id).ok().and_then(|p| p.get(b"Contents").ok()) {
        Some(Object::Array(items)) => items.clone(),
        Some(Object::Reference(id)) => match doc.get_object(*id) {
            Ok(Object::Array(items)) => items.clone(),
            _ => vec![Object::Reference(*id)],
        },
        _ => Vec::new(),
    };
    let open_id = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let overlay_id = doc.add_object(Stream::new(Dictionary::new(), overlay.into_bytes()));
    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(open_id));
    contents.extend(existing);
    contents.push(Object::Reference(overlay_id));

    let remaining: Vec<Object> = match doc.get_dictionary(page_id).ok().and_then(|p| p.get(b"Annots").ok()) {
        Some(annots) => match resolve(doc, annots) {
            Object::Array(items) => items
                .iter()
                .filter(|a| !matches!(a, Object::Reference(id) if removed.contains(id)))
                .cloned()
                .collect(),
            _ => Vec::new(),
        },
        None => Vec::new(),
    };

    resources.set("XObject", Object::Dictionary(xobjects));
    let page = doc
        .get_dictionary_mut(page_id)
        .map_err(|e| OptimizeError::Structure(format!("page {:?}: {}", page_id, e)))?;
    page.set("Resources", Object::Dictionary(resources));
    page.set("Contents", Object::Array(contents));
    if remaining.is_empty() {
        page.remove(b"Annots");
    } else {
        page.set("Annots", Object::Array(remaining));
    }
    Ok(removed)
}

/// Drop flattened widgets from a field list, recursing into `/Kids`.
/// Returns whether the field itself survives.
fn prune_field(doc: &mut Document, field: ObjectId, removed: &HashSet<ObjectId>, depth: u8) -> bool {
    if removed.contains(&field) {
        return false;
    }
    if depth == 0 {
        return true;
    }
    let kids: Vec<ObjectId> = match doc.get_dictionary(field).ok().and_then(|d| d.get(b"Kids").ok()) {
        Some(Object::Array(kids)) => kids.iter().filter_map(|k| k.as_reference().ok()).collect(),
        _ => return true,
    };
    let kept: Vec<Object> = kids
        .into_iter()
        .filter(|kid| prune_field(doc, *kid, removed, depth - 1))
        .map(Object::Reference)
        .collect();
    if kept.is_empty() {
        return false;
    }
    if let Ok(dict) = doc.get_dictionary_mut(field) {
        dict.set("Kids", Object::Array(kept));
    }
    true
}

fn prune_acro_form(doc: &mut Document, removed: &HashSet<ObjectId>) -> Result<()> {
    let acro_form = match doc.catalog().ok().and_then(|c| c.get(b"AcroForm").ok()) {
        Some(Object::Reference(id)) => Some(*id),
        Some(Object::Dictionary(_)) => None,
        _ => return Ok(()),
    };
    let form = match acro_form {
        Some(id) => doc.get_dictionary(id),
        None => doc.catalog().and_then(|c| c.get(b"AcroForm")).and_then(Object::as_dict),
    }
    .map_err(|e| OptimizeError::Structure(format!("AcroForm: {}", e)))?;
    let fields: Vec<ObjectId> = match form.get(b"Fields") {
        Ok(Object::Array(fields)) => fields.iter().filter_map(|f| f.as_reference().ok()).collect(),
        _ => Vec::new(),
    };

    let kept: Vec<Object> = fields
        .into_iter()
        .filter(|field| prune_field(doc, *field, removed, 32))
        .map(Object::Reference)
        .collect();

    if kept.is_empty() {
        if let Some(id) = acro_form {
            doc.objects.remove(&id);
        }
        doc.catalog_mut()
            .map_err(|e| OptimizeError::Structure(format!("catalog: {}", e)))?
            .remove(b"AcroForm");
        return Ok(());
    }
    let form = match acro_form {
        Some(id) => doc.get_dictionary_mut(id),
        None => doc
            .catalog_mut()
            .and_then(|c| c.get_mut(b"AcroForm"))
            .and_then(Object::as_dict_mut),
    }
    .map_err(|e| OptimizeError::Structure(format!("AcroForm: {}", e)))?;
    form.set("Fields", Object::Array(kept));
    Ok(())
}

/// Draw each widget's normal appearance into its page and remove the field.
///
/// Fields without an appearance stay interactive and are reported as
/// skipped. Running it again on a flattened document changes nothing.
#[instrument(skip_all)]
pub fn flatten(doc: &mut Document) -> Result<FlattenReport> {
    let mut report = FlattenReport::default();
    let mut removed = HashSet::new();
    for page_id in doc.get_pages().into_values() {
        removed.extend(flatten_page(doc, page_id, &mut report)?);
    }
    if removed.is_empty() {
        return Ok(report);
    }

    prune_acro_form(doc, &removed)?;
    for id in &removed {
        doc.objects.remove(id);
    }
    info!(
        flattened = report.flattened.len(),
        skipped = report.skipped.len(),
        "Flattened form fields"
    );
    Ok(report)
}

/// Number of terminal fields still listed in the AcroForm
pub fn field_count(doc: &Document) -> usize {
    fn count(doc: &Document, obj: &Object, depth: u8) -> usize {
        let Ok(dict) = obj.as_reference().and_then(|id| doc.get_dictionary(id)) else {
            return 0;
        };
        match dict.get(b"Kids") {
            Ok(Object::Array(kids)) if depth > 0 => kids.iter().map(|k| count(doc, k, depth - 1)).sum(),
            _ => 1,
        }
    }
    let Some(form) = doc
        .catalog()
        .ok()
        .and_then(|c| c.get(b"AcroForm").ok())
        .map(|f| resolve(doc, f))
        .and_then(|f| f.as_dict().ok())
    else {
        return 0;
    };
    match form.get(b"Fields") {
        Ok(Object::Array(fields)) => fields.iter().map(|f| count(doc, f, 32)).sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{build_pdf, form_pdf, page_text, PageSpec};
    use pretty_assertions::assert_eq;

    fn first_page(doc: &Document) -> ObjectId {
        *doc.get_pages().values().next().unwrap()
    }

    #[test]
    fn test_field_drawn_into_page() {
        let mut doc = form_pdf("name", false);
        let page = first_page(&doc);
        let before = page_text(&doc, page).len();
        assert_eq!(field_count(&doc), 1);

        let report = flatten(&mut doc).unwrap();

        assert_eq!(report.flattened, vec!["name".to_string()]);
        assert_eq!(field_count(&doc), 0);
        assert!(doc.catalog().unwrap().get(b"AcroForm").is_err());
        let text = page_text(&doc, page);
        assert!(text.len() > before);
        assert!(text.contains("q 1 0 0 1 50 600 cm /FlatField1 Do Q"), "{}", text);

        let page_dict = doc.get_dictionary(page).unwrap();
        assert!(page_dict.get(b"Annots").is_err());
        let resources = page_dict.get(b"Resources").unwrap().as_dict().unwrap();
        let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
        assert!(xobjects.has(b"FlatField1"));
    }

    #[test]
    fn test_flatten_is_idempotent() {
        let mut doc = form_pdf("name", false);
        flatten(&mut doc).unwrap();
        let objects = doc.objects.clone();
        let report = flatten(&mut doc).unwrap();
        assert_eq!(report, FlattenReport::default());
        assert_eq!(doc.objects, objects);
    }

    #[test]
    fn test_document_without_fields_unchanged() {
        let (mut doc, _) = build_pdf(&[PageSpec::with_images(&["A"])]);
        let objects = doc.objects.clone();
        assert_eq!(flatten(&mut doc).unwrap(), FlattenReport::default());
        assert_eq!(doc.objects, objects);
    }

    #[test]
    fn test_hidden_field_removed_without_drawing() {
        let mut doc = form_pdf("secret", true);
        let page = first_page(&doc);
        let report = flatten(&mut doc).unwrap();
        assert_eq!(report.flattened, vec!["secret".to_string()]);
        assert_eq!(field_count(&doc), 0);
        assert!(!page_text(&doc, page).contains("Do"));
    }

    #[test]
    fn test_field_without_appearance_skipped() {
        let mut doc = form_pdf("empty", false);
        let widget = doc
            .objects
            .iter()
            .find(|(_, o)| matches!(o.as_dict().and_then(|d| d.get(b"Subtype")), Ok(Object::Name(n)) if n == b"Widget"))
            .map(|(id, _)| *id)
            .unwrap();
        doc.get_dictionary_mut(widget).unwrap().remove(b"AP");

        let report = flatten(&mut doc).unwrap();
        assert_eq!(report.skipped, vec!["empty".to_string()]);
        assert!(report.flattened.is_empty());
        assert_eq!(field_count(&doc), 1);
    }

    #[test]
    fn test_placement_honours_form_matrix() {
        let mut doc = form_pdf("rotated", false);
        let appearance = doc
            .objects
            .iter()
            .find(|(_, o)| o.as_stream().is_ok_and(|s| s.dict.has(b"BBox")))
            .map(|(id, _)| *id)
            .unwrap();
        // Quarter turn: the 100x20 box becomes 20 wide and 100 tall
        if let Ok(Object::Stream(stream)) = doc.get_object_mut(appearance) {
            stream.dict.set(
                "Matrix",
                Object::Array([0, 1, -1, 0, 0, 0].into_iter().map(Object::Integer).collect()),
            );
        }
        let page = first_page(&doc);
        flatten(&mut doc).unwrap();
        let text = page_text(&doc, page);
        assert!(text.contains("q 5 0 0 0.2 150 600 cm /FlatField1 Do Q"), "{}", text);
    }
}
