//! Small in-memory documents for unit tests.

use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::HashMap;

/// One page of a test document; named images are shared across pages
pub struct PageSpec {
    pub images: Vec<&'static str>,
}

impl PageSpec {
    pub fn with_images(images: &[&'static str]) -> Self {
        PageSpec {
            images: images.to_vec(),
        }
    }
}

/// Unfiltered 16x16 RGB gradient
pub fn image_stream(seed: u8) -> Stream {
    let mut pixels = Vec::with_capacity(16 * 16 * 3);
    for y in 0..16u8 {
        for x in 0..16u8 {
            pixels.extend_from_slice(&[x * 16, y * 16, seed]);
        }
    }
    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"XObject".to_vec()));
    dict.set("Subtype", Object::Name(b"Image".to_vec()));
    dict.set("Width", Object::Integer(16));
    dict.set("Height", Object::Integer(16));
    dict.set("ColorSpace", Object::Name(b"DeviceRGB".to_vec()));
    dict.set("BitsPerComponent", Object::Integer(8));
    Stream::new(dict, pixels)
}

fn media_box() -> Object {
    Object::Array(vec![
        Object::Integer(0),
        Object::Integer(0),
        Object::Integer(612),
        Object::Integer(792),
    ])
}

/// Finish a document whose page objects already exist
fn finish(doc: &mut Document, pages_id: ObjectId, page_ids: Vec<ObjectId>) {
    let mut pages = Dictionary::new();
    pages.set("Type", Object::Name(b"Pages".to_vec()));
    pages.set("Count", Object::Integer(page_ids.len() as i64));
    pages.set(
        "Kids",
        Object::Array(page_ids.into_iter().map(Object::Reference).collect()),
    );
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(catalog);
    doc.trailer.set("Root", Object::Reference(catalog_id));
}

/// Document whose pages draw the given images, with the image ids by name
pub fn build_pdf(pages: &[PageSpec]) -> (Document, HashMap<String, ObjectId>) {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut images: HashMap<String, ObjectId> = HashMap::new();
    let mut page_ids = Vec::new();

    for page_spec in pages {
        let mut xobjects = Dictionary::new();
        let mut content = String::new();
        for name in &page_spec.images {
            let id = match images.get(*name) {
                Some(id) => *id,
                None => {
                    let seed = images.len() as u8 * 40;
                    let id = doc.add_object(image_stream(seed));
                    images.insert(name.to_string(), id);
                    id
                }
            };
            xobjects.set(name.as_bytes().to_vec(), Object::Reference(id));
            content.push_str(&format!("q 100 0 0 100 0 0 cm /{} Do Q\n", name));
        }
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));

        let mut resources = Dictionary::new();
        resources.set("XObject", Object::Dictionary(xobjects));
        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        page.set("MediaBox", media_box());
        page.set("Resources", Object::Dictionary(resources));
        page.set("Contents", Object::Reference(content_id));
        page_ids.push(doc.add_object(page));
    }

    finish(&mut doc, pages_id, page_ids);
    (doc, images)
}

/// Document with `num_pages` text pages labelled `{prefix}-Page-{n}`.
/// All pages share one font object, and MediaBox/Resources are inherited
/// from the page tree root.
pub fn create_test_pdf(num_pages: u32, prefix: &str) -> Document {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut font = Dictionary::new();
    font.set("Type", Object::Name(b"Font".to_vec()));
    font.set("Subtype", Object::Name(b"Type1".to_vec()));
    font.set("BaseFont", Object::Name(b"Helvetica".to_vec()));
    let font_id = doc.add_object(font);

    let mut page_ids = Vec::new();
    for page_num in 0..num_pages {
        let content = format!(
            "BT /F1 12 Tf 50 700 Td ({}-Page-{}) Tj ET",
            prefix,
            page_num + 1
        );
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));
        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        page.set("Contents", Object::Reference(content_id));
        page_ids.push(doc.add_object(page));
    }

    finish(&mut doc, pages_id, page_ids);
    if let Ok(Object::Dictionary(pages)) = doc.get_object_mut(pages_id) {
        let mut fonts = Dictionary::new();
        fonts.set("F1", Object::Reference(font_id));
        let mut resources = Dictionary::new();
        resources.set("Font", Object::Dictionary(fonts));
        pages.set("Resources", Object::Dictionary(resources));
        pages.set("MediaBox", media_box());
    }
    doc
}

/// Text of a page's content stream
pub fn page_text(doc: &Document, page_id: ObjectId) -> String {
    let content = doc.get_page_content(page_id).unwrap_or_default();
    String::from_utf8_lossy(&content).into_owned()
}

/// One-page document with a single text field widget named `field_name`
pub fn form_pdf(field_name: &str, hidden: bool) -> Document {
    let (mut doc, _) = build_pdf(&[PageSpec::with_images(&[])]);
    let page_id = doc.page_iter().next().unwrap_or((0, 0));

    let mut ap_dict = Dictionary::new();
    ap_dict.set("Type", Object::Name(b"XObject".to_vec()));
    ap_dict.set("Subtype", Object::Name(b"Form".to_vec()));
    ap_dict.set(
        "BBox",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(100),
            Object::Integer(20),
        ]),
    );
    let appearance = Stream::new(ap_dict, b"BT /Helv 10 Tf 2 5 Td (Jane) Tj ET".to_vec());
    let appearance_id = doc.add_object(appearance);

    let mut normal = Dictionary::new();
    normal.set("N", Object::Reference(appearance_id));
    let mut widget = Dictionary::new();
    widget.set("Type", Object::Name(b"Annot".to_vec()));
    widget.set("Subtype", Object::Name(b"Widget".to_vec()));
    widget.set("FT", Object::Name(b"Tx".to_vec()));
    widget.set(
        "T",
        Object::String(field_name.as_bytes().to_vec(), lopdf::StringFormat::Literal),
    );
    widget.set(
        "Rect",
        Object::Array(vec![
            Object::Integer(50),
            Object::Integer(600),
            Object::Integer(150),
            Object::Integer(620),
        ]),
    );
    widget.set("AP", Object::Dictionary(normal));
    widget.set("P", Object::Reference(page_id));
    if hidden {
        widget.set("F", Object::Integer(2));
    }
    let widget_id = doc.add_object(widget);

    if let Ok(Object::Dictionary(page)) = doc.get_object_mut(page_id) {
        page.set("Annots", Object::Array(vec![Object::Reference(widget_id)]));
    }

    let mut acro_form = Dictionary::new();
    acro_form.set("Fields", Object::Array(vec![Object::Reference(widget_id)]));
    let acro_form_id = doc.add_object(acro_form);
    if let Ok(catalog) = doc.catalog_mut() {
        catalog.set("AcroForm", Object::Reference(acro_form_id));
    }
    doc
}
