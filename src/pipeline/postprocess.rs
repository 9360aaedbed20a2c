//! Post-processing of produced PDFs: page truncation and stamps.
//!
//! Runs in the worker between validation and delivery, on the file still in
//! the job's workspace. The edited document is written next to the original
//! and renamed over it, so a failed edit never leaves a half-written result.
//!
//! Stamps are drawn after the page's own content, which is wrapped in `q`/`Q`
//! so a page that leaves its graphics state transformed cannot shift them.
//! Coordinates are PDF user-space points from the bottom-left corner.
//!
//! Parsing and rewriting are CPU-bound, so [`apply`] runs in `spawn_blocking`.

use crate::error::ConvertError;
use crate::format::TargetFormat;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

const FONT_NAME: &str = "OcStampF1";
const DEFAULT_TEXT_SIZE: f32 = 10.0;
/// Bound on `Parent` hops when looking for inherited resources.
const MAX_TREE_DEPTH: usize = 64;

/// Edits applied to a produced PDF before delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostProcess {
    /// Keep at most this many leading pages.
    pub max_pages: Option<u32>,
    /// Drawn in order, after truncation.
    pub stamps: Vec<Stamp>,
}

impl PostProcess {
    pub fn is_empty(&self) -> bool {
        self.max_pages.is_none() && self.stamps.is_empty()
    }

    /// Reject options that can never apply, before the job is queued.
    pub fn check(&self, target: TargetFormat) -> Result<(), ConvertError> {
        if self.is_empty() {
            return Ok(());
        }
        if target != TargetFormat::Pdf {
            return Err(ConvertError::invalid_input(
                target.to_string(),
                "page limits and stamps apply to PDF output only",
            ));
        }
        if self.max_pages == Some(0) {
            return Err(ConvertError::invalid_input("max_pages", "must be at least 1"));
        }
        for stamp in &self.stamps {
            if stamp.page == 0 {
                return Err(ConvertError::invalid_input(stamp.to_string(), "pages count from 1"));
            }
            if let Some(max) = self.max_pages {
                if stamp.page > max {
                    return Err(ConvertError::invalid_input(
                        stamp.to_string(),
                        format!("page {} is cut by max_pages {max}", stamp.page),
                    ));
                }
            }
            if let StampContent::Image { path, .. } = &stamp.content {
                if !path.is_file() {
                    return Err(ConvertError::FileNotFound { path: path.clone() });
                }
            }
        }
        Ok(())
    }
}

/// One overlay drawn on one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamp {
    /// 1-based page number.
    pub page: u32,
    pub x: f32,
    pub y: f32,
    pub content: StampContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StampContent {
    /// A line of Helvetica text; `size` in points.
    Text { text: String, size: f32 },
    /// A PNG or JPEG scaled to `width` × `height` points.
    Image {
        path: PathBuf,
        width: f32,
        height: f32,
    },
}

impl Stamp {
    pub fn text(page: u32, x: f32, y: f32, text: impl Into<String>) -> Self {
        Self {
            page,
            x,
            y,
            content: StampContent::Text {
                text: text.into(),
                size: DEFAULT_TEXT_SIZE,
            },
        }
    }

    pub fn image(page: u32, x: f32, y: f32, path: impl Into<PathBuf>, width: f32, height: f32) -> Self {
        Self {
            page,
            x,
            y,
            content: StampContent::Image {
                path: path.into(),
                width,
                height,
            },
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.content {
            StampContent::Text { text, size } => {
                write!(f, "text:{text}@{},{},{},{size}", self.page, self.x, self.y)
            }
            StampContent::Image {
                path,
                width,
                height,
            } => write!(
                f,
                "image:{}@{},{},{},{width},{height}",
                path.display(),
                self.page,
                self.x,
                self.y
            ),
        }
    }
}

/// `text:<TEXT>@<page>,<x>,<y>[,<size>]` or
/// `image:<PATH>@<page>,<x>,<y>,<width>,<height>`.
impl FromStr for Stamp {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| ConvertError::InvalidConfig(format!("stamp '{s}': {reason}"));
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| bad("expected text:... or image:..."))?;
        let (body, place) = rest
            .rsplit_once('@')
            .ok_or_else(|| bad("missing @page,x,y"))?;
        if body.is_empty() {
            return Err(bad("nothing to draw"));
        }
        let numbers = place
            .split(',')
            .map(|n| n.trim().parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| bad("position must be numbers"))?;
        let page = match numbers.first() {
            Some(&p) if p >= 1.0 && p.fract() == 0.0 => p as u32,
            _ => return Err(bad("page must be a whole number from 1")),
        };

        match (kind, numbers.as_slice()) {
            ("text", [_, x, y]) => Ok(Stamp::text(page, *x, *y, body)),
            ("text", [_, x, y, size]) if *size > 0.0 => {
                let mut stamp = Stamp::text(page, *x, *y, body);
                stamp.content = StampContent::Text {
                    text: body.to_string(),
                    size: *size,
                };
                Ok(stamp)
            }
            ("image", [_, x, y, w, h]) if *w > 0.0 && *h > 0.0 => {
                Ok(Stamp::image(page, *x, *y, body, *w, *h))
            }
            ("text", _) => Err(bad("expected @page,x,y[,size]")),
            ("image", _) => Err(bad("expected @page,x,y,width,height")),
            _ => Err(bad("expected text:... or image:...")),
        }
    }
}

/// Apply `post` to the PDF at `path` in place. Returns the page count kept.
pub async fn apply(path: &Path, post: &PostProcess) -> Result<u32, ConvertError> {
    let path = path.to_path_buf();
    let post = post.clone();
    tokio::task::spawn_blocking(move || apply_blocking(&path, &post))
        .await
        .map_err(|e| ConvertError::Internal(format!("post-processing task panicked: {e}")))?
}

fn apply_blocking(path: &Path, post: &PostProcess) -> Result<u32, ConvertError> {
    let mut doc = Document::load(path).map_err(|e| corrupt(format!("cannot parse PDF: {e}")))?;

    let total = doc.get_pages().len() as u32;
    if let Some(max) = post.max_pages {
        if total > max {
            let cut: Vec<u32> = (max + 1..=total).collect();
            doc.delete_pages(&cut);
            doc.prune_objects();
            debug!("kept {max} of {total} pages");
        }
    }

    let pages = doc.get_pages();
    let kept = pages.len() as u32;
    let mut font: Option<ObjectId> = None;
    for (n, stamp) in post.stamps.iter().enumerate() {
        let page_id = *pages.get(&stamp.page).ok_or_else(|| {
            ConvertError::invalid_input(
                stamp.to_string(),
                format!("page {} is beyond the document's {kept} page(s)", stamp.page),
            )
        })?;
        let ops = match &stamp.content {
            StampContent::Text { text, size } => {
                let font_id = *font.get_or_insert_with(|| {
                    doc.add_object(dictionary! {
                        "Type" => "Font",
                        "Subtype" => "Type1",
                        "BaseFont" => "Helvetica",
                        "Encoding" => "WinAnsiEncoding",
                    })
                });
                add_resource(&mut doc, page_id, "Font", FONT_NAME, font_id)?;
                text_ops(stamp.x, stamp.y, *size, text)
            }
            StampContent::Image {
                path: image_path,
                width,
                height,
            } => {
                let image_id = embed_image(&mut doc, image_path)?;
                let name = format!("OcStampIm{n}");
                add_resource(&mut doc, page_id, "XObject", &name, image_id)?;
                image_ops(stamp.x, stamp.y, *width, *height, &name)
            }
        };
        let encoded = Content { operations: ops }
            .encode()
            .map_err(|e| ConvertError::Internal(format!("cannot encode stamp: {e}")))?;
        overlay(&mut doc, page_id, encoded)?;
    }

    save_over(&mut doc, path)?;
    Ok(kept)
}

fn corrupt(detail: String) -> ConvertError {
    ConvertError::CorruptOutput {
        format: TargetFormat::Pdf,
        detail,
    }
}

fn text_ops(x: f32, y: f32, size: f32, text: &str) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![FONT_NAME.into(), size.into()]),
        Operation::new("Td", vec![x.into(), y.into()]),
        Operation::new("Tj", vec![Object::string_literal(win_ansi(text))]),
        Operation::new("ET", vec![]),
        Operation::new("Q", vec![]),
    ]
}

fn image_ops(x: f32, y: f32, width: f32, height: f32, name: &str) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![width.into(), 0.into(), 0.into(), height.into(), x.into(), y.into()],
        ),
        Operation::new("Do", vec![name.into()]),
        Operation::new("Q", vec![]),
    ]
}

/// Latin-1 maps onto WinAnsi unchanged; anything else becomes `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c as u32 {
            0x20..=0x7E | 0xA0..=0xFF => c as u32 as u8,
            _ => b'?',
        })
        .collect()
}

/// Wrap the page's content in `q`/`Q` and append `stamp` after it.
fn overlay(doc: &mut Document, page_id: ObjectId, stamp: Vec<u8>) -> Result<(), ConvertError> {
    let existing: Vec<Object> = match doc.get_dictionary(page_id).map(|p| p.get(b"Contents")) {
        Ok(Ok(Object::Reference(id))) => match doc.get_object(*id) {
            Ok(Object::Array(arr)) => arr.clone(),
            _ => vec![Object::Reference(*id)],
        },
        Ok(Ok(Object::Array(arr))) => arr.clone(),
        _ => Vec::new(),
    };

    let open = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let mut close = b"\nQ\n".to_vec();
    close.extend_from_slice(&stamp);
    let mut close = Stream::new(Dictionary::new(), close);
    let _ = close.compress();
    let close = doc.add_object(close);

    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(open));
    contents.extend(existing);
    contents.push(Object::Reference(close));
    doc.get_dictionary_mut(page_id)
        .map_err(|e| corrupt(format!("page object: {e}")))?
        .set("Contents", contents);
    Ok(())
}

/// Give the page its own copy of its effective resources with `name`
/// added under `category`.
fn add_resource(
    doc: &mut Document,
    page_id: ObjectId,
    category: &str,
    name: &str,
    id: ObjectId,
) -> Result<(), ConvertError> {
    let mut resources = effective_resources(doc, page_id);
    let mut entries = resources
        .get(category.as_bytes())
        .ok()
        .and_then(|o| doc.dereference(o).ok())
        .and_then(|(_, o)| o.as_dict().ok())
        .cloned()
        .unwrap_or_default();
    entries.set(name, id);
    resources.set(category, entries);
    doc.get_dictionary_mut(page_id)
        .map_err(|e| corrupt(format!("page object: {e}")))?
        .set("Resources", resources);
    Ok(())
}

/// The page's `Resources`, or the nearest ancestor's.
fn effective_resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    let mut node = doc.get_dictionary(page_id).ok();
    for _ in 0..MAX_TREE_DEPTH {
        let Some(dict) = node else { break };
        if let Ok(res) = dict.get(b"Resources") {
            if let Ok((_, Object::Dictionary(d))) = doc.dereference(res) {
                return d.clone();
            }
        }
        node = dict
            .get(b"Parent")
            .and_then(Object::as_reference)
            .and_then(|parent| doc.get_dictionary(parent))
            .ok();
    }
    Dictionary::new()
}

/// Add `path` as an RGB image XObject, with a soft mask when it has alpha.
fn embed_image(doc: &mut Document, path: &Path) -> Result<ObjectId, ConvertError> {
    let img = image::open(path)
        .map_err(|e| ConvertError::invalid_input(path.display().to_string(), e.to_string()))?;
    let (width, height) = (i64::from(img.width()), i64::from(img.height()));

    let mut dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => width,
        "Height" => height,
        "ColorSpace" => "DeviceRGB",
        "BitsPerComponent" => 8,
    };
    if img.color().has_alpha() {
        let alpha: Vec<u8> = img.to_rgba8().pixels().map(|p| p.0[3]).collect();
        let mut mask = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width,
                "Height" => height,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            alpha,
        );
        let _ = mask.compress();
        dict.set("SMask", doc.add_object(mask));
    }
    let mut stream = Stream::new(dict, img.to_rgb8().into_raw());
    let _ = stream.compress();
    Ok(doc.add_object(stream))
}

fn save_over(doc: &mut Document, path: &Path) -> Result<(), ConvertError> {
    let tmp = path.with_extension("post.pdf");
    let written = doc.save(&tmp).and_then(|_| std::fs::rename(&tmp, path));
    if let Err(source) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(ConvertError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// A minimal `pages`-page document with shared, inherited resources.
    pub(crate) fn write_pdf(path: &Path, pages: u32) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids: Vec<Object> = Vec::new();
        for n in 1..=pages {
            let body = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(format!("page {n}"))]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(Dictionary::new(), body.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => i64::from(pages),
                "Resources" => resources_id,
                "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(595), Object::Integer(842)],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    fn page_text(doc: &Document, page: u32) -> String {
        let id = doc.get_pages()[&page];
        String::from_utf8_lossy(&doc.get_page_content(id).unwrap()).into_owned()
    }

    fn page_resources(doc: &Document, page: u32) -> Dictionary {
        let id = doc.get_pages()[&page];
        effective_resources(doc, id)
    }

    #[tokio::test]
    async fn truncates_to_max_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("report.pdf");
        write_pdf(&pdf, 25);

        let post = PostProcess {
            max_pages: Some(19),
            ..PostProcess::default()
        };
        assert_eq!(apply(&pdf, &post).await.unwrap(), 19);

        let doc = Document::load(&pdf).unwrap();
        assert_eq!(doc.get_pages().len(), 19);
        assert!(page_text(&doc, 19).contains("page 19"));
        assert!(crate::pipeline::validate::validate(&pdf, TargetFormat::Pdf).is_ok());
    }

    #[tokio::test]
    async fn short_document_is_left_whole() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("memo.pdf");
        write_pdf(&pdf, 3);
        let post = PostProcess {
            max_pages: Some(19),
            ..PostProcess::default()
        };
        assert_eq!(apply(&pdf, &post).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn text_stamp_is_drawn_over_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("contract.pdf");
        write_pdf(&pdf, 2);

        let post = PostProcess {
            max_pages: None,
            stamps: vec![Stamp::text(2, 230.0, 162.0, "Signé 2024-05-01")],
        };
        apply(&pdf, &post).await.unwrap();

        let doc = Document::load(&pdf).unwrap();
        let text = page_text(&doc, 2);
        let body = text.find("page 2").unwrap();
        let stamp = text.find("OcStampF1").unwrap();
        assert!(text.starts_with('q'));
        assert!(body < stamp, "stamp drawn after the page body");
        assert!(!page_text(&doc, 1).contains("OcStampF1"));

        // Page 2 keeps the inherited font and gains the stamp font.
        let fonts = page_resources(&doc, 2);
        let fonts = fonts.get(b"Font").unwrap().as_dict().unwrap();
        assert!(fonts.has(b"F1"));
        assert!(fonts.has(FONT_NAME.as_bytes()));
    }

    #[tokio::test]
    async fn image_stamp_embeds_rgb_with_soft_mask() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("contract.pdf");
        write_pdf(&pdf, 1);
        let png = dir.path().join("signature.png");
        image::RgbaImage::from_pixel(4, 2, image::Rgba([10, 20, 30, 128]))
            .save(&png)
            .unwrap();

        let post = PostProcess {
            max_pages: None,
            stamps: vec![Stamp::image(1, 250.0, 293.0, &png, 120.0, 30.0)],
        };
        apply(&pdf, &post).await.unwrap();

        let doc = Document::load(&pdf).unwrap();
        assert!(page_text(&doc, 1).contains("/OcStampIm0 Do"));
        let resources = page_resources(&doc, 1);
        let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
        let image_id = xobjects.get(b"OcStampIm0").unwrap().as_reference().unwrap();
        let image = doc.get_object(image_id).unwrap().as_stream().unwrap();
        assert_eq!(image.dict.get(b"Width").unwrap().as_i64().unwrap(), 4);
        assert_eq!(image.dict.get(b"ColorSpace").unwrap().as_name().unwrap(), b"DeviceRGB");
        assert!(image.dict.has(b"SMask"));
    }

    #[tokio::test]
    async fn stamp_past_the_last_page_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("memo.pdf");
        write_pdf(&pdf, 1);
        let before = std::fs::read(&pdf).unwrap();

        let post = PostProcess {
            max_pages: None,
            stamps: vec![Stamp::text(3, 10.0, 10.0, "late")],
        };
        let err = apply(&pdf, &post).await.unwrap_err();
        assert_matches!(err, ConvertError::InvalidInput { .. });
        assert_eq!(std::fs::read(&pdf).unwrap(), before, "original untouched");
    }

    #[tokio::test]
    async fn unparsable_pdf_is_corrupt_output() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("broken.pdf");
        std::fs::write(&pdf, b"%PDF-1.7 not really\n%%EOF\n").unwrap();
        let post = PostProcess {
            max_pages: Some(1),
            ..PostProcess::default()
        };
        assert_matches!(
            apply(&pdf, &post).await,
            Err(ConvertError::CorruptOutput { format: TargetFormat::Pdf, .. })
        );
    }

    #[test]
    fn parses_stamp_arguments() {
        assert_eq!(
            "text:Approved @ HQ@2,230,162".parse::<Stamp>().unwrap(),
            Stamp::text(2, 230.0, 162.0, "Approved @ HQ")
        );
        let sized: Stamp = "text:Draft@1,10,20,18".parse().unwrap();
        assert_matches!(sized.content, StampContent::Text { size, .. } if size == 18.0);
        assert_eq!(
            "image:sig.png@1,250,293,120,30".parse::<Stamp>().unwrap(),
            Stamp::image(1, 250.0, 293.0, "sig.png", 120.0, 30.0)
        );

        for bad in [
            "Draft@1,10,20",
            "text:Draft",
            "text:@1,2,3",
            "text:Draft@0,10,20",
            "text:Draft@1.5,10,20",
            "image:sig.png@1,250,293",
            "image:sig.png@1,250,293,0,30",
            "video:x@1,2,3",
        ] {
            assert_matches!(bad.parse::<Stamp>(), Err(ConvertError::InvalidConfig(_)), "{bad}");
        }
    }

    #[test]
    fn check_rejects_options_that_cannot_apply() {
        let stamp = PostProcess {
            max_pages: None,
            stamps: vec![Stamp::text(1, 0.0, 0.0, "x")],
        };
        assert!(stamp.check(TargetFormat::Pdf).is_ok());
        assert_matches!(stamp.check(TargetFormat::Docx), Err(ConvertError::InvalidInput { .. }));
        assert!(PostProcess::default().check(TargetFormat::Docx).is_ok());

        let zero = PostProcess {
            max_pages: Some(0),
            ..PostProcess::default()
        };
        assert!(zero.check(TargetFormat::Pdf).is_err());

        let cut = PostProcess {
            max_pages: Some(1),
            stamps: vec![Stamp::text(2, 0.0, 0.0, "x")],
        };
        assert!(cut.check(TargetFormat::Pdf).is_err());

        let missing = PostProcess {
            max_pages: None,
            stamps: vec![Stamp::image(1, 0.0, 0.0, "/no/such/sig.png", 10.0, 10.0)],
        };
        assert_matches!(missing.check(TargetFormat::Pdf), Err(ConvertError::FileNotFound { .. }));
    }

    #[test]
    fn win_ansi_keeps_latin1() {
        assert_eq!(win_ansi("Größe"), b"Gr\xf6\xdfe");
        assert_eq!(win_ansi("会议"), b"??");
    }
}
