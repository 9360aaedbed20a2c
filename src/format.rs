//! Source and target document formats.
//!
//! Office engines happily accept a file with the wrong extension and then
//! either guess, hang, or emit an empty document. Everything that can be
//! decided from the first few kilobytes of a file is therefore decided here,
//! before a job is queued:
//!
//! * the concrete [`SourceFormat`] (declared, or detected from extension and
//!   magic bytes),
//! * whether the target is reachable from that source ([`DocumentFamily`]),
//! * the engine filter and output signature for every [`TargetFormat`].

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ZIP local-file-header magic (OOXML and ODF containers).
pub const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
/// OLE2 compound-document magic (legacy .doc/.xls/.ppt).
pub const OLE2_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
/// PDF header magic.
pub const PDF_MAGIC: &[u8] = b"%PDF-";
/// RTF header magic.
pub const RTF_MAGIC: &[u8] = b"{\\rtf";
/// PDF end-of-file marker.
pub const PDF_EOF: &[u8] = b"%%EOF";
/// ZIP end-of-central-directory record signature.
pub const ZIP_EOCD_MAGIC: &[u8] = b"PK\x05\x06";

/// Number of leading bytes inspected by [`sniff`].
pub const SNIFF_LEN: usize = 64 * 1024;

/// Broad document family; conversions never cross families except to PDF/HTML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFamily {
    Text,
    Spreadsheet,
    Presentation,
}

impl fmt::Display for DocumentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentFamily::Text => "text document",
            DocumentFamily::Spreadsheet => "spreadsheet",
            DocumentFamily::Presentation => "presentation",
        })
    }
}

// ── Target formats ───────────────────────────────────────────────────────

/// Output formats the pipeline can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Pdf,
    Docx,
    Odt,
    Rtf,
    Txt,
    Html,
    Xlsx,
    Ods,
    Csv,
    Pptx,
    Odp,
}

impl TargetFormat {
    /// Every target format, in display order.
    pub const ALL: [TargetFormat; 11] = [
        TargetFormat::Pdf,
        TargetFormat::Docx,
        TargetFormat::Odt,
        TargetFormat::Rtf,
        TargetFormat::Txt,
        TargetFormat::Html,
        TargetFormat::Xlsx,
        TargetFormat::Ods,
        TargetFormat::Csv,
        TargetFormat::Pptx,
        TargetFormat::Odp,
    ];

    /// File extension written by the engine (without the dot).
    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Pdf => "pdf",
            TargetFormat::Docx => "docx",
            TargetFormat::Odt => "odt",
            TargetFormat::Rtf => "rtf",
            TargetFormat::Txt => "txt",
            TargetFormat::Html => "html",
            TargetFormat::Xlsx => "xlsx",
            TargetFormat::Ods => "ods",
            TargetFormat::Csv => "csv",
            TargetFormat::Pptx => "pptx",
            TargetFormat::Odp => "odp",
        }
    }

    /// IANA media type of the produced file.
    pub fn mime_type(self) -> &'static str {
        match self {
            TargetFormat::Pdf => "application/pdf",
            TargetFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            TargetFormat::Odt => "application/vnd.oasis.opendocument.text",
            TargetFormat::Rtf => "application/rtf",
            TargetFormat::Txt => "text/plain",
            TargetFormat::Html => "text/html",
            TargetFormat::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            TargetFormat::Ods => "application/vnd.oasis.opendocument.spreadsheet",
            TargetFormat::Csv => "text/csv",
            TargetFormat::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            TargetFormat::Odp => "application/vnd.oasis.opendocument.presentation",
        }
    }

    /// Argument for LibreOffice's `--convert-to`.
    ///
    /// Where the extension alone is ambiguous (txt, csv) or LibreOffice picks a
    /// legacy filter by default, the export filter is named explicitly.
    pub fn libreoffice_filter(self) -> &'static str {
        match self {
            TargetFormat::Pdf => "pdf",
            TargetFormat::Docx => "docx:MS Word 2007 XML",
            TargetFormat::Odt => "odt",
            TargetFormat::Rtf => "rtf",
            TargetFormat::Txt => "txt:Text (encoded):UTF8",
            TargetFormat::Html => "html",
            TargetFormat::Xlsx => "xlsx:Calc MS Excel 2007 XML",
            TargetFormat::Ods => "ods",
            TargetFormat::Csv => "csv:Text - txt - csv (StarCalc):44,34,76,1",
            TargetFormat::Pptx => "pptx:Impress MS PowerPoint 2007 XML",
            TargetFormat::Odp => "odp",
        }
    }

    /// Family this target belongs to; `None` for family-independent targets.
    pub fn family(self) -> Option<DocumentFamily> {
        match self {
            TargetFormat::Pdf | TargetFormat::Html => None,
            TargetFormat::Docx | TargetFormat::Odt | TargetFormat::Rtf | TargetFormat::Txt => {
                Some(DocumentFamily::Text)
            }
            TargetFormat::Xlsx | TargetFormat::Ods | TargetFormat::Csv => {
                Some(DocumentFamily::Spreadsheet)
            }
            TargetFormat::Pptx | TargetFormat::Odp => Some(DocumentFamily::Presentation),
        }
    }

    /// Mimetype stored in the first ZIP entry of ODF packages.
    pub(crate) fn odf_mimetype(self) -> Option<&'static str> {
        match self {
            TargetFormat::Odt | TargetFormat::Ods | TargetFormat::Odp => Some(self.mime_type()),
            _ => None,
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TargetFormat {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().trim_start_matches('.').to_ascii_lowercase();
        let norm = match norm.as_str() {
            "htm" => "html",
            "text" => "txt",
            other => other,
        };
        TargetFormat::ALL
            .into_iter()
            .find(|t| t.extension() == norm)
            .ok_or_else(|| ConvertError::invalid_input(s, "unknown target format"))
    }
}

// ── Source formats ───────────────────────────────────────────────────────

/// Input formats accepted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Detect from the file extension and magic bytes. (default)
    #[default]
    Auto,
    Doc,
    Docx,
    Odt,
    Rtf,
    Txt,
    Html,
    Xls,
    Xlsx,
    Ods,
    Csv,
    Ppt,
    Pptx,
    Odp,
}

impl SourceFormat {
    const CONCRETE: [SourceFormat; 13] = [
        SourceFormat::Doc,
        SourceFormat::Docx,
        SourceFormat::Odt,
        SourceFormat::Rtf,
        SourceFormat::Txt,
        SourceFormat::Html,
        SourceFormat::Xls,
        SourceFormat::Xlsx,
        SourceFormat::Ods,
        SourceFormat::Csv,
        SourceFormat::Ppt,
        SourceFormat::Pptx,
        SourceFormat::Odp,
    ];

    /// Canonical extension; `None` for [`SourceFormat::Auto`].
    pub fn extension(self) -> Option<&'static str> {
        Some(match self {
            SourceFormat::Auto => return None,
            SourceFormat::Doc => "doc",
            SourceFormat::Docx => "docx",
            SourceFormat::Odt => "odt",
            SourceFormat::Rtf => "rtf",
            SourceFormat::Txt => "txt",
            SourceFormat::Html => "html",
            SourceFormat::Xls => "xls",
            SourceFormat::Xlsx => "xlsx",
            SourceFormat::Ods => "ods",
            SourceFormat::Csv => "csv",
            SourceFormat::Ppt => "ppt",
            SourceFormat::Pptx => "pptx",
            SourceFormat::Odp => "odp",
        })
    }

    /// Look up a source format by file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        let ext = match ext.as_str() {
            "htm" | "xhtml" => "html",
            "text" => "txt",
            // Macro-enabled and template variants open with the same importer.
            "docm" | "dotx" => "docx",
            "xlsm" | "xltx" => "xlsx",
            "pptm" | "potx" => "pptx",
            "dot" => "doc",
            "xlt" => "xls",
            "pot" | "pps" => "ppt",
            other => other,
        };
        Self::CONCRETE
            .into_iter()
            .find(|f| f.extension() == Some(ext))
    }

    /// Document family; `None` for [`SourceFormat::Auto`].
    pub fn family(self) -> Option<DocumentFamily> {
        match self {
            SourceFormat::Auto => None,
            SourceFormat::Doc
            | SourceFormat::Docx
            | SourceFormat::Odt
            | SourceFormat::Rtf
            | SourceFormat::Txt
            | SourceFormat::Html => Some(DocumentFamily::Text),
            SourceFormat::Xls | SourceFormat::Xlsx | SourceFormat::Ods | SourceFormat::Csv => {
                Some(DocumentFamily::Spreadsheet)
            }
            SourceFormat::Ppt | SourceFormat::Pptx | SourceFormat::Odp => {
                Some(DocumentFamily::Presentation)
            }
        }
    }

    fn container(self) -> Container {
        match self {
            SourceFormat::Docx
            | SourceFormat::Xlsx
            | SourceFormat::Pptx
            | SourceFormat::Odt
            | SourceFormat::Ods
            | SourceFormat::Odp => Container::Zip,
            SourceFormat::Doc | SourceFormat::Xls | SourceFormat::Ppt => Container::Ole2,
            _ => Container::Plain,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension().unwrap_or("auto"))
    }
}

impl FromStr for SourceFormat {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(SourceFormat::Auto);
        }
        SourceFormat::from_extension(s.trim())
            .ok_or_else(|| ConvertError::invalid_input(s, "unknown source format"))
    }
}

// ── Detection ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Zip,
    Ole2,
    Plain,
}

/// Read up to [`SNIFF_LEN`] leading bytes of a file.
pub fn sniff(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let file = std::fs::File::open(path)?;
    let mut head = Vec::with_capacity(4096);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok(head)
}

/// Bytes from the end of a file inspected by [`tail`]: a ZIP
/// end-of-central-directory record plus the longest archive comment.
pub const TAIL_LEN: usize = 22 + 0xFFFF;

/// Read up to [`TAIL_LEN`] trailing bytes of a file.
pub fn tail(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(TAIL_LEN as u64)))?;
    let mut tail = Vec::with_capacity(4096);
    file.read_to_end(&mut tail)?;
    Ok(tail)
}

/// Resolve the concrete source format of a file.
///
/// * `declared`: what the caller said the file is ([`SourceFormat::Auto`] to detect)
/// * `file_name`: used for extension-based detection
/// * `head`: leading bytes of the file (see [`sniff`])
///
/// A declared or extension-derived format whose container contradicts the
/// magic bytes (a `.docx` that is not a ZIP file) is rejected: handing such a
/// file to the engine is the classic way to make it hang.
pub fn detect_source_format(
    declared: SourceFormat,
    file_name: Option<&str>,
    head: &[u8],
) -> Result<SourceFormat, ConvertError> {
    let label = file_name.unwrap_or("<input>");

    if head.starts_with(PDF_MAGIC) {
        return Err(ConvertError::invalid_input(
            label,
            "input is already a PDF; PDF import is not supported",
        ));
    }

    let from_name = file_name
        .and_then(|n| std::path::Path::new(n).extension())
        .and_then(|e| e.to_str())
        .and_then(SourceFormat::from_extension);

    let format = match declared {
        SourceFormat::Auto => match from_name.or_else(|| sniff_format(head)) {
            Some(f) => f,
            None => {
                return Err(ConvertError::invalid_input(
                    label,
                    "could not detect the document format; declare it explicitly",
                ))
            }
        },
        explicit => explicit,
    };

    match format.container() {
        Container::Zip if !head.starts_with(ZIP_MAGIC) => Err(ConvertError::invalid_input(
            label,
            format!("{format} files are ZIP packages but the content is not"),
        )),
        Container::Ole2 if !head.starts_with(OLE2_MAGIC) && !head.starts_with(RTF_MAGIC) => {
            // Legacy .doc files saved by other tools are often RTF or HTML;
            // the engine copes with those, so only note it.
            tracing::debug!("{label}: {format} without an OLE2 header, passing through");
            Ok(format)
        }
        _ => Ok(format),
    }
}

/// Guess a format from content alone.
fn sniff_format(head: &[u8]) -> Option<SourceFormat> {
    if head.starts_with(ZIP_MAGIC) {
        if let Some(odf) = odf_mimetype(head) {
            return match odf {
                "application/vnd.oasis.opendocument.text" => Some(SourceFormat::Odt),
                "application/vnd.oasis.opendocument.spreadsheet" => Some(SourceFormat::Ods),
                "application/vnd.oasis.opendocument.presentation" => Some(SourceFormat::Odp),
                _ => None,
            };
        }
        // OOXML part names appear in the local file headers near the start.
        if contains(head, b"word/") {
            return Some(SourceFormat::Docx);
        }
        if contains(head, b"xl/") {
            return Some(SourceFormat::Xlsx);
        }
        if contains(head, b"ppt/") {
            return Some(SourceFormat::Pptx);
        }
        return None;
    }
    if head.starts_with(RTF_MAGIC) {
        return Some(SourceFormat::Rtf);
    }
    // OLE2 is shared by .doc/.xls/.ppt and cannot be told apart cheaply.
    if head.starts_with(OLE2_MAGIC) {
        return None;
    }
    let text = std::str::from_utf8(head).ok()?;
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.get(..trimmed.len().min(64))?.to_ascii_lowercase();
    if lower.starts_with("<!doctype html") || lower.starts_with("<html") {
        Some(SourceFormat::Html)
    } else {
        Some(SourceFormat::Txt)
    }
}

/// Extract the ODF `mimetype` entry if it is stored first and uncompressed,
/// as the ODF specification requires.
pub(crate) fn odf_mimetype(head: &[u8]) -> Option<&str> {
    // Local file header: 30 fixed bytes, then the name, then the data.
    if head.len() < 30 || !head.starts_with(ZIP_MAGIC) {
        return None;
    }
    let compression = u16::from_le_bytes([head[8], head[9]]);
    let data_len = u32::from_le_bytes([head[18], head[19], head[20], head[21]]) as usize;
    let name_len = u16::from_le_bytes([head[26], head[27]]) as usize;
    let extra_len = u16::from_le_bytes([head[28], head[29]]) as usize;

    let name = head.get(30..30 + name_len)?;
    if name != b"mimetype" || compression != 0 {
        return None;
    }
    let start = 30 + name_len + extra_len;
    let data = head.get(start..start + data_len)?;
    std::str::from_utf8(data).ok()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Reject conversions that cross document families.
pub fn check_compatible(source: SourceFormat, target: TargetFormat) -> Result<(), ConvertError> {
    match (source.family(), target.family()) {
        (_, None) => Ok(()),
        (Some(s), Some(t)) if s == t => Ok(()),
        (Some(s), Some(t)) => Err(ConvertError::IncompatibleFormats {
            source_format: source.to_string(),
            target,
            reason: format!("a {s} cannot be exported as a {t}"),
        }),
        (None, Some(_)) => Err(ConvertError::IncompatibleFormats {
            source_format: source.to_string(),
            target,
            reason: "source format must be resolved before checking compatibility".into(),
        }),
    }
}
