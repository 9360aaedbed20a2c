//! Result validation: the engine's exit code is not proof of a usable file.
//!
//! A conversion counts as successful only when the output is non-empty and
//! carries the signature of the requested format. Container formats must
//! also be complete: an engine killed mid-write leaves a file with a valid
//! header and no trailer.
//!
//! | Target | Check |
//! |--------|-------|
//! | pdf | starts with `%PDF-`, `%%EOF` within the last 1 KiB |
//! | docx, xlsx, pptx | ZIP local file header `PK\x03\x04` and end-of-central-directory record |
//! | odt, ods, odp | as OOXML, and the first stored entry is `mimetype` with the matching ODF type |
//! | rtf | starts with `{\rtf` |
//! | html | first non-whitespace character after an optional BOM is `<` |
//! | txt, csv | any non-empty content |

use crate::error::ConvertError;
use crate::format::{self, TargetFormat, PDF_EOF, PDF_MAGIC, RTF_MAGIC, ZIP_EOCD_MAGIC, ZIP_MAGIC};
use std::path::Path;

/// Readers accept `%%EOF` this far from the end of a PDF.
const PDF_EOF_WINDOW: usize = 1024;

/// The check a valid output passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub description: &'static str,
    pub size_bytes: u64,
}

/// Validate the file at `path` as a `expected` document.
pub fn validate(path: &Path, expected: TargetFormat) -> Result<Signature, ConvertError> {
    let corrupt = |detail: String| ConvertError::CorruptOutput {
        format: expected,
        detail,
    };

    let meta = std::fs::metadata(path)
        .map_err(|e| corrupt(format!("cannot stat {}: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(corrupt(format!("{} is not a regular file", path.display())));
    }
    let read_err = |e: std::io::Error| corrupt(format!("cannot read {}: {e}", path.display()));
    let head = format::sniff(path).map_err(read_err)?;
    let tail = format::tail(path).map_err(read_err)?;

    check_signature(&head, &tail, meta.len(), expected)
        .map(|description| Signature {
            description,
            size_bytes: meta.len(),
        })
        .map_err(corrupt)
}

/// Check leading and trailing bytes against the expected signature.
pub fn check_signature(
    head: &[u8],
    tail: &[u8],
    size: u64,
    expected: TargetFormat,
) -> Result<&'static str, String> {
    if size == 0 || head.is_empty() {
        return Err("output file is empty".into());
    }

    match expected {
        TargetFormat::Pdf => {
            require_prefix(head, PDF_MAGIC, "PDF header (%PDF-)")?;
            let window = &tail[tail.len().saturating_sub(PDF_EOF_WINDOW)..];
            require_within(window, PDF_EOF, "PDF is truncated: no %%EOF marker at the end")?;
            Ok("PDF header and trailer")
        }
        TargetFormat::Rtf => require_prefix(head, RTF_MAGIC, "RTF header ({\\rtf)"),
        TargetFormat::Docx | TargetFormat::Xlsx | TargetFormat::Pptx => {
            require_prefix(head, ZIP_MAGIC, "OOXML package (ZIP)")?;
            require_zip_trailer(tail)?;
            Ok("OOXML package (ZIP)")
        }
        TargetFormat::Odt | TargetFormat::Ods | TargetFormat::Odp => {
            require_prefix(head, ZIP_MAGIC, "ODF package (ZIP)")?;
            require_zip_trailer(tail)?;
            let want = expected.odf_mimetype().unwrap_or_default();
            match format::odf_mimetype(head) {
                Some(found) if found == want => Ok("ODF package (ZIP + mimetype)"),
                Some(found) => Err(format!("ODF mimetype is '{found}', expected '{want}'")),
                None => Err("ODF package has no leading stored mimetype entry".into()),
            }
        }
        TargetFormat::Html => {
            let body = head.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(head);
            match body.iter().find(|b| !b.is_ascii_whitespace()) {
                Some(b'<') => Ok("HTML markup"),
                Some(_) => Err("HTML output does not start with markup".into()),
                None => Err("HTML output contains only whitespace".into()),
            }
        }
        TargetFormat::Txt => Ok("non-empty text"),
        TargetFormat::Csv => Ok("non-empty CSV"),
    }
}

fn require_within(haystack: &[u8], needle: &[u8], missing: &str) -> Result<(), String> {
    if haystack.windows(needle.len()).any(|w| w == needle) {
        Ok(())
    } else {
        Err(missing.to_string())
    }
}

fn require_zip_trailer(tail: &[u8]) -> Result<(), String> {
    require_within(
        tail,
        ZIP_EOCD_MAGIC,
        "ZIP package is truncated: no end-of-central-directory record",
    )
}

fn require_prefix(
    head: &[u8],
    magic: &[u8],
    description: &'static str,
) -> Result<&'static str, String> {
    if head.starts_with(magic) {
        Ok(description)
    } else {
        let shown = &head[..head.len().min(8)];
        Err(format!(
            "expected {description}, found leading bytes {}",
            String::from_utf8_lossy(shown).escape_debug()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::{odf_header, with_zip_trailer};
    use assert_matches::assert_matches;

    fn check(data: &[u8], expected: TargetFormat) -> Result<&'static str, String> {
        check_signature(data, data, data.len() as u64, expected)
    }

    #[test]
    fn pdf_signature() {
        assert!(check(b"%PDF-1.7\n...\n%%EOF\n", TargetFormat::Pdf).is_ok());
        let err = check(b"<html>", TargetFormat::Pdf).unwrap_err();
        assert!(err.contains("%PDF-"), "{err}");
    }

    #[test]
    fn pdf_without_trailer_is_truncated() {
        let err = check(b"%PDF-1.7 partial", TargetFormat::Pdf).unwrap_err();
        assert!(err.contains("truncated"), "{err}");

        // The marker must sit near the end, not anywhere in the file.
        let mut early = b"%PDF-1.7\n%%EOF\n".to_vec();
        early.extend(std::iter::repeat(b' ').take(PDF_EOF_WINDOW + 1));
        assert!(check(&early, TargetFormat::Pdf).is_err());
    }

    #[test]
    fn empty_output_is_invalid_for_every_format() {
        for t in TargetFormat::ALL {
            assert!(check_signature(b"", b"", 0, t).is_err(), "{t}");
        }
    }

    #[test]
    fn odf_mimetype_must_match_target() {
        let ods = with_zip_trailer(odf_header("application/vnd.oasis.opendocument.spreadsheet"));
        assert!(check(&ods, TargetFormat::Ods).is_ok());
        let err = check(&ods, TargetFormat::Odt).unwrap_err();
        assert!(err.contains("opendocument.spreadsheet"), "{err}");
        // OOXML targets only need the ZIP structure.
        assert!(check(&ods, TargetFormat::Docx).is_ok());
    }

    #[test]
    fn zip_without_central_directory_is_truncated() {
        let ods = odf_header("application/vnd.oasis.opendocument.spreadsheet");
        let err = check(&ods, TargetFormat::Ods).unwrap_err();
        assert!(err.contains("end-of-central-directory"), "{err}");
        assert!(check(&ods, TargetFormat::Xlsx).is_err());
    }

    #[test]
    fn html_allows_bom_and_whitespace() {
        assert!(check(b"\xEF\xBB\xBF\n  <!DOCTYPE html>", TargetFormat::Html).is_ok());
        assert!(check(b"   \n", TargetFormat::Html).is_err());
        assert!(check(b"plain", TargetFormat::Html).is_err());
    }

    #[test]
    fn text_formats_accept_any_content() {
        assert!(check(b"a;b", TargetFormat::Csv).is_ok());
        assert!(check(b"x", TargetFormat::Txt).is_ok());
    }

    #[test]
    fn validate_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("out.rtf");
        std::fs::write(&good, b"{\\rtf1\\ansi hi}").unwrap();
        let sig = validate(&good, TargetFormat::Rtf).unwrap();
        assert_eq!(sig.size_bytes, 15);

        let empty = dir.path().join("out.pdf");
        std::fs::write(&empty, b"").unwrap();
        assert_matches!(
            validate(&empty, TargetFormat::Pdf),
            Err(ConvertError::CorruptOutput { format: TargetFormat::Pdf, .. })
        );

        assert_matches!(
            validate(&dir.path().join("missing.pdf"), TargetFormat::Pdf),
            Err(ConvertError::CorruptOutput { .. })
        );
    }

    #[test]
    fn validate_finds_trailer_of_large_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.pdf");
        let mut data = b"%PDF-1.7\n".to_vec();
        data.extend(std::iter::repeat(b'0').take(format::SNIFF_LEN * 3));
        data.extend_from_slice(b"\nstartxref\n123\n%%EOF\n");
        std::fs::write(&path, &data).unwrap();
        assert!(validate(&path, TargetFormat::Pdf).is_ok());

        data.truncate(data.len() - 6);
        std::fs::write(&path, &data).unwrap();
        assert_matches!(validate(&path, TargetFormat::Pdf), Err(ConvertError::CorruptOutput { .. }));
    }
}
