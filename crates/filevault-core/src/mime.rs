//! MIME resolution
//!
//! Pure functions used by the orchestrator whenever a content type has to be
//! decided without trusting the caller: extension lookup, the inverse lookup
//! used to give storage keys an extension, declared-type validation,
//! previewability and magic-byte sniffing for proxied uploads.

use crate::constants::SNIFF_WINDOW;
use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";
pub const BINARY_EXTENSION: &str = ".bin";

/// Extension to MIME table. Order matters for `reverse_to_extension`: the
/// first extension listed for a type wins unless overridden below.
const EXTENSION_TABLE: &[(&str, &str)] = &[
    // Images
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".webp", "image/webp"),
    (".svg", "image/svg+xml"),
    (".ico", "image/x-icon"),
    (".bmp", "image/bmp"),
    // Video
    (".mp4", "video/mp4"),
    (".webm", "video/webm"),
    (".ogv", "video/ogg"),
    (".mov", "video/quicktime"),
    (".avi", "video/x-msvideo"),
    (".mkv", "video/x-matroska"),
    (".flv", "video/x-flv"),
    // Audio
    (".mp3", "audio/mpeg"),
    (".wav", "audio/wav"),
    (".oga", "audio/ogg"),
    (".m4a", "audio/mp4"),
    (".flac", "audio/flac"),
    // Documents
    (".pdf", "application/pdf"),
    (".doc", "application/msword"),
    (
        ".docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    (".xls", "application/vnd.ms-excel"),
    (
        ".xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    (".ppt", "application/vnd.ms-powerpoint"),
    (
        ".pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    // Text and data
    (".txt", "text/plain"),
    (".html", "text/html"),
    (".css", "text/css"),
    (".js", "application/javascript"),
    (".json", "application/json"),
    (".xml", "application/xml"),
    (".csv", "text/csv"),
    // Archives
    (".zip", "application/zip"),
    (".rar", "application/x-rar-compressed"),
    (".7z", "application/x-7z-compressed"),
    (".tar", "application/x-tar"),
    (".gz", "application/gzip"),
];

/// Disambiguation for types with several extensions (and common aliases).
const PREFERRED_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", ".jpg"),
    ("image/jpg", ".jpg"),
    ("audio/x-wav", ".wav"),
    ("audio/ogg", ".oga"),
];

const PREVIEWABLE_PREFIXES: &[&str] = &["image/", "video/", "audio/", "text/"];

/// Extension of `name` including the leading dot, lower-cased. Empty when the
/// name has none.
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Media type without parameters, trimmed and lower-cased.
pub fn base_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Content type implied by the file name's extension, or octet-stream.
pub fn resolve_from_name(name: &str) -> &'static str {
    let ext = extension_of(name);
    EXTENSION_TABLE
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or(OCTET_STREAM)
}

/// Extension (with dot) for a content type, or `.bin` when unknown.
pub fn reverse_to_extension(content_type: &str) -> &'static str {
    let base = base_type(content_type);

    if let Some((_, ext)) = PREFERRED_EXTENSIONS.iter().find(|(mime, _)| *mime == base) {
        return ext;
    }

    EXTENSION_TABLE
        .iter()
        .find(|(_, mime)| *mime == base)
        .map(|(ext, _)| *ext)
        .unwrap_or(BINARY_EXTENSION)
}

/// Compare a declared content type against the name-derived one.
///
/// Returns `(matches, recommended)`. An empty or generic declaration never
/// matches, so callers fall back to `recommended`.
pub fn validate(name: &str, declared: &str) -> (bool, &'static str) {
    let expected = resolve_from_name(name);
    let declared = declared.trim();

    if declared.is_empty() || base_type(declared) == OCTET_STREAM {
        return (false, expected);
    }

    (base_type(declared) == base_type(expected), expected)
}

/// Resolve the type to use for a presigned upload: the declared type when it
/// agrees with the name, the name-derived type otherwise.
pub fn resolve_declared(name: &str, declared: &str) -> String {
    match validate(name, declared) {
        (true, _) => declared.trim().to_string(),
        (false, expected) => expected.to_string(),
    }
}

/// Whether browsers can render the type inline.
pub fn is_previewable(content_type: &str) -> bool {
    let base = base_type(content_type);
    base == "application/pdf"
        || PREVIEWABLE_PREFIXES
            .iter()
            .any(|prefix| base.starts_with(prefix))
}

/// Byte signatures checked in order. `None` bytes in a pattern are wildcards.
struct Signature {
    offset: usize,
    pattern: &'static [Option<u8>],
    mime: &'static str,
}

macro_rules! sig {
    (@byte _) => { None };
    (@byte $b:expr) => { Some($b) };
    ($offset:expr, [$($b:tt),*], $mime:expr) => {
        Signature { offset: $offset, pattern: &[$(sig!(@byte $b)),*], mime: $mime }
    };
}

const SIGNATURES: &[Signature] = &[
    sig!(0, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A], "image/png"),
    sig!(0, [0xFF, 0xD8, 0xFF], "image/jpeg"),
    sig!(0, [b'G', b'I', b'F', b'8', b'7', b'a'], "image/gif"),
    sig!(0, [b'G', b'I', b'F', b'8', b'9', b'a'], "image/gif"),
    sig!(0, [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', b'V', b'P'], "image/webp"),
    sig!(0, [b'B', b'M'], "image/bmp"),
    sig!(0, [0x00, 0x00, 0x01, 0x00], "image/x-icon"),
    sig!(0, [b'%', b'P', b'D', b'F', b'-'], "application/pdf"),
    sig!(0, [b'P', b'K', 0x03, 0x04], "application/zip"),
    sig!(0, [0x1F, 0x8B, 0x08], "application/x-gzip"),
    sig!(0, [b'R', b'a', b'r', b'!', 0x1A, 0x07], "application/x-rar-compressed"),
    sig!(0, [b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C], "application/x-7z-compressed"),
    sig!(4, [b'f', b't', b'y', b'p'], "video/mp4"),
    sig!(0, [0x1A, 0x45, 0xDF, 0xA3], "video/webm"),
    sig!(0, [b'O', b'g', b'g', b'S', 0x00], "application/ogg"),
    sig!(0, [b'I', b'D', b'3'], "audio/mpeg"),
    sig!(0, [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E'], "audio/wave"),
    sig!(0, [b'f', b'L', b'a', b'C'], "audio/flac"),
];

impl Signature {
    fn matches(&self, data: &[u8]) -> bool {
        let end = self.offset + self.pattern.len();
        if data.len() < end {
            return false;
        }
        data[self.offset..end]
            .iter()
            .zip(self.pattern)
            .all(|(byte, expected)| expected.map_or(true, |e| e == *byte))
    }
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

fn sniff_markup(text: &[u8]) -> Option<&'static str> {
    let start = text
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(text.len());
    let trimmed = &text[start..];
    let lower: Vec<u8> = trimmed
        .iter()
        .take(16)
        .map(|b| b.to_ascii_lowercase())
        .collect();

    const HTML_TAGS: &[&[u8]] = &[
        b"<!doctype html",
        b"<html",
        b"<head",
        b"<body",
        b"<script",
        b"<iframe",
        b"<h1",
        b"<div",
        b"<table",
        b"<p",
    ];

    if lower.starts_with(b"<?xml") {
        return Some("text/xml; charset=utf-8");
    }
    for tag in HTML_TAGS {
        if lower.starts_with(tag) {
            // The tag must be terminated by a space or '>'.
            match trimmed.get(tag.len()) {
                Some(b' ') | Some(b'>') => return Some("text/html; charset=utf-8"),
                _ => {}
            }
        }
    }
    None
}

/// Sniff a content type from the leading bytes of a payload.
///
/// Only the first `SNIFF_WINDOW` bytes are examined. Text that is valid UTF-8
/// and free of control bytes is reported as `text/plain; charset=utf-8`;
/// anything unrecognised is octet-stream.
pub fn sniff(prefix: &[u8]) -> &'static str {
    let data = &prefix[..prefix.len().min(SNIFF_WINDOW)];

    if let Some(sig) = SIGNATURES.iter().find(|sig| sig.matches(data)) {
        return sig.mime;
    }

    if let Some(markup) = sniff_markup(data) {
        return markup;
    }

    if data.iter().any(|b| is_binary_byte(*b)) {
        return OCTET_STREAM;
    }

    // A multi-byte character may be cut at the window edge.
    match std::str::from_utf8(data) {
        Ok(_) => TEXT_PLAIN_UTF8,
        Err(e) if e.error_len().is_none() => TEXT_PLAIN_UTF8,
        Err(_) => OCTET_STREAM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_from_name() {
        assert_eq!(resolve_from_name("photo.jpg"), "image/jpeg");
        assert_eq!(resolve_from_name("PHOTO.JPEG"), "image/jpeg");
        assert_eq!(resolve_from_name("clip.mkv"), "video/x-matroska");
        assert_eq!(resolve_from_name("song.flac"), "audio/flac");
        assert_eq!(resolve_from_name("report.pdf"), "application/pdf");
        assert_eq!(resolve_from_name("dir/archive.tar.gz"), "application/gzip");
        assert_eq!(resolve_from_name("notes.txt"), "text/plain");
        assert_eq!(resolve_from_name("README"), OCTET_STREAM);
        assert_eq!(resolve_from_name("model.blend"), OCTET_STREAM);
        assert_eq!(resolve_from_name(""), OCTET_STREAM);
    }

    #[test]
    fn every_table_entry_resolves_to_itself() {
        for (ext, mime) in EXTENSION_TABLE {
            let name = format!("file{}", ext);
            assert_eq!(resolve_from_name(&name), *mime, "extension {}", ext);
        }
    }

    #[test]
    fn test_reverse_to_extension() {
        assert_eq!(reverse_to_extension("image/png"), ".png");
        assert_eq!(reverse_to_extension("image/jpeg"), ".jpg");
        assert_eq!(reverse_to_extension("image/jpg"), ".jpg");
        assert_eq!(reverse_to_extension("video/mp4"), ".mp4");
        assert_eq!(reverse_to_extension("application/pdf"), ".pdf");
        assert_eq!(reverse_to_extension("text/plain"), ".txt");
        assert_eq!(reverse_to_extension("text/plain; charset=utf-8"), ".txt");
        assert_eq!(reverse_to_extension(" Text/Plain ;charset=utf-8"), ".txt");
        assert_eq!(reverse_to_extension("application/x-unknown"), ".bin");
        assert_eq!(reverse_to_extension(""), ".bin");
    }

    #[test]
    fn reverse_lookup_is_total_over_table_values() {
        for (_, mime) in EXTENSION_TABLE {
            let ext = reverse_to_extension(mime);
            assert!(ext.starts_with('.') && ext.len() > 1, "{} -> {}", mime, ext);
            assert_eq!(resolve_from_name(&format!("x{}", ext)), *mime);
        }
    }

    #[test]
    fn test_validate() {
        assert_eq!(validate("a.png", ""), (false, "image/png"));
        assert_eq!(validate("a.png", OCTET_STREAM), (false, "image/png"));
        assert_eq!(validate("a.png", "image/png"), (true, "image/png"));
        assert_eq!(validate("a.txt", "text/plain; charset=utf-8"), (true, "text/plain"));
        assert_eq!(validate("a.png", "image/jpeg"), (false, "image/png"));
        assert_eq!(validate("noext", "image/png"), (false, OCTET_STREAM));
    }

    #[test]
    fn test_resolve_declared() {
        assert_eq!(resolve_declared("a.mp4", "video/mp4"), "video/mp4");
        assert_eq!(resolve_declared("a.mp4", "image/png"), "video/mp4");
        assert_eq!(resolve_declared("a.mp4", ""), "video/mp4");
        assert_eq!(
            resolve_declared("a.txt", "text/plain; charset=utf-8"),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_is_previewable() {
        assert!(is_previewable("image/png"));
        assert!(is_previewable("video/mp4"));
        assert!(is_previewable("audio/mpeg"));
        assert!(is_previewable("text/plain; charset=utf-8"));
        assert!(is_previewable("application/pdf"));
        assert!(!is_previewable("application/zip"));
        assert!(!is_previewable("application/json"));
        assert!(!is_previewable(OCTET_STREAM));
    }

    #[test]
    fn test_sniff_signatures() {
        assert_eq!(sniff(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0]), "image/png");
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10]), "image/jpeg");
        assert_eq!(sniff(b"GIF89a\x01\x00"), "image/gif");
        assert_eq!(sniff(b"%PDF-1.7\n"), "application/pdf");
        assert_eq!(sniff(b"PK\x03\x04\x14\x00"), "application/zip");
        assert_eq!(sniff(b"\x00\x00\x00\x18ftypmp42"), "video/mp4");
        assert_eq!(sniff(b"RIFF\x24\x00\x00\x00WAVEfmt "), "audio/wave");
        assert_eq!(sniff(b"RIFF\x24\x00\x00\x00WEBPVP8 "), "image/webp");
    }

    #[test]
    fn test_sniff_text_and_markup() {
        assert_eq!(sniff(b"Hello, World!"), TEXT_PLAIN_UTF8);
        assert_eq!(sniff(b""), TEXT_PLAIN_UTF8);
        assert_eq!(sniff("héllo wörld".as_bytes()), TEXT_PLAIN_UTF8);
        assert_eq!(sniff(b"  <!DOCTYPE html>\n<html>"), "text/html; charset=utf-8");
        assert_eq!(sniff(b"<?xml version=\"1.0\"?>"), "text/xml; charset=utf-8");
        assert_eq!(sniff(b"<pre>code</pre>"), TEXT_PLAIN_UTF8);
    }

    #[test]
    fn test_sniff_binary_falls_back() {
        assert_eq!(sniff(&[0x00, 0x01, 0x02, 0x03, 0x04]), OCTET_STREAM);
        assert_eq!(sniff(&[0xC3, 0x28, b'a', b'b']), OCTET_STREAM);
    }

    #[test]
    fn sniff_tolerates_truncated_utf8_at_window_edge() {
        let mut data = vec![b'a'; SNIFF_WINDOW - 1];
        data.extend_from_slice("é".as_bytes());
        assert_eq!(sniff(&data), TEXT_PLAIN_UTF8);
    }
}
