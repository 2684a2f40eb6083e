//! Content-type classification
//!
//! The funnel buffers up to [`SNIFF_WINDOW`] bytes of the payload and asks a
//! [`ContentClassifier`] for the final type before the first data
//! notification is forwarded. The classifier is a trait so callers can plug
//! their own heuristics; [`DefaultClassifier`] covers the common magic
//! prefixes plus a text/binary split and is good enough for most transports.

mod magic;

pub use magic::extension_type;

use tracing::debug;

/// Number of payload bytes buffered before classification runs.
pub const SNIFF_WINDOW: usize = 255;

/// Classifies a byte prefix into a content-type string.
///
/// `proposed` is the transport-suggested type (HTTP `Content-Type`, a file
/// extension guess, ...); `url` is the target the bytes came from. The
/// classifier must always produce an answer, falling back to
/// `application/octet-stream` when nothing better is known.
pub trait ContentClassifier: Send + Sync {
    fn classify(&self, data: &[u8], proposed: Option<&str>, url: &str) -> String;
}

/// Built-in heuristic classifier.
///
/// Resolution order: a specific proposed type wins; otherwise magic prefixes
/// are consulted; otherwise the buffer is split into text vs binary; an
/// empty buffer falls back to the URL's extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl DefaultClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl ContentClassifier for DefaultClassifier {
    fn classify(&self, data: &[u8], proposed: Option<&str>, url: &str) -> String {
        let proposed = proposed.map(normalize).filter(|p| !p.is_empty());

        // A specific, well-formed proposed type is authoritative. Generic
        // placeholders fall through to sniffing.
        if let Some(p) = proposed.as_deref() {
            if !is_generic(p) && p.parse::<mime::Mime>().is_ok() {
                debug!(proposed = p, "classifier kept proposed type");
                return p.to_string();
            }
        }

        if let Some(ty) = magic::match_prefix(data) {
            debug!(ty, "classifier matched magic prefix");
            return ty.to_string();
        }

        if data.is_empty() {
            if let Some(ty) = magic::extension_type(url) {
                return ty.to_string();
            }
            return proposed
                .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
        }

        if looks_textual(data) {
            mime::TEXT_PLAIN.to_string()
        } else {
            mime::APPLICATION_OCTET_STREAM.to_string()
        }
    }
}

/// Lowercases and strips parameters (`; charset=...`) from a type string.
pub fn normalize(ty: &str) -> String {
    let essence = ty.split(';').next().unwrap_or(ty);
    essence.trim().to_ascii_lowercase()
}

fn is_generic(ty: &str) -> bool {
    matches!(
        ty,
        "application/octet-stream" | "text/plain" | "unknown" | "*/*"
    )
}

/// A buffer is textual when every byte is printable or common whitespace.
fn looks_textual(data: &[u8]) -> bool {
    data.iter()
        .all(|&b| b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b))
}
