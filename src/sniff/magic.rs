//! Magic-prefix and extension tables

/// Matches well-known payload signatures. HTML detection skips leading
/// whitespace and is case-insensitive, the rest are literal prefixes.
pub(crate) fn match_prefix(data: &[u8]) -> Option<&'static str> {
    const LITERAL: &[(&[u8], &str)] = &[
        (b"%PDF", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
        (b"<?xml", "text/xml"),
    ];

    for (prefix, ty) in LITERAL {
        if data.starts_with(prefix) {
            return Some(ty);
        }
    }

    let trimmed = skip_whitespace(data);
    const TAGS: &[&[u8]] = &[b"<!doctype html", b"<html", b"<head", b"<body", b"<script", b"<title"];
    for tag in TAGS {
        if starts_with_ignore_case(trimmed, tag) {
            return Some("text/html");
        }
    }

    None
}

/// Maps a URL or path extension to a content type. Used by the classifier as
/// a last resort and by the file transport to propose a type up front.
pub fn extension_type(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next()?;
    if ext.len() == path.len() || ext.contains('/') {
        return None;
    }

    let ty = match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "txt" | "log" => "text/plain",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "text/xml",
        "md" => "text/markdown",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => return None,
    };
    Some(ty)
}

fn skip_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len()
        && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}
