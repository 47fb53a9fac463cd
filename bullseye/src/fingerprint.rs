//! Deterministic identity for findings.
//!
//! The fingerprint hashes the rule, the normalized path, the line range and
//! the whitespace-normalized snippet. Scanner name, severity and category are
//! left out so the same issue reported by two tools, or re-reported with a
//! different severity, collapses to one row.

use sha2::{Digest, Sha256};

pub fn fingerprint(
    rule_id: &str,
    file_path: Option<&str>,
    line_start: Option<u32>,
    line_end: Option<u32>,
    snippet: Option<&str>,
) -> String {
    let path = file_path.map(normalize_path).unwrap_or_default();
    let range = match (line_start, line_end) {
        (Some(start), Some(end)) => format!("{start}-{end}"),
        (Some(start), None) => format!("{start}-{start}"),
        (None, Some(end)) => format!("{end}-{end}"),
        (None, None) => String::new(),
    };
    let snippet = snippet.map(normalize_snippet).unwrap_or_default();

    let mut hasher = Sha256::new();
    for part in [rule_id.trim(), path.as_str(), range.as_str(), snippet.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    let normalized = normalized.trim_start_matches('/');
    let mut out = String::with_capacity(normalized.len());
    for segment in normalized.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    out
}

pub fn normalize_snippet(snippet: &str) -> String {
    snippet.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lower-case, dash-separated form of a free-text title, used to build rule
/// ids for findings that come without one.
pub fn slug(text: &str) -> String {
    let mut out = String::new();
    for word in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if !out.is_empty() {
            out.push('-');
        }
        out.push_str(&word.to_ascii_lowercase());
    }
    out
}
