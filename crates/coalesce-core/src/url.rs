//! URL normalization shared by the server and the loader extension.
//!
//! Browser-side module URLs carry cache-busting parameters (`?t=<ms>`) and
//! bare `import` markers that the server-side module graph never sees. Both
//! sides reduce URLs to the same `pathname + search` form before comparing.

use regex_lite::Regex;
use std::sync::OnceLock;

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bt=\d{13}&?\b").expect("valid timestamp regex"))
}

fn import_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\?|&)import=?(?:&|$)").expect("valid import regex"))
}

fn strip_trailing_separator(url: &str) -> &str {
    url.strip_suffix(['?', '&']).unwrap_or(url)
}

/// Remove a `t=<13 digit timestamp>` query parameter.
#[must_use]
pub fn remove_timestamp_query(url: &str) -> String {
    let replaced = timestamp_re().replace(url, "");
    strip_trailing_separator(&replaced).to_string()
}

/// Remove a bare `import` query marker (`?import`, `&import=`).
#[must_use]
pub fn remove_import_query(url: &str) -> String {
    let replaced = import_query_re().replace(url, "${1}");
    strip_trailing_separator(&replaced).to_string()
}

/// Reduce a request URL to the identifier the server uses for it.
///
/// Absolute URLs keep only their path and query; root-relative URLs are
/// taken as-is. Timestamp and import markers are stripped afterwards.
#[must_use]
pub fn normalize_url(raw: &str) -> String {
    let path_and_query = match url::Url::parse(raw) {
        Ok(parsed) => match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        },
        Err(_) => raw.to_string(),
    };
    remove_import_query(&remove_timestamp_query(&path_and_query))
}

/// Path part of a URL, without query or fragment.
#[must_use]
pub fn path_of(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Whether the last path segment of a URL has a file extension.
#[must_use]
pub fn has_extension(url: &str) -> bool {
    let path = path_of(url);
    let segment = path.rsplit('/').next().unwrap_or(path);
    segment
        .rfind('.')
        .is_some_and(|dot| dot > 0 && dot + 1 < segment.len())
}

/// The URL followed by each extension-suffixed variant when it has none.
#[must_use]
pub fn extension_candidates(url: &str, extensions: &[String]) -> Vec<String> {
    let mut candidates = vec![url.to_string()];
    if !has_extension(url) {
        candidates.extend(extensions.iter().map(|ext| format!("{url}.{ext}")));
    }
    candidates
}

/// Whether `url` carries `marker` as a query parameter (`?marker` or `&marker`).
#[must_use]
pub fn has_query_marker(url: &str, marker: &str) -> bool {
    url.match_indices(marker)
        .any(|(idx, _)| idx > 0 && matches!(url.as_bytes()[idx - 1], b'?' | b'&'))
}
