//! Host-list extraction from a source's auxiliary script text.
//!
//! Only two shapes are recognized, and only the array literal itself is
//! evaluated; the surrounding script text is never run:
//!
//! 1. a literal array assignment of absolute URLs:
//!    `var hosts = ["https://a.example", 'https://b.example'];`
//! 2. an array of individually base64-encoded absolute URLs:
//!    `const api = ["aHR0cHM6Ly9hLmV4YW1wbGU=", ...].map(atob);`
//!
//! Anything else yields [`QuireError::NoHost`].

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use regex::Regex;

use crate::{QuireError, Result};

/// `name = [ ... ]` with no nested brackets inside the array.
static ARRAY_ASSIGNMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[A-Za-z_$][\w$]*\s*=\s*(\[[^\[\]]*\])"#).unwrap());

/// Any array made only of quoted base64-looking strings.
static BASE64_ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[\s*(?:(?:"[A-Za-z0-9+/_\-]{8,}={0,2}"|'[A-Za-z0-9+/_\-]{8,}={0,2}')\s*,?\s*)+\]"#).unwrap()
});

/// A single- or double-quoted string literal.
static STRING_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'"#).unwrap());

/// Extracts the host list from auxiliary script text.
pub fn extract_host_list(script: &str) -> Result<Vec<String>> {
    for captures in ARRAY_ASSIGNMENT_RE.captures_iter(script) {
        if let Some(array) = captures.get(1)
            && let Some(hosts) = literal_urls(array.as_str())
        {
            return Ok(hosts);
        }
    }

    for array in BASE64_ARRAY_RE.find_iter(script) {
        if let Some(hosts) = base64_urls(array.as_str()) {
            return Ok(hosts);
        }
    }

    Err(QuireError::NoHost { url: String::new() })
}

/// Shape 1: every element is a quoted absolute URL.
fn literal_urls(array: &str) -> Option<Vec<String>> {
    let items = string_items(array)?;
    let hosts: Vec<String> = items.iter().map(|s| normalize_host(s)).collect();
    if hosts.iter().all(|h| is_absolute(h)) { Some(hosts) } else { None }
}

/// Shape 2: every element decodes to an absolute URL.
fn base64_urls(array: &str) -> Option<Vec<String>> {
    let items = string_items(array)?;
    let hosts = items.iter().map(|item| decode_base64(item).map(|s| normalize_host(&s))).collect::<Option<Vec<_>>>()?;
    if hosts.iter().all(|h| is_absolute(h)) { Some(hosts) } else { None }
}

/// Quoted strings of an array literal, or `None` when the array holds
/// anything besides string literals and separators.
fn string_items(array: &str) -> Option<Vec<String>> {
    let inner = array.trim().strip_prefix('[')?.strip_suffix(']')?;
    let leftover = STRING_LITERAL_RE.replace_all(inner, "");
    if leftover.chars().any(|c| !(c.is_whitespace() || c == ',')) {
        return None;
    }

    let items: Vec<String> = STRING_LITERAL_RE
        .captures_iter(inner)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| unescape(m.as_str()))
        .collect();

    if items.is_empty() { None } else { Some(items) }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Decodes standard or URL-safe base64 into UTF-8.
pub fn decode_base64(encoded: &str) -> Option<String> {
    let encoded = encoded.trim();
    let bytes = STANDARD.decode(encoded).or_else(|_| URL_SAFE.decode(encoded)).ok()?;
    String::from_utf8(bytes).ok()
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('/').to_string()
}

fn is_absolute(url: &str) -> bool {
    url::Url::parse(url).map(|u| matches!(u.scheme(), "http" | "https") && u.has_host()).unwrap_or(false)
}
