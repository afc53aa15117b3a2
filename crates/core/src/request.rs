//! URL and request descriptor parsing.
//!
//! Sources describe requests as strings of three forms:
//!
//! - a plain absolute or relative URL;
//! - a URL followed by a JSON options object: `<url>,{"method":"POST","headers":{...},"body":"..."}`;
//! - a pseudo-URL carrying inline data: `data:;base64,<payload>[,<json-context>]`.
//!
//! Parsing is pure. Relative URLs are completed with the first entry of the
//! source's host list; without one the request fails with
//! [`QuireError::NoHost`].

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::hosts::decode_base64;
use crate::{QuireError, Result};

const PSEUDO_URL_PREFIX: &str = "data:;base64,";

/// HTTP method of a request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            other => Err(QuireError::ConfigError(format!("Unsupported request method: {}", other))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// Data carried by a pseudo-URL instead of a real endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct InlinePayload {
    /// Decoded payload, used in place of a response body.
    pub body: String,
    /// Extra evaluation context for downstream rules.
    pub context: Option<Value>,
}

/// A fully resolved request. Built once per fetch and never mutated after.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub inline: Option<InlinePayload>,
}

impl RequestDescriptor {
    pub fn is_inline(&self) -> bool {
        self.inline.is_some()
    }
}

#[derive(Debug, Deserialize, Default)]
struct RequestOptions {
    method: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    body: Option<Value>,
}

/// Parses a request string, completing relative URLs with `hosts[0]`.
pub fn parse_request(raw: &str, hosts: &[String]) -> Result<RequestDescriptor> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(QuireError::InvalidUrl("empty request URL".to_string()));
    }

    if let Some(rest) = raw.strip_prefix(PSEUDO_URL_PREFIX) {
        return parse_pseudo_url(raw, rest);
    }

    let (url_part, options_part) = split_options(raw);
    let url = absolutize(url_part.trim(), hosts)?;

    let mut descriptor = RequestDescriptor { url, ..Default::default() };
    if let Some(options) = options_part {
        apply_options(&mut descriptor, options)?;
    }

    Ok(descriptor)
}

/// Joins a possibly relative request string against `base`. Absolute URLs,
/// pseudo-URLs and the options segment are kept verbatim.
pub fn join_url(raw: &str, base: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with(PSEUDO_URL_PREFIX) {
        return raw.to_string();
    }

    let (url_part, options_part) = split_options(raw);
    let url_part = url_part.trim();
    if has_scheme(url_part) {
        return raw.to_string();
    }

    let joined = match url::Url::parse(base).and_then(|base| base.join(url_part)) {
        Ok(url) => url.to_string(),
        Err(_) => return raw.to_string(),
    };
    match options_part {
        Some(options) => format!("{},{}", joined, options),
        None => joined,
    }
}

fn parse_pseudo_url(raw: &str, rest: &str) -> Result<RequestDescriptor> {
    let (payload, context) = match rest.split_once(',') {
        Some((payload, context)) => (payload, Some(context.trim())),
        None => (rest, None),
    };

    let body = decode_base64(payload)
        .ok_or_else(|| QuireError::InvalidUrl(format!("undecodable inline payload in {}", truncate(raw))))?;

    let context = match context.filter(|c| !c.is_empty()) {
        Some(text) => Some(
            serde_json::from_str::<Value>(text)
                .map_err(|e| QuireError::InvalidUrl(format!("invalid inline context: {}", e)))?,
        ),
        None => None,
    };

    Ok(RequestDescriptor { url: raw.to_string(), inline: Some(InlinePayload { body, context }), ..Default::default() })
}

/// Splits `<url>,{...}` at the first comma that starts a JSON object which
/// runs to the end of the string.
fn split_options(raw: &str) -> (&str, Option<&str>) {
    let mut search_from = 0;
    while let Some(offset) = raw[search_from..].find(",{") {
        let idx = search_from + offset;
        let candidate = raw[idx + 1..].trim();
        if candidate.ends_with('}') && serde_json::from_str::<Value>(candidate).is_ok() {
            return (&raw[..idx], Some(candidate));
        }
        search_from = idx + 2;
    }
    (raw, None)
}

fn apply_options(descriptor: &mut RequestDescriptor, options: &str) -> Result<()> {
    let options: RequestOptions = serde_json::from_str(options)
        .map_err(|e| QuireError::ConfigError(format!("invalid request options for {}: {}", descriptor.url, e)))?;

    let explicit_method = options.method.is_some();
    if let Some(method) = options.method {
        descriptor.method = Method::parse(&method)?;
    }

    for (name, value) in options.headers {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        descriptor.headers.insert(name, value);
    }

    descriptor.body = options.body.map(|body| match body {
        Value::String(s) => s,
        other => other.to_string(),
    });

    // A body without an explicit method implies POST.
    if descriptor.body.is_some() && !explicit_method {
        descriptor.method = Method::Post;
    }

    Ok(())
}

fn absolutize(url: &str, hosts: &[String]) -> Result<String> {
    if has_scheme(url) {
        return Ok(url.to_string());
    }

    if let Some(rest) = url.strip_prefix("//") {
        return Ok(format!("https://{}", rest));
    }

    let host = hosts
        .iter()
        .map(|h| h.trim())
        .find(|h| !h.is_empty())
        .ok_or_else(|| QuireError::NoHost { url: url.to_string() })?;

    let host = host.trim_end_matches('/');
    if url.is_empty() {
        Ok(host.to_string())
    } else if url.starts_with('/') || url.starts_with('?') {
        Ok(format!("{}{}", host, url))
    } else {
        Ok(format!("{}/{}", host, url))
    }
}

fn has_scheme(url: &str) -> bool {
    url::Url::parse(url).map(|u| u.has_host() || u.scheme() == "data").unwrap_or(false)
}

fn truncate(raw: &str) -> String {
    raw.chars().take(48).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hosts() -> Vec<String> {
        vec!["https://h".to_string()]
    }

    #[test]
    fn test_plain_absolute_url() {
        let req = parse_request("https://h/book/1", &[]).unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.url, "https://h/book/1");
        assert!(req.headers.is_empty());
        assert!(req.body.is_none());
    }

    #[test]
    fn test_url_with_options() {
        let req = parse_request(r#"https://h/a,{"method":"POST","body":"x=1"}"#, &[]).unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.url, "https://h/a");
        assert_eq!(req.body.as_deref(), Some("x=1"));
    }

    #[test]
    fn test_options_headers_and_object_body() {
        let req = parse_request(
            r#"https://h/api,{"headers":{"X-Token":"t","X-Page":2},"body":{"q":"abc"}}"#,
            &[],
        )
        .unwrap();
        assert_eq!(req.headers.get("X-Token").map(String::as_str), Some("t"));
        assert_eq!(req.headers.get("X-Page").map(String::as_str), Some("2"));
        assert_eq!(req.body.as_deref(), Some(r#"{"q":"abc"}"#));
        assert_eq!(req.method, Method::Post);
    }

    #[test]
    fn test_comma_in_url_is_not_options() {
        let req = parse_request("https://h/list?ids=1,2,3", &[]).unwrap();
        assert_eq!(req.url, "https://h/list?ids=1,2,3");
    }

    #[test]
    fn test_relative_path_uses_first_host() {
        let req = parse_request("/list?x=1", &hosts()).unwrap();
        assert_eq!(req.url, "https://h/list?x=1");

        let req = parse_request("list?x=1", &["https://h/".to_string()]).unwrap();
        assert_eq!(req.url, "https://h/list?x=1");
    }

    #[test]
    fn test_relative_path_keeps_options() {
        let req = parse_request(r#"/search,{"method":"POST","body":"k=v"}"#, &hosts()).unwrap();
        assert_eq!(req.url, "https://h/search");
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.body.as_deref(), Some("k=v"));
    }

    #[test]
    fn test_relative_without_host_is_configuration_error() {
        let err = parse_request("/list?x=1", &[]).unwrap_err();
        assert!(matches!(err, QuireError::NoHost { ref url } if url == "/list?x=1"));
    }

    #[test]
    fn test_pseudo_url() {
        let raw = r#"data:;base64,5LiA5q615YaF5a65,{"chapterId":42}"#;
        let req = parse_request(raw, &[]).unwrap();
        let inline = req.inline.unwrap();
        assert_eq!(inline.body, "一段内容");
        assert_eq!(inline.context, Some(json!({"chapterId": 42})));
    }

    #[test]
    fn test_pseudo_url_without_context() {
        let req = parse_request("data:;base64,aGVsbG8=", &[]).unwrap();
        assert_eq!(req.inline, Some(InlinePayload { body: "hello".to_string(), context: None }));
    }

    #[test]
    fn test_join_url() {
        let base = "https://h/book/7/index.html";
        assert_eq!(join_url("12.html", base), "https://h/book/7/12.html");
        assert_eq!(join_url("/c/1", base), "https://h/c/1");
        assert_eq!(join_url("https://x/1", base), "https://x/1");
        assert_eq!(join_url(r#"/api,{"body":"id=1"}"#, base), r#"https://h/api,{"body":"id=1"}"#);
        assert_eq!(join_url("data:;base64,aGVsbG8=", base), "data:;base64,aGVsbG8=");
    }

    #[test]
    fn test_unsupported_method() {
        let err = parse_request(r#"https://h/a,{"method":"DELETE"}"#, &[]).unwrap_err();
        assert!(matches!(err, QuireError::ConfigError(_)));
    }
}
