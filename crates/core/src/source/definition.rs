use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::hosts::extract_host_list;
use crate::rule::{Rule, deserialize_rule};

/// A user-supplied description of how to query and parse one reading site.
///
/// Definitions are immutable to the engine for the duration of a request.
/// Rule strings are classified into [`Rule`]s while deserializing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Base request headers: a JSON object, or a script returning one.
    #[serde(default, deserialize_with = "deserialize_header")]
    pub header: Option<HeaderSpec>,
    /// Optional proxy all requests are routed through.
    #[serde(default)]
    pub proxy_base: Option<String>,
    #[serde(default)]
    pub book_info: BookInfoRules,
    #[serde(default)]
    pub toc: TocRules,
    #[serde(default)]
    pub content: ContentRules,
    /// Auxiliary script text. Only mined for the host list.
    #[serde(default)]
    pub js_lib: Option<String>,
    /// Login form descriptor, carried for collaborators.
    #[serde(default)]
    pub login_ui: Option<Value>,
    /// Key into the per-source variable store. Defaults to `source:<id>`.
    #[serde(default)]
    pub variable_key: Option<String>,

    #[serde(skip)]
    hosts: OnceLock<Vec<String>>,
}

fn default_enabled() -> bool {
    true
}

/// Book detail page rules.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookInfoRules {
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub init: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub name: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub author: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub cover: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub intro: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub kind: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub last_chapter: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub toc_url: Option<Rule>,
}

/// Table of contents rules.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocRules {
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub chapter_list: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub chapter_name: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub chapter_url: Option<Rule>,
    /// Script run once before chapter extraction, for its side effects.
    #[serde(default, deserialize_with = "deserialize_script")]
    pub pre_update_js: Option<String>,
    /// Script run over the extracted titles; may rewrite each one.
    #[serde(default, deserialize_with = "deserialize_script")]
    pub format_js: Option<String>,
}

/// Chapter content rules.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRules {
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub content: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub chapter_name: Option<Rule>,
    #[serde(default, deserialize_with = "deserialize_rule")]
    pub next_content_url: Option<Rule>,
    /// Regex whose matches are deleted from the text.
    #[serde(default)]
    pub source_regex: Option<String>,
    #[serde(default, deserialize_with = "deserialize_replace")]
    pub replace_regex: Option<ReplaceRule>,
}

/// How base headers are declared.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderSpec {
    Static(BTreeMap<String, String>),
    Script(String),
}

/// Post-extraction cleanup declared by `replaceRegex`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceRule {
    /// Delete every match.
    Delete(String),
    /// `##pattern##replacement`
    Substitute { pattern: String, replacement: String },
    /// Hand the text to a script as `result`.
    Script(String),
}

impl SourceDefinition {
    /// Host list mined from `js_lib`, computed once per definition.
    /// Empty when the source declares none.
    pub fn hosts(&self) -> &[String] {
        self.hosts.get_or_init(|| match self.js_lib.as_deref() {
            Some(script) => match extract_host_list(script) {
                Ok(hosts) => hosts,
                Err(_) => {
                    tracing::debug!(source = %self.id, "no host list in auxiliary script");
                    Vec::new()
                }
            },
            None => Vec::new(),
        })
    }

    pub fn variable_key(&self) -> String {
        self.variable_key.clone().filter(|k| !k.trim().is_empty()).unwrap_or_else(|| format!("source:{}", self.id))
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    /// Parses a definition from JSON text.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::QuireError::ConfigError(format!("invalid source definition: {}", e)))
    }
}

/// Strips an optional `<js>…</js>` / `@js:` wrapper from a script field.
fn script_body(raw: &str) -> Option<String> {
    match Rule::parse(raw)? {
        Rule::Script(body) => Some(body),
        other => Some(other.to_string()),
    }
}

fn deserialize_script<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(script_body))
}

fn deserialize_header<'de, D>(deserializer: D) -> std::result::Result<Option<HeaderSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Value> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(HeaderSpec::from_value))
}

fn deserialize_replace<'de, D>(deserializer: D) -> std::result::Result<Option<ReplaceRule>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(ReplaceRule::parse))
}

impl HeaderSpec {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(HeaderSpec::Static(header_map(map))),
            Value::String(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
                    return Some(HeaderSpec::Static(header_map(map)));
                }
                match Rule::parse(trimmed) {
                    Some(Rule::Script(body)) => Some(HeaderSpec::Script(body)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Normalizes a JSON object into string headers.
pub(crate) fn header_map(map: serde_json::Map<String, Value>) -> BTreeMap<String, String> {
    map.into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (name, value)
        })
        .collect()
}

impl ReplaceRule {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(Rule::Script(body)) = Rule::parse(trimmed) {
            return Some(ReplaceRule::Script(body));
        }

        if let Some(rest) = trimmed.strip_prefix("##") {
            return Some(match rest.split_once("##") {
                Some((pattern, replacement)) => {
                    ReplaceRule::Substitute { pattern: pattern.to_string(), replacement: replacement.to_string() }
                }
                None => ReplaceRule::Delete(rest.to_string()),
            });
        }

        Some(ReplaceRule::Delete(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r###"{
        "id": "demo",
        "name": "Demo Books",
        "header": "{\"User-Agent\": \"quire-test\", \"X-Level\": 3}",
        "bookInfo": { "name": "h1.title", "intro": "$.intro", "tocUrl": "a.toc@href" },
        "toc": { "chapterList": "ul#list@li", "chapterName": "a", "chapterUrl": "a@href", "formatJs": "<js>title.trim()</js>" },
        "content": { "content": "div#content@html", "replaceRegex": "##广告##" },
        "jsLib": "var hosts = ['https://demo.example'];"
    }"###;

    #[test]
    fn test_parse_definition() {
        let source = SourceDefinition::from_json(SOURCE).unwrap();

        assert!(source.enabled);
        assert_eq!(source.display_name(), "Demo Books");
        assert!(matches!(source.book_info.name, Some(Rule::Selector(_))));
        assert!(matches!(source.book_info.intro, Some(Rule::JsonPath(_))));
        assert!(source.book_info.author.is_none());
        assert_eq!(source.toc.format_js.as_deref(), Some("title.trim()"));
        assert_eq!(
            source.content.replace_regex,
            Some(ReplaceRule::Substitute { pattern: "广告".to_string(), replacement: String::new() })
        );
        assert_eq!(source.variable_key(), "source:demo");
    }

    #[test]
    fn test_static_header() {
        let source = SourceDefinition::from_json(SOURCE).unwrap();
        let Some(HeaderSpec::Static(headers)) = source.header else {
            panic!("expected static header");
        };
        assert_eq!(headers.get("User-Agent").map(String::as_str), Some("quire-test"));
        assert_eq!(headers.get("X-Level").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_script_header() {
        let source =
            SourceDefinition::from_json(r#"{"id": "s", "header": "<js>({'X-Sign': source.getVariable()})</js>"}"#)
                .unwrap();
        assert_eq!(source.header, Some(HeaderSpec::Script("({'X-Sign': source.getVariable()})".to_string())));
    }

    #[test]
    fn test_hosts_computed_from_js_lib() {
        let source = SourceDefinition::from_json(SOURCE).unwrap();
        assert_eq!(source.hosts(), ["https://demo.example".to_string()]);

        let bare = SourceDefinition::from_json(r#"{"id": "bare"}"#).unwrap();
        assert!(bare.hosts().is_empty());
    }

    #[test]
    fn test_replace_rule_forms() {
        assert_eq!(
            ReplaceRule::parse("##\\d+##N"),
            Some(ReplaceRule::Substitute { pattern: "\\d+".to_string(), replacement: "N".to_string() })
        );
        assert_eq!(ReplaceRule::parse("@js:result.trim()"), Some(ReplaceRule::Script("result.trim()".to_string())));
        assert_eq!(ReplaceRule::parse("ad\\s*block"), Some(ReplaceRule::Delete("ad\\s*block".to_string())));
        assert_eq!(ReplaceRule::parse(" "), None);
    }

    #[test]
    fn test_invalid_definition() {
        assert!(SourceDefinition::from_json("{\"name\": \"no id\"}").is_err());
    }
}
