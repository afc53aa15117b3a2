//! Rule dialect classification.
//!
//! Rule strings are classified exactly once, when a source definition is
//! loaded, into one of four dialects:
//!
//! | Form | Dialect |
//! | --- | --- |
//! | `<js>…</js>` or `@js:…` | [`Rule::Script`] |
//! | `$.a.b` (alternatives with `\|\|`) | [`Rule::JsonPath`] |
//! | `<selector or path>@js:…` / `<selector or path><js>…</js>` | [`Rule::Hybrid`] |
//! | `tag.class#id@tag@attribute` (alternatives with `\|\|`) | [`Rule::Selector`] |

use serde::{Deserialize, Deserializer};
use std::fmt;

const JSON_PATH_MARKER: &str = "$.";
const SCRIPT_PREFIX: &str = "@js:";
const SCRIPT_OPEN: &str = "<js>";
const SCRIPT_CLOSE: &str = "</js>";

/// A classified rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// Selector chains tried in order; first non-empty wins.
    Selector(Vec<SelectorChain>),
    /// JSON paths tried in order; first non-empty wins.
    JsonPath(Vec<JsonPath>),
    /// A script body run in the sandbox with the container bound as `result`.
    Script(String),
    /// A selector or JSON path whose result is post-processed by a script.
    Hybrid { base: Box<Rule>, script: String },
}

/// One `@`-separated selector chain, e.g. `div.info@a@href`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorChain {
    pub tokens: Vec<String>,
}

/// The keys of one `$.`-rule, e.g. `$.data.list` → `["data", "list"]`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    pub keys: Vec<String>,
}

impl Rule {
    /// Classifies a raw rule string. Blank rules classify to `None`.
    pub fn parse(raw: &str) -> Option<Rule> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(body) = trimmed.strip_prefix(SCRIPT_PREFIX) {
            return Some(Rule::Script(body.trim().to_string()));
        }

        if trimmed.starts_with(SCRIPT_OPEN) && trimmed.ends_with(SCRIPT_CLOSE) && is_single_block(trimmed) {
            let body = &trimmed[SCRIPT_OPEN.len()..trimmed.len() - SCRIPT_CLOSE.len()];
            return Some(Rule::Script(body.trim().to_string()));
        }

        if let Some((base, script)) = split_hybrid(trimmed) {
            return match Rule::parse(base) {
                Some(base) => Some(Rule::Hybrid { base: Box::new(base), script }),
                None => Some(Rule::Script(script)),
            };
        }

        if trimmed.starts_with(JSON_PATH_MARKER) {
            let paths = trimmed
                .split("||")
                .map(str::trim)
                .filter(|alt| !alt.is_empty())
                .map(JsonPath::parse)
                .collect();
            return Some(Rule::JsonPath(paths));
        }

        let chains: Vec<SelectorChain> = trimmed
            .split("||")
            .map(str::trim)
            .filter(|alt| !alt.is_empty())
            .map(SelectorChain::parse)
            .collect();
        if chains.is_empty() { None } else { Some(Rule::Selector(chains)) }
    }

    pub fn is_script(&self) -> bool {
        matches!(self, Rule::Script(_) | Rule::Hybrid { .. })
    }
}

impl JsonPath {
    fn parse(raw: &str) -> Self {
        let rest = raw.strip_prefix(JSON_PATH_MARKER).unwrap_or(raw);
        let keys = rest
            .split('.')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect();
        Self { keys }
    }
}

impl SelectorChain {
    /// A leading `@` keeps an empty first token, which stands for the
    /// item's own root element.
    fn parse(raw: &str) -> Self {
        let mut tokens: Vec<String> = raw
            .split('@')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect();
        if raw.trim_start().starts_with('@') && !tokens.is_empty() {
            tokens.insert(0, String::new());
        }
        Self { tokens }
    }
}

/// `<js>a</js><js>b</js>` is not a single script block.
fn is_single_block(rule: &str) -> bool {
    rule.matches(SCRIPT_OPEN).count() == 1
}

fn split_hybrid(rule: &str) -> Option<(&str, String)> {
    if let Some(idx) = rule.find(SCRIPT_PREFIX) {
        let script = rule[idx + SCRIPT_PREFIX.len()..].trim().to_string();
        return Some((&rule[..idx], script));
    }

    if let Some(idx) = rule.find(SCRIPT_OPEN)
        && rule.ends_with(SCRIPT_CLOSE)
    {
        let script = rule[idx + SCRIPT_OPEN.len()..rule.len() - SCRIPT_CLOSE.len()].trim().to_string();
        return Some((&rule[..idx], script));
    }

    None
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Selector(chains) => {
                let alts: Vec<String> = chains.iter().map(|c| c.tokens.join("@")).collect();
                write!(f, "{}", alts.join("||"))
            }
            Rule::JsonPath(paths) => {
                let alts: Vec<String> = paths.iter().map(|p| format!("$.{}", p.keys.join("."))).collect();
                write!(f, "{}", alts.join("||"))
            }
            Rule::Script(body) => write!(f, "<js>{}</js>", body),
            Rule::Hybrid { base, script } => write!(f, "{}@js:{}", base, script),
        }
    }
}

/// Deserializes an optional rule field, classifying it on the way in.
pub fn deserialize_rule<'de, D>(deserializer: D) -> std::result::Result<Option<Rule>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(Rule::parse))
}
