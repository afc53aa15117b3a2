//! Chapter text sanitization.
//!
//! Turns extracted content markup into plain text with one blank line
//! between paragraphs. Sites regularly leak inline styles and scripts into
//! the content node, so after stripping tags the text is scanned for
//! declaration-shaped blocks and lines. Those heuristics are data
//! ([`SanitizeConfig`]) rather than code.

use regex::Regex;
use scraper::Html;
use serde_json::Value;
use std::sync::LazyLock;

use crate::resolve::EvaluationContext;
use crate::source::{ContentRules, ReplaceRule};
use crate::value::value_to_text;
use crate::{QuireError, Result};

static BREAK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static PARAGRAPH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?(?:p|div|h[1-6]|li|blockquote|section)\b[^>]*>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

/// Pattern seed for leaked style/script detection and boilerplate removal.
#[derive(Debug, Clone)]
pub struct SanitizeConfig {
    /// Regexes whose matches are removed from the whole text.
    pub block_patterns: Vec<String>,
    /// Regexes; any line matching one is dropped.
    pub line_patterns: Vec<String>,
    /// Literal strings removed case-insensitively.
    pub boilerplate: Vec<String>,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            block_patterns: vec![
                // CSS rule: `selector { prop: value; ... }`
                r"[.#]?[A-Za-z][\w\-]*(?:\s*[,>+~]?\s*[.#:]?[A-Za-z][\w\-]*)*\s*\{[^{}]*:[^{}]*;[^{}]*\}".to_string(),
                r"(?s)@media[^{]*\{(?:[^{}]*\{[^{}]*\})*[^{}]*\}".to_string(),
                // function declarations and immediately invoked function expressions
                r"(?s)\(function\s*\([^)]*\)\s*\{.*?\}\)\s*\([^)]*\)\s*;?".to_string(),
                r"function\s+\w+\s*\([^)]*\)\s*\{[^{}]*\}".to_string(),
            ],
            line_patterns: vec![
                r"^\s*(?:var|let|const)\s+[\w$]+\s*=.*;\s*$".to_string(),
                r"^\s*(?:document|window)\.[\w$.]+.*[;)]\s*$".to_string(),
                r"^\s*[a-z\-]+\s*:\s*[^;:]+;\s*$".to_string(),
                r"^\s*[{}();]+\s*$".to_string(),
            ],
            boilerplate: vec!["please log in again".to_string(), "请重新登录".to_string()],
        }
    }
}

impl SanitizeConfig {
    pub fn builder() -> SanitizeConfigBuilder {
        SanitizeConfigBuilder::new()
    }
}

/// Builder for SanitizeConfig.
pub struct SanitizeConfigBuilder {
    config: SanitizeConfig,
}

impl SanitizeConfigBuilder {
    /// Creates a new builder with the default seed.
    pub fn new() -> Self {
        Self { config: SanitizeConfig::default() }
    }

    /// Adds a block pattern.
    pub fn block_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.block_patterns.push(pattern.into());
        self
    }

    /// Adds a line pattern.
    pub fn line_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.line_patterns.push(pattern.into());
        self
    }

    /// Adds a boilerplate string.
    pub fn boilerplate(mut self, text: impl Into<String>) -> Self {
        self.config.boilerplate.push(text.into());
        self
    }

    /// Drops every seeded pattern, keeping only what is added afterwards.
    pub fn clear(mut self) -> Self {
        self.config = SanitizeConfig { block_patterns: Vec::new(), line_patterns: Vec::new(), boilerplate: Vec::new() };
        self
    }

    pub fn build(self) -> SanitizeConfig {
        self.config
    }
}

impl Default for SanitizeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiled form of a [`SanitizeConfig`].
#[derive(Debug, Clone)]
pub struct Sanitizer {
    blocks: Vec<Regex>,
    lines: Vec<Regex>,
    boilerplate: Vec<Regex>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(&SanitizeConfig::default())
            .unwrap_or(Self { blocks: Vec::new(), lines: Vec::new(), boilerplate: Vec::new() })
    }
}

impl Sanitizer {
    pub fn new(config: &SanitizeConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| QuireError::ConfigError(format!("invalid sanitize pattern '{}': {}", pattern, e)))
        };

        Ok(Self {
            blocks: config.block_patterns.iter().map(|p| compile(p)).collect::<Result<_>>()?,
            lines: config.line_patterns.iter().map(|p| compile(p)).collect::<Result<_>>()?,
            boilerplate: config
                .boilerplate
                .iter()
                .filter(|text| !text.trim().is_empty())
                .map(|text| compile(&format!("(?i){}", regex::escape(text))))
                .collect::<Result<_>>()?,
        })
    }

    /// Markup to paragraph text, without any source-specific cleanup.
    pub fn clean(&self, html: &str) -> String {
        paragraphs(&self.to_text(html))
    }

    /// Full sanitization: [`Sanitizer::clean`] plus the source's
    /// `sourceRegex` and `replaceRegex`.
    pub fn sanitize(&self, html: &str, rules: &ContentRules, ctx: &EvaluationContext) -> String {
        let mut text = self.to_text(html);

        if let Some(pattern) = rules.source_regex.as_deref().filter(|p| !p.trim().is_empty()) {
            text = match Regex::new(pattern) {
                Ok(re) => re.replace_all(&text, "").into_owned(),
                Err(e) => {
                    tracing::warn!(source = %ctx.source().id, error = %e, "invalid sourceRegex ignored");
                    text
                }
            };
        }

        if let Some(rule) = &rules.replace_regex {
            text = apply_replace(rule, text, ctx);
        }

        paragraphs(&text)
    }

    fn to_text(&self, html: &str) -> String {
        let html = remove_code_elements(html);
        let html = COMMENT_RE.replace_all(&html, "");
        let html = BREAK_RE.replace_all(&html, "\n");
        let html = PARAGRAPH_RE.replace_all(&html, "\n\n");
        let stripped = TAG_RE.replace_all(&html, "");
        let mut text = decode_entities(&stripped);

        for re in &self.blocks {
            text = re.replace_all(&text, "").into_owned();
        }

        text = text.lines().filter(|line| !self.lines.iter().any(|re| re.is_match(line))).collect::<Vec<_>>().join("\n");

        for re in &self.boilerplate {
            text = re.replace_all(&text, "").into_owned();
        }

        text
    }
}

fn apply_replace(rule: &ReplaceRule, text: String, ctx: &EvaluationContext) -> String {
    let (pattern, replacement) = match rule {
        ReplaceRule::Delete(pattern) => (pattern, ""),
        ReplaceRule::Substitute { pattern, replacement } => (pattern, replacement.as_str()),
        ReplaceRule::Script(body) => {
            return match ctx.run_script(body, Value::String(text.clone())) {
                Ok(Value::Null) => text,
                Ok(value) => value_to_text(&value),
                Err(e) => {
                    tracing::warn!(source = %ctx.source().id, error = %e, "replaceRegex script failed; text kept");
                    text
                }
            };
        }
    };

    match Regex::new(pattern) {
        Ok(re) => re.replace_all(&text, replacement).into_owned(),
        Err(e) => {
            tracing::warn!(source = %ctx.source().id, error = %e, "invalid replaceRegex ignored");
            text
        }
    }
}

/// Removes script, style and noscript elements with their content.
fn remove_code_elements(html: &str) -> String {
    let mut output = String::new();
    let mut rewriter = lol_html::HtmlRewriter::new(
        lol_html::Settings {
            element_content_handlers: vec![
                lol_html::element!("script", |el| {
                    el.remove();
                    Ok(())
                }),
                lol_html::element!("style", |el| {
                    el.remove();
                    Ok(())
                }),
                lol_html::element!("noscript", |el| {
                    el.remove();
                    Ok(())
                }),
            ],
            ..Default::default()
        },
        |c: &[u8]| {
            output.push_str(&String::from_utf8_lossy(c));
        },
    );

    if rewriter.write(html.as_bytes()).is_err() || rewriter.end().is_err() {
        return html.to_string();
    }

    output
}

/// Decodes character references in tag-free text.
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let escaped = text.replace('<', "&lt;").replace('>', "&gt;");
    let fragment = Html::parse_fragment(&escaped);
    fragment.root_element().text().collect()
}

/// Trims every line, drops blank ones and separates the rest with one blank line.
fn paragraphs(text: &str) -> String {
    text.lines().map(str::trim).filter(|line| !line.is_empty()).collect::<Vec<_>>().join("\n\n")
}
