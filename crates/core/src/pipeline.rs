//! Content pipeline.
//!
//! Each request kind runs the same sequence of stages:
//!
//! ```text
//! ResolveUrl -> MergeAuth -> Fetch -> ParseShape -> ExtractFields -> Sanitize -> Done
//! ```
//!
//! Unknown or disabled sources, missing required rules, unresolvable
//! relative URLs and network failures end the run with an error. Script
//! failures during extraction are logged and the field falls back:
//!
//! | Field | Fallbacks, in order |
//! | --- | --- |
//! | book name | rule, `<title>` without the site suffix, last URL path segment |
//! | intro | rule, common JSON description keys, `<meta name="description">` |
//! | chapter list | list rule, top-level JSON array |
//! | chapter content | script rule, JSON `content` field, selector / JSON-path rule |
//!
//! Extraction runs on the blocking pool since script evaluation and DOM
//! parsing are synchronous.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::Value;

use crate::fetch::Fetcher;
use crate::list::{Entity, FieldRules, extract_list};
use crate::request::{RequestDescriptor, join_url, parse_request};
use crate::resolve::{EvaluationContext, resolve, resolve_field, resolve_text};
use crate::rule::Rule;
use crate::sanitize::{SanitizeConfig, Sanitizer};
use crate::script::{DEFAULT_SCRIPT_HEAP_LIMIT_MB, DEFAULT_SCRIPT_TIMEOUT_MS, ScriptHost};
use crate::source::definition::header_map;
use crate::source::{BookInfoRules, ContentRules, HeaderSpec, SourceRepository, TocRules};
use crate::store::{ProxyRewriter, QueryProxyRewriter, Stores};
use crate::value::{Container, is_empty_value};
use crate::{QuireError, Result};

/// JSON keys tried, in order, when a source has no usable intro rule.
const DESCRIPTION_KEYS: [&str; 7] = ["intro", "description", "desc", "summary", "introduction", "bookIntro", "synopsis"];

/// Separators between a page title and the site name.
const TITLE_SEPARATORS: [&str; 5] = [" - ", " | ", " – ", " — ", "_"];

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-fetch timeout in milliseconds (default: 30000).
    pub fetch_timeout_ms: u64,

    /// Per-script timeout in milliseconds (default: 5000).
    pub script_timeout_ms: u64,

    /// Per-script V8 heap ceiling in megabytes (default: 64).
    pub script_heap_limit_mb: usize,

    /// User-Agent for requests that do not set one.
    pub user_agent: String,

    /// Maximum pages followed through `nextContentUrl` (default: 8).
    pub max_content_pages: usize,

    /// Content sanitization patterns.
    pub sanitize: SanitizeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 30_000,
            script_timeout_ms: DEFAULT_SCRIPT_TIMEOUT_MS,
            script_heap_limit_mb: DEFAULT_SCRIPT_HEAP_LIMIT_MB,
            user_agent: crate::fetch::FetchConfig::default().user_agent,
            max_content_pages: 8,
            sanitize: SanitizeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a new builder for EngineConfig.
    ///
    /// # Example
    ///
    /// ```rust
    /// use quire_core::EngineConfig;
    ///
    /// let config = EngineConfig::builder().fetch_timeout_ms(10_000).max_content_pages(3).build();
    /// assert_eq!(config.max_content_pages, 3);
    /// ```
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

/// Builder for EngineConfig.
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Creates a new builder with default values.
    pub fn new() -> Self {
        Self { config: EngineConfig::default() }
    }

    /// Sets the fetch timeout.
    pub fn fetch_timeout_ms(mut self, value: u64) -> Self {
        self.config.fetch_timeout_ms = value;
        self
    }

    /// Sets the script timeout.
    pub fn script_timeout_ms(mut self, value: u64) -> Self {
        self.config.script_timeout_ms = value;
        self
    }

    /// Sets the script heap ceiling.
    pub fn script_heap_limit_mb(mut self, value: usize) -> Self {
        self.config.script_heap_limit_mb = value;
        self
    }

    /// Sets the default User-Agent.
    pub fn user_agent(mut self, value: impl Into<String>) -> Self {
        self.config.user_agent = value.into();
        self
    }

    /// Sets the content page limit. Zero is treated as one.
    pub fn max_content_pages(mut self, value: usize) -> Self {
        self.config.max_content_pages = value.max(1);
        self
    }

    /// Sets the sanitization patterns.
    pub fn sanitize(mut self, value: SanitizeConfig) -> Self {
        self.config.sanitize = value;
        self
    }

    /// Builds the config.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The three endpoint kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    BookInfo,
    Toc,
    Content,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::BookInfo => write!(f, "bookInfo"),
            RequestKind::Toc => write!(f, "toc"),
            RequestKind::Content => write!(f, "content"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    ResolveUrl,
    MergeAuth,
    Fetch,
    ParseShape,
    ExtractFields,
    Sanitize,
    Done,
}

/// Book detail result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookInfo {
    pub name: String,
    pub author: String,
    pub cover_url: String,
    pub intro: String,
    pub kind: String,
    pub last_chapter: String,
    /// Absolute table-of-contents URL; the book URL when no rule is set.
    pub toc_url: String,
}

/// One table-of-contents entry.
pub type Chapter = Entity;

/// Chapter text result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterContent {
    pub title: String,
    /// Plain text, paragraphs separated by one blank line.
    pub content: String,
    /// Number of pages fetched, including the first.
    pub pages: usize,
}

/// A fetched and classified response.
struct Page {
    /// Request URL before any proxy rewrite.
    url: String,
    container: Container,
    /// The run's context, bound to this page's URL and inline context.
    ctx: EvaluationContext,
}

/// Runs source rules against fetched responses.
pub struct Engine {
    sources: Arc<dyn SourceRepository>,
    fetcher: Arc<dyn Fetcher>,
    stores: Stores,
    proxy: Arc<dyn ProxyRewriter>,
    host: ScriptHost,
    sanitizer: Arc<Sanitizer>,
    config: EngineConfig,
}

impl Engine {
    pub fn builder(sources: Arc<dyn SourceRepository>) -> EngineBuilder {
        EngineBuilder::new(sources)
    }

    /// Fetches and extracts book details.
    pub async fn fetch_book_info(&self, source_id: &str, url: &str) -> Result<BookInfo> {
        let kind = RequestKind::BookInfo;
        let ctx = self.context(source_id)?;
        let Page { url, container, ctx: page_ctx } = self.load(kind, &ctx, url).await?;

        stage(kind, &ctx, Stage::ExtractFields);
        let info =
            blocking(&page_ctx, move |ctx| extract_book_info(&ctx.source().book_info, &container, &url, ctx)).await?;

        stage(kind, &ctx, Stage::Done);
        Ok(info)
    }

    /// Fetches a table of contents and extracts its chapters in reading order.
    pub async fn fetch_chapter_list(&self, source_id: &str, url: &str) -> Result<Vec<Chapter>> {
        let kind = RequestKind::Toc;
        let ctx = self.context(source_id)?;
        if ctx.source().toc.chapter_list.is_none() {
            return Err(QuireError::MissingRule { kind: "toc", field: "chapterList" });
        }

        let Page { url, container, ctx: page_ctx } = self.load(kind, &ctx, url).await?;

        stage(kind, &ctx, Stage::ExtractFields);
        let chapters =
            blocking(&page_ctx, move |ctx| extract_chapters(&ctx.source().toc, &container, &url, ctx)).await?;

        tracing::debug!(source = %ctx.source().id, count = chapters.len(), "chapters extracted");
        stage(kind, &ctx, Stage::Done);
        Ok(chapters)
    }

    /// Fetches chapter text, following `nextContentUrl` pages.
    pub async fn fetch_chapter_content(&self, source_id: &str, url: &str) -> Result<ChapterContent> {
        let kind = RequestKind::Content;
        let ctx = self.context(source_id)?;
        if ctx.source().content.content.is_none() {
            return Err(QuireError::MissingRule { kind: "content", field: "content" });
        }

        let mut seen = HashSet::new();
        let mut next = Some(url.trim().to_string());
        let mut texts = Vec::new();
        let mut title = String::new();
        let mut pages = 0;

        while let Some(page_url) = next.take() {
            if pages >= self.config.max_content_pages || !seen.insert(page_url.clone()) {
                break;
            }

            let Page { url: page_url, container, ctx: page_ctx } = match self.load(kind, &ctx, &page_url).await {
                Ok(page) => page,
                Err(e) if pages == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!(source = %ctx.source().id, url = %page_url, error = %e, "stopping at failed continuation page");
                    break;
                }
            };
            pages += 1;
            seen.insert(page_url.clone());

            stage(kind, &ctx, Stage::ExtractFields);
            let sanitizer = Arc::clone(&self.sanitizer);
            let extracted = blocking(&page_ctx, move |ctx| {
                let rules = &ctx.source().content;
                let mut extracted = extract_content_page(rules, &container, &page_url, ctx);
                stage(kind, ctx, Stage::Sanitize);
                extracted.text = sanitizer.sanitize(&extracted.text, rules, ctx);
                extracted
            })
            .await?;

            if title.is_empty() {
                title = extracted.title;
            }
            if !extracted.text.is_empty() {
                texts.push(extracted.text);
            }
            next = extracted.next;
        }

        stage(kind, &ctx, Stage::Done);
        Ok(ChapterContent { title, content: texts.join("\n\n"), pages })
    }

    fn context(&self, source_id: &str) -> Result<EvaluationContext> {
        let source = self.sources.get_source(source_id)?;
        if !source.enabled {
            return Err(QuireError::DisabledSource(source_id.to_string()));
        }
        Ok(EvaluationContext::new(source, self.stores.clone(), self.host.clone()))
    }

    async fn load(&self, kind: RequestKind, ctx: &EvaluationContext, raw_url: &str) -> Result<Page> {
        let source = ctx.source();

        stage(kind, ctx, Stage::ResolveUrl);
        let mut request = parse_request(raw_url, source.hosts())?;
        let page_url = request.url.clone();

        let page_ctx = ctx.clone().with_base_url(page_url.clone());
        let page_ctx = match request.inline.as_ref().and_then(|inline| inline.context.clone()) {
            Some(context) => page_ctx.with_context(context),
            None => page_ctx,
        };

        stage(kind, ctx, Stage::MergeAuth);
        let base = self.base_headers(&page_ctx).await?;
        let cookie =
            if request.is_inline() { String::new() } else { self.stores.auth.cookie_for_url(&source.id, &request.url) };
        request.headers = merge_headers(base, std::mem::take(&mut request.headers), &cookie);

        if let Some(proxy_base) = source.proxy_base.as_deref().filter(|p| !p.trim().is_empty())
            && !request.is_inline()
        {
            request.url = self.proxy.rewrite_via_proxy_base(&request.url, proxy_base);
        }

        stage(kind, ctx, Stage::Fetch);
        let body = self.fetch_body(&request).await?;

        stage(kind, ctx, Stage::ParseShape);
        let container = Container::from_body(&body);
        if container.is_empty() {
            tracing::warn!(source = %source.id, url = %page_url, "{}", QuireError::ParseError("empty response body".to_string()));
        }

        Ok(Page { url: page_url, container, ctx: page_ctx })
    }

    async fn fetch_body(&self, request: &RequestDescriptor) -> Result<String> {
        if let Some(inline) = &request.inline {
            return Ok(inline.body.clone());
        }
        self.fetcher.fetch(request, self.config.fetch_timeout_ms).await
    }

    async fn base_headers(&self, ctx: &EvaluationContext) -> Result<BTreeMap<String, String>> {
        match &ctx.source().header {
            None => Ok(BTreeMap::new()),
            Some(HeaderSpec::Static(headers)) => Ok(headers.clone()),
            Some(HeaderSpec::Script(body)) => {
                let body = body.clone();
                blocking(ctx, move |ctx| match ctx.run_script(&body, Value::Null) {
                    Ok(value) => script_headers(value),
                    Err(e) => {
                        tracing::warn!(source = %ctx.source().id, error = %e, "header script failed; sending no base headers");
                        BTreeMap::new()
                    }
                })
                .await
            }
        }
    }
}

/// Builder for Engine.
pub struct EngineBuilder {
    sources: Arc<dyn SourceRepository>,
    fetcher: Option<Arc<dyn Fetcher>>,
    stores: Stores,
    proxy: Arc<dyn ProxyRewriter>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(sources: Arc<dyn SourceRepository>) -> Self {
        Self {
            sources,
            fetcher: None,
            stores: Stores::default(),
            proxy: Arc::new(QueryProxyRewriter),
            config: EngineConfig::default(),
        }
    }

    /// Sets the fetcher. Defaults to the HTTP fetcher.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Sets the auth, variable and cache stores. Defaults to in-memory stores.
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = stores;
        self
    }

    pub fn proxy_rewriter(mut self, proxy: Arc<dyn ProxyRewriter>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine, compiling the sanitize patterns.
    pub fn build(self) -> Result<Engine> {
        let sanitizer = Sanitizer::new(&self.config.sanitize)?;
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => default_fetcher(&self.config)?,
        };

        Ok(Engine {
            sources: self.sources,
            fetcher,
            stores: self.stores,
            proxy: self.proxy,
            host: ScriptHost::new(self.config.script_timeout_ms).with_heap_limit_mb(self.config.script_heap_limit_mb),
            sanitizer: Arc::new(sanitizer),
            config: self.config,
        })
    }
}

#[cfg(feature = "fetch")]
fn default_fetcher(config: &EngineConfig) -> Result<Arc<dyn Fetcher>> {
    let fetch_config = crate::fetch::FetchConfig { user_agent: config.user_agent.clone() };
    Ok(Arc::new(crate::fetch::HttpFetcher::new(fetch_config)?))
}

#[cfg(not(feature = "fetch"))]
fn default_fetcher(_config: &EngineConfig) -> Result<Arc<dyn Fetcher>> {
    Err(QuireError::ConfigError("no fetcher configured and the `fetch` feature is disabled".to_string()))
}

fn stage(kind: RequestKind, ctx: &EvaluationContext, current: Stage) {
    tracing::debug!(source = %ctx.source().id, kind = %kind, stage = ?current, "pipeline stage");
}

/// Runs `f` on the blocking pool with a clone of the context. Shared
/// variables written there are visible to the caller's context.
///
/// A panic inside `f` is re-raised on the caller; a cancelled task is a
/// non-recoverable error, never a field-level fallback.
async fn blocking<T, F>(ctx: &EvaluationContext, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&EvaluationContext) -> T + Send + 'static,
{
    let ctx = ctx.clone();
    match tokio::task::spawn_blocking(move || f(&ctx)).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(QuireError::ConfigError(format!("extraction task cancelled: {}", e))),
    }
}

/// Base headers < URL-embedded overrides < cookie. Names compare
/// case-insensitively; an empty cookie never replaces an existing one.
fn merge_headers(
    base: BTreeMap<String, String>, overrides: BTreeMap<String, String>, cookie: &str,
) -> BTreeMap<String, String> {
    let mut merged = base;
    for (name, value) in overrides {
        merged.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
        merged.insert(name, value);
    }

    if !cookie.trim().is_empty() {
        merged.retain(|existing, _| !existing.eq_ignore_ascii_case("cookie"));
        merged.insert("Cookie".to_string(), cookie.trim().to_string());
    }

    merged
}

fn script_headers(value: Value) -> BTreeMap<String, String> {
    match value {
        Value::Object(map) => header_map(map),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => header_map(map),
            _ => BTreeMap::new(),
        },
        _ => BTreeMap::new(),
    }
}

fn extract_book_info(rules: &BookInfoRules, container: &Container, url: &str, ctx: &EvaluationContext) -> BookInfo {
    let initialized = rules.init.as_ref().and_then(|rule| match resolve(rule, container, ctx) {
        Ok(value) if !is_empty_value(&value) => Some(Container::from_item(value)),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(source = %ctx.source().id, error = %e, "init rule failed; using response as is");
            None
        }
    });
    let scoped = initialized.as_ref().unwrap_or(container);
    let field = |rule: &Option<Rule>, name: &str| resolve_field(rule.as_ref(), scoped, ctx, name);

    let mut name = field(&rules.name, "name");
    if name.is_empty() {
        name = title_fallback(container, url);
    }

    let mut intro = field(&rules.intro, "intro");
    if intro.is_empty() {
        intro = description_fallback(scoped).or_else(|| description_fallback(container)).unwrap_or_default();
    }

    let cover = field(&rules.cover, "cover");
    let toc_url = field(&rules.toc_url, "tocUrl");

    BookInfo {
        name,
        author: field(&rules.author, "author"),
        cover_url: if cover.is_empty() { cover } else { join_url(&cover, url) },
        intro,
        kind: field(&rules.kind, "kind"),
        last_chapter: field(&rules.last_chapter, "lastChapter"),
        toc_url: if toc_url.is_empty() { url.to_string() } else { join_url(&toc_url, url) },
    }
}

fn extract_chapters(rules: &TocRules, container: &Container, url: &str, ctx: &EvaluationContext) -> Vec<Chapter> {
    if let Some(body) = &rules.pre_update_js
        && let Err(e) = ctx.run_script(body, container.to_json())
    {
        tracing::warn!(source = %ctx.source().id, error = %e, "preUpdateJs failed; continuing");
    }

    let fields = FieldRules { title: rules.chapter_name.as_ref(), url: rules.chapter_url.as_ref(), intro: None };
    let mut chapters = extract_list(container, rules.chapter_list.as_ref(), fields, Some(url), ctx);

    if let Some(body) = &rules.format_js
        && !chapters.is_empty()
    {
        let titles: Vec<Value> = chapters.iter().map(|c| Value::String(c.title.clone())).collect();
        match ctx.run_script_each(body, "title", &titles) {
            Ok(formatted) => {
                for (chapter, value) in chapters.iter_mut().zip(formatted) {
                    if let Value::String(title) = value
                        && !title.trim().is_empty()
                    {
                        chapter.title = title.trim().to_string();
                    }
                }
            }
            Err(e) => tracing::warn!(source = %ctx.source().id, error = %e, "formatJs failed; titles kept"),
        }
    }

    chapters
}

struct ContentPage {
    title: String,
    text: String,
    next: Option<String>,
}

fn extract_content_page(rules: &ContentRules, container: &Container, url: &str, ctx: &EvaluationContext) -> ContentPage {
    let text = rules.content.as_ref().map(|rule| content_text(rule, container, ctx)).unwrap_or_default();
    let next = resolve_field(rules.next_content_url.as_ref(), container, ctx, "nextContentUrl");

    ContentPage {
        title: resolve_field(rules.chapter_name.as_ref(), container, ctx, "chapterName"),
        text,
        next: if next.is_empty() { None } else { Some(join_url(&next, url)) },
    }
}

fn content_text(rule: &Rule, container: &Container, ctx: &EvaluationContext) -> String {
    if rule.is_script() {
        match resolve_text(rule, container, ctx) {
            Ok(text) if !text.is_empty() => return text,
            Ok(_) => {}
            Err(e) => tracing::warn!(source = %ctx.source().id, error = %e, "content script failed; trying fallbacks"),
        }
    }

    if let Some(text) = json_content_field(container) {
        return text;
    }

    match rule {
        Rule::Hybrid { base, .. } => resolve_field(Some(base), container, ctx, "content"),
        Rule::Script(_) => String::new(),
        other => resolve_field(Some(other), container, ctx, "content"),
    }
}

fn json_content_field(container: &Container) -> Option<String> {
    let json = container.as_json()?;
    [json.get("content"), json.get("data").and_then(|data| data.get("content"))]
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

/// `<title>` without the site suffix, else the last URL path segment.
fn title_fallback(container: &Container, url: &str) -> String {
    if let Container::Markup(html) = container
        && let Some(title) = document_title(html)
    {
        return title;
    }
    last_path_segment(url).unwrap_or_default()
}

fn document_title(html: &str) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let document = Html::parse_document(html);
    let raw: String = document.select(&selector).next()?.text().collect();
    let raw = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let title = TITLE_SEPARATORS
        .iter()
        .find_map(|sep| raw.split_once(sep).map(|(head, _)| head.trim().to_string()).filter(|h| !h.is_empty()))
        .unwrap_or(raw);

    if title.is_empty() { None } else { Some(title) }
}

fn last_path_segment(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.rev().find(|s| !s.is_empty())?.to_string();

    // form_urlencoded also decodes percent escapes
    let decoded: String = url::form_urlencoded::parse(format!("s={}", segment).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or(segment);

    let stem = match decoded.rsplit_once('.') {
        Some((stem, ext)) if matches!(ext, "html" | "htm" | "shtml" | "php" | "aspx" | "jsp") => stem.to_string(),
        _ => decoded,
    };
    let normalized = stem.replace(['-', '_'], " ").split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() { None } else { Some(normalized) }
}

fn description_fallback(container: &Container) -> Option<String> {
    match container {
        Container::Json(json) => {
            let scopes = [Some(json), json.get("data")];
            scopes.into_iter().flatten().find_map(|scope| {
                DESCRIPTION_KEYS
                    .iter()
                    .filter_map(|key| scope.get(key).and_then(Value::as_str))
                    .map(str::trim)
                    .find(|text| !text.is_empty())
                    .map(str::to_string)
            })
        }
        Container::Markup(html) => {
            let selector = Selector::parse(r#"meta[name="description"], meta[property="og:description"]"#).ok()?;
            let document = Html::parse_document(html);
            document
                .select(&selector)
                .filter_map(|el| el.value().attr("content"))
                .map(str::trim)
                .find(|text| !text.is_empty())
                .map(str::to_string)
        }
        Container::Empty => None,
    }
}
