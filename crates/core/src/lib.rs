//! # quire-core
//!
//! Rule-driven acquisition of book metadata, tables of contents and chapter
//! text from reading sites that expose no stable API.
//!
//! Each site is described by a [`SourceDefinition`]: request headers, an
//! optional proxy, and three sets of rules (book info, table of contents,
//! chapter content). Rules come in four dialects, classified once at load
//! time into [`Rule`]:
//!
//! - CSS selector chains with `@attribute` and `||` alternation,
//! - `$.`-prefixed JSON paths,
//! - sandboxed scripts (`<js>…</js>` or `@js:…`),
//! - a selector or path whose result is post-processed by a script.
//!
//! The [`Engine`] runs the content pipeline for a `(source id, url)` pair:
//! resolve the URL, merge headers and cookies, fetch, classify the body,
//! extract fields with fallbacks, and sanitize chapter text.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quire_core::{DirectorySourceRepository, Engine};
//!
//! # async fn run() -> quire_core::Result<()> {
//! let sources = Arc::new(DirectorySourceRepository::from_dir("sources"));
//! let engine = Engine::builder(sources).build()?;
//!
//! let chapters = engine.fetch_chapter_list("example", "https://example.com/book/1/").await?;
//! for chapter in chapters {
//!     println!("{} -> {}", chapter.title, chapter.url);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `fetch` (default): HTTP fetching through `reqwest`. Without it, supply a
//!   [`Fetcher`] to [`EngineBuilder::fetcher`].

pub mod error;
pub mod fetch;
pub mod hosts;
pub mod list;
pub mod pipeline;
pub mod request;
pub mod resolve;
pub mod rule;
pub mod sanitize;
pub mod script;
pub mod selector;
pub mod source;
pub mod store;
pub mod value;

pub use error::{ErrorKind, QuireError, Result};
#[cfg(feature = "fetch")]
pub use fetch::HttpFetcher;
pub use fetch::{FetchConfig, Fetcher};
pub use hosts::extract_host_list;
pub use list::{Entity, FieldRules, extract_list};
pub use pipeline::{
    BookInfo, Chapter, ChapterContent, Engine, EngineBuilder, EngineConfig, EngineConfigBuilder, RequestKind,
};
pub use request::{InlinePayload, Method, RequestDescriptor, parse_request};
pub use resolve::{EvaluationContext, resolve, resolve_list, resolve_text};
pub use rule::Rule;
pub use sanitize::{SanitizeConfig, SanitizeConfigBuilder, Sanitizer};
pub use script::{ScriptCapabilities, ScriptHost, ScriptInput, ScriptOutput};
pub use source::{
    BookInfoRules, ContentRules, DirectorySourceRepository, DirectorySourceRepositoryBuilder, HeaderSpec,
    MemorySourceRepository, ReplaceRule, SourceDefinition, SourceRepository, TocRules,
};
pub use store::{AuthStore, MemoryStore, ProxyRewriter, QueryProxyRewriter, ScriptCache, Stores, VariableStore};
pub use value::Container;
