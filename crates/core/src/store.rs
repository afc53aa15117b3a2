//! Collaborator interfaces the engine consumes but does not own.
//!
//! The engine keeps no state between requests. Cookies, per-source variables
//! and the script cache live behind these traits; implementations must be
//! safe to share across concurrent requests (last write wins per key is
//! enough). [`MemoryStore`] is a process-local implementation of all three
//! stores, suitable for tests and the CLI.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use url::Url;

/// Supplies and receives cookies keyed by source id and URL origin.
pub trait AuthStore: Send + Sync {
    /// Returns the `Cookie` header value for `url`, or an empty string.
    fn cookie_for_url(&self, source_id: &str, url: &str) -> String;

    /// Stores a cookie header for the origin of `url`.
    fn set_cookie(&self, source_id: &str, url: &str, cookie: &str);
}

/// Per-source persistent variable, keyed by the source's variable-store key.
pub trait VariableStore: Send + Sync {
    fn get_variable(&self, key: &str) -> Option<String>;
    fn set_variable(&self, key: &str, value: &str);
}

/// Small key-value cache exposed to scripts.
pub trait ScriptCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str);
}

/// Rewrites a URL so the request goes through a source's proxy.
pub trait ProxyRewriter: Send + Sync {
    fn rewrite_via_proxy_base(&self, url: &str, proxy_base: &str) -> String;
}

/// Default proxy rewriting: `<proxy_base>?url=<percent-encoded url>`, or
/// `&url=` when the base already carries a query.
#[derive(Debug, Clone, Default)]
pub struct QueryProxyRewriter;

impl ProxyRewriter for QueryProxyRewriter {
    fn rewrite_via_proxy_base(&self, url: &str, proxy_base: &str) -> String {
        let proxy_base = proxy_base.trim();
        if proxy_base.is_empty() {
            return url.to_string();
        }

        let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
        let separator = if proxy_base.contains('?') { '&' } else { '?' };
        format!("{}{}url={}", proxy_base, separator, encoded)
    }
}

/// Origin (`scheme://host[:port]`) of a URL, used as the cookie key.
pub fn url_origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let origin = parsed.origin();
    if origin.is_tuple() { Some(origin.ascii_serialization()) } else { None }
}

/// The externally owned stores handed to every evaluation.
#[derive(Clone)]
pub struct Stores {
    pub auth: Arc<dyn AuthStore>,
    pub variables: Arc<dyn VariableStore>,
    pub cache: Arc<dyn ScriptCache>,
}

impl Stores {
    /// All three stores backed by one [`MemoryStore`].
    pub fn memory(store: MemoryStore) -> Self {
        Self { auth: Arc::new(store.clone()), variables: Arc::new(store.clone()), cache: Arc::new(store) }
    }
}

impl Default for Stores {
    fn default() -> Self {
        Self::memory(MemoryStore::new())
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// In-memory implementation of every store trait.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    cookies: Arc<RwLock<HashMap<(String, String), String>>>,
    variables: Arc<RwLock<HashMap<String, String>>>,
    cache: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthStore for MemoryStore {
    fn cookie_for_url(&self, source_id: &str, url: &str) -> String {
        let Some(origin) = url_origin(url) else {
            return String::new();
        };
        self.cookies
            .read()
            .map(|cookies| cookies.get(&(source_id.to_string(), origin)).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn set_cookie(&self, source_id: &str, url: &str, cookie: &str) {
        if let Some(origin) = url_origin(url)
            && let Ok(mut cookies) = self.cookies.write()
        {
            cookies.insert((source_id.to_string(), origin), cookie.to_string());
        }
    }
}

impl VariableStore for MemoryStore {
    fn get_variable(&self, key: &str) -> Option<String> {
        self.variables.read().ok()?.get(key).cloned()
    }

    fn set_variable(&self, key: &str, value: &str) {
        if let Ok(mut variables) = self.variables.write() {
            variables.insert(key.to_string(), value.to_string());
        }
    }
}

impl ScriptCache for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.read().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key.to_string(), value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_keyed_by_origin() {
        let store = MemoryStore::new();
        store.set_cookie("s1", "https://example.com/login", "token=abc");

        assert_eq!(store.cookie_for_url("s1", "https://example.com/book/1"), "token=abc");
        assert_eq!(store.cookie_for_url("s1", "https://other.com/book/1"), "");
        assert_eq!(store.cookie_for_url("s2", "https://example.com/book/1"), "");
    }

    #[test]
    fn test_variables_and_cache() {
        let store = MemoryStore::new();
        assert_eq!(store.get_variable("k"), None);
        store.set_variable("k", "v");
        assert_eq!(store.get_variable("k"), Some("v".to_string()));

        ScriptCache::put(&store, "token", "123");
        assert_eq!(ScriptCache::get(&store, "token"), Some("123".to_string()));
    }

    #[test]
    fn test_query_proxy_rewriter() {
        let rewriter = QueryProxyRewriter;
        assert_eq!(
            rewriter.rewrite_via_proxy_base("https://h/a?b=1", "https://proxy.test/fetch"),
            "https://proxy.test/fetch?url=https%3A%2F%2Fh%2Fa%3Fb%3D1"
        );
        assert_eq!(rewriter.rewrite_via_proxy_base("https://h/a", ""), "https://h/a");
    }

    #[test]
    fn test_url_origin() {
        assert_eq!(url_origin("https://example.com:8443/x"), Some("https://example.com:8443".to_string()));
        assert_eq!(url_origin("not a url"), None);
    }
}
