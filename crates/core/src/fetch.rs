//! Response fetching.
//!
//! The pipeline only depends on the [`Fetcher`] trait. [`HttpFetcher`] is the
//! `reqwest` implementation behind the `fetch` feature; tests and embedders
//! can supply their own.

use async_trait::async_trait;

use crate::Result;
use crate::request::RequestDescriptor;

/// Performs one request and returns the response body as text.
///
/// Implementations must honor `timeout_ms` and report it as
/// [`crate::QuireError::Timeout`]; non-success statuses are
/// [`crate::QuireError::Status`]. No retries.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &RequestDescriptor, timeout_ms: u64) -> Result<String>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User-Agent sent when the request does not set one.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { user_agent: "Mozilla/5.0 (compatible; Quire/0.1)".to_string() }
    }
}

#[cfg(feature = "fetch")]
pub use http::HttpFetcher;

#[cfg(feature = "fetch")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::Client;
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
    use url::Url;

    use super::{FetchConfig, Fetcher};
    use crate::request::{Method, RequestDescriptor};
    use crate::{QuireError, Result};

    /// `reqwest`-backed fetcher. One client is reused across requests.
    #[derive(Debug, Clone)]
    pub struct HttpFetcher {
        client: Client,
        config: FetchConfig,
    }

    impl HttpFetcher {
        pub fn new(config: FetchConfig) -> Result<Self> {
            let client = Client::builder().build().map_err(QuireError::HttpError)?;
            Ok(Self { client, config })
        }

        fn headers(&self, request: &RequestDescriptor) -> HeaderMap {
            let mut headers = HeaderMap::new();
            for (name, value) in &request.headers {
                match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    (Ok(name), Ok(value)) => {
                        headers.insert(name, value);
                    }
                    _ => tracing::debug!(header = %name, "skipping invalid request header"),
                }
            }
            if !headers.contains_key(USER_AGENT)
                && let Ok(value) = HeaderValue::from_str(&self.config.user_agent)
            {
                headers.insert(USER_AGENT, value);
            }
            headers
        }
    }

    #[async_trait]
    impl Fetcher for HttpFetcher {
        async fn fetch(&self, request: &RequestDescriptor, timeout_ms: u64) -> Result<String> {
            let url = Url::parse(&request.url).map_err(|e| QuireError::InvalidUrl(format!("{}: {}", request.url, e)))?;

            let builder = match request.method {
                Method::Get => self.client.get(url),
                Method::Post => self.client.post(url),
            };
            let mut builder = builder.headers(self.headers(request)).timeout(Duration::from_millis(timeout_ms));
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let timed_out = |e: reqwest::Error| {
                if e.is_timeout() { QuireError::Timeout { timeout_ms } } else { QuireError::HttpError(e) }
            };

            let response = builder.send().await.map_err(timed_out)?;
            let status = response.status();
            if !status.is_success() {
                return Err(QuireError::Status { status: status.as_u16(), url: request.url.clone() });
            }

            response.text().await.map_err(timed_out)
        }
    }
}

#[cfg(all(test, feature = "fetch"))]
mod tests {
    use super::*;
    use crate::QuireError;
    use crate::request::parse_request;
    use std::io::Read;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct TestServer {
        base_url: String,
        shutdown: mpsc::Sender<()>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            let _ = self.shutdown.send(());
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn spawn_server() -> TestServer {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base_url = format!("http://{}", server.server_addr());
        let (shutdown, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let agent = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("User-Agent"))
                    .map(|h| h.value.to_string())
                    .unwrap_or_default();

                let response = match request.url() {
                    "/ok" => tiny_http::Response::from_string("<p>hello</p>"),
                    "/echo" => tiny_http::Response::from_string(format!("{} {} {}", request.method(), agent, body)),
                    "/slow" => {
                        thread::sleep(Duration::from_millis(500));
                        tiny_http::Response::from_string("late")
                    }
                    _ => tiny_http::Response::from_string("missing").with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });

        TestServer { base_url, shutdown, handle: Some(handle) }
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        let server = spawn_server();
        let fetcher = HttpFetcher::new(FetchConfig::default()).unwrap();
        let request = parse_request(&format!("{}/ok", server.base_url), &[]).unwrap();

        assert_eq!(fetcher.fetch(&request, 5000).await.unwrap(), "<p>hello</p>");
    }

    #[tokio::test]
    async fn test_fetch_post_with_headers() {
        let server = spawn_server();
        let fetcher = HttpFetcher::new(FetchConfig::default()).unwrap();
        let raw = format!(r#"{}/echo,{{"method":"POST","headers":{{"User-Agent":"rule-agent"}},"body":"x=1"}}"#, server.base_url);
        let request = parse_request(&raw, &[]).unwrap();

        assert_eq!(fetcher.fetch(&request, 5000).await.unwrap(), "POST rule-agent x=1");
    }

    #[tokio::test]
    async fn test_fetch_status_error() {
        let server = spawn_server();
        let fetcher = HttpFetcher::new(FetchConfig::default()).unwrap();
        let request = parse_request(&format!("{}/nope", server.base_url), &[]).unwrap();

        let err = fetcher.fetch(&request, 5000).await.unwrap_err();
        assert!(matches!(err, QuireError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let server = spawn_server();
        let fetcher = HttpFetcher::new(FetchConfig::default()).unwrap();
        let request = parse_request(&format!("{}/slow", server.base_url), &[]).unwrap();

        let err = fetcher.fetch(&request, 100).await.unwrap_err();
        assert!(matches!(err, QuireError::Timeout { timeout_ms: 100 }));
    }

    #[test]
    fn test_fetch_config_default() {
        assert!(FetchConfig::default().user_agent.contains("Quire"));
    }
}
