//! HTTP fetch layer shared by every scraper.
//!
//! Wraps a [`reqwest::Client`] with:
//! - a randomized `User-Agent` per request, drawn from [`USER_AGENTS`]
//! - browser-like `Accept` / `Accept-Language` / `Connection` headers
//! - bounded automatic retry with exponential backoff on connection errors,
//!   timeouts and the statuses in [`crate::error::RETRYABLE_STATUSES`]
//! - `raise_for_status` semantics: any other non-success status fails immediately
//!
//! Nothing is cached between calls.

use crate::config::HttpConfig;
use crate::error::EtlError;
use crate::retry::{RetryPolicy, retry};
use rand::{Rng, rng};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONNECTION, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, Response};
use std::time::Duration;
use tracing::{debug, instrument};

/// Desktop browser identities rotated across requests.
pub const USER_AGENTS: [&str; 7] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.1 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.1 Safari/605.1.15",
];

const ACCEPT_VALUE: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8";
const ACCEPT_LANGUAGE_VALUE: &str = "es-ES,es;q=0.9,en;q=0.8";

pub fn random_user_agent() -> &'static str {
    USER_AGENTS[rng().random_range(0..USER_AGENTS.len())]
}

#[derive(Clone, Copy)]
enum Payload<'a> {
    None,
    Query(&'a [(&'a str, &'a str)]),
    Form(&'a [(&'a str, &'a str)]),
}

/// Retry-aware HTTP client. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

/// Builder for [`HttpClient`], used when a source needs extra headers or relaxed TLS.
#[derive(Debug)]
pub struct HttpClientBuilder {
    policy: RetryPolicy,
    timeout: Duration,
    accept_invalid_certs: bool,
    headers: HeaderMap,
}

impl HttpClientBuilder {
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Disable certificate validation. Only for hosts with broken TLS chains.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Default header sent with every request. `name` must be lower case.
    pub fn header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        self
    }

    pub fn build(self) -> Result<HttpClient, EtlError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE_VALUE));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.extend(self.headers);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()
            .map_err(|e| EtlError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(HttpClient {
            client,
            policy: self.policy,
        })
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder {
            policy: RetryPolicy::default(),
            timeout: Duration::from_secs(10),
            accept_invalid_certs: false,
            headers: HeaderMap::new(),
        }
    }

    /// Builder preloaded with the configured retry budget and timeout.
    pub fn configured(config: &HttpConfig) -> HttpClientBuilder {
        Self::builder()
            .retry_policy(RetryPolicy::exponential(
                config.retries,
                Duration::from_millis(config.backoff_base_ms),
                Duration::from_millis(config.backoff_max_ms),
            ))
            .timeout(Duration::from_secs(config.timeout_secs))
    }

    pub fn new(config: &HttpConfig) -> Result<Self, EtlError> {
        Self::configured(config).build()
    }

    /// GET `url` with optional query parameters.
    pub async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Response, EtlError> {
        let payload = if query.is_empty() {
            Payload::None
        } else {
            Payload::Query(query)
        };
        self.send(Method::GET, url, payload).await
    }

    /// POST `form` url-encoded to `url`.
    pub async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<Response, EtlError> {
        self.send(Method::POST, url, Payload::Form(form)).await
    }

    pub async fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, EtlError> {
        let response = self.get(url, query).await?;
        response.text().await.map_err(|e| EtlError::network(url, e))
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, EtlError> {
        let response = self.get(url, &[]).await?;
        let bytes = response.bytes().await.map_err(|e| EtlError::network(url, e))?;
        Ok(bytes.to_vec())
    }

    pub async fn post_form_text(&self, url: &str, form: &[(&str, &str)]) -> Result<String, EtlError> {
        let response = self.post_form(url, form).await?;
        response.text().await.map_err(|e| EtlError::network(url, e))
    }

    #[instrument(level = "debug", skip(self, payload))]
    async fn send(&self, method: Method, url: &str, payload: Payload<'_>) -> Result<Response, EtlError> {
        retry(&self.policy, url, EtlError::is_retryable, |attempt| {
            let request = self
                .client
                .request(method.clone(), url)
                .header(USER_AGENT, random_user_agent());
            let request = match payload {
                Payload::None => request,
                Payload::Query(query) => request.query(query),
                Payload::Form(form) => request.form(form),
            };
            async move {
                debug!(attempt, %url, "Sending request");
                let response = request.send().await.map_err(|e| EtlError::network(url, e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(EtlError::Status {
                        url: url.to_string(),
                        status,
                    });
                }
                Ok(response)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_client(attempts: usize) -> HttpClient {
        HttpClient::builder()
            .retry_policy(RetryPolicy::fixed(attempts, Duration::from_millis(5)))
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_recovers_after_two_503() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sumario"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sumario"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = fast_client(5);
        let body = client
            .get_text(&format!("{}/sumario", server.uri()), &[])
            .await
            .unwrap();

        assert_eq!(body, "ok");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_when_budget_is_spent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = fast_client(3);
        let err = client.get(&server.uri(), &[]).await.unwrap_err();

        assert!(matches!(err, EtlError::Status { status, .. } if status.as_u16() == 503));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = fast_client(5);
        let err = client.get(&server.uri(), &[]).await.unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sends_identity_headers_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("PUBL-C", "20240102"))
            .and(header_exists("user-agent"))
            .and(header_exists("accept-language"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let client = fast_client(1);
        let body = client
            .get_text(&format!("{}/search", server.uri()), &[("PUBL-C", "20240102")])
            .await
            .unwrap();
        assert_eq!(body, "[]");

        let requests = server.received_requests().await.unwrap();
        let agent = requests[0].headers.get("user-agent").unwrap().to_str().unwrap();
        assert!(USER_AGENTS.contains(&agent));
    }

    #[tokio::test]
    async fn test_post_form_is_url_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/buscar"))
            .respond_with(ResponseTemplate::new(200).set_body_string("done"))
            .mount(&server)
            .await;

        let client = fast_client(1);
        let body = client
            .post_form_text(&format!("{}/buscar", server.uri()), &[("fecha", "02/01/2024")])
            .await
            .unwrap();
        assert_eq!(body, "done");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&requests[0].body),
            "fecha=02%2F01%2F2024"
        );
    }
}
