use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_REQUEST_BODY_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;
pub const MAX_HEADERS_COUNT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    path: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();
        let parsed = Self::validate(&url)?;
        Ok(Self::from_parsed(&parsed))
    }

    /// Resolves `path` (absolute or relative) against `base`.
    pub fn join(base: &Self, path: &str) -> Result<Self, HttpError> {
        let base_url = Url::parse(&base.url).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(&base.url),
            reason: e.to_string(),
        })?;
        let joined = base_url.join(path).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(path),
            reason: e.to_string(),
        })?;
        Self::new(joined.to_string())
    }

    fn from_parsed(parsed: &Url) -> Self {
        let mut without_fragment = parsed.clone();
        without_fragment.set_fragment(None);
        Self {
            url: without_fragment.to_string(),
            path: parsed.path().to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn validate(url: &str) -> Result<Url, HttpError> {
        if url.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(url),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!(
                    "invalid scheme '{scheme}', only 'http' and 'https' are allowed"
                ),
            });
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "URL must have a host".to_string(),
            });
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(parsed)
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            return url.to_string();
        }
        let mut end = 100;
        while !url.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &url[..end])
    }
}

impl std::fmt::Display for ValidatedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaders {
    headers: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        let name = name.into();
        let value = value.into();

        Self::validate_header_name(&name)?;
        Self::validate_header_value(&name, &value)?;

        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        if self.headers.len() >= MAX_HEADERS_COUNT {
            return Err(HttpError::TooManyHeaders {
                count: self.headers.len() + 1,
                max: MAX_HEADERS_COUNT,
            });
        }
        self.headers.push((name, value));

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn validate_header_name(name: &str) -> Result<(), HttpError> {
        if name.is_empty() || name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.chars().take(50).collect(),
                reason: format!("header name must be 1..={MAX_HEADER_NAME_LENGTH} bytes"),
            });
        }

        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
        {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!("invalid character '{c}' in header name"),
            });
        }

        Ok(())
    }

    fn validate_header_value(name: &str, value: &str) -> Result<(), HttpError> {
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!(
                    "header value exceeds maximum length of {MAX_HEADER_VALUE_LENGTH} bytes"
                ),
            });
        }

        if value.contains(['\r', '\n', '\0']) {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header value contains invalid characters (CR, LF, or NULL)".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }

    #[must_use]
    pub const fn has_request_body(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    method: HttpMethod,
    url: ValidatedUrl,
    headers: HttpHeaders,
    body: Option<Bytes>,
    timeout_ms: u64,
    request_id: String,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: ValidatedUrl) -> Self {
        Self {
            method,
            url,
            headers: HttpHeaders::new(),
            body: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn get(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self::new(HttpMethod::Get, ValidatedUrl::new(url)?))
    }

    pub fn post(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self::new(HttpMethod::Post, ValidatedUrl::new(url)?))
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Result<Self, HttpError> {
        if !self.method.has_request_body() {
            return Err(HttpError::InvalidRequest {
                reason: format!("{} requests cannot have a body", self.method.as_str()),
            });
        }

        let body = body.into();
        if body.len() > MAX_REQUEST_BODY_SIZE {
            return Err(HttpError::BodyTooLarge {
                size: body.len(),
                max: MAX_REQUEST_BODY_SIZE,
            });
        }

        self.body = Some(body);
        Ok(self)
    }

    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, HttpError> {
        let body = serde_json::to_vec(value).map_err(|e| HttpError::SerializationError {
            message: e.to_string(),
        })?;
        self.with_header("Content-Type", "application/json")?
            .with_body(body)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, HttpError> {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            return Err(HttpError::InvalidRequest {
                reason: "timeout cannot be zero".to_string(),
            });
        }
        if ms > MAX_TIMEOUT_MS {
            return Err(HttpError::InvalidRequest {
                reason: format!("timeout exceeds maximum of {MAX_TIMEOUT_MS}ms"),
            });
        }
        self.timeout_ms = ms;
        Ok(self)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &ValidatedUrl {
        &self.url
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("too many headers: {count} exceeds maximum of {max}")]
    TooManyHeaders { count: usize, max: usize },

    #[error("request body too large: {size} bytes exceeds maximum of {max} bytes")]
    BodyTooLarge { size: usize, max: usize },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("DNS resolution failed for {host}: {message}")]
    DnsError { host: String, message: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

impl HttpError {
    /// Network-level failures: the request may not have reached the server.
    #[must_use]
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            HttpError::Timeout { .. }
                | HttpError::ConnectionError { .. }
                | HttpError::DnsError { .. }
                | HttpError::InvalidResponse { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HttpHeaders, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// JSON response with `Content-Type: application/json`.
    pub fn json<T: Serialize>(status: u16, value: &T) -> Result<Self, HttpError> {
        let body = serde_json::to_vec(value).map_err(|e| HttpError::SerializationError {
            message: e.to_string(),
        })?;
        let mut headers = HttpHeaders::new();
        headers.insert("Content-Type", "application/json")?;
        Ok(Self::new(status, headers, body))
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse JSON: {e}"),
            request_id: String::new(),
        })
    }
}

pub type HttpResult = Result<HttpResponse, HttpError>;

/// Outbound network access. The only way the core reaches the network.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> HttpResult;
}

/// `reqwest`-backed transport for hosts that run the core natively.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| HttpError::InvalidRequest {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn map_error(request: &HttpRequest, err: &reqwest::Error) -> HttpError {
        let host = err
            .url()
            .and_then(|u| u.host_str())
            .unwrap_or_default()
            .to_string();

        if err.is_timeout() {
            HttpError::Timeout {
                timeout_ms: request.timeout_ms,
                request_id: request.request_id.clone(),
            }
        } else if err.is_connect() {
            let message = err.to_string();
            if message.to_lowercase().contains("dns") {
                HttpError::DnsError { host, message }
            } else {
                HttpError::ConnectionError { host, message }
            }
        } else {
            HttpError::InvalidResponse {
                reason: err.to_string(),
                request_id: request.request_id.clone(),
            }
        }
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> HttpResult {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| HttpError::InvalidRequest {
                reason: e.to_string(),
            })?;

        let mut builder = self
            .client
            .request(method, request.url.as_str())
            .timeout(request.timeout());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(&request, &e))?;

        let status = response.status().as_u16();
        let mut headers = HttpHeaders::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                // Skip anything our header validation refuses rather than failing the response.
                let _ = headers.insert(name.as_str(), value);
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_error(&request, &e))?;

        tracing::debug!(
            request_id = %request.request_id,
            status,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "http response"
        );

        Ok(HttpResponse::new(status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation_empty() {
        assert!(ValidatedUrl::new("").is_err());
        assert!(ValidatedUrl::new("   ").is_err());
    }

    #[test]
    fn test_url_validation_scheme() {
        assert!(ValidatedUrl::new("ftp://example.com").is_err());
        assert!(ValidatedUrl::new("https://example.com/a").is_ok());
    }

    #[test]
    fn test_url_rejects_credentials() {
        let result = ValidatedUrl::new("https://user:pw@example.com/");
        assert!(matches!(result, Err(HttpError::InvalidUrl { .. })));
    }

    #[test]
    fn test_url_strips_fragment() {
        let url = ValidatedUrl::new("https://example.com/page#section").unwrap();
        assert_eq!(url.as_str(), "https://example.com/page");
        assert_eq!(url.path(), "/page");
    }

    #[test]
    fn test_url_join_relative_path() {
        let base = ValidatedUrl::new("https://app.example.com/").unwrap();
        let joined = ValidatedUrl::join(&base, "/offline").unwrap();
        assert_eq!(joined.as_str(), "https://app.example.com/offline");
    }

    #[test]
    fn test_headers_case_insensitive_replace() {
        let mut headers = HttpHeaders::new();
        headers.insert("Content-Type", "text/plain").unwrap();
        headers.insert("content-type", "application/json").unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn test_header_injection_rejected() {
        let mut headers = HttpHeaders::new();
        assert!(headers.insert("X-Test", "a\r\nb").is_err());
        assert!(headers.insert("Bad Header", "x").is_err());
    }

    #[test]
    fn test_get_cannot_carry_body() {
        let result = HttpRequest::get("https://example.com")
            .unwrap()
            .with_body(b"x".to_vec());
        assert!(matches!(result, Err(HttpError::InvalidRequest { .. })));
    }

    #[test]
    fn test_timeout_bounds() {
        let req = HttpRequest::get("https://example.com").unwrap();
        assert!(req.clone().with_timeout(Duration::ZERO).is_err());
        assert!(req
            .clone()
            .with_timeout(Duration::from_millis(MAX_TIMEOUT_MS + 1))
            .is_err());
        let ok = req.with_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ok.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_with_json_sets_content_type() {
        let req = HttpRequest::post("https://example.com/api")
            .unwrap()
            .with_json(&serde_json::json!({"a": 1}))
            .unwrap();
        assert_eq!(req.headers().get("content-type"), Some("application/json"));
        assert_eq!(req.body().unwrap().as_ref(), br#"{"a":1}"#);
    }

    #[test]
    fn test_network_failure_classification() {
        assert!(HttpError::Timeout {
            timeout_ms: 1000,
            request_id: "x".into()
        }
        .is_network_failure());
        assert!(HttpError::ConnectionError {
            host: "x".into(),
            message: "y".into()
        }
        .is_network_failure());
        assert!(!HttpError::InvalidUrl {
            url: "x".into(),
            reason: "y".into()
        }
        .is_network_failure());
    }

    #[test]
    fn test_response_helpers() {
        let response = HttpResponse::json(200, &serde_json::json!({"id": 123})).unwrap();
        assert!(response.is_success());
        assert_eq!(response.headers().get("content-type"), Some("application/json"));
        let parsed: serde_json::Value = response.parse_json().unwrap();
        assert_eq!(parsed["id"], 123);
    }
}
