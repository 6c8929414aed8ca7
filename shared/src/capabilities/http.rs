use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_REQUEST_BODY_SIZE: usize = 10 * 1024 * 1024;
/// Long enough for a backend that is still cold-starting.
pub const DEFAULT_TIMEOUT_MS: u64 = 90_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;
pub const MAX_HEADERS_COUNT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();
        let parsed = Self::validate(&url)?;
        let host = parsed
            .host_str()
            .map(str::to_lowercase)
            .unwrap_or_default();

        Ok(Self {
            url: parsed.to_string(),
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolve an API path against this base URL, keeping any base path prefix.
    pub fn join(&self, path: &str) -> Result<Self, HttpError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Self::new(path);
        }
        let base = self.url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Self::new(format!("{base}/{path}"))
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
                reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
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
                    "invalid scheme '{}', only 'http' and 'https' are allowed",
                    scheme
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
            url.to_string()
        } else {
            let mut end = 100;
            while !url.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &url[..end])
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HttpHeaders {
    headers: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header (names compare case-insensitively).
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

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.headers.remove(index).1)
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
        if name.is_empty() {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.chars().take(50).collect::<String>() + "...",
                reason: format!(
                    "header name exceeds maximum length of {} bytes",
                    MAX_HEADER_NAME_LENGTH
                ),
            });
        }

        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
        {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!("invalid character '{}' in header name", c),
            });
        }

        let lower = name.to_lowercase();
        if lower == "host" || lower == "content-length" || lower == "transfer-encoding" {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "this header is managed automatically".to_string(),
            });
        }

        Ok(())
    }

    fn validate_header_value(name: &str, value: &str) -> Result<(), HttpError> {
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!(
                    "header value exceeds maximum length of {} bytes",
                    MAX_HEADER_VALUE_LENGTH
                ),
            });
        }

        if value.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header value contains invalid characters (CR, LF, or NULL)".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Writes are the only requests that may be queued for later replay.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }

    pub fn has_request_body(&self) -> bool {
        matches!(
            self,
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete
        )
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    method: HttpMethod,
    url: ValidatedUrl,
    headers: HttpHeaders,
    body: Option<Vec<u8>>,
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

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, HttpError> {
        if !self.method.has_request_body() {
            return Err(HttpError::InvalidRequest {
                reason: format!("{} requests cannot have a body", self.method.as_str()),
            });
        }

        let body = serde_json::to_vec(value).map_err(|e| HttpError::SerializationError {
            message: e.to_string(),
        })?;

        if body.len() > MAX_REQUEST_BODY_SIZE {
            return Err(HttpError::BodyTooLarge {
                size: body.len(),
                max: MAX_REQUEST_BODY_SIZE,
            });
        }

        self.headers.insert("Content-Type", "application/json")?;
        self.body = Some(body);
        Ok(self)
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
                reason: format!("timeout exceeds maximum of {}ms", MAX_TIMEOUT_MS),
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

    pub fn headers_mut(&mut self) -> &mut HttpHeaders {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// Failures where no HTTP response was obtained, plus local request-building errors.
/// A response with any status code is not an `HttpError`; see [`HttpResponse`].
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
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

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

impl HttpError {
    /// True when the request may have left the device but no response came back.
    /// A response that arrived but could not be decoded does not count.
    pub fn is_no_response(&self) -> bool {
        matches!(self, HttpError::ConnectionError { .. } | HttpError::Timeout { .. })
    }

    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        HttpError::ConnectionError {
            host: host.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Vec<u8>,
    request_id: String,
    duration_ms: u64,
}

impl HttpResponse {
    pub fn new(
        status: u16,
        headers: HttpHeaders,
        body: Vec<u8>,
        request_id: String,
        duration_ms: u64,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            request_id,
            duration_ms,
        }
    }

    /// Convenience constructor for a JSON body.
    pub fn json_body(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = HttpHeaders::new();
        let _ = headers.insert("Content-Type", "application/json");
        Self::new(
            status,
            headers,
            serde_json::to_vec(value).unwrap_or_default(),
            String::new(),
            0,
        )
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse JSON: {}", e),
            request_id: self.request_id.clone(),
        })
    }

    /// Best-effort read of a string field from a JSON object body.
    pub fn json_field(&self, field: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        match value.get(field)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}

pub type HttpResult = Result<HttpResponse, HttpError>;

/// Outbound HTTP port.
///
/// Implementations return `Ok` for every response the server produced, whatever
/// its status, and `Err` only when no response was received.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> HttpResult;
}
