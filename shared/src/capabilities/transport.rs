use std::time::Instant;

use tracing::{debug, instrument, warn};

use super::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    MAX_REQUEST_BODY_SIZE,
};

/// Production transport on top of `reqwest`.
///
/// Every status code is returned as a response; only failures that produced no
/// response at all become an [`HttpError`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }

    fn map_error(request: &HttpRequest, err: &reqwest::Error) -> HttpError {
        if err.is_timeout() {
            return HttpError::Timeout {
                timeout_ms: u64::try_from(request.timeout().as_millis()).unwrap_or(u64::MAX),
                request_id: request.request_id().to_string(),
            };
        }
        if err.is_builder() {
            return HttpError::InvalidRequest {
                reason: err.to_string(),
            };
        }
        HttpError::connection(request.url().host(), err.to_string())
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method(), request_id = %request.request_id()))]
    async fn send(&self, request: HttpRequest) -> HttpResult {
        let started = Instant::now();
        let mut builder = self
            .client
            .request(Self::method(request.method()), request.url().as_str())
            .timeout(request.timeout());
        for (name, value) in request.headers().iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(&request, &e))?;

        let status = response.status().as_u16();
        let mut headers = HttpHeaders::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                // Oversized or odd server headers are not worth failing the response over.
                let _ = headers.insert(name.as_str(), value);
            }
        }

        // The server has answered from here on, so the status must survive a bad body.
        let body = match response.bytes().await {
            Ok(body) => bounded_body(&body),
            Err(e) => {
                warn!(status, error = %e, "response body unreadable, keeping status only");
                Vec::new()
            }
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(status, duration_ms, "response received");
        Ok(HttpResponse::new(
            status,
            headers,
            body,
            request.request_id().to_string(),
            duration_ms,
        ))
    }
}

fn bounded_body(body: &[u8]) -> Vec<u8> {
    if body.len() > MAX_REQUEST_BODY_SIZE {
        warn!(len = body.len(), "response body exceeds limit, discarding it");
        return Vec::new();
    }
    body.to_vec()
}
