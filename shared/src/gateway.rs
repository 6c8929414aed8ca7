//! Request gateway: every outbound API call goes through [`RequestGateway::execute`].
//!
//! Failed mutations that might succeed later are queued and answered with an
//! [`OfflineAck`]; a 401 runs the shared token refresh and retries once; everything
//! else is returned to the caller unchanged.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::auth::{
    AccessSnapshot, AuthError, AuthSession, AuthTokens, RefreshFailure, TokenPair, TokenRefresher,
};
use crate::capabilities::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ValidatedUrl,
};
use crate::event::{EventBus, PipelineEvent};
use crate::outbox::{Correlation, NewRequest, Outbox, OutboxError, QueuedRequest, RequestId};
use crate::sync::SyncTrigger;
use crate::ErrorKind;

pub const REFRESH_PATH: &str = "/user/refresh";

/// Endpoints that are never queued and never trigger a nested refresh.
pub const AUTH_ENDPOINTS: [&str; 4] = [
    "/user/login",
    "/user/signup",
    "/user/google-login",
    REFRESH_PATH,
];

pub const OFFLINE_STATUS: u16 = 202;
pub const OFFLINE_STATUS_TEXT: &str = "Accepted (Offline)";

pub fn is_auth_endpoint(url: &str) -> bool {
    AUTH_ENDPOINTS.iter().any(|endpoint| url.contains(endpoint))
}

/// Headers every outbound call carries for the server's compatibility handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHeaders {
    pub app_version: String,
    pub ota_version: String,
    pub platform: String,
}

impl ClientHeaders {
    pub fn apply(&self, headers: &mut HttpHeaders) -> Result<(), HttpError> {
        headers.insert("x-app-version", self.app_version.as_str())?;
        headers.insert("x-ota-version", self.ota_version.as_str())?;
        headers.insert("x-platform", self.platform.as_str())?;
        headers.insert("content-type", "application/json")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Path relative to the API base URL, or an absolute URL.
    pub path: String,
    pub body: Option<Value>,
    /// Reconciler tags; kept on the queued record, never sent.
    pub correlation: Option<Correlation>,
    /// Set on sync-engine replays: no queueing and no refresh inside the gateway.
    pub bypass_queue: bool,
    /// Set once the request has been retried after a refresh.
    pub retried: bool,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            correlation: None,
            bypass_queue: false,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Put, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Patch, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = Some(correlation);
        self
    }

    fn replay_of(record: &QueuedRequest) -> Self {
        Self {
            method: record.method,
            path: record.url.clone(),
            body: record.body.clone(),
            correlation: record.correlation.clone(),
            bypass_queue: true,
            retried: false,
        }
    }
}

/// Synthetic answer for a mutation that was queued instead of sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineAck {
    pub id: RequestId,
}

impl OfflineAck {
    pub fn status(&self) -> u16 {
        OFFLINE_STATUS
    }

    pub fn status_text(&self) -> &'static str {
        OFFLINE_STATUS_TEXT
    }

    pub fn body(&self) -> Value {
        json!({ "offline": true, "pendingSync": true })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(HttpResponse),
    /// Accepted for later delivery. Callers treat this as a pending success.
    QueuedOffline(OfflineAck),
}

impl Outcome {
    pub fn is_offline(&self) -> bool {
        matches!(self, Outcome::QueuedOffline(_))
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Outcome::Success(response) => Some(response),
            Outcome::QueuedOffline(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no response for {method} {url}: {source}")]
    NoResponse {
        method: HttpMethod,
        url: String,
        #[source]
        source: HttpError,
    },

    #[error("{method} {url} returned {}", .response.status())]
    Status {
        method: HttpMethod,
        url: String,
        response: Box<HttpResponse>,
    },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("could not queue request: {0}")]
    Queue(#[from] OutboxError),

    #[error("invalid request: {0}")]
    Request(HttpError),
}

impl GatewayError {
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Status { response, .. } => Some(response.status()),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::NoResponse { .. } => ErrorKind::NetworkUnreachable,
            GatewayError::Status { url, response, .. } => {
                let status = response.status();
                match status {
                    401 if url.contains(REFRESH_PATH) => ErrorKind::AuthInvalid,
                    401 => ErrorKind::AuthExpired,
                    _ if is_transient_status(status) => ErrorKind::ServerTransient,
                    _ => ErrorKind::ServerFatal,
                }
            }
            GatewayError::Auth(AuthError::Invalid | AuthError::MissingRefreshToken) => {
                ErrorKind::AuthInvalid
            }
            GatewayError::Auth(AuthError::Indeterminate(_)) => ErrorKind::AuthExpired,
            GatewayError::Auth(AuthError::Storage(_)) => ErrorKind::Storage,
            GatewayError::Queue(OutboxError::NotQueueable(_) | OutboxError::InvalidId(_)) => {
                ErrorKind::InvalidRequest
            }
            GatewayError::Queue(_) => ErrorKind::Storage,
            GatewayError::Request(_) => ErrorKind::InvalidRequest,
        }
    }
}

/// 408, 429 and every 5xx may succeed if tried again later.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || status >= 500
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Enqueue,
    RefreshAndRetry,
    Propagate,
}

/// Decide what to do with a failed call. `status` is `None` when no response arrived.
pub fn classify_failure(request: &ApiRequest, url: &str, status: Option<u16>) -> FailureDisposition {
    if request.bypass_queue {
        return FailureDisposition::Propagate;
    }
    let is_mutation = request.method.is_mutation();
    let is_retryable = status.map_or(true, is_transient_status);
    let is_auth = is_auth_endpoint(url);

    if is_mutation && is_retryable && !is_auth {
        FailureDisposition::Enqueue
    } else if status == Some(401) && !is_auth && !request.retried {
        FailureDisposition::RefreshAndRetry
    } else {
        FailureDisposition::Propagate
    }
}

pub struct RequestGateway {
    transport: Arc<dyn HttpTransport>,
    base_url: ValidatedUrl,
    headers: ClientHeaders,
    session: Arc<AuthSession>,
    refresher: Arc<dyn TokenRefresher>,
    outbox: Arc<Outbox>,
    trigger: SyncTrigger,
    events: EventBus,
    request_timeout: Duration,
}

impl RequestGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: ValidatedUrl,
        headers: ClientHeaders,
        session: Arc<AuthSession>,
        refresher: Arc<dyn TokenRefresher>,
        outbox: Arc<Outbox>,
        trigger: SyncTrigger,
        events: EventBus,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            base_url,
            headers,
            session,
            refresher,
            outbox,
            trigger,
            events,
            request_timeout,
        }
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path, bypass = request.bypass_queue))]
    pub async fn execute(&self, request: ApiRequest) -> Result<Outcome, GatewayError> {
        let url = self
            .base_url
            .join(&request.path)
            .map_err(GatewayError::Request)?;
        let mut request = request;

        loop {
            let snapshot = self.session.snapshot();
            let (status, error) = match self.attempt(&request, &url, &snapshot).await {
                Ok(response) => return Ok(Outcome::Success(response)),
                Err((_, error @ GatewayError::Request(_))) => return Err(error),
                Err(failure) => failure,
            };

            match classify_failure(&request, url.as_str(), status) {
                FailureDisposition::Enqueue => {
                    debug!(error = %error, "mutation failed, queueing");
                    let ack = self.enqueue(&request, &url).await?;
                    return Ok(Outcome::QueuedOffline(ack));
                }
                FailureDisposition::RefreshAndRetry => {
                    self.session
                        .refresh(snapshot.generation, self.refresher.as_ref())
                        .await?;
                    request.retried = true;
                }
                FailureDisposition::Propagate => return Err(error),
            }
        }
    }

    /// Send a queued record once, verbatim, with the bypass marker set.
    #[instrument(skip(self, record), fields(id = %record.id))]
    pub async fn replay(&self, record: &QueuedRequest) -> Result<HttpResponse, GatewayError> {
        let url = ValidatedUrl::new(record.url.as_str()).map_err(GatewayError::Request)?;
        let request = ApiRequest::replay_of(record);
        let snapshot = self.session.snapshot();
        self.attempt(&request, &url, &snapshot)
            .await
            .map_err(|(_, error)| error)
    }

    /// Join or start the shared refresh on behalf of a replay that got a 401.
    pub async fn refresh_session(&self, observed_generation: u64) -> Result<u64, AuthError> {
        self.session
            .refresh(observed_generation, self.refresher.as_ref())
            .await
    }

    async fn enqueue(&self, request: &ApiRequest, url: &ValidatedUrl) -> Result<OfflineAck, GatewayError> {
        let record = self
            .outbox
            .enqueue(NewRequest {
                method: request.method,
                url: url.as_str().to_string(),
                body: request.body.clone(),
                correlation: request.correlation.clone(),
            })
            .await?;
        info!(id = %record.id, method = %record.method, url = %record.url, "accepted offline");
        self.events
            .emit(PipelineEvent::QueuedOffline { id: record.id.clone() });
        self.trigger.notify();
        Ok(OfflineAck { id: record.id })
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        url: &ValidatedUrl,
        snapshot: &AccessSnapshot,
    ) -> Result<HttpResponse, (Option<u16>, GatewayError)> {
        let http = self
            .build(request, url, snapshot.token.as_ref())
            .map_err(|e| (None, GatewayError::Request(e)))?;

        match self.transport.send(http).await {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => {
                let status = response.status();
                warn!(status, url = %url.as_str(), "request failed");
                Err((
                    Some(status),
                    GatewayError::Status {
                        method: request.method,
                        url: url.as_str().to_string(),
                        response: Box::new(response),
                    },
                ))
            }
            Err(e) if e.is_no_response() => {
                warn!(error = %e, url = %url.as_str(), "no response");
                Err((
                    None,
                    GatewayError::NoResponse {
                        method: request.method,
                        url: url.as_str().to_string(),
                        source: e,
                    },
                ))
            }
            // A local failure, or an answer that could not be read. Neither is a network condition.
            Err(e) => Err((None, GatewayError::Request(e))),
        }
    }

    fn build(
        &self,
        request: &ApiRequest,
        url: &ValidatedUrl,
        token: Option<&SecretString>,
    ) -> Result<HttpRequest, HttpError> {
        let mut http = HttpRequest::new(request.method, url.clone()).with_timeout(self.request_timeout)?;
        if let Some(body) = &request.body {
            http = http.with_json(body)?;
        }
        self.headers.apply(http.headers_mut())?;
        if let Some(token) = token {
            http.headers_mut()
                .insert("Authorization", format!("Bearer {}", token.expose_secret()))?;
        }
        Ok(http)
    }
}

/// [`TokenRefresher`] that calls `POST {base}/user/refresh`.
pub struct HttpTokenRefresher {
    transport: Arc<dyn HttpTransport>,
    url: ValidatedUrl,
    headers: ClientHeaders,
    timeout: Duration,
}

impl HttpTokenRefresher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: &ValidatedUrl,
        headers: ClientHeaders,
        timeout: Duration,
    ) -> Result<Self, HttpError> {
        Ok(Self {
            transport,
            url: base_url.join(REFRESH_PATH)?,
            headers,
            timeout,
        })
    }
}

#[async_trait::async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<AuthTokens, RefreshFailure> {
        let mut request = HttpRequest::new(HttpMethod::Post, self.url.clone())
            .with_timeout(self.timeout)
            .and_then(|r| r.with_json(&json!({ "refreshToken": refresh_token.expose_secret() })))
            .map_err(|e| RefreshFailure::Indeterminate(e.to_string()))?;
        self.headers
            .apply(request.headers_mut())
            .map_err(|e| RefreshFailure::Indeterminate(e.to_string()))?;

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| RefreshFailure::Indeterminate(e.to_string()))?;

        match response.status() {
            401 => Err(RefreshFailure::Unauthorized),
            status if !response.is_success() => Err(RefreshFailure::Indeterminate(format!(
                "refresh endpoint returned {status}"
            ))),
            _ => response
                .json::<TokenPair>()
                .map(AuthTokens::from)
                .map_err(|e| RefreshFailure::Indeterminate(e.to_string())),
        }
    }
}
