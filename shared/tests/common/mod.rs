#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use expense_sync::capabilities::{
    HttpError, HttpRequest, HttpResponse, HttpResult, HttpTransport, ManualClock, MemoryKvStore,
    KvStore, ValidatedUrl,
};
use expense_sync::{AuthTokens, ClientConfig, ClientHeaders, ClientParts, OfflineClient, UnixTimeMs};
use serde_json::json;

pub const BASE: &str = "https://api.example.com/api";
pub const START_MS: u64 = 1_700_000_000_000;

type Handler = dyn Fn(&HttpRequest) -> HttpResult + Send + Sync;

/// In-process stand-in for the backend. Answers every request with `handler`
/// unless switched offline.
pub struct MockServer {
    handler: Mutex<Arc<Handler>>,
    online: AtomicBool,
    latency: Option<Duration>,
    log: Mutex<Vec<HttpRequest>>,
}

impl MockServer {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> HttpResult + Send + Sync + 'static,
    {
        Self::build(handler, None)
    }

    pub fn with_latency<F>(latency: Duration, handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> HttpResult + Send + Sync + 'static,
    {
        Self::build(handler, Some(latency))
    }

    fn build<F>(handler: F, latency: Option<Duration>) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> HttpResult + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Mutex::new(Arc::new(handler)),
            online: AtomicBool::new(true),
            latency,
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&HttpRequest) -> HttpResult + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, fragment: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.url().as_str().contains(fragment))
            .count()
    }
}

#[async_trait::async_trait]
impl HttpTransport for MockServer {
    async fn send(&self, request: HttpRequest) -> HttpResult {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(HttpError::connection(request.url().host(), "network is down"));
        }
        let handler = self.handler.lock().unwrap().clone();
        let result = handler(&request);
        self.log.lock().unwrap().push(request);
        result
    }
}

pub fn ok() -> HttpResult {
    Ok(HttpResponse::json_body(200, &json!({ "message": "ok" })))
}

pub fn json(status: u16, body: serde_json::Value) -> HttpResult {
    Ok(HttpResponse::json_body(status, &body))
}

pub fn config() -> ClientConfig {
    ClientConfig::new(
        ValidatedUrl::new(BASE).unwrap(),
        ClientHeaders {
            app_version: "1.4.2".into(),
            ota_version: "ota-12".into(),
            platform: "android".into(),
        },
    )
}

pub async fn client_with(server: Arc<MockServer>, store: Arc<dyn KvStore>) -> OfflineClient {
    let parts = ClientParts {
        transport: server,
        store,
        clock: Arc::new(ManualClock::new(UnixTimeMs(START_MS))),
        probe: None,
    };
    OfflineClient::assemble(config(), parts).await.unwrap()
}

pub async fn signed_in(server: Arc<MockServer>) -> OfflineClient {
    let client = client_with(server, Arc::new(MemoryKvStore::new())).await;
    client
        .sign_in(AuthTokens::new("access-0", "refresh-0"))
        .await
        .unwrap();
    client
}
