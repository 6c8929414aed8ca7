use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use super::http::{HttpMethod, HttpRequest, HttpTransport, ValidatedUrl};

/// Answers "is the network reachable right now". Must be cheap; the sync engine
/// asks before every replay.
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Online flag pushed by the platform (network-state callbacks).
///
/// Subscribers see every transition, which is how the sync worker detects a reconnect.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` when this call flipped the state from offline to online.
    pub fn set_online(&self, online: bool) -> bool {
        let mut reconnected = false;
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            reconnected = online;
            *current = online;
            true
        });
        if reconnected {
            debug!("connectivity restored");
        }
        reconnected
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for ConnectivityMonitor {
    async fn is_reachable(&self) -> bool {
        self.is_online()
    }
}

/// Probe that issues a short GET; any HTTP response, whatever its status, means reachable.
pub struct HttpConnectivityProbe {
    transport: Arc<dyn HttpTransport>,
    url: ValidatedUrl,
    timeout: Duration,
}

impl HttpConnectivityProbe {
    pub fn new(transport: Arc<dyn HttpTransport>, url: ValidatedUrl, timeout: Duration) -> Self {
        Self {
            transport,
            url,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn is_reachable(&self) -> bool {
        let request = match HttpRequest::new(HttpMethod::Get, self.url.clone())
            .with_timeout(self.timeout)
        {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "connectivity probe request invalid");
                return false;
            }
        };
        match self.transport.send(request).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, url = %self.url.as_str(), "connectivity probe failed");
                false
            }
        }
    }
}
