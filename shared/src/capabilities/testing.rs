use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::http::{HttpError, HttpRequest, HttpResult, HttpTransport};

/// Transport that replays canned results.
///
/// Results registered with [`ScriptedTransport::route`] are served to requests whose URL
/// contains the route fragment; everything else takes from the shared script. An
/// exhausted script answers with a connection error, i.e. "offline".
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<HttpResult>>,
    routes: Mutex<Vec<(String, VecDeque<HttpResult>)>>,
    calls: Mutex<Vec<HttpRequest>>,
    latency: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn push(&self, result: HttpResult) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn route(&self, fragment: &str, result: HttpResult) {
        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|(f, _)| f == fragment) {
            Some((_, queue)) => queue.push_back(result),
            None => routes.push((fragment.to_string(), VecDeque::from([result]))),
        }
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, fragment: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url().as_str().contains(fragment))
            .count()
    }
}

#[async_trait::async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> HttpResult {
        let url = request.url().as_str().to_string();
        let host = request.url().host().to_string();
        self.calls.lock().unwrap().push(request);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let routed = {
            let mut routes = self.routes.lock().unwrap();
            routes
                .iter_mut()
                .find(|(fragment, queue)| url.contains(fragment.as_str()) && !queue.is_empty())
                .and_then(|(_, queue)| queue.pop_front())
        };
        if let Some(result) = routed {
            return result;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(HttpError::connection(host, "no scripted response")))
    }
}
