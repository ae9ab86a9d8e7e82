//! Scripted in-memory transport for tests.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::api::Transport;
use crate::backend::Backend;
use crate::config::Endpoints;
use crate::variants::VariantResolver;

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

struct Route {
    method: Method,
    path: String,
    response: Result<Value, String>,
}

/// Answers from route rules; the most recently registered matching rule
/// wins, so a test can re-script a route between steps. Unmatched calls
/// fail like a missing endpoint.
#[derive(Default)]
pub(crate) struct MockTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, method: Method, path: &str, response: Result<Value, String>) {
        self.routes.lock().unwrap().push(Route {
            method,
            path: path.to_string(),
            response,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    /// Calls whose method is not GET.
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.method != Method::GET)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, String> {
        self.calls.lock().unwrap().push(Call {
            method: method.clone(),
            path: path.to_string(),
            body,
        });
        // Let concurrently spawned calls interleave.
        tokio::task::yield_now().await;

        let routes = self.routes.lock().unwrap();
        routes
            .iter()
            .rev()
            .find(|r| r.method == method && r.path == path)
            .map(|r| r.response.clone())
            .unwrap_or_else(|| Err(format!("Admin backend endpoint not found (HTTP 404): {method} {path}")))
    }
}

pub(crate) fn mock_backend(transport: &Arc<MockTransport>) -> Backend {
    Backend::new(
        transport.clone(),
        Arc::new(VariantResolver::new(3)),
        Endpoints::default(),
    )
}
