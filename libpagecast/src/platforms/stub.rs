//! In-process Graph API stand-in for adapter tests
//!
//! Serves canned JSON per `METHOD path` (API version prefix stripped) and
//! records every request with its decoded parameters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::config::GraphConfig;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub params: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct StubGraph {
    routes: Arc<Mutex<HashMap<String, VecDeque<(StatusCode, Value)>>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `method path`. Responses are served in order
    /// and the last one repeats.
    pub fn respond(&self, method: Method, path: &str, status: StatusCode, body: Value) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .entry(format!("{} {}", method, path))
            .or_default()
            .push_back((status, body));
        self
    }

    pub fn ok(&self, method: Method, path: &str, body: Value) -> &Self {
        self.respond(method, path, StatusCode::OK, body)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    /// Bind to an ephemeral port and return a config pointing at it
    pub async fn start(&self) -> GraphConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app: Router = Router::<StubGraph>::new()
            .fallback(handle)
            .with_state(self.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        GraphConfig {
            base_url: format!("http://{}", addr),
            request_timeout_secs: 5,
            media_status_checks: 3,
            media_status_interval_ms: 1,
            ..Default::default()
        }
    }
}

fn decode(pairs: &str) -> HashMap<String, String> {
    reqwest::Url::parse(&format!("http://stub/?{}", pairs))
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

async fn handle(
    State(stub): State<StubGraph>,
    method: Method,
    uri: Uri,
    body: String,
) -> (StatusCode, Json<Value>) {
    let path = uri
        .path()
        .trim_start_matches('/')
        .split_once('/')
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_default();
    let params = if method == Method::GET {
        decode(uri.query().unwrap_or_default())
    } else {
        decode(&body)
    };

    stub.requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        params,
    });

    let key = format!("{} {}", method, path);
    let mut routes = stub.routes.lock().unwrap();
    let response = routes.get_mut(&key).and_then(|queue| {
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    });

    match response {
        Some((status, body)) => (status, Json(body)),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": format!("no stub for {}", key), "code": 803}})),
        ),
    }
}
