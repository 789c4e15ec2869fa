#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use resthook::{
    Dispatcher, EngineConfig, HookRegistry, InMemoryStorage, Principal, RoleTopic, RoleTopicStore,
    Storage,
};

/// How a mock subscriber answers.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Echo the confirmation secret, accept deliveries with 200.
    Echo,
    /// Echo a different secret.
    WrongSecret,
    /// Confirm correctly, fail every delivery with this status.
    Fail(u16),
    /// Confirm correctly, stall every delivery.
    Hang(Duration),
    /// Confirm correctly, answer every delivery with `307` to this location.
    Redirect(String),
    /// Answer the handshake itself with `307` to this location.
    RedirectConfirmation(String),
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub headers: HeaderMap,
    pub body: Value,
}

#[derive(Default)]
pub struct Received {
    pub confirmations: AtomicUsize,
    pub deliveries: Mutex<Vec<Delivery>>,
}

impl Received {
    pub fn confirmations(&self) -> usize {
        self.confirmations.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

pub struct MockEndpoint {
    pub url: String,
    pub received: Arc<Received>,
}

#[derive(Clone)]
struct EndpointState {
    mode: Mode,
    received: Arc<Received>,
}

/// Subscriber bound to an ephemeral local port; lives until the runtime stops.
pub async fn spawn_endpoint(mode: Mode) -> MockEndpoint {
    let received = Arc::new(Received::default());
    let state = EndpointState {
        mode,
        received: received.clone(),
    };
    let app = Router::new().route("/hook", post(handle)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockEndpoint {
        url: format!("http://{addr}/hook"),
        received,
    }
}

async fn handle(State(state): State<EndpointState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(secret) = headers.get("x-hook-secret").and_then(|v| v.to_str().ok()) {
        state.received.confirmations.fetch_add(1, Ordering::SeqCst);
        let echoed = match &state.mode {
            Mode::WrongSecret => "not-the-secret".to_string(),
            Mode::RedirectConfirmation(location) => return redirect(location),
            _ => secret.to_string(),
        };
        return Json(json!({ "x-hook-secret": echoed })).into_response();
    }

    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state
        .received
        .deliveries
        .lock()
        .unwrap()
        .push(Delivery { headers, body });

    match &state.mode {
        Mode::Fail(status) => StatusCode::from_u16(*status).unwrap().into_response(),
        Mode::Hang(delay) => {
            tokio::time::sleep(*delay).await;
            StatusCode::OK.into_response()
        }
        Mode::Redirect(location) => redirect(location),
        Mode::Echo | Mode::WrongSecret | Mode::RedirectConfirmation(_) => {
            StatusCode::OK.into_response()
        }
    }
}

fn redirect(location: &str) -> Response {
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(axum::http::header::LOCATION, location.to_string())],
    )
        .into_response()
}

/// Port nothing listens on.
pub async fn dead_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/hook")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        confirm_timeout_ms: 2_000,
        delivery_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
}

/// Registry and dispatcher sharing one in-memory store.
pub struct Engine {
    pub storage: Arc<InMemoryStorage>,
    pub registry: HookRegistry,
    pub dispatcher: Arc<Dispatcher>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        init_tracing();
        let storage = Arc::new(InMemoryStorage::new());
        let shared: Arc<dyn Storage> = storage.clone();
        Self {
            registry: HookRegistry::new(&config, shared.clone()),
            dispatcher: Arc::new(Dispatcher::new(&config, shared)),
            storage,
        }
    }

    pub async fn grant(&self, role: &str, topic: &str) {
        self.storage
            .insert_role_topic(&RoleTopic::new(role, topic))
            .await
            .unwrap();
    }
}

pub fn alice() -> Principal {
    Principal::user("alice", &["copilot"])
}
