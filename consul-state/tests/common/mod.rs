//! In-process stand-in for a Consul agent.
//!
//! Implements the slice of the HTTP API the backend talks to: KV get/put/
//! delete with `cas`, `acquire` and `release`, and session create/destroy/
//! info/renew. Sessions never expire on their own; tests expire them
//! explicitly with [`FakeConsul::expire_session`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use consul_state::BackendConfig;
use serde_json::{Value, json};

type Params = Query<HashMap<String, String>>;
type Shared = Arc<Mutex<FakeState>>;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_index: u64,
    modify_index: u64,
    lock_index: u64,
    session: Option<String>,
}

#[derive(Debug, Clone)]
struct Session {
    behavior: String,
    ttl: Option<String>,
}

/// A request as seen by the fake agent
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
    pub query: HashMap<String, String>,
    pub token: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    kv: HashMap<String, Entry>,
    sessions: HashMap<String, Session>,
    index: u64,
    required_token: Option<String>,
    requests: Vec<RecordedRequest>,
}

impl FakeState {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Record the request and enforce the ACL token, if one is required
    fn admit(
        &mut self,
        method: &'static str,
        path: String,
        query: &HashMap<String, String>,
        headers: &HeaderMap,
    ) -> Result<(), Response> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let token = header("x-consul-token");
        self.requests.push(RecordedRequest {
            method,
            path,
            query: query.clone(),
            token: token.clone(),
            authorization: header("authorization"),
        });

        match &self.required_token {
            Some(required) if token.as_ref() != Some(required) => {
                Err((StatusCode::FORBIDDEN, "Permission denied").into_response())
            }
            _ => Ok(()),
        }
    }

    fn invalidate_session(&mut self, id: &str) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };
        let held: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, entry)| entry.session.as_deref() == Some(id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in held {
            if session.behavior == "delete" {
                self.kv.remove(&key);
            } else {
                let index = self.next_index();
                if let Some(entry) = self.kv.get_mut(&key) {
                    entry.session = None;
                    entry.modify_index = index;
                }
            }
        }
        true
    }

    fn store(&mut self, key: &str, value: Vec<u8>, session: Option<String>) {
        let index = self.next_index();
        let entry = self.kv.entry(key.to_string()).or_insert(Entry {
            value: Vec::new(),
            create_index: index,
            modify_index: index,
            lock_index: 0,
            session: None,
        });
        entry.value = value;
        entry.modify_index = index;
        if let Some(session) = session {
            if entry.session.as_deref() != Some(session.as_str()) {
                entry.lock_index += 1;
            }
            entry.session = Some(session);
        }
    }
}

/// Handle to a running fake agent
#[derive(Clone)]
pub struct FakeConsul {
    pub addr: SocketAddr,
    state: Shared,
}

impl FakeConsul {
    pub async fn start() -> Self {
        Self::start_inner(None).await
    }

    /// Start an agent that rejects requests without this ACL token
    pub async fn start_with_token(token: &str) -> Self {
        Self::start_inner(Some(token.to_string())).await
    }

    async fn start_inner(required_token: Option<String>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let state: Shared = Arc::new(Mutex::new(FakeState {
            required_token,
            ..FakeState::default()
        }));

        let router = Router::new()
            .route("/v1/kv/{*key}", get(kv_get).put(kv_put).delete(kv_delete))
            .route("/v1/session/create", put(session_create))
            .route("/v1/session/destroy/{id}", put(session_destroy))
            .route("/v1/session/info/{id}", get(session_info))
            .route("/v1/session/renew/{id}", put(session_renew))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, state }
    }

    /// Start or stop rejecting requests that lack `token`
    pub fn set_required_token(&self, token: Option<&str>) {
        self.state.lock().unwrap().required_token = token.map(str::to_string);
    }

    /// `host:port` of the agent
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Backend configuration pointing at this agent
    pub fn config(&self, path: &str) -> BackendConfig {
        BackendConfig::new("consul")
            .with_attribute("path", path)
            .with_attribute("address", self.address())
    }

    /// Simulate the agent invalidating a session (TTL ran out, node failed)
    pub fn expire_session(&self, id: &str) {
        assert!(
            self.state.lock().unwrap().invalidate_session(id),
            "unknown session {}",
            id
        );
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// TTL requested when the session was created
    pub fn session_ttl(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(id)
            .and_then(|s| s.ttl.clone())
    }

    /// Raw stored value, bypassing the HTTP API
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().kv.get(key).map(|e| e.value.clone())
    }

    /// Session currently holding `key`
    pub fn holder(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .kv
            .get(key)
            .and_then(|e| e.session.clone())
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

fn kv_json(key: &str, entry: &Entry) -> Value {
    let value = if entry.value.is_empty() {
        Value::Null
    } else {
        Value::String(STANDARD.encode(&entry.value))
    };
    let mut pair = json!({
        "Key": key,
        "Value": value,
        "CreateIndex": entry.create_index,
        "ModifyIndex": entry.modify_index,
        "LockIndex": entry.lock_index,
        "Flags": 0,
    });
    if let Some(session) = &entry.session {
        pair["Session"] = json!(session);
    }
    pair
}

async fn kv_get(
    State(state): State<Shared>,
    Path(key): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(denied) = state.admit("GET", format!("kv/{}", key), &query, &headers) {
        return denied;
    }
    match state.kv.get(&key) {
        Some(entry) => Json(json!([kv_json(&key, entry)])).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn kv_put(
    State(state): State<Shared>,
    Path(key): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(denied) = state.admit("PUT", format!("kv/{}", key), &query, &headers) {
        return denied;
    }

    let ok = if let Some(session) = query.get("acquire") {
        if !state.sessions.contains_key(session) {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("invalid session \"{}\"", session),
            )
                .into_response();
        }
        let held_by_other = state
            .kv
            .get(&key)
            .and_then(|e| e.session.as_ref())
            .is_some_and(|holder| holder != session);
        if held_by_other {
            false
        } else {
            state.store(&key, body.to_vec(), Some(session.clone()));
            true
        }
    } else if let Some(session) = query.get("release") {
        let held = state
            .kv
            .get(&key)
            .is_some_and(|e| e.session.as_ref() == Some(session));
        if held {
            let index = state.next_index();
            if let Some(entry) = state.kv.get_mut(&key) {
                entry.session = None;
                entry.modify_index = index;
            }
        }
        held
    } else if let Some(cas) = query.get("cas") {
        let Ok(cas) = cas.parse::<u64>() else {
            return (StatusCode::BAD_REQUEST, "invalid cas index").into_response();
        };
        let current = state.kv.get(&key).map(|e| e.modify_index).unwrap_or(0);
        if current == cas {
            state.store(&key, body.to_vec(), None);
            true
        } else {
            false
        }
    } else {
        state.store(&key, body.to_vec(), None);
        true
    };

    (StatusCode::OK, if ok { "true" } else { "false" }).into_response()
}

async fn kv_delete(
    State(state): State<Shared>,
    Path(key): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(denied) = state.admit("DELETE", format!("kv/{}", key), &query, &headers) {
        return denied;
    }
    state.kv.remove(&key);
    state.next_index();
    (StatusCode::OK, "true").into_response()
}

async fn session_create(
    State(state): State<Shared>,
    Query(query): Params,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(denied) = state.admit("PUT", "session/create".to_string(), &query, &headers) {
        return denied;
    }
    let id = uuid::Uuid::new_v4().to_string();
    let session = Session {
        behavior: body["Behavior"].as_str().unwrap_or("release").to_string(),
        ttl: body["TTL"].as_str().map(str::to_string),
    };
    state.sessions.insert(id.clone(), session);
    Json(json!({ "ID": id })).into_response()
}

async fn session_destroy(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(denied) = state.admit("PUT", format!("session/destroy/{}", id), &query, &headers) {
        return denied;
    }
    state.invalidate_session(&id);
    (StatusCode::OK, "true").into_response()
}

async fn session_info(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(denied) = state.admit("GET", format!("session/info/{}", id), &query, &headers) {
        return denied;
    }
    match state.sessions.get(&id) {
        Some(session) => Json(json!([{ "ID": id, "Behavior": session.behavior, "TTL": session.ttl }]))
            .into_response(),
        None => Json(Value::Null).into_response(),
    }
}

async fn session_renew(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(denied) = state.admit("PUT", format!("session/renew/{}", id), &query, &headers) {
        return denied;
    }
    match state.sessions.get(&id) {
        Some(session) => Json(json!([{ "ID": id, "Behavior": session.behavior, "TTL": session.ttl }]))
            .into_response(),
        None => (StatusCode::NOT_FOUND, format!("Session id '{}' not found", id)).into_response(),
    }
}
