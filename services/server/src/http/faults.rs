//! Test-only fault injection.
//!
//! `POST /_test/inject-error` installs per-(path, optional method) faults
//! with a usage count; `DELETE /_test/inject-error` clears them. A fault
//! can inject an HTTP status (with optional `Retry-After`), delay the
//! response with jitter, drop the connection (502), truncate the response
//! body, corrupt scattered body bytes, or inject an arbitrary SSE event
//! frame. Consumption decrements the count; zero removes the fault.
//! Probability gates apply per request.

use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::Rng;
use serde::Deserialize;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tracing::info;

// ---------------------------------------------------------------------------
// Fault specs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SseEventSpec {
    pub event: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FaultSpec {
    /// Stream path the fault applies to, e.g. `/chat/42`.
    pub path: String,
    /// Restrict to one HTTP method; any method when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// How many requests consume this fault before it is removed.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Per-request gate in `[0, 1]`; ungated when absent.
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub retry_after_secs: Option<u64>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter_ms: Option<u64>,
    #[serde(default)]
    pub drop_connection: bool,
    #[serde(default)]
    pub truncate_body_bytes: Option<usize>,
    #[serde(default)]
    pub corrupt_body_bytes: Option<usize>,
    #[serde(default)]
    pub sse_event: Option<SseEventSpec>,
}

fn default_count() -> u32 {
    1
}

impl FaultSpec {
    fn matches(&self, path: &str, method: &str) -> bool {
        self.path == path
            && self
                .method
                .as_deref()
                .is_none_or(|m| m.eq_ignore_ascii_case(method))
    }

    fn is_sse_only(&self) -> bool {
        self.sse_event.is_some()
            && self.status.is_none()
            && self.delay_ms.is_none()
            && !self.drop_connection
            && self.truncate_body_bytes.is_none()
            && self.corrupt_body_bytes.is_none()
    }
}

// ---------------------------------------------------------------------------
// Fault table
// ---------------------------------------------------------------------------

struct FaultEntry {
    spec: FaultSpec,
    remaining: u32,
}

#[derive(Default)]
pub struct FaultTable {
    entries: StdMutex<Vec<FaultEntry>>,
}

impl FaultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, spec: FaultSpec) {
        let remaining = spec.count.max(1);
        info!(path = %spec.path, count = remaining, "fault installed");
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(FaultEntry { spec, remaining });
    }

    /// Remove faults for `path`, or everything when `path` is `None`.
    /// Returns how many entries were dropped.
    pub fn clear(&self, path: Option<&str>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        match path {
            Some(path) => entries.retain(|e| e.spec.path != path),
            None => entries.clear(),
        }
        before - entries.len()
    }

    /// Consume one matching request-level fault, honouring its probability
    /// gate. SSE-frame-only faults are left for `take_sse_event`.
    pub fn consume(&self, path: &str, method: &str) -> Option<FaultSpec> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let position = entries
            .iter()
            .position(|e| e.spec.matches(path, method) && !e.spec.is_sse_only())?;
        if !gate_passes(entries[position].spec.probability) {
            return None;
        }
        Some(decrement(&mut entries, position))
    }

    /// Consume one pending SSE event injection for `path`.
    pub fn take_sse_event(&self, path: &str) -> Option<SseEventSpec> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let position = entries
            .iter()
            .position(|e| e.spec.path == path && e.spec.sse_event.is_some())?;
        if !gate_passes(entries[position].spec.probability) {
            return None;
        }
        decrement(&mut entries, position).sse_event
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn gate_passes(probability: Option<f64>) -> bool {
    match probability {
        Some(p) => rand::thread_rng().gen_bool(p.clamp(0.0, 1.0)),
        None => true,
    }
}

fn decrement(entries: &mut Vec<FaultEntry>, position: usize) -> FaultSpec {
    let spec = entries[position].spec.clone();
    entries[position].remaining -= 1;
    if entries[position].remaining == 0 {
        entries.remove(position);
    }
    spec
}

// ---------------------------------------------------------------------------
// Control-plane handlers
// ---------------------------------------------------------------------------

pub async fn install_fault(
    State(state): State<AppState>,
    axum::Json(spec): axum::Json<FaultSpec>,
) -> impl IntoResponse {
    state.faults.install(spec);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    #[serde(default)]
    pub path: Option<String>,
}

pub async fn clear_faults(
    State(state): State<AppState>,
    axum::extract::Query(query): axum::extract::Query<ClearQuery>,
) -> impl IntoResponse {
    state.faults.clear(query.path.as_deref());
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Apply request-level faults around the inner handler.
pub async fn fault_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_owned();
    if path.starts_with("/_test") {
        return next.run(request).await;
    }
    let method = request.method().as_str().to_owned();
    let Some(fault) = state.faults.consume(&path, &method) else {
        return next.run(request).await;
    };

    if let Some(delay_ms) = fault.delay_ms {
        let jitter = fault
            .jitter_ms
            .map_or(0, |j| rand::thread_rng().gen_range(0..=j));
        tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
    }
    if fault.drop_connection {
        return (StatusCode::BAD_GATEWAY, "connection dropped by fault").into_response();
    }
    if let Some(status) = fault.status {
        let status =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, "injected fault").into_response();
        if let Some(retry_after) = fault.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        return response;
    }

    let response = next.run(request).await;
    if fault.truncate_body_bytes.is_none() && fault.corrupt_body_bytes.is_none() {
        return response;
    }
    mangle_body(response, &fault).await
}

/// Buffer the response body and apply truncation / corruption.
async fn mangle_body(response: Response, fault: &FaultSpec) -> Response {
    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "fault body buffering failed").into_response();
    };
    let mut bytes = bytes.to_vec();

    if let Some(limit) = fault.truncate_body_bytes {
        bytes.truncate(limit);
    }
    if let Some(corruptions) = fault.corrupt_body_bytes {
        if !bytes.is_empty() {
            let mut rng = rand::thread_rng();
            for _ in 0..corruptions {
                let i = rng.gen_range(0..bytes.len());
                bytes[i] = bytes[i].wrapping_add(1);
            }
        }
    }

    parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(bytes))
}
