//! HTTP protocol server: verb → operation mapping over the durable store.

pub mod cursor;
pub mod faults;
pub mod response;
pub mod sse;
pub mod streams;

use crate::state::AppState;
use axum::http::{HeaderName, Method};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use rill_protocol::headers;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let exposed: Vec<HeaderName> = headers::EXPOSED
        .iter()
        .filter_map(|name| name.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(exposed);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/_admin/streams", get(streams::admin_list_streams))
        .route(
            "/_test/inject-error",
            post(faults::install_fault).delete(faults::clear_faults),
        )
        .route(
            "/{*path}",
            get(streams::read_stream)
                .head(streams::head_stream)
                .put(streams::create_stream)
                .post(streams::append_stream)
                .delete(streams::delete_stream)
                .options(streams::preflight),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            faults::fault_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn readyz() -> impl IntoResponse {
    // Stores are opened before the router is built; reaching this handler
    // means the process is ready.
    "ok"
}
