//! Server-sent-event tail following.
//!
//! The loop: initial catch-up read, control event, long-poll wait for the
//! next tail message, repeat. Close is communicated by a final control
//! event with `streamClosed: true`, after which the stream ends. Binary
//! content types are base64-encoded and flagged with
//! `Stream-SSE-Data-Encoding: base64`. Each loop iteration checks the
//! shutdown flag so graceful shutdown can drain active responses.

use crate::engine::StoredMessage;
use crate::error::StoreError;
use crate::http::cursor::generate_response_cursor;
use crate::http::streams::{ReadQuery, SubscriptionGuard};
use crate::state::AppState;
use crate::store::subscribers::StreamNotice;
use crate::store::{json, Subscribed};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rill_protocol::{headers as h, ReadPosition};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tracks this response in the server's active-SSE count.
struct ActiveSse(Arc<AtomicUsize>);

impl ActiveSse {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        ActiveSse(counter)
    }
}

impl Drop for ActiveSse {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub async fn sse_read(
    state: AppState,
    path: String,
    query: ReadQuery,
) -> Result<Response, StoreError> {
    let position = match query.offset.as_deref() {
        None => ReadPosition::Beginning,
        Some(raw) => raw
            .parse()
            .map_err(|_| StoreError::BadRequest(format!("bad offset: {raw:?}")))?,
    };
    let row = state
        .store
        .get_stream(&path)
        .await?
        .ok_or_else(|| StoreError::StreamNotFound(path.clone()))?;
    let json_ct = json::is_json(&row.content_type);
    let binary = !json::is_textual(&row.content_type);
    let client_cursor = query.cursor.clone();

    let stream = async_stream::stream! {
        let _active = ActiveSse::new(state.sse_active.clone());
        let mut shutdown = state.shutdown.clone();
        let mut after = position;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(injected) = state.faults.take_sse_event(&path) {
                yield Ok::<_, Infallible>(Event::default().event(injected.event).data(injected.data));
            }

            let result = match state.store.read(&path, after).await {
                Ok(result) => result,
                Err(_) => break,
            };
            for message in &result.messages {
                yield Ok(data_event(message, json_ct, binary));
            }
            after = ReadPosition::After(result.next_offset);

            let cursor = generate_response_cursor(client_cursor.as_deref(), Utc::now());
            let mut control = serde_json::json!({
                "streamNextOffset": result.next_offset.to_string(),
                "streamCursor": cursor,
                "upToDate": true,
            });
            if result.closed {
                control["streamClosed"] = serde_json::Value::Bool(true);
                yield Ok(control_event(&control));
                break;
            }
            yield Ok(control_event(&control));

            match state.store.subscribe(&path, result.next_offset).await {
                Ok(Subscribed::Immediate(StreamNotice::Messages(_))) => {}
                Ok(Subscribed::Immediate(StreamNotice::Closed)) => {
                    yield Ok(closed_control(result.next_offset));
                    break;
                }
                Ok(Subscribed::Immediate(StreamNotice::Deleted)) | Err(_) => break,
                Ok(Subscribed::Waiting(rx, handle)) => {
                    let mut guard = SubscriptionGuard::new(state.store.clone(), handle);
                    tokio::select! {
                        notice = rx => {
                            guard.disarm();
                            match notice {
                                Ok(StreamNotice::Messages(_)) => {}
                                Ok(StreamNotice::Closed) => {
                                    yield Ok(closed_control(result.next_offset));
                                    break;
                                }
                                Ok(StreamNotice::Deleted) | Err(_) => break,
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
    };

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    );
    let mut response = sse.into_response();
    if binary {
        response.headers_mut().insert(
            h::STREAM_SSE_DATA_ENCODING,
            axum::http::HeaderValue::from_static("base64"),
        );
    }
    Ok(response)
}

/// Encode one message for the `data` frame: bare JSON value text for JSON
/// streams, UTF-8 text for textual types, base64 otherwise.
fn data_event(message: &StoredMessage, json_ct: bool, binary: bool) -> Event {
    let payload = if json_ct {
        String::from_utf8_lossy(&json::format_single_json_message(&message.bytes)).into_owned()
    } else if binary {
        BASE64.encode(&message.bytes)
    } else {
        String::from_utf8_lossy(&message.bytes).into_owned()
    };
    Event::default().event("data").data(payload)
}

fn control_event(control: &serde_json::Value) -> Event {
    Event::default().event("control").data(control.to_string())
}

fn closed_control(next_offset: rill_protocol::StreamOffset) -> Event {
    control_event(&serde_json::json!({
        "streamNextOffset": next_offset.to_string(),
        "streamClosed": true,
    }))
}
