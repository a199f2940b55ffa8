//! Stream protocol handlers: PUT / HEAD / GET / POST / DELETE on `/{*path}`,
//! plus the operator listing under `/_admin/streams`.

use crate::error::{StoreError, StoreResult};
use crate::http::cursor::generate_response_cursor;
use crate::http::response::{if_none_match_hits, maybe_compress, weak_etag};
use crate::state::AppState;
use crate::store::subscribers::{StreamNotice, SubscriptionHandle};
use crate::store::{
    json, AppendOutcome, CreateOutcome, DurableStore, ReadResult, StreamCreateConfig, Subscribed,
};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use rill_protocol::{headers as h, ProducerFence, ProducerOutcome, ReadPosition};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

/// The wildcard capture drops the leading slash; stream paths keep it.
pub fn stream_path(raw: &str) -> String {
    format!("/{}", raw.trim_start_matches('/'))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bool_header(headers: &HeaderMap, name: &str) -> bool {
    header_str(headers, name).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn content_type_essence(value: &str) -> &str {
    value.split(';').next().unwrap_or(value).trim()
}

/// Parse the producer fence triple: all three headers or none.
fn parse_fence(headers: &HeaderMap) -> StoreResult<Option<ProducerFence>> {
    let id = header_str(headers, h::PRODUCER_ID);
    let epoch = header_str(headers, h::PRODUCER_EPOCH);
    let seq = header_str(headers, h::PRODUCER_SEQ);
    match (id, epoch, seq) {
        (None, None, None) => Ok(None),
        (Some(id), Some(epoch), Some(seq)) => {
            let epoch: u64 = epoch
                .parse()
                .map_err(|_| StoreError::BadRequest(format!("bad producer epoch: {epoch:?}")))?;
            let seq: u64 = seq
                .parse()
                .map_err(|_| StoreError::BadRequest(format!("bad producer seq: {seq:?}")))?;
            Ok(Some(ProducerFence {
                producer_id: id.to_owned(),
                epoch,
                seq,
            }))
        }
        _ => Err(StoreError::PartialProducerHeaders),
    }
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

// ---------------------------------------------------------------------------
// PUT — create
// ---------------------------------------------------------------------------

pub async fn create_stream(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StoreError> {
    let path = stream_path(&raw_path);

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str())
        .unwrap_or("application/octet-stream")
        .to_owned();

    let ttl_seconds = match header_str(&headers, h::STREAM_TTL) {
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
            StoreError::BadRequest(format!("stream-ttl must be a non-negative integer: {raw:?}"))
        })?),
        None => None,
    };
    let expires_at = match header_str(&headers, h::STREAM_EXPIRES_AT) {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| StoreError::BadRequest(format!("bad stream-expires-at: {raw:?}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    if ttl_seconds.is_some() && expires_at.is_some() {
        return Err(StoreError::BadRequest(
            "stream-ttl and stream-expires-at are mutually exclusive".to_owned(),
        ));
    }

    let config = StreamCreateConfig {
        content_type,
        ttl_seconds,
        expires_at,
        closed: bool_header(&headers, h::STREAM_CLOSED),
    };
    let initial_body = (!body.is_empty()).then(|| body.as_ref());
    let outcome = state.store.create_stream(&path, config, initial_body).await?;

    let (status, row) = match &outcome {
        CreateOutcome::Created(row) => (StatusCode::CREATED, row),
        CreateOutcome::Reused(row) => (StatusCode::OK, row),
    };
    let mut response = status.into_response();
    if status == StatusCode::CREATED {
        insert_header(&mut response, "location", &path);
    }
    insert_header(&mut response, h::STREAM_NEXT_OFFSET, &row.offset().to_string());
    if row.closed {
        insert_header(&mut response, h::STREAM_CLOSED, "true");
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// HEAD — metadata
// ---------------------------------------------------------------------------

pub async fn head_stream(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
) -> Result<Response, StoreError> {
    let path = stream_path(&raw_path);
    let row = state
        .store
        .get_stream(&path)
        .await?
        .ok_or_else(|| StoreError::StreamNotFound(path.clone()))?;

    let offset = row.offset().to_string();
    let mut response = StatusCode::OK.into_response();
    insert_header(&mut response, h::STREAM_NEXT_OFFSET, &offset);
    if row.closed {
        insert_header(&mut response, h::STREAM_CLOSED, "true");
    }
    let etag = weak_etag(&path, "-1", &offset, row.closed);
    insert_header(&mut response, "etag", &etag);
    insert_header(&mut response, "cache-control", "no-store");
    Ok(response)
}

// ---------------------------------------------------------------------------
// GET — read (plain / long-poll; SSE lives in http::sse)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    pub offset: Option<String>,
    #[serde(default)]
    pub live: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
}

pub async fn read_stream(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Result<Response, StoreError> {
    let path = stream_path(&raw_path);
    let live = query.live.clone();
    match live.as_deref() {
        None | Some("none") => plain_read(&state, &path, &query, &headers).await,
        Some("long-poll") => long_poll(&state, &path, &query, &headers).await,
        Some("sse") => crate::http::sse::sse_read(state, path, query).await,
        Some(other) => Err(StoreError::BadRequest(format!("unknown live mode: {other:?}"))),
    }
}

fn parse_position(raw: Option<&str>) -> StoreResult<ReadPosition> {
    match raw {
        None => Ok(ReadPosition::Beginning),
        Some(raw) => raw
            .parse()
            .map_err(|_| StoreError::BadRequest(format!("bad offset: {raw:?}"))),
    }
}

async fn plain_read(
    state: &AppState,
    path: &str,
    query: &ReadQuery,
    headers: &HeaderMap,
) -> Result<Response, StoreError> {
    let position = parse_position(query.offset.as_deref())?;
    let result = state.store.read(path, position).await?;
    let start_label = query.offset.clone().unwrap_or_else(|| "-1".to_owned());
    Ok(build_read_response(
        state,
        path,
        &start_label,
        &result,
        headers,
        None,
    ))
}

/// Shared 200 builder for plain reads and resolved long-polls.
fn build_read_response(
    state: &AppState,
    path: &str,
    start_label: &str,
    result: &ReadResult,
    request_headers: &HeaderMap,
    cursor: Option<String>,
) -> Response {
    let next_offset = result.next_offset.to_string();
    let etag = weak_etag(path, start_label, &next_offset, result.closed);
    if if_none_match_hits(request_headers, &etag) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        insert_header(&mut response, "etag", &etag);
        return response;
    }

    let body = json::format_response(&result.content_type, &result.messages);
    let (body, encoding) = maybe_compress(request_headers, body, state.config.compress_threshold);

    let mut response = (StatusCode::OK, body).into_response();
    insert_header(&mut response, "content-type", &result.content_type);
    insert_header(&mut response, h::STREAM_NEXT_OFFSET, &next_offset);
    insert_header(&mut response, h::STREAM_UP_TO_DATE, "true");
    if result.closed {
        insert_header(&mut response, h::STREAM_CLOSED, "true");
    }
    insert_header(&mut response, "etag", &etag);
    insert_header(&mut response, "cache-control", "no-store");
    insert_header(&mut response, "vary", "accept-encoding");
    if let Some(encoding) = encoding {
        insert_header(&mut response, "content-encoding", encoding);
    }
    if let Some(cursor) = cursor {
        insert_header(&mut response, h::STREAM_CURSOR, &cursor);
    }
    response
}

/// Removes a live-wait subscription when the request unwinds, including
/// client disconnects that cancel the handler future.
pub(crate) struct SubscriptionGuard {
    store: Arc<DurableStore>,
    handle: Option<SubscriptionHandle>,
}

impl SubscriptionGuard {
    pub(crate) fn new(store: Arc<DurableStore>, handle: SubscriptionHandle) -> Self {
        SubscriptionGuard {
            store,
            handle: Some(handle),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.store.unsubscribe(&handle);
        }
    }
}

async fn long_poll(
    state: &AppState,
    path: &str,
    query: &ReadQuery,
    headers: &HeaderMap,
) -> Result<Response, StoreError> {
    let offset_raw = query
        .offset
        .clone()
        .ok_or_else(|| StoreError::BadRequest("offset is required for long-poll".to_owned()))?;
    let position = parse_position(Some(&offset_raw))?;

    let result = state.store.read(path, position).await?;
    let cursor = generate_response_cursor(query.cursor.as_deref(), Utc::now());

    if !result.messages.is_empty() {
        return Ok(build_read_response(
            state,
            path,
            &offset_raw,
            &result,
            headers,
            Some(cursor),
        ));
    }
    if result.closed {
        return Ok(closed_204());
    }

    let (rx, handle) = match state.store.subscribe(path, result.next_offset).await? {
        Subscribed::Immediate(StreamNotice::Messages(messages)) => {
            let resolved = ReadResult {
                next_offset: messages.last().map_or(result.next_offset, |m| m.offset),
                messages,
                closed: result.closed,
                content_type: result.content_type.clone(),
            };
            return Ok(build_read_response(
                state,
                path,
                &offset_raw,
                &resolved,
                headers,
                Some(cursor),
            ));
        }
        Subscribed::Immediate(StreamNotice::Closed) => return Ok(closed_204()),
        Subscribed::Immediate(StreamNotice::Deleted) => {
            return Err(StoreError::StreamNotFound(path.to_owned()))
        }
        Subscribed::Waiting(rx, handle) => (rx, handle),
    };

    let mut guard = SubscriptionGuard::new(state.store.clone(), handle);

    let notice = tokio::select! {
        notice = rx => {
            guard.disarm();
            notice.ok()
        }
        () = tokio::time::sleep(state.config.long_poll_timeout) => None,
    };

    match notice {
        Some(StreamNotice::Messages(messages)) => {
            let resolved = ReadResult {
                next_offset: messages.last().map_or(result.next_offset, |m| m.offset),
                messages,
                closed: false,
                content_type: result.content_type,
            };
            Ok(build_read_response(
                state,
                path,
                &offset_raw,
                &resolved,
                headers,
                Some(cursor),
            ))
        }
        Some(StreamNotice::Closed) => Ok(closed_204()),
        Some(StreamNotice::Deleted) => Err(StoreError::StreamNotFound(path.to_owned())),
        // Timeout (or a dropped sender): the stream may or may not have
        // closed during the wait; the client retries with the cursor.
        None => {
            debug!(path, "long-poll timed out");
            let mut response = StatusCode::NO_CONTENT.into_response();
            insert_header(&mut response, h::STREAM_CURSOR, &cursor);
            Ok(response)
        }
    }
}

fn closed_204() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    insert_header(&mut response, h::STREAM_CLOSED, "true");
    response
}

// ---------------------------------------------------------------------------
// POST — append / close
// ---------------------------------------------------------------------------

pub async fn append_stream(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StoreError> {
    let path = stream_path(&raw_path);
    let fence = parse_fence(&headers)?;
    let close = bool_header(&headers, h::STREAM_CLOSED);

    let outcome = if body.is_empty() {
        if !close {
            return Err(StoreError::BadRequest(
                "empty body without stream-closed".to_owned(),
            ));
        }
        state.store.close_stream(&path, fence.as_ref()).await?
    } else {
        let request_ct = header_str(&headers, header::CONTENT_TYPE.as_str()).ok_or_else(|| {
            StoreError::BadRequest("content-type is required for a non-empty body".to_owned())
        })?;
        let row = state
            .store
            .get_stream(&path)
            .await?
            .ok_or_else(|| StoreError::StreamNotFound(path.clone()))?;
        if !content_type_essence(request_ct)
            .eq_ignore_ascii_case(content_type_essence(&row.content_type))
        {
            return Err(StoreError::ContentTypeMismatch {
                stream: row.content_type,
                request: request_ct.to_owned(),
            });
        }
        state.store.append(&path, &body, fence.as_ref(), close).await?
    };

    Ok(append_response(&outcome))
}

fn append_response(outcome: &AppendOutcome) -> Response {
    let (status, producer_headers) = match outcome.producer {
        Some(ProducerOutcome::Accepted { epoch, seq }) => (StatusCode::OK, Some((epoch, seq))),
        Some(ProducerOutcome::Duplicate { epoch, seq }) => {
            (StatusCode::NO_CONTENT, Some((epoch, seq)))
        }
        None => (StatusCode::NO_CONTENT, None),
    };
    let mut response = status.into_response();
    insert_header(
        &mut response,
        h::STREAM_NEXT_OFFSET,
        &outcome.next_offset.to_string(),
    );
    if let Some((epoch, seq)) = producer_headers {
        insert_header(&mut response, h::PRODUCER_EPOCH, &epoch.to_string());
        insert_header(&mut response, h::PRODUCER_SEQ, &seq.to_string());
    }
    response
}

// ---------------------------------------------------------------------------
// DELETE
// ---------------------------------------------------------------------------

pub async fn delete_stream(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
) -> Result<Response, StoreError> {
    let path = stream_path(&raw_path);
    if state.store.delete_stream(&path).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(StoreError::StreamNotFound(path))
    }
}

// ---------------------------------------------------------------------------
// OPTIONS
// ---------------------------------------------------------------------------

pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Operator listing
// ---------------------------------------------------------------------------

pub async fn admin_list_streams(
    State(state): State<AppState>,
) -> Result<axum::Json<serde_json::Value>, StoreError> {
    let rows = state.store.list_streams().await?;
    let streams: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(row, message_count)| {
            serde_json::json!({
                "path": row.path,
                "content_type": row.content_type,
                "created_at": row.created_at,
                "next_offset": row.offset().to_string(),
                "message_count": message_count,
                "closed": row.closed,
                "ttl_seconds": row.ttl_seconds,
                "expires_at": row.expires_at,
            })
        })
        .collect();
    Ok(axum::Json(serde_json::json!({ "streams": streams })))
}
