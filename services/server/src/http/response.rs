//! Response plumbing shared by the stream handlers: the error → status
//! mapping, weak ETags, and conditional body compression.

use crate::error::StoreError;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use rill_protocol::headers;
use rill_protocol::ProducerRejection;
use std::io::Write;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let (status, extra_headers) = classify(&self);
        let mut response = (status, self.to_string()).into_response();
        for (name, value) in extra_headers {
            if let Ok(value) = HeaderValue::from_str(&value) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

fn classify(error: &StoreError) -> (StatusCode, Vec<(&'static str, String)>) {
    match error {
        StoreError::StreamNotFound(_) | StoreError::SessionNotFound(_) => {
            (StatusCode::NOT_FOUND, Vec::new())
        }
        StoreError::AlreadyExists(_)
        | StoreError::SessionExists(_)
        | StoreError::ContentTypeMismatch { .. }
        | StoreError::DuplicateSeq { .. } => (StatusCode::CONFLICT, Vec::new()),
        StoreError::SoftDeleted { deleted_at } => (
            StatusCode::CONFLICT,
            vec![("stream-deleted-at", deleted_at.clone())],
        ),
        StoreError::InvalidJson(_)
        | StoreError::EmptyArray
        | StoreError::SchemaValidation(_)
        | StoreError::PartialProducerHeaders
        | StoreError::BadRequest(_)
        | StoreError::UnknownEventType(_) => (StatusCode::BAD_REQUEST, Vec::new()),
        StoreError::StreamClosed { current_offset } => (
            StatusCode::CONFLICT,
            vec![(headers::STREAM_NEXT_OFFSET, current_offset.to_string())],
        ),
        StoreError::Producer(rejection) => match rejection {
            ProducerRejection::StaleEpoch { current_epoch } => (
                StatusCode::FORBIDDEN,
                vec![(headers::PRODUCER_EPOCH, current_epoch.to_string())],
            ),
            ProducerRejection::InvalidEpochSeq => (StatusCode::BAD_REQUEST, Vec::new()),
            ProducerRejection::SequenceGap { expected, received } => (
                StatusCode::CONFLICT,
                vec![
                    (headers::PRODUCER_EXPECTED_SEQ, expected.to_string()),
                    (headers::PRODUCER_RECEIVED_SEQ, received.to_string()),
                ],
            ),
            ProducerRejection::StreamClosed { current_offset } => (
                StatusCode::CONFLICT,
                vec![(headers::STREAM_NEXT_OFFSET, current_offset.to_string())],
            ),
        },
        StoreError::Sqlite(_)
        | StoreError::IntegrityCheckFailed(_)
        | StoreError::Io(_)
        | StoreError::InvalidSchema { .. }
        | StoreError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// ETags
// ---------------------------------------------------------------------------

/// Weak ETag over `(base64(path), start, end, closed-suffix)`.
pub fn weak_etag(path: &str, start: &str, end: &str, closed: bool) -> String {
    let suffix = if closed { "-closed" } else { "" };
    format!("W/\"{}-{}-{}{}\"", BASE64.encode(path), start, end, suffix)
}

/// True when `If-None-Match` names this exact ETag.
pub fn if_none_match_hits(request_headers: &HeaderMap, etag: &str) -> bool {
    request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|candidates| candidates.split(',').any(|c| c.trim() == etag))
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Compress `body` when the client accepts it and the body clears the
/// size threshold. Returns the (possibly re-encoded) body and the chosen
/// `Content-Encoding` token.
pub fn maybe_compress(
    request_headers: &HeaderMap,
    body: Vec<u8>,
    threshold: usize,
) -> (Vec<u8>, Option<&'static str>) {
    if body.len() < threshold {
        return (body, None);
    }
    let accept = request_headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let accepts = |token: &str| {
        accept
            .split(',')
            .any(|part| part.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case(token))
    };

    if accepts("gzip") {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(&body).is_ok() {
            if let Ok(compressed) = encoder.finish() {
                return (compressed, Some("gzip"));
            }
        }
    } else if accepts("deflate") {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(&body).is_ok() {
            if let Ok(compressed) = encoder.finish() {
                return (compressed, Some("deflate"));
            }
        }
    }
    (body, None)
}
