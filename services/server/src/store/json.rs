//! JSON content-type framing.
//!
//! Streams with content type `application/json` accumulate messages on disk
//! as raw comma-suffixed fragments. A read is then the concatenation of all
//! fragments wrapped in `[...]`, with the final trailing comma swapped for
//! `]` — a valid JSON array with zero parsing on the read path.

use crate::engine::StoredMessage;
use crate::error::{StoreError, StoreResult};

/// True when `content_type` carries JSON array framing.
pub fn is_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();
    essence.eq_ignore_ascii_case("application/json")
}

/// True when the payload can be sent as text over SSE without encoding.
pub fn is_textual(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("text/")
        || essence == "application/json"
        || essence == "application/x-ndjson"
        || essence == "application/xml"
        || essence.ends_with("+json")
}

/// Preprocess one JSON append body into comma-suffixed fragments.
///
/// An array body yields one fragment per element; a single JSON value
/// yields one fragment (the original bytes plus a trailing comma). An empty
/// array is a no-op on the initial create and an error afterwards.
pub fn process_json_append(body: &[u8], initial: bool) -> StoreResult<Vec<Vec<u8>>> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| StoreError::InvalidJson(e.to_string()))?;
    match value {
        serde_json::Value::Array(elements) => {
            if elements.is_empty() {
                if initial {
                    return Ok(Vec::new());
                }
                return Err(StoreError::EmptyArray);
            }
            Ok(elements
                .into_iter()
                .map(|element| {
                    let mut fragment = element.to_string().into_bytes();
                    fragment.push(b',');
                    fragment
                })
                .collect())
        }
        _ => {
            let mut fragment = body.to_vec();
            fragment.push(b',');
            Ok(vec![fragment])
        }
    }
}

/// Assemble the read-side response body for a content type.
pub fn format_response(content_type: &str, messages: &[StoredMessage]) -> Vec<u8> {
    if is_json(content_type) {
        let mut body = Vec::with_capacity(
            2 + messages.iter().map(|m| m.bytes.len()).sum::<usize>(),
        );
        body.push(b'[');
        for message in messages {
            body.extend_from_slice(&message.bytes);
        }
        match body.last_mut() {
            Some(last) if *last == b',' => *last = b']',
            _ => body.push(b']'),
        }
        body
    } else {
        let mut body = Vec::new();
        for message in messages {
            body.extend_from_slice(&message.bytes);
        }
        body
    }
}

/// Strip the stored trailing-comma framing from one JSON message, yielding
/// the bare JSON value text (used for SSE data frames).
pub fn format_single_json_message(bytes: &[u8]) -> Vec<u8> {
    let mut end = bytes.len();
    while end > 0 && (bytes[end - 1] as char).is_ascii_whitespace() {
        end -= 1;
    }
    if end > 0 && bytes[end - 1] == b',' {
        end -= 1;
    }
    bytes[..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_protocol::StreamOffset;

    fn msg(bytes: &[u8]) -> StoredMessage {
        StoredMessage {
            offset: StreamOffset::ZERO,
            bytes: bytes.to_vec(),
            created_at: String::new(),
        }
    }

    #[test]
    fn array_body_becomes_one_fragment_per_element() {
        let frames = process_json_append(br#"[{"i":0},{"i":1}]"#, false).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], br#"{"i":0},"#);
        assert_eq!(frames[1], br#"{"i":1},"#);
    }

    #[test]
    fn single_value_gets_a_trailing_comma() {
        let frames = process_json_append(br#"{"a": 1}"#, false).unwrap();
        assert_eq!(frames, vec![br#"{"a": 1},"#.to_vec()]);
    }

    #[test]
    fn empty_array_is_allowed_only_on_create() {
        assert!(process_json_append(b"[]", true).unwrap().is_empty());
        assert!(matches!(
            process_json_append(b"[]", false),
            Err(StoreError::EmptyArray)
        ));
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(matches!(
            process_json_append(b"{nope", false),
            Err(StoreError::InvalidJson(_))
        ));
    }

    #[test]
    fn format_response_swaps_final_comma_for_bracket() {
        let messages = vec![msg(br#"{"i":0},"#), msg(br#"{"i":1},"#)];
        let body = format_response("application/json", &messages);
        assert_eq!(body, br#"[{"i":0},{"i":1}]"#);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn format_response_empty_is_empty_array() {
        assert_eq!(format_response("application/json", &[]), b"[]");
    }

    #[test]
    fn non_json_response_is_plain_concatenation() {
        let messages = vec![msg(b"hello "), msg(b"world")];
        assert_eq!(
            format_response("text/plain", &messages),
            b"hello world"
        );
    }

    #[test]
    fn single_message_framing_strips_comma_and_whitespace() {
        assert_eq!(format_single_json_message(b"{\"a\":1},"), b"{\"a\":1}");
        assert_eq!(format_single_json_message(b"{\"a\":1}, \n"), b"{\"a\":1}");
        assert_eq!(format_single_json_message(b"{\"a\":1}"), b"{\"a\":1}");
    }

    #[test]
    fn content_type_detection() {
        assert!(is_json("application/json"));
        assert!(is_json("application/json; charset=utf-8"));
        assert!(!is_json("application/octet-stream"));
        assert!(is_textual("text/plain"));
        assert!(is_textual("application/vnd.api+json"));
        assert!(!is_textual("application/octet-stream"));
        assert!(!is_textual("image/png"));
    }
}
