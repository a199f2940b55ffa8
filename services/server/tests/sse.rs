//! SSE integration tests: catch-up frames, control frames, close, binary
//! encoding, and injected event frames.

use futures_util::StreamExt;
use rill_test_utils::TestServer;
use std::time::Duration;

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    event: String,
    data: String,
}

/// Read SSE frames from `url` until `stop` returns true or the timeout
/// elapses.
async fn collect_frames<F>(url: String, stop: F, timeout: Duration) -> Vec<Frame>
where
    F: Fn(&[Frame]) -> bool,
{
    let work = async move {
        let resp = reqwest::get(url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let mut body = resp.bytes_stream();
        let mut buffer = String::new();
        let mut frames: Vec<Frame> = Vec::new();

        'outer: while let Some(chunk) = body.next().await {
            buffer.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            while let Some(boundary) = buffer.find("\n\n") {
                let raw = buffer[..boundary].to_owned();
                buffer.drain(..boundary + 2);
                let mut event = String::new();
                let mut data_lines = Vec::new();
                for line in raw.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event = value.trim().to_owned();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_owned());
                    }
                }
                if event.is_empty() && data_lines.is_empty() {
                    continue; // keepalive comment
                }
                frames.push(Frame {
                    event,
                    data: data_lines.join("\n"),
                });
                if stop(&frames) {
                    break 'outer;
                }
            }
        }
        frames
    };
    tokio::time::timeout(timeout, work).await.expect("SSE read timed out")
}

fn has_closed_control(frames: &[Frame]) -> bool {
    frames.iter().any(|f| {
        f.event == "control"
            && serde_json::from_str::<serde_json::Value>(&f.data)
                .map(|v| v["streamClosed"] == true)
                .unwrap_or(false)
    })
}

#[tokio::test]
async fn catch_up_then_control_then_close() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    client
        .put(server.url("/s"))
        .header("content-type", "application/json")
        .body(r#"[{"i":0},{"i":1}]"#)
        .send()
        .await
        .unwrap();

    let url = server.url("/s?offset=-1&live=sse");
    let reader = tokio::spawn(collect_frames(
        url,
        has_closed_control,
        Duration::from_secs(5),
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    client
        .post(server.url("/s"))
        .header("content-type", "application/json")
        .body(r#"{"i":2}"#)
        .send()
        .await
        .unwrap();
    client
        .post(server.url("/s"))
        .header("stream-closed", "true")
        .send()
        .await
        .unwrap();

    let frames = reader.await.unwrap();
    let data: Vec<&Frame> = frames.iter().filter(|f| f.event == "data").collect();
    assert_eq!(data.len(), 3);
    assert_eq!(data[0].data, r#"{"i":0}"#);
    assert_eq!(data[1].data, r#"{"i":1}"#);
    assert_eq!(data[2].data, r#"{"i":2}"#);

    let first_control = frames.iter().find(|f| f.event == "control").unwrap();
    let control: serde_json::Value = serde_json::from_str(&first_control.data).unwrap();
    assert!(control["streamNextOffset"].is_string());
    assert!(control["streamCursor"].is_string());
    assert_eq!(control["upToDate"], true);

    assert!(has_closed_control(&frames));
}

#[tokio::test]
async fn already_closed_stream_ends_after_catch_up() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    client
        .put(server.url("/done"))
        .header("content-type", "application/json")
        .body(r#"{"i":0}"#)
        .send()
        .await
        .unwrap();
    client
        .post(server.url("/done"))
        .header("stream-closed", "true")
        .send()
        .await
        .unwrap();

    let frames = collect_frames(
        server.url("/done?offset=-1&live=sse"),
        has_closed_control,
        Duration::from_secs(3),
    )
    .await;

    assert_eq!(frames.iter().filter(|f| f.event == "data").count(), 1);
    assert!(has_closed_control(&frames));
}

#[tokio::test]
async fn binary_streams_are_base64_encoded() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    client
        .put(server.url("/bin"))
        .header("content-type", "application/octet-stream")
        .send()
        .await
        .unwrap();
    client
        .post(server.url("/bin"))
        .header("content-type", "application/octet-stream")
        .body(vec![0u8, 159, 146, 150])
        .send()
        .await
        .unwrap();
    client
        .post(server.url("/bin"))
        .header("stream-closed", "true")
        .send()
        .await
        .unwrap();

    // Check the encoding header on the response itself.
    let resp = reqwest::get(server.url("/bin?offset=-1&live=sse")).await.unwrap();
    assert_eq!(resp.headers()["stream-sse-data-encoding"], "base64");
    drop(resp);

    let frames = collect_frames(
        server.url("/bin?offset=-1&live=sse"),
        has_closed_control,
        Duration::from_secs(3),
    )
    .await;
    let data = frames.iter().find(|f| f.event == "data").unwrap();
    assert_eq!(data.data, "AJ+Slg==");
}

#[tokio::test]
async fn injected_sse_event_frame_appears_in_the_stream() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    client
        .put(server.url("/faulty"))
        .header("content-type", "application/json")
        .body(r#"{"i":0}"#)
        .send()
        .await
        .unwrap();
    client
        .post(server.url("/_test/inject-error"))
        .json(&serde_json::json!({
            "path": "/faulty",
            "sse_event": { "event": "glitch", "data": "injected" }
        }))
        .send()
        .await
        .unwrap();
    client
        .post(server.url("/faulty"))
        .header("stream-closed", "true")
        .send()
        .await
        .unwrap();

    let frames = collect_frames(
        server.url("/faulty?offset=-1&live=sse"),
        has_closed_control,
        Duration::from_secs(3),
    )
    .await;
    let injected = frames.iter().find(|f| f.event == "glitch").unwrap();
    assert_eq!(injected.data, "injected");
}

#[tokio::test]
async fn sse_on_unknown_stream_is_a_404() {
    let server = TestServer::start().await;
    let resp = reqwest::get(server.url("/ghost?live=sse")).await.unwrap();
    assert_eq!(resp.status(), 404);
}
