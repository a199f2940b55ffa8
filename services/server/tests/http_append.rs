//! Integration tests for POST: appends, producer fencing, close-on-append,
//! and the append-side error statuses.

use rill_test_utils::TestServer;

async fn create_json(server: &TestServer, path: &str) {
    reqwest::Client::new()
        .put(server.url(path))
        .header("content-type", "application/json")
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn plain_append_is_a_204_with_next_offset() {
    let server = TestServer::start().await;
    create_json(&server, "/s").await;

    let resp = reqwest::Client::new()
        .post(server.url("/s"))
        .header("content-type", "application/json")
        .body(r#"{"n":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(resp.headers().contains_key("stream-next-offset"));
    assert!(!resp.headers().contains_key("producer-epoch"));
}

#[tokio::test]
async fn producer_fence_walkthrough() {
    let server = TestServer::start().await;
    create_json(&server, "/fenced").await;
    let client = reqwest::Client::new();
    let post = |epoch: u64, seq: u64, body: &'static str| {
        client
            .post(server.url("/fenced"))
            .header("content-type", "application/json")
            .header("producer-id", "p1")
            .header("producer-epoch", epoch.to_string())
            .header("producer-seq", seq.to_string())
            .body(body)
            .send()
    };

    // First accepted append.
    let accepted = post(0, 0, r#"{"n":0}"#).await.unwrap();
    assert_eq!(accepted.status(), 200);
    assert_eq!(accepted.headers()["producer-epoch"], "0");
    assert_eq!(accepted.headers()["producer-seq"], "0");

    // Identical replay: duplicate, nothing written.
    let replay = post(0, 0, r#"{"n":0}"#).await.unwrap();
    assert_eq!(replay.status(), 204);
    assert_eq!(replay.headers()["producer-seq"], "0");

    // Gap: seq 2 without 1.
    let gap = post(0, 2, r#"{"n":2}"#).await.unwrap();
    assert_eq!(gap.status(), 409);
    assert_eq!(gap.headers()["producer-expected-seq"], "1");
    assert_eq!(gap.headers()["producer-received-seq"], "2");

    // Next in sequence.
    let next = post(0, 1, r#"{"n":1}"#).await.unwrap();
    assert_eq!(next.status(), 200);

    // Stale epoch after a bump.
    let bumped = post(1, 0, r#"{"n":0}"#).await.unwrap();
    assert_eq!(bumped.status(), 200);
    let stale = post(0, 2, r#"{"n":9}"#).await.unwrap();
    assert_eq!(stale.status(), 403);
    assert_eq!(stale.headers()["producer-epoch"], "1");

    // A new epoch must begin at zero.
    let bad_epoch_seq = post(2, 5, r#"{"n":9}"#).await.unwrap();
    assert_eq!(bad_epoch_seq.status(), 400);

    // Exactly the accepted messages made it to disk.
    let read = reqwest::get(server.url("/fenced")).await.unwrap();
    assert_eq!(
        read.text().await.unwrap(),
        r#"[{"n":0},{"n":1},{"n":0}]"#
    );
}

#[tokio::test]
async fn partial_producer_headers_are_rejected() {
    let server = TestServer::start().await;
    create_json(&server, "/s").await;

    let resp = reqwest::Client::new()
        .post(server.url("/s"))
        .header("content-type", "application/json")
        .header("producer-id", "p1")
        .body(r#"{"n":0}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn close_on_append_and_closed_stream_conflict() {
    let server = TestServer::start().await;
    create_json(&server, "/s").await;
    let client = reqwest::Client::new();

    let close = client
        .post(server.url("/s"))
        .header("content-type", "application/json")
        .header("stream-closed", "true")
        .body(r#"{"last":true}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(close.status(), 204);

    let rejected = client
        .post(server.url("/s"))
        .header("content-type", "application/json")
        .body(r#"{"n":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 409);
    assert!(rejected.headers().contains_key("stream-next-offset"));
}

#[tokio::test]
async fn close_retry_with_identical_fence_is_a_duplicate() {
    let server = TestServer::start().await;
    create_json(&server, "/s").await;
    let client = reqwest::Client::new();
    let close = || {
        client
            .post(server.url("/s"))
            .header("producer-id", "p1")
            .header("producer-epoch", "0")
            .header("producer-seq", "0")
            .header("stream-closed", "true")
            .send()
    };

    let first = close().await.unwrap();
    assert_eq!(first.status(), 200);

    let retry = close().await.unwrap();
    assert_eq!(retry.status(), 204);
    assert_eq!(retry.headers()["producer-seq"], "0");

    // A different producer cannot touch the closed stream.
    let other = client
        .post(server.url("/s"))
        .header("producer-id", "p2")
        .header("producer-epoch", "0")
        .header("producer-seq", "0")
        .header("content-type", "application/json")
        .body(r#"{"n":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), 409);
}

#[tokio::test]
async fn content_type_mismatch_is_a_409() {
    let server = TestServer::start().await;
    create_json(&server, "/s").await;

    let resp = reqwest::Client::new()
        .post(server.url("/s"))
        .header("content-type", "text/plain")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn invalid_json_and_empty_array_are_400s() {
    let server = TestServer::start().await;
    create_json(&server, "/s").await;
    let client = reqwest::Client::new();

    let invalid = client
        .post(server.url("/s"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);

    let empty_array = client
        .post(server.url("/s"))
        .header("content-type", "application/json")
        .body("[]")
        .send()
        .await
        .unwrap();
    assert_eq!(empty_array.status(), 400);

    let empty_body = client.post(server.url("/s")).send().await.unwrap();
    assert_eq!(empty_body.status(), 400);
}

#[tokio::test]
async fn append_to_unknown_stream_is_a_404() {
    let server = TestServer::start().await;
    let resp = reqwest::Client::new()
        .post(server.url("/ghost"))
        .header("content-type", "application/json")
        .body(r#"{"n":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
