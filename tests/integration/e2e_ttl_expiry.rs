//! End-to-end: a zero-TTL stream expires on first access and is deleted.

use rill_test_utils::TestServer;

#[tokio::test]
async fn ttl_zero_stream_is_gone_on_read() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let created = client
        .put(server.url("/x"))
        .header("content-type", "application/json")
        .header("stream-ttl", "0")
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);

    // Appending also sees the expired stream as absent.
    let append = client
        .post(server.url("/x"))
        .header("content-type", "application/json")
        .body(r#"{"n":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(append.status(), 404);

    let read = reqwest::get(server.url("/x")).await.unwrap();
    assert_eq!(read.status(), 404);

    // The store's internal state shows the path absent.
    assert!(!server.store.has_stream("/x").await.unwrap());
}

#[tokio::test]
async fn absolute_expiry_in_the_past_behaves_the_same() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    client
        .put(server.url("/old"))
        .header("content-type", "application/json")
        .header("stream-expires-at", "2020-01-01T00:00:00Z")
        .send()
        .await
        .unwrap();

    let read = reqwest::get(server.url("/old")).await.unwrap();
    assert_eq!(read.status(), 404);
}

#[tokio::test]
async fn future_ttl_keeps_the_stream_alive() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    client
        .put(server.url("/fresh"))
        .header("content-type", "application/json")
        .header("stream-ttl", "3600")
        .send()
        .await
        .unwrap();

    let read = reqwest::get(server.url("/fresh")).await.unwrap();
    assert_eq!(read.status(), 200);
}
