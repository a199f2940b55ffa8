//! End-to-end: producer idempotency over the wire.

use rill_test_utils::TestServer;

#[tokio::test]
async fn accept_replay_and_gap() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    client
        .put(server.url("/orders"))
        .header("content-type", "application/json")
        .send()
        .await
        .unwrap();

    let send = |seq: u64| {
        client
            .post(server.url("/orders"))
            .header("content-type", "application/json")
            .header("producer-id", "p1")
            .header("producer-epoch", "0")
            .header("producer-seq", seq.to_string())
            .body(r#"{"order":1}"#)
            .send()
    };

    // First append: accepted with echoed fence.
    let accepted = send(0).await.unwrap();
    assert_eq!(accepted.status(), 200);
    assert_eq!(accepted.headers()["producer-seq"], "0");

    // Replay: duplicate, no new message.
    let replay = send(0).await.unwrap();
    assert_eq!(replay.status(), 204);
    assert_eq!(replay.headers()["producer-seq"], "0");
    assert_eq!(server.store.message_count("/orders").await.unwrap(), 1);

    // Seq 2 without 1: sequence gap.
    let gap = send(2).await.unwrap();
    assert_eq!(gap.status(), 409);
    assert_eq!(gap.headers()["producer-expected-seq"], "1");
    assert_eq!(gap.headers()["producer-received-seq"], "2");
    assert_eq!(server.store.message_count("/orders").await.unwrap(), 1);
}
