//! End-to-end: a blocked long-poll resolves when a second request appends.

use rill_test_utils::TestServer;
use std::time::Duration;

#[tokio::test]
async fn long_poll_resolves_with_the_appended_body() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let created = client
        .put(server.url("/s"))
        .header("content-type", "text/plain")
        .send()
        .await
        .unwrap();
    let tail = created.headers()["stream-next-offset"]
        .to_str()
        .unwrap()
        .to_owned();

    let poll_url = server.url(&format!("/s?offset={tail}&live=long-poll"));
    let poll = tokio::spawn(async move { reqwest::get(poll_url).await.unwrap() });

    tokio::time::sleep(Duration::from_millis(150)).await;
    client
        .post(server.url("/s"))
        .header("content-type", "text/plain")
        .body("hi")
        .send()
        .await
        .unwrap();

    let resp = tokio::time::timeout(Duration::from_secs(2), poll)
        .await
        .expect("long-poll must resolve within the timeout")
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hi");
}
