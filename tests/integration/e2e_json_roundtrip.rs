//! End-to-end: JSON array append and read round-trip.

use rill_test_utils::TestServer;

#[tokio::test]
async fn three_appends_read_back_as_one_array() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    client
        .put(server.url("/bulk"))
        .header("content-type", "application/json")
        .send()
        .await
        .unwrap();

    let mut last_offset = String::new();
    for i in 0..3 {
        let resp = client
            .post(server.url("/bulk"))
            .header("content-type", "application/json")
            .body(format!(r#"{{"i":{i}}}"#))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
        last_offset = resp.headers()["stream-next-offset"]
            .to_str()
            .unwrap()
            .to_owned();
    }

    let read = reqwest::get(server.url("/bulk")).await.unwrap();
    assert_eq!(read.status(), 200);
    assert_eq!(
        read.headers()["stream-next-offset"].to_str().unwrap(),
        last_offset,
        "next offset equals the third message's offset"
    );
    assert_eq!(read.text().await.unwrap(), r#"[{"i":0},{"i":1},{"i":2}]"#);
}

#[tokio::test]
async fn array_bodies_fan_out_to_individual_messages() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    client
        .put(server.url("/fan"))
        .header("content-type", "application/json")
        .send()
        .await
        .unwrap();
    client
        .post(server.url("/fan"))
        .header("content-type", "application/json")
        .body(r#"[{"a":1},{"b":2},{"c":3}]"#)
        .send()
        .await
        .unwrap();

    // Each element landed as its own message: seeking past the first two
    // returns only the third.
    let all = reqwest::get(server.url("/fan")).await.unwrap();
    let parsed: serde_json::Value = all.json().await.unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 3);

    assert_eq!(server.store.message_count("/fan").await.unwrap(), 3);
}
