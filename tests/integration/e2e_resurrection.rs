//! End-to-end: delete + re-create isolates incarnations.

use rill_test_utils::TestServer;

#[tokio::test]
async fn resurrected_stream_sees_only_new_data() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    client
        .put(server.url("/r"))
        .header("content-type", "application/json")
        .send()
        .await
        .unwrap();
    let old_append = client
        .post(server.url("/r"))
        .header("content-type", "application/json")
        .body(r#"{"old":1}"#)
        .send()
        .await
        .unwrap();
    let old_offset = old_append.headers()["stream-next-offset"]
        .to_str()
        .unwrap()
        .to_owned();
    let old_file_id = server
        .store
        .get_stream("/r")
        .await
        .unwrap()
        .unwrap()
        .log_file_id;

    client.delete(server.url("/r")).send().await.unwrap();

    let recreated = client
        .put(server.url("/r"))
        .header("content-type", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(recreated.status(), 201);

    // Empty before any new append.
    let empty = reqwest::get(server.url("/r")).await.unwrap();
    assert_eq!(empty.text().await.unwrap(), "[]");

    let new_append = client
        .post(server.url("/r"))
        .header("content-type", "application/json")
        .body(r#"{"new":1}"#)
        .send()
        .await
        .unwrap();
    let new_offset = new_append.headers()["stream-next-offset"]
        .to_str()
        .unwrap()
        .to_owned();
    assert!(
        new_offset > old_offset,
        "new offsets sort above every pre-deletion offset"
    );

    let read = reqwest::get(server.url("/r")).await.unwrap();
    assert_eq!(read.text().await.unwrap(), r#"[{"new":1}]"#);

    let new_file_id = server
        .store
        .get_stream("/r")
        .await
        .unwrap()
        .unwrap()
        .log_file_id;
    assert_ne!(new_file_id, old_file_id, "each incarnation gets its own log file");

    // A reader holding a pre-deletion offset gets only new records.
    let from_old = reqwest::get(server.url(&format!("/r?offset={old_offset}")))
        .await
        .unwrap();
    assert_eq!(from_old.text().await.unwrap(), r#"[{"new":1}]"#);
}
