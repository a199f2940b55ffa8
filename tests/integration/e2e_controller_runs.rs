//! End-to-end: message routing through the run controller with a scripted
//! agent, over a real on-disk event store.

use rill_protocol::EventType;
use rill_server::agent::controller::{ControllerConfig, Routed, RunController};
use rill_server::agent::Agent;
use rill_server::events::realtime::RealtimeStore;
use rill_server::events::{EventQuery, NewEvent};
use rill_test_utils::MockAgent;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn prompt_follow_up_and_history() {
    let data_dir = tempfile::tempdir().unwrap();
    let events = Arc::new(RealtimeStore::open(data_dir.path()).unwrap());
    let agent = Arc::new(MockAgent::new());
    let controller = RunController::new(events.clone(), agent.clone(), ControllerConfig::default());

    events.create_session(Some("s1")).await.unwrap();
    events
        .append(NewEvent {
            session_id: "s1".to_owned(),
            event_type: EventType::UserMessage,
            payload: json!({ "text": "first" }),
            run_id: None,
            dedupe_key: None,
        })
        .await
        .unwrap();

    agent.hold();
    let first = controller.handle_message("s1", "first").await.unwrap();
    assert_eq!(first.routed, Routed::Prompt);
    assert!(!first.run_id.is_empty());

    // Wait for the run to start streaming, then route a second message.
    for _ in 0..100 {
        if agent.is_streaming() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(agent.is_streaming());

    events
        .append(NewEvent {
            session_id: "s1".to_owned(),
            event_type: EventType::UserMessage,
            payload: json!({ "text": "second" }),
            run_id: None,
            dedupe_key: None,
        })
        .await
        .unwrap();
    let second = controller.handle_message("s1", "second").await.unwrap();
    assert_eq!(second.routed, Routed::FollowUp);

    agent.release();

    // One run closes, covering both messages.
    let mut closes = Vec::new();
    for _ in 0..300 {
        closes = events
            .query(&EventQuery {
                session_id: "s1".to_owned(),
                types: Some(vec![EventType::RunClosed]),
                ..EventQuery::default()
            })
            .await
            .unwrap();
        if !closes.is_empty() && !agent.is_streaming() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(closes.len(), 1, "exactly one run_closed event");

    let history = events.get_conversation_history("s1").await.unwrap();
    let users: Vec<&str> = history
        .iter()
        .filter(|m| m.role == "user")
        .map(|m| m.text.as_str())
        .collect();
    assert_eq!(users, vec!["first", "second"]);

    assert!(events
        .is_run_closed("s1", &first.run_id)
        .await
        .unwrap());
}
