//! Realtime overlay: in-process pub/sub atop the event store.
//!
//! Publishes every persisted event to per-session subscribers after the
//! store transaction commits, caches closed-run identifiers, and tracks the
//! optional single "current" session. Subscriber lifetimes are owned by the
//! caller (explicit unsubscribe).

use crate::error::StoreResult;
use crate::events::{
    ChatMessage, EventQuery, EventRow, EventStore, NewEvent, SessionRow,
};
use rill_protocol::EventType;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Bound on the closed-run cache; the set is cleared on overflow rather
/// than evicted piecemeal.
const CLOSED_RUN_CACHE_CAP: usize = 10_000;

pub struct RealtimeStore {
    store: tokio::sync::Mutex<EventStore>,
    listeners: StdMutex<HashMap<String, HashMap<u64, mpsc::UnboundedSender<EventRow>>>>,
    rotation_listeners: StdMutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    closed_runs: StdMutex<HashSet<(String, String)>>,
    current_session: StdMutex<Option<String>>,
    next_subscriber_id: AtomicU64,
}

/// Identifies one subscription for unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

impl RealtimeStore {
    pub fn new(store: EventStore) -> Self {
        RealtimeStore {
            store: tokio::sync::Mutex::new(store),
            listeners: StdMutex::new(HashMap::new()),
            rotation_listeners: StdMutex::new(HashMap::new()),
            closed_runs: StdMutex::new(HashSet::new()),
            current_session: StdMutex::new(None),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    pub fn open(data_dir: &std::path::Path) -> StoreResult<Self> {
        Ok(Self::new(EventStore::open(data_dir)?))
    }

    // -----------------------------------------------------------------------
    // Store passthrough with publish
    // -----------------------------------------------------------------------

    pub async fn create_session(&self, id: Option<&str>) -> StoreResult<SessionRow> {
        self.store.lock().await.create_session(id)
    }

    pub async fn get_session(&self, id: &str) -> StoreResult<Option<SessionRow>> {
        self.store.lock().await.get_session(id)
    }

    /// Persist one event, then publish it to the session's subscribers.
    pub async fn append(&self, event: NewEvent) -> StoreResult<EventRow> {
        let row = self.store.lock().await.append(event)?;

        if row.event_type == EventType::RunClosed {
            if let Some(run_id) = &row.run_id {
                self.remember_closed_run(&row.session_id, run_id);
            }
        }
        self.publish(&row);
        Ok(row)
    }

    pub async fn query(&self, query: &EventQuery) -> StoreResult<Vec<EventRow>> {
        self.store.lock().await.query(query)
    }

    pub async fn get_conversation_history(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        self.store.lock().await.get_conversation_history(session_id)
    }

    pub async fn find_stale_runs(&self, max_age: Duration) -> StoreResult<Vec<(String, String)>> {
        self.store.lock().await.find_stale_runs(max_age)
    }

    /// Startup recovery: close stale runs and reflect them in the
    /// closed-run cache.
    pub async fn recover_stale_runs(&self, max_age: Duration) -> StoreResult<usize> {
        let stale = self.store.lock().await.find_stale_runs(max_age)?;
        for (session_id, run_id) in &stale {
            self.append(NewEvent {
                session_id: session_id.clone(),
                event_type: EventType::RunClosed,
                payload: serde_json::json!({ "reason": super::RECOVERED_AFTER_CRASH }),
                run_id: Some(run_id.clone()),
                dedupe_key: None,
            })
            .await?;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "recovered stale runs");
        }
        Ok(stale.len())
    }

    pub async fn claim_bootstrap(&self, agent_id: &str) -> StoreResult<bool> {
        self.store.lock().await.claim_bootstrap(agent_id)
    }

    /// Delete a session, its listener map, and its closed-run cache slice.
    pub async fn delete_session(&self, id: &str) -> StoreResult<bool> {
        let deleted = self.store.lock().await.delete_session(id)?;
        if deleted {
            self.listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
            self.closed_runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(session, _)| session != id);
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Pub/sub
    // -----------------------------------------------------------------------

    /// Subscribe to every event persisted for `session_id`. The receiver
    /// stays live until `unsubscribe`.
    pub fn subscribe(&self, session_id: &str) -> (SubscriberId, mpsc::UnboundedReceiver<EventRow>) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_owned())
            .or_default()
            .insert(id, tx);
        (SubscriberId(id), rx)
    }

    pub fn unsubscribe(&self, session_id: &str, id: SubscriberId) {
        let mut map = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = map.get_mut(session_id) {
            subs.remove(&id.0);
            if subs.is_empty() {
                map.remove(session_id);
            }
        }
    }

    fn publish(&self, row: &EventRow) {
        let mut map = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = map.get_mut(&row.session_id) {
            subs.retain(|_, tx| tx.send(row.clone()).is_ok());
            if subs.is_empty() {
                map.remove(&row.session_id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Closed-run cache
    // -----------------------------------------------------------------------

    fn remember_closed_run(&self, session_id: &str, run_id: &str) {
        let mut cache = self.closed_runs.lock().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= CLOSED_RUN_CACHE_CAP {
            cache.clear();
        }
        cache.insert((session_id.to_owned(), run_id.to_owned()));
    }

    /// Cache-first closed-run check; a database hit back-fills the cache.
    pub async fn is_run_closed(&self, session_id: &str, run_id: &str) -> StoreResult<bool> {
        {
            let cache = self.closed_runs.lock().unwrap_or_else(|e| e.into_inner());
            if cache.contains(&(session_id.to_owned(), run_id.to_owned())) {
                return Ok(true);
            }
        }
        let closed = self.store.lock().await.is_run_closed(session_id, run_id)?;
        if closed {
            self.remember_closed_run(session_id, run_id);
        }
        Ok(closed)
    }

    // -----------------------------------------------------------------------
    // Session rotation
    // -----------------------------------------------------------------------

    pub fn current_session(&self) -> Option<String> {
        self.current_session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make `session_id` the current session and notify rotation
    /// subscribers.
    pub fn rotate_session(&self, session_id: &str) {
        *self
            .current_session
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(session_id.to_owned());
        let mut subs = self
            .rotation_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.retain(|_, tx| tx.send(session_id.to_owned()).is_ok());
    }

    pub fn subscribe_rotation(&self) -> (SubscriberId, mpsc::UnboundedReceiver<String>) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.rotation_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        (SubscriberId(id), rx)
    }

    pub fn unsubscribe_rotation(&self, id: SubscriberId) {
        self.rotation_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn realtime() -> RealtimeStore {
        RealtimeStore::new(EventStore::open_in_memory().unwrap())
    }

    fn user_message(session_id: &str, text: &str) -> NewEvent {
        NewEvent {
            session_id: session_id.to_owned(),
            event_type: EventType::UserMessage,
            payload: json!({ "text": text }),
            run_id: None,
            dedupe_key: None,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_one_notification_per_event() {
        let realtime = realtime();
        realtime.create_session(Some("s1")).await.unwrap();
        let (id, mut rx) = realtime.subscribe("s1");

        realtime.append(user_message("s1", "one")).await.unwrap();
        realtime.append(user_message("s1", "two")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload["text"], "one");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload["text"], "two");
        assert!(rx.try_recv().is_err(), "exactly one notification per event");

        realtime.unsubscribe("s1", id);
        realtime.append(user_message("s1", "three")).await.unwrap();
        assert!(rx.try_recv().is_err(), "unsubscribed receivers stay silent");
    }

    #[tokio::test]
    async fn events_for_other_sessions_are_not_delivered() {
        let realtime = realtime();
        realtime.create_session(Some("s1")).await.unwrap();
        realtime.create_session(Some("s2")).await.unwrap();
        let (_id, mut rx) = realtime.subscribe("s1");

        realtime.append(user_message("s2", "other")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_closed_appends_populate_the_cache() {
        let realtime = realtime();
        realtime.create_session(Some("s1")).await.unwrap();
        realtime
            .append(NewEvent {
                session_id: "s1".to_owned(),
                event_type: EventType::RunClosed,
                payload: json!({ "reason": "completed" }),
                run_id: Some("r1".to_owned()),
                dedupe_key: None,
            })
            .await
            .unwrap();

        assert!(realtime.is_run_closed("s1", "r1").await.unwrap());
        assert!(!realtime.is_run_closed("s1", "r2").await.unwrap());
    }

    #[tokio::test]
    async fn is_run_closed_falls_back_to_the_database() {
        let realtime = realtime();
        realtime.create_session(Some("s1")).await.unwrap();
        // Write directly through the store so the cache never sees it.
        realtime
            .store
            .lock()
            .await
            .append(NewEvent {
                session_id: "s1".to_owned(),
                event_type: EventType::RunClosed,
                payload: json!({ "reason": "completed" }),
                run_id: Some("r1".to_owned()),
                dedupe_key: None,
            })
            .unwrap();

        assert!(realtime.is_run_closed("s1", "r1").await.unwrap());
        // Second call hits the back-filled cache.
        assert!(realtime.is_run_closed("s1", "r1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_session_clears_listeners_and_cache() {
        let realtime = realtime();
        realtime.create_session(Some("s1")).await.unwrap();
        realtime
            .append(NewEvent {
                session_id: "s1".to_owned(),
                event_type: EventType::RunClosed,
                payload: json!({ "reason": "completed" }),
                run_id: Some("r1".to_owned()),
                dedupe_key: None,
            })
            .await
            .unwrap();
        let (_id, mut rx) = realtime.subscribe("s1");

        assert!(realtime.delete_session("s1").await.unwrap());
        assert!(rx.recv().await.is_none(), "listener map dropped the sender");

        // The DB row is gone too, so the cache must not resurrect it.
        assert!(!realtime.is_run_closed("s1", "r1").await.unwrap());
    }

    #[tokio::test]
    async fn rotation_notifies_subscribers() {
        let realtime = realtime();
        let (id, mut rx) = realtime.subscribe_rotation();
        realtime.rotate_session("s-new");

        assert_eq!(realtime.current_session().as_deref(), Some("s-new"));
        assert_eq!(rx.recv().await.unwrap(), "s-new");

        realtime.unsubscribe_rotation(id);
        realtime.rotate_session("s-next");
        assert!(rx.try_recv().is_err());
    }
}
