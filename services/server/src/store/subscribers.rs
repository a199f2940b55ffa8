//! One-shot stream subscriptions.
//!
//! A subscription is `(path, from_offset, channel)`. The delivery contract:
//! fire exactly once with `Messages`, `Closed`, or `Deleted`, then detach.
//! The oneshot channel is that contract made structural — the sender is
//! consumed by the send.
//!
//! Callbacks fire after the corresponding engine transaction has committed;
//! the durable store calls into this table only once its own engine call
//! has returned.

use crate::engine::StoredMessage;
use rill_protocol::StreamOffset;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::oneshot;

/// What a subscriber is told, exactly once.
#[derive(Debug)]
pub enum StreamNotice {
    /// A nonempty batch whose offsets all exceed the subscription's
    /// `from_offset`.
    Messages(Vec<StoredMessage>),
    Closed,
    Deleted,
}

/// Handle for removing a subscription that has not fired yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    path: String,
    id: u64,
}

struct Subscription {
    id: u64,
    from: StreamOffset,
    tx: oneshot::Sender<StreamNotice>,
}

#[derive(Default)]
pub struct SubscriberTable {
    inner: StdMutex<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a subscription waiting for messages past `from`.
    pub fn insert(
        &self,
        path: &str,
        from: StreamOffset,
        tx: oneshot::Sender<StreamNotice>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(path.to_owned())
            .or_default()
            .push(Subscription { id, from, tx });
        SubscriptionHandle {
            path: path.to_owned(),
            id,
        }
    }

    /// Remove a subscription if it is still registered. Returns true when
    /// an entry was removed.
    pub fn remove(&self, handle: &SubscriptionHandle) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subs) = map.get_mut(&handle.path) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != handle.id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            map.remove(&handle.path);
        }
        removed
    }

    /// Detach every subscription whose `from` lies strictly below `tail`.
    /// Returns the detached `(from, sender)` pairs so the caller can build
    /// each subscriber's batch.
    pub fn take_due(
        &self,
        path: &str,
        tail: StreamOffset,
    ) -> Vec<(StreamOffset, oneshot::Sender<StreamNotice>)> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subs) = map.get_mut(path) else {
            return Vec::new();
        };
        let mut due = Vec::new();
        let mut remaining = Vec::new();
        for sub in subs.drain(..) {
            if sub.from < tail {
                due.push((sub.from, sub.tx));
            } else {
                remaining.push(sub);
            }
        }
        if remaining.is_empty() {
            map.remove(path);
        } else {
            *subs = remaining;
        }
        due
    }

    /// Detach every subscription for `path` (close / delete fan-out).
    pub fn take_all(&self, path: &str) -> Vec<oneshot::Sender<StreamNotice>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(path)
            .map(|subs| subs.into_iter().map(|s| s.tx).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn len(&self, path: &str) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(path).map_or(0, Vec::len)
    }
}
