//! The durable stream store: protocol semantics over the stream engine.
//!
//! Adds what the engine does not know about: content-type reconciliation on
//! create, JSON array framing, TTL / absolute expiry, producer idempotency
//! fencing, and one-shot subscriber fan-out with close/delete events.
//!
//! The engine lives behind a single async mutex; every operation below
//! takes it once, and subscriber fan-out happens before the guard is
//! released, strictly after the engine transaction committed.

pub mod json;
pub mod producer;
pub mod subscribers;

use crate::engine::{CreateResult, CreateStreamOpts, StoredMessage, StreamEngine};
use crate::error::{StoreError, StoreResult};
use crate::storage::index::StreamRow;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use producer::{validate_fence, FenceCheck, KeyedLocks};
use rill_protocol::{ProducerFence, ProducerOutcome, ReadPosition, StreamOffset};
use subscribers::{StreamNotice, SubscriberTable, SubscriptionHandle};
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Stream configuration carried by a create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCreateConfig {
    pub content_type: String,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed: bool,
}

impl Default for StreamCreateConfig {
    fn default() -> Self {
        StreamCreateConfig {
            content_type: "application/octet-stream".to_owned(),
            ttl_seconds: None,
            expires_at: None,
            closed: false,
        }
    }
}

/// Result of a create: new stream, or an idempotent hit on an identically
/// configured existing one.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(StreamRow),
    Reused(StreamRow),
}

impl CreateOutcome {
    pub fn row(&self) -> &StreamRow {
        match self {
            CreateOutcome::Created(row) | CreateOutcome::Reused(row) => row,
        }
    }
}

/// A slice of a stream plus the metadata the protocol layer needs.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub messages: Vec<StoredMessage>,
    pub next_offset: StreamOffset,
    pub closed: bool,
    pub content_type: String,
}

/// Result of an append (or close-on-append).
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// None when the append was a producer duplicate (nothing written).
    pub receipt_offset: Option<StreamOffset>,
    pub next_offset: StreamOffset,
    pub producer: Option<ProducerOutcome>,
}

/// Result of installing a subscription.
pub enum Subscribed {
    /// Unread messages (or a terminal state) already existed; no
    /// subscription was installed.
    Immediate(StreamNotice),
    /// Installed; the receiver fires exactly once.
    Waiting(oneshot::Receiver<StreamNotice>, SubscriptionHandle),
}

// ---------------------------------------------------------------------------
// DurableStore
// ---------------------------------------------------------------------------

pub struct DurableStore {
    engine: Mutex<StreamEngine>,
    subscribers: SubscriberTable,
    producer_locks: KeyedLocks,
}

impl DurableStore {
    pub fn open(data_dir: &std::path::Path) -> StoreResult<Self> {
        Ok(Self::new(StreamEngine::open(data_dir)?))
    }

    pub fn new(engine: StreamEngine) -> Self {
        DurableStore {
            engine: Mutex::new(engine),
            subscribers: SubscriberTable::new(),
            producer_locks: KeyedLocks::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Setup passthrough
    // -----------------------------------------------------------------------

    pub async fn register_schema(
        &self,
        key: &str,
        document: &serde_json::Value,
        version: u64,
    ) -> StoreResult<()> {
        self.engine.lock().await.register_schema(key, document, version)
    }

    pub async fn register_router(
        &self,
        router: crate::engine::router::StreamRouter,
    ) -> StoreResult<()> {
        self.engine.lock().await.register_router(router)
    }

    // -----------------------------------------------------------------------
    // Stream lifecycle
    // -----------------------------------------------------------------------

    /// Create a stream. A second create against a live stream returns the
    /// existing row when the configuration matches exactly and fails with
    /// `AlreadyExists` otherwise. `initial_body`, when present, seeds the
    /// new stream; it is ignored on an idempotent re-create.
    pub async fn create_stream(
        &self,
        path: &str,
        config: StreamCreateConfig,
        initial_body: Option<&[u8]>,
    ) -> StoreResult<CreateOutcome> {
        let mut engine = self.engine.lock().await;
        self.expire_if_due(&mut engine, path)?;

        let opts = CreateStreamOpts {
            content_type: config.content_type.clone(),
            ttl_seconds: config.ttl_seconds,
            expires_at: config.expires_at,
            closed: config.closed,
            schema_key: None,
        };
        let outcome = match engine.create_stream(path, opts)? {
            CreateResult::Existing(row) => {
                if !config_matches(&row, &config) {
                    return Err(StoreError::AlreadyExists(path.to_owned()));
                }
                return Ok(CreateOutcome::Reused(row));
            }
            CreateResult::Created(row) => row,
        };

        if let Some(body) = initial_body {
            if !body.is_empty() {
                let frames = self.frame_body(&outcome.content_type, body, true)?;
                for frame in &frames {
                    engine.append(path, frame)?;
                }
            }
        }
        let row = engine
            .get_stream(path)?
            .ok_or_else(|| StoreError::StreamNotFound(path.to_owned()))?;
        Ok(CreateOutcome::Created(row))
    }

    /// Fetch a live stream, enforcing expiry: an expired stream is deleted
    /// on access and reported absent.
    pub async fn get_stream(&self, path: &str) -> StoreResult<Option<StreamRow>> {
        let mut engine = self.engine.lock().await;
        self.expire_if_due(&mut engine, path)?;
        engine.get_stream(path)
    }

    pub async fn has_stream(&self, path: &str) -> StoreResult<bool> {
        Ok(self.get_stream(path).await?.is_some())
    }

    pub async fn list_streams(&self) -> StoreResult<Vec<(StreamRow, u64)>> {
        let engine = self.engine.lock().await;
        let rows = engine.list_streams()?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let count = engine.message_count(&row.path)?;
            out.push((row, count));
        }
        Ok(out)
    }

    /// Soft-delete a stream and fan a `deleted` event out to its waiting
    /// subscribers. Returns false when the stream does not exist.
    pub async fn delete_stream(&self, path: &str) -> StoreResult<bool> {
        let mut engine = self.engine.lock().await;
        let deleted = engine.delete_stream(path)?;
        if deleted {
            for tx in self.subscribers.take_all(path) {
                tx.send(StreamNotice::Deleted).ok();
            }
        }
        Ok(deleted)
    }

    /// Close a stream, optionally with producer credentials.
    ///
    /// Closing an already-closed stream with credentials identical to
    /// `closed_by` reports a synthetic duplicate so network-failure retries
    /// are safe; any other fence against a closed stream is rejected.
    pub async fn close_stream(
        &self,
        path: &str,
        fence: Option<&ProducerFence>,
    ) -> StoreResult<AppendOutcome> {
        let _guard = self.lock_producer(path, fence).await;
        let mut engine = self.engine.lock().await;
        self.expire_if_due(&mut engine, path)?;
        let stream = engine
            .get_stream(path)?
            .ok_or_else(|| StoreError::StreamNotFound(path.to_owned()))?;

        if stream.closed {
            return match fence {
                Some(f) if stream.closed_by.as_ref() == Some(f) => Ok(AppendOutcome {
                    receipt_offset: None,
                    next_offset: stream.offset(),
                    producer: Some(ProducerOutcome::Duplicate {
                        epoch: f.epoch,
                        seq: f.seq,
                    }),
                }),
                _ => Err(StoreError::StreamClosed {
                    current_offset: stream.offset(),
                }),
            };
        }

        let producer = match fence {
            Some(f) => {
                let state = engine.get_producer(path, &f.producer_id)?;
                match validate_fence(state.as_ref(), f)? {
                    FenceCheck::Accepted => {
                        engine.commit_producer(path, &f.producer_id, f.epoch, f.seq)?;
                        Some(ProducerOutcome::Accepted {
                            epoch: f.epoch,
                            seq: f.seq,
                        })
                    }
                    FenceCheck::Duplicate { epoch, last_seq } => Some(ProducerOutcome::Duplicate {
                        epoch,
                        seq: last_seq,
                    }),
                }
            }
            None => None,
        };

        engine.close_stream(path, fence)?;
        info!(path, "stream closed");
        for tx in self.subscribers.take_all(path) {
            tx.send(StreamNotice::Closed).ok();
        }
        Ok(AppendOutcome {
            receipt_offset: None,
            next_offset: stream.offset(),
            producer,
        })
    }

    // -----------------------------------------------------------------------
    // Append
    // -----------------------------------------------------------------------

    /// Append `body` to a stream, enforcing the producer fence when one is
    /// given and optionally closing the stream afterwards.
    pub async fn append(
        &self,
        path: &str,
        body: &[u8],
        fence: Option<&ProducerFence>,
        close_after: bool,
    ) -> StoreResult<AppendOutcome> {
        let _guard = self.lock_producer(path, fence).await;
        let mut engine = self.engine.lock().await;
        self.expire_if_due(&mut engine, path)?;
        let stream = engine
            .get_stream(path)?
            .ok_or_else(|| StoreError::StreamNotFound(path.to_owned()))?;

        if stream.closed {
            // Identical credentials to the closing fence: the retry of a
            // close-on-append that already succeeded.
            if let Some(f) = fence {
                if stream.closed_by.as_ref() == Some(f) {
                    return Ok(AppendOutcome {
                        receipt_offset: None,
                        next_offset: stream.offset(),
                        producer: Some(ProducerOutcome::Duplicate {
                            epoch: f.epoch,
                            seq: f.seq,
                        }),
                    });
                }
            }
            return Err(StoreError::StreamClosed {
                current_offset: stream.offset(),
            });
        }

        // Validate the fence before touching anything; commit only after
        // the append itself succeeded.
        let check = match fence {
            Some(f) => {
                let state = engine.get_producer(path, &f.producer_id)?;
                Some(validate_fence(state.as_ref(), f)?)
            }
            None => None,
        };
        if let Some(FenceCheck::Duplicate { epoch, last_seq }) = check {
            return Ok(AppendOutcome {
                receipt_offset: None,
                next_offset: stream.offset(),
                producer: Some(ProducerOutcome::Duplicate {
                    epoch,
                    seq: last_seq,
                }),
            });
        }

        let frames = self.frame_body(&stream.content_type, body, false)?;
        let mut last_offset = None;
        for frame in &frames {
            let receipt = engine.append(path, frame)?;
            last_offset = Some(receipt.offset);
        }

        let producer = match (fence, check) {
            (Some(f), Some(FenceCheck::Accepted)) => {
                engine.commit_producer(path, &f.producer_id, f.epoch, f.seq)?;
                Some(ProducerOutcome::Accepted {
                    epoch: f.epoch,
                    seq: f.seq,
                })
            }
            _ => None,
        };

        if close_after {
            engine.close_stream(path, fence)?;
        }
        let next_offset = engine.current_offset(path)?;

        // Fan-out, post-commit: message batches first, then the close event
        // for whoever remains.
        if last_offset.is_some() {
            let due = self.subscribers.take_due(path, next_offset);
            for (from, tx) in due {
                let batch = engine.read(path, Some(from))?;
                if batch.is_empty() {
                    continue;
                }
                tx.send(StreamNotice::Messages(batch)).ok();
            }
        }
        if close_after {
            for tx in self.subscribers.take_all(path) {
                tx.send(StreamNotice::Closed).ok();
            }
        }

        Ok(AppendOutcome {
            receipt_offset: last_offset,
            next_offset,
            producer,
        })
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// Read the slice after `position`.
    pub async fn read(&self, path: &str, position: ReadPosition) -> StoreResult<ReadResult> {
        let mut engine = self.engine.lock().await;
        self.expire_if_due(&mut engine, path)?;
        let stream = engine
            .get_stream(path)?
            .ok_or_else(|| StoreError::StreamNotFound(path.to_owned()))?;

        let after = match position {
            ReadPosition::Beginning => None,
            ReadPosition::Tail => Some(stream.offset()),
            ReadPosition::After(offset) => Some(offset),
        };
        let messages = engine.read(path, after)?;
        let next_offset = messages
            .last()
            .map_or_else(|| stream.offset(), |m| m.offset);
        Ok(ReadResult {
            messages,
            next_offset,
            closed: stream.closed,
            content_type: stream.content_type,
        })
    }

    pub async fn current_offset(&self, path: &str) -> StoreResult<StreamOffset> {
        let mut engine = self.engine.lock().await;
        self.expire_if_due(&mut engine, path)?;
        engine.current_offset(path)
    }

    pub async fn message_count(&self, path: &str) -> StoreResult<u64> {
        self.engine.lock().await.message_count(path)
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribe for messages past `from`.
    ///
    /// When unread messages already exist the notice is returned
    /// immediately and nothing is installed; a closed stream at tail
    /// returns an immediate `Closed`. Otherwise the returned receiver fires
    /// exactly once on a future append, close, or delete.
    pub async fn subscribe(&self, path: &str, from: StreamOffset) -> StoreResult<Subscribed> {
        let mut engine = self.engine.lock().await;
        self.expire_if_due(&mut engine, path)?;
        let stream = engine
            .get_stream(path)?
            .ok_or_else(|| StoreError::StreamNotFound(path.to_owned()))?;

        let unread = engine.read(path, Some(from))?;
        if !unread.is_empty() {
            return Ok(Subscribed::Immediate(StreamNotice::Messages(unread)));
        }
        if stream.closed {
            return Ok(Subscribed::Immediate(StreamNotice::Closed));
        }
        let (tx, rx) = oneshot::channel();
        let handle = self.subscribers.insert(path, from, tx);
        Ok(Subscribed::Waiting(rx, handle))
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscribers.remove(handle)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Evict producer rows idle for longer than `max_age`.
    pub async fn evict_stale_producers(&self, max_age: std::time::Duration) -> StoreResult<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(max_age)
                .map_err(|e| StoreError::Internal(format!("bad eviction age: {e}")))?;
        let removed = self.engine.lock().await.evict_producers_before(cutoff)?;
        if removed > 0 {
            info!(removed, "evicted stale producer state");
        }
        Ok(removed)
    }

    /// Drop cached file handles (shutdown path).
    pub async fn close(&self) {
        self.engine.lock().await.close();
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn lock_producer(
        &self,
        path: &str,
        fence: Option<&ProducerFence>,
    ) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        match fence {
            Some(f) => Some(self.producer_locks.acquire(path, &f.producer_id).await),
            None => None,
        }
    }

    fn frame_body(
        &self,
        content_type: &str,
        body: &[u8],
        initial: bool,
    ) -> StoreResult<Vec<Vec<u8>>> {
        if json::is_json(content_type) {
            json::process_json_append(body, initial)
        } else {
            Ok(vec![body.to_vec()])
        }
    }

    /// Delete the stream if its TTL or absolute expiry has passed. Waiting
    /// subscribers get the `deleted` event.
    fn expire_if_due(&self, engine: &mut MutexGuard<'_, StreamEngine>, path: &str) -> StoreResult<()> {
        let Some(row) = engine.get_stream(path)? else {
            return Ok(());
        };
        if !is_expired(&row, Utc::now()) {
            return Ok(());
        }
        warn!(path, "stream expired; deleting");
        engine.delete_stream(path)?;
        for tx in self.subscribers.take_all(path) {
            tx.send(StreamNotice::Deleted).ok();
        }
        Ok(())
    }
}

fn config_matches(row: &StreamRow, config: &StreamCreateConfig) -> bool {
    row.content_type == config.content_type
        && row.ttl_seconds == config.ttl_seconds
        && row.expires_at == config.expires_at.map(|t| t.to_rfc3339())
        && row.closed == config.closed
}

fn is_expired(row: &StreamRow, now: DateTime<Utc>) -> bool {
    if let Some(ttl) = row.ttl_seconds {
        if let Ok(created) = DateTime::parse_from_rfc3339(&row.created_at) {
            if now >= created + ChronoDuration::seconds(ttl as i64) {
                return true;
            }
        }
    }
    if let Some(expires_at) = &row.expires_at {
        if let Ok(deadline) = DateTime::parse_from_rfc3339(expires_at) {
            if now >= deadline {
                return true;
            }
        }
    }
    false
}
