//! Offline mutation queue.
//!
//! Mutations the app could not deliver are persisted under
//! `medalert:v1:syncQueue` and replayed in insertion order by [`flush_queue`].
//! Records that keep failing, or fail in a way retrying cannot fix, are moved
//! to `medalert:v1:syncDeadLetter` where the caller can inspect, requeue or
//! discard them.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{HttpError, KeyValueBackend, KvError};
use crate::config::QueueConfig;
use crate::model::MutationId;
use crate::store::PersistedStore;

pub const SYNC_QUEUE_KEY: &str = "syncQueue";
pub const DEAD_LETTER_KEY: &str = "syncDeadLetter";

const MAX_ERROR_LENGTH: usize = 512;
const ID_FRAGMENT_LENGTH: usize = 9;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    pub id: MutationId,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub created_at: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A mutation as the caller describes it, before it is stamped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMutation {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl NewMutation {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    fn stamp(self, now: u64) -> QueuedMutation {
        QueuedMutation {
            id: generate_id(now),
            kind: self.kind,
            payload: self.payload,
            created_at: now,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Millisecond timestamp followed by a random base-36 fragment. Unique
/// enough for one device's queue; not a security token.
fn generate_id(now: u64) -> MutationId {
    let mut rng = rand::thread_rng();
    let fragment: String = (0..ID_FRAGMENT_LENGTH)
        .map(|_| {
            let digit = rng.gen_range(0..36u32);
            char::from_digit(digit, 36).unwrap_or('0')
        })
        .collect();
    MutationId::new(format!("{}{}", now, fragment))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxAttemptsExceeded,
    NonRetryableError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub mutation: QueuedMutation,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: u64,
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("unknown mutation type: {0}")]
    UnknownType(String),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("not signed in")]
    Unauthenticated,

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("{message}")]
    Other { message: String, retryable: bool },
}

impl DispatchError {
    pub fn retryable(message: impl Into<String>) -> Self {
        DispatchError::Other {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        DispatchError::Other {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether a later flush could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::UnknownType(_) | DispatchError::InvalidPayload { .. } => false,
            // The session may be restored by the next login.
            DispatchError::Unauthenticated => true,
            DispatchError::Http(e) => match e {
                HttpError::HttpStatus { status, .. } => {
                    e.is_retryable() || *status == 401 || *status == 403
                }
                _ => e.is_retryable(),
            },
            DispatchError::Other { retryable, .. } => *retryable,
        }
    }

    /// Failures caused by the missing or rejected session rather than by
    /// the record. They do not count toward `max_attempts`.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            DispatchError::Unauthenticated => true,
            DispatchError::Http(HttpError::HttpStatus { status, .. }) => {
                *status == 401 || *status == 403
            }
            _ => false,
        }
    }
}

/// Delivers one queued mutation to the server.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, mutation: &QueuedMutation) -> Result<(), DispatchError>;
}

/// Adapts an async closure into a [`Dispatcher`].
pub struct FnDispatcher<F>(pub F);

#[async_trait]
impl<F, Fut> Dispatcher for FnDispatcher<F>
where
    F: Fn(QueuedMutation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DispatchError>> + Send,
{
    async fn dispatch(&self, mutation: &QueuedMutation) -> Result<(), DispatchError> {
        (self.0)(mutation.clone()).await
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub flushed: usize,
    /// Records this flush attempted that stay queued for the next one.
    pub remaining: usize,
    pub dead_lettered: usize,
}

enum Outcome {
    Delivered,
    Keep(QueuedMutation),
    Dead(DeadLetter),
}

pub struct SyncQueue<B> {
    store: PersistedStore<B>,
    config: QueueConfig,
    // Guards every read-modify-write of both persisted lists.
    write_lock: Mutex<()>,
    flush_lock: Mutex<()>,
}

impl<B: KeyValueBackend> SyncQueue<B> {
    pub fn new(backend: Arc<B>, config: QueueConfig) -> Self {
        let store = PersistedStore::with_version(backend, config.namespace_version);
        Self {
            store,
            config,
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    #[instrument(skip(self, item), fields(kind = %item.kind))]
    pub async fn enqueue(&self, item: NewMutation) -> QueuedMutation {
        let record = item.stamp(crate::get_current_time_ms());

        let _guard = self.write_lock.lock().await;
        let mut queue = match self.load_queue().await {
            Ok(queue) => queue,
            Err(e) => {
                error!(id = %record.id, error = %e, "sync queue unreadable, mutation not queued");
                return record;
            }
        };
        queue.push(record.clone());
        self.store.set(SYNC_QUEUE_KEY, &queue).await;

        info!(id = %record.id, queued = queue.len(), "mutation queued");
        record
    }

    pub async fn peek_all(&self) -> Vec<QueuedMutation> {
        self.store.get(SYNC_QUEUE_KEY, Vec::new()).await
    }

    async fn load_queue(&self) -> Result<Vec<QueuedMutation>, KvError> {
        Ok(self.store.try_get(SYNC_QUEUE_KEY).await?.unwrap_or_default())
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetter>, KvError> {
        Ok(self.store.try_get(DEAD_LETTER_KEY).await?.unwrap_or_default())
    }

    pub async fn replace_all(&self, queue: Vec<QueuedMutation>) {
        let _guard = self.write_lock.lock().await;
        self.store.set(SYNC_QUEUE_KEY, &queue).await;
    }

    pub async fn clear(&self) {
        self.replace_all(Vec::new()).await;
    }

    /// Delivers every queued record in order, one at a time.
    ///
    /// Only one flush runs at a time; a second caller waits for the first.
    /// The queue is not locked while dispatching, so records enqueued in
    /// the meantime are kept behind the survivors.
    #[instrument(skip_all)]
    pub async fn flush<D: Dispatcher + ?Sized>(&self, dispatcher: &D) -> FlushReport {
        let _flushing = self.flush_lock.lock().await;

        let snapshot = match self.load_queue().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "sync queue unreadable, flush skipped");
                return FlushReport::default();
            }
        };
        if snapshot.is_empty() {
            debug!("sync queue empty, nothing to flush");
            return FlushReport::default();
        }

        let mut report = FlushReport::default();
        let mut outcomes: HashMap<MutationId, Outcome> = HashMap::with_capacity(snapshot.len());

        for mut mutation in snapshot.iter().cloned() {
            match dispatcher.dispatch(&mutation).await {
                Ok(()) => {
                    debug!(id = %mutation.id, kind = %mutation.kind, "mutation delivered");
                    report.flushed += 1;
                    outcomes.insert(mutation.id.clone(), Outcome::Delivered);
                }
                Err(e) => {
                    if !e.is_auth_failure() {
                        mutation.attempts = mutation.attempts.saturating_add(1);
                    }
                    mutation.last_error = Some(truncate_error(e.to_string()));

                    let reason = if !e.is_retryable() {
                        Some(DeadLetterReason::NonRetryableError)
                    } else if !e.is_auth_failure() && mutation.attempts >= self.config.max_attempts {
                        Some(DeadLetterReason::MaxAttemptsExceeded)
                    } else {
                        None
                    };

                    let id = mutation.id.clone();
                    match reason {
                        Some(reason) => {
                            error!(
                                id = %id,
                                kind = %mutation.kind,
                                attempts = mutation.attempts,
                                ?reason,
                                error = %e,
                                "mutation dead-lettered"
                            );
                            report.dead_lettered += 1;
                            outcomes.insert(
                                id,
                                Outcome::Dead(DeadLetter {
                                    mutation,
                                    reason,
                                    dead_lettered_at: crate::get_current_time_ms(),
                                }),
                            );
                        }
                        None => {
                            warn!(
                                id = %id,
                                kind = %mutation.kind,
                                attempts = mutation.attempts,
                                max_attempts = self.config.max_attempts,
                                error = %e,
                                "mutation delivery failed, keeping it queued"
                            );
                            report.remaining += 1;
                            outcomes.insert(id, Outcome::Keep(mutation));
                        }
                    }
                }
            }
        }

        let _guard = self.write_lock.lock().await;
        // Fall back to this flush's own snapshot rather than writing a list
        // built from a failed read.
        let current = match self.load_queue().await {
            Ok(current) => current,
            Err(e) => {
                error!(error = %e, "sync queue unreadable after flush, writing back from snapshot");
                snapshot
            }
        };

        let mut slots = Vec::with_capacity(current.len());
        for record in current {
            match outcomes.remove(&record.id) {
                Some(Outcome::Delivered) => {}
                Some(outcome) => slots.push(outcome),
                None => slots.push(Outcome::Keep(record)),
            }
        }

        let dead: Vec<DeadLetter> = slots
            .iter()
            .filter_map(|slot| match slot {
                Outcome::Dead(letter) => Some(letter.clone()),
                _ => None,
            })
            .collect();
        let dead_count = dead.len();
        let dead_saved = dead.is_empty() || self.append_dead_letters(dead).await;
        if !dead_saved {
            report.dead_lettered = report.dead_lettered.saturating_sub(dead_count);
            report.remaining += dead_count;
        }

        let next: Vec<QueuedMutation> = slots
            .into_iter()
            .filter_map(|slot| match slot {
                Outcome::Keep(mutation) => Some(mutation),
                Outcome::Dead(letter) if !dead_saved => Some(letter.mutation),
                _ => None,
            })
            .collect();
        self.store.set(SYNC_QUEUE_KEY, &next).await;

        info!(
            flushed = report.flushed,
            remaining = report.remaining,
            dead_lettered = report.dead_lettered,
            queued = next.len(),
            "sync queue flushed"
        );
        report
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.store.get(DEAD_LETTER_KEY, Vec::new()).await
    }

    /// Returns false, leaving the list untouched, when it cannot be read
    /// or written. Callers keep those records queued instead.
    async fn append_dead_letters(&self, dead: Vec<DeadLetter>) -> bool {
        let mut letters = match self.load_dead_letters().await {
            Ok(letters) => letters,
            Err(e) => {
                error!(error = %e, "dead-letter list unreadable, keeping records queued");
                return false;
            }
        };
        letters.extend(dead);
        match self.store.try_set(DEAD_LETTER_KEY, &letters).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "dead-letter write failed, keeping records queued");
                false
            }
        }
    }

    /// Moves a dead-lettered record back to the end of the queue with its
    /// attempt count reset.
    pub async fn requeue_dead_letter(&self, id: &MutationId) -> Option<QueuedMutation> {
        let _guard = self.write_lock.lock().await;

        let mut letters = match self.load_dead_letters().await {
            Ok(letters) => letters,
            Err(e) => {
                warn!(id = %id, error = %e, "dead-letter list unreadable, nothing requeued");
                return None;
            }
        };
        let index = letters.iter().position(|l| &l.mutation.id == id)?;
        let mut mutation = letters.remove(index).mutation;
        mutation.attempts = 0;
        mutation.last_error = None;

        let mut queue = match self.load_queue().await {
            Ok(queue) => queue,
            Err(e) => {
                warn!(id = %id, error = %e, "sync queue unreadable, nothing requeued");
                return None;
            }
        };
        queue.push(mutation.clone());
        // Queue first: a failure after it leaves a duplicate, never a loss.
        if let Err(e) = self.store.try_set(SYNC_QUEUE_KEY, &queue).await {
            warn!(id = %id, error = %e, "sync queue write failed, nothing requeued");
            return None;
        }
        self.store.set(DEAD_LETTER_KEY, &letters).await;

        info!(id = %mutation.id, "dead letter requeued");
        Some(mutation)
    }

    pub async fn clear_dead_letters(&self) {
        let _guard = self.write_lock.lock().await;
        self.store.set(DEAD_LETTER_KEY, &Vec::<DeadLetter>::new()).await;
    }
}

pub async fn flush_queue<B, D>(queue: &SyncQueue<B>, dispatcher: &D) -> FlushReport
where
    B: KeyValueBackend,
    D: Dispatcher + ?Sized,
{
    queue.flush(dispatcher).await
}

fn truncate_error(mut message: String) -> String {
    if message.len() > MAX_ERROR_LENGTH {
        let mut end = MAX_ERROR_LENGTH;
        while end > 0 && !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}
