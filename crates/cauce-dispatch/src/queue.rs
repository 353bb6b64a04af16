// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Four-level priority queue with durable backing.
//!
//! The in-memory queue is authoritative at runtime; every transition is
//! mirrored to the `message_queue` table so a crash loses nothing. Draining
//! order is URGENT, HIGH, NORMAL, LOW with strict FIFO inside a level and a
//! fairness skip: an item whose user already has another item in flight is
//! passed over until that item completes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cauce_core::{CauceError, InboundMessage, Priority, QueueStatus, QueuedItem};
use cauce_storage::{queries::queue as queue_db, Database};

/// Per-user size of the submit-time dedup set.
const RECENT_HASHES_PER_USER: usize = 20;

/// Retry backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Retry backoff base.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// How a worker reports the outcome of a leased item.
#[derive(Debug)]
pub enum AckOutcome {
    /// Dispatched successfully.
    Success,
    /// Completed without dispatch (bot paused).
    Skipped,
    /// Transient failure; retry with backoff.
    RetriableFailure(String),
    /// Permanent failure; dead-letter immediately.
    PermanentFailure(String),
}

/// What the ack did with the item.
#[derive(Debug, PartialEq, Eq)]
pub enum AckResult {
    Completed,
    Requeued,
    DeadLettered,
}

/// Exponential retry backoff: `2^attempts x 500 ms`, capped at 30 s.
pub fn retry_backoff(attempts: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempts))
        .min(BACKOFF_CAP)
}

struct QueueInner {
    levels: [VecDeque<QueuedItem>; 4],
    /// queue_id -> leased item.
    processing: HashMap<String, QueuedItem>,
    /// Users with an item in flight; their queued items are skipped.
    processing_users: HashSet<String>,
    /// Per-user bounded recent hash set for submit-time dedup.
    recent_hashes: HashMap<String, VecDeque<String>>,
}

impl QueueInner {
    fn depth(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }
}

/// Multi-level priority queue.
pub struct PriorityQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    db: Database,
    max_attempts: u32,
}

impl PriorityQueue {
    pub fn new(db: Database, max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                levels: Default::default(),
                processing: HashMap::new(),
                processing_users: HashSet::new(),
                recent_hashes: HashMap::new(),
            }),
            notify: Notify::new(),
            db,
            max_attempts,
        }
    }

    /// Crash recovery: revert stale `processing` rows and reload pending
    /// items into memory. Returns `(restored, reloaded)`.
    pub async fn recover(&self, liveness_threshold: Duration) -> Result<(usize, usize), CauceError> {
        let restored = queue_db::recover_stale(
            &self.db,
            chrono::Duration::from_std(liveness_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        )
        .await?;
        let pending = queue_db::load_pending(&self.db).await?;
        let reloaded = pending.len();

        let mut inner = self.inner.lock().await;
        for item in pending {
            Self::remember_hash(&mut inner, &item.user_id, item.message.message_hash());
            inner.levels[item.priority.index()].push_back(item);
        }
        drop(inner);
        self.notify.notify_waiters();

        if restored > 0 || reloaded > 0 {
            debug!(restored, reloaded, "queue recovered from durable store");
        }
        Ok((restored, reloaded))
    }

    /// Submit a coalesced message at the given priority.
    ///
    /// Duplicate `(user, hash)` pairs within the bounded recent-set are
    /// rejected before touching the durable store.
    pub async fn submit(
        &self,
        message: InboundMessage,
        priority: Priority,
    ) -> Result<QueuedItem, CauceError> {
        let hash = message.message_hash();
        {
            let inner = self.inner.lock().await;
            let seen = inner
                .recent_hashes
                .get(&message.user_id)
                .map(|hashes| hashes.contains(&hash))
                .unwrap_or(false);
            if seen {
                return Err(CauceError::Duplicate);
            }
        }

        let mut item = QueuedItem::new(message, priority);
        item.max_attempts = self.max_attempts;
        queue_db::insert(&self.db, &item).await?;

        // The hash is remembered only once the item is durably queued, so a
        // failed insert never shadows a later resend.
        let mut inner = self.inner.lock().await;
        Self::remember_hash(&mut inner, &item.user_id, hash);
        inner.levels[priority.index()].push_back(item.clone());
        drop(inner);
        self.notify.notify_waiters();

        cauce_metrics::record_queue_submitted(&priority.to_string());
        Ok(item)
    }

    /// Lease the next eligible item, waiting until one is available or the
    /// token is cancelled.
    pub async fn lease_waiting(
        &self,
        worker_id: &str,
        cancel: &CancellationToken,
    ) -> Option<QueuedItem> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = self.try_lease(worker_id).await {
                return Some(item);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
                // Items in retry backoff become eligible without a notify.
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// Single non-blocking lease attempt.
    pub async fn try_lease(&self, worker_id: &str) -> Option<QueuedItem> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        for level in 0..inner.levels.len() {
            let position = inner.levels[level].iter().position(|item| {
                item.scheduled_at <= now && !inner.processing_users.contains(&item.user_id)
            });
            if let Some(position) = position {
                let Some(mut item) = inner.levels[level].remove(position) else {
                    continue;
                };
                item.status = QueueStatus::Processing;
                item.worker_id = Some(worker_id.to_string());
                item.started_at = Some(now);

                inner.processing_users.insert(item.user_id.clone());
                inner.processing.insert(item.queue_id.clone(), item.clone());
                drop(inner);

                if let Err(e) =
                    queue_db::mark_processing(&self.db, &item.queue_id, worker_id, now).await
                {
                    warn!(error = %e, queue_id = %item.queue_id, "lease mirror write failed");
                }
                cauce_metrics::record_queue_leased(&item.priority.to_string());
                return Some(item);
            }
        }
        None
    }

    /// Acknowledge a leased item.
    pub async fn ack(&self, queue_id: &str, outcome: AckOutcome) -> Result<AckResult, CauceError> {
        let mut inner = self.inner.lock().await;
        let Some(mut item) = inner.processing.remove(queue_id) else {
            return Err(CauceError::Internal(format!(
                "ack for unknown queue id {queue_id}"
            )));
        };
        inner.processing_users.remove(&item.user_id);
        drop(inner);
        // The user's later items become eligible again.
        self.notify.notify_waiters();

        let priority = item.priority.to_string();
        let result = match outcome {
            AckOutcome::Success | AckOutcome::Skipped => {
                queue_db::mark_completed(&self.db, queue_id).await?;
                cauce_metrics::record_queue_acked(&priority, "completed");
                AckResult::Completed
            }
            AckOutcome::RetriableFailure(error) => {
                item.attempts += 1;
                if item.attempts < item.max_attempts {
                    item.status = QueueStatus::Pending;
                    item.scheduled_at = Utc::now()
                        + chrono::Duration::from_std(retry_backoff(item.attempts))
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    item.worker_id = None;
                    item.started_at = None;
                    item.last_error = Some(error.clone());
                    queue_db::mark_retry(&self.db, queue_id, item.attempts, item.scheduled_at, &error)
                        .await?;

                    let mut inner = self.inner.lock().await;
                    inner.levels[item.priority.index()].push_back(item);
                    drop(inner);
                    self.notify.notify_waiters();
                    cauce_metrics::record_queue_acked(&priority, "requeued");
                    AckResult::Requeued
                } else {
                    queue_db::mark_dead_letter(&self.db, queue_id, item.attempts, &error).await?;
                    cauce_metrics::record_queue_acked(&priority, "dead_letter");
                    AckResult::DeadLettered
                }
            }
            AckOutcome::PermanentFailure(error) => {
                queue_db::mark_dead_letter(&self.db, queue_id, item.attempts, &error).await?;
                cauce_metrics::record_queue_acked(&priority, "dead_letter");
                AckResult::DeadLettered
            }
        };
        Ok(result)
    }

    /// Pending items across all levels.
    pub async fn depth(&self) -> usize {
        self.inner.lock().await.depth()
    }

    /// Items currently leased.
    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.processing.len()
    }

    /// Snapshot for the stats endpoint: pending per level plus in-flight.
    pub async fn stats(&self) -> QueueStatsSnapshot {
        let inner = self.inner.lock().await;
        QueueStatsSnapshot {
            pending_urgent: inner.levels[0].len(),
            pending_high: inner.levels[1].len(),
            pending_normal: inner.levels[2].len(),
            pending_low: inner.levels[3].len(),
            processing: inner.processing.len(),
        }
    }

    fn remember_hash(inner: &mut QueueInner, user_id: &str, hash: String) {
        let hashes = inner
            .recent_hashes
            .entry(user_id.to_string())
            .or_default();
        hashes.push_back(hash);
        while hashes.len() > RECENT_HASHES_PER_USER {
            hashes.pop_front();
        }
    }
}

/// Point-in-time queue depths.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatsSnapshot {
    pub pending_urgent: usize,
    pub pending_high: usize,
    pub pending_normal: usize,
    pub pending_low: usize,
    pub processing: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cauce_core::MessageSource;
    use tempfile::tempdir;

    fn msg(user: &str, text: &str) -> InboundMessage {
        InboundMessage {
            user_id: user.to_string(),
            text: text.to_string(),
            source: MessageSource::Whatsapp,
            transport_message_id: "m".into(),
            conversation_id: None,
            arrived_at: Utc::now(),
            metadata: None,
        }
    }

    async fn setup() -> (PriorityQueue, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("q.db").to_str().unwrap())
            .await
            .unwrap();
        (PriorityQueue::new(db, 3), dir)
    }

    #[tokio::test]
    async fn urgent_dominates_normal() {
        let (queue, _dir) = setup().await;
        for i in 0..5 {
            queue
                .submit(msg(&format!("u{i}"), &format!("normal {i}")), Priority::Normal)
                .await
                .unwrap();
        }
        queue
            .submit(msg("vip", "urgente!"), Priority::Urgent)
            .await
            .unwrap();

        let leased = queue.try_lease("w1").await.unwrap();
        assert_eq!(leased.priority, Priority::Urgent);
        assert_eq!(leased.user_id, "vip");
    }

    #[tokio::test]
    async fn fifo_within_level() {
        let (queue, _dir) = setup().await;
        queue.submit(msg("u1", "primero"), Priority::Normal).await.unwrap();
        queue.submit(msg("u2", "segundo"), Priority::Normal).await.unwrap();

        assert_eq!(queue.try_lease("w1").await.unwrap().message.text, "primero");
        assert_eq!(queue.try_lease("w2").await.unwrap().message.text, "segundo");
    }

    #[tokio::test]
    async fn fairness_skips_user_with_item_in_flight() {
        let (queue, _dir) = setup().await;
        queue.submit(msg("u1", "a"), Priority::Normal).await.unwrap();
        queue.submit(msg("u1", "b"), Priority::Normal).await.unwrap();
        queue.submit(msg("u2", "c"), Priority::Normal).await.unwrap();

        let first = queue.try_lease("w1").await.unwrap();
        assert_eq!(first.message.text, "a");

        // u1 has an item in flight, so "b" is skipped in favor of u2's "c".
        let second = queue.try_lease("w2").await.unwrap();
        assert_eq!(second.user_id, "u2");

        // Nothing else is eligible while both users are in flight.
        assert!(queue.try_lease("w3").await.is_none());

        queue.ack(&first.queue_id, AckOutcome::Success).await.unwrap();
        let third = queue.try_lease("w3").await.unwrap();
        assert_eq!(third.message.text, "b");
    }

    #[tokio::test]
    async fn submit_dedupes_by_user_and_hash() {
        let (queue, _dir) = setup().await;
        queue.submit(msg("u1", "hola"), Priority::Normal).await.unwrap();
        let err = queue
            .submit(msg("u1", "hola"), Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, CauceError::Duplicate));

        // Same text from another user is distinct.
        queue.submit(msg("u2", "hola"), Priority::Normal).await.unwrap();
    }

    #[tokio::test]
    async fn retriable_failure_requeues_with_backoff() {
        let (queue, _dir) = setup().await;
        let item = queue.submit(msg("u1", "hola"), Priority::High).await.unwrap();
        let leased = queue.try_lease("w1").await.unwrap();

        let result = queue
            .ack(&leased.queue_id, AckOutcome::RetriableFailure("timeout".into()))
            .await
            .unwrap();
        assert_eq!(result, AckResult::Requeued);

        // Backoff keeps it ineligible right now.
        assert!(queue.try_lease("w1").await.is_none());
        assert_eq!(queue.depth().await, 1);
        let _ = item;
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let (queue, _dir) = setup().await;
        queue.submit(msg("u1", "hola"), Priority::Normal).await.unwrap();

        let mut result = AckResult::Completed;
        for _ in 0..3 {
            // Wait out the backoff by forcing eligibility.
            let leased = loop {
                if let Some(item) = queue.try_lease("w1").await {
                    break item;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            };
            result = queue
                .ack(&leased.queue_id, AckOutcome::RetriableFailure("boom".into()))
                .await
                .unwrap();
        }
        assert_eq!(result, AckResult::DeadLettered);
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let (queue, _dir) = setup().await;
        queue.submit(msg("u1", "hola"), Priority::Normal).await.unwrap();
        let leased = queue.try_lease("w1").await.unwrap();
        let result = queue
            .ack(&leased.queue_id, AckOutcome::PermanentFailure("400".into()))
            .await
            .unwrap();
        assert_eq!(result, AckResult::DeadLettered);
    }

    #[tokio::test]
    async fn recovery_reloads_pending_from_durable_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recover.db");
        {
            let db = Database::open(path.to_str().unwrap()).await.unwrap();
            let queue = PriorityQueue::new(db, 3);
            queue.submit(msg("u1", "sobreviviente"), Priority::High).await.unwrap();
            // Process dies here; the item was never leased.
        }

        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        let queue = PriorityQueue::new(db, 3);
        let (_restored, reloaded) = queue.recover(Duration::from_secs(300)).await.unwrap();
        assert_eq!(reloaded, 1);

        let leased = queue.try_lease("w1").await.unwrap();
        assert_eq!(leased.message.text, "sobreviviente");
        assert_eq!(leased.priority, Priority::High);
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff(1), Duration::from_secs(1));
        assert_eq!(retry_backoff(2), Duration::from_secs(2));
        assert_eq!(retry_backoff(3), Duration::from_secs(4));
        assert_eq!(retry_backoff(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn lease_waiting_returns_none_on_cancel() {
        let (queue, _dir) = setup().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.lease_waiting("w1", &cancel).await.is_none());
    }
}
