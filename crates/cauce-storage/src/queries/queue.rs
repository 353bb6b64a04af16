// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable backing for the in-memory priority queue.
//!
//! The in-memory queue is authoritative at runtime; these writes exist for
//! crash recovery. On restart, `recover_stale` reverts `processing` rows
//! older than the liveness threshold and `load_pending` reloads everything
//! that survived the previous process.

use cauce_core::{CauceError, InboundMessage, QueueStatus, QueuedItem};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use crate::database::{map_tr_err, Database};
use crate::queries::{parse_json, parse_ts};

/// Persist a freshly submitted item.
pub async fn insert(db: &Database, item: &QueuedItem) -> Result<(), CauceError> {
    let item = item.clone();
    let metadata = serde_json::json!({
        "transport_message_id": item.message.transport_message_id,
        "arrived_at": item.message.arrived_at.to_rfc3339(),
        "metadata": item.message.metadata,
    })
    .to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "INSERT INTO message_queue (
                    queue_id, user_id, message_content, message_hash, source,
                    conversation_id, priority, status, attempts, max_attempts,
                    metadata, created_at, scheduled_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    item.queue_id,
                    item.user_id,
                    item.message.text,
                    item.message.message_hash(),
                    item.message.source.to_string(),
                    item.message.conversation_id,
                    item.priority.to_string(),
                    item.status.to_string(),
                    item.attempts,
                    item.max_attempts,
                    metadata,
                    item.created_at.to_rfc3339(),
                    item.scheduled_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Stamp an item as leased by a worker.
pub async fn mark_processing(
    db: &Database,
    queue_id: &str,
    worker_id: &str,
    started_at: DateTime<Utc>,
) -> Result<(), CauceError> {
    let queue_id = queue_id.to_string();
    let worker_id = worker_id.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE message_queue
                 SET status = 'processing', worker_id = ?1, started_at = ?2
                 WHERE queue_id = ?3",
                params![worker_id, started_at.to_rfc3339(), queue_id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Mark an item completed.
pub async fn mark_completed(db: &Database, queue_id: &str) -> Result<(), CauceError> {
    let queue_id = queue_id.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE message_queue
                 SET status = 'completed', completed_at = ?1
                 WHERE queue_id = ?2",
                params![Utc::now().to_rfc3339(), queue_id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Record a failed attempt and put the item back to pending with backoff.
pub async fn mark_retry(
    db: &Database,
    queue_id: &str,
    attempts: u32,
    scheduled_at: DateTime<Utc>,
    last_error: &str,
) -> Result<(), CauceError> {
    let queue_id = queue_id.to_string();
    let last_error = last_error.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE message_queue
                 SET status = 'pending', attempts = ?1, scheduled_at = ?2,
                     last_error = ?3, worker_id = NULL, started_at = NULL
                 WHERE queue_id = ?4",
                params![attempts, scheduled_at.to_rfc3339(), last_error, queue_id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Move an item to the dead-letter state. Dead-letter items are retained for
/// forensic inspection and never retried automatically.
pub async fn mark_dead_letter(
    db: &Database,
    queue_id: &str,
    attempts: u32,
    last_error: &str,
) -> Result<(), CauceError> {
    let queue_id = queue_id.to_string();
    let last_error = last_error.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE message_queue
                 SET status = 'dead_letter', attempts = ?1, last_error = ?2,
                     completed_at = ?3
                 WHERE queue_id = ?4",
                params![attempts, last_error, Utc::now().to_rfc3339(), queue_id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Revert `processing` rows older than `threshold` to `pending`.
/// Returns the number of restored rows.
pub async fn recover_stale(db: &Database, threshold: Duration) -> Result<usize, CauceError> {
    let cutoff = (Utc::now() - threshold).to_rfc3339();
    db.connection()
        .call(move |conn| -> Result<usize, tokio_rusqlite::Error> {
            let n = conn.execute(
                "UPDATE message_queue
                 SET status = 'pending', worker_id = NULL, started_at = NULL
                 WHERE status = 'processing' AND started_at < ?1",
                params![cutoff],
            )?;
            Ok(n)
        })
        .await
        .map_err(map_tr_err)
}

/// Load all pending items for in-memory reload at startup.
pub async fn load_pending(db: &Database) -> Result<Vec<QueuedItem>, CauceError> {
    db.connection()
        .call(|conn| -> Result<Vec<QueuedItem>, tokio_rusqlite::Error> {
            let mut stmt = conn.prepare(
                "SELECT queue_id, user_id, message_content, source, conversation_id,
                        priority, attempts, max_attempts, metadata, created_at,
                        scheduled_at, last_error
                 FROM message_queue
                 WHERE status = 'pending'
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                let queue_id: String = row.get(0)?;
                let user_id: String = row.get(1)?;
                let text: String = row.get(2)?;
                let source: String = row.get(3)?;
                let conversation_id: Option<String> = row.get(4)?;
                let priority: String = row.get(5)?;
                let attempts: u32 = row.get(6)?;
                let max_attempts: u32 = row.get(7)?;
                let metadata: Option<String> = row.get(8)?;
                let created_at = parse_ts(&row.get::<_, String>(9)?)?;
                let scheduled_at = parse_ts(&row.get::<_, String>(10)?)?;
                let last_error: Option<String> = row.get(11)?;

                let meta: serde_json::Value = metadata
                    .as_deref()
                    .map(parse_json)
                    .transpose()?
                    .unwrap_or(serde_json::Value::Null);
                let transport_message_id = meta
                    .get("transport_message_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let arrived_at = meta
                    .get("arrived_at")
                    .and_then(|v| v.as_str())
                    .map(parse_ts)
                    .transpose()?
                    .unwrap_or(created_at);

                let message = InboundMessage {
                    user_id: user_id.clone(),
                    text,
                    source: source.parse().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    transport_message_id,
                    conversation_id,
                    arrived_at,
                    metadata: meta.get("metadata").cloned().filter(|v| !v.is_null()),
                };

                Ok(QueuedItem {
                    queue_id,
                    user_id,
                    message,
                    priority: priority.parse().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            5,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    status: QueueStatus::Pending,
                    attempts,
                    max_attempts,
                    worker_id: None,
                    created_at,
                    scheduled_at,
                    started_at: None,
                    completed_at: None,
                    last_error,
                })
            })?;
            rows.collect::<Result<_, rusqlite::Error>>().map_err(Into::into)
        })
        .await
        .map_err(map_tr_err)
}

/// Per-status row counts for monitoring.
pub async fn status_counts(db: &Database) -> Result<Vec<(String, i64)>, CauceError> {
    db.connection()
        .call(|conn| -> Result<Vec<(String, i64)>, tokio_rusqlite::Error> {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM message_queue GROUP BY status",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, rusqlite::Error>>().map_err(Into::into)
        })
        .await
        .map_err(map_tr_err)
}
