// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable tables owned by the follow-up scheduler: jobs, send history,
//! per-user daily rate limits, and the opt-out blacklist.
//!
//! The partial unique index on `(user_id, stage) WHERE status = 'pending'`
//! enforces the at-most-one-pending-job-per-stage invariant at the storage
//! layer; `upsert_pending` rides it with an upsert.

use cauce_core::{CauceError, ContextSnapshot, FollowUpJob, FollowUpRateLimit, FollowUpStatus};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;

use crate::database::{map_tr_err, Database};
use crate::queries::{parse_json, parse_ts, parse_ts_opt};

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<FollowUpJob, rusqlite::Error> {
    let status: String = row.get(4)?;
    Ok(FollowUpJob {
        id: row.get(0)?,
        user_id: row.get(1)?,
        stage: row.get::<_, i64>(2)? as u8,
        scheduled_for: parse_ts(&row.get::<_, String>(3)?)?,
        status: status.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        attempts: row.get::<_, i64>(5)? as u32,
        context_snapshot: parse_json(&row.get::<_, String>(6)?)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
        processed_at: parse_ts_opt(row.get(8)?)?,
    })
}

const JOB_COLUMNS: &str = "id, user_id, stage, scheduled_for, status, attempts, \
                           context_snapshot, created_at, processed_at";

/// Arm a `(user, stage)` job. An existing pending job for the same pair is
/// rescheduled in place rather than duplicated.
pub async fn upsert_pending(
    db: &Database,
    user_id: &str,
    stage: u8,
    scheduled_for: DateTime<Utc>,
    snapshot: &ContextSnapshot,
) -> Result<(), CauceError> {
    let user_id = user_id.to_string();
    let snapshot = serde_json::to_string(snapshot)
        .map_err(|e| CauceError::Internal(format!("snapshot serialization failed: {e}")))?;
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "INSERT INTO follow_up_jobs
                    (user_id, stage, scheduled_for, status, attempts, context_snapshot, created_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5)
                 ON CONFLICT(user_id, stage) WHERE status = 'pending' DO UPDATE SET
                    scheduled_for = excluded.scheduled_for,
                    context_snapshot = excluded.context_snapshot,
                    attempts = 0,
                    created_at = excluded.created_at",
                params![
                    user_id,
                    stage as i64,
                    scheduled_for.to_rfc3339(),
                    snapshot,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Cancel every pending job for a user (stage-0 reset). Returns the count.
pub async fn cancel_pending(db: &Database, user_id: &str) -> Result<usize, CauceError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| -> Result<usize, tokio_rusqlite::Error> {
            let n = conn.execute(
                "UPDATE follow_up_jobs
                 SET status = 'cancelled', processed_at = ?1
                 WHERE user_id = ?2 AND status = 'pending'",
                params![Utc::now().to_rfc3339(), user_id],
            )?;
            Ok(n)
        })
        .await
        .map_err(map_tr_err)
}

/// Jobs due at `now`. Normal operation also retries `failed` jobs below the
/// attempt cap; migration mode passes `include_failed = false`.
pub async fn select_due(
    db: &Database,
    now: DateTime<Utc>,
    include_failed: bool,
    max_attempts: u32,
    limit: usize,
) -> Result<Vec<FollowUpJob>, CauceError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM follow_up_jobs
         WHERE scheduled_for <= ?1
           AND (status = 'pending'
                OR (?2 = 1 AND status = 'failed' AND attempts < ?3))
         ORDER BY scheduled_for ASC
         LIMIT ?4"
    );
    db.connection()
        .call(move |conn| -> Result<Vec<FollowUpJob>, tokio_rusqlite::Error> {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    now.to_rfc3339(),
                    include_failed as i64,
                    max_attempts as i64,
                    limit as i64
                ],
                row_to_job,
            )?;
            rows.collect::<Result<_, rusqlite::Error>>().map_err(Into::into)
        })
        .await
        .map_err(map_tr_err)
}

/// Stamp a job as being sent right now.
pub async fn mark_processing(db: &Database, id: i64) -> Result<(), CauceError> {
    set_status(db, id, FollowUpStatus::Processing, None).await
}

/// Mark a job sent.
pub async fn mark_sent(db: &Database, id: i64) -> Result<(), CauceError> {
    set_status(db, id, FollowUpStatus::Sent, None).await
}

/// Mark a job cancelled.
pub async fn mark_cancelled(db: &Database, id: i64) -> Result<(), CauceError> {
    set_status(db, id, FollowUpStatus::Cancelled, None).await
}

/// Mark a job failed; when `retry_at` is set the job stays eligible for the
/// failed-retry path.
pub async fn mark_failed(
    db: &Database,
    id: i64,
    attempts: u32,
    retry_at: Option<DateTime<Utc>>,
) -> Result<(), CauceError> {
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE follow_up_jobs
                 SET status = 'failed', attempts = ?1, processed_at = ?2,
                     scheduled_for = COALESCE(?3, scheduled_for)
                 WHERE id = ?4",
                params![
                    attempts as i64,
                    Utc::now().to_rfc3339(),
                    retry_at.map(|t| t.to_rfc3339()),
                    id,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

async fn set_status(
    db: &Database,
    id: i64,
    status: FollowUpStatus,
    scheduled_for: Option<DateTime<Utc>>,
) -> Result<(), CauceError> {
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE follow_up_jobs
                 SET status = ?1, processed_at = ?2,
                     scheduled_for = COALESCE(?3, scheduled_for)
                 WHERE id = ?4",
                params![
                    status.to_string(),
                    Utc::now().to_rfc3339(),
                    scheduled_for.map(|t| t.to_rfc3339()),
                    id,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Move a job's fire time without touching its stage or status.
pub async fn reschedule(db: &Database, id: i64, when: DateTime<Utc>) -> Result<(), CauceError> {
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE follow_up_jobs SET scheduled_for = ?1 WHERE id = ?2",
                params![when.to_rfc3339(), id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Repair jobs the previous process left mid-send. Returns the count.
pub async fn repair_processing(db: &Database) -> Result<usize, CauceError> {
    db.connection()
        .call(|conn| -> Result<usize, tokio_rusqlite::Error> {
            let n = conn.execute(
                "UPDATE follow_up_jobs SET status = 'pending' WHERE status = 'processing'",
                [],
            )?;
            Ok(n)
        })
        .await
        .map_err(map_tr_err)
}

/// All pending jobs for one user, soonest first.
pub async fn pending_for_user(
    db: &Database,
    user_id: &str,
) -> Result<Vec<FollowUpJob>, CauceError> {
    let user_id = user_id.to_string();
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM follow_up_jobs
         WHERE user_id = ?1 AND status = 'pending'
         ORDER BY scheduled_for ASC"
    );
    db.connection()
        .call(move |conn| -> Result<Vec<FollowUpJob>, tokio_rusqlite::Error> {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![user_id], row_to_job)?;
            rows.collect::<Result<_, rusqlite::Error>>().map_err(Into::into)
        })
        .await
        .map_err(map_tr_err)
}

// --- Blacklist ---

/// Add a user to the follow-up blacklist.
pub async fn blacklist_add(db: &Database, user_id: &str, reason: &str) -> Result<(), CauceError> {
    let user_id = user_id.to_string();
    let reason = reason.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "INSERT INTO follow_up_blacklist (user_id, reason, added_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    reason = excluded.reason,
                    added_at = excluded.added_at",
                params![user_id, reason, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Remove a user from the blacklist.
pub async fn blacklist_remove(db: &Database, user_id: &str) -> Result<(), CauceError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "DELETE FROM follow_up_blacklist WHERE user_id = ?1",
                params![user_id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Whether a user is blacklisted.
pub async fn is_blacklisted(db: &Database, user_id: &str) -> Result<bool, CauceError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| -> Result<bool, tokio_rusqlite::Error> {
            let result = conn.query_row(
                "SELECT 1 FROM follow_up_blacklist WHERE user_id = ?1",
                params![user_id],
                |_| Ok(()),
            );
            match result {
                Ok(()) => Ok(true),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await
        .map_err(map_tr_err)
}

// --- Rate limits ---

/// Load the daily send accounting for a user.
pub async fn rate_limit_get(
    db: &Database,
    user_id: &str,
) -> Result<Option<FollowUpRateLimit>, CauceError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(
            move |conn| -> Result<Option<FollowUpRateLimit>, tokio_rusqlite::Error> {
                let result = conn.query_row(
                    "SELECT user_id, last_sent_at, daily_count, reset_date
                     FROM follow_up_rate_limits WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        let reset: String = row.get(3)?;
                        Ok(FollowUpRateLimit {
                            user_id: row.get(0)?,
                            last_sent_at: parse_ts_opt(row.get(1)?)?,
                            daily_count: row.get::<_, i64>(2)? as u32,
                            reset_date: reset.parse::<NaiveDate>().map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(
                                    3,
                                    rusqlite::types::Type::Text,
                                    Box::new(e),
                                )
                            })?,
                        })
                    },
                );
                match result {
                    Ok(limit) => Ok(Some(limit)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            },
        )
        .await
        .map_err(map_tr_err)
}

/// Record one follow-up send on the given civil day. Rolls the counter when
/// the stored `reset_date` is older than `today`.
pub async fn rate_limit_record_send(
    db: &Database,
    user_id: &str,
    today: NaiveDate,
) -> Result<(), CauceError> {
    let user_id = user_id.to_string();
    let today_str = today.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "INSERT INTO follow_up_rate_limits (user_id, last_sent_at, daily_count, reset_date)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    last_sent_at = excluded.last_sent_at,
                    daily_count = CASE
                        WHEN follow_up_rate_limits.reset_date = excluded.reset_date
                        THEN follow_up_rate_limits.daily_count + 1
                        ELSE 1
                    END,
                    reset_date = excluded.reset_date",
                params![user_id, Utc::now().to_rfc3339(), today_str],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

// --- History ---

/// Record a sent follow-up.
pub async fn history_insert(
    db: &Database,
    user_id: &str,
    stage: u8,
    message: &str,
) -> Result<(), CauceError> {
    let user_id = user_id.to_string();
    let message = message.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "INSERT INTO follow_up_history (user_id, stage, message_sent, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, stage as i64, message, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Mark recent sends as responded when the user comes back. Returns the
/// number of rows touched.
pub async fn history_mark_responded(
    db: &Database,
    user_id: &str,
    since: DateTime<Utc>,
) -> Result<usize, CauceError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| -> Result<usize, tokio_rusqlite::Error> {
            let n = conn.execute(
                "UPDATE follow_up_history
                 SET responded = 1, responded_at = ?1
                 WHERE user_id = ?2 AND responded = 0 AND sent_at > ?3",
                params![Utc::now().to_rfc3339(), user_id, since.to_rfc3339()],
            )?;
            Ok(n)
        })
        .await
        .map_err(map_tr_err)
}
