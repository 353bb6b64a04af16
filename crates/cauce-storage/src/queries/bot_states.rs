// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable mirror of the bot-state gate.
//!
//! The cache (L2) is the fast path with TTL expiry; this table exists so
//! paused users stay paused across a process restart.

use cauce_core::{BotState, CauceError};
use rusqlite::params;

use crate::database::{map_tr_err, Database};
use crate::queries::parse_ts;

/// Write or replace a user's state record.
pub async fn upsert(db: &Database, state: &BotState) -> Result<(), CauceError> {
    let state = state.clone();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "INSERT INTO bot_states (user_id, paused, reason, set_by, paused_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                    paused = excluded.paused,
                    reason = excluded.reason,
                    set_by = excluded.set_by,
                    paused_at = excluded.paused_at,
                    expires_at = excluded.expires_at",
                params![
                    state.user_id,
                    state.paused as i32,
                    state.reason,
                    state.set_by,
                    state.paused_at.to_rfc3339(),
                    state.expires_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Load a user's state record, expired or not.
pub async fn get(db: &Database, user_id: &str) -> Result<Option<BotState>, CauceError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| -> Result<Option<BotState>, tokio_rusqlite::Error> {
            let result = conn.query_row(
                "SELECT user_id, paused, reason, set_by, paused_at, expires_at
                 FROM bot_states WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(BotState {
                        user_id: row.get(0)?,
                        paused: row.get::<_, i32>(1)? != 0,
                        reason: row.get(2)?,
                        set_by: row.get(3)?,
                        paused_at: parse_ts(&row.get::<_, String>(4)?)?,
                        expires_at: parse_ts(&row.get::<_, String>(5)?)?,
                    })
                },
            );
            match result {
                Ok(state) => Ok(Some(state)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
        .map_err(map_tr_err)
}

/// Remove a user's state record.
pub async fn delete(db: &Database, user_id: &str) -> Result<(), CauceError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute("DELETE FROM bot_states WHERE user_id = ?1", params![user_id])?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Remove every state record. Returns the number of users resumed.
pub async fn delete_all(db: &Database) -> Result<usize, CauceError> {
    db.connection()
        .call(|conn| -> Result<usize, tokio_rusqlite::Error> {
            let n = conn.execute("DELETE FROM bot_states", [])?;
            Ok(n)
        })
        .await
        .map_err(map_tr_err)
}

/// List users currently paused (including records past TTL; callers filter).
pub async fn list_paused(db: &Database) -> Result<Vec<BotState>, CauceError> {
    db.connection()
        .call(|conn| -> Result<Vec<BotState>, tokio_rusqlite::Error> {
            let mut stmt = conn.prepare(
                "SELECT user_id, paused, reason, set_by, paused_at, expires_at
                 FROM bot_states WHERE paused = 1",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(BotState {
                    user_id: row.get(0)?,
                    paused: row.get::<_, i32>(1)? != 0,
                    reason: row.get(2)?,
                    set_by: row.get(3)?,
                    paused_at: parse_ts(&row.get::<_, String>(4)?)?,
                    expires_at: parse_ts(&row.get::<_, String>(5)?)?,
                })
            })?;
            rows.collect::<Result<_, rusqlite::Error>>().map_err(Into::into)
        })
        .await
        .map_err(map_tr_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn paused_state(user: &str) -> BotState {
        BotState {
            user_id: user.to_string(),
            paused: true,
            reason: "tag".into(),
            set_by: "agent".into(),
            paused_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn upsert_get_delete_lifecycle() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("bs.db").to_str().unwrap())
            .await
            .unwrap();

        upsert(&db, &paused_state("u1")).await.unwrap();
        let loaded = get(&db, "u1").await.unwrap().unwrap();
        assert!(loaded.paused);
        assert_eq!(loaded.reason, "tag");

        delete(&db, "u1").await.unwrap();
        assert!(get(&db, "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_all_counts_rows() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("bs2.db").to_str().unwrap())
            .await
            .unwrap();

        upsert(&db, &paused_state("u1")).await.unwrap();
        upsert(&db, &paused_state("u2")).await.unwrap();
        assert_eq!(delete_all(&db).await.unwrap(), 2);
        assert!(list_paused(&db).await.unwrap().is_empty());
    }
}
