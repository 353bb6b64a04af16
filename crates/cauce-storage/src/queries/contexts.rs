// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable tier (L3) of the conversation context store.
//!
//! The full context is serialized into `context_data`; the scalar columns
//! exist for querying and inspection, not for reconstruction.

use cauce_core::{CauceError, ConversationContext};
use rusqlite::params;

use crate::database::{map_tr_err, Database};
use crate::queries::parse_json;

/// Write a context row, replacing any previous version (last-writer-wins
/// per user).
pub async fn upsert(db: &Database, ctx: &ConversationContext) -> Result<(), CauceError> {
    let user_id = ctx.user_id.clone();
    let context_data = serde_json::to_string(ctx)
        .map_err(|e| CauceError::Internal(format!("context serialization failed: {e}")))?;
    let profile = serde_json::to_string(&ctx.profile)
        .map_err(|e| CauceError::Internal(format!("profile serialization failed: {e}")))?;
    let state = ctx.state.to_string();
    let started = ctx.conversation_started.to_rfc3339();
    let last = ctx.last_interaction.to_rfc3339();

    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "INSERT INTO conversation_contexts (
                    user_id, context_data, profile, state,
                    conversation_started, last_interaction, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(user_id) DO UPDATE SET
                    context_data = excluded.context_data,
                    profile = excluded.profile,
                    state = excluded.state,
                    last_interaction = excluded.last_interaction,
                    updated_at = excluded.updated_at",
                params![
                    user_id,
                    context_data,
                    profile,
                    state,
                    started,
                    last,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Load a context by user id. `None` for unknown users.
pub async fn get(db: &Database, user_id: &str) -> Result<Option<ConversationContext>, CauceError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(
            move |conn| -> Result<Option<ConversationContext>, tokio_rusqlite::Error> {
                let result = conn.query_row(
                    "SELECT context_data FROM conversation_contexts WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        let data: String = row.get(0)?;
                        parse_json(&data)
                    },
                );
                match result {
                    Ok(ctx) => Ok(Some(ctx)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            },
        )
        .await
        .map_err(map_tr_err)
}
