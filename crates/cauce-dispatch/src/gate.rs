// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bot-state gate: per-user paused/active flag with TTL.
//!
//! The shared cache is the fast path (TTL handles expiry); every write is
//! mirrored to the `bot_states` table so pauses survive restarts. Absence
//! of a record means active, and a gate read error also reads as active so
//! a cache outage never silences every conversation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use cauce_cache::KeyValueCache;
use cauce_core::{BotState, CauceError};
use cauce_storage::{queries::bot_states, Database};

const KEY_PREFIX: &str = "bot_state:";

/// Default pause TTL.
pub const DEFAULT_PAUSE_TTL: Duration = Duration::from_secs(24 * 3600);

/// TTL for force-active markers; effectively permanent, refreshed from the
/// durable mirror on cache miss.
const FORCE_ACTIVE_TTL_DAYS: i64 = 3650;

/// Per-user paused/active gate.
pub struct BotStateGate {
    cache: Arc<dyn KeyValueCache>,
    db: Database,
}

impl BotStateGate {
    pub fn new(cache: Arc<dyn KeyValueCache>, db: Database) -> Self {
        Self { cache, db }
    }

    fn key(user_id: &str) -> String {
        format!("{KEY_PREFIX}{user_id}")
    }

    /// Current state record, unexpired only.
    pub async fn state(&self, user_id: &str) -> Option<BotState> {
        let now = Utc::now();

        match self.cache.get(&Self::key(user_id)).await {
            Ok(Some(json)) => {
                if let Ok(state) = serde_json::from_str::<BotState>(&json) {
                    if !state.is_expired(now) {
                        return Some(state);
                    }
                    return None;
                }
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, user_id, "gate cache read skipped"),
        }

        // Cache miss: consult the durable mirror and repopulate.
        match bot_states::get(&self.db, user_id).await {
            Ok(Some(state)) if !state.is_expired(now) => {
                let ttl = (state.expires_at - now)
                    .to_std()
                    .unwrap_or(DEFAULT_PAUSE_TTL);
                self.cache_put(&state, ttl).await;
                Some(state)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, user_id, "gate store read failed, assuming active");
                None
            }
        }
    }

    /// Whether dispatch must be suppressed for this user.
    pub async fn is_paused(&self, user_id: &str) -> bool {
        self.state(user_id).await.map(|s| s.paused).unwrap_or(false)
    }

    /// Pause a user. Returns `false` when the user carries a force-active
    /// marker and `override_force` is not set (only the operator API sets it).
    pub async fn pause(
        &self,
        user_id: &str,
        reason: &str,
        set_by: &str,
        ttl: Duration,
        override_force: bool,
    ) -> Result<bool, CauceError> {
        if !override_force {
            if let Some(current) = self.state(user_id).await {
                if current.reason == BotState::FORCE_ACTIVE {
                    info!(user_id, reason, "pause ignored: user is force-active");
                    return Ok(false);
                }
            }
        }

        let now = Utc::now();
        let state = BotState {
            user_id: user_id.to_string(),
            paused: true,
            reason: reason.to_string(),
            set_by: set_by.to_string(),
            paused_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
        };

        bot_states::upsert(&self.db, &state).await?;
        self.cache_put(&state, ttl).await;
        info!(user_id, reason, set_by, "bot paused");
        Ok(true)
    }

    /// Resume a user: remove the record from both tiers. Idempotent.
    pub async fn resume(&self, user_id: &str) -> Result<(), CauceError> {
        bot_states::delete(&self.db, user_id).await?;
        if let Err(e) = self.cache.delete(&Self::key(user_id)).await {
            debug!(error = %e, user_id, "gate cache delete skipped");
        }
        info!(user_id, "bot resumed");
        Ok(())
    }

    /// Unconditionally clear any paused state and pin the user active.
    /// Only an operator-API pause with `override_force` may undo it.
    pub async fn force_activate(&self, user_id: &str) -> Result<(), CauceError> {
        let now = Utc::now();
        let state = BotState {
            user_id: user_id.to_string(),
            paused: false,
            reason: BotState::FORCE_ACTIVE.to_string(),
            set_by: "agent".to_string(),
            paused_at: now,
            expires_at: now + chrono::Duration::days(FORCE_ACTIVE_TTL_DAYS),
        };
        bot_states::upsert(&self.db, &state).await?;
        self.cache_put(&state, DEFAULT_PAUSE_TTL).await;
        info!(user_id, "bot force-activated");
        Ok(())
    }

    /// Resume every paused user. Returns the number cleared.
    pub async fn resume_all(&self) -> Result<usize, CauceError> {
        let paused = bot_states::list_paused(&self.db).await?;
        for state in &paused {
            if let Err(e) = self.cache.delete(&Self::key(&state.user_id)).await {
                debug!(error = %e, user_id = %state.user_id, "gate cache delete skipped");
            }
        }
        bot_states::delete_all(&self.db).await?;
        info!(count = paused.len(), "all bots resumed");
        Ok(paused.len())
    }

    async fn cache_put(&self, state: &BotState, ttl: Duration) {
        let json = match serde_json::to_string(state) {
            Ok(json) => json,
            Err(e) => {
                debug!(error = %e, "bot state serialization failed");
                return;
            }
        };
        if let Err(e) = self.cache.set_ex(&Self::key(&state.user_id), &json, ttl).await {
            debug!(error = %e, user_id = %state.user_id, "gate cache write skipped");
        }
    }
}
