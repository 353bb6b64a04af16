// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Three-tier conversation context store.
//!
//! Reads walk L1 (in-process LRU) -> L2 (shared cache) -> L3 (SQLite),
//! promoting on the way back. Writes go through `update`, which holds a
//! per-user async mutex for the read-modify-write, persists L3
//! synchronously, and refreshes L1/L2 best-effort. A shared-cache outage
//! silently degrades the store to L1+L3; an L3 outage fails the update so
//! the dispatch retries.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use tracing::debug;

use cauce_cache::KeyValueCache;
use cauce_core::{CauceError, ConversationContext};
use cauce_storage::{queries::contexts, Database};

/// Tuning knobs for the tiered store.
#[derive(Debug, Clone)]
pub struct ContextStoreConfig {
    /// L1 entry count cap.
    pub l1_capacity: usize,
    /// L1 entries older than this are treated as misses.
    pub l1_freshness: Duration,
    /// TTL applied to L2 writes.
    pub l2_ttl: Duration,
}

impl Default for ContextStoreConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 500,
            l1_freshness: Duration::from_secs(300),
            l2_ttl: Duration::from_secs(3600),
        }
    }
}

struct CachedContext {
    ctx: ConversationContext,
    cached_at: Instant,
}

/// The context store. Exclusive owner of `ConversationContext` persistence;
/// every mutation flows through [`ContextStore::update`].
pub struct ContextStore {
    l1: StdMutex<LruCache<String, CachedContext>>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    cache: Arc<dyn KeyValueCache>,
    db: Database,
    config: ContextStoreConfig,
}

impl ContextStore {
    pub fn new(db: Database, cache: Arc<dyn KeyValueCache>, config: ContextStoreConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.l1_capacity).unwrap_or(NonZeroUsize::new(1).expect("nonzero"));
        Self {
            l1: StdMutex::new(LruCache::new(capacity)),
            locks: DashMap::new(),
            cache,
            db,
            config,
        }
    }

    fn cache_key(user_id: &str) -> String {
        format!("context:{user_id}")
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn l1_get(&self, user_id: &str) -> Option<ConversationContext> {
        let mut l1 = self.l1.lock().expect("l1 lock poisoned");
        if let Some(entry) = l1.get(user_id) {
            if entry.cached_at.elapsed() < self.config.l1_freshness {
                return Some(entry.ctx.clone());
            }
        }
        None
    }

    fn l1_put(&self, ctx: &ConversationContext) {
        let mut l1 = self.l1.lock().expect("l1 lock poisoned");
        l1.put(
            ctx.user_id.clone(),
            CachedContext {
                ctx: ctx.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    async fn l2_put(&self, ctx: &ConversationContext) {
        let json = match serde_json::to_string(ctx) {
            Ok(json) => json,
            Err(e) => {
                debug!(error = %e, "context cache serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .cache
            .set_ex(&Self::cache_key(&ctx.user_id), &json, self.config.l2_ttl)
            .await
        {
            debug!(error = %e, user_id = %ctx.user_id, "L2 write skipped");
        }
    }

    /// Fetch a user's context, walking L1 -> L2 -> L3. Unknown users get a
    /// fresh context with no side effects until the first `update`.
    pub async fn get(&self, user_id: &str) -> Result<ConversationContext, CauceError> {
        if let Some(ctx) = self.l1_get(user_id) {
            return Ok(ctx);
        }

        match self.cache.get(&Self::cache_key(user_id)).await {
            Ok(Some(json)) => {
                if let Ok(ctx) = serde_json::from_str::<ConversationContext>(&json) {
                    self.l1_put(&ctx);
                    return Ok(ctx);
                }
                debug!(user_id, "discarding unparseable L2 entry");
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, user_id, "L2 read skipped"),
        }

        if let Some(ctx) = contexts::get(&self.db, user_id).await? {
            self.l2_put(&ctx).await;
            self.l1_put(&ctx);
            return Ok(ctx);
        }

        Ok(ConversationContext::new(user_id))
    }

    /// Read-modify-write under the per-user mutex. The mutated context's
    /// `last_interaction` is refreshed, L3 is written synchronously, and
    /// the upper tiers best-effort.
    pub async fn update<F>(
        &self,
        user_id: &str,
        mutator: F,
    ) -> Result<ConversationContext, CauceError>
    where
        F: FnOnce(&mut ConversationContext),
    {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut ctx = self.get(user_id).await?;
        mutator(&mut ctx);
        ctx.last_interaction = chrono::Utc::now();

        // L3 is the source of truth; its failure fails the dispatch.
        contexts::upsert(&self.db, &ctx).await?;

        self.l2_put(&ctx).await;
        self.l1_put(&ctx);
        Ok(ctx)
    }

    /// Refresh `last_interaction` without other changes.
    pub async fn touch(&self, user_id: &str) -> Result<(), CauceError> {
        self.update(user_id, |_| {}).await?;
        Ok(())
    }
}
