// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared key-value cache (L2) behind a narrow trait.
//!
//! [`RedisCache`] is the production implementation. When no cache URL is
//! configured, [`MemoryCache`] stands in so the context store and bot-state
//! gate keep their TTL semantics; either way, cache failures degrade the
//! system to L1+L3 rather than surfacing errors to the dispatch path.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use tracing::debug;

use cauce_core::CauceError;

/// Minimal key-value cache surface used by the context store and the
/// bot-state gate.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// Fetch a value; `None` on miss or expiry.
    async fn get(&self, key: &str) -> Result<Option<String>, CauceError>;

    /// Store a value with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CauceError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CauceError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), CauceError>;
}

/// Deadline for a single cache operation; a slow cache must never stall the
/// dispatch path longer than this.
const CACHE_DEADLINE: Duration = Duration::from_secs(1);

/// Run a cache future under the shared deadline.
async fn with_deadline<T>(
    op: impl std::future::Future<Output = Result<T, CauceError>>,
) -> Result<T, CauceError> {
    tokio::time::timeout(CACHE_DEADLINE, op)
        .await
        .map_err(|_| CauceError::Cache(format!("cache deadline {CACHE_DEADLINE:?} exceeded")))?
}

/// Redis-backed cache using a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis at `url`. Fails fast so startup can log and fall
    /// back to the in-process cache.
    pub async fn connect(url: &str) -> Result<Self, CauceError> {
        let client = redis::Client::open(url)
            .map_err(|e| CauceError::Cache(format!("invalid redis url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CauceError::Cache(format!("redis connect failed: {e}")))?;
        debug!("redis cache connected");
        Ok(Self { manager })
    }
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CauceError> {
        let mut conn = self.manager.clone();
        with_deadline(async move {
            conn.get(key)
                .await
                .map_err(|e| CauceError::Cache(format!("redis get failed: {e}")))
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CauceError> {
        let mut conn = self.manager.clone();
        with_deadline(async move {
            conn.set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| CauceError::Cache(format!("redis set failed: {e}")))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CauceError> {
        let mut conn = self.manager.clone();
        with_deadline(async move {
            conn.del(key)
                .await
                .map_err(|e| CauceError::Cache(format!("redis del failed: {e}")))
        })
        .await
    }

    async fn ping(&self) -> Result<(), CauceError> {
        let mut conn = self.manager.clone();
        with_deadline(async move {
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| CauceError::Cache(format!("redis ping failed: {e}")))?;
            Ok(())
        })
        .await
    }
}

/// In-process TTL cache used when no shared cache is configured, and by
/// tests. Expired entries are dropped lazily on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CauceError> {
        if let Some(entry) = self.entries.get(key) {
            let (value, deadline) = entry.value().clone();
            if Instant::now() < deadline {
                return Ok(Some(value));
            }
        }
        self.entries.remove(key);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CauceError> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CauceError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CauceError> {
        Ok(())
    }
}
