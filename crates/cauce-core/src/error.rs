// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Cauce dispatcher.

use thiserror::Error;

/// The primary error type used across all Cauce crates.
///
/// Admission rejections (`RateLimited`, `Duplicate`, `BadRequest`) are
/// answered with HTTP 200 and a reason so transports do not retry. Worker
/// failures are classified transient or permanent: transient errors go back
/// through the queue with backoff, permanent ones dead-letter the item.
#[derive(Debug, Error)]
pub enum CauceError {
    /// Configuration errors (invalid TOML, missing required fields).
    #[error("configuration error: {0}")]
    Config(String),

    /// Durable store errors (connection, query, serialization). Always
    /// treated as transient by the dispatch path.
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Shared cache unavailable. The system degrades to L1+L3 without
    /// surfacing this to callers.
    #[error("cache unavailable: {0}")]
    Cache(String),

    /// Transport errors. `transient` distinguishes 5xx/timeouts (retry via
    /// queue) from 4xx (dead-letter).
    #[error("transport error: {message}")]
    Transport { message: String, transient: bool },

    /// Agent runtime errors from `ReplyEngine::infer_reply`.
    #[error("agent error: {message}")]
    Agent { message: String, transient: bool },

    /// Request rejected by a rate bucket.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Duplicate `(user, message_hash)` within the dedup window.
    #[error("duplicate message")]
    Duplicate,

    /// Malformed or empty inbound payload.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The bot is paused for this user; dispatch short-circuits as success.
    #[error("bot paused for user {0}")]
    Paused(String),

    /// A deadline elapsed before the operation completed.
    #[error("deadline exceeded after {duration:?}")]
    DeadlineExceeded { duration: std::time::Duration },

    /// The circuit breaker around the agent is open.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CauceError {
    /// Whether a retry through the queue may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CauceError::Storage { .. }
            | CauceError::Cache(_)
            | CauceError::DeadlineExceeded { .. }
            | CauceError::CircuitOpen => true,
            CauceError::Transport { transient, .. } | CauceError::Agent { transient, .. } => {
                *transient
            }
            _ => false,
        }
    }
}
