// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Narrow capability traits at the seams of the pipeline.
//!
//! The worker pool calls [`ActivityObserver::on_user_activity`] after a
//! successful reply; the follow-up scheduler dispatches back through
//! [`TransportSender`]. Neither side holds a direct reference to the other,
//! which keeps the worker/scheduler dependency acyclic.

use async_trait::async_trait;

use crate::error::CauceError;
use crate::types::{ConversationContext, MessageSource};

/// Sends outbound text through the transport that owns the user.
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Deliver `text` to `user_id` on the given transport. Retries of
    /// transient transport failures happen inside the adapter; a returned
    /// error is already classified transient or permanent.
    async fn send_text(
        &self,
        user_id: &str,
        text: &str,
        source: MessageSource,
        conversation_id: Option<&str>,
    ) -> Result<(), CauceError>;
}

/// The AI agent runtime, reduced to the single call the pipeline needs.
#[async_trait]
pub trait ReplyEngine: Send + Sync {
    /// Produce a reply for `text` given the user's conversation context.
    async fn infer_reply(
        &self,
        ctx: &ConversationContext,
        text: &str,
    ) -> Result<String, CauceError>;
}

/// Mediator interface between the dispatch path and the follow-up scheduler.
#[async_trait]
pub trait ActivityObserver: Send + Sync {
    /// Called after every successfully dispatched reply; rearms the
    /// follow-up sequence at stage 0 from a fresh context snapshot.
    async fn on_user_activity(&self, user_id: &str, ctx: &ConversationContext);

    /// Called on every admitted inbound message; cancels all pending
    /// follow-up jobs for the user (stage-0 reset).
    async fn on_inbound(&self, user_id: &str);
}
