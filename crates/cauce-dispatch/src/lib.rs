// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dispatch pipeline: admission, burst coalescing, priority queueing,
//! and the worker pool, plus the bot-state gate and supervisory handling.
//!
//! [`IntakePipeline`] is the front door the gateway hands admitted webhook
//! messages to; everything downstream of it is asynchronous.

pub mod admission;
pub mod breaker;
pub mod burst;
pub mod gate;
pub mod pool;
pub mod queue;
pub mod supervisor;
pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use cauce_context::ContextStore;
use cauce_core::{ActivityObserver, CauceError, InboundMessage, Priority};
use cauce_transport::OutboundRouter;

pub use admission::{AdmissionConfig, AdmissionControl};
pub use breaker::CircuitBreaker;
pub use burst::{BurstBuffer, BurstConfig, BurstSink};
pub use gate::{BotStateGate, DEFAULT_PAUSE_TTL};
pub use pool::{PoolConfig, WorkerPool};
pub use queue::{AckOutcome, AckResult, PriorityQueue, QueueStatsSnapshot};
pub use supervisor::SupervisoryHandler;
pub use worker::{Worker, WorkerContext, WorkerMetrics};

/// Content keywords that raise a message to HIGH priority.
const HIGH_KEYWORDS: [&str; 6] = [
    "urgente",
    "problema",
    "reclamo",
    "error",
    "no funciona",
    "ayuda",
];

/// Short greetings queue as LOW.
const GREETING_KEYWORDS: [&str; 4] = ["hola", "buenas", "buen dia", "buenos dias"];

/// Assign a priority from content and user standing: VIP users are URGENT,
/// complaint keywords HIGH, bare greetings LOW, everything else NORMAL.
pub fn classify_priority(text: &str, is_vip: bool) -> Priority {
    if is_vip {
        return Priority::Urgent;
    }
    let lower = text.to_lowercase();
    if HIGH_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Priority::High;
    }
    if lower.split_whitespace().count() <= 3 && GREETING_KEYWORDS.iter().any(|k| lower.contains(k))
    {
        return Priority::Low;
    }
    Priority::Normal
}

/// Burst sink that classifies and submits coalesced messages to the queue.
pub struct QueueSink {
    queue: Arc<PriorityQueue>,
    contexts: Arc<ContextStore>,
}

impl QueueSink {
    pub fn new(queue: Arc<PriorityQueue>, contexts: Arc<ContextStore>) -> Self {
        Self { queue, contexts }
    }
}

#[async_trait]
impl BurstSink for QueueSink {
    async fn deliver(&self, msg: InboundMessage) {
        let is_vip = self
            .contexts
            .get(&msg.user_id)
            .await
            .map(|ctx| ctx.profile.is_vip)
            .unwrap_or(false);
        let priority = classify_priority(&msg.text, is_vip);

        match self.queue.submit(msg, priority).await {
            Ok(item) => info!(
                queue_id = %item.queue_id,
                user_id = %item.user_id,
                priority = %item.priority,
                "message queued"
            ),
            Err(CauceError::Duplicate) => {
                // The coalesced unit matched a recent hash; already handled.
            }
            Err(e) => error!(error = %e, "queue submit failed"),
        }
    }
}

/// The webhook-to-queue front door.
///
/// Admission runs synchronously so the gateway can answer with a reason;
/// everything after [`IntakePipeline::ingest`] returns is asynchronous.
pub struct IntakePipeline {
    admission: AdmissionControl,
    burst: Arc<BurstBuffer>,
    queue: Arc<PriorityQueue>,
    contexts: Arc<ContextStore>,
    observer: Arc<dyn ActivityObserver>,
    router: Arc<OutboundRouter>,
}

impl IntakePipeline {
    pub fn new(
        admission: AdmissionControl,
        burst: Arc<BurstBuffer>,
        queue: Arc<PriorityQueue>,
        contexts: Arc<ContextStore>,
        observer: Arc<dyn ActivityObserver>,
        router: Arc<OutboundRouter>,
    ) -> Self {
        Self {
            admission,
            burst,
            queue,
            contexts,
            observer,
            router,
        }
    }

    /// Admit an inbound message into the pipeline.
    ///
    /// On success the message is buffered for coalescing and the follow-up
    /// sequence is reset; the caller should answer the transport 200
    /// immediately. Rejections carry the reason.
    pub async fn ingest(&self, msg: InboundMessage, ip: Option<&str>) -> Result<(), CauceError> {
        let is_vip = self
            .contexts
            .get(&msg.user_id)
            .await
            .map(|ctx| ctx.profile.is_vip)
            .unwrap_or(false);

        let depth = self.queue.depth().await;
        if let Err(e) = self.admission.admit(&msg, ip, depth, is_vip).await {
            let reason = match &e {
                CauceError::Duplicate => "duplicate".to_string(),
                CauceError::RateLimited(r) => format!("rate:{r}"),
                CauceError::BadRequest(_) => "bad_request".to_string(),
                other => other.to_string(),
            };
            cauce_metrics::record_inbound_rejected(&reason);
            return Err(e);
        }
        cauce_metrics::record_inbound_admitted(&msg.source.to_string());

        if let Some(conversation_id) = &msg.conversation_id {
            self.router.link_conversation(&msg.user_id, conversation_id);
        }

        // Any user interaction rewinds the follow-up sequence to stage 0.
        self.observer.on_inbound(&msg.user_id).await;

        self.burst.enqueue(msg).await;
        Ok(())
    }

    /// Pending users in the burst buffer (health reporting).
    pub fn buffered_users(&self) -> usize {
        self.burst.pending_users()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vip_is_always_urgent() {
        assert_eq!(classify_priority("hola", true), Priority::Urgent);
    }

    #[test]
    fn complaint_keywords_are_high() {
        assert_eq!(
            classify_priority("tengo un problema con el pedido", false),
            Priority::High
        );
        assert_eq!(classify_priority("es urgente", false), Priority::High);
        assert_eq!(
            classify_priority("quiero hacer un reclamo", false),
            Priority::High
        );
    }

    #[test]
    fn short_greeting_is_low() {
        assert_eq!(classify_priority("hola", false), Priority::Low);
        assert_eq!(classify_priority("buenas tardes", false), Priority::Low);
    }

    #[test]
    fn greeting_inside_long_message_is_not_low() {
        assert_eq!(
            classify_priority("hola, quiero saber el precio de los anillos", false),
            Priority::Normal
        );
    }

    #[test]
    fn default_is_normal() {
        assert_eq!(
            classify_priority("tenes anillos de plata?", false),
            Priority::Normal
        );
    }
}
