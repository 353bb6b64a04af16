// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker main loop: lease, gate check, infer, dispatch, ack.
//!
//! The context write happens after a successful outbound send so a retried
//! item never double-appends history entries. Dispatch skipped for a paused
//! user still acks success, keeping the queue moving while a human owns the
//! conversation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cauce_context::ContextStore;
use cauce_core::{ActivityObserver, QueuedItem, ReplyEngine, Role, TransportSender};

use crate::breaker::CircuitBreaker;
use crate::gate::BotStateGate;
use crate::queue::{AckOutcome, AckResult, PriorityQueue};

/// Fixed apology sent when an item dead-letters.
const DEAD_LETTER_APOLOGY: &str =
    "Disculpá, estoy experimentando dificultades técnicas. En cuanto se resuelva te respondo.";

/// Response-time samples kept per worker for p95 estimation.
const RESPONSE_TIME_SAMPLES: usize = 50;

/// Shared dependencies for every worker.
pub struct WorkerContext {
    pub queue: Arc<PriorityQueue>,
    pub contexts: Arc<ContextStore>,
    pub gate: Arc<BotStateGate>,
    pub engine: Arc<dyn ReplyEngine>,
    pub sender: Arc<dyn TransportSender>,
    pub breaker: Arc<CircuitBreaker>,
    pub observer: Arc<dyn ActivityObserver>,
    /// Deadline for one agent call.
    pub agent_timeout: Duration,
}

/// Per-worker performance counters, read by the scaling supervisor.
pub struct WorkerMetrics {
    pub busy: AtomicBool,
    pub processed: AtomicU64,
    pub errors: AtomicU64,
    response_times: StdMutex<VecDeque<f64>>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            response_times: StdMutex::new(VecDeque::new()),
        }
    }

    fn record_response_time(&self, seconds: f64) {
        let mut times = self.response_times.lock().expect("metrics lock poisoned");
        times.push_back(seconds);
        while times.len() > RESPONSE_TIME_SAMPLES {
            times.pop_front();
        }
    }

    /// Recent response-time samples.
    pub fn response_times(&self) -> Vec<f64> {
        self.response_times
            .lock()
            .expect("metrics lock poisoned")
            .iter()
            .copied()
            .collect()
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker in the pool.
pub struct Worker {
    id: String,
    deps: Arc<WorkerContext>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    pub fn new(id: String, deps: Arc<WorkerContext>, metrics: Arc<WorkerMetrics>) -> Self {
        Self { id, deps, metrics }
    }

    /// Main loop; returns when the token is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker = %self.id, "worker started");
        loop {
            let Some(item) = self.deps.queue.lease_waiting(&self.id, &cancel).await else {
                break;
            };

            self.metrics.busy.store(true, Ordering::Relaxed);
            let started = Instant::now();

            let outcome = self.process(&item).await;
            let failed = matches!(
                outcome,
                AckOutcome::RetriableFailure(_) | AckOutcome::PermanentFailure(_)
            );

            match self.deps.queue.ack(&item.queue_id, outcome).await {
                Ok(AckResult::DeadLettered) => self.send_apology(&item).await,
                Ok(_) => {}
                Err(e) => error!(worker = %self.id, error = %e, "ack failed"),
            }

            let elapsed = started.elapsed().as_secs_f64();
            self.metrics.record_response_time(elapsed);
            self.metrics.processed.fetch_add(1, Ordering::Relaxed);
            if failed {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            }
            cauce_metrics::record_dispatch_latency(elapsed);
            self.metrics.busy.store(false, Ordering::Relaxed);
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// Process one leased item end to end.
    async fn process(&self, item: &QueuedItem) -> AckOutcome {
        let user_id = &item.user_id;

        let ctx = match self.deps.contexts.get(user_id).await {
            Ok(ctx) => ctx,
            Err(e) => return AckOutcome::RetriableFailure(format!("context read: {e}")),
        };

        if self.deps.gate.is_paused(user_id).await {
            debug!(user_id, "dispatch skipped: bot paused");
            cauce_metrics::record_worker_skipped_paused();
            return AckOutcome::Skipped;
        }

        if self.deps.breaker.try_acquire().is_err() {
            return AckOutcome::RetriableFailure("circuit breaker open".into());
        }

        let infer_started = Instant::now();
        let reply = match tokio::time::timeout(
            self.deps.agent_timeout,
            self.deps.engine.infer_reply(&ctx, &item.message.text),
        )
        .await
        {
            Err(_) => {
                self.deps.breaker.on_failure();
                return AckOutcome::RetriableFailure(format!(
                    "agent deadline exceeded after {:?}",
                    self.deps.agent_timeout
                ));
            }
            Ok(Err(e)) => {
                self.deps.breaker.on_failure();
                return if e.is_transient() {
                    AckOutcome::RetriableFailure(format!("agent: {e}"))
                } else {
                    AckOutcome::PermanentFailure(format!("agent: {e}"))
                };
            }
            Ok(Ok(reply)) => {
                self.deps.breaker.on_success();
                cauce_metrics::record_infer_latency(infer_started.elapsed().as_secs_f64());
                reply
            }
        };

        if let Err(e) = self
            .deps
            .sender
            .send_text(
                user_id,
                &reply,
                item.message.source,
                item.message.conversation_id.as_deref(),
            )
            .await
        {
            return if e.is_transient() {
                AckOutcome::RetriableFailure(format!("transport: {e}"))
            } else {
                AckOutcome::PermanentFailure(format!("transport: {e}"))
            };
        }

        // History grows only after the user actually got the reply, so a
        // retried item never double-appends.
        let user_text = item.message.text.clone();
        let reply_text = reply.clone();
        let arrived = item.message.arrived_at;
        let source = item.message.source;
        let updated = match self
            .deps
            .contexts
            .update(user_id, move |ctx| {
                ctx.push_interaction(Role::User, &user_text, arrived);
                ctx.push_interaction(Role::Assistant, &reply_text, chrono::Utc::now());
                ctx.last_source = source;
            })
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(user_id, error = %e, "context write failed after send");
                return AckOutcome::RetriableFailure(format!("context write: {e}"));
            }
        };

        self.deps.observer.on_user_activity(user_id, &updated).await;
        AckOutcome::Success
    }

    async fn send_apology(&self, item: &QueuedItem) {
        if let Err(e) = self
            .deps
            .sender
            .send_text(
                &item.user_id,
                DEAD_LETTER_APOLOGY,
                item.message.source,
                item.message.conversation_id.as_deref(),
            )
            .await
        {
            warn!(user_id = %item.user_id, error = %e, "apology send failed");
        }
    }
}
