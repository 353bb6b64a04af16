// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end pipeline scenarios: webhook intake through burst coalescing,
//! the priority queue, the worker pool, the bot-state gate, and the
//! follow-up scheduler, against a scripted reply engine and a recording
//! transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use cauce_cache::MemoryCache;
use cauce_context::{ContextStore, ContextStoreConfig};
use cauce_core::{
    ActivityObserver, CauceError, ContextSnapshot, ConversationContext, ConversationUpdate,
    InboundMessage, MessageSource, ReplyEngine, Role, SupervisoryEvent, TransportSender,
};
use cauce_dispatch::{
    AdmissionConfig, AdmissionControl, BotStateGate, BurstBuffer, BurstConfig, CircuitBreaker,
    IntakePipeline, PoolConfig, PriorityQueue, QueueSink, SupervisoryHandler, WorkerContext,
    WorkerPool,
};
use cauce_followup::{FollowUpScheduler, ScheduleWindow, SchedulerConfig};
use cauce_storage::{queries::followups, Database};
use cauce_transport::OutboundRouter;

struct ScriptedEngine {
    calls: AtomicUsize,
}

#[async_trait]
impl ReplyEngine for ScriptedEngine {
    async fn infer_reply(
        &self,
        _ctx: &ConversationContext,
        text: &str,
    ) -> Result<String, CauceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(format!("respuesta a: {text}"))
    }
}

#[derive(Default)]
struct RecordingTransport {
    sent: StdMutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportSender for RecordingTransport {
    async fn send_text(
        &self,
        user_id: &str,
        text: &str,
        _source: MessageSource,
        _conversation_id: Option<&str>,
    ) -> Result<(), CauceError> {
        self.sent
            .lock()
            .unwrap()
            .push((user_id.to_string(), text.to_string()));
        Ok(())
    }
}

struct Harness {
    pipeline: Arc<IntakePipeline>,
    supervisor: Arc<SupervisoryHandler>,
    gate: Arc<BotStateGate>,
    contexts: Arc<ContextStore>,
    followups: Arc<FollowUpScheduler>,
    queue: Arc<PriorityQueue>,
    transport: Arc<RecordingTransport>,
    engine: Arc<ScriptedEngine>,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    db: Database,
    _dir: tempfile::TempDir,
}

impl Harness {
    /// Coalescing window for tests; short so scenarios run fast.
    const WINDOW_MS: u64 = 200;

    async fn start() -> Self {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("e2e.db").to_str().unwrap())
            .await
            .unwrap();
        let cache: Arc<MemoryCache> = Arc::new(MemoryCache::new());

        let contexts = Arc::new(ContextStore::new(
            db.clone(),
            cache.clone(),
            ContextStoreConfig::default(),
        ));
        let gate = Arc::new(BotStateGate::new(cache.clone(), db.clone()));
        let queue = Arc::new(PriorityQueue::new(db.clone(), 3));
        let transport = Arc::new(RecordingTransport::default());
        let engine = Arc::new(ScriptedEngine {
            calls: AtomicUsize::new(0),
        });

        // Always-open window so scheduler behavior is time-of-day independent.
        let window = ScheduleWindow {
            start_hour: 0,
            end_hour: 24,
            allowed_weekdays: vec![1, 2, 3, 4, 5, 6, 7],
            tz: chrono_tz::America::Argentina::Cordoba,
        };
        let followups = Arc::new(FollowUpScheduler::new(
            db.clone(),
            gate.clone(),
            transport.clone() as Arc<dyn TransportSender>,
            contexts.clone(),
            window,
            SchedulerConfig {
                enabled: true,
                daily_cap: 1,
                tick: Duration::from_secs(30),
                migration_mode_until: None,
                maintenance_enabled: false,
                max_attempts: 3,
            },
        ));

        let worker_ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            contexts: contexts.clone(),
            gate: gate.clone(),
            engine: engine.clone(),
            sender: transport.clone() as Arc<dyn TransportSender>,
            breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
            observer: followups.clone() as Arc<dyn ActivityObserver>,
            agent_timeout: Duration::from_secs(5),
        });
        let pool = Arc::new(WorkerPool::new(
            worker_ctx,
            PoolConfig {
                min_workers: 2,
                max_workers: 4,
                target_latency: Duration::from_secs(10),
                scale_interval: Duration::from_secs(30),
                scale_cooldown: Duration::from_secs(30),
                drain_timeout: Duration::from_secs(5),
            },
        ));
        let cancel = CancellationToken::new();
        pool.start(cancel.clone()).await;

        let admission = AdmissionControl::new(
            AdmissionConfig {
                per_user_per_min: 50,
                per_ip_per_min: 100,
                global_per_min: 1000,
                dedup_ttl: Duration::from_secs(600),
                queue_soft_cap: 500,
            },
            db.clone(),
        );
        let sink = Arc::new(QueueSink::new(queue.clone(), contexts.clone()));
        let burst = Arc::new(BurstBuffer::new(
            BurstConfig::from_window(Duration::from_millis(Self::WINDOW_MS), 10),
            sink,
        ));
        let router = Arc::new(OutboundRouter::new(None, None));
        let pipeline = Arc::new(IntakePipeline::new(
            admission,
            burst,
            queue.clone(),
            contexts.clone(),
            followups.clone() as Arc<dyn ActivityObserver>,
            router,
        ));
        let supervisor = Arc::new(SupervisoryHandler::new(
            gate.clone(),
            transport.clone() as Arc<dyn TransportSender>,
        ));

        Harness {
            pipeline,
            supervisor,
            gate,
            contexts,
            followups,
            queue,
            transport,
            engine,
            pool,
            cancel,
            db,
            _dir: dir,
        }
    }

    fn message(user: &str, text: &str) -> InboundMessage {
        InboundMessage {
            user_id: user.to_string(),
            text: text.to_string(),
            source: MessageSource::Whatsapp,
            transport_message_id: format!("wamid.{}.{}", user, text.len()),
            conversation_id: None,
            arrived_at: Utc::now(),
            metadata: None,
        }
    }

    async fn ingest(&self, user: &str, text: &str) -> Result<(), CauceError> {
        self.pipeline.ingest(Self::message(user, text), None).await
    }

    /// Wait until the transport has recorded `n` sends or the deadline hits.
    async fn wait_for_sends(&self, n: usize) {
        for _ in 0..100 {
            if self.transport.sent().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Let the burst window elapse and the queue drain.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(Self::WINDOW_MS * 3)).await;
        for _ in 0..100 {
            if self.queue.depth().await == 0 && self.queue.in_flight().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.pool.shutdown().await;
    }
}

#[tokio::test]
async fn coalesce_burst_into_single_reply() {
    let h = Harness::start().await;

    // Three quick messages inside the window.
    h.ingest("5493515550001", "hola").await.unwrap();
    h.ingest("5493515550001", "tenes anillos?").await.unwrap();
    h.ingest("5493515550001", "de plata").await.unwrap();

    h.settle().await;
    h.wait_for_sends(1).await;

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1, "one coalesced reply expected");
    assert_eq!(sent[0].1, "respuesta a: hola\ntenes anillos?\nde plata");
    assert_eq!(h.engine.calls.load(Ordering::Relaxed), 1);

    // History grew by exactly one user and one assistant entry.
    let ctx = h.contexts.get("5493515550001").await.unwrap();
    assert_eq!(ctx.interaction_history.len(), 2);
    assert_eq!(ctx.interaction_history[0].role, Role::User);
    assert_eq!(
        ctx.interaction_history[0].text,
        "hola\ntenes anillos?\nde plata"
    );
    assert_eq!(ctx.interaction_history[1].role, Role::Assistant);

    h.stop().await;
}

#[tokio::test]
async fn pause_by_tag_suppresses_outbound() {
    let h = Harness::start().await;
    let user = "5493515550002";

    // Admin tags the conversation with bot-paused.
    h.supervisor
        .handle(SupervisoryEvent::ConversationUpdate(ConversationUpdate {
            user_id: user.into(),
            conversation_id: "42".into(),
            labels: vec!["bot-paused".into()],
            status: Some("open".into()),
            assignee_id: None,
        }))
        .await
        .unwrap();

    h.ingest(user, "precio?").await.unwrap();
    h.settle().await;

    // Admitted, queued, leased, completed without any outbound.
    assert_eq!(h.transport.sent().len(), 0);
    assert_eq!(h.engine.calls.load(Ordering::Relaxed), 0);
    assert_eq!(h.queue.depth().await, 0);

    h.stop().await;
}

#[tokio::test]
async fn force_activate_restores_normal_replies() {
    let h = Harness::start().await;
    let user = "5493515550003";

    h.gate
        .pause(user, "tag", "agent", Duration::from_secs(3600), false)
        .await
        .unwrap();

    // Admin adds bot-active; the gate must flip regardless of the pause.
    h.supervisor
        .handle(SupervisoryEvent::ConversationUpdate(ConversationUpdate {
            user_id: user.into(),
            conversation_id: "42".into(),
            labels: vec!["bot-active".into()],
            status: Some("open".into()),
            assignee_id: None,
        }))
        .await
        .unwrap();

    h.ingest(user, "sigo esperando el precio").await.unwrap();
    h.settle().await;
    h.wait_for_sends(1).await;

    assert_eq!(h.transport.sent().len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn followup_rearms_at_stage_zero_after_each_reply() {
    let h = Harness::start().await;
    let user = "5493515550004";

    h.ingest(user, "quiero ver el catalogo").await.unwrap();
    h.settle().await;
    h.wait_for_sends(1).await;

    // Stage 0 armed roughly one hour out after the reply.
    let pending = followups::pending_for_user(&h.db, user).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].stage, 0);
    let first_schedule = pending[0].scheduled_for;

    // A new inbound cancels the pending job before the next reply re-arms it.
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.ingest(user, "me olvide de preguntar el precio").await.unwrap();
    // Immediately after admission the old job is gone.
    let mid = followups::pending_for_user(&h.db, user).await.unwrap();
    assert!(
        mid.is_empty() || mid[0].scheduled_for > first_schedule,
        "stale stage-0 job must not survive a new inbound"
    );

    h.settle().await;
    h.wait_for_sends(2).await;

    let pending = followups::pending_for_user(&h.db, user).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].stage, 0);
    assert!(pending[0].scheduled_for >= first_schedule);

    h.stop().await;
}

#[tokio::test]
async fn followup_daily_cap_allows_single_send() {
    let h = Harness::start().await;
    let user = "5493515550005";

    h.ingest(user, "hola, me interesa el combo").await.unwrap();
    h.settle().await;
    h.wait_for_sends(1).await;
    let replies_before = h.transport.sent().len();

    // Make the armed stage-0 job due and run two dispatch passes.
    for job in followups::pending_for_user(&h.db, user).await.unwrap() {
        followups::reschedule(&h.db, job.id, Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
    }
    h.followups.process_due().await.unwrap();

    // The next stage became pending; force it due the same civil day.
    for job in followups::pending_for_user(&h.db, user).await.unwrap() {
        followups::reschedule(&h.db, job.id, Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
    }
    h.followups.process_due().await.unwrap();

    // Exactly one follow-up went out; the second was pushed to tomorrow.
    let followup_sends = h.transport.sent().len() - replies_before;
    assert_eq!(followup_sends, 1);
    let limit = followups::rate_limit_get(&h.db, user).await.unwrap().unwrap();
    assert_eq!(limit.daily_count, 1);

    h.stop().await;
}

#[tokio::test]
async fn duplicate_webhook_replay_yields_single_reply() {
    let h = Harness::start().await;
    let user = "5493515550006";

    h.ingest(user, "hay stock del combo?").await.unwrap();
    let second = h.ingest(user, "hay stock del combo?").await;
    let third = h.ingest(user, "hay stock del combo?").await;
    assert!(matches!(second, Err(CauceError::Duplicate)));
    assert!(matches!(third, Err(CauceError::Duplicate)));

    h.settle().await;
    h.wait_for_sends(1).await;

    assert_eq!(h.transport.sent().len(), 1);
    assert_eq!(h.engine.calls.load(Ordering::Relaxed), 1);

    h.stop().await;
}

#[tokio::test]
async fn context_snapshot_round_trips_through_followup_job() {
    let h = Harness::start().await;
    let user = "5493515550007";

    h.contexts
        .update(user, |ctx| {
            ctx.push_interaction(Role::User, "busco anillos de plata", Utc::now());
            ctx.profile.budget_mentioned = Some("$40.000".into());
        })
        .await
        .unwrap();
    let ctx = h.contexts.get(user).await.unwrap();
    h.followups.on_user_activity(user, &ctx).await;

    let pending = followups::pending_for_user(&h.db, user).await.unwrap();
    let snapshot: &ContextSnapshot = &pending[0].context_snapshot;
    assert_eq!(
        snapshot.last_user_message.as_deref(),
        Some("busco anillos de plata")
    );
    assert_eq!(snapshot.profile.budget_mentioned.as_deref(), Some("$40.000"));

    h.stop().await;
}
