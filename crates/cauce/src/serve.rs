// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `cauce serve` command implementation.
//!
//! Constructs the whole pipeline at startup with explicit lifecycle: durable
//! storage with crash recovery, the shared cache (Redis or the in-process
//! fallback), transports, the context store, the bot-state gate, the
//! priority queue, the worker pool, the follow-up scheduler, and the HTTP
//! gateway. Shutdown drains in-flight work; pending items stay durable for
//! the next process instance.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use cauce_agent::AgentClient;
use cauce_cache::{KeyValueCache, MemoryCache, RedisCache};
use cauce_config::CauceConfig;
use cauce_context::{ContextStore, ContextStoreConfig};
use cauce_core::{ActivityObserver, CauceError, ReplyEngine, TransportSender};
use cauce_dispatch::{
    AdmissionConfig, AdmissionControl, BotStateGate, BurstBuffer, BurstConfig, CircuitBreaker,
    IntakePipeline, PoolConfig, PriorityQueue, QueueSink, SupervisoryHandler, WorkerContext,
    WorkerPool,
};
use cauce_followup::{FollowUpScheduler, ScheduleWindow, SchedulerConfig};
use cauce_gateway::GatewayState;
use cauce_metrics::PrometheusRecorder;
use cauce_storage::Database;
use cauce_transport::{ChatwootTransport, OutboundRouter, WhatsAppTransport};

use crate::shutdown;

/// Initialize the tracing subscriber from the configured level.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cauce={log_level},info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Build the configured transports and the outbound router.
fn build_router(config: &CauceConfig) -> Result<Arc<OutboundRouter>, CauceError> {
    let timeout = Duration::from_secs(config.dispatch.transport_timeout_secs);

    let whatsapp = if config.whatsapp.enabled {
        let base_url = config
            .whatsapp
            .base_url
            .as_deref()
            .ok_or_else(|| CauceError::Config("whatsapp.base_url is required".into()))?;
        let api_key = config
            .whatsapp
            .api_key
            .as_deref()
            .ok_or_else(|| CauceError::Config("whatsapp.api_key is required".into()))?;
        Some(Arc::new(WhatsAppTransport::new(
            base_url,
            &config.whatsapp.instance,
            api_key,
            timeout,
        )?))
    } else {
        None
    };

    let chatwoot = if config.chatwoot.enabled {
        let base_url = config
            .chatwoot
            .base_url
            .as_deref()
            .ok_or_else(|| CauceError::Config("chatwoot.base_url is required".into()))?;
        let account_id = config
            .chatwoot
            .account_id
            .ok_or_else(|| CauceError::Config("chatwoot.account_id is required".into()))?;
        let api_token = config
            .chatwoot
            .api_token
            .as_deref()
            .ok_or_else(|| CauceError::Config("chatwoot.api_token is required".into()))?;
        Some(Arc::new(ChatwootTransport::new(
            base_url, account_id, api_token, timeout,
        )?))
    } else {
        None
    };

    if whatsapp.is_none() && chatwoot.is_none() {
        warn!("no transport enabled; only the test endpoint can dispatch");
    }

    Ok(Arc::new(OutboundRouter::new(whatsapp, chatwoot)))
}

/// Runs the `cauce serve` command until a shutdown signal arrives.
pub async fn run_serve(config: CauceConfig) -> Result<(), CauceError> {
    init_tracing(&config.agent.log_level);
    info!("starting cauce serve");

    let recorder = match PrometheusRecorder::install() {
        Ok(recorder) => Some(Arc::new(recorder)),
        Err(e) => {
            warn!(error = %e, "metrics recorder unavailable, continuing without");
            None
        }
    };

    // Durable storage with migrations.
    let db = Database::open(&config.storage.database_path).await?;

    // Shared cache: Redis when configured, in-process fallback otherwise.
    let cache: Arc<dyn KeyValueCache> = match &config.cache.url {
        Some(url) => match RedisCache::connect(url).await {
            Ok(redis) => Arc::new(redis),
            Err(e) => {
                warn!(error = %e, "redis unavailable, degrading to in-process cache");
                Arc::new(MemoryCache::new())
            }
        },
        None => Arc::new(MemoryCache::new()),
    };

    let router = build_router(&config)?;

    let contexts = Arc::new(ContextStore::new(
        db.clone(),
        cache.clone(),
        ContextStoreConfig {
            l2_ttl: Duration::from_secs(config.cache.ttl_secs),
            ..ContextStoreConfig::default()
        },
    ));
    let gate = Arc::new(BotStateGate::new(cache.clone(), db.clone()));

    // Queue with crash recovery.
    let queue = Arc::new(PriorityQueue::new(db.clone(), config.dispatch.max_attempts));
    let (restored, reloaded) = queue
        .recover(Duration::from_secs(config.dispatch.liveness_threshold_secs))
        .await?;
    if restored > 0 || reloaded > 0 {
        info!(restored, reloaded, "queue crash recovery complete");
    }

    // Follow-up scheduler.
    let tz = chrono_tz::Tz::from_str(&config.followup.timezone)
        .map_err(|_| CauceError::Config(format!("unknown timezone {}", config.followup.timezone)))?;
    let window = ScheduleWindow {
        start_hour: config.followup.start_hour,
        end_hour: config.followup.end_hour,
        allowed_weekdays: config.followup.allowed_weekdays.clone(),
        tz,
    };
    let followups = Arc::new(FollowUpScheduler::new(
        db.clone(),
        gate.clone(),
        router.clone() as Arc<dyn TransportSender>,
        contexts.clone(),
        window,
        SchedulerConfig {
            enabled: config.followup.enabled,
            daily_cap: config.followup.daily_cap,
            tick: Duration::from_secs(config.followup.tick_secs.min(60)),
            migration_mode_until: config.followup.migration_mode_until,
            maintenance_enabled: config.followup.maintenance_enabled,
            max_attempts: config.dispatch.max_attempts,
        },
    ));
    followups.reconcile().await?;

    // Agent runtime.
    let api_key = config.agent.api_key.as_deref().ok_or_else(|| {
        CauceError::Config("agent.api_key is required (set CAUCE_AGENT_API_KEY)".into())
    })?;
    let engine: Arc<dyn ReplyEngine> = Arc::new(AgentClient::new(
        api_key,
        &config.agent.base_url,
        &config.agent.model,
        &config.agent.system_prompt,
        Duration::from_secs(config.agent.timeout_secs),
    )?);

    // Worker pool.
    let worker_ctx = Arc::new(WorkerContext {
        queue: queue.clone(),
        contexts: contexts.clone(),
        gate: gate.clone(),
        engine: engine.clone(),
        sender: router.clone() as Arc<dyn TransportSender>,
        breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
        observer: followups.clone() as Arc<dyn ActivityObserver>,
        agent_timeout: Duration::from_secs(config.agent.timeout_secs),
    });
    let pool = Arc::new(WorkerPool::new(
        worker_ctx,
        PoolConfig {
            min_workers: config.dispatch.worker_min,
            max_workers: config.dispatch.worker_max,
            target_latency: Duration::from_secs(config.dispatch.target_latency_secs),
            scale_interval: Duration::from_secs(config.dispatch.scale_interval_secs),
            scale_cooldown: Duration::from_secs(config.dispatch.scale_cooldown_secs),
            drain_timeout: Duration::from_secs(config.dispatch.drain_timeout_secs),
        },
    ));

    let cancel = shutdown::install_signal_handler();
    pool.start(cancel.clone()).await;

    {
        let followups = followups.clone();
        let ticker_cancel = cancel.clone();
        tokio::spawn(async move {
            followups.run(ticker_cancel).await;
        });
    }

    // Intake pipeline.
    let admission = AdmissionControl::new(
        AdmissionConfig {
            per_user_per_min: config.rate.per_user_per_min,
            per_ip_per_min: config.rate.per_ip_per_min,
            global_per_min: config.rate.global_per_min,
            dedup_ttl: Duration::from_secs(config.rate.dedup_ttl_secs),
            queue_soft_cap: config.dispatch.queue_soft_cap,
        },
        db.clone(),
    );
    let sink = Arc::new(QueueSink::new(queue.clone(), contexts.clone()));
    let burst = Arc::new(BurstBuffer::new(
        BurstConfig::from_window(
            Duration::from_millis(config.dispatch.coalesce_window_ms),
            config.dispatch.max_burst_messages,
        ),
        sink,
    ));
    let pipeline = Arc::new(IntakePipeline::new(
        admission,
        burst.clone(),
        queue.clone(),
        contexts.clone(),
        followups.clone() as Arc<dyn ActivityObserver>,
        router.clone(),
    ));
    let supervisor = Arc::new(SupervisoryHandler::new(
        gate.clone(),
        router.clone() as Arc<dyn TransportSender>,
    ));

    // HTTP gateway.
    let state = GatewayState {
        pipeline,
        supervisor,
        gate,
        followups,
        queue,
        contexts,
        engine,
        pool: pool.clone(),
        router,
        db: db.clone(),
        cache,
        recorder,
    };
    let host = config.gateway.host.clone();
    let port = config.gateway.port;
    let server = tokio::spawn(async move {
        if let Err(e) = cauce_gateway::start_server(&host, port, state).await {
            tracing::error!(error = %e, "gateway exited");
        }
    });

    info!("cauce serve ready");
    cancel.cancelled().await;

    // Drain: coalesce buffers into the durable queue, stop workers, close.
    info!("shutting down");
    burst.flush_all().await;
    pool.shutdown().await;
    server.abort();
    db.close().await?;
    info!("shutdown complete");
    Ok(())
}
