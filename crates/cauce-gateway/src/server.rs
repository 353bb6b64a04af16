// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway HTTP server built on axum.
//!
//! Sets up routes and shared state: transport webhooks, the synchronous
//! test endpoint, admin controls for the bot-state gate and the follow-up
//! scheduler, and the public health/metrics endpoints.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use cauce_cache::KeyValueCache;
use cauce_context::ContextStore;
use cauce_core::{CauceError, ReplyEngine};
use cauce_dispatch::{BotStateGate, IntakePipeline, PriorityQueue, SupervisoryHandler, WorkerPool};
use cauce_followup::FollowUpScheduler;
use cauce_metrics::PrometheusRecorder;
use cauce_storage::Database;
use cauce_transport::OutboundRouter;

use crate::handlers;

/// Shared state for axum request handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub pipeline: Arc<IntakePipeline>,
    pub supervisor: Arc<SupervisoryHandler>,
    pub gate: Arc<BotStateGate>,
    pub followups: Arc<FollowUpScheduler>,
    pub queue: Arc<PriorityQueue>,
    pub contexts: Arc<ContextStore>,
    pub engine: Arc<dyn ReplyEngine>,
    pub pool: Arc<WorkerPool>,
    pub router: Arc<OutboundRouter>,
    pub db: Database,
    pub cache: Arc<dyn KeyValueCache>,
    /// Absent when the recorder failed to install (tests, double init).
    pub recorder: Option<Arc<PrometheusRecorder>>,
}

/// Build the gateway router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        // Transport webhooks.
        .route("/webhook/whatsapp", post(handlers::webhook_whatsapp))
        .route("/webhook/chatwoot", post(handlers::webhook_chatwoot))
        // Synchronous test surface.
        .route("/test/message", post(handlers::test_message))
        // Observability.
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/queue/stats", get(handlers::queue_stats))
        // Bot-state admin.
        .route("/bot/status/{user_id}", get(handlers::bot_status))
        .route("/bot/pause/{user_id}", post(handlers::bot_pause))
        .route("/bot/resume/{user_id}", post(handlers::bot_resume))
        .route("/bot/resume-all", post(handlers::bot_resume_all))
        // Follow-up admin.
        .route("/followup/activate/{user_id}", post(handlers::followup_activate))
        .route(
            "/followup/deactivate/{user_id}",
            post(handlers::followup_deactivate),
        )
        .route("/followup/status/{user_id}", get(handlers::followup_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the task is aborted.
pub async fn start_server(host: &str, port: u16, state: GatewayState) -> Result<(), CauceError> {
    let app = router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CauceError::Internal(format!("failed to bind gateway to {addr}: {e}")))?;

    tracing::info!("gateway listening on {addr}");

    axum::serve(listener, app)
        .await
        .map_err(|e| CauceError::Internal(format!("gateway server error: {e}")))?;
    Ok(())
}
