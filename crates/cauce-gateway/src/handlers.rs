// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP request handlers for the gateway.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use cauce_core::{CauceError, Role, WebhookEvent};
use cauce_transport::{chatwoot, whatsapp};

use crate::server::GatewayState;

/// Client IP as reported by the proxy in front of the gateway.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Map an admission outcome to the 200-with-reason webhook contract.
fn intake_response(result: Result<(), CauceError>) -> Json<serde_json::Value> {
    match result {
        Ok(()) => Json(json!({ "status": "accepted" })),
        Err(CauceError::Duplicate) => {
            Json(json!({ "status": "ignored", "reason": "duplicate" }))
        }
        Err(CauceError::RateLimited(reason)) => {
            Json(json!({ "status": "ignored", "reason": format!("rate_limited:{reason}") }))
        }
        Err(CauceError::BadRequest(reason)) => {
            Json(json!({ "status": "ignored", "reason": reason }))
        }
        Err(e) => {
            // Storage or internal trouble: the transport must not retry; the
            // durable queue never saw the message, so the user will resend.
            error!(error = %e, "intake failed");
            Json(json!({ "status": "ignored", "reason": "internal" }))
        }
    }
}

/// POST /webhook/whatsapp
pub async fn webhook_whatsapp(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    match whatsapp::parse_webhook(&payload) {
        WebhookEvent::Inbound(msg) => {
            let ip = client_ip(&headers);
            intake_response(state.pipeline.ingest(msg, ip.as_deref()).await)
        }
        WebhookEvent::Supervisory(event) => {
            if let Err(e) = state.supervisor.handle(event).await {
                error!(error = %e, "supervisory event failed");
            }
            Json(json!({ "status": "accepted" }))
        }
        WebhookEvent::Ignored { reason } => Json(json!({ "status": "ignored", "reason": reason })),
    }
}

/// POST /webhook/chatwoot
pub async fn webhook_chatwoot(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    match chatwoot::parse_webhook(&payload) {
        WebhookEvent::Inbound(msg) => {
            let ip = client_ip(&headers);
            intake_response(state.pipeline.ingest(msg, ip.as_deref()).await)
        }
        WebhookEvent::Supervisory(event) => {
            if let Err(e) = state.supervisor.handle(event).await {
                error!(error = %e, "supervisory event failed");
            }
            Json(json!({ "status": "accepted" }))
        }
        WebhookEvent::Ignored { reason } => Json(json!({ "status": "ignored", "reason": reason })),
    }
}

/// Request body for POST /test/message.
#[derive(Debug, Deserialize)]
pub struct TestMessageRequest {
    pub user_id: String,
    pub message: String,
}

/// POST /test/message
///
/// Synchronous path for the testing UI: no queue, no burst buffer, but the
/// same context and gate semantics as the worker.
pub async fn test_message(
    State(state): State<GatewayState>,
    Json(body): Json<TestMessageRequest>,
) -> Response {
    if body.user_id.is_empty() || body.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "user_id and message are required" })),
        )
            .into_response();
    }

    if state.gate.is_paused(&body.user_id).await {
        return Json(json!({ "response": null, "status": "paused" })).into_response();
    }

    let ctx = match state.contexts.get(&body.user_id).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "test message context read failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "context store unavailable" })),
            )
                .into_response();
        }
    };

    let reply = match state.engine.infer_reply(&ctx, &body.message).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(error = %e, "test message inference failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let user_text = body.message.clone();
    let reply_text = reply.clone();
    if let Err(e) = state
        .contexts
        .update(&body.user_id, move |ctx| {
            ctx.push_interaction(Role::User, &user_text, chrono::Utc::now());
            ctx.push_interaction(Role::Assistant, &reply_text, chrono::Utc::now());
            ctx.last_source = cauce_core::MessageSource::Test;
        })
        .await
    {
        error!(error = %e, "test message context write failed");
    }

    Json(json!({ "response": reply })).into_response()
}

/// GET /health
pub async fn health(State(state): State<GatewayState>) -> Response {
    let storage_ok = state.db.ping().await.is_ok();
    let cache_ok = state.cache.ping().await.is_ok();
    let queue_depth = state.queue.depth().await;
    let workers = state.pool.size().await;
    let utilization = state.pool.utilization().await;

    // The cache is optional by design; only storage and workers gate health.
    let healthy = storage_ok && workers > 0;
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "components": {
            "storage": storage_ok,
            "cache": cache_ok,
            "transports": {
                "whatsapp": state.router.has_whatsapp(),
                "chatwoot": state.router.has_chatwoot(),
            },
            "worker_pool": { "size": workers, "utilization": utilization },
            "queue": { "depth": queue_depth, "buffered_users": state.pipeline.buffered_users() },
        },
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

/// GET /metrics
pub async fn metrics(State(state): State<GatewayState>) -> Response {
    match &state.recorder {
        Some(recorder) => recorder.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /queue/stats
pub async fn queue_stats(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let stats = state.queue.stats().await;
    Json(serde_json::to_value(&stats).unwrap_or_else(|_| json!({})))
}

/// GET /bot/status/{user_id}
pub async fn bot_status(
    State(state): State<GatewayState>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    match state.gate.state(&user_id).await {
        Some(bot_state) => Json(json!({
            "user_id": user_id,
            "active": !bot_state.paused,
            "reason": bot_state.reason,
            "set_by": bot_state.set_by,
            "paused_at": bot_state.paused_at.to_rfc3339(),
            "expires_at": bot_state.expires_at.to_rfc3339(),
        })),
        None => Json(json!({ "user_id": user_id, "active": true })),
    }
}

/// Query parameters for POST /bot/pause/{user_id}.
#[derive(Debug, Deserialize)]
pub struct PauseParams {
    #[serde(default)]
    pub reason: Option<String>,
    /// TTL in seconds.
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// POST /bot/pause/{user_id}
pub async fn bot_pause(
    State(state): State<GatewayState>,
    Path(user_id): Path<String>,
    Query(params): Query<PauseParams>,
) -> Response {
    let reason = params.reason.unwrap_or_else(|| "manual".to_string());
    let ttl = std::time::Duration::from_secs(params.ttl.unwrap_or(86_400));
    // The operator API overrides force-active markers.
    match state.gate.pause(&user_id, &reason, "operator", ttl, true).await {
        Ok(_) => Json(json!({ "status": "paused", "user_id": user_id })).into_response(),
        Err(e) => admin_error(e),
    }
}

/// POST /bot/resume/{user_id}
pub async fn bot_resume(
    State(state): State<GatewayState>,
    Path(user_id): Path<String>,
) -> Response {
    match state.gate.resume(&user_id).await {
        Ok(()) => Json(json!({ "status": "resumed", "user_id": user_id })).into_response(),
        Err(e) => admin_error(e),
    }
}

/// POST /bot/resume-all
pub async fn bot_resume_all(State(state): State<GatewayState>) -> Response {
    match state.gate.resume_all().await {
        Ok(count) => {
            info!(count, "resume-all requested");
            Json(json!({ "status": "resumed", "count": count })).into_response()
        }
        Err(e) => admin_error(e),
    }
}

/// POST /followup/activate/{user_id}
pub async fn followup_activate(
    State(state): State<GatewayState>,
    Path(user_id): Path<String>,
) -> Response {
    match state.followups.activate(&user_id).await {
        Ok(()) => Json(json!({ "status": "activated", "user_id": user_id })).into_response(),
        Err(e) => admin_error(e),
    }
}

/// POST /followup/deactivate/{user_id}
pub async fn followup_deactivate(
    State(state): State<GatewayState>,
    Path(user_id): Path<String>,
) -> Response {
    match state.followups.deactivate(&user_id, "operator").await {
        Ok(()) => Json(json!({ "status": "deactivated", "user_id": user_id })).into_response(),
        Err(e) => admin_error(e),
    }
}

/// GET /followup/status/{user_id}
pub async fn followup_status(
    State(state): State<GatewayState>,
    Path(user_id): Path<String>,
) -> Response {
    match state.followups.status(&user_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => admin_error(e),
    }
}

fn admin_error(e: CauceError) -> Response {
    error!(error = %e, "admin operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}
