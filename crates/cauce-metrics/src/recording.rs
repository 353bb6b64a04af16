// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Metric registration and recording helpers.
//!
//! Uses the metrics-rs facade so any recorder (Prometheus, statsd, etc.)
//! can collect these metrics.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Register all Cauce metric descriptions.
///
/// Called once at startup after the recorder is installed.
pub fn register_metrics() {
    describe_counter!("cauce_inbound_admitted_total", "Inbound messages admitted");
    describe_counter!(
        "cauce_inbound_rejected_total",
        "Inbound messages rejected, by reason"
    );
    describe_counter!("cauce_queue_submitted_total", "Items submitted, by priority");
    describe_counter!("cauce_queue_leased_total", "Items leased, by priority");
    describe_counter!(
        "cauce_queue_acked_total",
        "Items acknowledged, by priority and outcome"
    );
    describe_counter!(
        "cauce_transport_send_total",
        "Outbound sends, by transport and outcome"
    );
    describe_counter!(
        "cauce_worker_skipped_paused_total",
        "Items completed without dispatch because the bot was paused"
    );
    describe_counter!("cauce_followup_armed_total", "Follow-up sequences armed");
    describe_counter!("cauce_followup_fired_total", "Follow-ups sent, by stage");
    describe_counter!(
        "cauce_followup_skipped_total",
        "Follow-up sends skipped, by guard"
    );
    describe_gauge!("cauce_queue_depth", "Pending items across all levels");
    describe_gauge!("cauce_worker_pool_size", "Current worker count");
    describe_gauge!("cauce_worker_utilization", "Fraction of workers busy");
    describe_histogram!(
        "cauce_infer_reply_seconds",
        "Agent inference latency in seconds"
    );
    describe_histogram!(
        "cauce_dispatch_seconds",
        "Lease-to-ack latency in seconds"
    );
}

/// Record an admitted inbound message.
pub fn record_inbound_admitted(source: &str) {
    metrics::counter!("cauce_inbound_admitted_total", "source" => source.to_string()).increment(1);
}

/// Record a rejected inbound message.
pub fn record_inbound_rejected(reason: &str) {
    metrics::counter!("cauce_inbound_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record a queue submit.
pub fn record_queue_submitted(priority: &str) {
    metrics::counter!("cauce_queue_submitted_total", "priority" => priority.to_string())
        .increment(1);
}

/// Record a queue lease.
pub fn record_queue_leased(priority: &str) {
    metrics::counter!("cauce_queue_leased_total", "priority" => priority.to_string()).increment(1);
}

/// Record a queue ack.
pub fn record_queue_acked(priority: &str, outcome: &str) {
    metrics::counter!(
        "cauce_queue_acked_total",
        "priority" => priority.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an outbound transport send.
pub fn record_transport_send(transport: &str, ok: bool) {
    metrics::counter!(
        "cauce_transport_send_total",
        "transport" => transport.to_string(),
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record a dispatch skipped because the bot was paused.
pub fn record_worker_skipped_paused() {
    metrics::counter!("cauce_worker_skipped_paused_total").increment(1);
}

/// Record a follow-up sequence armed at stage 0.
pub fn record_followup_armed() {
    metrics::counter!("cauce_followup_armed_total").increment(1);
}

/// Record a follow-up sent.
pub fn record_followup_fired(stage: u8) {
    metrics::counter!("cauce_followup_fired_total", "stage" => stage.to_string()).increment(1);
}

/// Record a follow-up skipped by a guard.
pub fn record_followup_skipped(guard: &str) {
    metrics::counter!("cauce_followup_skipped_total", "guard" => guard.to_string()).increment(1);
}

/// Set the pending queue depth.
pub fn set_queue_depth(depth: f64) {
    metrics::gauge!("cauce_queue_depth").set(depth);
}

/// Set the current worker count.
pub fn set_worker_pool_size(count: f64) {
    metrics::gauge!("cauce_worker_pool_size").set(count);
}

/// Set the fraction of busy workers.
pub fn set_worker_utilization(fraction: f64) {
    metrics::gauge!("cauce_worker_utilization").set(fraction);
}

/// Record agent inference latency.
pub fn record_infer_latency(seconds: f64) {
    metrics::histogram!("cauce_infer_reply_seconds").record(seconds);
}

/// Record lease-to-ack latency.
pub fn record_dispatch_latency(seconds: f64) {
    metrics::histogram!("cauce_dispatch_seconds").record(seconds);
}
