// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The follow-up scheduler.
//!
//! Activation: after every successful reply, `on_user_activity` cancels any
//! pending jobs, snapshots the context, and arms stage 0 one hour out.
//! Reset: every admitted inbound message cancels all pending jobs; the
//! sequence rewinds to stage 0 on the next reply. Dispatch: a ticker selects
//! due jobs and runs the guard chain (blacklist, pause, window, daily cap,
//! recent activity) before sending; any guard failure reschedules to the
//! next valid window without advancing the stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cauce_context::ContextStore;
use cauce_core::{
    ActivityObserver, CauceError, ContextSnapshot, ConversationContext, FollowUpJob,
    TransportSender,
};
use cauce_dispatch::BotStateGate;
use cauce_storage::{queries::followups, Database};

use crate::stages::{offset_hours, ScheduleWindow, MAINTENANCE_INTERVAL_HOURS, TERMINAL_STAGE};
use crate::templates;

/// Jobs examined per tick.
const DISPATCH_BATCH: usize = 10;

/// Retry backoff base for failed sends.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Retry backoff cap for failed sends.
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Follow-ups allowed per user per civil day.
    pub daily_cap: u32,
    /// Ticker interval; must stay at or below 60 s.
    pub tick: Duration,
    /// While now is before this instant, failed jobs are never retried.
    pub migration_mode_until: Option<DateTime<Utc>>,
    /// Re-arm the terminal stage every 15 days after it fires.
    pub maintenance_enabled: bool,
    /// Send attempts before a job is left failed.
    pub max_attempts: u32,
}

/// Durable timer store of future outbound messages per user.
pub struct FollowUpScheduler {
    db: Database,
    gate: Arc<BotStateGate>,
    sender: Arc<dyn TransportSender>,
    contexts: Arc<ContextStore>,
    window: ScheduleWindow,
    config: SchedulerConfig,
}

impl FollowUpScheduler {
    pub fn new(
        db: Database,
        gate: Arc<BotStateGate>,
        sender: Arc<dyn TransportSender>,
        contexts: Arc<ContextStore>,
        window: ScheduleWindow,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            gate,
            sender,
            contexts,
            window,
            config,
        }
    }

    /// Whether migration mode suppresses failed-job retries right now.
    fn migration_active(&self, now: DateTime<Utc>) -> bool {
        self.config
            .migration_mode_until
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Startup reconciliation: repair jobs left mid-send and push overdue
    /// pending jobs into the next eligible window.
    pub async fn reconcile(&self) -> Result<(), CauceError> {
        let repaired = followups::repair_processing(&self.db).await?;
        if repaired > 0 {
            info!(repaired, "repaired in-flight follow-up jobs");
        }

        let now = Utc::now();
        let overdue = followups::select_due(&self.db, now, false, self.config.max_attempts, 500)
            .await?;
        for job in &overdue {
            let next = self.window.next_valid(now);
            if next > now {
                followups::reschedule(&self.db, job.id, next).await?;
            }
        }
        if !overdue.is_empty() {
            info!(count = overdue.len(), "reconciled overdue follow-up jobs");
        }
        Ok(())
    }

    /// Ticker loop; returns when cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("follow-up scheduler disabled by configuration");
            return;
        }
        info!(tick = ?self.config.tick, "follow-up scheduler started");
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            if let Err(e) = self.process_due().await {
                error!(error = %e, "follow-up tick failed");
            }
        }
        info!("follow-up scheduler stopped");
    }

    /// One dispatch pass over due jobs.
    pub async fn process_due(&self) -> Result<(), CauceError> {
        let now = Utc::now();
        let include_failed = !self.migration_active(now);
        let due = followups::select_due(
            &self.db,
            now,
            include_failed,
            self.config.max_attempts,
            DISPATCH_BATCH,
        )
        .await?;

        for job in due {
            if let Err(e) = self.process_job(&job, now).await {
                warn!(job_id = job.id, user_id = %job.user_id, error = %e, "follow-up job failed");
            }
        }
        Ok(())
    }

    async fn process_job(&self, job: &FollowUpJob, now: DateTime<Utc>) -> Result<(), CauceError> {
        let user_id = &job.user_id;

        // Guard: blacklisted users never receive follow-ups.
        if followups::is_blacklisted(&self.db, user_id).await? {
            followups::mark_cancelled(&self.db, job.id).await?;
            cauce_metrics::record_followup_skipped("blacklist");
            return Ok(());
        }

        // Guard: a paused conversation belongs to a human.
        if self.gate.is_paused(user_id).await {
            let retry = self.window.next_valid(now + chrono::Duration::hours(1));
            followups::reschedule(&self.db, job.id, retry).await?;
            cauce_metrics::record_followup_skipped("paused");
            return Ok(());
        }

        // Guard: send window in the civil zone.
        if !self.window.contains(now) {
            followups::reschedule(&self.db, job.id, self.window.next_valid(now)).await?;
            cauce_metrics::record_followup_skipped("window");
            return Ok(());
        }

        // Guard: daily cap per civil day.
        let today = self.window.civil_day(now);
        if let Some(limit) = followups::rate_limit_get(&self.db, user_id).await? {
            if limit.reset_date == today && limit.daily_count >= self.config.daily_cap {
                followups::reschedule(&self.db, job.id, self.window.next_day(now)).await?;
                cauce_metrics::record_followup_skipped("daily_cap");
                return Ok(());
            }
        }

        // Guard: the user spoke since the snapshot; the reset path owns them.
        let ctx = self.contexts.get(user_id).await?;
        if ctx.last_interaction > job.context_snapshot.taken_at {
            let cancelled = followups::cancel_pending(&self.db, user_id).await?;
            debug!(user_id, cancelled, "user active since snapshot, follow-ups cancelled");
            cauce_metrics::record_followup_skipped("user_active");
            return Ok(());
        }

        // All guards passed: send.
        followups::mark_processing(&self.db, job.id).await?;
        let message = templates::render(job.stage, &job.context_snapshot);

        match self
            .sender
            .send_text(
                user_id,
                &message,
                job.context_snapshot.source,
                job.context_snapshot.conversation_id.as_deref(),
            )
            .await
        {
            Ok(()) => {
                followups::mark_sent(&self.db, job.id).await?;
                followups::history_insert(&self.db, user_id, job.stage, &message).await?;
                followups::rate_limit_record_send(&self.db, user_id, today).await?;
                cauce_metrics::record_followup_fired(job.stage);
                info!(user_id, stage = job.stage, "follow-up sent");

                self.arm_next_stage(job, now).await?;
                Ok(())
            }
            Err(e) => {
                let attempts = job.attempts + 1;
                if self.migration_active(now) || attempts >= self.config.max_attempts {
                    followups::mark_failed(&self.db, job.id, attempts, None).await?;
                    warn!(user_id, stage = job.stage, attempts, "follow-up left failed");
                } else {
                    let backoff = RETRY_BACKOFF_BASE
                        .saturating_mul(2u32.saturating_pow(attempts))
                        .min(RETRY_BACKOFF_CAP);
                    let retry = now
                        + chrono::Duration::from_std(backoff)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    followups::mark_failed(&self.db, job.id, attempts, Some(retry)).await?;
                }
                Err(e)
            }
        }
    }

    /// Schedule the stage after a successful send. Offsets count from the
    /// activation snapshot; stages past 0 respect the send window. The
    /// terminal stage recurs only in maintenance mode.
    async fn arm_next_stage(&self, job: &FollowUpJob, now: DateTime<Utc>) -> Result<(), CauceError> {
        if job.stage >= TERMINAL_STAGE {
            if self.config.maintenance_enabled {
                let at = self
                    .window
                    .next_valid(now + chrono::Duration::hours(MAINTENANCE_INTERVAL_HOURS));
                followups::upsert_pending(
                    &self.db,
                    &job.user_id,
                    TERMINAL_STAGE,
                    at,
                    &job.context_snapshot,
                )
                .await?;
            }
            return Ok(());
        }

        let next_stage = job.stage + 1;
        let Some(offset) = offset_hours(next_stage) else {
            return Ok(());
        };
        let from_activity = job.context_snapshot.taken_at + chrono::Duration::hours(offset);
        let at = self.window.next_valid(from_activity.max(now));
        followups::upsert_pending(&self.db, &job.user_id, next_stage, at, &job.context_snapshot)
            .await?;
        Ok(())
    }

    // --- Admin surface ---

    /// Opt a user out: blacklist and cancel everything pending.
    pub async fn deactivate(&self, user_id: &str, reason: &str) -> Result<(), CauceError> {
        followups::blacklist_add(&self.db, user_id, reason).await?;
        followups::cancel_pending(&self.db, user_id).await?;
        info!(user_id, reason, "follow-ups deactivated");
        Ok(())
    }

    /// Opt a user back in and arm stage 0 from their current context.
    pub async fn activate(&self, user_id: &str) -> Result<(), CauceError> {
        followups::blacklist_remove(&self.db, user_id).await?;
        let ctx = self.contexts.get(user_id).await?;
        self.arm_stage_zero(user_id, &ctx).await?;
        info!(user_id, "follow-ups activated");
        Ok(())
    }

    /// Pending jobs, blacklist flag, and daily accounting for a user.
    pub async fn status(&self, user_id: &str) -> Result<serde_json::Value, CauceError> {
        let pending = followups::pending_for_user(&self.db, user_id).await?;
        let blacklisted = followups::is_blacklisted(&self.db, user_id).await?;
        let rate_limit = followups::rate_limit_get(&self.db, user_id).await?;
        Ok(serde_json::json!({
            "user_id": user_id,
            "blacklisted": blacklisted,
            "pending": pending
                .iter()
                .map(|j| serde_json::json!({
                    "stage": j.stage,
                    "scheduled_for": j.scheduled_for.to_rfc3339(),
                    "attempts": j.attempts,
                }))
                .collect::<Vec<_>>(),
            "daily_count": rate_limit.as_ref().map(|r| r.daily_count).unwrap_or(0),
            "last_sent_at": rate_limit
                .and_then(|r| r.last_sent_at)
                .map(|t| t.to_rfc3339()),
        }))
    }

    async fn arm_stage_zero(
        &self,
        user_id: &str,
        ctx: &ConversationContext,
    ) -> Result<(), CauceError> {
        let snapshot = ContextSnapshot::capture(ctx);
        let Some(offset) = offset_hours(0) else {
            return Ok(());
        };
        // Stage 0 fires relative to activity; the window guard handles
        // off-hours at dispatch time.
        let at = Utc::now() + chrono::Duration::hours(offset);
        followups::upsert_pending(&self.db, user_id, 0, at, &snapshot).await?;
        cauce_metrics::record_followup_armed();
        Ok(())
    }
}

#[async_trait]
impl ActivityObserver for FollowUpScheduler {
    async fn on_user_activity(&self, user_id: &str, ctx: &ConversationContext) {
        if !self.config.enabled {
            return;
        }
        let armed: Result<(), CauceError> = async {
            if followups::is_blacklisted(&self.db, user_id).await? {
                return Ok(());
            }
            followups::cancel_pending(&self.db, user_id).await?;
            self.arm_stage_zero(user_id, ctx).await
        }
        .await;
        if let Err(e) = armed {
            warn!(user_id, error = %e, "failed to arm follow-up sequence");
        }
    }

    async fn on_inbound(&self, user_id: &str) {
        if !self.config.enabled {
            return;
        }
        // Stage-0 reset: any user interaction rewinds the sequence.
        if let Err(e) = followups::cancel_pending(&self.db, user_id).await {
            warn!(user_id, error = %e, "failed to cancel pending follow-ups");
            return;
        }
        // Replies within two days of a send count as responses.
        let since = Utc::now() - chrono::Duration::days(2);
        if let Err(e) = followups::history_mark_responded(&self.db, user_id, since).await {
            debug!(user_id, error = %e, "history response marking skipped");
        }
    }
}
