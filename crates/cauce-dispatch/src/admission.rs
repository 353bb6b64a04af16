// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Admission control: deduplication and rate limiting.
//!
//! Order of checks: dedup first (a replayed webhook is a duplicate, never a
//! rate rejection), then the token buckets, then queue back-pressure. All
//! rejections map to HTTP 200 at the gateway so transports do not retry.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::debug;

use cauce_core::{CauceError, InboundMessage};
use cauce_storage::{queries::rate_buckets, Database};

/// Identifier for the process-wide bucket.
const GLOBAL_BUCKET: &str = "global";

/// Dedup map size that triggers an amortized sweep of expired entries.
const DEDUP_SWEEP_THRESHOLD: usize = 10_000;

/// Admission tuning.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub per_user_per_min: u32,
    pub per_ip_per_min: u32,
    pub global_per_min: u32,
    pub dedup_ttl: Duration,
    pub queue_soft_cap: usize,
}

struct Bucket {
    window_start: Instant,
    window_epoch: i64,
    count: u32,
}

/// Deduplicator and rate limiter in front of the burst buffer.
pub struct AdmissionControl {
    config: AdmissionConfig,
    /// `user:hash` -> expiry instant.
    dedup: DashMap<String, Instant>,
    buckets: StdMutex<HashMap<String, Bucket>>,
    db: Database,
}

impl AdmissionControl {
    pub fn new(config: AdmissionConfig, db: Database) -> Self {
        Self {
            config,
            dedup: DashMap::new(),
            buckets: StdMutex::new(HashMap::new()),
            db,
        }
    }

    /// Admit or reject an inbound message. `is_vip` bypasses the per-user
    /// bucket but not the IP or global buckets.
    pub async fn admit(
        &self,
        msg: &InboundMessage,
        ip: Option<&str>,
        queue_depth: usize,
        is_vip: bool,
    ) -> Result<(), CauceError> {
        if msg.user_id.is_empty() || msg.text.trim().is_empty() {
            return Err(CauceError::BadRequest("empty user or text".into()));
        }

        self.check_duplicate(msg)?;

        let mut closed_windows = Vec::new();
        {
            let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
            if !is_vip {
                Self::check_bucket(
                    &mut buckets,
                    &format!("user:{}", msg.user_id),
                    self.config.per_user_per_min,
                    &mut closed_windows,
                )?;
            }
            if let Some(ip) = ip {
                Self::check_bucket(
                    &mut buckets,
                    &format!("ip:{ip}"),
                    self.config.per_ip_per_min,
                    &mut closed_windows,
                )?;
            }
            Self::check_bucket(
                &mut buckets,
                GLOBAL_BUCKET,
                self.config.global_per_min,
                &mut closed_windows,
            )?;
        }

        // Mirror closed windows for inspection; never on the hot path of a
        // rejection.
        for (identifier, epoch, count) in closed_windows {
            if let Err(e) = rate_buckets::record_window(&self.db, &identifier, epoch, count).await {
                debug!(error = %e, "rate window mirror skipped");
            }
        }

        if queue_depth >= self.config.queue_soft_cap {
            return Err(CauceError::RateLimited("busy".into()));
        }

        Ok(())
    }

    fn check_duplicate(&self, msg: &InboundMessage) -> Result<(), CauceError> {
        let key = format!("{}:{}", msg.user_id, msg.message_hash());
        let now = Instant::now();

        if let Some(expiry) = self.dedup.get(&key) {
            if *expiry > now {
                return Err(CauceError::Duplicate);
            }
        }
        self.dedup.insert(key, now + self.config.dedup_ttl);

        if self.dedup.len() > DEDUP_SWEEP_THRESHOLD {
            self.dedup.retain(|_, expiry| *expiry > now);
        }
        Ok(())
    }

    /// Fixed-window counter; rolls the window on expiry and reports the
    /// closed window for mirroring.
    fn check_bucket(
        buckets: &mut HashMap<String, Bucket>,
        identifier: &str,
        max_per_min: u32,
        closed: &mut Vec<(String, i64, u32)>,
    ) -> Result<(), CauceError> {
        let now = Instant::now();
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let bucket = buckets.entry(identifier.to_string()).or_insert(Bucket {
            window_start: now,
            window_epoch: epoch,
            count: 0,
        });

        if now.duration_since(bucket.window_start) >= Duration::from_secs(60) {
            closed.push((identifier.to_string(), bucket.window_epoch, bucket.count));
            bucket.window_start = now;
            bucket.window_epoch = epoch;
            bucket.count = 0;
        }

        if bucket.count >= max_per_min {
            return Err(CauceError::RateLimited(identifier.to_string()));
        }
        bucket.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cauce_core::MessageSource;
    use tempfile::tempdir;

    fn msg(user: &str, text: &str) -> InboundMessage {
        InboundMessage {
            user_id: user.to_string(),
            text: text.to_string(),
            source: MessageSource::Whatsapp,
            transport_message_id: "m".into(),
            conversation_id: None,
            arrived_at: chrono::Utc::now(),
            metadata: None,
        }
    }

    async fn setup(config: AdmissionConfig) -> (AdmissionControl, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("adm.db").to_str().unwrap())
            .await
            .unwrap();
        (AdmissionControl::new(config, db), dir)
    }

    fn config() -> AdmissionConfig {
        AdmissionConfig {
            per_user_per_min: 3,
            per_ip_per_min: 50,
            global_per_min: 1000,
            dedup_ttl: Duration::from_secs(600),
            queue_soft_cap: 500,
        }
    }

    #[tokio::test]
    async fn duplicate_within_window_is_rejected() {
        let (admission, _dir) = setup(config()).await;
        let m = msg("u1", "hola");
        admission.admit(&m, None, 0, false).await.unwrap();
        let err = admission.admit(&m, None, 0, false).await.unwrap_err();
        assert!(matches!(err, CauceError::Duplicate));
    }

    #[tokio::test]
    async fn different_text_is_not_duplicate() {
        let (admission, _dir) = setup(config()).await;
        admission.admit(&msg("u1", "hola"), None, 0, false).await.unwrap();
        admission
            .admit(&msg("u1", "tenes anillos?"), None, 0, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn per_user_bucket_rejects_over_limit() {
        let (admission, _dir) = setup(config()).await;
        for i in 0..3 {
            admission
                .admit(&msg("u1", &format!("m{i}")), None, 0, false)
                .await
                .unwrap();
        }
        let err = admission
            .admit(&msg("u1", "m3"), None, 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CauceError::RateLimited(_)));
    }

    #[tokio::test]
    async fn vip_bypasses_per_user_bucket() {
        let (admission, _dir) = setup(config()).await;
        for i in 0..10 {
            admission
                .admit(&msg("vip", &format!("m{i}")), None, 0, true)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn vip_still_hits_global_bucket() {
        let mut cfg = config();
        cfg.global_per_min = 2;
        let (admission, _dir) = setup(cfg).await;
        admission.admit(&msg("vip", "m0"), None, 0, true).await.unwrap();
        admission.admit(&msg("vip", "m1"), None, 0, true).await.unwrap();
        let err = admission
            .admit(&msg("vip", "m2"), None, 0, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CauceError::RateLimited(_)));
    }

    #[tokio::test]
    async fn queue_back_pressure_rejects_busy() {
        let (admission, _dir) = setup(config()).await;
        let err = admission
            .admit(&msg("u1", "hola"), None, 500, false)
            .await
            .unwrap_err();
        match err {
            CauceError::RateLimited(reason) => assert_eq!(reason, "busy"),
            other => panic!("expected busy rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_text_is_bad_request() {
        let (admission, _dir) = setup(config()).await;
        let err = admission
            .admit(&msg("u1", "   "), None, 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CauceError::BadRequest(_)));
    }
}
