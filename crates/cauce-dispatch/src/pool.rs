// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dynamic worker pool with an auto-scaling supervisor.
//!
//! The supervisor evaluates every `scale_interval`: scale up one worker when
//! the queue is deep (`depth > 2 x workers`) or p95 latency exceeds the
//! target; scale down one when the queue is empty and utilization stayed
//! under 30% for three consecutive windows. A cooldown separates scaling
//! actions. Shutdown stops leasing and waits up to the drain timeout for
//! in-flight items.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::worker::{Worker, WorkerContext, WorkerMetrics};

/// Windows of low utilization required before scaling down.
const IDLE_WINDOWS_FOR_SCALE_DOWN: u32 = 3;

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// p95 latency above this triggers scale-up.
    pub target_latency: Duration,
    /// Supervisor evaluation interval.
    pub scale_interval: Duration,
    /// Minimum gap between scaling actions.
    pub scale_cooldown: Duration,
    /// Grace period for in-flight items at shutdown.
    pub drain_timeout: Duration,
}

struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    metrics: Arc<WorkerMetrics>,
}

/// Dynamic pool of queue workers.
pub struct WorkerPool {
    deps: Arc<WorkerContext>,
    config: PoolConfig,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    last_scale: Mutex<Instant>,
    idle_windows: AtomicU32,
    next_worker: AtomicU64,
}

impl WorkerPool {
    pub fn new(deps: Arc<WorkerContext>, config: PoolConfig) -> Self {
        Self {
            deps,
            config,
            workers: Mutex::new(HashMap::new()),
            last_scale: Mutex::new(Instant::now() - Duration::from_secs(3600)),
            idle_windows: AtomicU32::new(0),
            next_worker: AtomicU64::new(1),
        }
    }

    /// Spawn the minimum workers and the scaling supervisor.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) {
        for _ in 0..self.config.min_workers {
            self.spawn_worker().await;
        }
        info!(workers = self.config.min_workers, "worker pool started");

        let pool = Arc::clone(self);
        let supervisor_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.scale_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = supervisor_cancel.cancelled() => break,
                }
                pool.evaluate_scaling().await;
            }
        });
    }

    /// Current worker count.
    pub async fn size(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Fraction of workers currently processing an item.
    pub async fn utilization(&self) -> f64 {
        let workers = self.workers.lock().await;
        if workers.is_empty() {
            return 0.0;
        }
        let busy = workers
            .values()
            .filter(|h| h.metrics.busy.load(Ordering::Relaxed))
            .count();
        busy as f64 / workers.len() as f64
    }

    /// p95 of recent response times across all workers, in seconds.
    pub async fn p95_response_time(&self) -> f64 {
        let workers = self.workers.lock().await;
        let mut samples: Vec<f64> = workers
            .values()
            .flat_map(|h| h.metrics.response_times())
            .collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((samples.len() as f64) * 0.95).ceil() as usize;
        samples[index.saturating_sub(1).min(samples.len() - 1)]
    }

    async fn evaluate_scaling(&self) {
        let depth = self.deps.queue.depth().await;
        let size = self.size().await;
        let utilization = self.utilization().await;
        let p95 = self.p95_response_time().await;

        cauce_metrics::set_queue_depth(depth as f64);
        cauce_metrics::set_worker_pool_size(size as f64);
        cauce_metrics::set_worker_utilization(utilization);

        let cooldown_over = self.last_scale.lock().await.elapsed() >= self.config.scale_cooldown;

        let should_scale_up = size < self.config.max_workers
            && (depth > 2 * size || p95 > self.config.target_latency.as_secs_f64());
        if should_scale_up {
            self.idle_windows.store(0, Ordering::Relaxed);
            if cooldown_over {
                self.spawn_worker().await;
                *self.last_scale.lock().await = Instant::now();
                info!(depth, p95, size = size + 1, "scaled up");
            }
            return;
        }

        let idle = depth == 0 && utilization < 0.3;
        if idle && size > self.config.min_workers {
            let windows = self.idle_windows.fetch_add(1, Ordering::Relaxed) + 1;
            if windows >= IDLE_WINDOWS_FOR_SCALE_DOWN && cooldown_over {
                self.remove_one_worker().await;
                self.idle_windows.store(0, Ordering::Relaxed);
                *self.last_scale.lock().await = Instant::now();
                info!(size = size - 1, "scaled down");
            }
        } else {
            self.idle_windows.store(0, Ordering::Relaxed);
        }
    }

    async fn spawn_worker(&self) {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let id = format!("worker-{n}");
        let metrics = Arc::new(WorkerMetrics::new());
        let cancel = CancellationToken::new();

        let worker = Worker::new(id.clone(), Arc::clone(&self.deps), Arc::clone(&metrics));
        let worker_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            worker.run(worker_cancel).await;
        });

        self.workers.lock().await.insert(
            id,
            WorkerHandle {
                cancel,
                task,
                metrics,
            },
        );
    }

    /// Remove one worker, preferring idle workers with the most errors.
    async fn remove_one_worker(&self) {
        let mut workers = self.workers.lock().await;
        let candidate = workers
            .iter()
            .map(|(id, handle)| {
                let mut score = 0i64;
                if !handle.metrics.busy.load(Ordering::Relaxed) {
                    score += 100;
                }
                score += handle.metrics.errors.load(Ordering::Relaxed) as i64 * 10;
                (id.clone(), score)
            })
            .max_by_key(|(_, score)| *score)
            .map(|(id, _)| id);

        if let Some(id) = candidate {
            if let Some(handle) = workers.remove(&id) {
                handle.cancel.cancel();
                // The task exits after its current item; it is not awaited
                // here to keep the supervisor loop responsive.
                drop(handle.task);
                info!(worker = %id, "worker retired");
            }
        }
    }

    /// Stop accepting leases and wait up to the drain timeout for in-flight
    /// items, then abort whatever remains.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.values() {
            handle.cancel.cancel();
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        for (id, handle) in workers.drain() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle.task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(worker = %id, "drain timeout, aborting worker");
                }
            }
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cauce_cache::MemoryCache;
    use cauce_context::{ContextStore, ContextStoreConfig};
    use cauce_core::{
        ActivityObserver, CauceError, ConversationContext, InboundMessage, MessageSource,
        Priority, ReplyEngine, TransportSender,
    };
    use cauce_storage::Database;
    use tempfile::tempdir;

    use crate::breaker::CircuitBreaker;
    use crate::gate::BotStateGate;
    use crate::queue::PriorityQueue;

    struct EchoEngine;

    #[async_trait]
    impl ReplyEngine for EchoEngine {
        async fn infer_reply(
            &self,
            _ctx: &ConversationContext,
            text: &str,
        ) -> Result<String, CauceError> {
            Ok(format!("eco: {text}"))
        }
    }

    /// Engine slow enough for the supervisor to observe queue depth.
    struct SlowEngine;

    #[async_trait]
    impl ReplyEngine for SlowEngine {
        async fn infer_reply(
            &self,
            _ctx: &ConversationContext,
            text: &str,
        ) -> Result<String, CauceError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(format!("eco: {text}"))
        }
    }

    struct CountingSender {
        sent: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TransportSender for CountingSender {
        async fn send_text(
            &self,
            _user_id: &str,
            _text: &str,
            _source: MessageSource,
            _conversation_id: Option<&str>,
        ) -> Result<(), CauceError> {
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct NullObserver;

    #[async_trait]
    impl ActivityObserver for NullObserver {
        async fn on_user_activity(&self, _user_id: &str, _ctx: &ConversationContext) {}
        async fn on_inbound(&self, _user_id: &str) {}
    }

    async fn deps(
        engine: Arc<dyn ReplyEngine>,
        sender: Arc<CountingSender>,
    ) -> (Arc<WorkerContext>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("pool.db").to_str().unwrap())
            .await
            .unwrap();
        let cache: Arc<MemoryCache> = Arc::new(MemoryCache::new());
        let deps = Arc::new(WorkerContext {
            queue: Arc::new(PriorityQueue::new(db.clone(), 3)),
            contexts: Arc::new(ContextStore::new(
                db.clone(),
                cache.clone(),
                ContextStoreConfig::default(),
            )),
            gate: Arc::new(BotStateGate::new(cache, db)),
            engine,
            sender,
            breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
            observer: Arc::new(NullObserver),
            agent_timeout: Duration::from_secs(5),
        });
        (deps, dir)
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            target_latency: Duration::from_secs(10),
            scale_interval: Duration::from_millis(50),
            scale_cooldown: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(2),
        }
    }

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

    #[tokio::test]
    async fn pool_processes_queued_items() {
        let sender = Arc::new(CountingSender {
            sent: std::sync::atomic::AtomicUsize::new(0),
        });
        let (deps, _dir) = deps(Arc::new(EchoEngine), sender.clone()).await;
        let pool = Arc::new(WorkerPool::new(deps.clone(), config(2, 4)));
        let cancel = CancellationToken::new();
        pool.start(cancel.clone()).await;

        for i in 0..5 {
            deps.queue
                .submit(msg(&format!("u{i}"), "hola"), Priority::Normal)
                .await
                .unwrap();
        }

        // Give the workers a moment to drain the queue.
        for _ in 0..50 {
            if sender.sent.load(Ordering::Relaxed) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sender.sent.load(Ordering::Relaxed), 5);

        cancel.cancel();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn pool_starts_at_minimum_size() {
        let sender = Arc::new(CountingSender {
            sent: std::sync::atomic::AtomicUsize::new(0),
        });
        let (deps, _dir) = deps(Arc::new(EchoEngine), sender).await;
        let pool = Arc::new(WorkerPool::new(deps, config(3, 8)));
        let cancel = CancellationToken::new();
        pool.start(cancel.clone()).await;

        assert_eq!(pool.size().await, 3);

        cancel.cancel();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn deep_queue_triggers_scale_up() {
        let sender = Arc::new(CountingSender {
            sent: std::sync::atomic::AtomicUsize::new(0),
        });
        let (deps, _dir) = deps(Arc::new(SlowEngine), sender).await;
        let pool = Arc::new(WorkerPool::new(deps.clone(), config(1, 4)));

        // Enqueue a burst for distinct users before starting workers so the
        // supervisor sees real depth.
        for i in 0..10 {
            deps.queue
                .submit(msg(&format!("u{i}"), "hola"), Priority::Normal)
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        pool.start(cancel.clone()).await;

        // Supervisor runs every 50ms; scale-up should kick in quickly.
        let mut grew = false;
        for _ in 0..40 {
            if pool.size().await > 1 {
                grew = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(grew, "pool should have scaled past the minimum");
        assert!(pool.size().await <= 4);

        cancel.cancel();
        pool.shutdown().await;
    }
}
