// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-user burst coalescing.
//!
//! Quick successive messages from one user are merged into a single unit
//! before queueing. Each arrival resets the flush timer up to a hard
//! deadline of twice the window measured from the first buffered message,
//! so a steady stream cannot delay processing forever. A full buffer or an
//! urgent keyword flushes immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use cauce_core::InboundMessage;

/// Keywords that flush the buffer immediately instead of waiting.
const URGENT_KEYWORDS: [&str; 6] = [
    "urgente",
    "problema",
    "error",
    "reclamo",
    "no funciona",
    "ayuda",
];

/// Downstream consumer of coalesced messages.
#[async_trait]
pub trait BurstSink: Send + Sync {
    async fn deliver(&self, msg: InboundMessage);
}

/// Burst buffer tuning.
#[derive(Debug, Clone)]
pub struct BurstConfig {
    /// Coalescing window; the timer re-arms to this on every arrival.
    pub window: Duration,
    /// Hard deadline from the first buffered message.
    pub max_wait: Duration,
    /// Buffer size that triggers an immediate flush.
    pub max_messages: usize,
}

impl BurstConfig {
    /// Derive from the configured window: `max_wait` is twice the window.
    pub fn from_window(window: Duration, max_messages: usize) -> Self {
        Self {
            window,
            max_wait: window * 2,
            max_messages,
        }
    }
}

struct PendingGroup {
    messages: Vec<InboundMessage>,
    first_at: Instant,
    timer: Option<JoinHandle<()>>,
}

/// Per-user coalescing buffer.
pub struct BurstBuffer {
    config: BurstConfig,
    groups: DashMap<String, PendingGroup>,
    sink: Arc<dyn BurstSink>,
}

impl BurstBuffer {
    pub fn new(config: BurstConfig, sink: Arc<dyn BurstSink>) -> Self {
        Self {
            config,
            groups: DashMap::new(),
            sink,
        }
    }

    /// Buffer a message, flushing early when the buffer is full or the text
    /// is urgent.
    pub async fn enqueue(self: &Arc<Self>, msg: InboundMessage) {
        let user_id = msg.user_id.clone();
        let flush_now = {
            let mut group = self.groups.entry(user_id.clone()).or_insert_with(|| {
                PendingGroup {
                    messages: Vec::new(),
                    first_at: Instant::now(),
                    timer: None,
                }
            });
            if let Some(timer) = group.timer.take() {
                timer.abort();
            }
            let urgent = is_urgent(&msg.text);
            group.messages.push(msg);

            if urgent || group.messages.len() >= self.config.max_messages {
                true
            } else {
                let elapsed = group.first_at.elapsed();
                let remaining = self.config.max_wait.saturating_sub(elapsed);
                if remaining.is_zero() {
                    true
                } else {
                    let delay = self.config.window.min(remaining);
                    let buffer = Arc::clone(self);
                    let user = user_id.clone();
                    group.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        buffer.flush_user(&user).await;
                    }));
                    false
                }
            }
        };

        if flush_now {
            self.flush_user(&user_id).await;
        }
    }

    /// Flush one user's buffer into the sink.
    async fn flush_user(&self, user_id: &str) {
        let Some((_, mut group)) = self.groups.remove(user_id) else {
            return;
        };
        if let Some(timer) = group.timer.take() {
            timer.abort();
        }
        if group.messages.is_empty() {
            return;
        }
        let count = group.messages.len();
        let coalesced = coalesce(group.messages);
        debug!(user_id, count, "burst flushed");
        self.sink.deliver(coalesced).await;
    }

    /// Flush everything immediately (shutdown path).
    pub async fn flush_all(&self) {
        let users: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        for user in users {
            self.flush_user(&user).await;
        }
    }

    /// Number of users with buffered messages.
    pub fn pending_users(&self) -> usize {
        self.groups.len()
    }
}

fn is_urgent(text: &str) -> bool {
    let lower = text.to_lowercase();
    URGENT_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Merge buffered messages into one unit: texts joined by newline, earliest
/// arrival timestamp, latest transport message id.
fn coalesce(messages: Vec<InboundMessage>) -> InboundMessage {
    debug_assert!(!messages.is_empty());
    let arrived_at = messages
        .iter()
        .map(|m| m.arrived_at)
        .min()
        .unwrap_or_else(chrono::Utc::now);
    let conversation_id = messages.iter().rev().find_map(|m| m.conversation_id.clone());
    let last = messages.last().cloned();
    let text = messages
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut merged = last.unwrap_or_else(|| {
        // Unreachable given the debug_assert; keeps the signature total.
        InboundMessage {
            user_id: String::new(),
            text: String::new(),
            source: cauce_core::MessageSource::Test,
            transport_message_id: String::new(),
            conversation_id: None,
            arrived_at,
            metadata: None,
        }
    });
    merged.text = text;
    merged.arrived_at = arrived_at;
    merged.conversation_id = conversation_id;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use cauce_core::MessageSource;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        delivered: StdMutex<Vec<InboundMessage>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: StdMutex::new(Vec::new()),
            })
        }

        fn messages(&self) -> Vec<InboundMessage> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BurstSink for RecordingSink {
        async fn deliver(&self, msg: InboundMessage) {
            self.delivered.lock().unwrap().push(msg);
        }
    }

    fn msg(user: &str, text: &str, id: &str) -> InboundMessage {
        InboundMessage {
            user_id: user.to_string(),
            text: text.to_string(),
            source: MessageSource::Whatsapp,
            transport_message_id: id.to_string(),
            conversation_id: None,
            arrived_at: chrono::Utc::now(),
            metadata: None,
        }
    }

    fn buffer(window_ms: u64, max: usize, sink: Arc<RecordingSink>) -> Arc<BurstBuffer> {
        Arc::new(BurstBuffer::new(
            BurstConfig::from_window(Duration::from_millis(window_ms), max),
            sink,
        ))
    }

    #[tokio::test]
    async fn burst_coalesces_into_single_unit() {
        let sink = RecordingSink::new();
        let buffer = buffer(50, 10, sink.clone());

        buffer.enqueue(msg("u1", "hola", "m1")).await;
        buffer.enqueue(msg("u1", "tenes anillos?", "m2")).await;
        buffer.enqueue(msg("u1", "de plata", "m3")).await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        let delivered = sink.messages();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text, "hola\ntenes anillos?\nde plata");
        assert_eq!(delivered[0].transport_message_id, "m3");
    }

    #[tokio::test]
    async fn single_message_flushes_after_window() {
        let sink = RecordingSink::new();
        let buffer = buffer(30, 10, sink.clone());

        buffer.enqueue(msg("u1", "hola", "m1")).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let delivered = sink.messages();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text, "hola");
    }

    #[tokio::test]
    async fn users_do_not_share_buffers() {
        let sink = RecordingSink::new();
        let buffer = buffer(30, 10, sink.clone());

        buffer.enqueue(msg("u1", "hola", "m1")).await;
        buffer.enqueue(msg("u2", "buenas", "m2")).await;
        tokio::time::sleep(Duration::from_millis(90)).await;

        let delivered = sink.messages();
        assert_eq!(delivered.len(), 2);
        let texts: Vec<&str> = delivered.iter().map(|m| m.text.as_str()).collect();
        assert!(texts.contains(&"hola"));
        assert!(texts.contains(&"buenas"));
    }

    #[tokio::test]
    async fn full_buffer_flushes_immediately() {
        let sink = RecordingSink::new();
        let buffer = buffer(5000, 2, sink.clone());

        buffer.enqueue(msg("u1", "uno", "m1")).await;
        buffer.enqueue(msg("u1", "dos", "m2")).await;

        // No timer wait needed.
        let delivered = sink.messages();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text, "uno\ndos");
    }

    #[tokio::test]
    async fn urgent_keyword_flushes_immediately() {
        let sink = RecordingSink::new();
        let buffer = buffer(5000, 10, sink.clone());

        buffer.enqueue(msg("u1", "tengo un problema", "m1")).await;

        let delivered = sink.messages();
        assert_eq!(delivered.len(), 1);
    }

    #[tokio::test]
    async fn max_wait_bounds_timer_resets() {
        let sink = RecordingSink::new();
        // window 40ms, max_wait 80ms.
        let buffer = buffer(40, 100, sink.clone());

        // Keep arriving every 25ms; without the deadline this would defer
        // forever.
        for i in 0..6 {
            buffer.enqueue(msg("u1", &format!("m{i}"), &format!("id{i}"))).await;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let delivered = sink.messages();
        assert!(
            !delivered.is_empty(),
            "deadline should have forced at least one flush"
        );
        // Every buffered message is delivered exactly once overall.
        let total: usize = delivered
            .iter()
            .map(|m| m.text.split('\n').count())
            .sum();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn flush_all_drains_pending() {
        let sink = RecordingSink::new();
        let buffer = buffer(5000, 10, sink.clone());

        buffer.enqueue(msg("u1", "hola", "m1")).await;
        buffer.enqueue(msg("u2", "buenas", "m2")).await;
        assert_eq!(buffer.pending_users(), 2);

        buffer.flush_all().await;
        assert_eq!(buffer.pending_users(), 0);
        assert_eq!(sink.messages().len(), 2);
    }
}
