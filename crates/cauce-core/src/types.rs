// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical data model shared across the dispatch pipeline.
//!
//! All timestamps are stored as UTC (`DateTime<Utc>`, RFC 3339 on the wire);
//! scheduling decisions convert to the configured civil zone at the point of
//! use, never at rest.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

/// Maximum entries kept in a context's interaction history.
pub const INTERACTION_HISTORY_CAP: usize = 20;

/// Maximum entries kept in a context's recent-product ring.
pub const RECENT_PRODUCTS_CAP: usize = 10;

/// Interaction text longer than this is truncated before storage.
pub const INTERACTION_TEXT_CAP: usize = 500;

/// Which transport an inbound message arrived on (and where replies go).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Whatsapp,
    Chatwoot,
    Test,
}

/// Queue priority levels, ordered: lower value drains first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

impl Priority {
    /// All levels in drain order.
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Sub-queue index for this level.
    pub fn index(self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// Canonical intake record produced by the transport adapters.
///
/// Immutable after construction; coalescing in the burst buffer builds a new
/// message rather than mutating buffered ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Stable transport-agnostic identifier, typically phone digits.
    pub user_id: String,
    /// Message text, non-empty after normalization.
    pub text: String,
    /// Originating transport.
    pub source: MessageSource,
    /// Transport-assigned message id.
    pub transport_message_id: String,
    /// Helpdesk conversation id, when known.
    pub conversation_id: Option<String>,
    /// Arrival timestamp (UTC).
    pub arrived_at: DateTime<Utc>,
    /// Opaque transport metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl InboundMessage {
    /// Deduplication hash: `sha256(user_id ":" text)`, hex-encoded.
    pub fn message_hash(&self) -> String {
        message_hash(&self.user_id, &self.text)
    }
}

/// Compute the dedup hash for a `(user, text)` pair.
pub fn message_hash(user_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Lifecycle states of a queued item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

/// A unit of work in the priority queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    /// Stable identifier, assigned at submit time.
    pub queue_id: String,
    pub user_id: String,
    /// Possibly coalesced inbound message.
    pub message: InboundMessage,
    pub priority: Priority,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Items are not leased before this instant (retry backoff).
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueuedItem {
    /// Create a fresh pending item for an inbound message.
    pub fn new(message: InboundMessage, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            queue_id: uuid::Uuid::new_v4().to_string(),
            user_id: message.user_id.clone(),
            message,
            priority,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            worker_id: None,
            created_at: now,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }
}

/// Speaker role in the interaction history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the bounded interaction history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// A product the user was shown, kept in a bounded ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductReference {
    pub name: String,
    pub price: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub shown_at: DateTime<Utc>,
}

/// Inferred commercial profile of a user.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    Entrepreneur,
    Reseller,
    Retail,
}

/// Coarse engagement signal used by the follow-up template selector.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EngagementLevel {
    Low,
    Medium,
    High,
}

/// Conversation phase.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Browsing,
    Selecting,
    Purchasing,
    Escalated,
}

/// Free-form user profile accumulated over the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub profile_type: Option<ProfileType>,
    #[serde(default)]
    pub experience_level: Option<String>,
    #[serde(default)]
    pub primary_interest: Option<String>,
    #[serde(default)]
    pub budget_mentioned: Option<String>,
    #[serde(default)]
    pub specific_products_mentioned: Vec<String>,
    #[serde(default)]
    pub objections_raised: Vec<String>,
    #[serde(default)]
    pub questions_asked: Vec<String>,
    pub engagement_level: EngagementLevel,
    /// VIP users bypass the per-user rate bucket and queue as urgent.
    #[serde(default)]
    pub is_vip: bool,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            profile_type: None,
            experience_level: None,
            primary_interest: None,
            budget_mentioned: None,
            specific_products_mentioned: Vec::new(),
            objections_raised: Vec::new(),
            questions_asked: Vec::new(),
            engagement_level: EngagementLevel::Low,
            is_vip: false,
        }
    }
}

/// Per-user conversation context. Owned exclusively by the context store;
/// workers and the scheduler read copies and mutate only through
/// `ContextStore::update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: String,
    pub profile: UserProfile,
    /// Ring of recently shown products, newest at the back. Capacity 10.
    pub recent_products: VecDeque<ProductReference>,
    /// Ring of recent interactions, newest at the back. Capacity 20.
    pub interaction_history: VecDeque<Interaction>,
    pub state: ConversationState,
    /// Transport of the most recent inbound message; follow-ups reply here.
    #[serde(default = "default_source")]
    pub last_source: MessageSource,
    pub conversation_started: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
}

fn default_source() -> MessageSource {
    MessageSource::Whatsapp
}

impl ConversationContext {
    /// Fresh context for an unknown user.
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            profile: UserProfile::default(),
            recent_products: VecDeque::new(),
            interaction_history: VecDeque::new(),
            state: ConversationState::Browsing,
            last_source: MessageSource::Whatsapp,
            conversation_started: now,
            last_interaction: now,
        }
    }

    /// Append an interaction, truncating long text and evicting from the
    /// head past capacity. Never reorders.
    pub fn push_interaction(&mut self, role: Role, text: &str, at: DateTime<Utc>) {
        let text = if text.len() > INTERACTION_TEXT_CAP {
            let mut end = INTERACTION_TEXT_CAP;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text[..end].to_string()
        } else {
            text.to_string()
        };
        self.interaction_history.push_back(Interaction { role, text, at });
        while self.interaction_history.len() > INTERACTION_HISTORY_CAP {
            self.interaction_history.pop_front();
        }
    }

    /// Record a shown product, deduplicating by `(name, price)`.
    pub fn push_product(&mut self, product: ProductReference) {
        let exists = self
            .recent_products
            .iter()
            .any(|p| p.name == product.name && p.price == product.price);
        if exists {
            return;
        }
        self.recent_products.push_back(product);
        while self.recent_products.len() > RECENT_PRODUCTS_CAP {
            self.recent_products.pop_front();
        }
    }
}

/// Per-user paused/active record. Absence of a record means active; an
/// expired record is treated as absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotState {
    pub user_id: String,
    pub paused: bool,
    pub reason: String,
    pub set_by: String,
    pub paused_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BotState {
    /// Reason recorded by `force_activate`; only the operator API may pause
    /// a user carrying this marker.
    pub const FORCE_ACTIVE: &'static str = "force-active";

    /// Whether this record is past its TTL.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// A `conversation_updated` event normalized from the helpdesk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub user_id: String,
    pub conversation_id: String,
    /// Labels merged from every location the payload may carry them.
    pub labels: Vec<String>,
    pub status: Option<String>,
    pub assignee_id: Option<i64>,
}

/// Supervisory signals that drive the bot-state gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisoryEvent {
    ConversationUpdate(ConversationUpdate),
    PrivateNote {
        user_id: String,
        conversation_id: Option<String>,
        text: String,
    },
}

/// Tagged routing variant produced by the transport adapters. Downstream
/// code pattern-matches instead of inspecting raw payload shapes.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Inbound(InboundMessage),
    Supervisory(SupervisoryEvent),
    Ignored { reason: String },
}

/// Lifecycle states of a follow-up job. `Processing` is transient and exists
/// only while a send is in flight; crash recovery repairs it to `Pending`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Pending,
    Processing,
    Sent,
    Cancelled,
    Failed,
}

/// Subset of the conversation context captured when a follow-up sequence is
/// armed; rendering uses this snapshot, not the live context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub profile: UserProfile,
    #[serde(default)]
    pub recent_products: Vec<ProductReference>,
    #[serde(default)]
    pub last_questions: Vec<String>,
    #[serde(default)]
    pub last_user_message: Option<String>,
    pub source: MessageSource,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub taken_at: DateTime<Utc>,
}

impl ContextSnapshot {
    /// Capture a snapshot from a live context.
    pub fn capture(ctx: &ConversationContext) -> Self {
        let last_user_message = ctx
            .interaction_history
            .iter()
            .rev()
            .find(|i| i.role == Role::User)
            .map(|i| i.text.clone());
        Self {
            profile: ctx.profile.clone(),
            recent_products: ctx.recent_products.iter().cloned().collect(),
            last_questions: ctx.profile.questions_asked.clone(),
            last_user_message,
            source: ctx.last_source,
            conversation_id: None,
            taken_at: Utc::now(),
        }
    }
}

/// A scheduled follow-up message for one `(user, stage)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpJob {
    /// Database row id.
    pub id: i64,
    pub user_id: String,
    /// Stage index, 0..=13.
    pub stage: u8,
    pub scheduled_for: DateTime<Utc>,
    pub status: FollowUpStatus,
    pub attempts: u32,
    pub context_snapshot: ContextSnapshot,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Per-user follow-up send accounting for the daily cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpRateLimit {
    pub user_id: String,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub daily_count: u32,
    /// Civil day (in the configured zone) the count applies to.
    pub reset_date: chrono::NaiveDate,
}
