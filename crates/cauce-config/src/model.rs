// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Cauce dispatcher.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use serde::{Deserialize, Serialize};

/// Top-level Cauce configuration.
///
/// Loaded from TOML with environment variable overrides. All sections are
/// optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CauceConfig {
    /// AI agent runtime settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// WhatsApp gateway (Evolution-style REST API) settings.
    #[serde(default)]
    pub whatsapp: WhatsappConfig,

    /// Chatwoot helpdesk settings.
    #[serde(default)]
    pub chatwoot: ChatwootConfig,

    /// Durable storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Shared cache (L2) settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Queue, burst buffer, and worker pool settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Admission rate-limit settings.
    #[serde(default)]
    pub rate: RateConfig,

    /// Follow-up scheduler settings.
    #[serde(default)]
    pub followup: FollowupConfig,

    /// HTTP gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// AI agent runtime configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// API key for the agent endpoint. `None` requires the env override.
    #[serde(default)]
    pub api_key: Option<String>,

    /// OpenAI-compatible chat completions base URL.
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,

    /// Model identifier sent with each request.
    #[serde(default = "default_agent_model")]
    pub model: String,

    /// System prompt establishing the assistant persona.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Deadline for a single agent call, in seconds.
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_agent_base_url(),
            model: default_agent_model(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_agent_timeout(),
            log_level: default_log_level(),
        }
    }
}

fn default_agent_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_agent_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "Sos un asistente comercial argentino, cálido y conversacional. \
     Respondés corto, recordás la conversación previa y nunca inventás stock ni precios."
        .to_string()
}

fn default_agent_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// WhatsApp gateway configuration (Evolution-style REST API).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WhatsappConfig {
    /// Enable the WhatsApp transport.
    #[serde(default)]
    pub enabled: bool,

    /// Gateway base URL, e.g. `https://evo.example.com`.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Gateway instance name used in the sendText path.
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Gateway API key, sent as the `apikey` header.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for WhatsappConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            instance: default_instance(),
            api_key: None,
        }
    }
}

fn default_instance() -> String {
    "main".to_string()
}

/// Chatwoot helpdesk configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChatwootConfig {
    /// Enable the Chatwoot transport.
    #[serde(default)]
    pub enabled: bool,

    /// Chatwoot base URL.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Account id used in the messages path.
    #[serde(default)]
    pub account_id: Option<i64>,

    /// API access token, sent as the `api_access_token` header.
    #[serde(default)]
    pub api_token: Option<String>,
}

/// Durable storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "cauce.db".to_string()
}

/// Shared cache (L2) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Redis URL. `None` degrades to the in-process fallback cache.
    #[serde(default)]
    pub url: Option<String>,

    /// Context entry TTL in the shared cache, in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

/// Queue, burst buffer, and worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Minimum worker count.
    #[serde(default = "default_worker_min")]
    pub worker_min: usize,

    /// Maximum worker count.
    #[serde(default = "default_worker_max")]
    pub worker_max: usize,

    /// p95 latency target that triggers scale-up, in seconds.
    #[serde(default = "default_target_latency")]
    pub target_latency_secs: u64,

    /// Scaling evaluation interval, in seconds.
    #[serde(default = "default_scale_interval")]
    pub scale_interval_secs: u64,

    /// Cooldown between scaling actions, in seconds.
    #[serde(default = "default_scale_cooldown")]
    pub scale_cooldown_secs: u64,

    /// Burst coalescing window, in milliseconds.
    #[serde(default = "default_coalesce_window")]
    pub coalesce_window_ms: u64,

    /// A burst buffer holding this many messages flushes immediately.
    #[serde(default = "default_max_burst")]
    pub max_burst_messages: usize,

    /// Pending-item soft cap; admission rejects with "busy" above it.
    #[serde(default = "default_queue_soft_cap")]
    pub queue_soft_cap: usize,

    /// Retry attempts before an item dead-letters.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Grace period for in-flight items at shutdown, in seconds.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// `processing` rows older than this revert to `pending` at startup,
    /// in seconds.
    #[serde(default = "default_liveness_threshold")]
    pub liveness_threshold_secs: u64,

    /// Deadline for one outbound transport call, in seconds.
    #[serde(default = "default_transport_timeout")]
    pub transport_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_min: default_worker_min(),
            worker_max: default_worker_max(),
            target_latency_secs: default_target_latency(),
            scale_interval_secs: default_scale_interval(),
            scale_cooldown_secs: default_scale_cooldown(),
            coalesce_window_ms: default_coalesce_window(),
            max_burst_messages: default_max_burst(),
            queue_soft_cap: default_queue_soft_cap(),
            max_attempts: default_max_attempts(),
            drain_timeout_secs: default_drain_timeout(),
            liveness_threshold_secs: default_liveness_threshold(),
            transport_timeout_secs: default_transport_timeout(),
        }
    }
}

fn default_worker_min() -> usize {
    2
}

fn default_worker_max() -> usize {
    8
}

fn default_target_latency() -> u64 {
    10
}

fn default_scale_interval() -> u64 {
    30
}

fn default_scale_cooldown() -> u64 {
    30
}

fn default_coalesce_window() -> u64 {
    5000
}

fn default_max_burst() -> usize {
    4
}

fn default_queue_soft_cap() -> usize {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_liveness_threshold() -> u64 {
    300
}

fn default_transport_timeout() -> u64 {
    10
}

/// Admission rate-limit configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateConfig {
    /// Per-user requests per minute.
    #[serde(default = "default_per_user")]
    pub per_user_per_min: u32,

    /// Per-IP requests per minute.
    #[serde(default = "default_per_ip")]
    pub per_ip_per_min: u32,

    /// Global requests per minute.
    #[serde(default = "default_global")]
    pub global_per_min: u32,

    /// Dedup window for `(user, message_hash)`, in seconds.
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_secs: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_user_per_min: default_per_user(),
            per_ip_per_min: default_per_ip(),
            global_per_min: default_global(),
            dedup_ttl_secs: default_dedup_ttl(),
        }
    }
}

fn default_per_user() -> u32 {
    10
}

fn default_per_ip() -> u32 {
    50
}

fn default_global() -> u32 {
    1000
}

fn default_dedup_ttl() -> u64 {
    600
}

/// Follow-up scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FollowupConfig {
    /// Enable the follow-up scheduler.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Earliest local hour a follow-up may be sent (inclusive).
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,

    /// Latest local hour a follow-up may be sent (exclusive).
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,

    /// Allowed weekdays, ISO numbering (1 = Monday .. 7 = Sunday).
    #[serde(default = "default_weekdays")]
    pub allowed_weekdays: Vec<u8>,

    /// Civil zone for windows and daily caps.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Scheduler tick interval, in seconds.
    #[serde(default = "default_tick")]
    pub tick_secs: u64,

    /// While `now` is before this RFC 3339 instant, failed jobs are never
    /// retried (safety valve for mass timestamp migrations).
    #[serde(default)]
    pub migration_mode_until: Option<chrono::DateTime<chrono::Utc>>,

    /// Re-arm the terminal stage every 15 days after it fires.
    #[serde(default)]
    pub maintenance_enabled: bool,

    /// Maximum follow-ups per user per civil day.
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            allowed_weekdays: default_weekdays(),
            timezone: default_timezone(),
            tick_secs: default_tick(),
            migration_mode_until: None,
            maintenance_enabled: false,
            daily_cap: default_daily_cap(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_start_hour() -> u32 {
    9
}

fn default_end_hour() -> u32 {
    21
}

fn default_weekdays() -> Vec<u8> {
    vec![1, 2, 3, 4, 5, 6]
}

fn default_timezone() -> String {
    "America/Argentina/Cordoba".to_string()
}

fn default_tick() -> u64 {
    30
}

fn default_daily_cap() -> u32 {
    1
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}
