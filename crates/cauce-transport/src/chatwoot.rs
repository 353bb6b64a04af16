// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chatwoot helpdesk adapter.
//!
//! `message_created` events route as inbound text or private-note commands;
//! `conversation_updated` events become supervisory signals carrying labels,
//! status, and assignee. Labels may appear in three payload locations
//! (`labels`, `cached_label_list`, `changed_attributes`) and are normalized
//! to a single set before evaluation.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use cauce_core::{
    CauceError, ConversationUpdate, InboundMessage, MessageSource, SupervisoryEvent, WebhookEvent,
};

use crate::{digits_only, post_with_retry};

/// Chatwoot transport.
#[derive(Clone)]
pub struct ChatwootTransport {
    http: reqwest::Client,
    base_url: String,
    account_id: i64,
}

impl ChatwootTransport {
    /// Create the transport. `timeout` bounds a single outbound HTTP call.
    pub fn new(
        base_url: &str,
        account_id: i64,
        api_token: &str,
        timeout: Duration,
    ) -> Result<Self, CauceError> {
        if api_token.trim().is_empty() {
            return Err(CauceError::Config("chatwoot.api_token is required".into()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            "api_access_token",
            HeaderValue::from_str(api_token.trim())
                .map_err(|e| CauceError::Config(format!("invalid chatwoot token: {e}")))?,
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| CauceError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id,
        })
    }

    /// Post an outgoing message into a conversation.
    pub async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), CauceError> {
        let url = format!(
            "{}/api/v1/accounts/{}/conversations/{}/messages",
            self.base_url, self.account_id, conversation_id
        );
        let payload = serde_json::json!({
            "content": text,
            "message_type": "outgoing",
        });

        post_with_retry("chatwoot", || self.http.post(&url).json(&payload)).await
    }
}

/// Parse a Chatwoot webhook body into a routing variant.
pub fn parse_webhook(payload: &Value) -> WebhookEvent {
    match payload.get("event").and_then(|v| v.as_str()) {
        Some("message_created") => parse_message_created(payload),
        Some("conversation_updated") => parse_conversation_updated(payload),
        Some(other) => WebhookEvent::Ignored {
            reason: format!("event {other}"),
        },
        None => WebhookEvent::Ignored {
            reason: "event missing".into(),
        },
    }
}

fn parse_message_created(payload: &Value) -> WebhookEvent {
    let content = payload
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let conversation_id = extract_conversation_id(payload);
    let user_id = extract_user_id(payload);

    let is_private = payload
        .get("private")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if is_private {
        // Private notes never reach the user; they may carry bot commands.
        let Some(user_id) = user_id else {
            return WebhookEvent::Ignored {
                reason: "private note without user".into(),
            };
        };
        return WebhookEvent::Supervisory(SupervisoryEvent::PrivateNote {
            user_id,
            conversation_id,
            text: content,
        });
    }

    let message_type = payload
        .get("message_type")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if message_type != "incoming" {
        return WebhookEvent::Ignored {
            reason: format!("message_type {message_type}"),
        };
    }

    let Some(user_id) = user_id else {
        return WebhookEvent::Ignored {
            reason: "no user identifier".into(),
        };
    };
    if content.is_empty() {
        return WebhookEvent::Ignored {
            reason: "empty content".into(),
        };
    }

    WebhookEvent::Inbound(InboundMessage {
        user_id,
        text: content,
        source: MessageSource::Chatwoot,
        transport_message_id: payload
            .get("id")
            .map(|v| v.to_string())
            .unwrap_or_default(),
        conversation_id,
        arrived_at: Utc::now(),
        metadata: None,
    })
}

fn parse_conversation_updated(payload: &Value) -> WebhookEvent {
    let Some(conversation_id) = extract_conversation_id(payload) else {
        return WebhookEvent::Ignored {
            reason: "conversation_updated without id".into(),
        };
    };
    let Some(user_id) = extract_user_id(payload) else {
        return WebhookEvent::Ignored {
            reason: "conversation_updated without user".into(),
        };
    };

    let conversation = payload.get("conversation").unwrap_or(payload);

    let status = conversation
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let assignee_id = conversation
        .get("meta")
        .and_then(|m| m.get("assignee"))
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_i64())
        .or_else(|| conversation.get("assignee_id").and_then(|v| v.as_i64()));

    WebhookEvent::Supervisory(SupervisoryEvent::ConversationUpdate(ConversationUpdate {
        user_id,
        conversation_id,
        labels: extract_labels(payload),
        status,
        assignee_id,
    }))
}

/// Conversation ids appear under `conversation.id`, at the payload root, or
/// as `conversation_id` depending on the event flavor.
fn extract_conversation_id(payload: &Value) -> Option<String> {
    let from = |v: &Value| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    payload
        .get("conversation")
        .and_then(|c| c.get("id"))
        .and_then(|v| from(v))
        .or_else(|| payload.get("conversation_id").and_then(|v| from(v)))
        .or_else(|| payload.get("id").and_then(|v| from(v)))
}

/// The stable user id is the contact phone in digits; it hides in several
/// payload locations depending on the event flavor.
fn extract_user_id(payload: &Value) -> Option<String> {
    let conversation = payload.get("conversation").unwrap_or(payload);

    let candidates = [
        payload.pointer("/sender/phone_number"),
        conversation.pointer("/meta/sender/phone_number"),
        conversation.pointer("/contact_inbox/source_id"),
        conversation.pointer("/additional_attributes/phone_number"),
        payload.pointer("/source_id"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(raw) = candidate.as_str() {
            let digits = digits_only(raw);
            if !digits.is_empty() {
                return Some(digits);
            }
        }
    }
    None
}

/// Merge labels from every location the payload may carry them.
fn extract_labels(payload: &Value) -> Vec<String> {
    let conversation = payload.get("conversation").unwrap_or(payload);
    let mut labels: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        let label = raw.trim().to_lowercase();
        if !label.is_empty() && !labels.contains(&label) {
            labels.push(label);
        }
    };

    // Current label objects or strings.
    if let Some(list) = conversation.get("labels").and_then(|v| v.as_array()) {
        for entry in list {
            match entry {
                Value::String(s) => push(s),
                Value::Object(obj) => {
                    for key in ["title", "name", "label"] {
                        if let Some(s) = obj.get(key).and_then(|v| v.as_str()) {
                            push(s);
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // Comma-separated cached list.
    if let Some(cached) = conversation.get("cached_label_list") {
        match cached {
            Value::String(s) => {
                for part in s.split(',') {
                    push(part);
                }
            }
            Value::Array(list) => {
                for entry in list {
                    if let Some(s) = entry.as_str() {
                        push(s);
                    }
                }
            }
            _ => {}
        }
    }

    // Delta entries.
    if let Some(changes) = payload.get("changed_attributes").and_then(|v| v.as_array()) {
        for change in changes {
            if let Some(current) = change
                .pointer("/label_list/current_value")
                .and_then(|v| v.as_array())
            {
                for entry in current {
                    if let Some(s) = entry.as_str() {
                        push(s);
                    }
                }
            }
        }
    }

    labels
}
