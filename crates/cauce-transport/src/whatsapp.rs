// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! WhatsApp gateway adapter (Evolution-style REST API).
//!
//! Inbound `messages.upsert` webhooks are parsed into the canonical
//! [`InboundMessage`]; outbound text goes through
//! `POST {base}/message/sendText/{instance}` with an `apikey` header.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use cauce_core::{CauceError, InboundMessage, MessageSource, WebhookEvent};

use crate::{digits_only, post_with_retry};

/// WhatsApp gateway transport.
#[derive(Clone)]
pub struct WhatsAppTransport {
    http: reqwest::Client,
    base_url: String,
    instance: String,
}

impl WhatsAppTransport {
    /// Create the transport. `timeout` bounds a single outbound HTTP call.
    pub fn new(
        base_url: &str,
        instance: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, CauceError> {
        if api_key.trim().is_empty() {
            return Err(CauceError::Config("whatsapp.api_key is required".into()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(api_key.trim())
                .map_err(|e| CauceError::Config(format!("invalid whatsapp api key: {e}")))?,
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| CauceError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            instance: instance.to_string(),
        })
    }

    /// Send plain text to a phone number.
    pub async fn send_text(&self, number: &str, text: &str) -> Result<(), CauceError> {
        let number = digits_only(number);
        if number.is_empty() {
            return Err(CauceError::Transport {
                message: "empty recipient number".into(),
                transient: false,
            });
        }
        let url = format!("{}/message/sendText/{}", self.base_url, self.instance);
        let payload = serde_json::json!({
            "number": number,
            "textMessage": { "text": text },
        });

        post_with_retry("whatsapp", || self.http.post(&url).json(&payload)).await
    }
}

/// Parse an Evolution-style webhook body into a routing variant.
///
/// Unusable payloads map to `Ignored` so the webhook handler can answer 200
/// idempotently.
pub fn parse_webhook(payload: &Value) -> WebhookEvent {
    let event = payload.get("event").and_then(|v| v.as_str()).unwrap_or("");
    if event != "messages.upsert" {
        return WebhookEvent::Ignored {
            reason: format!("event {}", if event.is_empty() { "missing" } else { event }),
        };
    }

    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    let key = data.get("key").cloned().unwrap_or(Value::Null);

    if key.get("fromMe").and_then(|v| v.as_bool()).unwrap_or(false) {
        return WebhookEvent::Ignored {
            reason: "own message".into(),
        };
    }

    let remote_jid = key.get("remoteJid").and_then(|v| v.as_str()).unwrap_or("");
    if remote_jid.ends_with("@g.us") {
        return WebhookEvent::Ignored {
            reason: "group message".into(),
        };
    }
    // The JID suffix varies: standard chats, Meta Ads leads, and broadcast
    // all carry the digits before the `@`.
    let user_id = digits_only(remote_jid.split('@').next().unwrap_or(""));

    let text = extract_text(&data);

    if user_id.is_empty() || text.trim().is_empty() {
        return WebhookEvent::Ignored {
            reason: "empty sender or text".into(),
        };
    }

    let conversation_id = data
        .get("chatwootConversationId")
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    WebhookEvent::Inbound(InboundMessage {
        user_id,
        text: text.trim().to_string(),
        source: MessageSource::Whatsapp,
        transport_message_id: key
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        conversation_id,
        arrived_at: Utc::now(),
        metadata: None,
    })
}

/// Text lives in `message.conversation` for plain messages and in
/// `message.extendedTextMessage.text` for replies and link previews.
fn extract_text(data: &Value) -> String {
    let message = data.get("message").cloned().unwrap_or(Value::Null);
    if let Some(text) = message.get("conversation").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    message
        .get("extendedTextMessage")
        .and_then(|v| v.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
