// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP client for the AI agent runtime.
//!
//! The agent itself is an external collaborator; this crate reduces it to
//! the [`ReplyEngine`] call the pipeline needs. The client speaks the
//! OpenAI-compatible chat completions wire format, sends the conversation
//! history from the context, and retries transient upstream errors once.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

use cauce_core::{CauceError, ConversationContext, ReplyEngine, Role};

/// History entries included in each request.
const HISTORY_WINDOW: usize = 15;

/// Chat-completions client implementing [`ReplyEngine`].
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    system_prompt: String,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl AgentClient {
    /// Create the client. `timeout` bounds one upstream call; the worker
    /// applies its own deadline on top.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        system_prompt: &str,
        timeout: Duration,
    ) -> Result<Self, CauceError> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", api_key.trim());
        headers.insert(
            "authorization",
            HeaderValue::from_str(&bearer)
                .map_err(|e| CauceError::Config(format!("invalid agent api key: {e}")))?,
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| CauceError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            max_retries: 1,
        })
    }

    fn build_messages(&self, ctx: &ConversationContext, text: &str) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(HISTORY_WINDOW + 2);
        messages.push(serde_json::json!({
            "role": "system",
            "content": self.system_prompt,
        }));

        let skip = ctx.interaction_history.len().saturating_sub(HISTORY_WINDOW);
        for interaction in ctx.interaction_history.iter().skip(skip) {
            let role = match interaction.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            messages.push(serde_json::json!({
                "role": role,
                "content": interaction.text,
            }));
        }

        messages.push(serde_json::json!({ "role": "user", "content": text }));
        messages
    }
}

#[async_trait]
impl ReplyEngine for AgentClient {
    async fn infer_reply(
        &self,
        ctx: &ConversationContext,
        text: &str,
    ) -> Result<String, CauceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = serde_json::json!({
            "model": self.model,
            "messages": self.build_messages(ctx, text),
            "max_tokens": 400,
            "temperature": 0.7,
        });

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                warn!(attempt, "retrying agent call after transient error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            let response = match self.http.post(&url).json(&payload).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            debug!(%status, attempt, "agent response received");

            if status.is_success() {
                let body: ChatResponse = response.json().await.map_err(|e| CauceError::Agent {
                    message: format!("malformed agent response: {e}"),
                    transient: true,
                })?;
                let reply = body
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                if reply.trim().is_empty() {
                    return Err(CauceError::Agent {
                        message: "agent returned an empty reply".into(),
                        transient: true,
                    });
                }
                return Ok(reply.trim().to_string());
            }

            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                last_error = format!("{status}: {body}");
                continue;
            }
            // 4xx other than 429 will not get better on retry.
            return Err(CauceError::Agent {
                message: format!("agent returned {status}: {body}"),
                transient: false,
            });
        }

        Err(CauceError::Agent {
            message: format!("agent call failed after retries: {last_error}"),
            transient: true,
        })
    }
}
