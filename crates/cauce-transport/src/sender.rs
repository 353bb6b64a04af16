// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outbound routing across transports.
//!
//! The router owns the phone-to-conversation link table so replies to
//! Chatwoot conversations can be addressed even when the triggering message
//! arrived over WhatsApp with a `chatwootConversationId` hint.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use cauce_core::{CauceError, MessageSource, TransportSender};

use crate::{ChatwootTransport, WhatsAppTransport};

/// Routes outbound text to the transport that owns the user.
#[derive(Default)]
pub struct OutboundRouter {
    whatsapp: Option<Arc<WhatsAppTransport>>,
    chatwoot: Option<Arc<ChatwootTransport>>,
    /// user_id -> Chatwoot conversation id.
    links: DashMap<String, String>,
}

impl OutboundRouter {
    pub fn new(
        whatsapp: Option<Arc<WhatsAppTransport>>,
        chatwoot: Option<Arc<ChatwootTransport>>,
    ) -> Self {
        Self {
            whatsapp,
            chatwoot,
            links: DashMap::new(),
        }
    }

    /// Record a phone-to-conversation link observed on an inbound message.
    pub fn link_conversation(&self, user_id: &str, conversation_id: &str) {
        self.links
            .insert(user_id.to_string(), conversation_id.to_string());
    }

    /// Look up the linked conversation for a user.
    pub fn conversation_for(&self, user_id: &str) -> Option<String> {
        self.links.get(user_id).map(|v| v.clone())
    }

    /// Whether the WhatsApp transport is configured.
    pub fn has_whatsapp(&self) -> bool {
        self.whatsapp.is_some()
    }

    /// Whether the Chatwoot transport is configured.
    pub fn has_chatwoot(&self) -> bool {
        self.chatwoot.is_some()
    }
}

#[async_trait]
impl TransportSender for OutboundRouter {
    async fn send_text(
        &self,
        user_id: &str,
        text: &str,
        source: MessageSource,
        conversation_id: Option<&str>,
    ) -> Result<(), CauceError> {
        match source {
            MessageSource::Whatsapp => {
                let transport = self.whatsapp.as_ref().ok_or(CauceError::Transport {
                    message: "whatsapp transport not configured".into(),
                    transient: false,
                })?;
                transport.send_text(user_id, text).await
            }
            MessageSource::Chatwoot => {
                let transport = self.chatwoot.as_ref().ok_or(CauceError::Transport {
                    message: "chatwoot transport not configured".into(),
                    transient: false,
                })?;
                let conversation = conversation_id
                    .map(|c| c.to_string())
                    .or_else(|| self.conversation_for(user_id))
                    .ok_or(CauceError::Transport {
                        message: format!("no conversation linked for user {user_id}"),
                        transient: false,
                    })?;
                transport.send_text(&conversation, text).await
            }
            MessageSource::Test => {
                // Test traffic answers synchronously through the gateway.
                debug!(user_id, "test source send is a no-op");
                Ok(())
            }
        }
    }
}
