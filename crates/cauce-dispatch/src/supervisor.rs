// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervisory signal handling: helpdesk events that pause or resume the
//! bot so a human can take over a conversation.
//!
//! Signal priority per event, highest first: `bot-active` tag, `bot-paused`
//! tag, conversation status, assignee, private-note command. Removing the
//! `bot-paused` tag resumes a user who was paused by that tag.

use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use cauce_core::{
    BotState, CauceError, ConversationUpdate, MessageSource, SupervisoryEvent, TransportSender,
};

use crate::gate::{BotStateGate, DEFAULT_PAUSE_TTL};

const TAG_ACTIVE: &str = "bot-active";
const TAG_PAUSED: &str = "bot-paused";

const REASON_TAG: &str = "tag";
const REASON_RESOLVED: &str = "conversation-resolved";
const REASON_ASSIGNED: &str = "agent-assigned";
const REASON_NOTE: &str = "private-note";

/// Courtesy text sent to the user when an agent pauses the bot by command.
const PAUSE_COURTESY: &str =
    "Un asesor del equipo va a continuar la conversación desde acá. ¡Gracias por la espera!";

/// Courtesy text sent when the bot resumes by command.
const RESUME_COURTESY: &str = "¡Seguimos por acá! Contame en qué te puedo ayudar.";

/// Interprets supervisory events and drives the bot-state gate.
pub struct SupervisoryHandler {
    gate: Arc<BotStateGate>,
    sender: Arc<dyn TransportSender>,
    note_command: Regex,
}

impl SupervisoryHandler {
    pub fn new(gate: Arc<BotStateGate>, sender: Arc<dyn TransportSender>) -> Self {
        Self {
            gate,
            sender,
            // Conservative grammar; anything else in a note is a no-op.
            note_command: Regex::new(r"(?i)^\s*/?bot\s+(pause|pausar|resume|activar|status|estado)\b")
                .expect("note command regex is valid"),
        }
    }

    /// Apply one supervisory event.
    pub async fn handle(&self, event: SupervisoryEvent) -> Result<(), CauceError> {
        match event {
            SupervisoryEvent::ConversationUpdate(update) => {
                self.handle_conversation_update(update).await
            }
            SupervisoryEvent::PrivateNote {
                user_id,
                conversation_id,
                text,
            } => {
                self.handle_private_note(&user_id, conversation_id.as_deref(), &text)
                    .await
            }
        }
    }

    async fn handle_conversation_update(&self, update: ConversationUpdate) -> Result<(), CauceError> {
        let user_id = &update.user_id;
        let has_active = update.labels.iter().any(|l| l == TAG_ACTIVE);
        let has_paused = update.labels.iter().any(|l| l == TAG_PAUSED);

        // 1. bot-active wins over everything, including bot-paused.
        if has_active {
            self.gate.force_activate(user_id).await?;
            return Ok(());
        }

        // 2. bot-paused tag.
        if has_paused {
            self.gate
                .pause(user_id, REASON_TAG, "agent", DEFAULT_PAUSE_TTL, false)
                .await?;
            return Ok(());
        }

        // Tag removal: resume only a tag-paused user.
        if self.paused_with_reason(user_id, REASON_TAG).await {
            self.gate.resume(user_id).await?;
        }

        // 3. Conversation status.
        match update.status.as_deref() {
            Some("resolved") | Some("closed") => {
                self.gate
                    .pause(user_id, REASON_RESOLVED, "system", DEFAULT_PAUSE_TTL, false)
                    .await?;
                return Ok(());
            }
            Some("open") | Some("pending") => {
                if self.paused_with_reason(user_id, REASON_RESOLVED).await {
                    self.gate.resume(user_id).await?;
                }
            }
            _ => {}
        }

        // 4. Assignee.
        match update.assignee_id {
            Some(_) => {
                self.gate
                    .pause(user_id, REASON_ASSIGNED, "system", DEFAULT_PAUSE_TTL, false)
                    .await?;
            }
            None => {
                if self.paused_with_reason(user_id, REASON_ASSIGNED).await {
                    self.gate.resume(user_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_private_note(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        text: &str,
    ) -> Result<(), CauceError> {
        let Some(captures) = self.note_command.captures(text) else {
            // Unrecognized notes are agent chatter, not commands.
            return Ok(());
        };
        let command = captures
            .get(1)
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_default();

        match command.as_str() {
            "pause" | "pausar" => {
                self.gate
                    .pause(user_id, REASON_NOTE, "agent", DEFAULT_PAUSE_TTL, false)
                    .await?;
                self.send_courtesy(user_id, conversation_id, PAUSE_COURTESY)
                    .await;
            }
            "resume" | "activar" => {
                self.gate.resume(user_id).await?;
                self.send_courtesy(user_id, conversation_id, RESUME_COURTESY)
                    .await;
            }
            "status" | "estado" => {
                let state = self.gate.state(user_id).await;
                info!(user_id, ?state, "bot status requested via note");
            }
            _ => {}
        }
        Ok(())
    }

    async fn paused_with_reason(&self, user_id: &str, reason: &str) -> bool {
        self.gate
            .state(user_id)
            .await
            .map(|s: BotState| s.paused && s.reason == reason)
            .unwrap_or(false)
    }

    async fn send_courtesy(&self, user_id: &str, conversation_id: Option<&str>, text: &str) {
        if let Err(e) = self
            .sender
            .send_text(user_id, text, MessageSource::Whatsapp, conversation_id)
            .await
        {
            warn!(error = %e, user_id, "courtesy message failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cauce_cache::MemoryCache;
    use cauce_storage::Database;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct NullSender {
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl TransportSender for NullSender {
        async fn send_text(
            &self,
            _user_id: &str,
            text: &str,
            _source: MessageSource,
            _conversation_id: Option<&str>,
        ) -> Result<(), CauceError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    async fn setup() -> (SupervisoryHandler, Arc<BotStateGate>, Arc<NullSender>, tempfile::TempDir)
    {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("sup.db").to_str().unwrap())
            .await
            .unwrap();
        let gate = Arc::new(BotStateGate::new(Arc::new(MemoryCache::new()), db));
        let sender = Arc::new(NullSender {
            sent: StdMutex::new(Vec::new()),
        });
        (
            SupervisoryHandler::new(gate.clone(), sender.clone()),
            gate,
            sender,
            dir,
        )
    }

    fn update(labels: &[&str], status: Option<&str>, assignee: Option<i64>) -> SupervisoryEvent {
        SupervisoryEvent::ConversationUpdate(ConversationUpdate {
            user_id: "5493515550000".into(),
            conversation_id: "42".into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            status: status.map(|s| s.to_string()),
            assignee_id: assignee,
        })
    }

    #[tokio::test]
    async fn paused_tag_pauses_user() {
        let (handler, gate, _sender, _dir) = setup().await;
        handler
            .handle(update(&["bot-paused"], Some("open"), None))
            .await
            .unwrap();
        assert!(gate.is_paused("5493515550000").await);
    }

    #[tokio::test]
    async fn active_tag_wins_over_paused_tag() {
        let (handler, gate, _sender, _dir) = setup().await;
        handler
            .handle(update(&["bot-paused", "bot-active"], Some("open"), None))
            .await
            .unwrap();
        assert!(!gate.is_paused("5493515550000").await);
    }

    #[tokio::test]
    async fn tag_removal_resumes_tag_paused_user() {
        let (handler, gate, _sender, _dir) = setup().await;
        handler
            .handle(update(&["bot-paused"], Some("open"), None))
            .await
            .unwrap();
        assert!(gate.is_paused("5493515550000").await);

        handler
            .handle(update(&[], Some("open"), None))
            .await
            .unwrap();
        assert!(!gate.is_paused("5493515550000").await);
    }

    #[tokio::test]
    async fn resolved_status_pauses_and_reopen_resumes() {
        let (handler, gate, _sender, _dir) = setup().await;
        handler
            .handle(update(&[], Some("resolved"), None))
            .await
            .unwrap();
        assert!(gate.is_paused("5493515550000").await);

        handler
            .handle(update(&[], Some("open"), None))
            .await
            .unwrap();
        assert!(!gate.is_paused("5493515550000").await);
    }

    #[tokio::test]
    async fn assignee_pauses_and_unassign_resumes() {
        let (handler, gate, _sender, _dir) = setup().await;
        handler
            .handle(update(&[], Some("open"), Some(7)))
            .await
            .unwrap();
        assert!(gate.is_paused("5493515550000").await);

        handler
            .handle(update(&[], Some("open"), None))
            .await
            .unwrap();
        assert!(!gate.is_paused("5493515550000").await);
    }

    #[tokio::test]
    async fn reopen_does_not_resume_manually_paused_user() {
        let (handler, gate, _sender, _dir) = setup().await;
        gate.pause(
            "5493515550000",
            "private-note",
            "agent",
            DEFAULT_PAUSE_TTL,
            false,
        )
        .await
        .unwrap();

        // Status flapping only resumes users paused for the matching reason.
        handler
            .handle(update(&[], Some("open"), None))
            .await
            .unwrap();
        assert!(gate.is_paused("5493515550000").await);
    }

    #[tokio::test]
    async fn note_pause_command_pauses_and_sends_courtesy() {
        let (handler, gate, sender, _dir) = setup().await;
        handler
            .handle(SupervisoryEvent::PrivateNote {
                user_id: "5493515550000".into(),
                conversation_id: Some("42".into()),
                text: "/bot pause".into(),
            })
            .await
            .unwrap();
        assert!(gate.is_paused("5493515550000").await);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn note_resume_command_resumes() {
        let (handler, gate, _sender, _dir) = setup().await;
        gate.pause("5493515550000", "tag", "agent", DEFAULT_PAUSE_TTL, false)
            .await
            .unwrap();

        handler
            .handle(SupervisoryEvent::PrivateNote {
                user_id: "5493515550000".into(),
                conversation_id: Some("42".into()),
                text: "bot resume".into(),
            })
            .await
            .unwrap();
        assert!(!gate.is_paused("5493515550000").await);
    }

    #[tokio::test]
    async fn unrecognized_note_is_noop() {
        let (handler, gate, sender, _dir) = setup().await;
        handler
            .handle(SupervisoryEvent::PrivateNote {
                user_id: "5493515550000".into(),
                conversation_id: None,
                text: "recordar llamar al cliente mañana".into(),
            })
            .await
            .unwrap();
        assert!(!gate.is_paused("5493515550000").await);
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_active_is_not_demoted_by_later_events() {
        let (handler, gate, _sender, _dir) = setup().await;
        handler
            .handle(update(&["bot-active"], Some("open"), None))
            .await
            .unwrap();

        // Later resolved status and assignee cannot pause a force-active user.
        handler
            .handle(update(&[], Some("resolved"), Some(7)))
            .await
            .unwrap();
        assert!(!gate.is_paused("5493515550000").await);
    }
}
