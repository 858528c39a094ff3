use crate::echo::SentIds;
use crate::lanes::{Enqueue, Lanes};
use chrono::{DateTime, Utc};
use parley_agent::{HistoryWindow, LlmBackend};
use parley_channels::InboundMessage;
use parley_core::{
    conversation_id, validate_connection_id, ActiveTraining, ChatMessage, Conversation,
    DeliveryStatus, ParleyError, ParleyResult,
};
use parley_session::{InboundSink, SessionRegistry};
use parley_store::DocumentStore;
use parley_training::{TrainingMatchEngine, TrainingRule, Transition};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Server part of a contact address when the caller gives a bare number.
pub const DEFAULT_CONTACT_SERVER: &str = "s.whatsapp.net";

const SENT_ID_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Prior messages included in the LLM prompt.
    pub history_window: usize,
    /// Upper bound on processing one inbound message, reply included.
    pub handler_timeout: Duration,
    /// Base persona placed before the training content.
    pub system_prompt: Option<String>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            history_window: 20,
            handler_timeout: Duration::from_secs(120),
            system_prompt: None,
        }
    }
}

/// What one inbound message led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Not a user message (broadcast or no text).
    Discarded,
    /// Our own send reported back by the network.
    Echo,
    /// Sent by the operator from the phone; recorded, never automated.
    OperatorMessage,
    AutomationDisabled,
    /// No rule is sticky and none matched.
    NoRule,
    /// The sticky rule ended on an exit keyword.
    Exited { replied: bool },
    Replied { training_id: String },
    /// The operator changed the conversation's training while the turn
    /// ran; the turn sent nothing.
    Superseded,
}

/// Result of an outbound send through the management API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReceipt {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub transport_message_id: Option<String>,
}

/// Partial update of the operator-editable conversation fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    pub automation_enabled: Option<bool>,
    /// Clear the sticky training.
    #[serde(default)]
    pub reset_training: bool,
    pub tags: Option<Vec<String>>,
    pub notes: Option<String>,
}

/// Turns transport messages into stored conversations and automated
/// replies.
///
/// Inbound messages and API sends of one conversation run strictly one
/// after another; different conversations run in parallel.
#[derive(Clone)]
pub struct MessageIngressPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn DocumentStore>,
    llm: Arc<dyn LlmBackend>,
    config: IngressConfig,
    lanes: Lanes<LaneJob>,
    sent: SentIds,
}

/// Work queued on a conversation's lane.
enum LaneJob {
    Inbound {
        connection_id: String,
        message: InboundMessage,
    },
    Send {
        connection_id: String,
        contact: String,
        text: String,
        reply: oneshot::Sender<ParleyResult<OutboundReceipt>>,
    },
}

impl MessageIngressPipeline {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn DocumentStore>,
        llm: Arc<dyn LlmBackend>,
        config: IngressConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                registry,
                store,
                llm,
                config,
                lanes: Lanes::new(),
                sent: SentIds::new(SENT_ID_CAPACITY),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// Process one message to completion, bypassing the lanes.
    pub async fn handle_message(
        &self,
        connection_id: &str,
        message: InboundMessage,
    ) -> ParleyResult<TurnOutcome> {
        self.inner.handle_message(connection_id, message).await
    }

    /// Send `text` to `to` on `connection_id` and record it.
    ///
    /// Runs on the conversation's lane, so the network's echo of this send
    /// is handled only after its id is known.
    pub async fn send_text(
        &self,
        connection_id: &str,
        to: &str,
        text: &str,
    ) -> ParleyResult<OutboundReceipt> {
        validate_connection_id(connection_id)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ParleyError::InvalidInput("message must not be empty".into()));
        }
        let contact = contact_address(to)?;
        self.inner.registry.connected_handle(connection_id)?;

        let (reply, receipt) = oneshot::channel();
        let key = conversation_id(connection_id, &contact);
        self.inner.submit(
            key,
            LaneJob::Send {
                connection_id: connection_id.to_string(),
                contact,
                text: text.to_string(),
                reply,
            },
        );
        receipt.await.map_err(|_| {
            ParleyError::Gateway(format!("send on conversation {key} ended without a result"))
        })?
    }

    pub async fn list_conversations(&self, connection_id: &str) -> ParleyResult<Vec<Conversation>> {
        validate_connection_id(connection_id)?;
        self.inner.store.list_conversations(connection_id).await
    }

    /// Recent messages of a conversation, oldest first. `None` when the
    /// conversation does not exist.
    pub async fn messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> ParleyResult<Option<Vec<ChatMessage>>> {
        if self.conversation(conversation_id).await?.is_none() {
            return Ok(None);
        }
        let messages = self
            .inner
            .store
            .recent_messages(conversation_id, limit)
            .await?;
        Ok(Some(messages))
    }

    pub async fn conversation(&self, conversation_id: Uuid) -> ParleyResult<Option<Conversation>> {
        self.inner.store.get_conversation(conversation_id).await
    }

    /// Apply `patch`. `None` when the conversation does not exist.
    pub async fn update_conversation(
        &self,
        conversation_id: Uuid,
        patch: ConversationPatch,
    ) -> ParleyResult<Option<Conversation>> {
        let updated = self
            .inner
            .store
            .modify_conversation(conversation_id, &mut |c: &mut Conversation| {
                if let Some(enabled) = patch.automation_enabled {
                    c.automation_enabled = enabled;
                }
                if patch.reset_training {
                    c.active_training = None;
                }
                if let Some(tags) = &patch.tags {
                    c.tags.clone_from(tags);
                }
                if let Some(notes) = &patch.notes {
                    c.notes = Some(notes.clone()).filter(|n| !n.is_empty());
                }
                c.updated_at = Utc::now();
                true
            })
            .await?;
        let Some(conversation) = updated else {
            return Ok(None);
        };
        info!(
            conversation_id = %conversation.id,
            automation = conversation.automation_enabled,
            training = conversation.active_training_id().unwrap_or("none"),
            "Conversation updated"
        );
        Ok(Some(conversation))
    }

    /// Number of conversations with a message in flight.
    pub fn busy_conversations(&self) -> usize {
        self.inner.lanes.busy()
    }
}

impl InboundSink for MessageIngressPipeline {
    fn dispatch(&self, connection_id: &str, message: InboundMessage) {
        if message.is_broadcast() || message.body().is_none() {
            debug!(connection_id, chat = %message.chat, "Discarding non-user message");
            return;
        }
        let key = conversation_id(connection_id, &message.chat);
        self.inner.submit(
            key,
            LaneJob::Inbound {
                connection_id: connection_id.to_string(),
                message,
            },
        );
    }
}

impl PipelineInner {
    /// Queue `job` on the lane `key`, taking the lane if it is idle.
    ///
    /// The holder runs each job in its own task, so a panicking job is
    /// logged and the lane moves on to the next one.
    fn submit(self: &Arc<Self>, key: Uuid, job: LaneJob) {
        let Enqueue::ProcessNow(first) = self.lanes.enqueue(key, job) else {
            debug!(conversation_id = %key, "Job queued behind in-flight turn");
            return;
        };

        let inner = self.clone();
        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(job) = next {
                let worker = inner.clone();
                if let Err(e) = tokio::spawn(async move { worker.run_job(job).await }).await {
                    error!(conversation_id = %key, error = %e, "Lane job panicked");
                }
                next = inner.lanes.next(key);
            }
        });
    }

    async fn run_job(self: Arc<Self>, job: LaneJob) {
        match job {
            LaneJob::Inbound {
                connection_id,
                message,
            } => self.run_turn(&connection_id, message).await,
            LaneJob::Send {
                connection_id,
                contact,
                text,
                reply,
            } => {
                let sent = tokio::time::timeout(
                    self.config.handler_timeout,
                    self.send_to_contact(&connection_id, &contact, &text),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(ParleyError::Transport(format!(
                        "send to {contact} timed out after {}s",
                        self.config.handler_timeout.as_secs()
                    )))
                });
                // The caller may have gone away.
                let _ = reply.send(sent);
            }
        }
    }

    async fn send_to_contact(
        &self,
        connection_id: &str,
        contact: &str,
        text: &str,
    ) -> ParleyResult<OutboundReceipt> {
        let mut conversation = self
            .store
            .get_or_create_conversation(connection_id, contact, None)
            .await?;
        let message = self.send_and_record(&mut conversation, text).await?;
        Ok(OutboundReceipt {
            conversation_id: conversation.id,
            message_id: message.id,
            transport_message_id: message.transport_message_id,
        })
    }

    async fn run_turn(&self, connection_id: &str, message: InboundMessage) {
        let message_id = message.id.clone();
        let turn = tokio::time::timeout(
            self.config.handler_timeout,
            self.handle_message(connection_id, message),
        )
        .await;
        match turn {
            Ok(Ok(outcome)) => debug!(connection_id, message_id = %message_id, ?outcome, "Turn complete"),
            Ok(Err(e)) => error!(connection_id, message_id = %message_id, error = %e, "Turn failed"),
            Err(_) => error!(
                connection_id,
                message_id = %message_id,
                timeout_secs = self.config.handler_timeout.as_secs(),
                "Turn timed out"
            ),
        }
    }

    async fn handle_message(
        &self,
        connection_id: &str,
        message: InboundMessage,
    ) -> ParleyResult<TurnOutcome> {
        if message.is_broadcast() {
            return Ok(TurnOutcome::Discarded);
        }
        let Some(body) = message.body() else {
            return Ok(TurnOutcome::Discarded);
        };

        if message.from_me {
            if self.sent.take(&message.id) {
                debug!(connection_id, message_id = %message.id, "Dropping echo of our own send");
                return Ok(TurnOutcome::Echo);
            }
            self.record_operator_message(connection_id, &message, body).await?;
            return Ok(TurnOutcome::OperatorMessage);
        }

        let mut conversation = self
            .store
            .get_or_create_conversation(connection_id, &message.chat, message.push_name.as_deref())
            .await?;
        let inbound = ChatMessage::inbound(&conversation, body)
            .with_transport_id(Some(message.id.clone()))
            .at(message.timestamp);
        self.store.append_message(&inbound).await?;
        self.touch(&mut conversation, body, message.timestamp).await;

        if !conversation.automation_enabled {
            debug!(connection_id, conversation_id = %conversation.id, "Automation disabled");
            return Ok(TurnOutcome::AutomationDisabled);
        }

        let rules = self.store.list_training_rules(connection_id).await?;
        let engine = TrainingMatchEngine::new(&rules);
        let resolution = engine.resolve(conversation.active_training.as_ref(), body, Utc::now());

        if let Some(expired) = &resolution.expired {
            info!(conversation_id = %conversation.id, training_id = %expired, "Sticky training expired");
        }
        if resolution.state_changed(conversation.active_training.as_ref())
            && !self
                .save_training(&mut conversation, resolution.state.clone())
                .await
        {
            return Ok(TurnOutcome::Superseded);
        }

        match resolution.transition {
            Transition::Idle => {
                debug!(
                    conversation_id = %conversation.id,
                    always_rule = engine.has_always_rule(),
                    "No training applies"
                );
                Ok(TurnOutcome::NoRule)
            }
            Transition::Exited => {
                let exited = resolution.exited.map_or("", |r| r.id.as_str());
                info!(conversation_id = %conversation.id, training_id = %exited, "Sticky training exited");
                match resolution.exit_reply() {
                    Some(reply) => {
                        if let Some(outcome) = self.preempted(&conversation).await? {
                            return Ok(outcome);
                        }
                        self.send_and_record(&mut conversation, reply).await?;
                        Ok(TurnOutcome::Exited { replied: true })
                    }
                    None => Ok(TurnOutcome::Exited { replied: false }),
                }
            }
            Transition::Activated | Transition::Continued => {
                let Some(rule) = resolution.rule else {
                    return Ok(TurnOutcome::NoRule);
                };
                if resolution.transition == Transition::Activated {
                    info!(conversation_id = %conversation.id, training_id = %rule.id, "Training activated");
                }
                let reply = self.compose_reply(&conversation, rule, &inbound).await?;
                if let Some(outcome) = self.preempted(&conversation).await? {
                    return Ok(outcome);
                }
                self.send_and_record(&mut conversation, &reply).await?;
                Ok(TurnOutcome::Replied {
                    training_id: rule.id.clone(),
                })
            }
        }
    }

    async fn compose_reply(
        &self,
        conversation: &Conversation,
        rule: &TrainingRule,
        inbound: &ChatMessage,
    ) -> ParleyResult<String> {
        let window = self.config.history_window;
        let mut recent = self
            .store
            .recent_messages(conversation.id, window.saturating_add(1))
            .await?;
        recent.retain(|m| m.id != inbound.id);
        if recent.len() > window {
            recent.drain(..recent.len() - window);
        }
        let history = HistoryWindow::from_messages(&recent, window);

        let system = match self.config.system_prompt.as_deref().map(str::trim) {
            Some(persona) if !persona.is_empty() => format!("{persona}\n\n{}", rule.content),
            _ => rule.content.clone(),
        };
        self.llm
            .complete(&system, history.turns(), &inbound.body)
            .await
    }

    /// Send through the live session and record the outbound message.
    ///
    /// Without a connected session nothing is recorded. A send the
    /// transport rejects is recorded as `Failed` and returned as an error.
    async fn send_and_record(
        &self,
        conversation: &mut Conversation,
        text: &str,
    ) -> ParleyResult<ChatMessage> {
        let handle = self.registry.connected_handle(&conversation.connection_id)?;
        let sent = handle.send(&conversation.contact, text).await;
        let mut outbound = ChatMessage::outbound(conversation, text);
        let result = match sent {
            Ok(sent) => {
                if let Some(id) = &sent.message_id {
                    self.sent.remember(id);
                }
                outbound = outbound.with_transport_id(sent.message_id);
                Ok(())
            }
            Err(e) => {
                outbound.delivery_status = DeliveryStatus::Failed;
                Err(e)
            }
        };

        if let Err(e) = self.store.append_message(&outbound).await {
            warn!(conversation_id = %conversation.id, error = %e, "Failed to persist outbound message");
        }
        if let Err(e) = result {
            warn!(
                connection_id = %conversation.connection_id,
                conversation_id = %conversation.id,
                error = %e,
                "Outbound send failed"
            );
            return Err(e);
        }
        self.touch(conversation, text, outbound.timestamp).await;
        debug!(conversation_id = %conversation.id, "Reply sent");
        Ok(outbound)
    }

    async fn record_operator_message(
        &self,
        connection_id: &str,
        message: &InboundMessage,
        body: &str,
    ) -> ParleyResult<()> {
        let mut conversation = self
            .store
            .get_or_create_conversation(connection_id, &message.chat, None)
            .await?;
        let outbound = ChatMessage::outbound(&conversation, body)
            .with_transport_id(Some(message.id.clone()))
            .at(message.timestamp);
        self.store.append_message(&outbound).await?;
        self.touch(&mut conversation, body, message.timestamp).await;
        debug!(connection_id, conversation_id = %conversation.id, "Recorded operator message");
        Ok(())
    }

    /// Record `body` as the latest message and adopt the stored record,
    /// which carries any operator edits made since `conversation` was read.
    async fn touch(&self, conversation: &mut Conversation, body: &str, at: DateTime<Utc>) {
        let touched = self
            .store
            .modify_conversation(conversation.id, &mut |c: &mut Conversation| {
                c.touch(body, at);
                true
            })
            .await;
        match touched {
            Ok(Some(stored)) => *conversation = stored,
            Ok(None) => warn!(conversation_id = %conversation.id, "Conversation missing on touch"),
            Err(e) => error!(conversation_id = %conversation.id, error = %e, "Failed to persist conversation"),
        }
    }

    /// Store `next` as the sticky training unless the stored value moved
    /// away from the one this turn resolved against. Returns `false` when it
    /// did. A failed write leaves the decision standing.
    async fn save_training(&self, conversation: &mut Conversation, next: Option<ActiveTraining>) -> bool {
        let seen = conversation.active_training.clone();
        let saved = self
            .store
            .modify_conversation(conversation.id, &mut |c: &mut Conversation| {
                if c.active_training != seen {
                    return false;
                }
                c.active_training.clone_from(&next);
                c.updated_at = Utc::now();
                true
            })
            .await;
        match saved {
            Ok(Some(stored)) if stored.active_training != next => {
                info!(
                    conversation_id = %conversation.id,
                    training = stored.active_training_id().unwrap_or("none"),
                    "Training changed during turn"
                );
                false
            }
            Ok(Some(stored)) => {
                *conversation = stored;
                true
            }
            Ok(None) => {
                warn!(conversation_id = %conversation.id, "Conversation missing on training update");
                true
            }
            Err(e) => {
                error!(conversation_id = %conversation.id, error = %e, "Failed to persist training state");
                true
            }
        }
    }

    /// Re-read the conversation before a reply goes out. `Some` when the
    /// operator disabled automation or changed the training meanwhile.
    async fn preempted(&self, conversation: &Conversation) -> ParleyResult<Option<TurnOutcome>> {
        let Some(current) = self.store.get_conversation(conversation.id).await? else {
            return Ok(Some(TurnOutcome::Superseded));
        };
        if !current.automation_enabled {
            debug!(conversation_id = %conversation.id, "Automation disabled during turn");
            return Ok(Some(TurnOutcome::AutomationDisabled));
        }
        if current.active_training != conversation.active_training {
            debug!(conversation_id = %conversation.id, "Training changed during turn");
            return Ok(Some(TurnOutcome::Superseded));
        }
        Ok(None)
    }
}

/// Normalize a caller-supplied recipient into a contact address.
///
/// Full addresses pass through; bare phone numbers keep their digits and
/// get [`DEFAULT_CONTACT_SERVER`].
pub fn contact_address(to: &str) -> ParleyResult<String> {
    let to = to.trim();
    if to.contains('@') {
        return Ok(to.to_string());
    }
    let digits: String = to.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(ParleyError::InvalidInput(format!("'{to}' is not a phone number")));
    }
    Ok(format!("{digits}@{DEFAULT_CONTACT_SERVER}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_address_normalizes_numbers() {
        assert_eq!(
            contact_address("+55 (11) 99999-0000").ok().as_deref(),
            Some("5511999990000@s.whatsapp.net")
        );
        assert_eq!(
            contact_address("120363@g.us").ok().as_deref(),
            Some("120363@g.us")
        );
        assert!(contact_address("nobody").is_err());
    }

    #[test]
    fn test_patch_deserializes_camel_case() {
        let patch: ConversationPatch =
            serde_json::from_str(r#"{"automationEnabled": false, "resetTraining": true}"#)
                .unwrap_or_default();
        assert_eq!(patch.automation_enabled, Some(false));
        assert!(patch.reset_training);
        assert!(patch.tags.is_none());
    }
}
