use async_trait::async_trait;
use parley_core::{ChatMessage, ConnectionRecord, Conversation, ParleyResult};
use parley_training::TrainingRule;
use uuid::Uuid;

/// Durable store for the gateway's documents.
///
/// Each call is its own transaction; callers get no cross-call locking
/// beyond the atomic [`get_or_create_conversation`](Self::get_or_create_conversation)
/// and [`modify_conversation`](Self::modify_conversation).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert_connection(&self, record: &ConnectionRecord) -> ParleyResult<()>;
    async fn get_connection(&self, id: &str) -> ParleyResult<Option<ConnectionRecord>>;
    async fn list_connections(&self) -> ParleyResult<Vec<ConnectionRecord>>;

    /// Return the conversation for `(connection_id, contact)`, creating it
    /// if absent. Concurrent callers for the same pair get the same record.
    async fn get_or_create_conversation(
        &self,
        connection_id: &str,
        contact: &str,
        display_name: Option<&str>,
    ) -> ParleyResult<Conversation>;
    async fn get_conversation(&self, id: Uuid) -> ParleyResult<Option<Conversation>>;
    /// Apply `change` to the stored conversation as one read-modify-write.
    /// The record is written back only when `change` returns `true`.
    /// Returns the stored record after the call, or `None` if it is absent.
    async fn modify_conversation(
        &self,
        id: Uuid,
        change: &mut (dyn for<'c> FnMut(&'c mut Conversation) -> bool + Send),
    ) -> ParleyResult<Option<Conversation>>;
    /// Most recently active first.
    async fn list_conversations(&self, connection_id: &str) -> ParleyResult<Vec<Conversation>>;

    async fn append_message(&self, message: &ChatMessage) -> ParleyResult<()>;
    /// The last `limit` non-deleted messages, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> ParleyResult<Vec<ChatMessage>>;
    /// Returns `false` if the message does not exist or is already deleted.
    async fn soft_delete_message(&self, id: Uuid) -> ParleyResult<bool>;

    /// Validates the rule before writing it.
    async fn upsert_training_rule(&self, rule: &TrainingRule) -> ParleyResult<()>;
    async fn list_training_rules(&self, connection_id: &str) -> ParleyResult<Vec<TrainingRule>>;
    async fn delete_training_rule(&self, id: &str) -> ParleyResult<bool>;
}
