use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PREVIEW_CHARS: usize = 120;

/// Transport state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No session exists.
    Disconnected,
    /// A transport open is in flight or a reconnect is scheduled.
    Connecting,
    /// The transport issued a pairing QR code and is waiting for a scan.
    QrPending,
    /// The transport is open and can send.
    Connected,
    /// The connection was terminally rejected and needs to be paired again.
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable view of a connection's last known state.
///
/// Written by the connection controller on every transition; the live
/// source of truth is the in-memory session registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub status: ConnectionStatus,
    pub phone_number: Option<String>,
    pub display_user: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(id: impl Into<String>, status: ConnectionStatus) -> Self {
        Self {
            id: id.into(),
            status,
            phone_number: None,
            display_user: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// The training rule currently governing automated replies in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTraining {
    pub training_id: String,
    pub started_at: DateTime<Utc>,
    /// Last turn the rule governed. Inactivity is measured from here.
    pub last_activity_at: DateTime<Utc>,
}

impl ActiveTraining {
    pub fn start(training_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            training_id: training_id.into(),
            started_at: now,
            last_activity_at: now,
        }
    }
}

/// One contact's thread on one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Derived from `(connection_id, contact)`, see [`crate::conversation_id`].
    pub id: Uuid,
    pub connection_id: String,
    /// Transport address of the contact; replies are sent here.
    pub contact: String,
    pub display_name: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub automation_enabled: bool,
    /// Sticky rule. Kept as one value so id and timestamps cannot diverge.
    pub active_training: Option<ActiveTraining>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh conversation with automation on and no sticky rule.
    pub fn new(connection_id: impl Into<String>, contact: impl Into<String>) -> Self {
        let connection_id = connection_id.into();
        let contact = contact.into();
        let now = Utc::now();
        Self {
            id: crate::conversation_id(&connection_id, &contact),
            connection_id,
            contact,
            display_name: None,
            last_message_preview: None,
            last_message_at: None,
            automation_enabled: true,
            active_training: None,
            tags: Vec::new(),
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record `body` as the latest message of the thread.
    pub fn touch(&mut self, body: &str, at: DateTime<Utc>) {
        self.last_message_preview = Some(preview_of(body));
        self.last_message_at = Some(at);
        self.updated_at = Utc::now();
    }

    pub fn active_training_id(&self) -> Option<&str> {
        self.active_training.as_ref().map(|a| a.training_id.as_str())
    }
}

/// Opaque pairing credentials written by the transport.
///
/// The gateway never looks inside; it stores the payload and hands it
/// back to the transport on the next open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialBlob(pub serde_json::Value);

/// Direction of a message relative to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Received,
    Sent,
    Failed,
}

/// A single message in a conversation. Append-only; removal is a soft delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub connection_id: String,
    pub direction: Direction,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    /// Id assigned by the messaging network, when known.
    pub transport_message_id: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    fn new(
        conversation: &Conversation,
        direction: Direction,
        body: impl Into<String>,
        delivery_status: DeliveryStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            connection_id: conversation.connection_id.clone(),
            direction,
            body: body.into(),
            timestamp: Utc::now(),
            delivery_status,
            transport_message_id: None,
            deleted_at: None,
        }
    }

    /// A message received from the contact.
    pub fn inbound(conversation: &Conversation, body: impl Into<String>) -> Self {
        Self::new(conversation, Direction::Inbound, body, DeliveryStatus::Received)
    }

    /// A message sent to the contact.
    pub fn outbound(conversation: &Conversation, body: impl Into<String>) -> Self {
        Self::new(conversation, Direction::Outbound, body, DeliveryStatus::Sent)
    }

    pub fn with_transport_id(mut self, id: Option<String>) -> Self {
        self.transport_message_id = id;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Shorten `body` to a one-line preview on a char boundary.
pub fn preview_of(body: &str) -> String {
    let flat: String = body
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let trimmed = flat.trim();
    if trimmed.chars().count() <= PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(PREVIEW_CHARS - 1).collect();
    out.push('…');
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_conversation_defaults() {
        let conv = Conversation::new("shop1", "5511999990000");
        assert!(conv.automation_enabled);
        assert!(conv.active_training.is_none());
        assert_eq!(conv.id, crate::conversation_id("shop1", "5511999990000"));
    }

    #[test]
    fn test_touch_sets_preview() {
        let mut conv = Conversation::new("shop1", "c");
        let at = Utc::now();
        conv.touch("hello\nthere", at);
        assert_eq!(conv.last_message_preview.as_deref(), Some("hello there"));
        assert_eq!(conv.last_message_at, Some(at));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "ç".repeat(500);
        let preview = preview_of(&long);
        assert_eq!(preview.chars().count(), PREVIEW_CHARS);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn test_status_display_matches_wire_name() {
        for status in [
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::QrPending,
            ConnectionStatus::Connected,
            ConnectionStatus::Error,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionStatus::QrPending).unwrap();
        assert_eq!(json, "\"qr_pending\"");
    }
}
