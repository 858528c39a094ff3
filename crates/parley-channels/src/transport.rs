use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{CredentialBlob, ParleyResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Account the transport is logged in as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Network address, e.g. `5511999990000:12@s.whatsapp.net`.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl UserInfo {
    /// The bare number: the address without device suffix or server.
    pub fn phone_number(&self) -> String {
        let local = self.id.split('@').next().unwrap_or_default();
        local.split(':').next().unwrap_or_default().to_string()
    }
}

/// Why a transport connection closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReason {
    pub code: u16,
    #[serde(default)]
    pub message: String,
}

impl CloseReason {
    /// The network logged this device out. Do not retry.
    pub const LOGGED_OUT: u16 = 401;
    /// The socket to the transport dropped without a close frame.
    pub const CONNECTION_LOST: u16 = 0;

    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn logged_out() -> Self {
        Self::new(Self::LOGGED_OUT, "logged out")
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(Self::CONNECTION_LOST, message)
    }

    /// Terminal closes must not be retried.
    pub fn is_terminal(&self) -> bool {
        self.code == Self::LOGGED_OUT
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {}: {}", self.code, self.message)
        }
    }
}

/// A message observed on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Network message id.
    pub id: String,
    /// Chat address the message belongs to.
    pub chat: String,
    /// Sent by this account (from the gateway or from the phone itself).
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(id: impl Into<String>, chat: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat: chat.into(),
            from_me: false,
            push_name: None,
            text: Some(text.into()),
            timestamp: Utc::now(),
        }
    }

    /// Status updates and broadcast lists, not a person-to-person chat.
    pub fn is_broadcast(&self) -> bool {
        self.chat.ends_with("@broadcast") || self.chat.ends_with("@newsletter")
    }

    /// Trimmed text payload, if any.
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A pairing QR payload to show the user. Replaces any earlier one.
    QrIssued(String),
    Opened(UserInfo),
    Closed(CloseReason),
    /// Pairing credentials were created or refreshed.
    CredentialsUpdated(CredentialBlob),
    Message(InboundMessage),
}

/// Result of a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: Option<String>,
}

/// Opens connections to the messaging network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection for `connection_id`.
    ///
    /// With `credentials` the transport resumes the stored pairing;
    /// without, it starts a fresh pairing flow and emits
    /// [`TransportEvent::QrIssued`]. Every later event for this connection
    /// goes to `events`.
    async fn open(
        &self,
        connection_id: &str,
        credentials: Option<CredentialBlob>,
        events: mpsc::Sender<TransportEvent>,
    ) -> ParleyResult<Arc<dyn TransportHandle>>;
}

/// One open connection.
///
/// Once the underlying socket is gone every operation fails with
/// `ParleyError::NotConnected`.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn send(&self, to: &str, text: &str) -> ParleyResult<SentMessage>;

    /// Unpair this device from the network.
    async fn logout(&self) -> ParleyResult<()>;

    /// Drop the connection without unpairing. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
