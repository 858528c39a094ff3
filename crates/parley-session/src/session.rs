use parley_channels::TransportHandle;
use parley_core::ConnectionStatus;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::AbortHandle;

/// A scheduled reconnect for one connection.
pub(crate) struct PendingReconnect {
    pub(crate) timer_id: u64,
    pub(crate) abort: AbortHandle,
}

/// Runtime state of one connection.
///
/// `generation` identifies the transport handle currently owned by the
/// session. Every open bumps it, and events tagged with an older
/// generation are ignored.
pub struct Session {
    pub connection_id: String,
    pub status: ConnectionStatus,
    pub handle: Option<Arc<dyn TransportHandle>>,
    /// Last pairing QR payload. Cleared once connected.
    pub last_qr: Option<String>,
    pub phone_number: Option<String>,
    pub display_user: Option<String>,
    pub generation: u64,
    /// Consecutive failed opens since the last successful one.
    pub attempts: u32,
    pub(crate) reconnect: Option<PendingReconnect>,
}

impl Session {
    pub fn connecting(connection_id: impl Into<String>, generation: u64) -> Self {
        Self {
            connection_id: connection_id.into(),
            status: ConnectionStatus::Connecting,
            handle: None,
            last_qr: None,
            phone_number: None,
            display_user: None,
            generation,
            attempts: 0,
            reconnect: None,
        }
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.reconnect.is_some()
    }

    /// Cancel any reconnect and drop the transport without logging out.
    pub fn shutdown(&mut self) {
        self.cancel_reconnect();
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }

    pub(crate) fn cancel_reconnect(&mut self) -> bool {
        match self.reconnect.take() {
            Some(pending) => {
                pending.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.connection_id.clone(),
            status: self.status,
            last_qr: self.last_qr.clone(),
            phone_number: self.phone_number.clone(),
            display_user: self.display_user.clone(),
            generation: self.generation,
            reconnect_pending: self.has_pending_reconnect(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("status", &self.status)
            .field("has_handle", &self.handle.is_some())
            .field("generation", &self.generation)
            .field("attempts", &self.attempts)
            .field("reconnect_pending", &self.has_pending_reconnect())
            .finish()
    }
}

/// Read-only copy of a [`Session`], safe to hold outside the registry lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub connection_id: String,
    pub status: ConnectionStatus,
    pub last_qr: Option<String>,
    pub phone_number: Option<String>,
    pub display_user: Option<String>,
    pub generation: u64,
    pub reconnect_pending: bool,
}

/// What the management surface reports for a connection id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub connection_id: String,
    pub status: ConnectionStatus,
    pub qr: Option<String>,
    pub phone_number: Option<String>,
    pub user: Option<String>,
    /// Reason for a terminal `Error` status.
    pub error: Option<String>,
}

impl ConnectionState {
    pub fn disconnected(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            status: ConnectionStatus::Disconnected,
            qr: None,
            phone_number: None,
            user: None,
            error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

impl From<SessionSnapshot> for ConnectionState {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            connection_id: snapshot.connection_id,
            status: snapshot.status,
            qr: snapshot.last_qr,
            phone_number: snapshot.phone_number,
            user: snapshot.display_user,
            error: None,
        }
    }
}
