use crate::reconnect::ReconnectPolicy;
use crate::registry::SessionRegistry;
use crate::session::{ConnectionState, PendingReconnect, Session};
use chrono::Utc;
use parking_lot::Mutex;
use parley_channels::{CloseReason, InboundMessage, Transport, TransportEvent};
use parley_core::{
    validate_connection_id, ConnectionRecord, ConnectionStatus, CredentialBlob, ParleyError,
    ParleyResult,
};
use parley_store::{CredentialStore, DocumentStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Receives the user messages observed on every connection.
///
/// Called from the connection's event loop, so implementations hand the
/// message off and return quickly.
pub trait InboundSink: Send + Sync {
    fn dispatch(&self, connection_id: &str, message: InboundMessage);
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub reconnect: ReconnectPolicy,
    /// Capacity of each connection's event channel.
    pub event_buffer: usize,
    /// Limit on one transport open. An open that runs over is retried on
    /// the reconnect schedule.
    pub open_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            event_buffer: 256,
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Broadcast on every status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub connection_id: String,
    pub status: ConnectionStatus,
}

/// Outcome of [`ConnectionController::restore_all`].
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Ids whose session was started.
    pub restored: Vec<String>,
    /// Ids that could not be restored, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Owns session creation, teardown, credential persistence and reconnect
/// scheduling for every connection.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    store: Arc<dyn DocumentStore>,
    sink: Arc<dyn InboundSink>,
    config: ControllerConfig,
    /// Reasons for terminal closes, reported until the next start/stop.
    terminal: Mutex<HashMap<String, String>>,
    status_tx: broadcast::Sender<StatusChange>,
    next_generation: AtomicU64,
    next_timer: AtomicU64,
}

impl ConnectionController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn DocumentStore>,
        sink: Arc<dyn InboundSink>,
        config: ControllerConfig,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                registry,
                transport,
                credentials,
                store,
                sink,
                config,
                terminal: Mutex::new(HashMap::new()),
                status_tx,
                next_generation: AtomicU64::new(1),
                next_timer: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Start a session for `connection_id` unless one is already live.
    ///
    /// Resumes the stored pairing when a credential blob exists, otherwise
    /// begins a fresh pairing. A failed transport open is retried on the
    /// reconnect schedule rather than returned. Returns the status right
    /// after the attempt.
    pub async fn start(&self, connection_id: &str) -> ParleyResult<ConnectionStatus> {
        validate_connection_id(connection_id)?;
        if let Some(existing) = self.inner.registry.get(connection_id) {
            debug!(connection_id, status = %existing.status, "Session already live");
            return Ok(existing.status);
        }
        let credentials = self.inner.credentials.read(connection_id).await?;
        self.inner.start_with(connection_id, credentials).await
    }

    /// Log out, purge credentials and forget the session. Idempotent.
    pub async fn stop(&self, connection_id: &str) -> ParleyResult<()> {
        validate_connection_id(connection_id)?;
        let inner = &self.inner;
        inner.terminal.lock().remove(connection_id);

        if let Some(mut session) = inner.registry.remove(connection_id) {
            session.cancel_reconnect();
            if let Some(handle) = session.handle.take() {
                if let Err(e) = handle.logout().await {
                    warn!(connection_id, error = %e, "Logout failed; cleaning up locally");
                }
                handle.close();
            }
            info!(connection_id, "Session stopped");
        } else {
            debug!(connection_id, "Stop on absent session");
        }

        if let Err(e) = inner.credentials.delete(connection_id).await {
            error!(connection_id, error = %e, "Failed to delete credentials");
        }
        inner
            .record(ConnectionRecord::new(connection_id, ConnectionStatus::Disconnected))
            .await;
        inner.notify(connection_id, ConnectionStatus::Disconnected);
        Ok(())
    }

    /// Start a session for every connection with stored credentials.
    ///
    /// Connections are restored concurrently. A failure for one id is
    /// logged and does not stop the others.
    pub async fn restore_all(&self) -> ParleyResult<RestoreReport> {
        let ids = self.inner.credentials.list().await?;
        info!(count = ids.len(), "Restoring sessions from stored credentials");

        let mut restores = JoinSet::new();
        for id in ids {
            let inner = self.inner.clone();
            restores.spawn(async move {
                let blob = match inner.credentials.read(&id).await {
                    Ok(Some(blob)) => blob,
                    Ok(None) => return (id, Ok(None)),
                    Err(e) => {
                        warn!(connection_id = %id, error = %e, "Skipping unreadable credentials");
                        return (id, Err(e.to_string()));
                    }
                };
                match inner.start_with(&id, Some(blob)).await {
                    Ok(status) => (id, Ok(Some(status))),
                    Err(e) => {
                        warn!(connection_id = %id, error = %e, "Session restore failed");
                        (id, Err(e.to_string()))
                    }
                }
            });
        }

        let mut report = RestoreReport::default();
        while let Some(joined) = restores.join_next().await {
            match joined {
                Ok((id, Ok(Some(_)))) => report.restored.push(id),
                Ok((_, Ok(None))) => {}
                Ok((id, Err(reason))) => report.failed.push((id, reason)),
                Err(e) => error!(error = %e, "Session restore task failed"),
            }
        }
        report.restored.sort();
        report.failed.sort();

        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Session restore complete"
        );
        Ok(report)
    }

    pub fn status(&self, connection_id: &str) -> ConnectionState {
        if let Some(snapshot) = self.inner.registry.get(connection_id) {
            return snapshot.into();
        }
        match self.inner.terminal.lock().get(connection_id) {
            Some(reason) => ConnectionState {
                status: ConnectionStatus::Error,
                error: Some(reason.clone()),
                ..ConnectionState::disconnected(connection_id)
            },
            None => ConnectionState::disconnected(connection_id),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    /// Wait until `connection_id` is connected, or give up after `timeout`.
    pub async fn wait_for_connected(&self, connection_id: &str, timeout: Duration) -> bool {
        let mut changes = self.subscribe();
        if self.status(connection_id).is_connected() {
            return true;
        }
        let wait = async {
            loop {
                match changes.recv().await {
                    Ok(change) if change.connection_id == connection_id => {
                        match change.status {
                            ConnectionStatus::Connected => return true,
                            ConnectionStatus::Error | ConnectionStatus::Disconnected => {
                                return false
                            }
                            _ => {}
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.status(connection_id).is_connected() {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Whether a credential blob is stored for `connection_id`.
    pub async fn has_credentials(&self, connection_id: &str) -> bool {
        matches!(self.inner.credentials.read(connection_id).await, Ok(Some(_)))
    }

    /// Cancel all reconnects and close every transport without logging out.
    pub fn shutdown(&self) {
        let sessions = self.inner.registry.drain();
        for mut session in sessions {
            session.shutdown();
            debug!(connection_id = %session.connection_id, "Session closed for shutdown");
        }
        info!("Connection controller shut down");
    }
}

impl Inner {
    async fn start_with(
        self: &Arc<Self>,
        connection_id: &str,
        credentials: Option<CredentialBlob>,
    ) -> ParleyResult<ConnectionStatus> {
        validate_connection_id(connection_id)?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        if let Err(status) = self
            .registry
            .insert_if_absent(Session::connecting(connection_id, generation))
        {
            debug!(connection_id, %status, "Session already live");
            return Ok(status);
        }
        self.terminal.lock().remove(connection_id);
        info!(
            connection_id,
            resume = credentials.is_some(),
            "Session connecting"
        );
        self.record(ConnectionRecord::new(connection_id, ConnectionStatus::Connecting))
            .await;
        self.notify(connection_id, ConnectionStatus::Connecting);

        self.open(connection_id, generation, credentials).await;
        Ok(self
            .registry
            .get(connection_id)
            .map_or(ConnectionStatus::Disconnected, |s| s.status))
    }

    /// Open the transport for the session tagged `generation` and start its
    /// event loop. A retryable failure schedules a reconnect; any other
    /// failure ends the session in the error state.
    async fn open(
        self: &Arc<Self>,
        connection_id: &str,
        generation: u64,
        credentials: Option<CredentialBlob>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let timeout = self.config.open_timeout;
        let opened = tokio::time::timeout(
            timeout,
            self.transport.open(connection_id, credentials, events_tx),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ParleyError::Transport(format!(
                "open timed out after {}ms",
                timeout.as_millis()
            )))
        });
        let handle = match opened {
            Ok(handle) => handle,
            Err(e) if e.is_retryable() => {
                warn!(connection_id, error = %e, "Transport open failed");
                self.schedule_reconnect(connection_id, generation, &e.to_string());
                return;
            }
            Err(e) => {
                self.terminate(connection_id, generation, e).await;
                return;
            }
        };

        let installed = self
            .registry
            .update_current(connection_id, generation, |s| {
                s.handle = Some(handle.clone());
            })
            .is_some();
        if !installed {
            debug!(connection_id, generation, "Session gone during open; closing new transport");
            handle.close();
            return;
        }

        let inner = self.clone();
        let id = connection_id.to_string();
        tokio::spawn(async move {
            inner.run_events(id, generation, events_rx).await;
        });
    }

    async fn run_events(
        self: Arc<Self>,
        connection_id: String,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let mut closed = false;
        while let Some(event) = events.recv().await {
            if !self.registry.is_current(&connection_id, generation) {
                debug!(connection_id = %connection_id, generation, "Ignoring event from superseded transport");
                return;
            }
            closed |= matches!(event, TransportEvent::Closed(_));
            self.handle_event(&connection_id, generation, event).await;
        }

        if !closed && self.registry.is_current(&connection_id, generation) {
            self.handle_close(
                &connection_id,
                generation,
                CloseReason::connection_lost("event stream ended"),
            )
            .await;
        }
    }

    async fn handle_event(self: &Arc<Self>, connection_id: &str, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::QrIssued(qr) => {
                let updated = self.registry.update_current(connection_id, generation, |s| {
                    s.status = ConnectionStatus::QrPending;
                    s.last_qr = Some(qr);
                });
                if updated.is_some() {
                    info!(connection_id, "Pairing QR issued");
                    self.record(ConnectionRecord::new(connection_id, ConnectionStatus::QrPending))
                        .await;
                    self.notify(connection_id, ConnectionStatus::QrPending);
                }
            }
            TransportEvent::Opened(user) => {
                let phone = user.phone_number();
                let display = user.name.clone().unwrap_or_else(|| user.id.clone());
                let updated = self.registry.update_current(connection_id, generation, |s| {
                    s.status = ConnectionStatus::Connected;
                    s.last_qr = None;
                    s.phone_number = Some(phone.clone());
                    s.display_user = Some(display.clone());
                    s.attempts = 0;
                    s.cancel_reconnect();
                });
                if updated.is_some() {
                    info!(connection_id, phone_number = %phone, "Session connected");
                    let mut record = ConnectionRecord::new(connection_id, ConnectionStatus::Connected);
                    record.phone_number = Some(phone);
                    record.display_user = Some(display);
                    self.record(record).await;
                    self.notify(connection_id, ConnectionStatus::Connected);
                }
            }
            TransportEvent::CredentialsUpdated(blob) => {
                match self.credentials.write(connection_id, &blob).await {
                    Ok(()) => debug!(connection_id, "Credentials saved"),
                    Err(e) => error!(connection_id, error = %e, "Failed to save credentials"),
                }
            }
            TransportEvent::Message(message) => self.sink.dispatch(connection_id, message),
            TransportEvent::Closed(reason) => {
                self.handle_close(connection_id, generation, reason).await;
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, connection_id: &str, generation: u64, reason: CloseReason) {
        if !reason.is_terminal() {
            self.schedule_reconnect(connection_id, generation, &reason.to_string());
            return;
        }
        let rejected = ParleyError::AuthRejected(format!("{reason}; pair again"));
        self.terminate(connection_id, generation, rejected).await;
    }

    /// End the session tagged `generation` in the error state. Rejected
    /// pairings also lose their credentials.
    async fn terminate(self: &Arc<Self>, connection_id: &str, generation: u64, cause: ParleyError) {
        let Some(mut session) = self.registry.remove_if_generation(connection_id, generation) else {
            return;
        };
        session.shutdown();
        warn!(connection_id, error = %cause, "Session ended");

        if matches!(cause, ParleyError::AuthRejected(_)) {
            if let Err(e) = self.credentials.delete(connection_id).await {
                error!(connection_id, error = %e, "Failed to delete rejected credentials");
            }
        }
        let message = cause.to_string();
        self.terminal
            .lock()
            .insert(connection_id.to_string(), message.clone());
        let mut record = ConnectionRecord::new(connection_id, ConnectionStatus::Error);
        record.last_error = Some(message);
        self.record(record).await;
        self.notify(connection_id, ConnectionStatus::Error);
    }

    /// Replace any pending reconnect for the session with a fresh timer.
    fn schedule_reconnect(self: &Arc<Self>, connection_id: &str, generation: u64, cause: &str) {
        let timer_id = self.next_timer.fetch_add(1, Ordering::SeqCst);
        let policy = self.config.reconnect;

        let scheduled = self.registry.update_current(connection_id, generation, |s| {
            let replaced = s.cancel_reconnect();
            if let Some(handle) = s.handle.take() {
                handle.close();
            }
            s.status = ConnectionStatus::Connecting;
            s.last_qr = None;

            let delay = policy.delay(s.attempts);
            if !replaced {
                s.attempts = s.attempts.saturating_add(1);
            }
            let inner = self.clone();
            let id = s.connection_id.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.fire_reconnect(id, timer_id).await;
            });
            s.reconnect = Some(PendingReconnect {
                timer_id,
                abort: task.abort_handle(),
            });
            (delay, replaced)
        });

        match scheduled {
            Some((delay, replaced)) => {
                info!(
                    connection_id,
                    cause,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    replaced,
                    "Reconnect scheduled"
                );
                self.notify(connection_id, ConnectionStatus::Connecting);
            }
            None => debug!(connection_id, generation, "Close for superseded transport ignored"),
        }
    }

    async fn fire_reconnect(self: Arc<Self>, connection_id: String, timer_id: u64) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let claimed = self
            .registry
            .update(&connection_id, |s| match &s.reconnect {
                Some(pending) if pending.timer_id == timer_id => {
                    s.reconnect = None;
                    s.generation = generation;
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        if !claimed {
            debug!(connection_id = %connection_id, timer_id, "Reconnect timer superseded");
            return;
        }

        let credentials = match self.credentials.read(&connection_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Unreadable credentials on reconnect");
                None
            }
        };
        info!(connection_id = %connection_id, generation, "Reconnecting");
        self.open(&connection_id, generation, credentials).await;
    }

    async fn record(&self, mut record: ConnectionRecord) {
        record.updated_at = Utc::now();
        if let Err(e) = self.store.upsert_connection(&record).await {
            warn!(connection_id = %record.id, error = %e, "Failed to persist connection record");
        }
    }

    fn notify(&self, connection_id: &str, status: ConnectionStatus) {
        let _ = self.status_tx.send(StatusChange {
            connection_id: connection_id.to_string(),
            status,
        });
    }
}
