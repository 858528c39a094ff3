use crate::transport::{
    CloseReason, InboundMessage, SentMessage, Transport, TransportEvent, TransportHandle,
    UserInfo,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{CredentialBlob, ParleyError, ParleyResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A message sent through a [`LoopbackHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub connection_id: String,
    pub to: String,
    pub text: String,
    pub message_id: String,
}

struct LiveConnection {
    events: mpsc::Sender<TransportEvent>,
    handle: Arc<LoopbackHandle>,
}

#[derive(Default)]
struct LoopbackState {
    live: HashMap<String, LiveConnection>,
    opens: Vec<(String, Option<CredentialBlob>)>,
    failing_opens: usize,
    failing_sends: bool,
    sent: Vec<SentRecord>,
}

/// In-process transport driven from code.
///
/// Useful for local development without a bridge and for exercising the
/// session controller and ingress pipeline: tests push QR codes, pairing,
/// closes and inbound messages, and read back what was sent.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
    auto_pair: bool,
    echo_sends: bool,
    next_message: Arc<AtomicU64>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair immediately on open: emits `CredentialsUpdated` for fresh
    /// pairings, then `Opened`. The event buffer must hold two events.
    pub fn with_auto_pair(mut self) -> Self {
        self.auto_pair = true;
        self
    }

    /// Report every send back as a `from_me` message before the send
    /// returns, the way the network may deliver the echo ahead of the send
    /// acknowledgement.
    pub fn with_echoes(mut self) -> Self {
        self.echo_sends = true;
        self
    }

    /// Make the next `n` calls to `open` fail with a transport error.
    pub fn fail_next_opens(&self, n: usize) {
        self.state.lock().failing_opens = n;
    }

    pub fn fail_sends(&self, failing: bool) {
        self.state.lock().failing_sends = failing;
    }

    /// How many times `open` succeeded for `connection_id`.
    pub fn open_count(&self, connection_id: &str) -> usize {
        self.state
            .lock()
            .opens
            .iter()
            .filter(|(id, _)| id == connection_id)
            .count()
    }

    /// Credentials passed to each successful `open`, oldest first.
    pub fn opened_with(&self, connection_id: &str) -> Vec<Option<CredentialBlob>> {
        self.state
            .lock()
            .opens
            .iter()
            .filter(|(id, _)| id == connection_id)
            .map(|(_, creds)| creds.clone())
            .collect()
    }

    /// The most recently opened handle for `connection_id`.
    pub fn handle(&self, connection_id: &str) -> Option<Arc<LoopbackHandle>> {
        self.state
            .lock()
            .live
            .get(connection_id)
            .map(|c| c.handle.clone())
    }

    pub fn sent(&self, connection_id: &str) -> Vec<SentRecord> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|r| r.connection_id == connection_id)
            .cloned()
            .collect()
    }

    /// Push an event on the latest connection for `connection_id`.
    pub async fn emit(&self, connection_id: &str, event: TransportEvent) -> ParleyResult<()> {
        let events = self
            .state
            .lock()
            .live
            .get(connection_id)
            .map(|c| c.events.clone())
            .ok_or_else(|| ParleyError::NotConnected(connection_id.to_string()))?;
        events
            .send(event)
            .await
            .map_err(|_| ParleyError::NotConnected(format!("{connection_id} event receiver dropped")))
    }

    pub async fn issue_qr(&self, connection_id: &str, payload: &str) -> ParleyResult<()> {
        self.emit(connection_id, TransportEvent::QrIssued(payload.to_string()))
            .await
    }

    /// Complete pairing as `user_id`, storing fresh credentials first.
    pub async fn pair(&self, connection_id: &str, user_id: &str) -> ParleyResult<()> {
        self.emit(
            connection_id,
            TransportEvent::CredentialsUpdated(paired_blob(connection_id)),
        )
        .await?;
        self.emit(
            connection_id,
            TransportEvent::Opened(UserInfo {
                id: user_id.to_string(),
                name: None,
            }),
        )
        .await
    }

    /// Mark the latest handle closed and report `reason`.
    pub async fn drop_connection(&self, connection_id: &str, reason: CloseReason) -> ParleyResult<()> {
        if let Some(handle) = self.handle(connection_id) {
            handle.closed.store(true, Ordering::SeqCst);
        }
        self.emit(connection_id, TransportEvent::Closed(reason)).await
    }

    pub async fn deliver(&self, connection_id: &str, message: InboundMessage) -> ParleyResult<()> {
        self.emit(connection_id, TransportEvent::Message(message))
            .await
    }
}

fn paired_blob(connection_id: &str) -> CredentialBlob {
    CredentialBlob(serde_json::json!({
        "transport": "loopback",
        "connection_id": connection_id,
        "paired": true,
    }))
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(
        &self,
        connection_id: &str,
        credentials: Option<CredentialBlob>,
        events: mpsc::Sender<TransportEvent>,
    ) -> ParleyResult<Arc<dyn TransportHandle>> {
        let handle = {
            let mut state = self.state.lock();
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(ParleyError::Transport(format!(
                    "loopback open refused for {connection_id}"
                )));
            }
            let handle = Arc::new(LoopbackHandle {
                connection_id: connection_id.to_string(),
                closed: AtomicBool::new(false),
                logged_out: AtomicBool::new(false),
                state: self.state.clone(),
                next_message: self.next_message.clone(),
                echo: self.echo_sends.then(|| events.clone()),
            });
            state.opens.push((connection_id.to_string(), credentials.clone()));
            state.live.insert(
                connection_id.to_string(),
                LiveConnection {
                    events: events.clone(),
                    handle: handle.clone(),
                },
            );
            handle
        };
        info!(connection_id, resumed = credentials.is_some(), "Loopback connection opened");

        if self.auto_pair {
            if credentials.is_none() {
                let _ = events.try_send(TransportEvent::CredentialsUpdated(paired_blob(
                    connection_id,
                )));
            }
            let _ = events.try_send(TransportEvent::Opened(UserInfo {
                id: format!("{connection_id}@loopback"),
                name: Some(connection_id.to_string()),
            }));
        }
        Ok(handle)
    }
}

pub struct LoopbackHandle {
    connection_id: String,
    closed: AtomicBool,
    logged_out: AtomicBool,
    state: Arc<Mutex<LoopbackState>>,
    next_message: Arc<AtomicU64>,
    echo: Option<mpsc::Sender<TransportEvent>>,
}

impl LoopbackHandle {
    pub fn was_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportHandle for LoopbackHandle {
    async fn send(&self, to: &str, text: &str) -> ParleyResult<SentMessage> {
        if self.is_closed() {
            return Err(ParleyError::NotConnected(self.connection_id.clone()));
        }
        let message_id = {
            let mut state = self.state.lock();
            if state.failing_sends {
                return Err(ParleyError::Transport(format!("loopback send to {to} failed")));
            }
            let message_id = format!("LOOP{}", self.next_message.fetch_add(1, Ordering::SeqCst));
            state.sent.push(SentRecord {
                connection_id: self.connection_id.clone(),
                to: to.to_string(),
                text: text.to_string(),
                message_id: message_id.clone(),
            });
            message_id
        };
        debug!(connection_id = %self.connection_id, to, "Loopback message sent");

        if let Some(echo) = &self.echo {
            let mut message = InboundMessage::text(message_id.clone(), to, text);
            message.from_me = true;
            let _ = echo.send(TransportEvent::Message(message)).await;
            // Let the echo be consumed before the acknowledgement.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(SentMessage {
            message_id: Some(message_id),
        })
    }

    async fn logout(&self) -> ParleyResult<()> {
        if self.is_closed() {
            return Err(ParleyError::NotConnected(self.connection_id.clone()));
        }
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_records_credentials() {
        let transport = LoopbackTransport::new();
        let (tx, _rx) = mpsc::channel(8);
        transport.open("shop1", None, tx.clone()).await.unwrap();
        let blob = CredentialBlob(serde_json::json!({"k": 1}));
        transport.open("shop1", Some(blob.clone()), tx).await.unwrap();

        assert_eq!(transport.open_count("shop1"), 2);
        assert_eq!(transport.opened_with("shop1"), vec![None, Some(blob)]);
        assert_eq!(transport.open_count("other"), 0);
    }

    #[tokio::test]
    async fn test_fail_next_opens() {
        let transport = LoopbackTransport::new();
        transport.fail_next_opens(1);
        let (tx, _rx) = mpsc::channel(8);
        let err = transport.open("shop1", None, tx.clone()).await.err().unwrap();
        assert!(matches!(err, ParleyError::Transport(_)));
        assert!(transport.open("shop1", None, tx).await.is_ok());
        assert_eq!(transport.open_count("shop1"), 1);
    }

    #[tokio::test]
    async fn test_auto_pair_emits_credentials_then_opened() {
        let transport = LoopbackTransport::new().with_auto_pair();
        let (tx, mut rx) = mpsc::channel(8);
        transport.open("shop1", None, tx).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::CredentialsUpdated(_))
        ));
        match rx.recv().await {
            Some(TransportEvent::Opened(user)) => assert_eq!(user.phone_number(), "shop1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_is_recorded_and_closed_handle_refuses() {
        let transport = LoopbackTransport::new();
        let (tx, _rx) = mpsc::channel(8);
        let handle = transport.open("shop1", None, tx).await.unwrap();

        let sent = handle.send("5511@s.whatsapp.net", "oi").await.unwrap();
        assert!(sent.message_id.is_some());
        assert_eq!(transport.sent("shop1")[0].text, "oi");

        handle.close();
        let err = handle.send("5511@s.whatsapp.net", "again").await.unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(transport.sent("shop1").len(), 1);
    }

    #[tokio::test]
    async fn test_echoes_arrive_before_send_returns() {
        let transport = LoopbackTransport::new().with_echoes();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = transport.open("shop1", None, tx).await.unwrap();

        let sent = handle.send("5511@s.whatsapp.net", "oi").await.unwrap();
        match rx.try_recv() {
            Ok(TransportEvent::Message(echo)) => {
                assert!(echo.from_me);
                assert_eq!(echo.chat, "5511@s.whatsapp.net");
                assert_eq!(echo.body(), Some("oi"));
                assert_eq!(Some(echo.id), sent.message_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drop_connection_closes_handle_and_reports() {
        let transport = LoopbackTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = transport.open("shop1", None, tx).await.unwrap();

        transport
            .drop_connection("shop1", CloseReason::new(428, "closed"))
            .await
            .unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Closed(CloseReason { code: 428, .. }))
        ));
    }
}
