use crate::transport::{
    CloseReason, InboundMessage, SentMessage, Transport, TransportEvent, TransportHandle,
    UserInfo,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_core::{CredentialBlob, ParleyError, ParleyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Where the bridge listens and how long to wait for send acknowledgements.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// WebSocket URL, e.g. `ws://127.0.0.1:8790/ws`.
    pub url: String,
    pub send_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            send_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

/// Frames sent to the bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Open {
        connection_id: String,
        credentials: Option<serde_json::Value>,
    },
    Send {
        request_id: String,
        to: String,
        text: String,
    },
    Logout,
    Close,
}

/// Frames received from the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Qr {
        data: String,
    },
    Open {
        user: UserInfo,
    },
    Close {
        code: u16,
        #[serde(default)]
        message: String,
    },
    Creds {
        data: serde_json::Value,
    },
    Message {
        id: String,
        chat: String,
        #[serde(default)]
        from_me: bool,
        #[serde(default)]
        push_name: Option<String>,
        #[serde(default)]
        text: Option<String>,
        /// Unix seconds.
        timestamp: i64,
    },
    SendResult {
        request_id: String,
        ok: bool,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

struct SendOutcome {
    ok: bool,
    message_id: Option<String>,
    error: Option<String>,
}

type PendingSends = Arc<Mutex<HashMap<String, oneshot::Sender<SendOutcome>>>>;

/// Transport backed by an external bridge process that owns the actual
/// messaging-network protocol. One WebSocket per connection.
pub struct BridgeTransport {
    config: BridgeConfig,
}

impl BridgeTransport {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn open(
        &self,
        connection_id: &str,
        credentials: Option<CredentialBlob>,
        events: mpsc::Sender<TransportEvent>,
    ) -> ParleyResult<Arc<dyn TransportHandle>> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| ParleyError::Transport(format!("bridge connect error: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let hello = ClientFrame::Open {
            connection_id: connection_id.to_string(),
            credentials: credentials.map(|c| c.0),
        };
        write
            .send(Message::Text(serde_json::to_string(&hello)?))
            .await
            .map_err(|e| ParleyError::Transport(format!("bridge handshake error: {e}")))?;
        info!(connection_id, url = %self.config.url, "Bridge connection opened");

        let closed = Arc::new(AtomicBool::new(false));
        let pending: PendingSends = Arc::new(Mutex::new(HashMap::new()));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();

        let writer_conn = connection_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let last = matches!(frame, ClientFrame::Close);
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection_id = %writer_conn, error = %e, "Unserializable bridge frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!(connection_id = %writer_conn, error = %e, "Bridge write failed");
                    break;
                }
                if last {
                    let _ = write.close().await;
                    break;
                }
            }
        });

        let reader_conn = connection_id.to_string();
        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut reason = CloseReason::connection_lost("bridge socket closed");
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        reason = CloseReason::connection_lost(e.to_string());
                        break;
                    }
                };
                let frame = match serde_json::from_str::<BridgeFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(connection_id = %reader_conn, error = %e, "Unrecognized bridge frame");
                        continue;
                    }
                };
                let event = match frame {
                    BridgeFrame::Qr { data } => TransportEvent::QrIssued(data),
                    BridgeFrame::Open { user } => TransportEvent::Opened(user),
                    BridgeFrame::Creds { data } => {
                        TransportEvent::CredentialsUpdated(CredentialBlob(data))
                    }
                    BridgeFrame::Message {
                        id,
                        chat,
                        from_me,
                        push_name,
                        text,
                        timestamp,
                    } => TransportEvent::Message(InboundMessage {
                        id,
                        chat,
                        from_me,
                        push_name,
                        text,
                        timestamp: DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now),
                    }),
                    BridgeFrame::SendResult {
                        request_id,
                        ok,
                        message_id,
                        error,
                    } => {
                        if let Some(waiter) = reader_pending.lock().remove(&request_id) {
                            let _ = waiter.send(SendOutcome {
                                ok,
                                message_id,
                                error,
                            });
                        }
                        continue;
                    }
                    BridgeFrame::Close { code, message } => {
                        reason = CloseReason::new(code, message);
                        break;
                    }
                };
                if events.send(event).await.is_err() {
                    debug!(connection_id = %reader_conn, "Event receiver dropped; stopping reader");
                    reader_closed.store(true, Ordering::SeqCst);
                    break;
                }
            }

            // Waiters see a dropped sender and report NotConnected.
            reader_pending.lock().clear();
            if !reader_closed.swap(true, Ordering::SeqCst) {
                info!(connection_id = %reader_conn, reason = %reason, "Bridge connection closed");
                let _ = events.send(TransportEvent::Closed(reason)).await;
            }
        });

        Ok(Arc::new(BridgeHandle {
            connection_id: connection_id.to_string(),
            outbound: out_tx,
            pending,
            closed,
            reader: reader.abort_handle(),
            send_timeout: self.config.send_timeout,
        }))
    }
}

/// Handle to one bridge-backed connection.
pub struct BridgeHandle {
    connection_id: String,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    pending: PendingSends,
    closed: Arc<AtomicBool>,
    reader: AbortHandle,
    send_timeout: Duration,
}

impl BridgeHandle {
    fn not_connected(&self) -> ParleyError {
        ParleyError::NotConnected(format!("{} bridge socket is closed", self.connection_id))
    }
}

#[async_trait]
impl TransportHandle for BridgeHandle {
    async fn send(&self, to: &str, text: &str) -> ParleyResult<SentMessage> {
        if self.is_closed() {
            return Err(self.not_connected());
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let frame = ClientFrame::Send {
            request_id: request_id.clone(),
            to: to.to_string(),
            text: text.to_string(),
        };
        if self.outbound.send(frame).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(self.not_connected());
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(ParleyError::Transport(format!(
                    "send to {to} not acknowledged within {:?}",
                    self.send_timeout
                )))
            }
            Ok(Err(_)) => Err(self.not_connected()),
            Ok(Ok(outcome)) if outcome.ok => Ok(SentMessage {
                message_id: outcome.message_id,
            }),
            Ok(Ok(outcome)) => Err(ParleyError::Transport(
                outcome
                    .error
                    .unwrap_or_else(|| "bridge rejected send".to_string()),
            )),
        }
    }

    async fn logout(&self) -> ParleyResult<()> {
        if self.is_closed() {
            return Err(self.not_connected());
        }
        self.outbound
            .send(ClientFrame::Logout)
            .map_err(|_| self.not_connected())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(ClientFrame::Close);
        self.reader.abort();
        self.pending.lock().clear();
        debug!(connection_id = %self.connection_id, "Bridge handle closed locally");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames_are_tagged() {
        let frame = ClientFrame::Send {
            request_id: "r1".into(),
            to: "5511@s.whatsapp.net".into(),
            text: "oi".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "send");
        assert_eq!(json["request_id"], "r1");

        let json = serde_json::to_value(ClientFrame::Logout).unwrap();
        assert_eq!(json, serde_json::json!({"type": "logout"}));
    }

    #[test]
    fn test_bridge_frames_parse() {
        let frame: BridgeFrame = serde_json::from_str(
            r#"{"type":"message","id":"A1","chat":"5511@s.whatsapp.net","text":"oi","timestamp":1700000000}"#,
        )
        .unwrap();
        match frame {
            BridgeFrame::Message { from_me, text, .. } => {
                assert!(!from_me);
                assert_eq!(text.as_deref(), Some("oi"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let frame: BridgeFrame =
            serde_json::from_str(r#"{"type":"close","code":401}"#).unwrap();
        assert!(matches!(frame, BridgeFrame::Close { code: 401, .. }));
    }
}
