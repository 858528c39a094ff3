//! Management endpoints consumed by the dashboard.

use crate::ingress::ConversationPatch;
use crate::qr::qr_data_uri;
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::{ConnectionStatus, ParleyError};
use parley_session::ConnectionState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_MESSAGE_LIMIT: usize = 50;
const MAX_MESSAGE_LIMIT: usize = 500;

/// Error body: `{"error": <code>, "message": <detail>}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }
}

impl From<ParleyError> for ApiError {
    fn from(err: ParleyError) -> Self {
        let (status, code) = match &err {
            ParleyError::NotConnected(_) => (StatusCode::CONFLICT, "not_connected"),
            ParleyError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            ParleyError::Transport(_) => (StatusCode::BAD_GATEWAY, "transport_error"),
            ParleyError::Llm(_) => (StatusCode::BAD_GATEWAY, "llm_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"error": self.code, "message": self.message})),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub connection_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub connection_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connection_id: String,
    pub connected: bool,
    pub status: ConnectionStatus,
    /// SVG data URI of the pairing QR, while one is pending.
    pub qr_code: Option<String>,
    pub phone_number: Option<String>,
    pub user: Option<String>,
    pub error: Option<String>,
}

impl StatusResponse {
    fn from_state(state: ConnectionState) -> Self {
        let qr_code = state.qr.as_deref().and_then(|payload| match qr_data_uri(payload) {
            Ok(uri) => Some(uri),
            Err(e) => {
                warn!(connection_id = %state.connection_id, error = %e, "QR rendering failed");
                None
            }
        });
        Self {
            connected: state.is_connected(),
            connection_id: state.connection_id,
            status: state.status,
            qr_code,
            phone_number: state.phone_number,
            user: state.user,
            error: state.error,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub connection_id: String,
    pub phone_number: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    pub message_id: Option<String>,
    pub conversation_id: Uuid,
}

#[derive(Deserialize, Default)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "parley",
        "sessions": state.controller.registry().len(),
        "inFlightConversations": state.pipeline.busy_conversations(),
    }))
}

/// `POST /connect`: start or restore a session.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConnectRequest>,
) -> ApiResult<StatusResponse> {
    state.controller.start(&body.connection_id).await?;
    Ok(Json(StatusResponse::from_state(
        state.controller.status(&body.connection_id),
    )))
}

/// `GET /connect?connectionId=`: current status. Unknown ids are
/// reported as disconnected.
pub async fn connection_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
) -> Json<StatusResponse> {
    Json(StatusResponse::from_state(
        state.controller.status(&query.connection_id),
    ))
}

/// `DELETE /connect?connectionId=`: log out and purge credentials.
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
) -> ApiResult<serde_json::Value> {
    state.controller.stop(&query.connection_id).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "status": ConnectionStatus::Disconnected,
    })))
}

/// `POST /send`. On `not_connected` with stored credentials the session is
/// restored and the send retried once.
pub async fn send(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendRequest>,
) -> ApiResult<SendResponse> {
    let connection_id = body.connection_id.as_str();
    let first = state
        .pipeline
        .send_text(connection_id, &body.phone_number, &body.message)
        .await;

    let receipt = match first {
        Err(e) if e.is_not_connected() && state.controller.has_credentials(connection_id).await => {
            info!(connection_id, "Send found no session; restoring");
            state.controller.start(connection_id).await?;
            if !state
                .controller
                .wait_for_connected(connection_id, state.restore_wait)
                .await
            {
                return Err(ParleyError::NotConnected(format!(
                    "'{connection_id}' did not reconnect within {}s",
                    state.restore_wait.as_secs()
                ))
                .into());
            }
            state
                .pipeline
                .send_text(connection_id, &body.phone_number, &body.message)
                .await?
        }
        other => other?,
    };

    Ok(Json(SendResponse {
        success: true,
        message_id: receipt.transport_message_id,
        conversation_id: receipt.conversation_id,
    }))
}

/// `GET /connections/{id}/conversations`
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> ApiResult<Vec<parley_core::Conversation>> {
    Ok(Json(state.pipeline.list_conversations(&connection_id).await?))
}

/// `GET /conversations/{id}/messages?limit=`
pub async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Vec<parley_core::ChatMessage>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .clamp(1, MAX_MESSAGE_LIMIT);
    state
        .pipeline
        .messages(conversation_id, limit)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("conversation {conversation_id}")))
}

/// `PATCH /conversations/{id}`: toggle automation, reset training, edit
/// tags or notes.
pub async fn update_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Json(patch): Json<ConversationPatch>,
) -> ApiResult<parley_core::Conversation> {
    state
        .pipeline
        .update_conversation(conversation_id, patch)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("conversation {conversation_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let not_connected = ApiError::from(ParleyError::NotConnected("shop1".into()));
        assert_eq!(not_connected.status, StatusCode::CONFLICT);
        assert_eq!(not_connected.code, "not_connected");

        let invalid = ApiError::from(ParleyError::InvalidInput("bad id".into()));
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

        let store = ApiError::from(ParleyError::Store("locked".into()));
        assert_eq!(store.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_status_response_renders_qr() {
        let state = ConnectionState {
            status: ConnectionStatus::QrPending,
            qr: Some("2@payload".into()),
            ..ConnectionState::disconnected("shop1")
        };
        let response = StatusResponse::from_state(state);
        assert!(!response.connected);
        assert!(response
            .qr_code
            .as_deref()
            .is_some_and(|uri| uri.starts_with("data:image/svg+xml;base64,")));

        let json = serde_json::to_value(&response).unwrap_or_default();
        assert_eq!(json["status"], "qr_pending");
        assert!(json.get("qrCode").is_some());
        assert!(json.get("phoneNumber").is_some());
    }
}
