use crate::api;
use crate::ingress::MessageIngressPipeline;
use crate::middleware::{auth_middleware, AuthConfig};
use axum::{
    middleware as axum_mw,
    routing::{get, patch, post},
    Router,
};
use parley_session::ConnectionController;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
pub struct AppState {
    pub controller: ConnectionController,
    pub pipeline: MessageIngressPipeline,
    /// How long `POST /send` waits for a restored session.
    pub restore_wait: Duration,
}

/// The management HTTP surface.
pub struct GatewayServer;

impl GatewayServer {
    pub fn build(state: AppState, auth: AuthConfig) -> Router {
        let app = Router::new()
            .route("/health", get(api::health))
            .route(
                "/connect",
                post(api::connect)
                    .get(api::connection_status)
                    .delete(api::disconnect),
            )
            .route("/send", post(api::send))
            .route(
                "/connections/{id}/conversations",
                get(api::list_conversations),
            )
            .route(
                "/conversations/{id}/messages",
                get(api::conversation_messages),
            )
            .route("/conversations/{id}", patch(api::update_conversation))
            .with_state(Arc::new(state));

        if auth.is_enabled() {
            app.layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware))
        } else {
            app
        }
    }
}
