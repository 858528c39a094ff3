pub mod api;
pub mod echo;
pub mod ingress;
pub mod lanes;
pub mod middleware;
pub mod qr;
pub mod server;

pub use ingress::{ConversationPatch, IngressConfig, MessageIngressPipeline, OutboundReceipt, TurnOutcome};
pub use middleware::AuthConfig;
pub use server::{AppState, GatewayServer};
