//! Messaging transport abstraction.
//!
//! The messaging network itself is opaque to Parley. A [`Transport`] opens
//! one connection per tenant and reports what happens on it as typed
//! [`TransportEvent`]s over a bounded `tokio::sync::mpsc` channel; the
//! returned [`TransportHandle`] sends and logs out.
//!
//! # Main types
//!
//! - [`Transport`] / [`TransportHandle`] — Collaborator contract.
//! - [`BridgeTransport`] — Talks to a sidecar bridge over WebSocket.
//! - [`LoopbackTransport`] — In-process transport driven programmatically.

/// WebSocket bridge adapter.
pub mod bridge;
/// In-process loopback adapter.
pub mod loopback;
/// Transport traits and event types.
pub mod transport;

pub use bridge::{BridgeConfig, BridgeTransport};
pub use loopback::{LoopbackHandle, LoopbackTransport, SentRecord};
pub use transport::{
    CloseReason, InboundMessage, SentMessage, Transport, TransportEvent, TransportHandle,
    UserInfo,
};
