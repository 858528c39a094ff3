//! Core types and error definitions for the Parley gateway.
//!
//! This crate provides the foundational types shared across all Parley crates:
//! the unified error enum, the persisted conversation/message/connection
//! records, and identifier helpers.
//!
//! # Main types
//!
//! - [`ParleyError`] — Unified error enum for all Parley subsystems.
//! - [`ParleyResult`] — Convenience alias for `Result<T, ParleyError>`.
//! - [`Conversation`] — One contact's thread on one connection.
//! - [`ChatMessage`] — A single append-only message in a conversation.
//! - [`ConnectionRecord`] — Durable view of a connection's last known state.
//! - [`ConnectionStatus`] — Transport state of a connection.

/// Unified error type.
pub mod error;
/// Identifier validation and derivation.
pub mod id;
/// Persisted records.
pub mod record;

pub use error::{ParleyError, ParleyResult};
pub use id::{conversation_id, validate_connection_id};
pub use record::{
    preview_of, ActiveTraining, ChatMessage, ConnectionRecord, ConnectionStatus, Conversation,
    CredentialBlob, DeliveryStatus, Direction,
};
