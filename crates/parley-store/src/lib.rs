//! Persistence for the Parley gateway.
//!
//! Two independent stores live here:
//!
//! - [`DocumentStore`] — connections, conversations, messages and training
//!   rules. [`SqliteStore`] is the bundled implementation.
//! - [`CredentialStore`] — opaque pairing credentials, one directory per
//!   connection. [`FileCredentialStore`] is the bundled implementation.

pub mod credential;
pub mod document;
pub mod sqlite;

pub use credential::{CredentialStore, FileCredentialStore};
pub use parley_core::CredentialBlob;
pub use document::DocumentStore;
pub use sqlite::SqliteStore;
