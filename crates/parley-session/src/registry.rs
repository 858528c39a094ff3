use crate::session::{Session, SessionSnapshot};
use parking_lot::Mutex;
use parley_channels::TransportHandle;
use parley_core::{ConnectionStatus, ParleyError, ParleyResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Process-wide map from connection id to its [`Session`].
///
/// One mutex guards the whole map. Closures passed to [`update`] run under
/// that lock and must not block.
///
/// [`update`]: SessionRegistry::update
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session` unless its id is already present. On conflict the
    /// existing status is returned and nothing changes.
    pub fn insert_if_absent(&self, session: Session) -> Result<(), ConnectionStatus> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&session.connection_id) {
            return Err(existing.status);
        }
        sessions.insert(session.connection_id.clone(), session);
        Ok(())
    }

    pub fn get(&self, connection_id: &str) -> Option<SessionSnapshot> {
        self.sessions.lock().get(connection_id).map(Session::snapshot)
    }

    pub fn remove(&self, connection_id: &str) -> Option<Session> {
        self.sessions.lock().remove(connection_id)
    }

    /// Remove the entry only while it still belongs to `generation`.
    pub fn remove_if_generation(&self, connection_id: &str, generation: u64) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        match sessions.get(connection_id) {
            Some(session) if session.generation == generation => sessions.remove(connection_id),
            _ => None,
        }
    }

    /// Run `f` on the entry under the registry lock.
    pub fn update<R>(&self, connection_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions.lock().get_mut(connection_id).map(f)
    }

    /// Like [`update`](Self::update) but only while the entry still
    /// belongs to `generation`.
    pub fn update_current<R>(
        &self,
        connection_id: &str,
        generation: u64,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        self.sessions
            .lock()
            .get_mut(connection_id)
            .filter(|s| s.generation == generation)
            .map(f)
    }

    pub fn is_current(&self, connection_id: &str, generation: u64) -> bool {
        self.sessions
            .lock()
            .get(connection_id)
            .is_some_and(|s| s.generation == generation)
    }

    /// Handle of a `Connected` session, or `NotConnected`.
    pub fn connected_handle(&self, connection_id: &str) -> ParleyResult<Arc<dyn TransportHandle>> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(connection_id)
            .ok_or_else(|| ParleyError::NotConnected(format!("no session for '{connection_id}'")))?;
        if session.status != ConnectionStatus::Connected {
            return Err(ParleyError::NotConnected(format!(
                "'{connection_id}' is {}",
                session.status
            )));
        }
        session
            .handle
            .clone()
            .ok_or_else(|| ParleyError::NotConnected(format!("'{connection_id}' has no transport")))
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<Session> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let registry = SessionRegistry::new();
        registry.insert_if_absent(Session::connecting("shop1", 1)).unwrap();
        registry
            .update("shop1", |s| s.status = ConnectionStatus::QrPending)
            .unwrap();
        let err = registry
            .insert_if_absent(Session::connecting("shop1", 2))
            .unwrap_err();
        assert_eq!(err, ConnectionStatus::QrPending);
        assert_eq!(registry.get("shop1").unwrap().generation, 1);
    }

    #[test]
    fn test_generation_guards() {
        let registry = SessionRegistry::new();
        registry.insert_if_absent(Session::connecting("shop1", 7)).unwrap();
        assert!(registry.is_current("shop1", 7));
        assert!(!registry.is_current("shop1", 6));
        assert!(registry.update_current("shop1", 6, |_| ()).is_none());
        assert!(registry.remove_if_generation("shop1", 6).is_none());
        assert!(registry.remove_if_generation("shop1", 7).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connected_handle_requires_connected_status() {
        let registry = SessionRegistry::new();
        let err = registry.connected_handle("shop1").err().unwrap();
        assert!(err.is_not_connected());

        registry.insert_if_absent(Session::connecting("shop1", 1)).unwrap();
        let err = registry.connected_handle("shop1").err().unwrap();
        assert!(err.to_string().contains("connecting"));
    }

    #[test]
    fn test_concurrent_inserts_leave_one_entry() {
        let registry = Arc::new(SessionRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.insert_if_absent(Session::connecting("shop1", i)).is_ok())
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
