use crate::error::{ParleyError, ParleyResult};
use uuid::Uuid;

/// Namespace for deterministic conversation ids.
const CONVERSATION_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_9b4d_4e0a_8f7c_2d51_b0e3_9a64);

const MAX_CONNECTION_ID_LEN: usize = 128;

/// Validate a connection id.
///
/// Connection ids name credential directories on disk, so only ASCII
/// alphanumerics, `-` and `_` are accepted.
pub fn validate_connection_id(id: &str) -> ParleyResult<()> {
    if id.is_empty() {
        return Err(ParleyError::InvalidInput("connection id is empty".into()));
    }
    if id.len() > MAX_CONNECTION_ID_LEN {
        return Err(ParleyError::InvalidInput(format!(
            "connection id longer than {MAX_CONNECTION_ID_LEN} bytes"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ParleyError::InvalidInput(format!(
            "connection id '{id}' contains characters outside [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

/// Deterministic id of the conversation between `connection_id` and `contact`.
///
/// Every writer derives the same id for the same pair, which makes
/// get-or-create a single keyed insert.
pub fn conversation_id(connection_id: &str, contact: &str) -> Uuid {
    let mut name = Vec::with_capacity(connection_id.len() + contact.len() + 1);
    name.extend_from_slice(connection_id.as_bytes());
    name.push(0);
    name.extend_from_slice(contact.as_bytes());
    Uuid::new_v5(&CONVERSATION_NAMESPACE, &name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_simple_ids() {
        assert!(validate_connection_id("shop1").is_ok());
        assert!(validate_connection_id("tenant_42-main").is_ok());
    }

    #[test]
    fn test_validate_rejects_path_traversal() {
        assert!(validate_connection_id("../etc").is_err());
        assert!(validate_connection_id("a/b").is_err());
        assert!(validate_connection_id("").is_err());
    }

    #[test]
    fn test_conversation_id_is_deterministic() {
        let a = conversation_id("shop1", "5511999990000@s.whatsapp.net");
        let b = conversation_id("shop1", "5511999990000@s.whatsapp.net");
        assert_eq!(a, b);
    }

    #[test]
    fn test_conversation_id_separates_components() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(conversation_id("ab", "c"), conversation_id("a", "bc"));
        assert_ne!(conversation_id("shop1", "x"), conversation_id("shop2", "x"));
    }
}
