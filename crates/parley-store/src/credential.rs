use async_trait::async_trait;
use parley_core::{validate_connection_id, CredentialBlob, ParleyError, ParleyResult};
use std::path::PathBuf;
use tracing::debug;

const CREDS_FILE: &str = "creds.json";

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Connection ids that have a stored blob.
    async fn list(&self) -> ParleyResult<Vec<String>>;
    /// `Ok(None)` when nothing is stored; an error when the blob is unreadable.
    async fn read(&self, connection_id: &str) -> ParleyResult<Option<CredentialBlob>>;
    async fn write(&self, connection_id: &str, blob: &CredentialBlob) -> ParleyResult<()>;
    /// Deleting an absent blob is not an error.
    async fn delete(&self, connection_id: &str) -> ParleyResult<()>;
}

/// Credential store with one directory per connection under a root.
///
/// Layout: `<root>/<connection_id>/creds.json`.
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub async fn new(root: PathBuf) -> ParleyResult<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn dir(&self, connection_id: &str) -> ParleyResult<PathBuf> {
        validate_connection_id(connection_id)?;
        Ok(self.root.join(connection_id))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn list(&self) -> ParleyResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_connection_id(&name).is_err() {
                debug!(entry = %name, "Skipping non-connection entry in credential dir");
                continue;
            }
            if tokio::fs::try_exists(entry.path().join(CREDS_FILE)).await? {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn read(&self, connection_id: &str) -> ParleyResult<Option<CredentialBlob>> {
        let path = self.dir(connection_id)?.join(CREDS_FILE);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ParleyError::Credential(format!(
                    "failed to read credentials for '{connection_id}': {e}"
                )))
            }
        };
        let blob = serde_json::from_str(&data).map_err(|e| {
            ParleyError::Credential(format!(
                "corrupt credentials for '{connection_id}': {e}"
            ))
        })?;
        Ok(Some(blob))
    }

    async fn write(&self, connection_id: &str, blob: &CredentialBlob) -> ParleyResult<()> {
        let dir = self.dir(connection_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_string_pretty(blob)?;
        // Readers never observe a partially written blob.
        let tmp = dir.join(format!("{CREDS_FILE}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, dir.join(CREDS_FILE)).await?;
        Ok(())
    }

    async fn delete(&self, connection_id: &str) -> ParleyResult<()> {
        let dir = self.dir(connection_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ParleyError::Credential(format!(
                "failed to delete credentials for '{connection_id}': {e}"
            ))),
        }
    }
}
