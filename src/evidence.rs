//! Storage for uploaded proof images.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EvidenceConfig;
use crate::error::Error;

/// Where an uploaded image can be fetched from, and the handle to delete it.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Evidence {
    pub url: String,
    pub storage_id: String,
}

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn store(&self, bytes: Vec<u8>, content_type: Option<String>) -> Result<Evidence, Error>;

    async fn delete(&self, storage_id: &str) -> Result<(), Error>;
}

/// Deletes evidence that is no longer referenced. Failures only leave an
/// orphaned object behind, so they are logged and otherwise ignored.
pub async fn discard(store: &dyn EvidenceStore, evidence: &Evidence) {
    if let Err(err) = store.delete(&evidence.storage_id).await {
        warn!(storage_id = %evidence.storage_id, error = %err, "failed to discard evidence");
    }
}

fn extension(content_type: Option<&str>) -> &'static str {
    match content_type {
        Some("image/jpeg") | Some("image/jpg") => "jpg",
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/heic") => "heic",
        _ => "bin",
    }
}

/// Writes evidence as files under a directory served at `public_url`.
#[derive(Clone, Debug)]
pub struct LocalEvidenceStore {
    directory: PathBuf,
    public_url: String,
}

impl LocalEvidenceStore {
    pub fn new(config: &EvidenceConfig) -> LocalEvidenceStore {
        LocalEvidenceStore {
            directory: PathBuf::from(&config.directory),
            public_url: config.public_url.trim_end_matches('/').to_string(),
        }
    }

    fn path(&self, storage_id: &str) -> Result<PathBuf, Error> {
        // storage ids are generated here; anything else is not ours to touch
        if storage_id.contains(['/', '\\']) || storage_id.starts_with('.') {
            return Err(Error::EvidenceStorageFailed(format!(
                "invalid storage id {}",
                storage_id
            )));
        }

        Ok(self.directory.join(storage_id))
    }
}

#[async_trait]
impl EvidenceStore for LocalEvidenceStore {
    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn store(&self, bytes: Vec<u8>, content_type: Option<String>) -> Result<Evidence, Error> {
        if bytes.is_empty() {
            return Err(Error::EmptyEvidence);
        }

        let storage_id = format!(
            "{}.{}",
            Uuid::new_v4().simple(),
            extension(content_type.as_deref())
        );
        let path = self.path(&storage_id)?;

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|err| Error::EvidenceStorageFailed(err.to_string()))?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|err| Error::EvidenceStorageFailed(err.to_string()))?;

        debug!(storage_id = %storage_id, "stored evidence");

        Ok(Evidence {
            url: format!("{}/{}", self.public_url, storage_id),
            storage_id,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, storage_id: &str) -> Result<(), Error> {
        let path = self.path(storage_id)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::EvidenceStorageFailed(err.to_string())),
        }
    }
}

/// Keeps evidence in memory.
#[derive(Debug, Default)]
pub struct MemoryEvidenceStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryEvidenceStore {
    pub fn new() -> MemoryEvidenceStore {
        MemoryEvidenceStore::default()
    }

    pub fn contains(&self, storage_id: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(storage_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EvidenceStore for MemoryEvidenceStore {
    async fn store(&self, bytes: Vec<u8>, _content_type: Option<String>) -> Result<Evidence, Error> {
        if bytes.is_empty() {
            return Err(Error::EmptyEvidence);
        }

        let storage_id = Uuid::new_v4().simple().to_string();
        self.objects
            .lock()
            .map_err(|_| Error::EvidenceStorageFailed("evidence store poisoned".into()))?
            .insert(storage_id.clone(), bytes);

        Ok(Evidence {
            url: format!("memory://{}", storage_id),
            storage_id,
        })
    }

    async fn delete(&self, storage_id: &str) -> Result<(), Error> {
        self.objects
            .lock()
            .map_err(|_| Error::EvidenceStorageFailed("evidence store poisoned".into()))?
            .remove(storage_id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_writes_and_deletes_files() {
        let directory = std::env::temp_dir().join(format!("adfleet-{}", Uuid::new_v4().simple()));
        let store = LocalEvidenceStore::new(&EvidenceConfig {
            directory: directory.to_string_lossy().into_owned(),
            public_url: "http://localhost/evidence/".into(),
        });

        let evidence = store
            .store(b"jpeg bytes".to_vec(), Some("image/jpeg".into()))
            .await
            .unwrap();

        assert!(evidence.storage_id.ends_with(".jpg"));
        assert_eq!(
            evidence.url,
            format!("http://localhost/evidence/{}", evidence.storage_id)
        );
        assert!(directory.join(&evidence.storage_id).exists());

        store.delete(&evidence.storage_id).await.unwrap();
        assert!(!directory.join(&evidence.storage_id).exists());
        // deleting twice is fine
        store.delete(&evidence.storage_id).await.unwrap();

        let _ = std::fs::remove_dir_all(directory);
    }

    #[tokio::test]
    async fn local_store_refuses_paths_outside_directory() {
        let store = LocalEvidenceStore::new(&EvidenceConfig::default());

        assert!(store.delete("../secrets").await.is_err());
    }

    #[tokio::test]
    async fn empty_uploads_are_refused() {
        let store = MemoryEvidenceStore::new();

        assert_eq!(
            store.store(Vec::new(), None).await.unwrap_err(),
            Error::EmptyEvidence
        );
        assert!(store.is_empty());
    }
}
