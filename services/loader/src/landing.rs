//! Landing zone: raw extracts stored verbatim before they are staged.

use crate::error::LandingError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub key: String,
    pub content_hash: String,
    pub size: u64,
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<BlobMeta, LandingError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, LandingError>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, LandingError>;

    /// Most recent key under `prefix`. Keys embed the capture time, so the
    /// greatest key is the latest capture.
    async fn latest(&self, prefix: &str) -> Result<Option<String>, LandingError> {
        Ok(self.list(prefix).await?.pop())
    }
}

/// Blob store rooted at a local directory. Keys are `/`-separated relative
/// paths.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, LandingError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(LandingError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<BlobMeta, LandingError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(BlobMeta {
            key: key.to_string(),
            content_hash: content_hash(bytes),
            size: bytes.len() as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, LandingError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LandingError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, LandingError> {
        let base = self.path_for(prefix.trim_end_matches('/'))?;
        let mut keys = Vec::new();
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_format() {
        assert_eq!(
            content_hash(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_put_get_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let meta = store.put("carts/20240601T000000Z.json", b"[]").await.unwrap();
        assert_eq!(meta.size, 2);
        store.put("carts/20240602T000000Z.json", b"[1]").await.unwrap();
        store.put("users/20240603T000000Z.json", b"[2]").await.unwrap();

        assert_eq!(store.get("carts/20240601T000000Z.json").await.unwrap(), b"[]");
        assert_eq!(
            store.latest("carts").await.unwrap().as_deref(),
            Some("carts/20240602T000000Z.json")
        );
        assert_eq!(store.list("missing").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.put("../outside.json", b"x").await,
            Err(LandingError::InvalidKey(_))
        ));
        assert!(matches!(store.get("/etc/passwd").await, Err(LandingError::InvalidKey(_))));
        assert!(matches!(store.get("nope.json").await, Err(LandingError::NotFound(_))));
    }
}
