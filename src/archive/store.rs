//! # Object Store Client
//!
//! Thin adapter over the blob store that receives archived audio. The store
//! itself is an external collaborator; the gateway only needs five verbs and
//! custom metadata on each blob, so the seam is a small async trait.
//!
//! ## Implementations:
//! - **MemoryObjectStore**: process-local map, used by tests and as the
//!   fallback when no bucket is configured
//! - **FsObjectStore**: directory-backed store for single-node deployments,
//!   with metadata kept in a JSON sidecar per object
//!
//! Production deployments bind an S3-compatible service behind the same
//! trait; nothing above this module knows which implementation is live.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Descriptive data returned by `head` and `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// Blob store verbs the archiver and admin endpoints need.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key` with a content type and custom metadata.
    /// Overwrites any existing object at the same key.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), String>;

    /// Fetch an object's body, or `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;

    /// Fetch an object's descriptive data without its body.
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, String>;

    /// List objects whose keys start with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, String>;

    /// Delete the object at `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), String>;
}

/// In-memory object store for tests and bucket-less runs.
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String, HashMap<String, String>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), String> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), (body, content_type.to_string(), metadata));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self.objects.lock().await.get(key).map(|(body, _, _)| body.clone()))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, String> {
        Ok(self
            .objects
            .lock()
            .await
            .get(key)
            .map(|(body, content_type, metadata)| ObjectInfo {
                key: key.to_string(),
                size: body.len() as u64,
                content_type: content_type.clone(),
                metadata: metadata.clone(),
            }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, String> {
        Ok(self
            .objects
            .lock()
            .await
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (body, content_type, metadata))| ObjectInfo {
                key: key.clone(),
                size: body.len() as u64,
                content_type: content_type.clone(),
                metadata: metadata.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

/// Metadata sidecar written next to each object by the filesystem store.
#[derive(Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    metadata: HashMap<String, String>,
}

/// Directory-backed object store.
///
/// Keys map onto relative paths under the bucket root; each object carries a
/// `<key>.meta.json` sidecar with its content type and custom metadata.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key to a path, refusing anything that escapes the root.
    fn object_path(&self, key: &str) -> Result<PathBuf, String> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
            return Err(format!("invalid object key: {}", key));
        }
        Ok(self.root.join(key))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    async fn read_info(&self, key: &str, path: &Path) -> Result<Option<ObjectInfo>, String> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };

        let sidecar: Sidecar = match tokio::fs::read(Self::sidecar_path(path)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| e.to_string())?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Sidecar {
                content_type: "application/octet-stream".to_string(),
                metadata: HashMap::new(),
            },
            Err(e) => return Err(e.to_string()),
        };

        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size: meta.len(),
            content_type: sidecar.content_type,
            metadata: sidecar.metadata,
        }))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| e.to_string())?;
        }

        let sidecar = Sidecar {
            content_type: content_type.to_string(),
            metadata,
        };
        let sidecar_bytes = serde_json::to_vec(&sidecar).map_err(|e| e.to_string())?;

        tokio::fs::write(&path, body).await.map_err(|e| e.to_string())?;
        tokio::fs::write(Self::sidecar_path(&path), sidecar_bytes)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, String> {
        let path = self.object_path(key)?;
        self.read_info(key, &path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, String> {
        // Walk the directory that covers the prefix and filter exactly.
        let walk_root = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.root.join(dir),
            None => self.root.clone(),
        };

        let mut infos = Vec::new();
        let mut pending = vec![walk_root];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.to_string()),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| e.to_string())? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| e.to_string())?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().map(|e| e == "json").unwrap_or(false)
                    && path.to_string_lossy().ends_with(".meta.json")
                {
                    continue;
                }
                let key = path
                    .strip_prefix(&self.root)
                    .map_err(|e| e.to_string())?
                    .to_string_lossy()
                    .replace('\\', "/");
                if !key.starts_with(prefix) {
                    continue;
                }
                if let Some(info) = self.read_info(&key, &path).await? {
                    infos.push(info);
                }
            }
        }

        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.to_string()),
        }
        match tokio::fs::remove_file(Self::sidecar_path(&path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("sessionId".to_string(), "abc".to_string());
        metadata.insert("audioType".to_string(), "original".to_string());
        metadata
    }

    #[tokio::test]
    async fn test_memory_put_get_head_roundtrip() {
        let store = MemoryObjectStore::new();
        store
            .put("audio-sessions/a.wav", vec![1, 2, 3], "audio/wav", sample_metadata())
            .await
            .unwrap();

        assert_eq!(store.get("audio-sessions/a.wav").await.unwrap(), Some(vec![1, 2, 3]));

        let info = store.head("audio-sessions/a.wav").await.unwrap().unwrap();
        assert_eq!(info.size, 3);
        assert_eq!(info.content_type, "audio/wav");
        assert_eq!(info.metadata.get("sessionId").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_memory_list_filters_by_prefix() {
        let store = MemoryObjectStore::new();
        for key in ["audio-sessions/a.wav", "audio-sessions/b.wav", "other/c.wav"] {
            store
                .put(key, vec![0], "audio/wav", HashMap::new())
                .await
                .unwrap();
        }

        let listed = store.list("audio-sessions/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["audio-sessions/a.wav", "audio-sessions/b.wav"]);
    }

    #[tokio::test]
    async fn test_memory_delete_is_idempotent() {
        let store = MemoryObjectStore::new();
        store
            .put("k", vec![9], "audio/wav", HashMap::new())
            .await
            .unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let root = std::env::temp_dir().join(format!("gateway-store-{}", uuid::Uuid::new_v4()));
        let store = FsObjectStore::new(&root);

        store
            .put(
                "audio-sessions/session_x_original_1.wav",
                vec![4, 5, 6, 7],
                "audio/wav",
                sample_metadata(),
            )
            .await
            .unwrap();

        let body = store
            .get("audio-sessions/session_x_original_1.wav")
            .await
            .unwrap();
        assert_eq!(body, Some(vec![4, 5, 6, 7]));

        let infos = store.list("audio-sessions/session_x_").await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].size, 4);
        assert_eq!(infos[0].content_type, "audio/wav");

        store
            .delete("audio-sessions/session_x_original_1.wav")
            .await
            .unwrap();
        assert!(store
            .get("audio-sessions/session_x_original_1.wav")
            .await
            .unwrap()
            .is_none());

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal_keys() {
        let store = FsObjectStore::new("/tmp/does-not-matter");
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("/absolute").await.is_err());
        assert!(store.get("a/../../b").await.is_err());
    }
}
