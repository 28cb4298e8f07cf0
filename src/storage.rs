//! Blob storage collaborator.
//!
//! Progress photos are uploaded by the client ahead of the `photo/uploaded`
//! event; workflows only ever read them back by reference.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::error::StorageError;

/// Read-only access to stored blobs.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>, StorageError>;
}

/// Blobs under a local directory. References are relative paths.
pub struct FsBlobStorage {
    root: PathBuf,
}

impl FsBlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(reference);
        let clean = !reference.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(StorageError::InvalidReference(reference.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStorage for FsBlobStorage {
    async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(reference)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(reference.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Blobs behind `http(s)://` URLs (e.g. presigned object-store links).
pub struct HttpBlobStorage {
    client: reqwest::Client,
}

impl HttpBlobStorage {
    pub fn new(timeout: Duration) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Http(format!("client build failed: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BlobStorage for HttpBlobStorage {
    async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        if !(reference.starts_with("http://") || reference.starts_with("https://")) {
            return Err(StorageError::InvalidReference(reference.to_string()));
        }

        let response = self
            .client
            .get(reference)
            .send()
            .await
            .map_err(|e| StorageError::Http(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {}
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::GONE => {
                return Err(StorageError::NotFound(reference.to_string()));
            }
            s if s.is_client_error() => {
                return Err(StorageError::InvalidReference(format!("{reference}: HTTP {s}")));
            }
            s => return Err(StorageError::Http(format!("HTTP {s}"))),
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StorageError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Create the configured storage backend.
pub fn create_storage(config: &StorageConfig) -> Result<Arc<dyn BlobStorage>, StorageError> {
    match config {
        StorageConfig::Filesystem { root } => {
            tracing::info!("Blob storage: filesystem at {}", root.display());
            Ok(Arc::new(FsBlobStorage::new(root.clone())))
        }
        StorageConfig::Http { timeout } => {
            tracing::info!("Blob storage: HTTP");
            Ok(Arc::new(HttpBlobStorage::new(*timeout)?))
        }
    }
}

/// Guess an image media type from a reference's extension.
pub fn media_type_for(reference: &str) -> &'static str {
    let ext = reference
        .rsplit('/')
        .next()
        .and_then(|name| name.split('?').next())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_reads_relative_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("u1")).unwrap();
        std::fs::write(dir.path().join("u1/front.jpg"), b"jpeg").unwrap();

        let storage = FsBlobStorage::new(dir.path());
        assert_eq!(storage.fetch_bytes("u1/front.jpg").await.unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn fs_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsBlobStorage::new(dir.path());
        let err = storage.fetch_bytes("nope.jpg").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn fs_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsBlobStorage::new(dir.path());
        for bad in ["../etc/passwd", "/etc/passwd", "u1/../../x", ""] {
            let err = storage.fetch_bytes(bad).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidReference(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn http_rejects_non_url() {
        let storage = HttpBlobStorage::new(Duration::from_secs(1)).unwrap();
        let err = storage.fetch_bytes("u1/front.jpg").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidReference(_)));
    }

    #[test]
    fn media_types() {
        assert_eq!(media_type_for("u1/a.PNG"), "image/png");
        assert_eq!(media_type_for("https://x/y.webp?sig=abc"), "image/webp");
        assert_eq!(media_type_for("u1/a.jpg"), "image/jpeg");
        assert_eq!(media_type_for("noext"), "image/jpeg");
    }
}
