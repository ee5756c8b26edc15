//! Upload finished rasters and remove the local copy.

use crate::remote::identity::ArtifactAddress;
use async_trait::async_trait;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload, WriteMultipart};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Buffer used when streaming a file into a multipart upload.
const READ_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Parts allowed in flight per multipart upload.
const MAX_CONCURRENT_PARTS: usize = 4;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to read local artifact {}: {source}", .path.display())]
    ReadLocal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload to {key} failed: {source}")]
    Upload {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("upload to {key} failed: {reason}")]
    Rejected { key: String, reason: String },

    #[error("uploaded but failed to remove local artifact {}: {source}", .path.display())]
    LocalCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Puts a local file into the object store.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Upload `local_path` to `key`, returning the number of bytes sent.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<u64, PublishError>;
}

/// Uploads through an `object_store` client.
///
/// Files above the multipart threshold are streamed in parts so a multi-GB
/// raster is never held in memory at once.
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    multipart_threshold: u64,
    part_size: usize,
}

impl ObjectStoreUploader {
    /// # Arguments
    /// * `store` - Destination store, shared with the other workers
    /// * `multipart_threshold` - Files larger than this many bytes use multipart upload
    /// * `part_size` - Bytes per multipart part (S3 requires at least 5 MiB)
    pub fn new(store: Arc<dyn ObjectStore>, multipart_threshold: u64, part_size: usize) -> Self {
        Self {
            store,
            multipart_threshold,
            part_size,
        }
    }

    async fn put_whole(&self, local_path: &Path, path: &object_store::path::Path, key: &str) -> Result<u64, PublishError> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|source| PublishError::ReadLocal {
                path: local_path.to_path_buf(),
                source,
            })?;
        let len = data.len() as u64;

        self.store
            .put(path, PutPayload::from(data))
            .await
            .map_err(|source| PublishError::Upload {
                key: key.to_string(),
                source,
            })?;

        Ok(len)
    }

    async fn put_multipart(&self, local_path: &Path, path: &object_store::path::Path, key: &str) -> Result<u64, PublishError> {
        let read_err = |source| PublishError::ReadLocal {
            path: local_path.to_path_buf(),
            source,
        };
        let upload_err = |source| PublishError::Upload {
            key: key.to_string(),
            source,
        };

        let mut file = tokio::fs::File::open(local_path).await.map_err(read_err)?;
        let upload = self.store.put_multipart(path).await.map_err(upload_err)?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.part_size);

        let mut buf = vec![0u8; READ_BUFFER_SIZE.min(self.part_size.max(1))];
        let mut total = 0u64;
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(read_err(e));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.wait_for_capacity(MAX_CONCURRENT_PARTS).await {
                let _ = writer.abort().await;
                return Err(upload_err(e));
            }
            writer.write(&buf[..n]);
            total += n as u64;
        }

        writer.finish().await.map_err(upload_err)?;
        Ok(total)
    }
}

#[async_trait]
impl ArtifactUploader for ObjectStoreUploader {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<u64, PublishError> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|source| PublishError::ReadLocal {
                path: local_path.to_path_buf(),
                source,
            })?
            .len();

        let path = object_store::path::Path::from(key);
        if size > self.multipart_threshold {
            tracing::debug!(key, size, "Uploading with multipart");
            self.put_multipart(local_path, &path, key).await
        } else {
            self.put_whole(local_path, &path, key).await
        }
    }
}

/// Publishes a task's output: upload, then delete the local file.
///
/// If the upload fails the local file is kept for diagnosis.
pub struct Publisher {
    uploader: Arc<dyn ArtifactUploader>,
}

impl Publisher {
    pub fn new(uploader: Arc<dyn ArtifactUploader>) -> Self {
        Self { uploader }
    }

    /// Publish the file at `address.local_path` to `address.key`.
    ///
    /// # Returns
    /// The number of bytes uploaded.
    ///
    /// # Errors
    /// - [`PublishError::ReadLocal`] / [`PublishError::Upload`] / [`PublishError::Rejected`]
    ///   if the upload did not complete; the local file is kept
    /// - [`PublishError::LocalCleanup`] if the upload completed but the local
    ///   file could not be removed
    pub async fn publish(&self, address: &ArtifactAddress) -> Result<u64, PublishError> {
        let bytes = self.uploader.upload(&address.local_path, &address.key).await?;

        tokio::fs::remove_file(&address.local_path)
            .await
            .map_err(|source| PublishError::LocalCleanup {
                path: address.local_path.clone(),
                source,
            })?;

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    struct RejectingUploader;

    #[async_trait]
    impl ArtifactUploader for RejectingUploader {
        async fn upload(&self, _local_path: &Path, key: &str) -> Result<u64, PublishError> {
            Err(PublishError::Rejected {
                key: key.to_string(),
                reason: "bucket is read-only".to_string(),
            })
        }
    }

    fn write_artifact(dir: &TempDir, contents: &[u8]) -> ArtifactAddress {
        let folder = dir.path().join("T001_aa.05");
        std::fs::create_dir_all(&folder).unwrap();
        let local_path = folder.join("slope_a.tif");
        std::fs::write(&local_path, contents).unwrap();

        ArtifactAddress {
            key: "latlon/v6/T001_aa.05/slope_a.tif".to_string(),
            url: "http://store/bucket/latlon/v6/T001_aa.05/slope_a.tif".to_string(),
            local_path,
        }
    }

    async fn stored_bytes(store: &Arc<dyn ObjectStore>, key: &str) -> Vec<u8> {
        store
            .get(&object_store::path::Path::from(key))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_publish_uploads_and_removes_local() {
        let dir = TempDir::new().unwrap();
        let address = write_artifact(&dir, b"raster bytes");

        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let publisher = Publisher::new(Arc::new(ObjectStoreUploader::new(store.clone(), 1024, 5)));

        let bytes = publisher.publish(&address).await.unwrap();

        assert_eq!(bytes, 12);
        assert!(!address.local_path.exists());
        assert_eq!(stored_bytes(&store, &address.key).await, b"raster bytes");
    }

    #[tokio::test]
    async fn test_publish_multipart() {
        let dir = TempDir::new().unwrap();
        let contents: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let address = write_artifact(&dir, &contents);

        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let publisher = Publisher::new(Arc::new(ObjectStoreUploader::new(store.clone(), 0, 1024)));

        let bytes = publisher.publish(&address).await.unwrap();

        assert_eq!(bytes, 10_000);
        assert!(!address.local_path.exists());
        assert_eq!(stored_bytes(&store, &address.key).await, contents);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_local_file() {
        let dir = TempDir::new().unwrap();
        let address = write_artifact(&dir, b"keep me");

        let publisher = Publisher::new(Arc::new(RejectingUploader));
        let result = publisher.publish(&address).await;

        assert!(matches!(result, Err(PublishError::Rejected { .. })));
        assert_eq!(std::fs::read(&address.local_path).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_missing_local_file() {
        let dir = TempDir::new().unwrap();
        let mut address = write_artifact(&dir, b"x");
        address.local_path = dir.path().join("missing.tif");

        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let publisher = Publisher::new(Arc::new(ObjectStoreUploader::new(store, 1024, 5)));

        assert!(matches!(
            publisher.publish(&address).await,
            Err(PublishError::ReadLocal { .. })
        ));
    }
}
