//! Local filesystem storage.
//!
//! Objects are stored at `<root>/<prefix>/<oid>`. Fine for small
//! installations; larger deployments will want one of the cloud backends.
//! Only pairs with the streaming transfer adapter since the filesystem
//! cannot issue signed URLs.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, BufReader};
use uuid::Uuid;

use super::{ObjectStream, StorageError, StreamingStorage, VerifiableStorage, validate_oid};

pub struct LocalStorage {
    path: PathBuf,
}

impl LocalStorage {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn object_path(&self, prefix: &str, oid: &str) -> PathBuf {
        self.path.join(prefix).join(oid)
    }

    fn temp_path(&self) -> PathBuf {
        self.path.join("tmp").join(Uuid::new_v4().to_string())
    }
}

fn io_error(e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::not_found()
    } else {
        StorageError::Backend(format!("io error: {e}"))
    }
}

async fn create_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::Backend(format!("io error: {e}")))?;
    }
    Ok(())
}

#[async_trait]
impl VerifiableStorage for LocalStorage {
    async fn exists(&self, prefix: &str, oid: &str) -> Result<bool, StorageError> {
        validate_oid(oid)?;
        Ok(self.object_path(prefix, oid).is_file())
    }

    async fn get_size(&self, prefix: &str, oid: &str) -> Result<u64, StorageError> {
        validate_oid(oid)?;
        let metadata = fs::metadata(self.object_path(prefix, oid))
            .await
            .map_err(io_error)?;
        Ok(metadata.len())
    }
}

#[async_trait]
impl StreamingStorage for LocalStorage {
    async fn get(&self, prefix: &str, oid: &str) -> Result<ObjectStream, StorageError> {
        validate_oid(oid)?;
        let file = File::open(self.object_path(prefix, oid))
            .await
            .map_err(io_error)?;
        Ok(Box::pin(BufReader::new(file)))
    }

    async fn put(
        &self,
        prefix: &str,
        oid: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StorageError> {
        validate_oid(oid)?;

        // Write through a temp file and rename, so concurrent readers never
        // observe a half-written object.
        let temp_path = self.temp_path();
        create_parent(&temp_path).await?;

        let mut temp_file = File::create(&temp_path).await.map_err(io_error)?;
        let written = tokio::io::copy(data, &mut temp_file)
            .await
            .map_err(|e| StorageError::Backend(format!("io error: {e}")))?;
        temp_file.sync_all().await.map_err(io_error)?;
        drop(temp_file);

        let final_path = self.object_path(prefix, oid);
        create_parent(&final_path).await?;
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(io_error)?;

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn test_oid() -> String {
        "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3".to_string()
    }

    const PREFIX: &str = "myorg/myrepo";

    #[tokio::test]
    async fn test_put_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());

        let oid = test_oid();
        let data = b"123";

        let written = storage.put(PREFIX, &oid, &mut &data[..]).await.unwrap();
        assert_eq!(written, 3);

        assert!(storage.exists(PREFIX, &oid).await.unwrap());
        assert_eq!(storage.get_size(PREFIX, &oid).await.unwrap(), 3);

        let mut reader = storage.get(PREFIX, &oid).await.unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, data);
    }

    #[tokio::test]
    async fn test_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());

        let oid = test_oid();
        assert!(!storage.exists(PREFIX, &oid).await.unwrap());
        assert!(matches!(
            storage.get(PREFIX, &oid).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.get_size(PREFIX, &oid).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_object() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());

        let oid = test_oid();
        storage.put(PREFIX, &oid, &mut &b"12345678"[..]).await.unwrap();

        assert!(storage.verify_object(PREFIX, &oid, 8).await);
        assert!(!storage.verify_object(PREFIX, &oid, 9).await);
        assert!(!storage.verify_object("other/repo", &oid, 8).await);
    }

    #[tokio::test]
    async fn test_objects_are_scoped_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());

        let oid = test_oid();
        storage.put(PREFIX, &oid, &mut &b"123"[..]).await.unwrap();

        assert!(!storage.exists("other/repo", &oid).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_oid() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());

        assert!(matches!(
            storage.exists(PREFIX, "invalid").await,
            Err(StorageError::Invalid(_))
        ));
        assert!(matches!(
            storage
                .exists(
                    PREFIX,
                    "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
                )
                .await,
            Err(StorageError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_mime_type_default() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        assert_eq!(
            storage.get_mime_type(PREFIX, &test_oid()),
            "application/octet-stream"
        );
    }
}
