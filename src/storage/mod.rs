//! Pluggable storage backends.
//!
//! A backend implements any subset of three capabilities: streaming (bytes
//! move through this server), external (clients talk to storage directly via
//! pre-signed URLs) and multipart (uploads split into separately signed
//! parts). All of them share the verification capability used by the verify
//! endpoint.
//!
//! The storage layer knows nothing of organizations or repositories; objects
//! live under a two-level `(prefix, oid)` key, where the prefix is the
//! `"org/repo"` string handed down by the transfer layer.

pub mod azure;
pub mod gcs;
pub mod local;
pub mod s3;

use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::warn;

use crate::server::dto::{Actions, Extra};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    #[must_use]
    pub fn not_found() -> Self {
        Self::NotFound("Object does not exist".to_string())
    }

    /// HTTP status carried into per-object batch errors; backend faults have
    /// no client-facing code.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::Invalid(_) => Some(422),
            Self::Backend(_) => None,
        }
    }
}

pub type ObjectStream = Pin<Box<dyn AsyncRead + Send>>;

/// Object verification, shared by every backend capability.
#[async_trait]
pub trait VerifiableStorage: Send + Sync {
    async fn exists(&self, prefix: &str, oid: &str) -> Result<bool, StorageError>;

    async fn get_size(&self, prefix: &str, oid: &str) -> Result<u64, StorageError>;

    /// Check that the object exists and has the advertised size. Never
    /// fails on a merely absent object.
    async fn verify_object(&self, prefix: &str, oid: &str, size: u64) -> bool {
        match self.get_size(prefix, oid).await {
            Ok(actual) => actual == size,
            Err(StorageError::NotFound(_)) => false,
            Err(e) => {
                warn!("verify_object failed for {prefix}/{oid}: {e}");
                false
            }
        }
    }
}

/// Backends the server itself streams bytes through.
#[async_trait]
pub trait StreamingStorage: VerifiableStorage {
    async fn get(&self, prefix: &str, oid: &str) -> Result<ObjectStream, StorageError>;

    /// Store an object from a stream; returns the number of bytes written.
    async fn put(
        &self,
        prefix: &str,
        oid: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StorageError>;

    fn get_mime_type(&self, _prefix: &str, _oid: &str) -> String {
        "application/octet-stream".to_string()
    }
}

/// Backends clients transfer to and from directly, via pre-signed URLs.
#[async_trait]
pub trait ExternalStorage: VerifiableStorage {
    async fn get_upload_action(
        &self,
        prefix: &str,
        oid: &str,
        size: u64,
        expires_in: u64,
        extra: &Extra,
    ) -> Result<Actions, StorageError>;

    async fn get_download_action(
        &self,
        prefix: &str,
        oid: &str,
        size: u64,
        expires_in: u64,
        extra: &Extra,
    ) -> Result<Actions, StorageError>;
}

/// Backends supporting uploads split into independently signed parts.
#[async_trait]
pub trait MultipartStorage: VerifiableStorage {
    async fn get_multipart_actions(
        &self,
        prefix: &str,
        oid: &str,
        size: u64,
        part_size: u64,
        expires_in: u64,
        extra: &Extra,
    ) -> Result<Actions, StorageError>;

    async fn get_download_action(
        &self,
        prefix: &str,
        oid: &str,
        size: u64,
        expires_in: u64,
        extra: &Extra,
    ) -> Result<Actions, StorageError>;
}

/// Storage key for an object: optional installation-wide root (leading `/`
/// stripped), then the repository prefix, then the oid, joined with `/`.
#[must_use]
pub fn blob_path(path_prefix: Option<&str>, prefix: &str, oid: &str) -> String {
    let root = path_prefix.unwrap_or("").trim_start_matches('/');
    if root.is_empty() {
        format!("{prefix}/{oid}")
    } else {
        format!("{root}/{prefix}/{oid}")
    }
}

fn validate_oid(oid: &str) -> Result<(), StorageError> {
    if oid.is_empty() || !oid.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()) {
        return Err(StorageError::Invalid("invalid OID format".to_string()));
    }
    Ok(())
}

/// OIDs are lowercase hex digests; anything else never names an object and
/// must not reach the filesystem as a path component.
#[must_use]
pub fn is_valid_oid(oid: &str) -> bool {
    validate_oid(oid).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSizeStorage(u64);

    #[async_trait]
    impl VerifiableStorage for FixedSizeStorage {
        async fn exists(&self, _prefix: &str, _oid: &str) -> Result<bool, StorageError> {
            Ok(true)
        }

        async fn get_size(&self, _prefix: &str, oid: &str) -> Result<u64, StorageError> {
            if oid == "missing" {
                return Err(StorageError::not_found());
            }
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_default_verify_object() {
        let storage = FixedSizeStorage(8);
        assert!(storage.verify_object("org/repo", "abc", 8).await);
        assert!(!storage.verify_object("org/repo", "abc", 9).await);
        assert!(!storage.verify_object("org/repo", "missing", 8).await);
    }

    #[test]
    fn test_blob_path() {
        assert_eq!(blob_path(None, "org/repo", "abc"), "org/repo/abc");
        assert_eq!(blob_path(Some(""), "org/repo", "abc"), "org/repo/abc");
        assert_eq!(
            blob_path(Some("lfs"), "org/repo", "abc"),
            "lfs/org/repo/abc"
        );
        assert_eq!(
            blob_path(Some("/lfs/data"), "org/repo", "abc"),
            "lfs/data/org/repo/abc"
        );
    }

    #[test]
    fn test_is_valid_oid() {
        assert!(is_valid_oid(
            "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3"
        ));
        assert!(is_valid_oid("12345678"));
        assert!(!is_valid_oid(""));
        assert!(!is_valid_oid("../escape"));
        assert!(!is_valid_oid(
            "A665A45920422F9D417E4867EFDC4FB8A04A1F3FFF1FA07E998E86F7F7A27AE3"
        ));
        assert!(!is_valid_oid(
            "g665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3"
        ));
    }
}
