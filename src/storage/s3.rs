//! AWS S3 storage, pre-signed URL based.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::Value;

use crate::server::dto::{Action, Actions, Extra};
use crate::util::safe_filename;

use super::{ExternalStorage, StorageError, VerifiableStorage, blob_path};

#[derive(Debug, Clone, Deserialize)]
pub struct S3Options {
    pub bucket_name: String,
    pub path_prefix: Option<String>,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores; implies path-style access.
    pub endpoint_url: Option<String>,
}

pub struct S3Storage {
    client: Client,
    bucket: String,
    path_prefix: Option<String>,
}

impl S3Storage {
    /// Credentials come from the SDK's default provider chain (environment,
    /// shared config, instance metadata).
    pub async fn new(options: S3Options) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = options.region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = options.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: options.bucket_name,
            path_prefix: options.path_prefix,
        }
    }

    fn key(&self, prefix: &str, oid: &str) -> String {
        blob_path(self.path_prefix.as_deref(), prefix, oid)
    }

    fn presigning_config(expires_in: u64) -> Result<PresigningConfig, StorageError> {
        PresigningConfig::expires_in(Duration::from_secs(expires_in))
            .map_err(|e| StorageError::Backend(format!("invalid presigning lifetime: {e}")))
    }
}

/// `x-amz-checksum-sha256` value for an upload: the object's sha256 digest
/// (its oid, hex) re-encoded as base64, which lets S3 reject corrupt
/// uploads on the server side.
fn sha256_checksum(oid: &str) -> Result<String, StorageError> {
    let digest = hex::decode(oid)
        .map_err(|_| StorageError::Invalid("object ID is not a hex digest".to_string()))?;
    Ok(BASE64.encode(digest))
}

#[async_trait]
impl VerifiableStorage for S3Storage {
    async fn exists(&self, prefix: &str, oid: &str) -> Result<bool, StorageError> {
        match self.get_size(prefix, oid).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_size(&self, prefix: &str, oid: &str) -> Result<u64, StorageError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(prefix, oid))
            .send()
            .await;

        match result {
            Ok(output) => Ok(output.content_length().unwrap_or(0).max(0) as u64),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Err(StorageError::not_found())
                } else {
                    Err(StorageError::Backend(format!("S3 HeadObject failed: {e}")))
                }
            }
        }
    }
}

#[async_trait]
impl ExternalStorage for S3Storage {
    async fn get_upload_action(
        &self,
        prefix: &str,
        oid: &str,
        _size: u64,
        expires_in: u64,
        _extra: &Extra,
    ) -> Result<Actions, StorageError> {
        let checksum = sha256_checksum(oid)?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(prefix, oid))
            .content_type("application/octet-stream")
            .checksum_sha256(&checksum)
            .presigned(Self::presigning_config(expires_in)?)
            .await
            .map_err(|e| StorageError::Backend(format!("S3 presigning failed: {e}")))?;

        // The client must send every header that participated in signing.
        let mut header: HashMap<String, String> = presigned
            .headers()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        header.insert(
            "Content-Type".to_string(),
            "application/octet-stream".to_string(),
        );
        header.insert("x-amz-checksum-sha256".to_string(), checksum);

        Ok(Actions {
            upload: Some(Action::new(presigned.uri().to_string(), expires_in).with_header(header)),
            ..Default::default()
        })
    }

    async fn get_download_action(
        &self,
        prefix: &str,
        oid: &str,
        _size: u64,
        expires_in: u64,
        extra: &Extra,
    ) -> Result<Actions, StorageError> {
        let mut request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(prefix, oid));

        let filename = extra
            .get("filename")
            .and_then(Value::as_str)
            .map(safe_filename)
            .filter(|f| !f.is_empty());
        if let Some(filename) = filename {
            request =
                request.response_content_disposition(format!("attachment; filename=\"{filename}\""));
        } else if let Some(disposition) = extra.get("disposition").and_then(Value::as_str) {
            request = request.response_content_disposition(disposition);
        }

        let presigned = request
            .presigned(Self::presigning_config(expires_in)?)
            .await
            .map_err(|e| StorageError::Backend(format!("S3 presigning failed: {e}")))?;

        Ok(Actions {
            download: Some(Action::new(presigned.uri().to_string(), expires_in)),
            ..Default::default()
        })
    }
}
