//! Google Cloud Storage, V4 signed URL based.
//!
//! Credentials come from one of three sources: a service-account JSON key
//! file, the same JSON inlined as base64 in configuration, or Workload
//! Identity. In the last mode there is no local private key, so URLs are
//! signed by impersonating the configured service account through the IAM
//! credentials API; tokens minted that way are capped at one hour.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::sign::{SignBy, SignedURLMethod, SignedURLOptions};
use serde::Deserialize;
use serde_json::Value;

use crate::server::dto::{Action, Actions, Extra};
use crate::util::safe_filename;

use super::{ExternalStorage, StorageError, VerifiableStorage, blob_path};

/// IAM-minted signing tokens are valid for at most one hour.
const WORKLOAD_IDENTITY_MAX_LIFETIME: u64 = 3600;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcsOptions {
    pub bucket_name: String,
    pub path_prefix: Option<String>,
    /// Path to a service account JSON key file.
    pub account_key_file: Option<String>,
    /// Base64-encoded service account JSON.
    pub account_key_base64: Option<String>,
    /// Service account to impersonate under Workload Identity.
    pub serviceaccount_email: Option<String>,
}

pub struct GoogleCloudStorage {
    client: Client,
    bucket: String,
    path_prefix: Option<String>,
    serviceaccount_email: Option<String>,
    workload_identity: bool,
}

fn signing_lifetime(expires_in: u64, workload_identity: bool) -> u64 {
    if workload_identity {
        expires_in.min(WORKLOAD_IDENTITY_MAX_LIFETIME)
    } else {
        expires_in
    }
}

fn is_not_found(e: &google_cloud_storage::http::Error) -> bool {
    matches!(e, google_cloud_storage::http::Error::Response(response) if response.code == 404)
}

impl GoogleCloudStorage {
    pub async fn new(options: GcsOptions) -> anyhow::Result<Self> {
        let (config, workload_identity) = if let Some(path) = &options.account_key_file {
            let credentials = CredentialsFile::new_from_file(path.clone()).await?;
            (
                ClientConfig::default().with_credentials(credentials).await?,
                false,
            )
        } else if let Some(encoded) = &options.account_key_base64 {
            let json = String::from_utf8(BASE64.decode(encoded)?)?;
            let credentials = CredentialsFile::new_from_str(&json).await?;
            (
                ClientConfig::default().with_credentials(credentials).await?,
                false,
            )
        } else {
            // Application default credentials; on GKE this is Workload
            // Identity and signing goes through the IAM credentials API.
            (ClientConfig::default().with_auth().await?, true)
        };

        Ok(Self {
            client: Client::new(config),
            bucket: options.bucket_name,
            path_prefix: options.path_prefix,
            serviceaccount_email: options.serviceaccount_email,
            workload_identity,
        })
    }

    fn key(&self, prefix: &str, oid: &str) -> String {
        blob_path(self.path_prefix.as_deref(), prefix, oid)
    }

    async fn signed_url(
        &self,
        prefix: &str,
        oid: &str,
        method: SignedURLMethod,
        expires_in: u64,
        query_parameters: Vec<(String, String)>,
    ) -> Result<String, StorageError> {
        let lifetime = signing_lifetime(expires_in, self.workload_identity);
        let mut options = SignedURLOptions {
            method,
            expires: Duration::from_secs(lifetime),
            ..Default::default()
        };
        for (name, value) in query_parameters {
            options
                .query_parameters
                .entry(name)
                .or_default()
                .push(value);
        }

        let (google_access_id, sign_by) = if self.workload_identity {
            (
                self.serviceaccount_email.clone(),
                Some(SignBy::SignBytes),
            )
        } else {
            (None, None)
        };

        self.client
            .signed_url(
                &self.bucket,
                &self.key(prefix, oid),
                google_access_id,
                sign_by,
                options,
            )
            .await
            .map_err(|e| StorageError::Backend(format!("GCS URL signing failed: {e}")))
    }
}

#[async_trait]
impl VerifiableStorage for GoogleCloudStorage {
    async fn exists(&self, prefix: &str, oid: &str) -> Result<bool, StorageError> {
        match self.get_size(prefix, oid).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_size(&self, prefix: &str, oid: &str) -> Result<u64, StorageError> {
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            object: self.key(prefix, oid),
            ..Default::default()
        };
        match self.client.get_object(&request).await {
            Ok(object) => Ok(object.size.max(0) as u64),
            Err(e) if is_not_found(&e) => Err(StorageError::not_found()),
            Err(e) => Err(StorageError::Backend(format!(
                "GCS metadata fetch failed: {e}"
            ))),
        }
    }
}

#[async_trait]
impl ExternalStorage for GoogleCloudStorage {
    async fn get_upload_action(
        &self,
        prefix: &str,
        oid: &str,
        _size: u64,
        expires_in: u64,
        _extra: &Extra,
    ) -> Result<Actions, StorageError> {
        let href = self
            .signed_url(prefix, oid, SignedURLMethod::PUT, expires_in, Vec::new())
            .await?;

        Ok(Actions {
            upload: Some(Action::new(href, expires_in)),
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
        let mut query_parameters = Vec::new();
        let filename = extra
            .get("filename")
            .and_then(Value::as_str)
            .map(safe_filename)
            .filter(|f| !f.is_empty());
        if let Some(filename) = filename {
            query_parameters.push((
                "response-content-disposition".to_string(),
                format!("attachment; filename=\"{filename}\""),
            ));
        } else if let Some(disposition) = extra.get("disposition").and_then(Value::as_str) {
            query_parameters.push((
                "response-content-disposition".to_string(),
                disposition.to_string(),
            ));
        }

        let href = self
            .signed_url(
                prefix,
                oid,
                SignedURLMethod::GET,
                expires_in,
                query_parameters,
            )
            .await?;

        Ok(Actions {
            download: Some(Action::new(href, expires_in)),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_lifetime_capped_under_workload_identity() {
        assert_eq!(signing_lifetime(900, false), 900);
        assert_eq!(signing_lifetime(43_200, false), 43_200);
        assert_eq!(signing_lifetime(900, true), 900);
        assert_eq!(signing_lifetime(43_200, true), 3600);
    }
}
