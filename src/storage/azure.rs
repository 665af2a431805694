//! Azure Blob Storage, SAS URL based, with block-list multipart uploads.
//!
//! Multipart uploads map onto Azure's uncommitted-block machinery: the
//! object is partitioned into fixed-size blocks, each uploaded through its
//! own signed `comp=block` URL, then committed in one `comp=blocklist` call
//! whose XML body lists every block in order. Uncommitted blocks already
//! present with the right size are omitted from the returned parts, which
//! gives clients upload resume for free.

use std::collections::HashMap;

use async_trait::async_trait;
use azure_core::error::ErrorKind;
use azure_storage::StorageCredentials;
use azure_storage::shared_access_signature::service_sas::BlobSasPermissions;
use azure_storage_blobs::blob::{BlobBlockType, BlockListType};
use azure_storage_blobs::prelude::{BlobClient, ClientBuilder, ContainerClient};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use url::Url;

use crate::server::dto::{Action, Actions, Extra, PartAction};

use super::{
    ExternalStorage, MultipartStorage, StorageError, VerifiableStorage, blob_path,
};

/// Digest requested from clients for each uploaded part.
const PART_DIGEST: &str = "contentMD5";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AzureOptions {
    /// Standard Azure connection string; alternative to explicit
    /// account_name + account_key.
    pub connection_string: Option<String>,
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub container_name: String,
    pub path_prefix: Option<String>,
    /// Ask clients to send a Content-MD5 with every uploaded part.
    #[serde(default)]
    pub want_digest: bool,
}

pub struct AzureBlobsStorage {
    container: ContainerClient,
    path_prefix: Option<String>,
    want_digest: bool,
}

/// One block of a partitioned upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub id: usize,
    pub start: u64,
    pub size: u64,
}

impl Block {
    /// Azure block ids must be equal-length base64 strings; encode the index
    /// as base64 over a 16-byte zero-padded decimal.
    #[must_use]
    fn plain_id(&self) -> String {
        format!("{:016}", self.id)
    }

    #[must_use]
    pub fn encoded_id(&self) -> String {
        BASE64.encode(self.plain_id())
    }
}

/// Partition `size` bytes into blocks of `part_size`, the last block
/// possibly smaller.
#[must_use]
pub fn calculate_blocks(size: u64, part_size: u64) -> Vec<Block> {
    if size == 0 || part_size == 0 {
        return Vec::new();
    }
    let full_blocks = size / part_size;
    let last_block_size = size % part_size;
    let mut blocks: Vec<Block> = (0..full_blocks)
        .map(|i| Block {
            id: i as usize,
            start: i * part_size,
            size: part_size,
        })
        .collect();
    if last_block_size > 0 {
        blocks.push(Block {
            id: full_blocks as usize,
            start: full_blocks * part_size,
            size: last_block_size,
        });
    }
    blocks
}

/// XML body for the block-list commit call, listing every block in order.
#[must_use]
fn commit_body(blocks: &[Block]) -> String {
    let mut body = String::from("<BlockList>");
    for block in blocks {
        body.push_str("<Uncommitted>");
        body.push_str(&block.encoded_id());
        body.push_str("</Uncommitted>");
    }
    body.push_str("</BlockList>");
    body
}

fn parse_connection_string(connection_string: &str) -> Option<(String, String)> {
    let mut account = None;
    let mut key = None;
    for pair in connection_string.split(';') {
        if let Some((name, value)) = pair.split_once('=') {
            match name {
                "AccountName" => account = Some(value.to_string()),
                // Account keys are base64 and may contain '='; split_once
                // keeps the remainder intact.
                "AccountKey" => key = Some(value.to_string()),
                _ => {}
            }
        }
    }
    Some((account?, key?))
}

fn is_not_found(e: &azure_core::error::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::HttpResponse {
            status: azure_core::StatusCode::NotFound,
            ..
        }
    )
}

fn backend_error(context: &str, e: &azure_core::error::Error) -> StorageError {
    StorageError::Backend(format!("{context}: {e}"))
}

impl AzureBlobsStorage {
    pub fn new(options: AzureOptions) -> anyhow::Result<Self> {
        let (account, key) = match &options.connection_string {
            Some(cs) => parse_connection_string(cs)
                .ok_or_else(|| anyhow::anyhow!("invalid Azure connection string"))?,
            None => match (&options.account_name, &options.account_key) {
                (Some(account), Some(key)) => (account.clone(), key.clone()),
                _ => anyhow::bail!(
                    "Azure storage needs either connection_string or account_name + account_key"
                ),
            },
        };

        let credentials = StorageCredentials::access_key(account.clone(), key);
        let container =
            ClientBuilder::new(account, credentials).container_client(options.container_name.clone());

        Ok(Self {
            container,
            path_prefix: options.path_prefix,
            want_digest: options.want_digest,
        })
    }

    fn blob(&self, prefix: &str, oid: &str) -> BlobClient {
        self.container
            .blob_client(blob_path(self.path_prefix.as_deref(), prefix, oid))
    }

    async fn signed_url(
        &self,
        blob: &BlobClient,
        permissions: BlobSasPermissions,
        expires_in: u64,
    ) -> Result<Url, StorageError> {
        let expiry = OffsetDateTime::now_utc() + time::Duration::seconds(expires_in as i64);
        let sas = blob
            .shared_access_signature(permissions, expiry)
            .await
            .map_err(|e| backend_error("failed to create SAS token", &e))?;
        blob.generate_signed_blob_url(&sas)
            .map_err(|e| backend_error("failed to build signed URL", &e))
    }

    /// Existing blocks of the blob: committed flag plus uncommitted id->size.
    async fn existing_blocks(
        &self,
        blob: &BlobClient,
    ) -> Result<(bool, HashMap<Vec<u8>, u64>), StorageError> {
        let list = match blob
            .get_block_list()
            .block_list_type(BlockListType::All)
            .await
        {
            Ok(list) => list,
            Err(e) if is_not_found(&e) => return Ok((false, HashMap::new())),
            Err(e) => return Err(backend_error("failed to fetch block list", &e)),
        };

        let mut has_committed = false;
        let mut uncommitted = HashMap::new();
        for block in &list.block_with_size_list.blocks {
            match &block.block_list_type {
                BlobBlockType::Committed(_) => has_committed = true,
                BlobBlockType::Uncommitted(id) | BlobBlockType::Latest(id) => {
                    uncommitted.insert(id.as_ref().to_vec(), block.size_in_bytes);
                }
            }
        }
        Ok((has_committed, uncommitted))
    }
}

#[async_trait]
impl VerifiableStorage for AzureBlobsStorage {
    async fn exists(&self, prefix: &str, oid: &str) -> Result<bool, StorageError> {
        match self.get_size(prefix, oid).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_size(&self, prefix: &str, oid: &str) -> Result<u64, StorageError> {
        match self.blob(prefix, oid).get_properties().await {
            Ok(properties) => Ok(properties.blob.properties.content_length),
            Err(e) if is_not_found(&e) => Err(StorageError::not_found()),
            Err(e) => Err(backend_error("failed to fetch blob properties", &e)),
        }
    }
}

#[async_trait]
impl ExternalStorage for AzureBlobsStorage {
    async fn get_upload_action(
        &self,
        prefix: &str,
        oid: &str,
        _size: u64,
        expires_in: u64,
        extra: &Extra,
    ) -> Result<Actions, StorageError> {
        let blob = self.blob(prefix, oid);
        let url = self
            .signed_url(
                &blob,
                BlobSasPermissions {
                    create: true,
                    write: true,
                    ..Default::default()
                },
                expires_in,
            )
            .await?;

        let mut header = HashMap::from([(
            "x-ms-blob-type".to_string(),
            "BlockBlob".to_string(),
        )]);
        if let Some(filename) = extra.get("filename").and_then(Value::as_str) {
            if let Some(mime) = mime_guess::from_path(filename).first_raw() {
                header.insert("x-ms-blob-content-type".to_string(), mime.to_string());
            }
        }

        Ok(Actions {
            upload: Some(Action::new(url.to_string(), expires_in).with_header(header)),
            ..Default::default()
        })
    }

    async fn get_download_action(
        &self,
        prefix: &str,
        oid: &str,
        _size: u64,
        expires_in: u64,
        _extra: &Extra,
    ) -> Result<Actions, StorageError> {
        let blob = self.blob(prefix, oid);
        let url = self
            .signed_url(
                &blob,
                BlobSasPermissions {
                    read: true,
                    ..Default::default()
                },
                expires_in,
            )
            .await?;

        Ok(Actions {
            download: Some(Action::new(url.to_string(), expires_in)),
            ..Default::default()
        })
    }
}

#[async_trait]
impl MultipartStorage for AzureBlobsStorage {
    async fn get_multipart_actions(
        &self,
        prefix: &str,
        oid: &str,
        size: u64,
        part_size: u64,
        expires_in: u64,
        _extra: &Extra,
    ) -> Result<Actions, StorageError> {
        let blob = self.blob(prefix, oid);
        let blocks = calculate_blocks(size, part_size);

        let (has_committed, mut uncommitted) = self.existing_blocks(&blob).await?;

        // Committed blocks mean an earlier commit half-succeeded; a size
        // mismatch means a previous attempt used a different partitioning.
        // Either way the slate must be wiped.
        let mismatched = blocks.iter().any(|block| {
            uncommitted
                .get(block.plain_id().as_bytes())
                .is_some_and(|&existing| existing != block.size)
        });
        if has_committed || mismatched {
            debug!("discarding corrupt or stale upload state for {prefix}/{oid}");
            blob.delete()
                .await
                .map_err(|e| backend_error("failed to reset blob", &e))?;
            uncommitted.clear();
        }

        let upload_url = self
            .signed_url(
                &blob,
                BlobSasPermissions {
                    create: true,
                    write: true,
                    ..Default::default()
                },
                expires_in,
            )
            .await?;

        // Blocks already uploaded with the right size are omitted so the
        // client resumes where it left off.
        let parts: Vec<PartAction> = blocks
            .iter()
            .filter(|block| !uncommitted.contains_key(block.plain_id().as_bytes()))
            .map(|block| {
                let mut url = upload_url.clone();
                url.query_pairs_mut()
                    .append_pair("comp", "block")
                    .append_pair("blockid", &block.encoded_id());
                PartAction {
                    href: url.to_string(),
                    pos: block.start,
                    size: block.size,
                    expires_in,
                    want_digest: self.want_digest.then(|| PART_DIGEST.to_string()),
                }
            })
            .collect();

        let mut commit_url = self
            .signed_url(
                &blob,
                BlobSasPermissions {
                    write: true,
                    ..Default::default()
                },
                expires_in,
            )
            .await?;
        commit_url
            .query_pairs_mut()
            .append_pair("comp", "blocklist");

        let abort_url = self
            .signed_url(
                &blob,
                BlobSasPermissions {
                    delete: true,
                    ..Default::default()
                },
                expires_in,
            )
            .await?;

        let mut commit = Action::new(commit_url.to_string(), expires_in);
        commit.method = Some("PUT".to_string());
        commit.body = Some(commit_body(&blocks));
        commit.header = HashMap::from([(
            "Content-Type".to_string(),
            "application/xml".to_string(),
        )]);

        let mut abort = Action::new(abort_url.to_string(), expires_in);
        abort.method = Some("DELETE".to_string());

        Ok(Actions {
            parts: Some(parts),
            commit: Some(commit),
            abort: Some(abort),
            ..Default::default()
        })
    }

    async fn get_download_action(
        &self,
        prefix: &str,
        oid: &str,
        size: u64,
        expires_in: u64,
        extra: &Extra,
    ) -> Result<Actions, StorageError> {
        ExternalStorage::get_download_action(self, prefix, oid, size, expires_in, extra).await
    }
}
