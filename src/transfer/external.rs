//! Basic external transfer adapter.
//!
//! Directs clients to upload and download objects straight against an
//! external storage service (S3, Azure Blobs, GCS) through pre-signed URLs;
//! object bytes never pass through this server. Works with any backend
//! implementing [`ExternalStorage`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::server::dto::{Action, Extra, ObjectResponse};
use crate::storage::{ExternalStorage, StorageError, VerifiableStorage};

use super::{
    PreauthHelper, TransferAdapter, TransferContext, VERIFY_LIFETIME, storage_error_response,
    verify_url,
};

pub struct BasicExternalAdapter {
    storage: Arc<dyn ExternalStorage>,
    action_lifetime: u64,
    preauth: PreauthHelper,
}

impl BasicExternalAdapter {
    #[must_use]
    pub fn new(
        storage: Arc<dyn ExternalStorage>,
        action_lifetime: u64,
        preauth: PreauthHelper,
    ) -> Self {
        Self {
            storage,
            action_lifetime,
            preauth,
        }
    }

    fn verify_action(&self, ctx: &TransferContext<'_>, oid: &str) -> Result<Action> {
        let header = self
            .preauth
            .headers(ctx, &["verify"], Some(oid), Some(VERIFY_LIFETIME))?;
        Ok(Action::new(
            verify_url(ctx.base_url, ctx.organization, ctx.repo),
            VERIFY_LIFETIME,
        )
        .with_header(header))
    }

    /// Raise the precise per-object error for an invalid download target;
    /// unlike `verify_object` this distinguishes missing from mismatched.
    async fn check_object(&self, prefix: &str, oid: &str, size: u64) -> std::result::Result<(), StorageError> {
        let actual = self.storage.get_size(prefix, oid).await?;
        if actual != size {
            return Err(StorageError::Invalid(
                "Object size does not match".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferAdapter for BasicExternalAdapter {
    async fn upload(
        &self,
        ctx: &TransferContext<'_>,
        oid: &str,
        size: u64,
        extra: &Extra,
    ) -> Result<ObjectResponse> {
        let prefix = ctx.prefix();

        if self.storage.verify_object(&prefix, oid, size).await {
            // No upload required, we already have this object.
            return Ok(ObjectResponse::already_present(oid.to_string(), size));
        }

        let mut actions = match self
            .storage
            .get_upload_action(&prefix, oid, size, self.action_lifetime, extra)
            .await
        {
            Ok(actions) => actions,
            Err(e) => return storage_error_response(oid, size, &e),
        };

        let authenticated = if actions.upload.is_some() {
            actions.verify = Some(self.verify_action(ctx, oid)?);
            self.preauth.provides_preauth()
        } else {
            false
        };

        Ok(ObjectResponse::with_actions(
            oid.to_string(),
            size,
            actions,
            authenticated,
        ))
    }

    async fn download(
        &self,
        ctx: &TransferContext<'_>,
        oid: &str,
        size: u64,
        extra: &Extra,
    ) -> Result<ObjectResponse> {
        let prefix = ctx.prefix();

        if let Err(e) = self.check_object(&prefix, oid, size).await {
            return storage_error_response(oid, size, &e);
        }

        let actions = match self
            .storage
            .get_download_action(&prefix, oid, size, self.action_lifetime, extra)
            .await
        {
            Ok(actions) => actions,
            Err(e) => return storage_error_response(oid, size, &e),
        };

        let authenticated = actions.download.is_some() && self.preauth.provides_preauth();
        Ok(ObjectResponse::with_actions(
            oid.to_string(),
            size,
            actions,
            authenticated,
        ))
    }

    fn verifiable_storage(&self) -> Arc<dyn VerifiableStorage> {
        self.storage.clone()
    }
}
