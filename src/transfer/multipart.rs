//! Multipart transfer adapter.
//!
//! Same contract as the external adapter, but uploads are split into
//! independently signed parts through a [`MultipartStorage`] backend. Large
//! uploads take a while, so the default action lifetime is generous.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::server::dto::{Action, Extra, ObjectResponse};
use crate::storage::{MultipartStorage, StorageError, VerifiableStorage};

use super::{
    PreauthHelper, TransferAdapter, TransferContext, VERIFY_LIFETIME, storage_error_response,
    verify_url,
};

/// 10MB (-ish).
pub const DEFAULT_PART_SIZE: u64 = 10_240_000;

/// 6 hours.
pub const DEFAULT_ACTION_LIFETIME: u64 = 6 * 60 * 60;

pub struct MultipartAdapter {
    storage: Arc<dyn MultipartStorage>,
    action_lifetime: u64,
    max_part_size: u64,
    preauth: PreauthHelper,
}

impl MultipartAdapter {
    #[must_use]
    pub fn new(
        storage: Arc<dyn MultipartStorage>,
        action_lifetime: u64,
        max_part_size: u64,
        preauth: PreauthHelper,
    ) -> Self {
        Self {
            storage,
            action_lifetime,
            max_part_size,
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

    async fn check_object(
        &self,
        prefix: &str,
        oid: &str,
        size: u64,
    ) -> std::result::Result<(), StorageError> {
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
impl TransferAdapter for MultipartAdapter {
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
            .get_multipart_actions(
                &prefix,
                oid,
                size,
                self.max_part_size,
                self.action_lifetime,
                extra,
            )
            .await
        {
            Ok(actions) => actions,
            Err(e) => return storage_error_response(oid, size, &e),
        };

        let authenticated = if actions.is_empty() {
            false
        } else {
            actions.verify = Some(self.verify_action(ctx, oid)?);
            true
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

        let authenticated = actions.download.is_some();
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
