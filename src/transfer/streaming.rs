//! Basic streaming transfer adapter.
//!
//! Offers `basic` transfers by streaming uploads and downloads through this
//! server's own object endpoints, backed by any [`StreamingStorage`]. The
//! only adapter that works without signed-URL support in storage.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::server::dto::{Action, Actions, Extra, ObjectResponse};
use crate::storage::{StreamingStorage, VerifiableStorage};
use crate::util::add_query_params;

use super::{
    PreauthHelper, TransferAdapter, TransferContext, VERIFY_LIFETIME, storage_url, verify_url,
};

pub struct BasicStreamingAdapter {
    storage: Arc<dyn StreamingStorage>,
    action_lifetime: u64,
    preauth: PreauthHelper,
}

impl BasicStreamingAdapter {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StreamingStorage>,
        action_lifetime: u64,
        preauth: PreauthHelper,
    ) -> Self {
        Self {
            storage,
            action_lifetime,
            preauth,
        }
    }
}

#[async_trait]
impl TransferAdapter for BasicStreamingAdapter {
    async fn upload(
        &self,
        ctx: &TransferContext<'_>,
        oid: &str,
        size: u64,
        _extra: &Extra,
    ) -> Result<ObjectResponse> {
        let prefix = ctx.prefix();

        let up_to_date = self.storage.exists(&prefix, oid).await.unwrap_or(false)
            && self.storage.get_size(&prefix, oid).await.ok() == Some(size);
        if up_to_date {
            return Ok(ObjectResponse::already_present(oid.to_string(), size));
        }

        let upload = Action::new(
            storage_url(ctx.base_url, ctx.organization, ctx.repo, oid),
            self.action_lifetime,
        )
        .with_header(self.preauth.headers(
            ctx,
            &["write"],
            Some(oid),
            Some(self.action_lifetime),
        )?);

        let verify = Action::new(
            verify_url(ctx.base_url, ctx.organization, ctx.repo),
            VERIFY_LIFETIME,
        )
        .with_header(self.preauth.headers(
            ctx,
            &["verify"],
            Some(oid),
            Some(VERIFY_LIFETIME),
        )?);

        Ok(ObjectResponse::with_actions(
            oid.to_string(),
            size,
            Actions {
                upload: Some(upload),
                verify: Some(verify),
                ..Default::default()
            },
            self.preauth.provides_preauth(),
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

        if !self.storage.exists(&prefix, oid).await.unwrap_or(false) {
            return Ok(ObjectResponse::with_error(
                oid.to_string(),
                size,
                404,
                "Object does not exist",
            ));
        }
        if self.storage.get_size(&prefix, oid).await.ok() != Some(size) {
            return Ok(ObjectResponse::with_error(
                oid.to_string(),
                size,
                422,
                "Object size does not match",
            ));
        }

        let mut href = self.preauth.sign_url(
            storage_url(ctx.base_url, ctx.organization, ctx.repo, oid),
            ctx,
            &["read"],
            Some(oid),
            Some(self.action_lifetime),
        )?;

        // The object endpoint turns these into a Content-Disposition header.
        if let Some(filename) = extra.get("filename").and_then(Value::as_str) {
            href = add_query_params(&href, [("filename", filename)]);
        }
        if let Some(disposition) = extra.get("disposition").and_then(Value::as_str) {
            href = add_query_params(&href, [("disposition", disposition)]);
        }

        Ok(ObjectResponse::with_actions(
            oid.to_string(),
            size,
            Actions {
                download: Some(Action::new(href, self.action_lifetime)),
                ..Default::default()
            },
            self.preauth.provides_preauth(),
        ))
    }

    fn verifiable_storage(&self) -> Arc<dyn VerifiableStorage> {
        self.storage.clone()
    }

    fn streaming_storage(&self) -> Option<Arc<dyn StreamingStorage>> {
        Some(self.storage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authentication;
    use crate::auth::identity::{DefaultIdentity, Identity};
    use crate::auth::jwt::{JwtAuthenticator, JwtOptions};
    use crate::storage::local::LocalStorage;
    use tempfile::TempDir;

    const OID: &str = "12345678";

    fn identity() -> Arc<dyn Identity> {
        Arc::new(DefaultIdentity::new(
            Some("tester".into()),
            Some("tester-id".into()),
            None,
        ))
    }

    fn preauth_chain() -> Arc<Authentication> {
        let jwt = JwtAuthenticator::new(JwtOptions {
            private_key: Some("test-secret".to_string()),
            ..Default::default()
        })
        .unwrap();
        Arc::new(Authentication::new(Vec::new()).with_preauth(Arc::new(jwt)))
    }

    fn adapter(dir: &TempDir, auth: Arc<Authentication>) -> BasicStreamingAdapter {
        BasicStreamingAdapter::new(
            Arc::new(LocalStorage::new(dir.path())),
            900,
            PreauthHelper::new(auth),
        )
    }

    async fn put_object(dir: &TempDir, data: &[u8]) {
        let storage = LocalStorage::new(dir.path());
        storage
            .put("myorg/myrepo", OID, &mut &data[..])
            .await
            .unwrap();
    }

    fn context<'a>(identity: &'a Arc<dyn Identity>) -> TransferContext<'a> {
        TransferContext {
            organization: "myorg",
            repo: "myrepo",
            base_url: "http://localhost:8080",
            identity,
        }
    }

    #[tokio::test]
    async fn test_upload_new_object() {
        let dir = TempDir::new().unwrap();
        let identity = identity();
        let adapter = adapter(&dir, preauth_chain());

        let response = adapter
            .upload(&context(&identity), OID, 8, &Extra::new())
            .await
            .unwrap();

        assert_eq!(response.authenticated, Some(true));
        let actions = response.actions.unwrap();
        let upload = actions.upload.unwrap();
        assert!(upload.href.ends_with("/myorg/myrepo.git/info/lfs/objects/storage/12345678"));
        assert!(upload.header.get("Authorization").unwrap().starts_with("Bearer "));
        assert_eq!(upload.expires_in, 900);

        let verify = actions.verify.unwrap();
        assert!(verify.href.ends_with("/myorg/myrepo.git/info/lfs/objects/storage/verify"));
        assert_eq!(verify.expires_in, VERIFY_LIFETIME);
    }

    #[tokio::test]
    async fn test_upload_existing_object_is_empty() {
        let dir = TempDir::new().unwrap();
        put_object(&dir, b"12345678").await;
        let identity = identity();
        let adapter = adapter(&dir, preauth_chain());

        let response = adapter
            .upload(&context(&identity), OID, 8, &Extra::new())
            .await
            .unwrap();

        assert!(response.actions.is_none());
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_upload_size_mismatch_reissues_actions() {
        let dir = TempDir::new().unwrap();
        put_object(&dir, b"123").await;
        let identity = identity();
        let adapter = adapter(&dir, preauth_chain());

        let response = adapter
            .upload(&context(&identity), OID, 8, &Extra::new())
            .await
            .unwrap();
        assert!(response.actions.is_some());
    }

    #[tokio::test]
    async fn test_download_signs_url_and_carries_filename() {
        let dir = TempDir::new().unwrap();
        put_object(&dir, b"12345678").await;
        let identity = identity();
        let adapter = adapter(&dir, preauth_chain());

        let extra = Extra::from([(
            "filename".to_string(),
            serde_json::json!("data.bin"),
        )]);
        let response = adapter
            .download(&context(&identity), OID, 8, &extra)
            .await
            .unwrap();

        assert_eq!(response.authenticated, Some(true));
        let download = response.actions.unwrap().download.unwrap();
        assert!(download.href.contains("jwt="));
        assert!(download.href.contains("filename=data.bin"));
    }

    #[tokio::test]
    async fn test_download_missing_object() {
        let dir = TempDir::new().unwrap();
        let identity = identity();
        let adapter = adapter(&dir, preauth_chain());

        let response = adapter
            .download(&context(&identity), OID, 8, &Extra::new())
            .await
            .unwrap();
        assert!(response.is_error(Some(404)));
    }

    #[tokio::test]
    async fn test_download_size_mismatch() {
        let dir = TempDir::new().unwrap();
        put_object(&dir, b"123").await;
        let identity = identity();
        let adapter = adapter(&dir, preauth_chain());

        let response = adapter
            .download(&context(&identity), OID, 8, &Extra::new())
            .await
            .unwrap();
        assert!(response.is_error(Some(422)));
    }

    #[tokio::test]
    async fn test_without_preauth_actions_are_unsigned() {
        let dir = TempDir::new().unwrap();
        put_object(&dir, b"12345678").await;
        let identity = identity();
        let adapter = adapter(&dir, Arc::new(Authentication::new(Vec::new())));

        let response = adapter
            .download(&context(&identity), OID, 8, &Extra::new())
            .await
            .unwrap();
        assert_eq!(response.authenticated, Some(false));
        let download = response.actions.unwrap().download.unwrap();
        assert!(!download.href.contains("jwt="));
    }
}
