//! Transfer adapters.
//!
//! A transfer adapter turns one object of a batch request into an action
//! plan: where to upload or download, with which headers, valid for how
//! long. Adapters consult the authenticator chain's pre-authorization
//! capability to embed short-lived credentials into those actions, so
//! clients can execute them without re-authenticating.
//!
//! See <https://github.com/git-lfs/git-lfs/blob/master/docs/api/basic-transfers.md>
//! for background on what transfer APIs do in Git LFS.

pub mod external;
pub mod multipart;
pub mod streaming;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::Authentication;
use crate::auth::identity::Identity;
use crate::error::Result;
use crate::server::dto::{Extra, ObjectResponse};
use crate::storage::{StorageError, StreamingStorage, VerifiableStorage};
use crate::util::add_query_params;

/// Verify tokens outlive regular action tokens by a wide margin: a client
/// may finish a large upload hours after the batch response was issued.
pub const VERIFY_LIFETIME: u64 = 12 * 60 * 60;

/// Per-request context handed to adapters alongside each object.
pub struct TransferContext<'a> {
    pub organization: &'a str,
    pub repo: &'a str,
    /// `scheme://host` of this server, for actions that point back at it.
    pub base_url: &'a str,
    pub identity: &'a Arc<dyn Identity>,
}

impl TransferContext<'_> {
    /// The storage-layer key prefix for this repository.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("{}/{}", self.organization, self.repo)
    }
}

#[async_trait]
pub trait TransferAdapter: Send + Sync {
    async fn upload(
        &self,
        ctx: &TransferContext<'_>,
        oid: &str,
        size: u64,
        extra: &Extra,
    ) -> Result<ObjectResponse>;

    async fn download(
        &self,
        ctx: &TransferContext<'_>,
        oid: &str,
        size: u64,
        extra: &Extra,
    ) -> Result<ObjectResponse>;

    /// Storage consulted by the shared verify endpoint.
    fn verifiable_storage(&self) -> Arc<dyn VerifiableStorage>;

    /// Present when this adapter streams objects through the server itself,
    /// in which case the object storage endpoints are mounted.
    fn streaming_storage(&self) -> Option<Arc<dyn StreamingStorage>> {
        None
    }
}

/// Registry of transfer adapters for one server instance, in registration
/// order.
#[derive(Default)]
pub struct TransferRegistry {
    adapters: Vec<(String, Arc<dyn TransferAdapter>)>,
}

impl TransferRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, adapter: Arc<dyn TransferAdapter>) {
        self.adapters.push((key.into(), adapter));
    }

    /// Select an adapter by the client's preference list, first match wins.
    #[must_use]
    pub fn match_adapter(&self, transfers: &[String]) -> Option<(&str, &Arc<dyn TransferAdapter>)> {
        transfers.iter().find_map(|wanted| {
            self.adapters
                .iter()
                .find(|(key, _)| key == wanted)
                .map(|(key, adapter)| (key.as_str(), adapter))
        })
    }

    /// The first registered adapter; its storage backs the verify endpoint.
    #[must_use]
    pub fn default_adapter(&self) -> Option<&Arc<dyn TransferAdapter>> {
        self.adapters.first().map(|(_, adapter)| adapter)
    }

    /// The first adapter that streams through the server, if any.
    #[must_use]
    pub fn streaming_storage(&self) -> Option<Arc<dyn StreamingStorage>> {
        self.adapters
            .iter()
            .find_map(|(_, adapter)| adapter.streaming_storage())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// URL of the streaming object endpoint for one object.
#[must_use]
pub fn storage_url(base_url: &str, organization: &str, repo: &str, oid: &str) -> String {
    format!("{base_url}/{organization}/{repo}.git/info/lfs/objects/storage/{oid}")
}

/// URL of the shared verify endpoint.
#[must_use]
pub fn verify_url(base_url: &str, organization: &str, repo: &str) -> String {
    format!("{base_url}/{organization}/{repo}.git/info/lfs/objects/storage/verify")
}

/// Bridge between adapters and the authenticator chain's pre-authorization
/// capability. When no pre-authorizing authenticator is configured, headers
/// come back empty and URLs unsigned, and the adapter reports
/// `authenticated: false`.
#[derive(Clone)]
pub struct PreauthHelper {
    auth: Arc<Authentication>,
}

impl PreauthHelper {
    #[must_use]
    pub fn new(auth: Arc<Authentication>) -> Self {
        Self { auth }
    }

    #[must_use]
    pub fn provides_preauth(&self) -> bool {
        self.auth.preauth_handler().is_some()
    }

    pub fn headers(
        &self,
        ctx: &TransferContext<'_>,
        actions: &[&str],
        oid: Option<&str>,
        lifetime: Option<u64>,
    ) -> Result<HashMap<String, String>> {
        match self.auth.preauth_handler() {
            Some(handler) => handler.get_authz_header(
                ctx.identity.as_ref(),
                ctx.organization,
                ctx.repo,
                Some(&to_action_set(actions)),
                oid,
                lifetime,
            ),
            None => Ok(HashMap::new()),
        }
    }

    pub fn sign_url(
        &self,
        href: String,
        ctx: &TransferContext<'_>,
        actions: &[&str],
        oid: Option<&str>,
        lifetime: Option<u64>,
    ) -> Result<String> {
        match self.auth.preauth_handler() {
            Some(handler) => {
                let params = handler.get_authz_query_params(
                    ctx.identity.as_ref(),
                    ctx.organization,
                    ctx.repo,
                    Some(&to_action_set(actions)),
                    oid,
                    lifetime,
                )?;
                Ok(add_query_params(
                    &href,
                    params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                ))
            }
            None => Ok(href),
        }
    }
}

fn to_action_set(actions: &[&str]) -> HashSet<String> {
    actions.iter().map(|a| (*a).to_string()).collect()
}

/// Map a storage failure onto a per-object error entry where it has an HTTP
/// code, or surface it as an internal fault otherwise.
pub(crate) fn storage_error_response(
    oid: &str,
    size: u64,
    error: &StorageError,
) -> Result<ObjectResponse> {
    match error.code() {
        Some(code) => Ok(ObjectResponse::with_error(
            oid.to_string(),
            size,
            code,
            error.to_string(),
        )),
        None => Err(crate::error::LfsError::Internal(error.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAdapter;

    #[async_trait]
    impl TransferAdapter for NullAdapter {
        async fn upload(
            &self,
            _ctx: &TransferContext<'_>,
            oid: &str,
            size: u64,
            _extra: &Extra,
        ) -> Result<ObjectResponse> {
            Ok(ObjectResponse::already_present(oid.to_string(), size))
        }

        async fn download(
            &self,
            _ctx: &TransferContext<'_>,
            oid: &str,
            size: u64,
            _extra: &Extra,
        ) -> Result<ObjectResponse> {
            Ok(ObjectResponse::already_present(oid.to_string(), size))
        }

        fn verifiable_storage(&self) -> Arc<dyn VerifiableStorage> {
            unimplemented!("not used in these tests")
        }
    }

    #[test]
    fn test_registry_matches_in_client_order() {
        let mut registry = TransferRegistry::new();
        registry.register("basic", Arc::new(NullAdapter));
        registry.register("multipart-basic", Arc::new(NullAdapter));

        let (key, _) = registry
            .match_adapter(&["multipart-basic".to_string(), "basic".to_string()])
            .unwrap();
        assert_eq!(key, "multipart-basic");

        let (key, _) = registry.match_adapter(&["basic".to_string()]).unwrap();
        assert_eq!(key, "basic");

        assert!(registry.match_adapter(&["tus".to_string()]).is_none());
    }

    #[test]
    fn test_action_urls() {
        assert_eq!(
            storage_url("http://localhost:8080", "myorg", "myrepo", "abc123"),
            "http://localhost:8080/myorg/myrepo.git/info/lfs/objects/storage/abc123"
        );
        assert_eq!(
            verify_url("http://localhost:8080", "myorg", "myrepo"),
            "http://localhost:8080/myorg/myrepo.git/info/lfs/objects/storage/verify"
        );
    }
}
