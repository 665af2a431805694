//! Anonymous access authenticators.
//!
//! Always produce an identity named "anonymous" with fixed permissions. Only
//! meant for closed deployments or servers sitting behind an authenticating
//! proxy; when used as a fallback (e.g. anonymous read-only access), it must
//! be the last authenticator in the chain.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::identity::{DefaultIdentity, Identity, Permission};
use super::{AuthRequest, Authenticator, Unauthorized};

fn anonymous_identity(permissions: HashSet<Permission>) -> Arc<dyn Identity> {
    let mut identity = DefaultIdentity::new(Some("anonymous".to_string()), None, None);
    identity.allow(None, None, permissions, None);
    Arc::new(identity)
}

/// Grants read-only permissions to everyone.
pub struct ReadOnly;

#[async_trait]
impl Authenticator for ReadOnly {
    async fn authenticate(
        &self,
        _request: &AuthRequest<'_>,
    ) -> Result<Option<Arc<dyn Identity>>, Unauthorized> {
        Ok(Some(anonymous_identity(HashSet::from([
            Permission::Read,
            Permission::ReadMeta,
        ]))))
    }
}

/// Grants full permissions to everyone.
pub struct ReadWrite;

#[async_trait]
impl Authenticator for ReadWrite {
    async fn authenticate(
        &self,
        _request: &AuthRequest<'_>,
    ) -> Result<Option<Arc<dyn Identity>>, Unauthorized> {
        Ok(Some(anonymous_identity(Permission::all())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>() -> AuthRequest<'a> {
        AuthRequest {
            organization: "org",
            repo: "repo",
            authorization: None,
            jwt_param: None,
        }
    }

    #[tokio::test]
    async fn test_read_only_denies_writes() {
        let identity = ReadOnly.authenticate(&request()).await.unwrap().unwrap();
        assert_eq!(identity.name(), Some("anonymous"));
        assert!(identity.is_authorized("org", "repo", Permission::Read, None));
        assert!(identity.is_authorized("org", "repo", Permission::ReadMeta, Some("abc")));
        assert!(!identity.is_authorized("org", "repo", Permission::Write, None));
    }

    #[tokio::test]
    async fn test_read_write_allows_everything() {
        let identity = ReadWrite.authenticate(&request()).await.unwrap().unwrap();
        assert!(identity.is_authorized("org", "repo", Permission::Write, Some("abc")));
    }
}
