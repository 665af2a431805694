//! Authentication and authorization layer.
//!
//! Authenticators are consulted in order; the first one to produce an
//! identity wins. An authenticator may also implement
//! [`PreAuthorizedActionAuthenticator`] to mint short-lived credentials that
//! transfer adapters embed into action URLs, letting clients call back into
//! the server (verify, streamed GET/PUT) without re-authenticating against
//! the original authority.

pub mod anon;
pub mod github;
pub mod identity;
pub mod jwt;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

use crate::error::LfsError;
use identity::Identity;

/// An authenticator rejected credentials that were actually presented.
///
/// Distinct from "no credentials found" (`Ok(None)` from an authenticator):
/// a denial stops the chain, while a pass lets the next authenticator try.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct Unauthorized(pub String);

/// The pieces of an HTTP request that authenticators may inspect.
pub struct AuthRequest<'a> {
    pub organization: &'a str,
    pub repo: &'a str,
    /// Raw `Authorization` header value, if any.
    pub authorization: Option<&'a str>,
    /// `jwt` query parameter, if any.
    pub jwt_param: Option<&'a str>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Try to authenticate a request. `Ok(None)` means "nothing for me
    /// here, ask the next authenticator"; `Err` means credentials were
    /// presented and rejected.
    async fn authenticate(
        &self,
        request: &AuthRequest<'_>,
    ) -> Result<Option<Arc<dyn Identity>>, Unauthorized>;
}

/// Capability of minting credentials for follow-up actions.
pub trait PreAuthorizedActionAuthenticator: Send + Sync {
    /// Authorize an action by adding credentials to the query string.
    fn get_authz_query_params(
        &self,
        identity: &dyn Identity,
        organization: &str,
        repo: &str,
        actions: Option<&HashSet<String>>,
        oid: Option<&str>,
        lifetime: Option<u64>,
    ) -> crate::error::Result<HashMap<String, String>>;

    /// Authorize an action by adding credentials to the request headers.
    fn get_authz_header(
        &self,
        identity: &dyn Identity,
        organization: &str,
        repo: &str,
        actions: Option<&HashSet<String>>,
        oid: Option<&str>,
        lifetime: Option<u64>,
    ) -> crate::error::Result<HashMap<String, String>>;
}

/// An authenticator that can both validate incoming credentials and mint
/// pre-authorized ones.
pub trait PreAuthorizer: Authenticator + PreAuthorizedActionAuthenticator {}

impl<T: Authenticator + PreAuthorizedActionAuthenticator> PreAuthorizer for T {}

enum Resolution {
    Identity(Arc<dyn Identity>),
    Denied(String),
    NoIdentity,
}

/// Ordered authenticator chain with an optional pre-authorizing handler and
/// an optional fallback identity.
pub struct Authentication {
    authenticators: Vec<Arc<dyn Authenticator>>,
    preauth: Option<Arc<dyn PreAuthorizer>>,
    default_identity: Option<Arc<dyn Identity>>,
}

impl Authentication {
    #[must_use]
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self {
            authenticators,
            preauth: None,
            default_identity: None,
        }
    }

    /// Install the pre-authorizing handler. It is consulted before every
    /// other authenticator, so pre-signed callbacks short-circuit the chain.
    #[must_use]
    pub fn with_preauth(mut self, handler: Arc<dyn PreAuthorizer>) -> Self {
        self.preauth = Some(handler);
        self
    }

    #[must_use]
    pub fn with_default_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.default_identity = Some(identity);
        self
    }

    /// The pre-authorizing handler, when one is configured. Transfer adapters
    /// use this to sign action URLs; without it they emit unsigned actions.
    #[must_use]
    pub fn preauth_handler(&self) -> Option<&Arc<dyn PreAuthorizer>> {
        self.preauth.as_ref()
    }

    async fn resolve(&self, request: &AuthRequest<'_>) -> Resolution {
        if let Some(handler) = &self.preauth {
            match handler.authenticate(request).await {
                Ok(Some(identity)) => return Resolution::Identity(identity),
                Ok(None) => {}
                Err(Unauthorized(msg)) => return Resolution::Denied(msg),
            }
        }

        for authenticator in &self.authenticators {
            match authenticator.authenticate(request).await {
                Ok(Some(identity)) => return Resolution::Identity(identity),
                Ok(None) => {}
                // The provided identity is invalid; stop looking.
                Err(Unauthorized(msg)) => return Resolution::Denied(msg),
            }
        }

        Resolution::NoIdentity
    }

    /// Run the chain and return an identity if one could be established.
    /// A denial is logged and treated as "no identity".
    pub async fn authenticate(&self, request: &AuthRequest<'_>) -> Option<Arc<dyn Identity>> {
        match self.resolve(request).await {
            Resolution::Identity(identity) => {
                debug!("authenticated identity: {identity:?}");
                Some(identity)
            }
            Resolution::Denied(msg) => {
                debug!("authentication denied: {msg}");
                None
            }
            Resolution::NoIdentity => self.default_identity.clone(),
        }
    }

    /// Run the chain and fail with 401 when no identity can be established.
    pub async fn require_identity(
        &self,
        request: &AuthRequest<'_>,
    ) -> Result<Arc<dyn Identity>, LfsError> {
        match self.resolve(request).await {
            Resolution::Identity(identity) => Ok(identity),
            Resolution::Denied(msg) => Err(LfsError::Unauthorized(msg)),
            Resolution::NoIdentity => self
                .default_identity
                .clone()
                .ok_or_else(|| LfsError::Unauthorized("Authorization required".to_string())),
        }
    }
}

/// Split a `Basic` Authorization header into username and password.
#[must_use]
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (username, password) = credentials.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Extract a bearer token from an Authorization header.
#[must_use]
pub fn parse_bearer_auth(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim)
}
