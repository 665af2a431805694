//! JWT authentication and pre-authorization.
//!
//! Accepts well-formed JWT tokens from the `Authorization: Bearer` header,
//! from Basic auth (when the username matches the configured sentinel, by
//! default `_jwt`), or from the `jwt` query parameter. Tokens must be signed
//! with the configured key and satisfy expiry / not-before / issuer /
//! audience constraints, with a configurable leeway for clock skew.
//!
//! Authorization is carried in the `scopes` claim. Each scope string has the
//! form
//!
//! ```text
//! obj:{org}/{repo}/{oid}[:{subscope}]:{actions}
//! ```
//!
//! where any of `{org}`, `{repo}`, `{oid}` may be `*` (or omitted) to
//! designate a wildcard, `{subscope}` may be `metadata`/`meta` to restrict
//! the grant to metadata-only operations, and `{actions}` is a
//! comma-separated subset of `read`, `write`, `verify` (missing or `*` means
//! all).
//!
//! The same authenticator mints tokens: transfer adapters ask it for
//! pre-authorized headers or query parameters scoped to a single
//! `(org, repo, actions, oid)` tuple, which clients later present when
//! calling back into the server.
//!
//! When a `key_id` is configured, tokens without a matching `kid` header are
//! passed over without failing, so several JWT authenticators can be chained.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LfsError;

use super::identity::{DefaultIdentity, Identity, Permission};
use super::{
    AuthRequest, Authenticator, PreAuthorizedActionAuthenticator, Unauthorized, parse_basic_auth,
    parse_bearer_auth,
};

pub const DEFAULT_LIFETIME: u64 = 60;
pub const DEFAULT_LEEWAY: u64 = 10;
pub const DEFAULT_BASIC_AUTH_USER: &str = "_jwt";

/// Options for building a [`JwtAuthenticator`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwtOptions {
    pub private_key: Option<String>,
    pub private_key_file: Option<String>,
    pub public_key: Option<String>,
    pub public_key_file: Option<String>,
    pub algorithm: Option<String>,
    pub default_lifetime: Option<u64>,
    pub leeway: Option<u64>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub key_id: Option<String>,
    pub basic_auth_user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum ScopesClaim {
    Single(String),
    Multiple(Vec<String>),
}

impl ScopesClaim {
    fn iter(&self) -> impl Iterator<Item = &str> {
        let items: Vec<&str> = match self {
            Self::Single(s) => vec![s.as_str()],
            Self::Multiple(v) => v.iter().map(String::as_str).collect(),
        };
        items.into_iter()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aud: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scopes: Option<ScopesClaim>,
}

pub struct JwtAuthenticator {
    algorithm: Algorithm,
    decoding_key: DecodingKey,
    encoding_key: Option<EncodingKey>,
    default_lifetime: u64,
    leeway: u64,
    issuer: Option<String>,
    audience: Option<String>,
    key_id: Option<String>,
    basic_auth_user: Option<String>,
}

impl JwtAuthenticator {
    pub fn new(options: JwtOptions) -> anyhow::Result<Self> {
        let algorithm = match &options.algorithm {
            Some(name) => Algorithm::from_str(name)
                .map_err(|_| anyhow::anyhow!("unsupported JWT algorithm: {name}"))?,
            None => Algorithm::HS256,
        };

        let private_key = read_key(options.private_key, options.private_key_file.as_deref())?;
        let public_key = read_key(options.public_key, options.public_key_file.as_deref())?;

        let symmetric = matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512);

        let decoding_key = if symmetric {
            let key = private_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("HS* algorithms require a private_key"))?;
            DecodingKey::from_secret(key.as_bytes())
        } else {
            let pem = public_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("asymmetric algorithms require a public_key"))?;
            match algorithm {
                Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem.as_bytes())?,
                _ => DecodingKey::from_rsa_pem(pem.as_bytes())?,
            }
        };

        let encoding_key = match private_key.as_deref() {
            Some(key) if symmetric => Some(EncodingKey::from_secret(key.as_bytes())),
            Some(pem) => Some(match algorithm {
                Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem.as_bytes())?,
                _ => EncodingKey::from_rsa_pem(pem.as_bytes())?,
            }),
            None => None,
        };

        Ok(Self {
            algorithm,
            decoding_key,
            encoding_key,
            default_lifetime: options.default_lifetime.unwrap_or(DEFAULT_LIFETIME),
            leeway: options.leeway.unwrap_or(DEFAULT_LEEWAY),
            issuer: options.issuer,
            audience: options.audience,
            key_id: options.key_id,
            basic_auth_user: options
                .basic_auth_user
                .or_else(|| Some(DEFAULT_BASIC_AUTH_USER.to_string())),
        })
    }

    fn extract_token<'a>(&self, request: &AuthRequest<'a>) -> Option<String> {
        if let Some(header) = request.authorization {
            if let Some(token) = parse_bearer_auth(header) {
                debug!("found token in Authorization: Bearer header");
                return Some(token.to_string());
            }
            if let Some(expected_user) = &self.basic_auth_user {
                if let Some((username, password)) = parse_basic_auth(header) {
                    if &username == expected_user {
                        debug!("found token in Authorization: Basic header");
                        return Some(password);
                    }
                }
            }
        }
        request.jwt_param.map(str::to_string)
    }

    fn decode(&self, token: &str) -> Result<Option<Claims>, Unauthorized> {
        // Not a JWT, or wrong key ID: pass without failing so another
        // authenticator in the chain can have a look.
        let Ok(header) = jsonwebtoken::decode_header(token) else {
            return Ok(None);
        };
        if let Some(expected_kid) = &self.key_id {
            if header.kid.as_deref() != Some(expected_kid.as_str()) {
                return Ok(None);
            }
        }

        let mut validation = Validation::new(self.algorithm);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        if let Some(iss) = &self.issuer {
            validation.set_issuer(&[iss]);
        }

        match jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(Some(data.claims)),
            Err(e) => Err(Unauthorized(format!(
                "Expired or otherwise invalid JWT token ({e})"
            ))),
        }
    }

    fn identity_from_claims(&self, claims: Claims) -> Arc<dyn Identity> {
        let name = claims.name.clone().or_else(|| claims.sub.clone());
        let mut identity = DefaultIdentity::new(name, claims.sub, claims.email);

        if let Some(scopes) = &claims.scopes {
            for scope_str in scopes.iter() {
                debug!("allowing scope: {scope_str}");
                let Ok(scope) = Scope::from_str(scope_str) else {
                    continue;
                };
                if let Some(grant) = scope.into_grant() {
                    identity.allow(
                        grant.organization.as_deref(),
                        grant.repo.as_deref(),
                        grant.permissions,
                        grant.oid.as_deref(),
                    );
                }
            }
        }

        Arc::new(identity)
    }

    fn generate_token_for_action(
        &self,
        identity: &dyn Identity,
        organization: &str,
        repo: &str,
        actions: Option<&HashSet<String>>,
        oid: Option<&str>,
        lifetime: Option<u64>,
    ) -> crate::error::Result<String> {
        let encoding_key = self.encoding_key.as_ref().ok_or_else(|| {
            LfsError::Internal(
                "this authenticator is not configured to generate tokens; set private_key to fix"
                    .to_string(),
            )
        })?;

        let scope = Scope {
            entity_type: "obj".to_string(),
            entity_ref: Some(format!("{organization}/{repo}/{}", oid.unwrap_or("*"))),
            subscope: None,
            actions: actions.map(|set| set.iter().cloned().collect::<BTreeSet<_>>()),
        };

        let now = Utc::now().timestamp();
        let lifetime = lifetime.unwrap_or(self.default_lifetime) as i64;
        let claims = Claims {
            exp: now + lifetime,
            iat: Some(now),
            nbf: Some(now),
            sub: identity.id().map(str::to_string),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            name: identity.name().map(str::to_string),
            email: identity.email().map(str::to_string),
            scopes: Some(ScopesClaim::Single(scope.to_string())),
        };

        let header = Header {
            alg: self.algorithm,
            kid: self.key_id.clone(),
            ..Default::default()
        };

        jsonwebtoken::encode(&header, &claims, encoding_key)
            .map_err(|e| LfsError::Internal(format!("failed to sign action token: {e}")))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(
        &self,
        request: &AuthRequest<'_>,
    ) -> Result<Option<Arc<dyn Identity>>, Unauthorized> {
        let Some(token) = self.extract_token(request) else {
            return Ok(None);
        };
        match self.decode(&token)? {
            Some(claims) => Ok(Some(self.identity_from_claims(claims))),
            None => Ok(None),
        }
    }
}

impl PreAuthorizedActionAuthenticator for JwtAuthenticator {
    fn get_authz_query_params(
        &self,
        identity: &dyn Identity,
        organization: &str,
        repo: &str,
        actions: Option<&HashSet<String>>,
        oid: Option<&str>,
        lifetime: Option<u64>,
    ) -> crate::error::Result<HashMap<String, String>> {
        let token =
            self.generate_token_for_action(identity, organization, repo, actions, oid, lifetime)?;
        Ok(HashMap::from([("jwt".to_string(), token)]))
    }

    fn get_authz_header(
        &self,
        identity: &dyn Identity,
        organization: &str,
        repo: &str,
        actions: Option<&HashSet<String>>,
        oid: Option<&str>,
        lifetime: Option<u64>,
    ) -> crate::error::Result<HashMap<String, String>> {
        let token =
            self.generate_token_for_action(identity, organization, repo, actions, oid, lifetime)?;
        Ok(HashMap::from([(
            "Authorization".to_string(),
            format!("Bearer {token}"),
        )]))
    }
}

fn read_key(inline: Option<String>, file: Option<&str>) -> anyhow::Result<Option<String>> {
    match (inline, file) {
        (Some(key), _) => Ok(Some(key)),
        (None, Some(path)) => Ok(Some(std::fs::read_to_string(path)?)),
        (None, None) => Ok(None),
    }
}

/// A grant extracted from a single scope string, in `DefaultIdentity::allow`
/// terms.
#[derive(Debug, PartialEq, Eq)]
pub struct ScopeGrant {
    pub organization: Option<String>,
    pub repo: Option<String>,
    pub oid: Option<String>,
    pub permissions: HashSet<Permission>,
}

/// A parsed scope string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub entity_type: String,
    pub entity_ref: Option<String>,
    pub subscope: Option<String>,
    pub actions: Option<BTreeSet<String>>,
}

impl Scope {
    /// Convert into permission-tree grant arguments. Scopes for entity types
    /// other than `obj` yield nothing.
    #[must_use]
    pub fn into_grant(self) -> Option<ScopeGrant> {
        if self.entity_type != "obj" {
            return None;
        }

        let mut organization = None;
        let mut repo = None;
        let mut oid = None;

        if let Some(entity_ref) = &self.entity_ref {
            let parts: Vec<Option<String>> = entity_ref
                .splitn(3, '/')
                .map(|p| (p != "*").then(|| p.to_string()))
                .collect();
            match parts.len() {
                3 => {
                    organization = parts[0].clone();
                    repo = parts[1].clone();
                    oid = parts[2].clone();
                }
                2 => {
                    organization = parts[0].clone();
                    repo = parts[1].clone();
                }
                1 => {
                    oid = parts[0].clone();
                }
                _ => {}
            }
        }

        let mut permissions = match &self.actions {
            Some(actions) => {
                let mut set = HashSet::new();
                for action in actions {
                    match action.as_str() {
                        "read" => {
                            set.insert(Permission::Read);
                            set.insert(Permission::ReadMeta);
                        }
                        "write" => {
                            set.insert(Permission::Write);
                        }
                        "verify" => {
                            set.insert(Permission::ReadMeta);
                        }
                        _ => {}
                    }
                }
                set
            }
            None => Permission::all(),
        };

        if matches!(self.subscope.as_deref(), Some("metadata" | "meta")) {
            permissions = permissions
                .intersection(&HashSet::from([Permission::ReadMeta]))
                .copied()
                .collect();
        }

        Some(ScopeGrant {
            organization,
            repo,
            oid,
            permissions,
        })
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.is_empty() || parts[0].is_empty() {
            return Err("scope string should have at least one part".to_string());
        }

        let mut scope = Scope {
            entity_type: parts[0].to_string(),
            entity_ref: None,
            subscope: None,
            actions: None,
        };

        if parts.len() > 1 && parts[1] != "*" {
            scope.entity_ref = Some(parts[1].to_string());
        }
        if parts.len() == 3 && parts[2] != "*" {
            scope.actions = Some(parse_actions(parts[2]));
        }
        if parts.len() == 4 {
            if parts[2] != "*" {
                scope.subscope = Some(parts[2].to_string());
            }
            if parts[3] != "*" {
                scope.actions = Some(parse_actions(parts[3]));
            }
        }

        Ok(scope)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entity_ref = self.entity_ref.as_deref().filter(|r| *r != "*");
        let subscope = self.subscope.as_deref().filter(|s| *s != "*");
        let actions = self
            .actions
            .as_ref()
            .filter(|a| !a.is_empty())
            .map(|a| a.iter().cloned().collect::<Vec<_>>().join(","));

        let mut parts: Vec<&str> = vec![&self.entity_type];

        if let Some(entity_ref) = entity_ref {
            parts.push(entity_ref);
        } else if subscope.is_some() || actions.is_some() {
            parts.push("*");
        }

        if let Some(subscope) = subscope {
            parts.push(subscope);
            if actions.is_none() {
                parts.push("*");
            }
        }

        if let Some(actions) = &actions {
            parts.push(actions);
        }

        f.write_str(&parts.join(":"))
    }
}

fn parse_actions(actions: &str) -> BTreeSet<String> {
    if actions.is_empty() {
        return BTreeSet::new();
    }
    actions.split(',').map(str::to_string).collect()
}
