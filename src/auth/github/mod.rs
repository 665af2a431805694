//! GitHub "proxy" authentication.
//!
//! Authenticates a request by using its credential to call the GitHub API on
//! behalf of the caller, then translates GitHub repository permissions into
//! the internal permission model. Two credential flavors are understood:
//!
//! * **User tokens** (Basic auth password): resolved via `GET /user`, then
//!   authorized per repository through the collaborator-permission endpoint.
//! * **App installation tokens** (`ghs_` prefix): the Basic auth username
//!   names the installation (by id, client id, app id or slug), which is
//!   looked up in the organization's installation list.
//!
//! Because every uncached call costs a round-trip to GitHub, the
//! authenticator leans on a layered cache: a token LRU, a weak-value map
//! de-duplicating identities across tokens of the same user, a per-identity
//! TLRU of `(org, repo)` authorizations with permission-dependent TTLs, and
//! an unbounded read-proxy that keeps fresh authorizations observable even
//! when the main cache churns. Concurrent identical calls are coalesced so a
//! burst of parallel requests produces a single upstream call.

pub mod cache;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::identity::{Identity, Permission};
use crate::auth::{AuthRequest, Authenticator, Unauthorized, parse_basic_auth, parse_bearer_auth};

use cache::{LruCache, SingleFlight, TlruCache};

const DEFAULT_API_URL: &str = "https://api.github.com";
const DEFAULT_API_VERSION: &str = "2022-11-28";
const DEFAULT_CONNECT_TIMEOUT: f64 = 5.0;
const DEFAULT_REQUEST_TIMEOUT: f64 = 10.0;
const APP_TOKEN_PREFIX: &str = "ghs_";
const REPOS_PER_PAGE: usize = 100;

/// Floor for read-proxy entries: a freshly written authorization stays
/// observable for at least this long, however short its main-cache TTL.
const PROXY_MIN_TTL: Duration = Duration::from_secs(60);

/// Cache sizing and TTLs.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheOptions {
    /// Max entries in the unique-user map's backing token LRU.
    #[serde(default = "default_cache_size")]
    pub user_max_size: usize,
    /// Max entries in the token -> identity LRU.
    #[serde(default = "default_cache_size")]
    pub token_max_size: usize,
    /// Max `(org, repo)` authorizations kept per identity.
    #[serde(default = "default_cache_size")]
    pub auth_max_size: usize,
    /// Lifetime of write-capable authorizations, seconds.
    #[serde(default = "default_auth_write_ttl")]
    pub auth_write_ttl: f64,
    /// Lifetime of read-only or denied authorizations, seconds. Kept short
    /// so unauthorized callers keep being re-checked without hammering the
    /// GitHub API on every request.
    #[serde(default = "default_auth_other_ttl")]
    pub auth_other_ttl: f64,
}

fn default_cache_size() -> usize {
    32
}

fn default_auth_write_ttl() -> f64 {
    15.0 * 60.0
}

fn default_auth_other_ttl() -> f64 {
    30.0
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            user_max_size: default_cache_size(),
            token_max_size: default_cache_size(),
            auth_max_size: default_cache_size(),
            auth_write_ttl: default_auth_write_ttl(),
            auth_other_ttl: default_auth_other_ttl(),
        }
    }
}

/// Options for building a [`GithubAuthenticator`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GithubOptions {
    /// Base URL for the GitHub API (enterprise servers use
    /// `https://<host>/api/v3`).
    pub api_url: Option<String>,
    /// GitHub API version header; `None` disables the header.
    pub api_version: Option<String>,
    pub connect_timeout: Option<f64>,
    pub request_timeout: Option<f64>,
    /// Optional restriction list: org -> allowed repos (None allows the whole
    /// org). Orgs absent from the map are rejected outright.
    pub restrict_to: Option<HashMap<String, Option<Vec<String>>>>,
    #[serde(default)]
    pub cache: Option<CacheOptions>,
}

/// Key under which identities are de-duplicated.
///
/// User identities compare by `(login, github id)`; installation identities
/// by installation id alone. The two flavors also differ in how they enter
/// the caches, so the distinction is kept explicit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    User { login: String, github_id: String },
    AppInstallation { installation_id: String },
}

#[derive(Debug, Clone, Deserialize)]
struct InstallationData {
    installation_id: String,
    repository_selection: Option<String>,
    /// Value of `permissions.contents` for this installation.
    contents: Option<String>,
}

#[derive(Debug)]
enum IdentityKind {
    User,
    AppInstallation {
        /// Installation payload from authentication, consumed by the first
        /// authorization; later authorizations re-fetch it.
        initial_data: Mutex<Option<InstallationData>>,
    },
}

type AuthKey = (String, Option<String>);

struct AuthCaches {
    main: TlruCache<AuthKey, HashSet<Permission>>,
    proxy: TlruCache<AuthKey, HashSet<Permission>>,
}

/// Identity belonging to a GitHub token, carrying its own expiring
/// authorization cache.
pub struct GithubIdentity {
    login: String,
    github_id: String,
    name: Option<String>,
    email: Option<String>,
    kind: IdentityKind,
    caches: Mutex<AuthCaches>,
    write_ttl: Duration,
    other_ttl: Duration,
}

impl std::fmt::Debug for GithubIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubIdentity")
            .field("login", &self.login)
            .field("id", &self.github_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl GithubIdentity {
    fn new(
        login: String,
        github_id: String,
        name: Option<String>,
        email: Option<String>,
        kind: IdentityKind,
        cache: &CacheOptions,
    ) -> Self {
        Self {
            login,
            github_id,
            name,
            email,
            kind,
            caches: Mutex::new(AuthCaches {
                main: TlruCache::new(cache.auth_max_size),
                proxy: TlruCache::unbounded(),
            }),
            write_ttl: Duration::from_secs_f64(cache.auth_write_ttl),
            other_ttl: Duration::from_secs_f64(cache.auth_other_ttl),
        }
    }

    fn key(&self) -> IdentityKey {
        match &self.kind {
            IdentityKind::User => IdentityKey::User {
                login: self.login.clone(),
                github_id: self.github_id.clone(),
            },
            IdentityKind::AppInstallation { .. } => IdentityKey::AppInstallation {
                installation_id: self.github_id.clone(),
            },
        }
    }

    fn ttl_for(&self, permissions: &HashSet<Permission>) -> Duration {
        if permissions.contains(&Permission::Write) {
            self.write_ttl
        } else {
            self.other_ttl
        }
    }

    /// Record an authorization result. A `repo` of `None` grants org-wide.
    /// Written through to the proxy cache so the result stays observable for
    /// at least [`PROXY_MIN_TTL`] even if the main cache evicts it.
    pub fn authorize(&self, org: &str, repo: Option<&str>, permissions: HashSet<Permission>) {
        let key = (org.to_string(), repo.map(str::to_string));
        let ttl = self.ttl_for(&permissions);
        let mut caches = self.caches.lock().unwrap();
        caches.main.insert(key.clone(), permissions.clone(), ttl);
        caches.proxy.insert(key, permissions, ttl.max(PROXY_MIN_TTL));
    }

    /// Cached permissions for `(org, repo)`, falling back to an org-wide
    /// entry, then to the read-proxy.
    pub fn permissions(&self, org: &str, repo: &str) -> Option<HashSet<Permission>> {
        let repo_key = (org.to_string(), Some(repo.to_string()));
        let org_key = (org.to_string(), None);
        let mut caches = self.caches.lock().unwrap();
        for key in [&repo_key, &org_key] {
            if let Some(perms) = caches.main.get(key) {
                return Some(perms.clone());
            }
        }
        for key in [&repo_key, &org_key] {
            if let Some(perms) = caches.proxy.get(key) {
                return Some(perms.clone());
            }
        }
        None
    }

    /// Like [`Self::permissions`], but proxy hits are promoted into the main
    /// cache. Used for the real per-request authorization check.
    fn permissions_authoritative(&self, org: &str, repo: &str) -> Option<HashSet<Permission>> {
        let repo_key = (org.to_string(), Some(repo.to_string()));
        let org_key = (org.to_string(), None);
        let mut caches = self.caches.lock().unwrap();
        for key in [&repo_key, &org_key] {
            if let Some(perms) = caches.main.get(key) {
                return Some(perms.clone());
            }
        }
        for key in [&repo_key, &org_key] {
            if let Some(perms) = caches.proxy.pop(key) {
                let ttl = self.ttl_for(&perms);
                caches.main.insert(key.clone(), perms.clone(), ttl);
                return Some(perms);
            }
        }
        None
    }

    fn auth_cache_free_capacity(&self) -> usize {
        self.caches.lock().unwrap().main.capacity_remaining()
    }
}

impl Identity for GithubIdentity {
    fn id(&self) -> Option<&str> {
        Some(&self.github_id)
    }

    fn name(&self) -> Option<&str> {
        Some(self.name.as_deref().unwrap_or(&self.login))
    }

    fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    fn is_authorized(
        &self,
        organization: &str,
        repo: &str,
        permission: Permission,
        _oid: Option<&str>,
    ) -> bool {
        self.permissions(organization, repo)
            .is_some_and(|perms| permission.granted_by(&perms))
    }
}

// GitHub API payloads, narrowed to the fields in use.

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
    id: i64,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CollaboratorPermission {
    permission: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Installation {
    id: i64,
    app_id: Option<i64>,
    app_slug: Option<String>,
    client_id: Option<String>,
    repository_selection: Option<String>,
    #[serde(default)]
    permissions: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct InstallationList {
    #[serde(default)]
    installations: Vec<Installation>,
}

#[derive(Debug, Deserialize)]
struct RepositoryOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    owner: RepositoryOwner,
}

#[derive(Debug, Default, Deserialize)]
struct RepositoryList {
    #[serde(default)]
    repositories: Vec<Repository>,
}

struct TokenCacheState {
    tokens: LruCache<String, Arc<GithubIdentity>>,
    /// Weak back-references keyed by identity; an entry lives exactly as long
    /// as some token in `tokens` still holds the identity.
    users: HashMap<IdentityKey, Weak<GithubIdentity>>,
}

struct Inner {
    api_url: String,
    client: reqwest::Client,
    restrictions: Option<HashMap<String, Option<Vec<String>>>>,
    cache_options: CacheOptions,
    token_cache: Mutex<TokenCacheState>,
    token_flight: SingleFlight<String, Arc<GithubIdentity>, Unauthorized>,
    auth_flight: SingleFlight<(String, String, IdentityKey), (), Unauthorized>,
}

/// The GitHub proxy authenticator.
pub struct GithubAuthenticator {
    inner: Arc<Inner>,
}

impl GithubAuthenticator {
    pub fn new(options: GithubOptions) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            "application/vnd.github+json".parse().unwrap(),
        );
        let api_version = match &options.api_version {
            Some(v) => Some(v.clone()),
            None => Some(DEFAULT_API_VERSION.to_string()),
        };
        if let Some(version) = api_version {
            headers.insert("X-GitHub-Api-Version", version.parse()?);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs_f64(
                options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            ))
            .timeout(Duration::from_secs_f64(
                options.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            ))
            .build()?;

        let cache_options = options.cache.unwrap_or_default();

        Ok(Self {
            inner: Arc::new(Inner {
                api_url: options
                    .api_url
                    .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                client,
                restrictions: options.restrict_to,
                token_cache: Mutex::new(TokenCacheState {
                    tokens: LruCache::new(cache_options.token_max_size),
                    users: HashMap::new(),
                }),
                cache_options,
                token_flight: SingleFlight::new(),
                auth_flight: SingleFlight::new(),
            }),
        })
    }

    fn check_restrictions(&self, org: &str, repo: &str) -> Result<(), Unauthorized> {
        let Some(restrictions) = &self.inner.restrictions else {
            return Ok(());
        };
        match restrictions.get(org) {
            Some(None) => Ok(()),
            Some(Some(repos)) if repos.iter().any(|r| r == repo) => Ok(()),
            _ => Err(Unauthorized(format!(
                "Access to {org}/{repo} is not enabled on this server"
            ))),
        }
    }
}

impl Inner {
    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
    ) -> Result<T, Unauthorized> {
        let response = self
            .client
            .get(format!("{}{path}", self.api_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                warn!("GitHub API request to {path} failed: {e}");
                Unauthorized(format!("Couldn't reach the GitHub API: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("GitHub API request to {path} returned {status}");
            return Err(Unauthorized(format!(
                "GitHub API call to {path} failed: {status}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Unauthorized(format!("Invalid GitHub API response from {path}: {e}")))
    }

    /// Resolve a token into an identity, consulting the token LRU, the
    /// unique-user map and a single upstream call per token in flight.
    async fn get_identity(
        self: &Arc<Self>,
        token: &str,
        app_username: Option<&str>,
        org: &str,
    ) -> Result<Arc<GithubIdentity>, Unauthorized> {
        if let Some(identity) = self.token_cache.lock().unwrap().tokens.get(&token.to_string()) {
            return Ok(identity.clone());
        }

        let inner = self.clone();
        let token_owned = token.to_string();
        let app_username = app_username.map(str::to_string);
        let org = org.to_string();
        self.token_flight
            .run(token.to_string(), move || {
                async move {
                    let identity = match &app_username {
                        Some(username) => {
                            inner.fetch_installation_identity(&token_owned, username, &org).await?
                        }
                        None => inner.fetch_user_identity(&token_owned).await?,
                    };

                    // Insert under the one cache lock, reusing an existing
                    // identity object when another token already mapped to
                    // this user. Holding the lock across both structures
                    // keeps two threads from constructing divergent
                    // identities for the same user.
                    let mut cache = inner.token_cache.lock().unwrap();
                    let key = identity.key();
                    let identity = match cache.users.get(&key).and_then(Weak::upgrade) {
                        Some(existing) => existing,
                        None => {
                            let identity = Arc::new(identity);
                            cache.users.insert(key, Arc::downgrade(&identity));
                            identity
                        }
                    };
                    cache.users.retain(|_, weak| weak.strong_count() > 0);
                    cache.tokens.insert(token_owned, identity.clone());
                    Ok(identity)
                }
                .boxed()
            })
            .await
    }

    async fn fetch_user_identity(&self, token: &str) -> Result<GithubIdentity, Unauthorized> {
        debug!("authenticating user against the GitHub API");
        let user: GithubUser = self.api_get("/user", token).await?;
        Ok(GithubIdentity::new(
            user.login,
            user.id.to_string(),
            user.name,
            user.email,
            IdentityKind::User,
            &self.cache_options,
        ))
    }

    async fn fetch_installation(
        &self,
        token: &str,
        username: &str,
        org: &str,
    ) -> Result<InstallationData, Unauthorized> {
        let list: InstallationList = self
            .api_get(&format!("/orgs/{org}/installations"), token)
            .await?;

        let matched = list.installations.into_iter().find(|installation| {
            installation.id.to_string() == username
                || installation.app_id.map(|id| id.to_string()).as_deref() == Some(username)
                || installation.app_slug.as_deref() == Some(username)
                || installation.client_id.as_deref() == Some(username)
        });

        let Some(installation) = matched else {
            return Err(Unauthorized(format!(
                "No app installation matching '{username}' found in {org}"
            )));
        };

        Ok(InstallationData {
            installation_id: installation.id.to_string(),
            repository_selection: installation.repository_selection,
            contents: installation.permissions.get("contents").cloned(),
        })
    }

    async fn fetch_installation_identity(
        &self,
        token: &str,
        username: &str,
        org: &str,
    ) -> Result<GithubIdentity, Unauthorized> {
        debug!("authenticating app installation against the GitHub API");
        let data = self.fetch_installation(token, username, org).await?;
        Ok(GithubIdentity::new(
            username.to_string(),
            data.installation_id.clone(),
            Some(format!("app installation {}", data.installation_id)),
            None,
            IdentityKind::AppInstallation {
                initial_data: Mutex::new(Some(data)),
            },
            &self.cache_options,
        ))
    }

    fn contents_permissions(data: &InstallationData) -> HashSet<Permission> {
        match data.contents.as_deref() {
            Some("write") => Permission::all(),
            Some("read") => HashSet::from([Permission::Read, Permission::ReadMeta]),
            _ => HashSet::new(),
        }
    }

    /// Resolve and cache permissions for `(org, repo)`; one resolution per
    /// `(org, repo, identity)` at a time across the process.
    async fn authorize(
        self: &Arc<Self>,
        identity: &Arc<GithubIdentity>,
        token: &str,
        org: &str,
        repo: &str,
    ) -> Result<(), Unauthorized> {
        if let Some(permissions) = identity.permissions_authoritative(org, repo) {
            debug!(
                "{} is already temporarily authorized for {org}/{repo}: {permissions:?}",
                identity.login
            );
            return Ok(());
        }

        let key = (org.to_string(), repo.to_string(), identity.key());
        let inner = self.clone();
        let identity = identity.clone();
        let token = token.to_string();
        let org = org.to_string();
        let repo = repo.to_string();
        self.auth_flight
            .run(key, move || {
                async move {
                    // A parallel caller may have resolved this while we
                    // queued for the flight.
                    if identity.permissions_authoritative(&org, &repo).is_some() {
                        return Ok(());
                    }
                    match &identity.kind {
                        IdentityKind::User => {
                            inner.authorize_user(&identity, &token, &org, &repo).await
                        }
                        IdentityKind::AppInstallation { initial_data } => {
                            let data = initial_data.lock().unwrap().take();
                            inner
                                .authorize_installation(&identity, data, &token, &org, &repo)
                                .await
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    async fn authorize_user(
        &self,
        identity: &Arc<GithubIdentity>,
        token: &str,
        org: &str,
        repo: &str,
    ) -> Result<(), Unauthorized> {
        debug!("checking {}'s permissions for {org}/{repo}", identity.login);
        let response: CollaboratorPermission = self
            .api_get(
                &format!(
                    "/repos/{org}/{repo}/collaborators/{}/permission",
                    identity.login
                ),
                token,
            )
            .await?;

        let permissions = match response.permission.as_deref() {
            Some("admin" | "write") => Permission::all(),
            Some("read") => HashSet::from([Permission::Read, Permission::ReadMeta]),
            _ => HashSet::new(),
        };
        debug!(
            "authorizing {} for {org}/{repo}: {permissions:?}",
            identity.login
        );
        identity.authorize(org, Some(repo), permissions);
        Ok(())
    }

    async fn authorize_installation(
        &self,
        identity: &Arc<GithubIdentity>,
        initial_data: Option<InstallationData>,
        token: &str,
        org: &str,
        repo: &str,
    ) -> Result<(), Unauthorized> {
        let data = match initial_data {
            Some(data) => data,
            // Initial payload already consumed; this is a refresh after the
            // cached authorization expired.
            None => self.fetch_installation(token, &identity.login, org).await?,
        };
        let permissions = Self::contents_permissions(&data);

        if data.repository_selection.as_deref() == Some("all") {
            debug!(
                "installation {} covers all repositories of {org}: {permissions:?}",
                data.installation_id
            );
            identity.authorize(org, None, permissions);
            return Ok(());
        }

        // Enumerate the repositories this installation was granted and pick
        // out the target; other repos seen along the way are cached while
        // free capacity lasts.
        let mut free = identity.auth_cache_free_capacity().saturating_sub(1);
        let mut found = false;
        let mut page = 1usize;
        loop {
            let list: RepositoryList = self
                .api_get(
                    &format!("/installation/repositories?per_page={REPOS_PER_PAGE}&page={page}"),
                    token,
                )
                .await?;
            let fetched = list.repositories.len();

            for repository in list.repositories {
                if repository.owner.login == org && repository.name == repo {
                    identity.authorize(org, Some(repo), permissions.clone());
                    found = true;
                } else if free > 0 {
                    identity.authorize(
                        &repository.owner.login,
                        Some(&repository.name),
                        permissions.clone(),
                    );
                    free -= 1;
                }
            }

            if fetched < REPOS_PER_PAGE || (found && free == 0) {
                break;
            }
            page += 1;
        }

        if !found {
            // Cache the denial too; the short TTL throttles repeat lookups.
            identity.authorize(org, Some(repo), HashSet::new());
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for GithubAuthenticator {
    async fn authenticate(
        &self,
        request: &AuthRequest<'_>,
    ) -> Result<Option<Arc<dyn Identity>>, Unauthorized> {
        let Some(header) = request.authorization else {
            return Err(Unauthorized("Authorization required".to_string()));
        };

        let (username, token) = match parse_basic_auth(header) {
            Some((username, password)) => (Some(username), password),
            None => match parse_bearer_auth(header) {
                Some(token) => (None, token.to_string()),
                None => return Err(Unauthorized("Authorization token required".to_string())),
            },
        };
        if token.is_empty() {
            warn!(
                "request to {}/{} has no auth token",
                request.organization, request.repo
            );
            return Err(Unauthorized("Authorization token required".to_string()));
        }

        self.check_restrictions(request.organization, request.repo)?;

        let app_username = (token.starts_with(APP_TOKEN_PREFIX))
            .then_some(username.as_deref())
            .flatten();

        let identity = self
            .inner
            .get_identity(&token, app_username, request.organization)
            .await?;
        debug!("authenticated the user as {identity:?}");

        self.inner
            .authorize(&identity, &token, request.organization, request.repo)
            .await?;

        Ok(Some(identity))
    }
}
