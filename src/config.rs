//! Server configuration, loadable from TOML with CLI and environment
//! overrides, plus the factories that turn configuration specs into live
//! authenticators, storage backends and transfer adapters.
//!
//! Priority: CLI args > environment (`STEVEDORE_*`) > config file > defaults.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::auth::anon;
use crate::auth::github::{GithubAuthenticator, GithubOptions};
use crate::auth::jwt::{JwtAuthenticator, JwtOptions};
use crate::auth::{Authentication, Authenticator};
use crate::server::AppState;
use crate::storage::azure::{AzureBlobsStorage, AzureOptions};
use crate::storage::gcs::{GcsOptions, GoogleCloudStorage};
use crate::storage::local::LocalStorage;
use crate::storage::s3::{S3Options, S3Storage};
use crate::storage::{ExternalStorage, MultipartStorage};
use crate::transfer::external::BasicExternalAdapter;
use crate::transfer::multipart::{DEFAULT_ACTION_LIFETIME, DEFAULT_PART_SIZE, MultipartAdapter};
use crate::transfer::streaming::BasicStreamingAdapter;
use crate::transfer::{PreauthHelper, TransferAdapter, TransferRegistry};

/// Prefix for environment-variable overrides.
pub const ENV_PREFIX: &str = "STEVEDORE_";

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_action_lifetime() -> u64 {
    900
}

fn default_local_path() -> String {
    "lfs-storage".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL for external access (e.g. "https://lfs.example.com").
    /// Used for generating action URLs. If not set, URLs are derived from
    /// request headers.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Also serve the endpoints under the pre-`.git/info/lfs` paths.
    #[serde(default)]
    pub legacy_endpoints: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: None,
            legacy_endpoints: false,
        }
    }
}

/// An authenticator reference: either a bare factory name, or a factory with
/// options.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderSpec {
    Name(String),
    Factory {
        factory: String,
        #[serde(default)]
        options: Option<toml::Value>,
    },
}

impl ProviderSpec {
    fn factory(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Factory { factory, .. } => factory,
        }
    }

    fn options(&self) -> Option<&toml::Value> {
        match self {
            Self::Name(_) => None,
            Self::Factory { options, .. } => options.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Ordered authenticator chain. Defaults to anonymous read-only access.
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
    /// Authenticator minting pre-authorized action credentials; consulted
    /// before the providers above.
    #[serde(default)]
    pub pre_auth: Option<ProviderSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    pub factory: String,
    #[serde(default)]
    pub options: Option<toml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Transfer adapters by key. When empty, a `basic` streaming adapter
    /// over local storage is registered.
    #[serde(default)]
    pub transfer: BTreeMap<String, TransferConfig>,
}

/// CLI overrides applied on top of file and environment configuration.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub public_base_url: Option<String>,
}

impl Config {
    /// Default config file search paths.
    const SEARCH_PATHS: &'static [&'static str] =
        &["./stevedore.toml", "/etc/stevedore/stevedore.toml"];

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    #[must_use]
    pub fn load_from_search_paths() -> Option<Self> {
        for path_str in Self::SEARCH_PATHS {
            let path = Path::new(path_str);
            if path.exists() {
                if let Ok(config) = Self::load(path) {
                    return Some(config);
                }
            }
        }
        None
    }

    pub fn load_with_overrides(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::load(path)?
        } else {
            Self::load_from_search_paths().unwrap_or_default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());

        if let Some(host) = overrides.host {
            config.server.host = host;
        }
        if let Some(port) = overrides.port {
            config.server.port = port;
        }
        if overrides.public_base_url.is_some() {
            config.server.public_base_url = overrides.public_base_url;
        }

        Ok(config)
    }

    /// Merge `STEVEDORE_*` environment variables over the file values.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = var("PUBLIC_BASE_URL") {
            self.server.public_base_url = Some(url);
        }
        if let Some(flag) = var("LEGACY_ENDPOINTS") {
            self.server.legacy_endpoints = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }
}

fn typed_options<T: DeserializeOwned + Default>(options: Option<&toml::Value>) -> anyhow::Result<T> {
    match options {
        Some(value) => Ok(value.clone().try_into()?),
        None => Ok(T::default()),
    }
}

fn required_options<T: DeserializeOwned>(
    options: Option<&toml::Value>,
    what: &str,
) -> anyhow::Result<T> {
    match options {
        Some(value) => Ok(value.clone().try_into()?),
        None => bail!("{what} requires options"),
    }
}

fn build_authenticator(spec: &ProviderSpec) -> anyhow::Result<Arc<dyn Authenticator>> {
    match spec.factory() {
        "allow-anon-read-only" => Ok(Arc::new(anon::ReadOnly)),
        "allow-anon-read-write" => Ok(Arc::new(anon::ReadWrite)),
        "jwt" => {
            let options: JwtOptions = typed_options(spec.options())?;
            Ok(Arc::new(JwtAuthenticator::new(options)?))
        }
        "github" => {
            let options: GithubOptions = typed_options(spec.options())?;
            Ok(Arc::new(GithubAuthenticator::new(options)?))
        }
        other => bail!("unknown authenticator factory: {other}"),
    }
}

fn build_authentication(config: &AuthConfig) -> anyhow::Result<Arc<Authentication>> {
    let specs = if config.providers.is_empty() {
        vec![ProviderSpec::Name("allow-anon-read-only".to_string())]
    } else {
        config.providers.clone()
    };

    let authenticators = specs
        .iter()
        .map(build_authenticator)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut authentication = Authentication::new(authenticators);

    if let Some(spec) = &config.pre_auth {
        if spec.factory() != "jwt" {
            bail!(
                "unknown pre-authorization factory: {} (only jwt can mint action tokens)",
                spec.factory()
            );
        }
        let options: JwtOptions = typed_options(spec.options())?;
        authentication = authentication.with_preauth(Arc::new(JwtAuthenticator::new(options)?));
    }

    Ok(Arc::new(authentication))
}

#[derive(Debug, Deserialize)]
struct StreamingAdapterOptions {
    #[serde(default = "default_local_path")]
    path: String,
    #[serde(default = "default_action_lifetime")]
    action_lifetime: u64,
}

impl Default for StreamingAdapterOptions {
    fn default() -> Self {
        Self {
            path: default_local_path(),
            action_lifetime: default_action_lifetime(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExternalAdapterOptions {
    storage: String,
    #[serde(default = "default_action_lifetime")]
    action_lifetime: u64,
    #[serde(default)]
    storage_options: Option<toml::Value>,
}

fn default_multipart_lifetime() -> u64 {
    DEFAULT_ACTION_LIFETIME
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

#[derive(Debug, Deserialize)]
struct MultipartAdapterOptions {
    storage: String,
    #[serde(default = "default_multipart_lifetime")]
    action_lifetime: u64,
    #[serde(default = "default_part_size")]
    max_part_size: u64,
    #[serde(default)]
    storage_options: Option<toml::Value>,
}

async fn build_external_storage(
    name: &str,
    options: Option<&toml::Value>,
) -> anyhow::Result<Arc<dyn ExternalStorage>> {
    match name {
        "s3" | "aws-s3" => {
            let options: S3Options = required_options(options, "S3 storage")?;
            Ok(Arc::new(S3Storage::new(options).await))
        }
        "azure" => {
            let options: AzureOptions = required_options(options, "Azure storage")?;
            Ok(Arc::new(AzureBlobsStorage::new(options)?))
        }
        "gcs" | "google-cloud" => {
            let options: GcsOptions = required_options(options, "Google Cloud storage")?;
            Ok(Arc::new(GoogleCloudStorage::new(options).await?))
        }
        other => bail!("unknown external storage backend: {other}"),
    }
}

async fn build_multipart_storage(
    name: &str,
    options: Option<&toml::Value>,
) -> anyhow::Result<Arc<dyn MultipartStorage>> {
    match name {
        "azure" => {
            let options: AzureOptions = required_options(options, "Azure storage")?;
            Ok(Arc::new(AzureBlobsStorage::new(options)?))
        }
        other => bail!("storage backend {other} does not support multipart uploads"),
    }
}

async fn build_adapter(
    config: &TransferConfig,
    auth: &Arc<Authentication>,
) -> anyhow::Result<Arc<dyn TransferAdapter>> {
    let preauth = PreauthHelper::new(auth.clone());
    match config.factory.as_str() {
        "basic-streaming" => {
            let options: StreamingAdapterOptions = typed_options(config.options.as_ref())?;
            Ok(Arc::new(BasicStreamingAdapter::new(
                Arc::new(LocalStorage::new(options.path)),
                options.action_lifetime,
                preauth,
            )))
        }
        "basic-external" => {
            let options: ExternalAdapterOptions =
                required_options(config.options.as_ref(), "basic-external adapter")?;
            let storage =
                build_external_storage(&options.storage, options.storage_options.as_ref()).await?;
            Ok(Arc::new(BasicExternalAdapter::new(
                storage,
                options.action_lifetime,
                preauth,
            )))
        }
        "multipart" => {
            let options: MultipartAdapterOptions =
                required_options(config.options.as_ref(), "multipart adapter")?;
            let storage =
                build_multipart_storage(&options.storage, options.storage_options.as_ref()).await?;
            Ok(Arc::new(MultipartAdapter::new(
                storage,
                options.action_lifetime,
                options.max_part_size,
                preauth,
            )))
        }
        other => bail!("unknown transfer adapter factory: {other}"),
    }
}

/// Build the full application state from configuration.
pub async fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let auth = build_authentication(&config.auth)?;

    let transfer_configs = if config.transfer.is_empty() {
        BTreeMap::from([(
            "basic".to_string(),
            TransferConfig {
                factory: "basic-streaming".to_string(),
                options: None,
            },
        )])
    } else {
        config.transfer.clone()
    };

    let mut registry = TransferRegistry::new();
    for (key, transfer_config) in &transfer_configs {
        let adapter = build_adapter(transfer_config, &auth)
            .await
            .with_context(|| format!("building transfer adapter '{key}'"))?;
        registry.register(key.clone(), adapter);
    }

    Ok(Arc::new(AppState::new(
        auth,
        registry,
        config.server.public_base_url.clone(),
        config.server.legacy_endpoints,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(!config.server.legacy_endpoints);
        assert!(config.transfer.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9090
            public_base_url = "https://lfs.example.com"
            legacy_endpoints = true

            [auth]
            providers = [
                "allow-anon-read-only",
                { factory = "github", options = { api_url = "https://github.example.com/api/v3" } },
            ]

            [auth.pre_auth]
            factory = "jwt"
            [auth.pre_auth.options]
            private_key = "secret"

            [transfer.basic]
            factory = "basic-streaming"
            [transfer.basic.options]
            path = "/var/lib/stevedore"
            action_lifetime = 1800
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9090);
        assert!(config.server.legacy_endpoints);
        assert_eq!(config.auth.providers.len(), 2);
        assert_eq!(config.auth.providers[1].factory(), "github");
        assert_eq!(
            config.auth.pre_auth.as_ref().unwrap().factory(),
            "jwt"
        );
        assert_eq!(config.transfer["basic"].factory, "basic-streaming");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let env = |name: &str| match name {
            "STEVEDORE_HOST" => Some("0.0.0.0".to_string()),
            "STEVEDORE_PORT" => Some("7070".to_string()),
            "STEVEDORE_LEGACY_ENDPOINTS" => Some("true".to_string()),
            _ => None,
        };
        config.apply_env_overrides(env);

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7070);
        assert!(config.server.legacy_endpoints);
        assert!(config.server.public_base_url.is_none());
    }

    #[tokio::test]
    async fn test_build_state_with_defaults() {
        let state = build_state(&Config::default()).await.unwrap();
        assert!(state.verify_storage.is_some());
        assert!(state.streaming_storage.is_some());
        // Anonymous read-only access is the fallback authenticator.
        let request = crate::auth::AuthRequest {
            organization: "org",
            repo: "repo",
            authorization: None,
            jwt_param: None,
        };
        let identity = state.auth.authenticate(&request).await.unwrap();
        assert_eq!(identity.name(), Some("anonymous"));
    }

    #[tokio::test]
    async fn test_build_state_rejects_unknown_factories() {
        let config: Config = toml::from_str(
            r#"
            [transfer.basic]
            factory = "carrier-pigeon"
            "#,
        )
        .unwrap();
        assert!(build_state(&config).await.is_err());

        let config: Config = toml::from_str(
            r#"
            [auth]
            providers = ["telepathy"]
            "#,
        )
        .unwrap();
        assert!(build_state(&config).await.is_err());
    }
}
