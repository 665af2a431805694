use std::sync::Arc;

use axum::http::{HeaderMap, header};
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::Authentication;
use crate::storage::{StreamingStorage, VerifiableStorage};
use crate::transfer::TransferRegistry;

use super::{batch, objects};

pub struct AppState {
    pub auth: Arc<Authentication>,
    pub transfers: TransferRegistry,
    /// Storage behind the shared verify endpoint (the default adapter's).
    pub verify_storage: Option<Arc<dyn VerifiableStorage>>,
    /// Set when some adapter streams objects through this server.
    pub streaming_storage: Option<Arc<dyn StreamingStorage>>,
    /// Public base URL for external access (e.g. "https://lfs.example.com").
    /// Used for generating action URLs; when unset, URLs are derived from
    /// request headers.
    pub public_base_url: Option<String>,
    /// Also serve the endpoints under the pre-`.git/info/lfs` paths.
    pub legacy_endpoints: bool,
}

impl AppState {
    #[must_use]
    pub fn new(
        auth: Arc<Authentication>,
        transfers: TransferRegistry,
        public_base_url: Option<String>,
        legacy_endpoints: bool,
    ) -> Self {
        let verify_storage = transfers
            .default_adapter()
            .map(|adapter| adapter.verifiable_storage());
        let streaming_storage = transfers.streaming_storage();
        Self {
            auth,
            transfers,
            verify_storage,
            streaming_storage,
            public_base_url,
            legacy_endpoints,
        }
    }

    /// Root URL actions should point at: the configured public base URL, or
    /// one reconstructed from the request's Host headers.
    #[must_use]
    pub fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(base) = &self.public_base_url {
            return base.trim_end_matches('/').to_string();
        }

        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        format!("{scheme}://{host}")
    }
}

async fn health() -> &'static str {
    "OK"
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/health", get(health));

    // Canonical Git LFS discovery path: the repo segment arrives with its
    // ".git" suffix, which handlers strip.
    let mut prefixes = vec!["/{organization}/{repo}/info/lfs"];
    if state.legacy_endpoints {
        prefixes.push("/{organization}/{repo}");
    }

    for prefix in prefixes {
        router = router.route(
            &format!("{prefix}/objects/batch"),
            post(batch::batch_handler),
        );
        if state.verify_storage.is_some() {
            router = router.route(
                &format!("{prefix}/objects/storage/verify"),
                post(objects::verify_handler),
            );
        }
        if state.streaming_storage.is_some() {
            router = router.route(
                &format!("{prefix}/objects/storage/{{oid}}"),
                put(objects::put_handler).get(objects::get_handler),
            );
        }
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[must_use]
pub fn strip_git_suffix(name: &str) -> &str {
    name.strip_suffix(".git").unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_git_suffix() {
        assert_eq!(strip_git_suffix("myrepo.git"), "myrepo");
        assert_eq!(strip_git_suffix("myrepo"), "myrepo");
        assert_eq!(strip_git_suffix("my.git.repo"), "my.git.repo");
    }

    #[test]
    fn test_base_url_from_headers() {
        let state = AppState::new(
            Arc::new(Authentication::new(Vec::new())),
            TransferRegistry::new(),
            None,
            false,
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "lfs.example.com".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(state.base_url(&headers), "https://lfs.example.com");

        assert_eq!(state.base_url(&HeaderMap::new()), "http://localhost");
    }

    #[test]
    fn test_base_url_prefers_configured() {
        let state = AppState::new(
            Arc::new(Authentication::new(Vec::new())),
            TransferRegistry::new(),
            Some("https://public.example.com/".to_string()),
            false,
        );
        assert_eq!(
            state.base_url(&HeaderMap::new()),
            "https://public.example.com"
        );
    }
}
