//! End-to-end tests of the batch API and the streaming object endpoints,
//! driven through the assembled router.

use std::path::Path;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use stevedore::config::{Config, build_state};
use stevedore::server::create_router;

const LFS_MIME: &str = "application/vnd.git-lfs+json";
const JWT_SECRET: &str = "some-random-secret";

async fn make_router(storage_dir: &Path, providers: &str, pre_auth: bool, legacy: bool) -> Router {
    let preauth_section = if pre_auth {
        format!(
            "[auth.pre_auth]\nfactory = \"jwt\"\noptions = {{ private_key = \"{JWT_SECRET}\" }}\n"
        )
    } else {
        String::new()
    };

    let toml_str = format!(
        r#"
[server]
legacy_endpoints = {legacy}

[auth]
providers = {providers}
{preauth_section}

[transfer.basic]
factory = "basic-streaming"
[transfer.basic.options]
path = "{path}"
"#,
        path = storage_dir.display(),
    );

    let config: Config = toml::from_str(&toml_str).expect("parse test config");
    let state = build_state(&config).await.expect("build state");
    create_router(state)
}

async fn read_write_router(storage_dir: &Path) -> Router {
    make_router(storage_dir, "[\"allow-anon-read-write\"]", true, false).await
}

fn jwt_providers() -> String {
    format!("[{{ factory = \"jwt\", options = {{ private_key = \"{JWT_SECRET}\" }} }}]")
}

fn put_object(storage_dir: &Path, oid: &str, data: &[u8]) {
    let path = storage_dir.join("myorg/myrepo").join(oid);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

async fn request_json(
    router: &Router,
    method: &str,
    uri: &str,
    payload: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match payload {
        Some(payload) => {
            builder = builder.header(header::CONTENT_TYPE, LFS_MIME);
            Body::from(payload.to_string())
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn post_batch(router: &Router, payload: Value) -> (StatusCode, Value) {
    request_json(
        router,
        "POST",
        "/myorg/myrepo.git/info/lfs/objects/batch",
        Some(payload),
    )
    .await
}

#[tokio::test]
async fn test_upload_happy_path_local_storage() {
    let dir = TempDir::new().unwrap();
    let router = read_write_router(dir.path()).await;

    let (status, body) = post_batch(
        &router,
        json!({"operation": "upload", "objects": [{"oid": "12345678", "size": 8}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transfer"], "basic");

    let object = &body["objects"][0];
    assert_eq!(object["oid"], "12345678");
    assert_eq!(object["authenticated"], true);

    let upload_href = object["actions"]["upload"]["href"].as_str().unwrap();
    assert!(upload_href.ends_with("/objects/storage/12345678"));
    assert!(
        object["actions"]["upload"]["header"]["Authorization"]
            .as_str()
            .unwrap()
            .starts_with("Bearer ")
    );

    let verify_href = object["actions"]["verify"]["href"].as_str().unwrap();
    assert!(verify_href.ends_with("/objects/storage/verify"));
}

#[tokio::test]
async fn test_upload_existing_object_has_no_actions() {
    let dir = TempDir::new().unwrap();
    put_object(dir.path(), "12345678", b"12345678");
    let router = read_write_router(dir.path()).await;

    let (status, body) = post_batch(
        &router,
        json!({"operation": "upload", "objects": [{"oid": "12345678", "size": 8}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let object = &body["objects"][0];
    assert!(object.get("actions").is_none());
    assert!(object.get("error").is_none());
}

#[tokio::test]
async fn test_download_existing_object() {
    let dir = TempDir::new().unwrap();
    put_object(dir.path(), "12345678", b"12345678");
    let router = read_write_router(dir.path()).await;

    let (status, body) = post_batch(
        &router,
        json!({"operation": "download", "objects": [{"oid": "12345678", "size": 8}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let object = &body["objects"][0];
    assert!(object["actions"]["download"]["href"].as_str().is_some());
}

#[tokio::test]
async fn test_download_mixed_present_and_missing() {
    let dir = TempDir::new().unwrap();
    put_object(dir.path(), "12345678", b"12345678");
    let router = read_write_router(dir.path()).await;

    let (status, body) = post_batch(
        &router,
        json!({"operation": "download", "objects": [
            {"oid": "12345678", "size": 8},
            {"oid": "12345679", "size": 5555}
        ]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["objects"][0]["actions"]["download"].is_object());
    assert_eq!(body["objects"][1]["error"]["code"], 404);
}

#[tokio::test]
async fn test_download_all_missing_is_404() {
    let dir = TempDir::new().unwrap();
    let router = read_write_router(dir.path()).await;

    let (status, body) = post_batch(
        &router,
        json!({"operation": "download", "objects": [
            {"oid": "12345678", "size": 8},
            {"oid": "12345679", "size": 5555}
        ]}),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().is_some());
}

#[tokio::test]
async fn test_download_mismatch_and_missing_is_422() {
    let dir = TempDir::new().unwrap();
    put_object(dir.path(), "12345678", b"123");
    let router = read_write_router(dir.path()).await;

    let (status, _) = post_batch(
        &router,
        json!({"operation": "download", "objects": [
            {"oid": "12345678", "size": 8},
            {"oid": "12345679", "size": 5555}
        ]}),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_upload_forbidden_for_read_only_identity() {
    let dir = TempDir::new().unwrap();
    let router = make_router(dir.path(), "[\"allow-anon-read-only\"]", true, false).await;

    let (status, body) = post_batch(
        &router,
        json!({"operation": "upload", "objects": [{"oid": "12345678", "size": 8}]}),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["message"].as_str().unwrap().contains("not authorized"));

    // Downloads remain fine.
    put_object(dir.path(), "12345678", b"12345678");
    let (status, _) = post_batch(
        &router,
        json!({"operation": "download", "objects": [{"oid": "12345678", "size": 8}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unmatched_transfer_adapter_is_422() {
    let dir = TempDir::new().unwrap();
    let router = read_write_router(dir.path()).await;

    let (status, _) = post_batch(
        &router,
        json!({
            "operation": "download",
            "transfers": ["tus"],
            "objects": [{"oid": "12345678", "size": 8}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_invalid_payloads_are_422() {
    let dir = TempDir::new().unwrap();
    let router = read_write_router(dir.path()).await;

    for payload in [
        json!({"operation": "download", "objects": [], }),
        json!({"operation": "steal", "objects": [{"oid": "12345678", "size": 8}]}),
        json!({"operation": "download", "objects": [{"oid": "12345678", "size": 8}], "shenanigans": 1}),
        json!({"operation": "download", "objects": [{"size": 8}]}),
    ] {
        let (status, _) = post_batch(&router, payload).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}

#[tokio::test]
async fn test_response_media_type() {
    let dir = TempDir::new().unwrap();
    let router = read_write_router(dir.path()).await;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/myorg/myrepo.git/info/lfs/objects/batch")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"operation": "upload", "objects": [{"oid": "12345678", "size": 8}]})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        LFS_MIME
    );
}

#[tokio::test]
async fn test_verify_endpoint() {
    let dir = TempDir::new().unwrap();
    put_object(dir.path(), "12345678", b"12345678");
    let router = read_write_router(dir.path()).await;

    let uri = "/myorg/myrepo.git/info/lfs/objects/storage/verify";
    let (status, _) = request_json(
        &router,
        "POST",
        uri,
        Some(json!({"oid": "12345678", "size": 8})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request_json(
        &router,
        "POST",
        uri,
        Some(json!({"oid": "12345678", "size": 9})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = request_json(
        &router,
        "POST",
        uri,
        Some(json!({"oid": "99999999", "size": 8})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_streaming_put_then_get_roundtrip() {
    let dir = TempDir::new().unwrap();
    let router = read_write_router(dir.path()).await;
    let uri = "/myorg/myrepo.git/info/lfs/objects/storage/cafebabe";

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(uri)
                .body(Body::from("large file contents"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("{uri}?filename=model.bin"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/octet-stream"
    );
    assert_eq!(
        response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=\"model.bin\""
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"large file contents");
}

#[tokio::test]
async fn test_streaming_get_missing_is_404() {
    let dir = TempDir::new().unwrap();
    let router = read_write_router(dir.path()).await;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/myorg/myrepo.git/info/lfs/objects/storage/cafebabe")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_legacy_endpoints_opt_in() {
    let dir = TempDir::new().unwrap();
    put_object(dir.path(), "12345678", b"12345678");

    let legacy_router = make_router(dir.path(), "[\"allow-anon-read-write\"]", true, true).await;
    let (status, _) = request_json(
        &legacy_router,
        "POST",
        "/myorg/myrepo/objects/batch",
        Some(json!({"operation": "download", "objects": [{"oid": "12345678", "size": 8}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let plain_router = read_write_router(dir.path()).await;
    let (status, _) = request_json(
        &plain_router,
        "POST",
        "/myorg/myrepo/objects/batch",
        Some(json!({"operation": "download", "objects": [{"oid": "12345678", "size": 8}]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_jwt_only_deployment_requires_token() {
    let dir = TempDir::new().unwrap();
    put_object(dir.path(), "12345678", b"12345678");
    let router = make_router(dir.path(), &jwt_providers(), true, false).await;

    // The jwt authenticator and the pre_auth handler share the secret, so a
    // minted action token is also a valid request credential.
    let payload = json!({"operation": "download", "objects": [{"oid": "12345678", "size": 8}]});

    let (status, body) = post_batch(&router, payload.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["message"].as_str().is_some());

    use stevedore::auth::PreAuthorizedActionAuthenticator;
    use stevedore::auth::identity::DefaultIdentity;
    use stevedore::auth::jwt::{JwtAuthenticator, JwtOptions};

    let minter = JwtAuthenticator::new(JwtOptions {
        private_key: Some(JWT_SECRET.to_string()),
        ..Default::default()
    })
    .unwrap();
    let identity = DefaultIdentity::new(None, Some("tester".into()), None);
    let header = minter
        .get_authz_header(
            &identity,
            "myorg",
            "myrepo",
            Some(&std::collections::HashSet::from(["read".to_string()])),
            None,
            Some(120),
        )
        .unwrap();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/myorg/myrepo.git/info/lfs/objects/batch")
                .header(header::CONTENT_TYPE, LFS_MIME)
                .header(header::AUTHORIZATION, header.get("Authorization").unwrap())
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unauthorized_carries_lfs_error_body() {
    let dir = TempDir::new().unwrap();
    let router = make_router(dir.path(), &jwt_providers(), false, false).await;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/myorg/myrepo.git/info/lfs/objects/batch")
                .header(header::CONTENT_TYPE, LFS_MIME)
                .body(Body::from(
                    json!({"operation": "download", "objects": [{"oid": "12345678", "size": 8}]})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        LFS_MIME
    );
    assert!(response.headers().get("WWW-Authenticate").is_some());
}
