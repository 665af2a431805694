use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use serde_json::Value;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::warn;

use crate::auth::identity::Permission;
use crate::error::{GIT_LFS_MIME_TYPE, LfsError};
use crate::server::dto::VerifyRequest;
use crate::server::router::{AppState, strip_git_suffix};
use crate::storage::{StorageError, StreamingStorage, is_valid_oid};
use crate::util::safe_filename;

use super::batch::{auth_request, check_authorization, validate_repo_path};

fn storage_fault(context: &str, e: &StorageError) -> LfsError {
    warn!("{context}: {e}");
    LfsError::Internal(format!("{context}: {e}"))
}

fn streaming_storage(state: &AppState) -> Result<&Arc<dyn StreamingStorage>, LfsError> {
    state
        .streaming_storage
        .as_ref()
        .ok_or_else(|| LfsError::Internal("no streaming storage is configured".to_string()))
}

/// Shared verify action: `POST .../objects/storage/verify` with
/// `{oid, size}`; 200 when the stored object matches, 422 otherwise.
pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Path((organization, repo)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, LfsError> {
    let repo = strip_git_suffix(&repo).to_string();
    validate_repo_path(&organization, &repo)?;

    let identity = state
        .auth
        .require_identity(&auth_request(&organization, &repo, &headers, &query))
        .await?;

    let request: VerifyRequest = serde_json::from_value(payload)
        .map_err(|e| LfsError::InvalidPayload(format!("Invalid verify request: {e}")))?;

    check_authorization(
        &identity,
        &organization,
        &repo,
        Permission::ReadMeta,
        Some(&request.oid),
    )?;

    let storage = state
        .verify_storage
        .as_ref()
        .ok_or_else(|| LfsError::Internal("no verifiable storage is configured".to_string()))?;

    let prefix = format!("{organization}/{repo}");
    if !storage
        .verify_object(&prefix, &request.oid, request.size)
        .await
    {
        return Err(LfsError::InvalidPayload(
            "Object does not exist or size does not match".to_string(),
        ));
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, GIT_LFS_MIME_TYPE)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// `PUT .../objects/storage/{oid}`: stream the request body into storage.
pub async fn put_handler(
    State(state): State<Arc<AppState>>,
    Path((organization, repo, oid)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, LfsError> {
    let repo = strip_git_suffix(&repo).to_string();
    validate_repo_path(&organization, &repo)?;

    let identity = state
        .auth
        .require_identity(&auth_request(&organization, &repo, &headers, &query))
        .await?;
    check_authorization(&identity, &organization, &repo, Permission::Write, Some(&oid))?;

    if !is_valid_oid(&oid) {
        return Err(LfsError::InvalidPayload("Invalid object ID".to_string()));
    }

    let storage = streaming_storage(&state)?;
    let prefix = format!("{organization}/{repo}");

    let stream = body
        .into_data_stream()
        .map_err(|e| std::io::Error::other(e.to_string()));
    let mut reader = StreamReader::new(stream);

    storage
        .put(&prefix, &oid, &mut reader)
        .await
        .map_err(|e| storage_fault("storage error during upload", &e))?;

    Ok(StatusCode::OK.into_response())
}

/// `GET .../objects/storage/{oid}`: stream an object out of storage.
pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Path((organization, repo, oid)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, LfsError> {
    let repo = strip_git_suffix(&repo).to_string();
    validate_repo_path(&organization, &repo)?;

    let identity = state
        .auth
        .require_identity(&auth_request(&organization, &repo, &headers, &query))
        .await?;
    check_authorization(&identity, &organization, &repo, Permission::Read, Some(&oid))?;

    if !is_valid_oid(&oid) {
        return Err(LfsError::InvalidPayload("Invalid object ID".to_string()));
    }

    let storage = streaming_storage(&state)?;
    let prefix = format!("{organization}/{repo}");

    let size = match storage.get_size(&prefix, &oid).await {
        Ok(size) => size,
        Err(StorageError::NotFound(_)) => {
            return Err(LfsError::NotFound("The object was not found".to_string()));
        }
        Err(e) => return Err(storage_fault("storage error during download", &e)),
    };

    let reader = storage
        .get(&prefix, &oid)
        .await
        .map_err(|e| storage_fault("storage error during download", &e))?;

    let filename = query
        .get("filename")
        .map(|f| safe_filename(f))
        .filter(|f| !f.is_empty());
    let disposition = query.get("disposition");
    let content_disposition = match (filename, disposition) {
        (Some(filename), _) => Some(format!("attachment; filename=\"{filename}\"")),
        (None, Some(disposition)) => Some(disposition.clone()),
        (None, None) => None,
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, storage.get_mime_type(&prefix, &oid))
        .header(header::CONTENT_LENGTH, size)
        .header("X-Content-Type-Options", "nosniff");
    if let Some(disposition) = content_disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }

    Ok(builder
        .body(Body::from_stream(ReaderStream::new(reader)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}
