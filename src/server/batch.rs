use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use serde_json::Value;

use crate::auth::AuthRequest;
use crate::auth::identity::{Identity, Permission};
use crate::error::{LfsError, lfs_json_response};
use crate::server::dto::{BatchRequest, BatchResponse, Operation};
use crate::server::router::{AppState, strip_git_suffix};
use crate::transfer::TransferContext;

pub(super) fn validate_repo_path(organization: &str, repo: &str) -> Result<(), LfsError> {
    for segment in [organization, repo] {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(LfsError::NotFound("Repository not found".to_string()));
        }
    }
    Ok(())
}

pub(super) fn auth_request<'a>(
    organization: &'a str,
    repo: &'a str,
    headers: &'a HeaderMap,
    query: &'a HashMap<String, String>,
) -> AuthRequest<'a> {
    AuthRequest {
        organization,
        repo,
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
        jwt_param: query.get("jwt").map(String::as_str),
    }
}

pub(super) fn check_authorization(
    identity: &Arc<dyn Identity>,
    organization: &str,
    repo: &str,
    permission: Permission,
    oid: Option<&str>,
) -> Result<(), LfsError> {
    if identity.is_authorized(organization, repo, permission, oid) {
        Ok(())
    } else {
        Err(LfsError::Forbidden(
            "You are not authorized to perform this action".to_string(),
        ))
    }
}

pub async fn batch_handler(
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

    let request: BatchRequest = serde_json::from_value(payload)
        .map_err(|e| LfsError::InvalidPayload(format!("Invalid batch request: {e}")))?;
    if request.objects.is_empty() {
        return Err(LfsError::InvalidPayload(
            "No objects to process".to_string(),
        ));
    }

    let Some((transfer, adapter)) = state.transfers.match_adapter(&request.transfers) else {
        return Err(LfsError::InvalidPayload(format!(
            "Unable to match any transfer adapter: {:?}",
            request.transfers
        )));
    };

    let permission = match request.operation {
        Operation::Upload => Permission::Write,
        Operation::Download => Permission::Read,
    };
    if let Err(forbidden) =
        check_authorization(&identity, &organization, &repo, permission, None)
    {
        // No repo-wide grant; the caller may still hold per-object grants
        // covering everything requested.
        let all_objects_authorized = request.objects.iter().all(|object| {
            identity.is_authorized(&organization, &repo, permission, Some(&object.oid))
        });
        if !all_objects_authorized {
            return Err(forbidden);
        }
    }

    let base_url = state.base_url(&headers);
    let ctx = TransferContext {
        organization: &organization,
        repo: &repo,
        base_url: &base_url,
        identity: &identity,
    };

    let mut objects = Vec::with_capacity(request.objects.len());
    for object in &request.objects {
        let extra = object.extra();
        let result = match request.operation {
            Operation::Upload => adapter.upload(&ctx, &object.oid, object.size, &extra).await?,
            Operation::Download => {
                adapter
                    .download(&ctx, &object.oid, object.size, &extra)
                    .await?
            }
        };
        objects.push(result);
    }

    if objects.iter().all(|o| o.is_error(Some(404))) {
        return Err(LfsError::NotFound(
            "Cannot find any of the requested objects".to_string(),
        ));
    }
    if objects.iter().all(|o| o.is_error(None)) {
        return Err(LfsError::InvalidPayload(
            "Cannot validate any of the requested objects".to_string(),
        ));
    }

    let response = BatchResponse {
        transfer: transfer.to_string(),
        objects,
    };
    Ok(lfs_json_response(StatusCode::OK, &response))
}
