use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Media type used for every request and response body in the Git LFS API.
pub const GIT_LFS_MIME_TYPE: &str = "application/vnd.git-lfs+json";

/// Request-level failure, serialized as `{"message": ...}` with the Git LFS
/// media type and the matching HTTP status.
///
/// Per-object failures (missing object, size mismatch) do not use this type;
/// they are reported inside the batch response objects instead.
#[derive(Debug, Error)]
pub enum LfsError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Internal(String),
}

impl LfsError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, LfsError>;

#[must_use]
pub fn lfs_json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response {
    let json = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, GIT_LFS_MIME_TYPE)
        .body(Body::from(json))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

impl IntoResponse for LfsError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // Specifics of internal faults go to the log, not the client.
            Self::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({ "message": message });
        let mut response = lfs_json_response(status, &body);

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "WWW-Authenticate",
                "Basic realm=\"Git LFS\"".parse().unwrap(),
            );
        }

        response
    }
}
