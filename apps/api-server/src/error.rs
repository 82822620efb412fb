use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Request-level failures. Pipeline failures are reported inside a normal
/// caption response instead.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("field required: {0}")]
    MissingField(&'static str),

    #[error("invalid multipart form: {0}")]
    Multipart(#[from] MultipartError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingField(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Multipart(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ApiError::Multipart(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        tracing::warn!("rejecting request ({}): {}", status, self);

        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
