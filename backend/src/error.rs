use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use draw_core::DrawError;

use crate::store::StoreError;

/// Handler failures, rendered as a status code with a plain-text body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid admin password")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DrawError> for ApiError {
    fn from(err: DrawError) -> Self {
        match err {
            DrawError::ParticipantNotFound => ApiError::NotFound("participant not found"),
            DrawError::AlreadyDrawn => ApiError::Conflict("participant has already drawn"),
            DrawError::NotInPool => ApiError::BadRequest("target is not in the pool"),
            DrawError::InvalidName => ApiError::BadRequest("name required"),
            DrawError::IllegalTransition { .. } => ApiError::Conflict("action not allowed now"),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) | ApiError::Store(StoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_errors_map_to_statuses() {
        assert_eq!(
            ApiError::from(DrawError::AlreadyDrawn).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(DrawError::ParticipantNotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(DrawError::InvalidName).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn store_errors_are_unavailable_unless_missing() {
        let down = ApiError::from(StoreError::Unavailable("timeout".into()));
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(down.to_string(), "store unavailable: timeout");

        let missing = ApiError::from(StoreError::NotFound(4));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
