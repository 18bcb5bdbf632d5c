use crate::session::SessionError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

/// Body of every non-2xx JSON response.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl ErrorBody {
    pub(crate) fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

pub(crate) fn status_for(err: &SessionError) -> StatusCode {
    match err {
        SessionError::InvalidCredentials
        | SessionError::UnknownToken
        | SessionError::TokenExpired
        | SessionError::TokenReused
        | SessionError::UpstreamRejected
        | SessionError::Unauthorized => StatusCode::UNAUTHORIZED,
        SessionError::AccountNotProvisioned
        | SessionError::AccountExists
        | SessionError::ConflictRetry => StatusCode::CONFLICT,
        SessionError::InvalidCode => StatusCode::BAD_REQUEST,
        SessionError::NotFound => StatusCode::NOT_FOUND,
        SessionError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        SessionError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::SignOutFailed => StatusCode::BAD_GATEWAY,
        SessionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// 400 for a missing or malformed JSON body.
pub(crate) fn invalid_body() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody::new("invalid request body", "invalid_request")),
    )
        .into_response()
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let message = match &self {
            Self::Internal(err) => {
                error!("internal error: {err:#}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(ErrorBody::new(message, self.code()))).into_response();
        if matches!(self, Self::Unauthorized) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}
