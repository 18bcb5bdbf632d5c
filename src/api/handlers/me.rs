use crate::api::error::ErrorBody;
use crate::session::{bearer::authorize, BearerValidator};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

/// Identity behind the presented access token.
#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
}

#[utoipa::path(
    get,
    path= "/me",
    responses (
        (status = 200, description = "Caller identity", body = Identity),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag= "auth"
)]
pub async fn me(Extension(bearer): Extension<Arc<dyn BearerValidator>>, headers: HeaderMap) -> Response {
    match authorize(bearer.as_ref(), &headers).await {
        Ok(authorized) => {
            let claims = authorized.identity;
            (
                StatusCode::OK,
                Json(Identity {
                    subject: claims.subject,
                    username: claims.username,
                    email: claims.email,
                    email_verified: claims.email_verified,
                }),
            )
                .into_response()
        }
        Err(err) => err.into_response(),
    }
}
