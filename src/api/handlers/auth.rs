//! Credential endpoints: sign-up, confirmation, sign-in, refresh, revoke and logout.
//!
//! Bodies are JSON. A missing or malformed body is answered with
//! `400 invalid request body` before the session core is involved.

use super::{valid_email, MessageResponse};
use crate::api::error::{invalid_body, ErrorBody};
use crate::session::{bearer::authorize, BearerValidator, TokenBundle, TokenLifecycleManager};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{debug, instrument};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub username: String,
    pub password: String,
    pub email: String,
}

impl fmt::Debug for SignUpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignUpRequest")
            .field("username", &self.username)
            .field("password", &"***")
            .field("email", &self.email)
            .finish()
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ConfirmRequest {
    pub username: String,
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize)]
pub struct SignInRequest {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SignInRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInRequest")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(ToSchema, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub token: String,
}

fn field_error(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody::new(message, "invalid_request")),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path= "/signup",
    request_body = SignUpRequest,
    responses (
        (status = 202, description = "Account created, confirmation code sent", body = MessageResponse),
        (status = 400, description = "Invalid request body", body = ErrorBody),
        (status = 409, description = "Username or email already registered", body = ErrorBody),
        (status = 429, description = "Too many requests", body = ErrorBody),
    ),
    tag= "auth"
)]
#[instrument(skip(manager, payload))]
pub async fn signup(
    manager: Extension<Arc<TokenLifecycleManager>>,
    payload: Option<Json<SignUpRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return invalid_body();
    };
    debug!("request: {:?}", request);

    let username = request.username.trim();
    let email = request.email.trim().to_lowercase();
    if username.is_empty() || request.password.is_empty() {
        return field_error("username and password are required");
    }
    if !valid_email(&email) {
        return field_error("invalid email");
    }

    match manager.register(username, &request.password, &email).await {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(MessageResponse::new("verification code sent")),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path= "/confirm",
    request_body = ConfirmRequest,
    responses (
        (status = 200, description = "Registration confirmed", body = MessageResponse),
        (status = 400, description = "Invalid body or confirmation code", body = ErrorBody),
        (status = 404, description = "Unknown user", body = ErrorBody),
    ),
    tag= "auth"
)]
#[instrument(skip(manager, payload))]
pub async fn confirm(
    manager: Extension<Arc<TokenLifecycleManager>>,
    payload: Option<Json<ConfirmRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return invalid_body();
    };
    let username = request.username.trim();
    let code = request.code.trim();
    if username.is_empty() || code.is_empty() {
        return field_error("username and code are required");
    }

    match manager.confirm_registration(username, code).await {
        Ok(()) => (StatusCode::OK, Json(MessageResponse::new("user confirmed"))).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path= "/signin",
    request_body = SignInRequest,
    responses (
        (status = 200, description = "Signed in", body = TokenBundle),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 409, description = "Account missing locally", body = ErrorBody),
        (status = 429, description = "Too many requests", body = ErrorBody),
        (status = 503, description = "Identity provider unavailable", body = ErrorBody),
    ),
    tag= "auth"
)]
#[instrument(skip(manager, payload))]
pub async fn signin(
    manager: Extension<Arc<TokenLifecycleManager>>,
    payload: Option<Json<SignInRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return invalid_body();
    };
    let username = request.username.trim();
    if username.is_empty() || request.password.is_empty() {
        return field_error("username and password are required");
    }

    match manager.authenticate(username, &request.password).await {
        Ok(bundle) => (StatusCode::OK, Json(bundle)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path= "/refresh",
    request_body = RefreshRequest,
    responses (
        (status = 200, description = "Refresh token rotated", body = TokenBundle),
        (status = 401, description = "Unknown, expired or reused refresh token", body = ErrorBody),
        (status = 409, description = "Lost a concurrent rotation", body = ErrorBody),
        (status = 429, description = "Too many requests", body = ErrorBody),
        (status = 503, description = "Identity provider unavailable", body = ErrorBody),
    ),
    tag= "auth"
)]
#[instrument(skip(manager, payload))]
pub async fn refresh(
    manager: Extension<Arc<TokenLifecycleManager>>,
    payload: Option<Json<RefreshRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return invalid_body();
    };
    if request.refresh_token.trim().is_empty() {
        return field_error("refresh_token is required");
    }

    match manager.rotate(request.refresh_token.trim()).await {
        Ok(bundle) => (StatusCode::OK, Json(bundle)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path= "/revoke",
    request_body = RevokeRequest,
    responses (
        (status = 200, description = "Refresh token revoked", body = MessageResponse),
        (status = 400, description = "Invalid request body", body = ErrorBody),
        (status = 429, description = "Too many requests", body = ErrorBody),
    ),
    tag= "auth"
)]
#[instrument(skip(manager, payload))]
pub async fn revoke(
    manager: Extension<Arc<TokenLifecycleManager>>,
    payload: Option<Json<RevokeRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return invalid_body();
    };
    if request.token.trim().is_empty() {
        return field_error("token is required");
    }

    match manager.revoke_token(request.token.trim()).await {
        Ok(()) => (StatusCode::OK, Json(MessageResponse::new("token revoked"))).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path= "/logout",
    responses (
        (status = 204, description = "Signed out everywhere"),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorBody),
        (status = 502, description = "Identity provider did not invalidate the session", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag= "auth"
)]
#[instrument(skip_all)]
pub async fn logout(
    manager: Extension<Arc<TokenLifecycleManager>>,
    Extension(bearer): Extension<Arc<dyn BearerValidator>>,
    headers: HeaderMap,
) -> Response {
    let authorized = match authorize(bearer.as_ref(), &headers).await {
        Ok(authorized) => authorized,
        Err(err) => return err.into_response(),
    };

    match manager
        .sign_out(&authorized.access_token, &authorized.identity)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}
