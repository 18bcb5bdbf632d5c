//! Bearer validation for protected routes.
//!
//! Access tokens are short lived, so validation is stateless: either ask the
//! `IdP` who the token belongs to, or verify it against a locally configured
//! signing key. The session ledger is never consulted here.

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{fmt, sync::Arc, time::Duration};
use tracing::debug;

use super::error::SessionError;
use super::idp::{IdentityClaims, IdentityProvider, IdpError};

#[async_trait]
pub trait BearerValidator: Send + Sync + fmt::Debug {
    /// Resolve the identity behind an access token.
    ///
    /// # Errors
    /// `Unauthorized` for any invalid token.
    async fn validate(&self, access_token: &str) -> Result<IdentityClaims, SessionError>;
}

/// A validated caller.
#[derive(Clone, Debug)]
pub struct Authorized {
    pub access_token: String,
    pub identity: IdentityClaims,
}

/// Pull the token out of `Authorization: Bearer <token>`.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(char::is_whitespace)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Validate the bearer token carried by `headers`.
///
/// # Errors
/// `Unauthorized` when the header is missing, malformed or the token is invalid.
pub async fn authorize(
    validator: &dyn BearerValidator,
    headers: &HeaderMap,
) -> Result<Authorized, SessionError> {
    let Some(access_token) = extract_bearer_token(headers) else {
        return Err(SessionError::Unauthorized);
    };
    let identity = validator.validate(&access_token).await?;
    Ok(Authorized {
        access_token,
        identity,
    })
}

/// Asks the `IdP` on every request.
#[derive(Clone, Debug)]
pub struct IdpBearerValidator {
    idp: Arc<dyn IdentityProvider>,
    timeout: Duration,
}

impl IdpBearerValidator {
    #[must_use]
    pub fn new(idp: Arc<dyn IdentityProvider>, timeout: Duration) -> Self {
        Self { idp, timeout }
    }
}

#[async_trait]
impl BearerValidator for IdpBearerValidator {
    async fn validate(&self, access_token: &str) -> Result<IdentityClaims, SessionError> {
        match tokio::time::timeout(self.timeout, self.idp.get_identity(access_token)).await {
            Ok(Ok(claims)) => Ok(claims),
            Ok(Err(IdpError::Rejected(rejection))) => {
                debug!("access token rejected: {rejection}");
                Err(SessionError::Unauthorized)
            }
            Ok(Err(IdpError::Unavailable(reason))) => {
                debug!("identity lookup unavailable: {reason}");
                Err(SessionError::UpstreamUnavailable)
            }
            Err(_) => Err(SessionError::UpstreamUnavailable),
        }
    }
}

#[derive(Deserialize)]
struct AccessClaims {
    sub: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(rename = "cognito:username", default)]
    cognito_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
}

/// Verifies `HS256` tokens with a configured key.
#[derive(Clone)]
pub struct LocalKeyValidator {
    key: DecodingKey,
    validation: Validation,
}

impl LocalKeyValidator {
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }
}

impl fmt::Debug for LocalKeyValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyValidator")
            .field("key", &"***")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

#[async_trait]
impl BearerValidator for LocalKeyValidator {
    async fn validate(&self, access_token: &str) -> Result<IdentityClaims, SessionError> {
        let data = decode::<AccessClaims>(access_token, &self.key, &self.validation).map_err(|err| {
            debug!("access token rejected: {err}");
            SessionError::Unauthorized
        })?;
        let claims = data.claims;
        let username = claims
            .username
            .or(claims.cognito_username)
            .unwrap_or_else(|| claims.sub.clone());
        Ok(IdentityClaims {
            subject: claims.sub,
            username,
            email: claims.email,
            email_verified: claims.email_verified,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::idp::memory::{MemoryIdentityProvider, CONFIRMATION_CODE};
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "local-signing-key";

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn sign(claims: &serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn validator() -> LocalKeyValidator {
        LocalKeyValidator::new(&SecretString::from(SECRET.to_string()))
    }

    fn in_an_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn extract_bearer_token_ignores_scheme_case() {
        for value in ["Bearer abc", "bearer  abc ", "BEARER abc", "bEaReR\tabc"] {
            assert_eq!(
                extract_bearer_token(&headers(value)).as_deref(),
                Some("abc"),
                "{value}"
            );
        }
        assert!(extract_bearer_token(&headers("Bearerabc")).is_none());
        assert!(extract_bearer_token(&headers("Bearer ")).is_none());
        assert!(extract_bearer_token(&headers("Basic abc")).is_none());
        assert!(extract_bearer_token(&HeaderMap::new()).is_none());
    }

    #[tokio::test]
    async fn local_key_accepts_signed_token() {
        let token = sign(
            &json!({
                "sub": "6b1c-sub",
                "cognito:username": "alice",
                "email": "a@x.com",
                "email_verified": true,
                "exp": in_an_hour(),
            }),
            SECRET,
        );
        let claims = validator().validate(&token).await.unwrap();
        assert_eq!(claims.subject, "6b1c-sub");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.email.as_deref(), Some("a@x.com"));
        assert_eq!(claims.email_verified, Some(true));
    }

    #[tokio::test]
    async fn local_key_rejects_bad_tokens() {
        let wrong_key = sign(&json!({ "sub": "s", "exp": in_an_hour() }), "other-key");
        let expired = sign(
            &json!({ "sub": "s", "exp": chrono::Utc::now().timestamp() - 3600 }),
            SECRET,
        );
        let no_sub = sign(&json!({ "exp": in_an_hour() }), SECRET);

        for token in [wrong_key.as_str(), expired.as_str(), no_sub.as_str(), "garbage"] {
            assert!(matches!(
                validator().validate(token).await,
                Err(SessionError::Unauthorized)
            ));
        }
    }

    #[tokio::test]
    async fn local_key_checks_audience_when_configured() {
        let token = sign(
            &json!({ "sub": "s", "aud": "someone-else", "exp": in_an_hour() }),
            SECRET,
        );
        assert!(validator().validate(&token).await.is_ok());
        assert!(matches!(
            validator().with_audience("custodian").validate(&token).await,
            Err(SessionError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn idp_validator_resolves_identity() {
        let idp = Arc::new(MemoryIdentityProvider::new());
        idp.register("alice", "Secr3t!", "a@x.com").await.unwrap();
        idp.confirm_registration("alice", CONFIRMATION_CODE)
            .await
            .unwrap();
        let tokens = idp.authenticate("alice", "Secr3t!").await.unwrap();

        let validator = IdpBearerValidator::new(idp, Duration::from_secs(1));
        let authorized = authorize(
            &validator,
            &headers(&format!("Bearer {}", tokens.access_token)),
        )
        .await
        .unwrap();
        assert_eq!(authorized.identity.username, "alice");
        assert_eq!(authorized.access_token, tokens.access_token);

        assert!(matches!(
            authorize(&validator, &headers("Bearer unknown")).await,
            Err(SessionError::Unauthorized)
        ));
        assert!(matches!(
            authorize(&validator, &HeaderMap::new()).await,
            Err(SessionError::Unauthorized)
        ));
    }
}
