//! Amazon Cognito user pool client using the public JSON protocol.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, de::IgnoredAny, Deserialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::{fmt, time::Duration};
use tracing::{debug, warn, Instrument};
use url::Url;

use super::{Confirmation, IdentityClaims, IdentityProvider, IdpError, IdpTokens, Rejection};
use crate::APP_USER_AGENT;

const TARGET_PREFIX: &str = "AWSCognitoIdentityProviderService";
const AMZ_JSON: &str = "application/x-amz-json-1.1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how to reach the user pool.
#[derive(Clone)]
pub struct CognitoConfig {
    endpoint: Url,
    client_id: String,
    client_secret: Option<SecretString>,
    timeout: Duration,
}

impl CognitoConfig {
    /// Point at the regional Cognito endpoint.
    ///
    /// # Errors
    /// Returns an error if the region does not form a valid URL.
    pub fn new(region: &str, client_id: impl Into<String>) -> Result<Self> {
        let endpoint = Url::parse(&format!("https://cognito-idp.{region}.amazonaws.com/"))
            .with_context(|| format!("invalid cognito region: {region}"))?;
        Ok(Self {
            endpoint,
            client_id: client_id.into(),
            client_secret: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    #[must_use]
    pub fn with_client_secret(mut self, secret: SecretString) -> Self {
        self.client_secret = Some(secret);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for CognitoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CognitoConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Cognito gateway.
#[derive(Clone, Debug)]
pub struct CognitoGateway {
    client: Client,
    config: CognitoConfig,
}

/// Raw failure before it is mapped for a specific operation.
#[derive(Debug)]
enum Failure {
    Transport(String),
    Service {
        status: StatusCode,
        kind: String,
        message: String,
    },
}

impl Failure {
    fn into_idp_error(self) -> IdpError {
        match self {
            Self::Transport(reason) => IdpError::Unavailable(reason),
            Self::Service {
                status,
                kind,
                message,
            } => {
                if status.is_server_error()
                    || matches!(
                        kind.as_str(),
                        "TooManyRequestsException" | "LimitExceededException" | "InternalErrorException"
                    )
                {
                    return IdpError::Unavailable(format!("{status} {kind}: {message}"));
                }
                IdpError::Rejected(rejection_for(&kind))
            }
        }
    }
}

fn rejection_for(kind: &str) -> Rejection {
    match kind {
        "NotAuthorizedException" => Rejection::NotAuthorized,
        "UserNotFoundException" => Rejection::UserNotFound,
        "UserNotConfirmedException" => Rejection::UserNotConfirmed,
        "UsernameExistsException" => Rejection::UsernameExists,
        "CodeMismatchException" => Rejection::CodeMismatch,
        "ExpiredCodeException" => Rejection::ExpiredCode,
        "InvalidParameterException" | "InvalidPasswordException" => Rejection::InvalidParameter,
        other => Rejection::Other(other.to_string()),
    }
}

/// `__type` may come qualified, e.g. `com.amazonaws...#NotAuthorizedException`.
fn error_kind(raw: &str) -> String {
    raw.rsplit('#').next().unwrap_or(raw).to_string()
}

fn parse_failure(status: StatusCode, body: &[u8]) -> Failure {
    let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let kind = value
        .get("__type")
        .and_then(Value::as_str)
        .map_or_else(|| "UnknownError".to_string(), error_kind);
    let message = value
        .get("message")
        .or_else(|| value.get("Message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Failure::Service {
        status,
        kind,
        message,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthResponse {
    authentication_result: Option<AuthenticationResult>,
    challenge_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationResult {
    access_token: String,
    #[serde(default)]
    id_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default = "default_token_type")]
    token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl From<AuthenticationResult> for IdpTokens {
    fn from(result: AuthenticationResult) -> Self {
        Self {
            access_token: result.access_token,
            id_token: result.id_token,
            refresh_token: result.refresh_token,
            expires_in: result.expires_in,
            token_type: result.token_type,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetUserResponse {
    username: String,
    #[serde(default)]
    user_attributes: Vec<Attribute>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Attribute {
    name: String,
    value: String,
}

impl CognitoGateway {
    /// Build the HTTP client for the pool.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: CognitoConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(config.timeout)
            .build()
            .context("failed to build cognito client")?;
        Ok(Self { client, config })
    }

    /// Base64 `HMAC-SHA256(client_secret, username + client_id)` when the app client has a secret.
    fn secret_hash(&self, username: &str) -> Result<Option<String>, IdpError> {
        let Some(secret) = &self.config.client_secret else {
            return Ok(None);
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|err| IdpError::Unavailable(format!("invalid client secret: {err}")))?;
        mac.update(username.as_bytes());
        mac.update(self.config.client_id.as_bytes());
        Ok(Some(Base64::encode_string(&mac.finalize().into_bytes())))
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, body: Value) -> Result<T, Failure> {
        let span = tracing::info_span!(
            "idp.request",
            idp.system = "cognito",
            idp.operation = operation,
            http.status_code = tracing::field::Empty,
        );

        async {
            let response = self
                .client
                .post(self.config.endpoint.clone())
                .header("X-Amz-Target", format!("{TARGET_PREFIX}.{operation}"))
                .header(CONTENT_TYPE, AMZ_JSON)
                .body(body.to_string())
                .send()
                .await
                .map_err(|err| transport_failure(operation, &err))?;

            let status = response.status();
            tracing::Span::current().record("http.status_code", status.as_u16());

            let bytes = response
                .bytes()
                .await
                .map_err(|err| transport_failure(operation, &err))?;

            if !status.is_success() {
                let failure = parse_failure(status, &bytes);
                debug!("{operation} failed: {failure:?}");
                return Err(failure);
            }

            serde_json::from_slice(&bytes).map_err(|err| {
                warn!("{operation} returned a malformed response: {err}");
                Failure::Transport(format!("{operation}: malformed response"))
            })
        }
        .instrument(span)
        .await
    }
}

fn transport_failure(operation: &str, err: &reqwest::Error) -> Failure {
    if err.is_timeout() {
        Failure::Transport(format!("{operation}: timed out"))
    } else {
        Failure::Transport(format!("{operation}: {err}"))
    }
}

#[async_trait]
impl IdentityProvider for CognitoGateway {
    async fn register(&self, username: &str, password: &str, email: &str) -> Result<(), IdpError> {
        let mut body = json!({
            "ClientId": self.config.client_id,
            "Username": username,
            "Password": password,
            "UserAttributes": [{ "Name": "email", "Value": email }],
        });
        if let Some(hash) = self.secret_hash(username)? {
            body["SecretHash"] = Value::String(hash);
        }

        self.call::<IgnoredAny>("SignUp", body)
            .await
            .map(|_| ())
            .map_err(Failure::into_idp_error)
    }

    async fn confirm_registration(
        &self,
        username: &str,
        code: &str,
    ) -> Result<Confirmation, IdpError> {
        let mut body = json!({
            "ClientId": self.config.client_id,
            "Username": username,
            "ConfirmationCode": code,
        });
        if let Some(hash) = self.secret_hash(username)? {
            body["SecretHash"] = Value::String(hash);
        }

        match self.call::<IgnoredAny>("ConfirmSignUp", body).await {
            Ok(_) => Ok(Confirmation::Confirmed),
            // Cognito answers "Current status is CONFIRMED" when repeated.
            Err(Failure::Service { kind, message, .. })
                if kind == "NotAuthorizedException" && message.contains("CONFIRMED") =>
            {
                Ok(Confirmation::AlreadyConfirmed)
            }
            Err(failure) => Err(failure.into_idp_error()),
        }
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<IdpTokens, IdpError> {
        let mut parameters = json!({
            "USERNAME": username,
            "PASSWORD": password,
        });
        if let Some(hash) = self.secret_hash(username)? {
            parameters["SECRET_HASH"] = Value::String(hash);
        }
        let body = json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": self.config.client_id,
            "AuthParameters": parameters,
        });

        let response: AuthResponse = self
            .call("InitiateAuth", body)
            .await
            .map_err(Failure::into_idp_error)?;

        match (response.authentication_result, response.challenge_name) {
            (Some(result), _) => Ok(result.into()),
            (None, Some(challenge)) => Err(IdpError::Rejected(Rejection::ChallengeRequired(challenge))),
            (None, None) => Err(IdpError::Rejected(Rejection::Other(
                "missing authentication result".to_string(),
            ))),
        }
    }

    async fn rotate(&self, refresh_token: &str) -> Result<IdpTokens, IdpError> {
        let mut body = json!({
            "ClientId": self.config.client_id,
            "RefreshToken": refresh_token,
        });
        if let Some(secret) = &self.config.client_secret {
            body["ClientSecret"] = Value::String(secret.expose_secret().to_string());
        }

        let response: AuthResponse = self
            .call("GetTokensFromRefreshToken", body)
            .await
            .map_err(Failure::into_idp_error)?;

        response
            .authentication_result
            .map(IdpTokens::from)
            .ok_or_else(|| {
                IdpError::Rejected(Rejection::Other("missing authentication result".to_string()))
            })
    }

    async fn invalidate_session(&self, access_token: &str) -> Result<(), IdpError> {
        self.call::<IgnoredAny>("GlobalSignOut", json!({ "AccessToken": access_token }))
            .await
            .map(|_| ())
            .map_err(Failure::into_idp_error)
    }

    async fn get_identity(&self, access_token: &str) -> Result<IdentityClaims, IdpError> {
        let response: GetUserResponse = self
            .call("GetUser", json!({ "AccessToken": access_token }))
            .await
            .map_err(Failure::into_idp_error)?;

        let mut claims = IdentityClaims {
            subject: response.username.clone(),
            username: response.username,
            email: None,
            email_verified: None,
        };
        for attribute in response.user_attributes {
            match attribute.name.as_str() {
                "sub" => claims.subject = attribute.value,
                "email" => claims.email = Some(attribute.value),
                "email_verified" => claims.email_verified = Some(attribute.value == "true"),
                _ => {}
            }
        }
        Ok(claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(operation: &str) -> String {
        format!("{TARGET_PREFIX}.{operation}")
    }

    fn gateway(server: &MockServer) -> CognitoGateway {
        let config = CognitoConfig::new("ap-southeast-2", "client-123")
            .unwrap()
            .with_endpoint(Url::parse(&server.uri()).unwrap())
            .with_timeout(Duration::from_millis(500));
        CognitoGateway::new(config).unwrap()
    }

    #[test]
    fn default_endpoint_is_regional() {
        let config = CognitoConfig::new("eu-west-1", "client").unwrap();
        assert_eq!(
            config.endpoint().as_str(),
            "https://cognito-idp.eu-west-1.amazonaws.com/"
        );
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn config_debug_redacts_secret() {
        let config = CognitoConfig::new("eu-west-1", "client")
            .unwrap()
            .with_client_secret(SecretString::from("shh-secret".to_string()));
        assert!(!format!("{config:?}").contains("shh-secret"));
    }

    #[test]
    fn error_kind_strips_namespace() {
        assert_eq!(
            error_kind("com.amazonaws.cognito#NotAuthorizedException"),
            "NotAuthorizedException"
        );
        assert_eq!(error_kind("CodeMismatchException"), "CodeMismatchException");
    }

    #[test]
    fn secret_hash_matches_known_vector() {
        let config = CognitoConfig::new("eu-west-1", "client-123")
            .unwrap()
            .with_client_secret(SecretString::from("shh-secret".to_string()));
        let gateway = CognitoGateway::new(config).unwrap();
        assert_eq!(
            gateway.secret_hash("alice").unwrap().as_deref(),
            Some("CZMxwXyhgNysYfovHH6jIO98583ORC2hKO5qt6/oIBM=")
        );
    }

    #[tokio::test]
    async fn authenticate_parses_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("InitiateAuth").as_str()))
            .and(body_partial_json(json!({
                "AuthFlow": "USER_PASSWORD_AUTH",
                "AuthParameters": { "USERNAME": "alice" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "AuthenticationResult": {
                    "AccessToken": "access",
                    "IdToken": "id",
                    "RefreshToken": "refresh",
                    "ExpiresIn": 3600,
                    "TokenType": "Bearer"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = gateway(&server).authenticate("alice", "Secr3t!").await.unwrap();
        assert_eq!(tokens.access_token, "access");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(tokens.expires_in, 3600);
    }

    #[tokio::test]
    async fn authenticate_maps_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "NotAuthorizedException",
                "message": "Incorrect username or password."
            })))
            .mount(&server)
            .await;

        let err = gateway(&server).authenticate("alice", "wrong").await.unwrap_err();
        assert_eq!(err, IdpError::Rejected(Rejection::NotAuthorized));
    }

    #[tokio::test]
    async fn authenticate_reports_challenge() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ChallengeName": "NEW_PASSWORD_REQUIRED",
                "Session": "opaque"
            })))
            .mount(&server)
            .await;

        let err = gateway(&server).authenticate("alice", "Secr3t!").await.unwrap_err();
        assert_eq!(
            err,
            IdpError::Rejected(Rejection::ChallengeRequired("NEW_PASSWORD_REQUIRED".to_string()))
        );
    }

    #[tokio::test]
    async fn server_errors_and_throttling_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("InitiateAuth").as_str()))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("GetTokensFromRefreshToken").as_str()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "TooManyRequestsException",
                "message": "Rate exceeded"
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server);
        assert!(matches!(
            gateway.authenticate("alice", "Secr3t!").await,
            Err(IdpError::Unavailable(_))
        ));
        assert!(matches!(
            gateway.rotate("refresh").await,
            Err(IdpError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn slow_upstream_times_out_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .invalidate_session("access")
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::Unavailable(reason) if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn confirm_treats_confirmed_user_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("ConfirmSignUp").as_str()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "NotAuthorizedException",
                "message": "User cannot be confirmed. Current status is CONFIRMED"
            })))
            .mount(&server)
            .await;

        let outcome = gateway(&server)
            .confirm_registration("alice", "123456")
            .await
            .unwrap();
        assert_eq!(outcome, Confirmation::AlreadyConfirmed);
    }

    #[tokio::test]
    async fn confirm_maps_code_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "com.amazonaws.cognito#CodeMismatchException",
                "message": "Invalid verification code provided."
            })))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .confirm_registration("alice", "999999")
            .await
            .unwrap_err();
        assert_eq!(err, IdpError::Rejected(Rejection::CodeMismatch));
    }

    #[tokio::test]
    async fn get_identity_reads_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("GetUser").as_str()))
            .and(body_partial_json(json!({ "AccessToken": "access" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Username": "alice",
                "UserAttributes": [
                    { "Name": "sub", "Value": "6b1c-sub" },
                    { "Name": "email", "Value": "a@x.com" },
                    { "Name": "email_verified", "Value": "true" }
                ]
            })))
            .mount(&server)
            .await;

        let claims = gateway(&server).get_identity("access").await.unwrap();
        assert_eq!(claims.subject, "6b1c-sub");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.email.as_deref(), Some("a@x.com"));
        assert_eq!(claims.email_verified, Some(true));
    }

    #[tokio::test]
    async fn register_sends_secret_hash_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("SignUp").as_str()))
            .and(body_partial_json(json!({
                "Username": "alice",
                "SecretHash": "CZMxwXyhgNysYfovHH6jIO98583ORC2hKO5qt6/oIBM=",
                "UserAttributes": [{ "Name": "email", "Value": "a@x.com" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "UserConfirmed": false,
                "UserSub": "6b1c-sub"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = CognitoConfig::new("ap-southeast-2", "client-123")
            .unwrap()
            .with_endpoint(Url::parse(&server.uri()).unwrap())
            .with_client_secret(SecretString::from("shh-secret".to_string()));
        let gateway = CognitoGateway::new(config).unwrap();

        gateway.register("alice", "Secr3t!", "a@x.com").await.unwrap();
    }

    #[tokio::test]
    async fn register_maps_username_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "UsernameExistsException",
                "message": "User already exists"
            })))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .register("alice", "Secr3t!", "a@x.com")
            .await
            .unwrap_err();
        assert_eq!(err, IdpError::Rejected(Rejection::UsernameExists));
    }
}
