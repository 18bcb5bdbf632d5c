//! Identity provider gateway.
//!
//! The `IdP` owns passwords and mints tokens. Every upstream failure is sorted
//! into one of two buckets: the `IdP` answered and said no ([`IdpError::Rejected`]),
//! or it could not be reached in time ([`IdpError::Unavailable`]). Callers decide
//! what a rejection means for their operation.

pub mod cognito;
pub mod memory;

use async_trait::async_trait;
use std::fmt;

pub use cognito::{CognitoConfig, CognitoGateway};
pub use memory::MemoryIdentityProvider;

/// Tokens minted by the `IdP`.
///
/// `refresh_token` is `None` when the upstream did not issue one, which some
/// providers do on refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct IdpTokens {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub token_type: String,
}

impl fmt::Debug for IdpTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdpTokens")
            .field("access_token", &"***")
            .field("id_token", &"***")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "***"),
            )
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Identity bound to an access token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityClaims {
    pub subject: String,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
}

/// Outcome of confirming a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    AlreadyConfirmed,
}

/// Upstream answered with a definite refusal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    NotAuthorized,
    UserNotFound,
    UserNotConfirmed,
    UsernameExists,
    CodeMismatch,
    ExpiredCode,
    InvalidParameter,
    /// Authentication needs an extra challenge (MFA, new password, ...).
    ChallengeRequired(String),
    Other(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthorized => f.write_str("not authorized"),
            Self::UserNotFound => f.write_str("user not found"),
            Self::UserNotConfirmed => f.write_str("user not confirmed"),
            Self::UsernameExists => f.write_str("username exists"),
            Self::CodeMismatch => f.write_str("code mismatch"),
            Self::ExpiredCode => f.write_str("expired code"),
            Self::InvalidParameter => f.write_str("invalid parameter"),
            Self::ChallengeRequired(name) => write!(f, "challenge required: {name}"),
            Self::Other(kind) => write!(f, "rejected: {kind}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdpError {
    #[error("identity provider rejected the request: {0}")]
    Rejected(Rejection),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Operations the lifecycle manager needs from an identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync + fmt::Debug {
    async fn register(&self, username: &str, password: &str, email: &str)
        -> Result<(), IdpError>;

    async fn confirm_registration(
        &self,
        username: &str,
        code: &str,
    ) -> Result<Confirmation, IdpError>;

    async fn authenticate(&self, username: &str, password: &str) -> Result<IdpTokens, IdpError>;

    /// Exchange a refresh token for new credentials.
    async fn rotate(&self, refresh_token: &str) -> Result<IdpTokens, IdpError>;

    /// Revoke every upstream session tied to the access token's user.
    async fn invalidate_session(&self, access_token: &str) -> Result<(), IdpError>;

    async fn get_identity(&self, access_token: &str) -> Result<IdentityClaims, IdpError>;
}
