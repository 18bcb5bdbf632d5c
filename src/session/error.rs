//! Typed failures of the session core.

/// Every way a lifecycle or validation operation can fail.
///
/// The routing layer maps these to transport statuses; nothing here carries a
/// token bundle, so an error can never leak a stale session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account is not provisioned")]
    AccountNotProvisioned,
    #[error("account already exists")]
    AccountExists,
    #[error("invalid confirmation code")]
    InvalidCode,
    #[error("user not found")]
    NotFound,
    #[error("unknown refresh token")]
    UnknownToken,
    #[error("refresh token expired")]
    TokenExpired,
    /// A revoked refresh token was presented again. Security relevant.
    #[error("refresh token reused")]
    TokenReused,
    #[error("identity provider rejected the request")]
    UpstreamRejected,
    #[error("identity provider unavailable")]
    UpstreamUnavailable,
    /// Lost a concurrent rotation of the same refresh token.
    #[error("concurrent rotation conflict")]
    ConflictRetry,
    #[error("too many requests")]
    TooManyRequests,
    #[error("sign out failed")]
    SignOutFailed,
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    /// Stable machine-readable code, used in logs and response bodies.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::AccountNotProvisioned => "account_not_provisioned",
            Self::AccountExists => "account_exists",
            Self::InvalidCode => "invalid_code",
            Self::NotFound => "not_found",
            Self::UnknownToken => "unknown_token",
            Self::TokenExpired => "token_expired",
            Self::TokenReused => "token_reused",
            Self::UpstreamRejected => "upstream_rejected",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::ConflictRetry => "conflict_retry",
            Self::TooManyRequests => "too_many_requests",
            Self::SignOutFailed => "sign_out_failed",
            Self::Unauthorized => "unauthorized",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionError;

    #[test]
    fn internal_wraps_anyhow_transparently() {
        let err = SessionError::from(anyhow::anyhow!("database is gone"));
        assert_eq!(err.to_string(), "database is gone");
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn codes_are_distinct_for_rotation_failures() {
        let codes = [
            SessionError::UnknownToken.code(),
            SessionError::TokenExpired.code(),
            SessionError::TokenReused.code(),
            SessionError::ConflictRetry.code(),
            SessionError::UpstreamRejected.code(),
            SessionError::UpstreamUnavailable.code(),
        ];
        for (index, code) in codes.iter().enumerate() {
            assert!(!codes[index + 1..].contains(code), "duplicate code {code}");
        }
    }
}
