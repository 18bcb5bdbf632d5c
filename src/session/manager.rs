//! Token lifecycle manager.
//!
//! Turns an `IdP` authentication result into a tracked, rotatable session and
//! enforces that each refresh token is rotated at most once. The upstream call
//! always happens before any ledger write, and the ledger write is a single
//! atomic step, so a failure or cancellation at any point leaves either the old
//! record live or the new one, never both.

use chrono::TimeDelta;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::error::SessionError;
use super::idp::{Confirmation, IdentityClaims, IdentityProvider, IdpError, Rejection};
use super::ledger::{
    AccountStore, CreateAccountOutcome, InsertOutcome, RevokeOutcome, RotateOutcome,
    SessionLedger,
};
use super::model::{Account, RefreshRecord, TokenBundle};

const DEFAULT_REFRESH_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Lost ledger races are retried this many times before `ConflictRetry`.
const LEDGER_RETRIES: usize = 1;

#[derive(Clone, Copy, Debug)]
pub struct LifecycleConfig {
    refresh_ttl: TimeDelta,
    upstream_timeout: Duration,
    revoke_chain_on_reuse: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_ttl: TimeDelta::seconds(DEFAULT_REFRESH_TTL_SECONDS),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            revoke_chain_on_reuse: true,
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: TimeDelta) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Revoke every live session of an account when one of its revoked
    /// refresh tokens is presented again.
    #[must_use]
    pub fn with_revoke_chain_on_reuse(mut self, enabled: bool) -> Self {
        self.revoke_chain_on_reuse = enabled;
        self
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> TimeDelta {
        self.refresh_ttl
    }

    #[must_use]
    pub fn upstream_timeout(&self) -> Duration {
        self.upstream_timeout
    }

    #[must_use]
    pub fn revoke_chain_on_reuse(&self) -> bool {
        self.revoke_chain_on_reuse
    }
}

#[derive(Clone, Debug)]
pub struct TokenLifecycleManager {
    idp: Arc<dyn IdentityProvider>,
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn SessionLedger>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl TokenLifecycleManager {
    #[must_use]
    pub fn new(
        idp: Arc<dyn IdentityProvider>,
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn SessionLedger>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            idp,
            accounts,
            ledger,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Run an upstream call under the configured timeout.
    ///
    /// Transport failures and timeouts become `UpstreamUnavailable`; a
    /// rejection is handed back so each operation can map it.
    async fn upstream<T, F>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<Result<T, Rejection>, SessionError>
    where
        F: Future<Output = Result<T, IdpError>> + Send,
    {
        match tokio::time::timeout(self.config.upstream_timeout, call).await {
            Ok(Ok(value)) => Ok(Ok(value)),
            Ok(Err(IdpError::Rejected(rejection))) => Ok(Err(rejection)),
            Ok(Err(IdpError::Unavailable(reason))) => {
                warn!(operation, "identity provider unavailable: {reason}");
                Err(SessionError::UpstreamUnavailable)
            }
            Err(_) => {
                warn!(
                    operation,
                    timeout = ?self.config.upstream_timeout,
                    "identity provider call timed out"
                );
                Err(SessionError::UpstreamUnavailable)
            }
        }
    }

    /// Create the account upstream, then record it locally.
    ///
    /// If the local write fails the account is left pending upstream and the
    /// caller sees the failure. Registering the same username again finds it
    /// upstream but not locally and provisions the local row, so the
    /// inconsistency heals on retry; confirmation stays idempotent.
    ///
    /// # Errors
    /// `AccountExists` when the username or email is taken, upstream errors otherwise.
    #[tracing::instrument(skip(self, password, email))]
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<Account, SessionError> {
        match self
            .upstream("register", self.idp.register(username, password, email))
            .await?
        {
            Ok(()) => {}
            Err(Rejection::UsernameExists) => {
                if self.accounts.find_account_by_username(username).await?.is_some() {
                    return Err(SessionError::AccountExists);
                }
                warn!("account exists upstream but not locally, provisioning");
            }
            Err(rejection) => {
                debug!("registration rejected: {rejection}");
                return Err(SessionError::UpstreamRejected);
            }
        }

        match self.accounts.create_account(username, email).await {
            Ok(CreateAccountOutcome::Created(account)) => {
                info!(account_id = %account.id, "account registered");
                Ok(account)
            }
            Ok(CreateAccountOutcome::Conflict) => Err(SessionError::AccountExists),
            Err(err) => {
                error!("account pending upstream but not stored locally: {err:#}");
                Err(SessionError::Internal(err))
            }
        }
    }

    /// Confirm a pending registration. Confirming twice is not an error.
    ///
    /// # Errors
    /// `InvalidCode` or `NotFound` as reported upstream.
    #[tracing::instrument(skip(self, code))]
    pub async fn confirm_registration(
        &self,
        username: &str,
        code: &str,
    ) -> Result<(), SessionError> {
        match self
            .upstream("confirm", self.idp.confirm_registration(username, code))
            .await?
        {
            Ok(Confirmation::Confirmed) => Ok(()),
            Ok(Confirmation::AlreadyConfirmed) => {
                debug!("registration already confirmed");
                Ok(())
            }
            Err(Rejection::CodeMismatch | Rejection::ExpiredCode) => Err(SessionError::InvalidCode),
            Err(Rejection::UserNotFound) => Err(SessionError::NotFound),
            Err(rejection) => {
                debug!("confirmation rejected: {rejection}");
                Err(SessionError::UpstreamRejected)
            }
        }
    }

    /// Sign in and start a tracked session.
    ///
    /// Any live session of the account is superseded.
    ///
    /// # Errors
    /// `InvalidCredentials` on any upstream rejection, `AccountNotProvisioned`
    /// when the account is missing locally.
    #[tracing::instrument(skip(self, password))]
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenBundle, SessionError> {
        let tokens = match self
            .upstream("authenticate", self.idp.authenticate(username, password))
            .await?
        {
            Ok(tokens) => tokens,
            Err(rejection) => {
                debug!("authentication rejected: {rejection}");
                return Err(SessionError::InvalidCredentials);
            }
        };

        let Some(account) = self.accounts.find_account_by_username(username).await? else {
            warn!("identity provider accepted credentials for an account missing locally");
            return Err(SessionError::AccountNotProvisioned);
        };

        let Some(refresh_token) = tokens.refresh_token.clone() else {
            warn!("identity provider did not issue a refresh token");
            return Err(SessionError::UpstreamRejected);
        };

        let now = self.clock.now();
        let record = RefreshRecord::issue(
            account.id,
            &refresh_token,
            now + self.config.refresh_ttl,
            None,
            now,
        );

        for attempt in 0..=LEDGER_RETRIES {
            match self.ledger.insert(&record).await? {
                InsertOutcome::Inserted => {
                    info!(account_id = %account.id, record_id = %record.id, "session started");
                    return Ok(TokenBundle::new(tokens, refresh_token));
                }
                InsertOutcome::Contended => {
                    debug!(attempt, "concurrent sign-in for the same account");
                }
            }
        }

        Err(SessionError::ConflictRetry)
    }

    /// Exchange a refresh token for a new bundle, consuming it.
    ///
    /// # Errors
    /// `UnknownToken`, `TokenReused`, `TokenExpired`, upstream failures, or
    /// `ConflictRetry` when a concurrent rotation of the same token won.
    #[tracing::instrument(skip_all)]
    pub async fn rotate(&self, artifact: &str) -> Result<TokenBundle, SessionError> {
        let Some(record) = self.ledger.find_by_artifact(artifact).await? else {
            return Err(SessionError::UnknownToken);
        };

        if record.revoked {
            return Err(self.reuse_detected(&record).await);
        }

        if record.is_expired_at(self.clock.now()) {
            debug!(record_id = %record.id, "refresh token expired");
            return Err(SessionError::TokenExpired);
        }

        let tokens = match self
            .upstream("rotate", self.idp.rotate(artifact))
            .await?
        {
            Ok(tokens) => tokens,
            Err(rejection) => {
                warn!(record_id = %record.id, "rotation rejected upstream: {rejection}");
                return Err(SessionError::UpstreamRejected);
            }
        };

        let next_artifact = match tokens.refresh_token.clone() {
            Some(next) if next != artifact => next,
            _ => {
                warn!(record_id = %record.id, "identity provider did not rotate the refresh token");
                return Err(SessionError::UpstreamRejected);
            }
        };

        let now = self.clock.now();
        let next = RefreshRecord::issue(
            record.account_id,
            &next_artifact,
            now + self.config.refresh_ttl,
            Some(record.id),
            now,
        );

        for attempt in 0..=LEDGER_RETRIES {
            match self.ledger.rotate(record.id, &next).await? {
                RotateOutcome::Rotated => {
                    info!(
                        account_id = %record.account_id,
                        previous_id = %record.id,
                        record_id = %next.id,
                        "refresh token rotated"
                    );
                    return Ok(TokenBundle::new(tokens, next_artifact));
                }
                RotateOutcome::AlreadyRevoked => {
                    warn!(record_id = %record.id, "lost concurrent rotation");
                    return Err(SessionError::ConflictRetry);
                }
                RotateOutcome::Contended => {
                    debug!(attempt, record_id = %record.id, "rotation contended");
                }
            }
        }

        Err(SessionError::ConflictRetry)
    }

    /// A revoked token came back. Never downgraded; optionally revokes the account's sessions.
    async fn reuse_detected(&self, record: &RefreshRecord) -> SessionError {
        error!(
            target: "security",
            account_id = %record.account_id,
            record_id = %record.id,
            "revoked refresh token presented again"
        );

        if self.config.revoke_chain_on_reuse {
            match self.ledger.revoke_account(record.account_id).await {
                Ok(revoked) => warn!(
                    target: "security",
                    account_id = %record.account_id,
                    revoked,
                    "revoked live sessions after refresh token reuse"
                ),
                Err(err) => error!(
                    target: "security",
                    account_id = %record.account_id,
                    "failed to revoke sessions after refresh token reuse: {err:#}"
                ),
            }
        }

        SessionError::TokenReused
    }

    /// Sign out everywhere.
    ///
    /// Local revocation runs whatever the upstream outcome; an upstream
    /// failure is still reported.
    ///
    /// # Errors
    /// `SignOutFailed` when the `IdP` did not invalidate the session.
    #[tracing::instrument(skip_all, fields(username = %identity.username))]
    pub async fn sign_out(
        &self,
        access_token: &str,
        identity: &IdentityClaims,
    ) -> Result<(), SessionError> {
        let upstream = self
            .upstream("sign_out", self.idp.invalidate_session(access_token))
            .await;

        let local = self.revoke_local(&identity.username).await;

        match (upstream, local) {
            (_, Err(err)) => {
                error!("failed to revoke local sessions: {err:#}");
                Err(err)
            }
            (Ok(Ok(())), Ok(revoked)) => {
                info!(revoked, "signed out");
                Ok(())
            }
            (Ok(Err(rejection)), Ok(revoked)) => {
                warn!(revoked, "upstream sign-out rejected: {rejection}");
                Err(SessionError::SignOutFailed)
            }
            (Err(err), Ok(revoked)) => {
                warn!(revoked, "upstream sign-out failed: {err}");
                Err(SessionError::SignOutFailed)
            }
        }
    }

    async fn revoke_local(&self, username: &str) -> Result<u64, SessionError> {
        let Some(account) = self.accounts.find_account_by_username(username).await? else {
            debug!("no local account to revoke");
            return Ok(0);
        };
        Ok(self.ledger.revoke_account(account.id).await?)
    }

    /// Revoke a single refresh token. Unknown or already revoked tokens are accepted.
    ///
    /// # Errors
    /// Only on ledger failure.
    #[tracing::instrument(skip_all)]
    pub async fn revoke_token(&self, artifact: &str) -> Result<(), SessionError> {
        let Some(record) = self.ledger.find_by_artifact(artifact).await? else {
            debug!("revocation of unknown refresh token");
            return Ok(());
        };

        match self.ledger.conditional_revoke(record.id).await? {
            RevokeOutcome::Revoked => info!(record_id = %record.id, "refresh token revoked"),
            RevokeOutcome::Conflict => debug!(record_id = %record.id, "refresh token already revoked"),
        }
        Ok(())
    }
}
