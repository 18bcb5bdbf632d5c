//! In-process identity provider for local runs and tests.
//!
//! Behaves like a Cognito user pool with refresh token rotation enabled: a
//! rotated refresh token keeps working for a short grace period, after which
//! it is refused. Global sign-out drops every token of the user.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Confirmation, IdentityClaims, IdentityProvider, IdpError, IdpTokens, Rejection};
use crate::session::model::generate_token;

/// Code accepted by [`MemoryIdentityProvider::confirm_registration`].
pub const CONFIRMATION_CODE: &str = "000000";

const ACCESS_TOKEN_TTL_SECONDS: i64 = 3600;
const DEFAULT_REUSE_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct User {
    subject: String,
    password: String,
    email: String,
    confirmed: bool,
}

#[derive(Debug)]
struct RefreshEntry {
    username: String,
    retired_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<String, User>,
    access: HashMap<String, String>,
    refresh: HashMap<String, RefreshEntry>,
    fail_next: Option<IdpError>,
}

#[derive(Debug)]
pub struct MemoryIdentityProvider {
    state: Mutex<State>,
    reuse_grace: Duration,
    latency: Option<(Duration, Duration)>,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            reuse_grace: DEFAULT_REUSE_GRACE,
            latency: None,
        }
    }

    /// How long a rotated refresh token is still accepted.
    #[must_use]
    pub fn with_reuse_grace(mut self, grace: Duration) -> Self {
        self.reuse_grace = grace;
        self
    }

    /// Sleep a random duration in `min..=max` before answering each call.
    #[must_use]
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.latency = Some((min, max.max(min)));
        self
    }

    /// Make the next call fail with `err`.
    pub fn fail_next(&self, err: IdpError) {
        self.lock().fail_next = Some(err);
    }

    /// Number of refresh tokens the user could still present.
    #[must_use]
    pub fn live_refresh_tokens(&self, username: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .refresh
            .values()
            .filter(|entry| entry.username == username)
            .filter(|entry| {
                entry
                    .retired_at
                    .map_or(true, |retired| now.duration_since(retired) <= self.reuse_grace)
            })
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self) -> Result<std::sync::MutexGuard<'_, State>, IdpError> {
        if let Some((min, max)) = self.latency {
            let delay = rand::thread_rng().gen_range(min..=max);
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        match state.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

fn mint() -> Result<String, IdpError> {
    generate_token().map_err(|err| IdpError::Unavailable(err.to_string()))
}

fn issue(state: &mut State, username: &str) -> Result<IdpTokens, IdpError> {
    let access_token = mint()?;
    let refresh_token = mint()?;
    state.access.insert(access_token.clone(), username.to_string());
    state.refresh.insert(
        refresh_token.clone(),
        RefreshEntry {
            username: username.to_string(),
            retired_at: None,
        },
    );
    Ok(IdpTokens {
        access_token,
        id_token: mint()?,
        refresh_token: Some(refresh_token),
        expires_in: ACCESS_TOKEN_TTL_SECONDS,
        token_type: "Bearer".to_string(),
    })
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn register(&self, username: &str, password: &str, email: &str) -> Result<(), IdpError> {
        let mut state = self.enter().await?;
        if state.users.contains_key(username) {
            return Err(IdpError::Rejected(Rejection::UsernameExists));
        }
        state.users.insert(
            username.to_string(),
            User {
                subject: Uuid::new_v4().to_string(),
                password: password.to_string(),
                email: email.to_string(),
                confirmed: false,
            },
        );
        Ok(())
    }

    async fn confirm_registration(
        &self,
        username: &str,
        code: &str,
    ) -> Result<Confirmation, IdpError> {
        let mut state = self.enter().await?;
        let user = state
            .users
            .get_mut(username)
            .ok_or(IdpError::Rejected(Rejection::UserNotFound))?;
        if user.confirmed {
            return Ok(Confirmation::AlreadyConfirmed);
        }
        if code != CONFIRMATION_CODE {
            return Err(IdpError::Rejected(Rejection::CodeMismatch));
        }
        user.confirmed = true;
        Ok(Confirmation::Confirmed)
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<IdpTokens, IdpError> {
        let mut state = self.enter().await?;
        match state.users.get(username) {
            Some(user) if user.password == password => {
                if !user.confirmed {
                    return Err(IdpError::Rejected(Rejection::UserNotConfirmed));
                }
            }
            _ => return Err(IdpError::Rejected(Rejection::NotAuthorized)),
        }
        issue(&mut state, username)
    }

    async fn rotate(&self, refresh_token: &str) -> Result<IdpTokens, IdpError> {
        let mut state = self.enter().await?;
        let now = Instant::now();
        let entry = state
            .refresh
            .get_mut(refresh_token)
            .ok_or(IdpError::Rejected(Rejection::NotAuthorized))?;
        if let Some(retired) = entry.retired_at {
            if now.duration_since(retired) > self.reuse_grace {
                return Err(IdpError::Rejected(Rejection::NotAuthorized));
            }
        } else {
            entry.retired_at = Some(now);
        }
        let username = entry.username.clone();
        issue(&mut state, &username)
    }

    async fn invalidate_session(&self, access_token: &str) -> Result<(), IdpError> {
        let mut state = self.enter().await?;
        let username = state
            .access
            .get(access_token)
            .cloned()
            .ok_or(IdpError::Rejected(Rejection::NotAuthorized))?;
        state.access.retain(|_, owner| *owner != username);
        state.refresh.retain(|_, entry| entry.username != username);
        Ok(())
    }

    async fn get_identity(&self, access_token: &str) -> Result<IdentityClaims, IdpError> {
        let state = self.enter().await?;
        let username = state
            .access
            .get(access_token)
            .ok_or(IdpError::Rejected(Rejection::NotAuthorized))?;
        let user = state
            .users
            .get(username)
            .ok_or(IdpError::Rejected(Rejection::UserNotFound))?;
        Ok(IdentityClaims {
            subject: user.subject.clone(),
            username: username.clone(),
            email: Some(user.email.clone()),
            email_verified: Some(user.confirmed),
        })
    }
}
