//! Accounts, refresh records and the token bundle handed to clients.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

use super::idp::IdpTokens;

/// A registered principal. Usernames and emails are unique.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One issued refresh token, live or historical.
///
/// The raw token is never kept; `token_hash` is its `SHA-256` fingerprint and
/// is unique across the ledger. `previous_id` points at the record this one
/// replaced during rotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub token_hash: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub previous_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl RefreshRecord {
    /// Build a fresh, unrevoked record for `artifact`.
    #[must_use]
    pub fn issue(
        account_id: Uuid,
        artifact: &str,
        expires_at: DateTime<Utc>,
        previous_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            token_hash: fingerprint(artifact),
            expires_at,
            revoked: false,
            previous_id,
            created_at: now,
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }
}

/// Hash a refresh token so raw values never touch the ledger.
#[must_use]
pub fn fingerprint(artifact: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(artifact.as_bytes());
    hasher.finalize().to_vec()
}

/// Random 32-byte URL-safe token.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Credentials returned by sign-in and rotation. Never persisted.
#[derive(ToSchema, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TokenBundle {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    pub token_type: String,
}

impl TokenBundle {
    /// Combine the upstream credentials with the refresh token the ledger now tracks.
    #[must_use]
    pub fn new(tokens: IdpTokens, refresh_token: String) -> Self {
        Self {
            access_token: tokens.access_token,
            id_token: tokens.id_token,
            refresh_token,
            expires_in: tokens.expires_in,
            token_type: tokens.token_type,
        }
    }
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &"***")
            .field("id_token", &"***")
            .field("refresh_token", &"***")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}
