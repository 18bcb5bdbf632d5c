//! # Custodian (Session Lifecycle Manager)
//!
//! `custodian` issues, rotates and revokes sessions for accounts whose primary
//! identity lives in an external identity provider (`IdP`). The `IdP` verifies
//! passwords and mints tokens; `custodian` decides which refresh tokens are
//! still alive.
//!
//! ## Refresh Token Ledger
//!
//! Every refresh token handed to a client is tracked as a row in the session
//! ledger. Rows are never deleted; rotation revokes the presented row and
//! inserts its successor with a back-reference, so each account owns a linked
//! history of its sessions.
//!
//! - **Single use:** a refresh token can be rotated at most once. The revoke of
//!   the old row is a conditional update on `revoked = false`, so parallel
//!   rotations of the same token (even across processes) produce exactly one
//!   winner.
//! - **Reuse detection:** presenting an already revoked token is treated as a
//!   leak. The request fails and every live session of the account is revoked.
//! - **One live session per account:** inserting a row revokes any live row of
//!   the same account in the same transaction.
//!
//! Raw refresh tokens are never stored; rows are keyed by their `SHA-256`
//! fingerprint.
//!
//! ## Access Tokens
//!
//! Access tokens are short-lived and validated statelessly, either against the
//! `IdP` or with a locally configured signing key. The ledger is not consulted
//! on every request.

pub mod api;
pub mod cli;
pub mod session;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
