//! Session ledger: accounts and the refresh token history.
//!
//! Every mutation of a refresh record is a guarded update on `revoked = false`
//! so concurrent writers, in this process or another, cannot both consume the
//! same token.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use super::model::{Account, RefreshRecord};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// Outcome when attempting to create a local account.
#[derive(Debug)]
pub enum CreateAccountOutcome {
    Created(Account),
    /// Username or email already taken.
    Conflict,
}

/// Outcome of inserting a fresh record after sign-in.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer installed a live record for the account at the same time.
    Contended,
}

/// Outcome of a conditional revoke.
#[derive(Debug, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    /// The record was not live (already revoked or missing).
    Conflict,
}

/// Outcome of the atomic revoke-and-insert step of rotation.
#[derive(Debug, PartialEq, Eq)]
pub enum RotateOutcome {
    Rotated,
    /// The predecessor had already been revoked; nothing was written.
    AlreadyRevoked,
    /// The predecessor was revoked but a competing live record blocked the insert;
    /// nothing was written.
    Contended,
}

#[async_trait]
pub trait AccountStore: Send + Sync + fmt::Debug {
    async fn create_account(&self, username: &str, email: &str) -> Result<CreateAccountOutcome>;

    async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>>;
}

#[async_trait]
pub trait SessionLedger: Send + Sync + fmt::Debug {
    /// Store a new live record, revoking any live record of the same account in
    /// the same step.
    async fn insert(&self, record: &RefreshRecord) -> Result<InsertOutcome>;

    /// Look up a record by the raw refresh token it was issued for.
    async fn find_by_artifact(&self, artifact: &str) -> Result<Option<RefreshRecord>>;

    /// Revoke `record_id` only if it is still live.
    async fn conditional_revoke(&self, record_id: Uuid) -> Result<RevokeOutcome>;

    async fn find_active_by_account(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshRecord>>;

    /// Revoke `previous_id` and insert `next` as one atomic step.
    async fn rotate(&self, previous_id: Uuid, next: &RefreshRecord) -> Result<RotateOutcome>;

    /// Revoke every live record of the account, returning how many were revoked.
    async fn revoke_account(&self, account_id: Uuid) -> Result<u64>;

    /// The record and its predecessors, newest first.
    async fn chain(&self, record_id: Uuid) -> Result<Vec<RefreshRecord>>;

    /// Cheap liveness probe for health checks.
    async fn ping(&self) -> Result<()>;
}
