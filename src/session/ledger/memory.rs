//! In-process ledger. Every operation runs under one lock, which gives the
//! same atomicity the database transactions provide.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{
    AccountStore, CreateAccountOutcome, InsertOutcome, RevokeOutcome, RotateOutcome,
    SessionLedger,
};
use crate::session::clock::Clock;
use crate::session::model::{fingerprint, Account, RefreshRecord};

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    usernames: HashMap<String, Uuid>,
    emails: HashMap<String, Uuid>,
    records: HashMap<Uuid, RefreshRecord>,
    by_hash: HashMap<Vec<u8>, Uuid>,
}

impl State {
    fn revoke_live(&mut self, account_id: Uuid) -> u64 {
        let mut revoked = 0;
        for record in self.records.values_mut() {
            if record.account_id == account_id && !record.revoked {
                record.revoked = true;
                revoked += 1;
            }
        }
        revoked
    }

    fn check(&self, record: &RefreshRecord) -> Result<()> {
        if self.by_hash.contains_key(&record.token_hash) {
            return Err(anyhow!("duplicate refresh token fingerprint"));
        }
        if !self.accounts.contains_key(&record.account_id) {
            return Err(anyhow!("unknown account {}", record.account_id));
        }
        Ok(())
    }

    fn store(&mut self, record: &RefreshRecord) -> Result<()> {
        self.check(record)?;
        self.by_hash.insert(record.token_hash.clone(), record.id);
        self.records.insert(record.id, record.clone());
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryLedger {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live records of an account. Used to check the one-live-session invariant.
    #[must_use]
    pub fn live_records(&self, account_id: Uuid) -> Vec<RefreshRecord> {
        self.lock()
            .records
            .values()
            .filter(|record| record.account_id == account_id && !record.revoked)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AccountStore for MemoryLedger {
    async fn create_account(&self, username: &str, email: &str) -> Result<CreateAccountOutcome> {
        let mut state = self.lock();
        if state.usernames.contains_key(username) || state.emails.contains_key(email) {
            return Ok(CreateAccountOutcome::Conflict);
        }
        let now = self.clock.now();
        let account = Account {
            id: Uuid::now_v7(),
            username: username.to_string(),
            email: email.to_string(),
            created_at: now,
            updated_at: now,
        };
        state.usernames.insert(account.username.clone(), account.id);
        state.emails.insert(account.email.clone(), account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(CreateAccountOutcome::Created(account))
    }

    async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let state = self.lock();
        Ok(state
            .usernames
            .get(username)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }
}

#[async_trait]
impl SessionLedger for MemoryLedger {
    async fn insert(&self, record: &RefreshRecord) -> Result<InsertOutcome> {
        let mut state = self.lock();
        state.check(record)?;
        state.revoke_live(record.account_id);
        state.store(record)?;
        Ok(InsertOutcome::Inserted)
    }

    async fn find_by_artifact(&self, artifact: &str) -> Result<Option<RefreshRecord>> {
        let state = self.lock();
        Ok(state
            .by_hash
            .get(&fingerprint(artifact))
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn conditional_revoke(&self, record_id: Uuid) -> Result<RevokeOutcome> {
        let mut state = self.lock();
        match state.records.get_mut(&record_id) {
            Some(record) if !record.revoked => {
                record.revoked = true;
                Ok(RevokeOutcome::Revoked)
            }
            _ => Ok(RevokeOutcome::Conflict),
        }
    }

    async fn find_active_by_account(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshRecord>> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|record| record.account_id == account_id && record.is_active_at(now))
            .max_by_key(|record| record.created_at)
            .cloned())
    }

    async fn rotate(&self, previous_id: Uuid, next: &RefreshRecord) -> Result<RotateOutcome> {
        let mut state = self.lock();
        let Some(previous) = state.records.get(&previous_id) else {
            return Ok(RotateOutcome::AlreadyRevoked);
        };
        if previous.revoked {
            return Ok(RotateOutcome::AlreadyRevoked);
        }
        let account_id = previous.account_id;
        let competing = state
            .records
            .values()
            .any(|record| record.account_id == account_id && !record.revoked && record.id != previous_id);
        if competing {
            return Ok(RotateOutcome::Contended);
        }
        state.store(next)?;
        if let Some(previous) = state.records.get_mut(&previous_id) {
            previous.revoked = true;
        }
        Ok(RotateOutcome::Rotated)
    }

    async fn revoke_account(&self, account_id: Uuid) -> Result<u64> {
        Ok(self.lock().revoke_live(account_id))
    }

    async fn chain(&self, record_id: Uuid) -> Result<Vec<RefreshRecord>> {
        let state = self.lock();
        let mut chain = Vec::new();
        let mut cursor = Some(record_id);
        while let Some(id) = cursor {
            let Some(record) = state.records.get(&id) else {
                break;
            };
            chain.push(record.clone());
            cursor = record.previous_id;
        }
        Ok(chain)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
