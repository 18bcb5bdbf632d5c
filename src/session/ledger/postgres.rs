//! `PostgreSQL` ledger.
//!
//! The single-use guarantee rests on two things: the conditional
//! `UPDATE ... WHERE revoked = FALSE` that consumes a token, and the partial
//! unique index that allows one live token per account.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    AccountStore, CreateAccountOutcome, InsertOutcome, RevokeOutcome, RotateOutcome,
    SessionLedger,
};
use crate::session::model::{fingerprint, Account, RefreshRecord};

const ONE_ACTIVE_PER_ACCOUNT: &str = "refresh_tokens_one_active_per_account";

const RECORD_COLUMNS: &str =
    "id, account_id, token_hash, expires_at, revoked, previous_id, created_at";

#[derive(Clone, Debug)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool to `dsn`.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("failed to connect to database")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    is_unique_violation(err)
        && matches!(err, sqlx::Error::Database(db_err) if db_err.constraint() == Some(constraint))
}

fn record_from_row(row: &PgRow) -> RefreshRecord {
    RefreshRecord {
        id: row.get("id"),
        account_id: row.get("account_id"),
        token_hash: row.get("token_hash"),
        expires_at: row.get("expires_at"),
        revoked: row.get("revoked"),
        previous_id: row.get("previous_id"),
        created_at: row.get("created_at"),
    }
}

fn account_from_row(row: &PgRow) -> Account {
    Account {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn db_span(operation: &'static str, query: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = query
    )
}

async fn insert_record(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &RefreshRecord,
) -> Result<(), sqlx::Error> {
    let query = r"
        INSERT INTO refresh_tokens
            (id, account_id, token_hash, expires_at, revoked, previous_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
    ";
    sqlx::query(query)
        .bind(record.id)
        .bind(record.account_id)
        .bind(record.token_hash.as_slice())
        .bind(record.expires_at)
        .bind(record.revoked)
        .bind(record.previous_id)
        .bind(record.created_at)
        .execute(&mut **tx)
        .instrument(db_span("INSERT", query))
        .await
        .map(|_| ())
}

#[async_trait]
impl AccountStore for PgLedger {
    async fn create_account(&self, username: &str, email: &str) -> Result<CreateAccountOutcome> {
        let query = r"
            INSERT INTO accounts (id, username, email)
            VALUES ($1, $2, $3)
            RETURNING id, username, email, created_at, updated_at
        ";
        let row = sqlx::query(query)
            .bind(Uuid::now_v7())
            .bind(username)
            .bind(email)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", query))
            .await;

        match row {
            Ok(row) => Ok(CreateAccountOutcome::Created(account_from_row(&row))),
            Err(err) if is_unique_violation(&err) => Ok(CreateAccountOutcome::Conflict),
            Err(err) => Err(err).context("failed to insert account"),
        }
    }

    async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let query =
            "SELECT id, username, email, created_at, updated_at FROM accounts WHERE username = $1";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup account")?;

        Ok(row.as_ref().map(account_from_row))
    }
}

#[async_trait]
impl SessionLedger for PgLedger {
    async fn insert(&self, record: &RefreshRecord) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await.context("begin insert transaction")?;

        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW()
            WHERE account_id = $1 AND revoked = FALSE
        ";
        sqlx::query(query)
            .bind(record.account_id)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to supersede live refresh tokens")?;

        match insert_record(&mut tx, record).await {
            Ok(()) => {}
            Err(err) if violates(&err, ONE_ACTIVE_PER_ACCOUNT) => {
                let _ = tx.rollback().await;
                return Ok(InsertOutcome::Contended);
            }
            Err(err) => return Err(err).context("failed to insert refresh token"),
        }

        tx.commit().await.context("commit insert transaction")?;

        Ok(InsertOutcome::Inserted)
    }

    async fn find_by_artifact(&self, artifact: &str) -> Result<Option<RefreshRecord>> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM refresh_tokens WHERE token_hash = $1");
        let row = sqlx::query(&query)
            .bind(fingerprint(artifact))
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup refresh token")?;

        Ok(row.as_ref().map(record_from_row))
    }

    async fn conditional_revoke(&self, record_id: Uuid) -> Result<RevokeOutcome> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW()
            WHERE id = $1 AND revoked = FALSE
        ";
        let result = sqlx::query(query)
            .bind(record_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke refresh token")?;

        Ok(if result.rows_affected() == 1 {
            RevokeOutcome::Revoked
        } else {
            RevokeOutcome::Conflict
        })
    }

    async fn find_active_by_account(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM refresh_tokens \
             WHERE account_id = $1 AND revoked = FALSE AND expires_at > $2 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(account_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup active refresh token")?;

        Ok(row.as_ref().map(record_from_row))
    }

    async fn rotate(&self, previous_id: Uuid, next: &RefreshRecord) -> Result<RotateOutcome> {
        let mut tx = self.pool.begin().await.context("begin rotate transaction")?;

        // Only the writer that flips `revoked` from FALSE proceeds to insert.
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW()
            WHERE id = $1 AND revoked = FALSE
        ";
        let result = sqlx::query(query)
            .bind(previous_id)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke previous refresh token")?;

        if result.rows_affected() == 0 {
            let _ = tx.rollback().await;
            return Ok(RotateOutcome::AlreadyRevoked);
        }

        match insert_record(&mut tx, next).await {
            Ok(()) => {}
            Err(err) if violates(&err, ONE_ACTIVE_PER_ACCOUNT) => {
                let _ = tx.rollback().await;
                return Ok(RotateOutcome::Contended);
            }
            Err(err) => return Err(err).context("failed to insert rotated refresh token"),
        }

        tx.commit().await.context("commit rotate transaction")?;

        Ok(RotateOutcome::Rotated)
    }

    async fn revoke_account(&self, account_id: Uuid) -> Result<u64> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW()
            WHERE account_id = $1 AND revoked = FALSE
        ";
        let result = sqlx::query(query)
            .bind(account_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke account refresh tokens")?;

        Ok(result.rows_affected())
    }

    async fn chain(&self, record_id: Uuid) -> Result<Vec<RefreshRecord>> {
        let query = format!(
            "WITH RECURSIVE lineage AS ( \
                 SELECT {RECORD_COLUMNS}, 0 AS depth FROM refresh_tokens WHERE id = $1 \
                 UNION ALL \
                 SELECT r.id, r.account_id, r.token_hash, r.expires_at, r.revoked, \
                        r.previous_id, r.created_at, l.depth + 1 \
                 FROM refresh_tokens r JOIN lineage l ON r.id = l.previous_id \
             ) \
             SELECT {RECORD_COLUMNS} FROM lineage ORDER BY depth"
        );
        let rows = sqlx::query(&query)
            .bind(record_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to walk refresh token chain")?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn ping(&self) -> Result<()> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{is_unique_violation, violates, ONE_ACTIVE_PER_ACCOUNT};
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
        constraint: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn constraint(&self) -> Option<&str> {
            self.constraint
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    fn db_error(code: Option<&'static str>, constraint: Option<&'static str>) -> sqlx::Error {
        sqlx::Error::Database(Box::new(TestDbError { code, constraint }))
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        assert!(is_unique_violation(&db_error(Some("23505"), None)));
        assert!(!is_unique_violation(&db_error(Some("99999"), None)));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn violates_checks_constraint_name() {
        assert!(violates(
            &db_error(Some("23505"), Some(ONE_ACTIVE_PER_ACCOUNT)),
            ONE_ACTIVE_PER_ACCOUNT
        ));
        assert!(!violates(
            &db_error(Some("23505"), Some("refresh_tokens_token_hash_key")),
            ONE_ACTIVE_PER_ACCOUNT
        ));
        assert!(!violates(
            &db_error(Some("23503"), Some(ONE_ACTIVE_PER_ACCOUNT)),
            ONE_ACTIVE_PER_ACCOUNT
        ));
    }
}
