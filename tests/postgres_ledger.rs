//! `PgLedger` against a real database.
//!
//! Set `CUSTODIAN_TEST_DSN` to run these; they return early otherwise.

use anyhow::{bail, Result};
use chrono::{TimeDelta, Utc};
use custodian::session::{
    ledger::{CreateAccountOutcome, PgLedger, RevokeOutcome, RotateOutcome},
    model::{Account, RefreshRecord},
    AccountStore, SessionLedger,
};
use std::{env, time::Duration};
use tokio::task::JoinSet;
use ulid::Ulid;

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

fn split_sql_statements(sql: &str) -> Vec<String> {
    sql.lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}

async fn ledger() -> Result<Option<PgLedger>> {
    let Ok(dsn) = env::var("CUSTODIAN_TEST_DSN") else {
        return Ok(None);
    };
    let ledger = PgLedger::connect(&dsn, 10).await?;
    for statement in split_sql_statements(SCHEMA_SQL) {
        sqlx::query(&statement).execute(ledger.pool()).await?;
    }
    Ok(Some(ledger))
}

async fn account(ledger: &PgLedger) -> Result<Account> {
    let username = format!("it-{}", Ulid::new().to_string().to_lowercase());
    match ledger
        .create_account(&username, &format!("{username}@x.com"))
        .await?
    {
        CreateAccountOutcome::Created(account) => Ok(account),
        CreateAccountOutcome::Conflict => bail!("fresh username {username} conflicted"),
    }
}

fn record(account: &Account, previous_id: Option<uuid::Uuid>) -> RefreshRecord {
    let now = Utc::now();
    RefreshRecord::issue(
        account.id,
        &Ulid::new().to_string(),
        now + TimeDelta::days(30),
        previous_id,
        now,
    )
}

#[test]
fn split_sql_statements_skips_comments() {
    let statements = split_sql_statements("-- header;\nCREATE TABLE a (id INT);\n\nSELECT 1;\n");
    assert_eq!(statements, vec!["CREATE TABLE a (id INT)", "SELECT 1"]);
    assert_eq!(split_sql_statements(SCHEMA_SQL).len(), 4);
}

#[tokio::test]
async fn account_uniqueness() -> Result<()> {
    let Some(ledger) = ledger().await? else {
        return Ok(());
    };
    let existing = account(&ledger).await?;

    assert!(matches!(
        ledger
            .create_account(&existing.username, "someone-else@x.com")
            .await?,
        CreateAccountOutcome::Conflict
    ));
    let found = ledger.find_account_by_username(&existing.username).await?;
    assert_eq!(found.map(|a| a.id), Some(existing.id));
    Ok(())
}

#[tokio::test]
async fn insert_supersedes_and_rotation_chains() -> Result<()> {
    let Some(ledger) = ledger().await? else {
        return Ok(());
    };
    let account = account(&ledger).await?;

    let first = record(&account, None);
    let second = record(&account, None);
    ledger.insert(&first).await?;
    ledger.insert(&second).await?;

    let Some(stored) = ledger.find_active_by_account(account.id, Utc::now()).await? else {
        bail!("no active record");
    };
    assert_eq!(stored.id, second.id);

    let third = record(&account, Some(second.id));
    assert_eq!(ledger.rotate(second.id, &third).await?, RotateOutcome::Rotated);
    assert_eq!(
        ledger.rotate(second.id, &record(&account, Some(second.id))).await?,
        RotateOutcome::AlreadyRevoked
    );

    let chain: Vec<_> = ledger.chain(third.id).await?.iter().map(|r| r.id).collect();
    assert_eq!(chain, vec![third.id, second.id]);

    assert_eq!(ledger.conditional_revoke(third.id).await?, RevokeOutcome::Revoked);
    assert_eq!(ledger.conditional_revoke(third.id).await?, RevokeOutcome::Conflict);
    assert!(ledger
        .find_active_by_account(account.id, Utc::now())
        .await?
        .is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rotations_have_one_winner() -> Result<()> {
    let Some(ledger) = ledger().await? else {
        return Ok(());
    };
    let account = account(&ledger).await?;
    let root = record(&account, None);
    ledger.insert(&root).await?;

    let mut racers = JoinSet::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        let next = record(&account, Some(root.id));
        racers.spawn(async move { ledger.rotate(root.id, &next).await });
    }

    let mut rotated = 0;
    while let Some(joined) = racers.join_next().await {
        match joined?? {
            RotateOutcome::Rotated => rotated += 1,
            RotateOutcome::AlreadyRevoked | RotateOutcome::Contended => {}
        }
    }
    assert_eq!(rotated, 1);
    assert_eq!(ledger.revoke_account(account.id).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_rotation_is_all_or_nothing() -> Result<()> {
    let Some(ledger) = ledger().await? else {
        return Ok(());
    };

    for attempt in 0..20u64 {
        let account = account(&ledger).await?;
        let root = record(&account, None);
        ledger.insert(&root).await?;

        let next = record(&account, Some(root.id));
        let deadline = Duration::from_micros(attempt * 250);
        let _ = tokio::time::timeout(deadline, ledger.rotate(root.id, &next)).await;

        let Some(active) = ledger.find_active_by_account(account.id, Utc::now()).await? else {
            bail!("attempt {attempt}: no live record");
        };
        if active.id == next.id {
            assert_eq!(active.previous_id, Some(root.id));
        } else {
            assert_eq!(active.id, root.id, "attempt {attempt}: unexpected live record");
            assert_eq!(
                ledger.rotate(root.id, &record(&account, Some(root.id))).await?,
                RotateOutcome::Rotated
            );
        }
        assert_eq!(ledger.revoke_account(account.id).await?, 1, "attempt {attempt}");
    }
    Ok(())
}
