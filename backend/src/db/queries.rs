//! # Database Queries
//!
//! This module contains all the SQL for the wallet.
//!
//! ## Query Organization
//!
//! Queries are grouped by the table they operate on:
//! - `account_*` / `ledger_*` - Wallet state and the ledger
//! - `ad_stats` - Daily ad-watch counters
//! - `link_*` / `pending_*` / `external_*` - Identity linking
//! - `reconciliation_*` - Audit logs
//!
//! Functions taking a `&Transaction` run inside a caller-owned
//! transaction; functions taking a `&Pool` check out their own client.
//!
//! ## Error Handling
//!
//! All queries return `Result<T, DatabaseError>`.

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::{Row, Transaction};
use tracing::{debug, info};

use super::models::*;
use super::store::{AccountSnapshot, AccountWrite};
use super::DatabaseError;

// ============================================
// HELPER FUNCTIONS
// ============================================

const ACCOUNT_COLUMNS: &str =
    "id, credits, impact, completed_activities, badges, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, account_id, amount, kind, description, activity_id, \
     impact_delta, origin, metadata, created_at";

const AD_STAT_COLUMNS: &str = "account_id, stat_date, total_ads_watched, current_session_ads, \
     sessions_completed, last_session_end, points_earned, updated_at";

const LINK_CODE_COLUMNS: &str = "code, external_id, display_name, expires_at, created_at";

async fn client(pool: &Pool) -> Result<deadpool_postgres::Object, DatabaseError> {
    pool.get()
        .await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))
}

/// Helper to convert a database row to AccountRecord
fn row_to_account(row: &Row) -> AccountRecord {
    AccountRecord {
        id: row.get("id"),
        credits: row.get("credits"),
        impact: row.get("impact"),
        completed_activities: row.get("completed_activities"),
        badges: row.get("badges"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Helper to convert a database row to LedgerEntryRecord
fn row_to_entry(row: &Row) -> Result<LedgerEntryRecord, DatabaseError> {
    let kind: String = row.get("kind");
    let origin: String = row.get("origin");
    Ok(LedgerEntryRecord {
        id: row.get("id"),
        account_id: row.get("account_id"),
        amount: row.get("amount"),
        kind: kind.parse().map_err(DatabaseError::CorruptRow)?,
        description: row.get("description"),
        activity_id: row.get("activity_id"),
        impact_delta: row.get("impact_delta"),
        origin: origin.parse().map_err(DatabaseError::CorruptRow)?,
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    })
}

fn row_to_ad_stats(row: &Row) -> AdStatRecord {
    AdStatRecord {
        account_id: row.get("account_id"),
        stat_date: row.get("stat_date"),
        total_ads_watched: row.get("total_ads_watched"),
        current_session_ads: row.get("current_session_ads"),
        sessions_completed: row.get("sessions_completed"),
        last_session_end: row.get("last_session_end"),
        points_earned: row.get("points_earned"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_link_code(row: &Row) -> LinkCodeRecord {
    LinkCodeRecord {
        code: row.get("code"),
        external_id: row.get("external_id"),
        display_name: row.get("display_name"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}

fn row_to_pending_entry(row: &Row) -> PendingCreditEntry {
    PendingCreditEntry {
        id: row.get("id"),
        external_id: row.get("external_id"),
        amount: row.get("amount"),
        description: row.get("description"),
        activity_id: row.get("activity_id"),
        impact_delta: row.get("impact_delta"),
        created_at: row.get("created_at"),
        merged_at: row.get("merged_at"),
    }
}

fn row_to_external_link(row: &Row) -> ExternalLinkRecord {
    ExternalLinkRecord {
        external_id: row.get("external_id"),
        account_id: row.get("account_id"),
        display_name: row.get("display_name"),
        linked_at: row.get("linked_at"),
    }
}

// ============================================
// ACCOUNT & LEDGER QUERIES
// ============================================

/// Get an account by id.
pub async fn get_account(
    pool: &Pool,
    account_id: &str,
) -> Result<Option<AccountRecord>, DatabaseError> {
    debug!("Fetching account: {}", account_id);

    let client = client(pool).await?;
    let row = client
        .query_opt(
            &format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS),
            &[&account_id],
        )
        .await?;

    Ok(row.as_ref().map(row_to_account))
}

/// Whether an entry id is already in an account's ledger.
pub async fn ledger_entry_exists(
    pool: &Pool,
    account_id: &str,
    entry_id: &str,
) -> Result<bool, DatabaseError> {
    let client = client(pool).await?;
    let row = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM ledger_entries WHERE account_id = $1 AND id = $2)",
            &[&account_id, &entry_id],
        )
        .await?;
    Ok(row.get(0))
}

/// Load everything a plan needs, taking the account's row lock.
///
/// A missing account row is inserted first so there is something to
/// lock; the snapshot still reports it as absent. The insert only
/// survives if the transaction commits.
pub async fn load_account_snapshot(
    tx: &Transaction<'_>,
    account_id: &str,
    entry_id: &str,
    now: DateTime<Utc>,
) -> Result<AccountSnapshot, DatabaseError> {
    let inserted = tx
        .execute(
            r#"
            INSERT INTO accounts (id, credits, impact, created_at, updated_at)
            VALUES ($1, 0, 0, $2, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
            &[&account_id, &now],
        )
        .await?;

    let row = tx
        .query_one(
            &format!(
                "SELECT {} FROM accounts WHERE id = $1 FOR UPDATE",
                ACCOUNT_COLUMNS
            ),
            &[&account_id],
        )
        .await?;
    let account = if inserted == 1 {
        None
    } else {
        Some(row_to_account(&row))
    };

    let entry_exists: bool = tx
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM ledger_entries WHERE account_id = $1 AND id = $2)",
            &[&account_id, &entry_id],
        )
        .await?
        .get(0);

    let ad_stats = tx
        .query_opt(
            &format!("SELECT {} FROM ad_stats WHERE account_id = $1", AD_STAT_COLUMNS),
            &[&account_id],
        )
        .await?
        .as_ref()
        .map(row_to_ad_stats);

    Ok(AccountSnapshot {
        account_id: account_id.to_string(),
        account,
        entry_exists,
        ad_stats,
    })
}

/// Persist an applied plan: account row, ledger entry, ad stats.
pub async fn apply_account_write(
    tx: &Transaction<'_>,
    write: &AccountWrite,
) -> Result<(), DatabaseError> {
    let account = &write.account;
    tx.execute(
        r#"
        UPDATE accounts
        SET
            credits = $2,
            impact = $3,
            completed_activities = $4,
            badges = $5,
            updated_at = $6
        WHERE id = $1
        "#,
        &[
            &account.id,
            &account.credits,
            &account.impact,
            &account.completed_activities,
            &account.badges,
            &account.updated_at,
        ],
    )
    .await?;

    let entry = &write.entry;
    tx.execute(
        r#"
        INSERT INTO ledger_entries (
            id, account_id, amount, kind, description, activity_id,
            impact_delta, origin, metadata, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
        &[
            &entry.id,
            &entry.account_id,
            &entry.amount,
            &entry.kind.as_str(),
            &entry.description,
            &entry.activity_id,
            &entry.impact_delta,
            &entry.origin.as_str(),
            &entry.metadata,
            &entry.created_at,
        ],
    )
    .await?;

    if let Some(stats) = &write.ad_stats {
        tx.execute(
            r#"
            INSERT INTO ad_stats (
                account_id, stat_date, total_ads_watched, current_session_ads,
                sessions_completed, last_session_end, points_earned, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (account_id) DO UPDATE SET
                stat_date = EXCLUDED.stat_date,
                total_ads_watched = EXCLUDED.total_ads_watched,
                current_session_ads = EXCLUDED.current_session_ads,
                sessions_completed = EXCLUDED.sessions_completed,
                last_session_end = EXCLUDED.last_session_end,
                points_earned = EXCLUDED.points_earned,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &stats.account_id,
                &stats.stat_date,
                &stats.total_ads_watched,
                &stats.current_session_ads,
                &stats.sessions_completed,
                &stats.last_session_end,
                &stats.points_earned,
                &stats.updated_at,
            ],
        )
        .await?;
    }

    info!(
        "Ledger entry {} applied to {}: {} {} (balance {})",
        entry.id, account.id, entry.kind, entry.amount, account.credits
    );
    Ok(())
}

/// Get an account's most recent ledger entries.
pub async fn get_ledger_entries(
    pool: &Pool,
    account_id: &str,
    limit: i64,
) -> Result<Vec<LedgerEntryRecord>, DatabaseError> {
    debug!("Fetching ledger for account: {}", account_id);

    let client = client(pool).await?;
    let rows = client
        .query(
            &format!(
                "SELECT {} FROM ledger_entries WHERE account_id = $1 \
                 ORDER BY created_at DESC, id ASC LIMIT $2",
                ENTRY_COLUMNS
            ),
            &[&account_id, &limit],
        )
        .await?;

    rows.iter().map(row_to_entry).collect()
}

/// Get the accounts with the highest balances.
pub async fn get_top_accounts(pool: &Pool, limit: i64) -> Result<Vec<AccountRecord>, DatabaseError> {
    let client = client(pool).await?;
    let rows = client
        .query(
            &format!(
                "SELECT {} FROM accounts ORDER BY credits DESC, id ASC LIMIT $1",
                ACCOUNT_COLUMNS
            ),
            &[&limit],
        )
        .await?;

    Ok(rows.iter().map(row_to_account).collect())
}

/// Get an account's stored ad-stat row.
pub async fn get_ad_stats(
    pool: &Pool,
    account_id: &str,
) -> Result<Option<AdStatRecord>, DatabaseError> {
    let client = client(pool).await?;
    let row = client
        .query_opt(
            &format!("SELECT {} FROM ad_stats WHERE account_id = $1", AD_STAT_COLUMNS),
            &[&account_id],
        )
        .await?;
    Ok(row.as_ref().map(row_to_ad_stats))
}

// ============================================
// IDENTITY QUERIES
// ============================================

/// Store a link code, replacing any other code for the same identity.
pub async fn replace_link_code(pool: &Pool, record: &LinkCodeRecord) -> Result<(), DatabaseError> {
    let mut client = client(pool).await?;
    let tx = client.transaction().await?;

    tx.execute(
        "DELETE FROM link_codes WHERE external_id = $1",
        &[&record.external_id],
    )
    .await?;
    tx.execute(
        r#"
        INSERT INTO link_codes (code, external_id, display_name, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
        &[
            &record.code,
            &record.external_id,
            &record.display_name,
            &record.expires_at,
            &record.created_at,
        ],
    )
    .await?;

    tx.commit().await?;
    debug!("Link code issued for external identity {}", record.external_id);
    Ok(())
}

pub async fn get_link_code(
    pool: &Pool,
    code: &str,
) -> Result<Option<LinkCodeRecord>, DatabaseError> {
    let client = client(pool).await?;
    let row = client
        .query_opt(
            &format!("SELECT {} FROM link_codes WHERE code = $1", LINK_CODE_COLUMNS),
            &[&code],
        )
        .await?;
    Ok(row.as_ref().map(row_to_link_code))
}

/// Delete and return a link code bound to `external_id`.
pub async fn take_link_code(
    tx: &Transaction<'_>,
    code: &str,
    external_id: &str,
) -> Result<Option<LinkCodeRecord>, DatabaseError> {
    let row = tx
        .query_opt(
            &format!(
                "DELETE FROM link_codes WHERE code = $1 AND external_id = $2 RETURNING {}",
                LINK_CODE_COLUMNS
            ),
            &[&code, &external_id],
        )
        .await?;
    Ok(row.as_ref().map(row_to_link_code))
}

/// Serialize all identity work on one external id.
pub async fn lock_external_identity(
    tx: &Transaction<'_>,
    external_id: &str,
) -> Result<(), DatabaseError> {
    tx.execute(
        "SELECT pg_advisory_xact_lock(hashtext($1))",
        &[&external_id],
    )
    .await?;
    Ok(())
}

/// Delete the pending record and mark its unmerged entries as merged.
///
/// Returns the drained entries, oldest first.
pub async fn drain_pending_credits(
    tx: &Transaction<'_>,
    external_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<PendingCreditEntry>, DatabaseError> {
    tx.execute(
        "DELETE FROM pending_credits WHERE external_id = $1",
        &[&external_id],
    )
    .await?;

    let rows = tx
        .query(
            r#"
            UPDATE pending_credit_entries SET merged_at = $2
            WHERE external_id = $1 AND merged_at IS NULL
            RETURNING external_id, id, amount, description, activity_id,
                      impact_delta, created_at, merged_at
            "#,
            &[&external_id, &now],
        )
        .await?;

    let mut entries: Vec<PendingCreditEntry> = rows.iter().map(row_to_pending_entry).collect();
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    debug!("Drained {} pending entries for {}", entries.len(), external_id);
    Ok(entries)
}

pub async fn upsert_external_link(
    tx: &Transaction<'_>,
    external_id: &str,
    account_id: &str,
    display_name: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    tx.execute(
        r#"
        INSERT INTO external_links (external_id, account_id, display_name, linked_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (external_id) DO UPDATE SET
            account_id = EXCLUDED.account_id,
            display_name = EXCLUDED.display_name,
            linked_at = EXCLUDED.linked_at
        "#,
        &[&external_id, &account_id, &display_name, &now],
    )
    .await?;
    info!("External identity {} linked to account {}", external_id, account_id);
    Ok(())
}

pub async fn get_external_link(
    pool: &Pool,
    external_id: &str,
) -> Result<Option<ExternalLinkRecord>, DatabaseError> {
    let client = client(pool).await?;
    let row = client
        .query_opt(
            "SELECT external_id, account_id, display_name, linked_at \
             FROM external_links WHERE external_id = $1",
            &[&external_id],
        )
        .await?;
    Ok(row.as_ref().map(row_to_external_link))
}

pub async fn get_external_link_tx(
    tx: &Transaction<'_>,
    external_id: &str,
) -> Result<Option<ExternalLinkRecord>, DatabaseError> {
    let row = tx
        .query_opt(
            "SELECT external_id, account_id, display_name, linked_at \
             FROM external_links WHERE external_id = $1",
            &[&external_id],
        )
        .await?;
    Ok(row.as_ref().map(row_to_external_link))
}

pub async fn get_pending_credits(
    pool: &Pool,
    external_id: &str,
) -> Result<Option<PendingCreditRecord>, DatabaseError> {
    let client = client(pool).await?;
    let row = client
        .query_opt(
            "SELECT external_id, amount, impact, updated_at \
             FROM pending_credits WHERE external_id = $1",
            &[&external_id],
        )
        .await?;
    Ok(row.map(|r| PendingCreditRecord {
        external_id: r.get("external_id"),
        amount: r.get("amount"),
        impact: r.get("impact"),
        updated_at: r.get("updated_at"),
    }))
}

pub async fn pending_total(tx: &Transaction<'_>, external_id: &str) -> Result<i64, DatabaseError> {
    let row = tx
        .query_opt(
            "SELECT amount FROM pending_credits WHERE external_id = $1",
            &[&external_id],
        )
        .await?;
    Ok(row.map(|r| r.get::<_, i64>("amount")).unwrap_or(0))
}

pub async fn pending_entry_exists(
    tx: &Transaction<'_>,
    external_id: &str,
    entry_id: &str,
) -> Result<bool, DatabaseError> {
    let row = tx
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pending_credit_entries WHERE external_id = $1 AND id = $2)",
            &[&external_id, &entry_id],
        )
        .await?;
    Ok(row.get(0))
}

/// Any accrual of `activity_id` for this identity, merged or not.
pub async fn pending_activity_exists(
    tx: &Transaction<'_>,
    external_id: &str,
    activity_id: &str,
) -> Result<bool, DatabaseError> {
    let row = tx
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pending_credit_entries \
             WHERE external_id = $1 AND activity_id = $2)",
            &[&external_id, &activity_id],
        )
        .await?;
    Ok(row.get(0))
}

/// Record an accrual. Returns `false` when the entry id was already used.
pub async fn insert_pending_entry(
    tx: &Transaction<'_>,
    entry: &PendingCreditEntry,
) -> Result<bool, DatabaseError> {
    let inserted = tx
        .execute(
            r#"
            INSERT INTO pending_credit_entries
                (external_id, id, amount, description, activity_id, impact_delta, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_id, id) DO NOTHING
            "#,
            &[
                &entry.external_id,
                &entry.id,
                &entry.amount,
                &entry.description,
                &entry.activity_id,
                &entry.impact_delta,
                &entry.created_at,
            ],
        )
        .await?;
    Ok(inserted == 1)
}

/// Add an accrual to the pending record and return the new total.
pub async fn add_pending_credits(
    tx: &Transaction<'_>,
    entry: &PendingCreditEntry,
) -> Result<i64, DatabaseError> {
    let row = tx
        .query_one(
            r#"
            INSERT INTO pending_credits (external_id, amount, impact, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (external_id) DO UPDATE SET
                amount = pending_credits.amount + EXCLUDED.amount,
                impact = pending_credits.impact + EXCLUDED.impact,
                updated_at = EXCLUDED.updated_at
            RETURNING amount
            "#,
            &[
                &entry.external_id,
                &entry.amount,
                &entry.impact_delta,
                &entry.created_at,
            ],
        )
        .await?;
    Ok(row.get("amount"))
}

/// Delete link codes past their expiry.
pub async fn delete_expired_link_codes(
    pool: &Pool,
    now: DateTime<Utc>,
) -> Result<u64, DatabaseError> {
    let client = client(pool).await?;
    let deleted = client
        .execute("DELETE FROM link_codes WHERE expires_at <= $1", &[&now])
        .await?;
    Ok(deleted)
}

// ============================================
// RECONCILIATION QUERIES
// ============================================

/// Every account's balance next to the sum of its ledger.
pub async fn get_ledger_totals(pool: &Pool) -> Result<Vec<LedgerTotals>, DatabaseError> {
    let client = client(pool).await?;
    let rows = client
        .query(
            r#"
            SELECT
                a.id AS account_id,
                a.credits AS balance,
                COALESCE(SUM(e.amount), 0)::BIGINT AS ledger_sum
            FROM accounts a
            LEFT JOIN ledger_entries e ON e.account_id = a.id
            GROUP BY a.id, a.credits
            ORDER BY a.id
            "#,
            &[],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| LedgerTotals {
            account_id: row.get("account_id"),
            balance: row.get("balance"),
            ledger_sum: row.get("ledger_sum"),
        })
        .collect())
}

/// Log a reconciliation event.
pub async fn create_reconciliation_log(
    pool: &Pool,
    log: &ReconciliationLog,
) -> Result<(), DatabaseError> {
    let client = client(pool).await?;

    client
        .execute(
            r#"
            INSERT INTO reconciliation_logs (
                id, account_id, expected_balance, actual_balance,
                difference, notes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            &[
                &log.id,
                &log.account_id,
                &log.expected_balance,
                &log.actual_balance,
                &log.difference,
                &log.notes,
                &log.created_at,
            ],
        )
        .await?;

    debug!("Reconciliation log {} written for {}", log.id, log.account_id);
    Ok(())
}
