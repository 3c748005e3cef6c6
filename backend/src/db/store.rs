//! # Credit Store
//!
//! The storage seam of the wallet. Business rules never live here:
//! the engine passes a *plan* closure, the store runs it against a
//! snapshot loaded inside its transaction and persists whatever the
//! plan decides.
//!
//! ## Account Transaction
//!
//! ```text
//! BEGIN
//!   INSERT account row if missing      (rolled back unless committed)
//!   SELECT account ... FOR UPDATE      (serializes per account)
//!   entry id already in ledger?
//!   SELECT ad_stats row
//!        │
//!        ▼
//!   plan(snapshot) ──► Skip(reason) ──► ROLLBACK
//!        │
//!        ├─────────► Err(e) ──────────► ROLLBACK, return e
//!        ▼
//!   Apply(write): UPDATE account, INSERT entry, UPSERT ad_stats
//! COMMIT
//! ```
//!
//! Write conflicts are retried up to `max_retries` times, so a plan
//! may run more than once. Plans must be pure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::models::*;
use super::queries;
use super::{Database, DatabaseError};
use crate::services::error::{SkipReason, WalletError};

/// State visible to a plan inside an account transaction.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub account_id: String,

    /// `None` when the account has never been written.
    pub account: Option<AccountRecord>,

    /// Whether the ledger already holds the transaction's entry id.
    pub entry_exists: bool,

    /// Stored ad-stat row, whatever its date.
    pub ad_stats: Option<AdStatRecord>,
}

/// Everything an applied plan persists.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountWrite {
    /// Full new account state.
    pub account: AccountRecord,

    pub entry: LedgerEntryRecord,

    /// Ad-stat row to upsert, when the action was an ad watch.
    pub ad_stats: Option<AdStatRecord>,

    /// Badges added by this write.
    pub new_badges: Vec<String>,
}

/// What a plan decided.
#[derive(Debug, Clone, PartialEq)]
pub enum TxDecision {
    Skip(SkipReason),
    Apply(AccountWrite),
}

/// What the store did.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome {
    /// Nothing written; the account as it was read.
    Skipped {
        reason: SkipReason,
        account: Option<AccountRecord>,
    },
    /// The write was committed.
    Committed(AccountWrite),
}

/// Pure decision function run inside an account transaction.
pub type AccountPlan<'a> =
    &'a (dyn Fn(&AccountSnapshot) -> Result<TxDecision, WalletError> + Send + Sync);

/// A consumed link code and the pending credits drained with it.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkClaim {
    pub external_id: String,
    pub display_name: String,
    pub pending_amount: i64,
    /// Unmerged accruals, oldest first.
    pub entries: Vec<PendingCreditEntry>,
}

impl LinkClaim {
    pub fn new(external_id: &str, display_name: &str, entries: Vec<PendingCreditEntry>) -> Self {
        Self {
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            pending_amount: entries.iter().map(|e| e.amount).sum(),
            entries,
        }
    }
}

/// Plan for the merge entry of a link claim.
pub type ClaimPlan<'a> =
    &'a (dyn Fn(&LinkClaim, &AccountSnapshot) -> Result<TxDecision, WalletError> + Send + Sync);

/// Result of a link claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Code missing, already used, bound to another identity, or expired.
    Rejected,
    /// Link written. `merged` is `None` when nothing was pending.
    Linked {
        claim: LinkClaim,
        merged: Option<TxOutcome>,
    },
}

/// How an external identity resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalResolution {
    /// Linked; `already_pending` is true when the entry id was
    /// credited to the pending ledger before the link.
    Linked {
        account_id: String,
        already_pending: bool,
    },
    /// Unlinked and the accrual was recorded.
    Accrued { pending_total: i64 },
    /// Unlinked and the accrual was already recorded.
    DuplicatePending { pending_total: i64 },
    /// Unlinked and the activity already has an accrual under another key.
    ActivityPending { pending_total: i64 },
    /// Unlinked and nothing was accrued.
    NotLinked { pending_total: i64 },
}

/// Storage operations used by the wallet services.
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Storage is reachable.
    async fn ping(&self) -> bool;

    // ----- accounts & ledger -----

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, WalletError>;

    /// Fast, lock-free duplicate pre-check.
    async fn entry_exists(&self, account_id: &str, entry_id: &str) -> Result<bool, WalletError>;

    /// Run `plan` atomically against one account.
    async fn run_account_tx(
        &self,
        account_id: &str,
        entry_id: &str,
        plan: AccountPlan<'_>,
    ) -> Result<TxOutcome, WalletError>;

    /// Newest first.
    async fn get_history(
        &self,
        account_id: &str,
        limit: i64,
    ) -> Result<Vec<LedgerEntryRecord>, WalletError>;

    /// Highest balance first, ties by account id.
    async fn top_accounts(&self, limit: i64) -> Result<Vec<AccountRecord>, WalletError>;

    async fn get_ad_stats(&self, account_id: &str) -> Result<Option<AdStatRecord>, WalletError>;

    // ----- identity -----

    /// Store `record`, dropping any other code of the same identity.
    async fn replace_link_code(&self, record: &LinkCodeRecord) -> Result<(), WalletError>;

    async fn get_link_code(&self, code: &str) -> Result<Option<LinkCodeRecord>, WalletError>;

    /// Consume `code` for `account_id`, move pending credits and write
    /// the link in one transaction. The merge entry uses `entry_id`.
    async fn claim_link_code(
        &self,
        code: &str,
        external_id: &str,
        account_id: &str,
        entry_id: &str,
        now: DateTime<Utc>,
        plan: ClaimPlan<'_>,
    ) -> Result<ClaimOutcome, WalletError>;

    async fn get_external_link(
        &self,
        external_id: &str,
    ) -> Result<Option<ExternalLinkRecord>, WalletError>;

    async fn get_pending(&self, external_id: &str)
        -> Result<Option<PendingCreditRecord>, WalletError>;

    /// Resolve an external identity and, when unlinked, record
    /// `accrual` in the pending ledger.
    async fn resolve_or_accrue(
        &self,
        external_id: &str,
        entry_id: &str,
        accrual: Option<&PendingCreditEntry>,
    ) -> Result<ExternalResolution, WalletError>;

    // ----- maintenance -----

    async fn delete_expired_link_codes(&self, now: DateTime<Utc>) -> Result<u64, WalletError>;

    async fn ledger_totals(&self) -> Result<Vec<LedgerTotals>, WalletError>;

    async fn record_reconciliation(&self, log: &ReconciliationLog) -> Result<(), WalletError>;
}

/// Failure inside one transaction attempt.
enum AttemptError {
    Db(DatabaseError),
    Wallet(WalletError),
}

impl From<DatabaseError> for AttemptError {
    fn from(e: DatabaseError) -> Self {
        AttemptError::Db(e)
    }
}

impl From<tokio_postgres::Error> for AttemptError {
    fn from(e: tokio_postgres::Error) -> Self {
        AttemptError::Db(DatabaseError::QueryError(e))
    }
}

impl Database {
    async fn backoff(&self, attempt: u32, what: &str, e: &DatabaseError) {
        warn!(
            "{} conflicted (attempt {}/{}): {}",
            what,
            attempt,
            self.max_retries(),
            e
        );
        tokio::time::sleep(std::time::Duration::from_millis(20 * u64::from(attempt))).await;
    }

    async fn account_tx_attempt(
        &self,
        account_id: &str,
        entry_id: &str,
        plan: AccountPlan<'_>,
    ) -> Result<TxOutcome, AttemptError> {
        let mut client = self
            .pool()
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;
        let tx = client.transaction().await?;

        let snapshot = queries::load_account_snapshot(&tx, account_id, entry_id, Utc::now()).await?;

        match plan(&snapshot) {
            Err(e) => {
                tx.rollback().await?;
                Err(AttemptError::Wallet(e))
            }
            Ok(TxDecision::Skip(reason)) => {
                tx.rollback().await?;
                Ok(TxOutcome::Skipped {
                    reason,
                    account: snapshot.account,
                })
            }
            Ok(TxDecision::Apply(write)) => {
                queries::apply_account_write(&tx, &write).await?;
                tx.commit().await?;
                Ok(TxOutcome::Committed(write))
            }
        }
    }

    async fn claim_attempt(
        &self,
        code: &str,
        external_id: &str,
        account_id: &str,
        entry_id: &str,
        now: DateTime<Utc>,
        plan: ClaimPlan<'_>,
    ) -> Result<ClaimOutcome, AttemptError> {
        let mut client = self
            .pool()
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;
        let tx = client.transaction().await?;

        // The row lock taken by DELETE makes the code single-use
        let consumed = match queries::take_link_code(&tx, code, external_id).await? {
            Some(record) => record,
            None => {
                tx.rollback().await?;
                return Ok(ClaimOutcome::Rejected);
            }
        };
        if consumed.is_expired(now) {
            // Keep the deletion: an expired code is dead either way
            tx.commit().await?;
            return Ok(ClaimOutcome::Rejected);
        }

        queries::lock_external_identity(&tx, external_id).await?;
        let entries = queries::drain_pending_credits(&tx, external_id, now).await?;
        queries::upsert_external_link(&tx, external_id, account_id, &consumed.display_name, now)
            .await?;

        let claim = LinkClaim::new(external_id, &consumed.display_name, entries);

        if claim.entries.is_empty() {
            tx.commit().await?;
            return Ok(ClaimOutcome::Linked { claim, merged: None });
        }

        let snapshot = queries::load_account_snapshot(&tx, account_id, entry_id, now).await?;
        let merged = match plan(&claim, &snapshot) {
            Err(e) => {
                tx.rollback().await?;
                return Err(AttemptError::Wallet(e));
            }
            Ok(TxDecision::Skip(reason)) => TxOutcome::Skipped {
                reason,
                account: snapshot.account,
            },
            Ok(TxDecision::Apply(write)) => {
                queries::apply_account_write(&tx, &write).await?;
                TxOutcome::Committed(write)
            }
        };

        tx.commit().await?;
        Ok(ClaimOutcome::Linked {
            claim,
            merged: Some(merged),
        })
    }

    async fn resolve_attempt(
        &self,
        external_id: &str,
        entry_id: &str,
        accrual: Option<&PendingCreditEntry>,
    ) -> Result<ExternalResolution, AttemptError> {
        let mut client = self
            .pool()
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;
        let tx = client.transaction().await?;

        queries::lock_external_identity(&tx, external_id).await?;

        if let Some(link) = queries::get_external_link_tx(&tx, external_id).await? {
            let already_pending = queries::pending_entry_exists(&tx, external_id, entry_id).await?;
            tx.commit().await?;
            return Ok(ExternalResolution::Linked {
                account_id: link.account_id,
                already_pending,
            });
        }

        let resolution = match accrual {
            None => ExternalResolution::NotLinked {
                pending_total: queries::pending_total(&tx, external_id).await?,
            },
            Some(entry) => {
                let activity_pending = match entry.activity_id.as_deref() {
                    Some(activity) => {
                        queries::pending_activity_exists(&tx, external_id, activity).await?
                    }
                    None => false,
                };
                if queries::pending_entry_exists(&tx, external_id, &entry.id).await? {
                    ExternalResolution::DuplicatePending {
                        pending_total: queries::pending_total(&tx, external_id).await?,
                    }
                } else if activity_pending {
                    ExternalResolution::ActivityPending {
                        pending_total: queries::pending_total(&tx, external_id).await?,
                    }
                } else if queries::insert_pending_entry(&tx, entry).await? {
                    ExternalResolution::Accrued {
                        pending_total: queries::add_pending_credits(&tx, entry).await?,
                    }
                } else {
                    ExternalResolution::DuplicatePending {
                        pending_total: queries::pending_total(&tx, external_id).await?,
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(resolution)
    }
}

#[async_trait]
impl CreditStore for Database {
    async fn ping(&self) -> bool {
        match self.pool().get().await {
            Ok(client) => client.query("SELECT 1", &[]).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, WalletError> {
        Ok(queries::get_account(self.pool(), account_id).await?)
    }

    async fn entry_exists(&self, account_id: &str, entry_id: &str) -> Result<bool, WalletError> {
        Ok(queries::ledger_entry_exists(self.pool(), account_id, entry_id).await?)
    }

    async fn run_account_tx(
        &self,
        account_id: &str,
        entry_id: &str,
        plan: AccountPlan<'_>,
    ) -> Result<TxOutcome, WalletError> {
        let mut attempt = 1;
        loop {
            match self.account_tx_attempt(account_id, entry_id, plan).await {
                Ok(outcome) => return Ok(outcome),
                Err(AttemptError::Wallet(e)) => return Err(e),
                Err(AttemptError::Db(e)) if e.is_retryable() && attempt < self.max_retries() => {
                    self.backoff(attempt, "account transaction", &e).await;
                    attempt += 1;
                }
                Err(AttemptError::Db(e)) => return Err(e.into()),
            }
        }
    }

    async fn get_history(
        &self,
        account_id: &str,
        limit: i64,
    ) -> Result<Vec<LedgerEntryRecord>, WalletError> {
        Ok(queries::get_ledger_entries(self.pool(), account_id, limit).await?)
    }

    async fn top_accounts(&self, limit: i64) -> Result<Vec<AccountRecord>, WalletError> {
        Ok(queries::get_top_accounts(self.pool(), limit).await?)
    }

    async fn get_ad_stats(&self, account_id: &str) -> Result<Option<AdStatRecord>, WalletError> {
        Ok(queries::get_ad_stats(self.pool(), account_id).await?)
    }

    async fn replace_link_code(&self, record: &LinkCodeRecord) -> Result<(), WalletError> {
        let mut attempt = 1;
        loop {
            match queries::replace_link_code(self.pool(), record).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.max_retries() => {
                    self.backoff(attempt, "link code replacement", &e).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn get_link_code(&self, code: &str) -> Result<Option<LinkCodeRecord>, WalletError> {
        Ok(queries::get_link_code(self.pool(), code).await?)
    }

    async fn claim_link_code(
        &self,
        code: &str,
        external_id: &str,
        account_id: &str,
        entry_id: &str,
        now: DateTime<Utc>,
        plan: ClaimPlan<'_>,
    ) -> Result<ClaimOutcome, WalletError> {
        let mut attempt = 1;
        loop {
            match self
                .claim_attempt(code, external_id, account_id, entry_id, now, plan)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(AttemptError::Wallet(e)) => return Err(e),
                Err(AttemptError::Db(e)) if e.is_retryable() && attempt < self.max_retries() => {
                    self.backoff(attempt, "link claim", &e).await;
                    attempt += 1;
                }
                Err(AttemptError::Db(e)) => return Err(e.into()),
            }
        }
    }

    async fn get_external_link(
        &self,
        external_id: &str,
    ) -> Result<Option<ExternalLinkRecord>, WalletError> {
        Ok(queries::get_external_link(self.pool(), external_id).await?)
    }

    async fn get_pending(
        &self,
        external_id: &str,
    ) -> Result<Option<PendingCreditRecord>, WalletError> {
        Ok(queries::get_pending_credits(self.pool(), external_id).await?)
    }

    async fn resolve_or_accrue(
        &self,
        external_id: &str,
        entry_id: &str,
        accrual: Option<&PendingCreditEntry>,
    ) -> Result<ExternalResolution, WalletError> {
        let mut attempt = 1;
        loop {
            match self.resolve_attempt(external_id, entry_id, accrual).await {
                Ok(resolution) => return Ok(resolution),
                Err(AttemptError::Wallet(e)) => return Err(e),
                Err(AttemptError::Db(e)) if e.is_retryable() && attempt < self.max_retries() => {
                    self.backoff(attempt, "external resolution", &e).await;
                    attempt += 1;
                }
                Err(AttemptError::Db(e)) => return Err(e.into()),
            }
        }
    }

    async fn delete_expired_link_codes(&self, now: DateTime<Utc>) -> Result<u64, WalletError> {
        let deleted = queries::delete_expired_link_codes(self.pool(), now).await?;
        debug!("Deleted {} expired link codes", deleted);
        Ok(deleted)
    }

    async fn ledger_totals(&self) -> Result<Vec<LedgerTotals>, WalletError> {
        Ok(queries::get_ledger_totals(self.pool()).await?)
    }

    async fn record_reconciliation(&self, log: &ReconciliationLog) -> Result<(), WalletError> {
        queries::create_reconciliation_log(self.pool(), log).await?;
        Ok(())
    }
}
