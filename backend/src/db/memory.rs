//! # In-Memory Store
//!
//! A `CreditStore` backed by process memory. Used by the test suite and
//! by `STORAGE_BACKEND=memory` for local runs. State is lost on restart.
//!
//! ## Locking
//!
//! ```text
//! accounts map (short-lived) ──► per-account Mutex<AccountCell>
//! identity Mutex<IdentityState>
//!
//! lock order: identity before account
//! ```
//!
//! Each account has its own mutex, so transactions on different accounts
//! run in parallel. All identity state shares one mutex.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::models::*;
use super::store::*;
use crate::services::error::WalletError;

#[derive(Debug, Default)]
struct AccountCell {
    account: Option<AccountRecord>,
    entries: Vec<LedgerEntryRecord>,
    entry_ids: HashSet<String>,
    ad_stats: Option<AdStatRecord>,
}

impl AccountCell {
    fn snapshot(&self, account_id: &str, entry_id: &str) -> AccountSnapshot {
        AccountSnapshot {
            account_id: account_id.to_string(),
            account: self.account.clone(),
            entry_exists: self.entry_ids.contains(entry_id),
            ad_stats: self.ad_stats.clone(),
        }
    }

    fn apply(&mut self, write: &AccountWrite) {
        self.account = Some(write.account.clone());
        self.entry_ids.insert(write.entry.id.clone());
        self.entries.push(write.entry.clone());
        if let Some(stats) = &write.ad_stats {
            self.ad_stats = Some(stats.clone());
        }
    }
}

#[derive(Debug, Default)]
struct IdentityState {
    link_codes: HashMap<String, LinkCodeRecord>,
    links: HashMap<String, ExternalLinkRecord>,
    pending: HashMap<String, PendingCreditRecord>,
    /// external id -> entry ids accrued while unlinked
    pending_entries: HashMap<String, HashMap<String, PendingCreditEntry>>,
}

impl IdentityState {
    fn pending_total(&self, external_id: &str) -> i64 {
        self.pending.get(external_id).map(|p| p.amount).unwrap_or(0)
    }
}

/// In-process `CreditStore`.
#[derive(Default)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<String, Arc<Mutex<AccountCell>>>>,
    identity: Mutex<IdentityState>,
    reconciliation_logs: Mutex<Vec<ReconciliationLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cell for `account_id`, created empty if missing.
    async fn cell(&self, account_id: &str) -> Arc<Mutex<AccountCell>> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }

    async fn existing_cell(&self, account_id: &str) -> Option<Arc<Mutex<AccountCell>>> {
        self.accounts.lock().await.get(account_id).cloned()
    }

    async fn all_cells(&self) -> Vec<Arc<Mutex<AccountCell>>> {
        self.accounts.lock().await.values().cloned().collect()
    }

    /// Logs written by the ledger auditor.
    pub async fn reconciliation_logs(&self) -> Vec<ReconciliationLog> {
        self.reconciliation_logs.lock().await.clone()
    }

    /// Overwrite a balance without a ledger entry.
    #[cfg(test)]
    pub async fn force_balance(&self, account_id: &str, credits: i64) {
        let cell = self.cell(account_id).await;
        let mut cell = cell.lock().await;
        let account = cell
            .account
            .get_or_insert_with(|| AccountRecord::new(account_id, Utc::now()));
        account.credits = credits;
    }
}

#[async_trait]
impl CreditStore for MemoryStore {
    async fn ping(&self) -> bool {
        true
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, WalletError> {
        match self.existing_cell(account_id).await {
            Some(cell) => Ok(cell.lock().await.account.clone()),
            None => Ok(None),
        }
    }

    async fn entry_exists(&self, account_id: &str, entry_id: &str) -> Result<bool, WalletError> {
        match self.existing_cell(account_id).await {
            Some(cell) => Ok(cell.lock().await.entry_ids.contains(entry_id)),
            None => Ok(false),
        }
    }

    async fn run_account_tx(
        &self,
        account_id: &str,
        entry_id: &str,
        plan: AccountPlan<'_>,
    ) -> Result<TxOutcome, WalletError> {
        let cell = self.cell(account_id).await;
        let mut cell = cell.lock().await;

        let snapshot = cell.snapshot(account_id, entry_id);
        match plan(&snapshot)? {
            TxDecision::Skip(reason) => Ok(TxOutcome::Skipped {
                reason,
                account: snapshot.account,
            }),
            TxDecision::Apply(write) => {
                cell.apply(&write);
                Ok(TxOutcome::Committed(write))
            }
        }
    }

    async fn get_history(
        &self,
        account_id: &str,
        limit: i64,
    ) -> Result<Vec<LedgerEntryRecord>, WalletError> {
        let Some(cell) = self.existing_cell(account_id).await else {
            return Ok(Vec::new());
        };
        let mut entries = cell.lock().await.entries.clone();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn top_accounts(&self, limit: i64) -> Result<Vec<AccountRecord>, WalletError> {
        let mut accounts = Vec::new();
        for cell in self.all_cells().await {
            if let Some(account) = cell.lock().await.account.clone() {
                accounts.push(account);
            }
        }
        accounts.sort_by(|a, b| b.credits.cmp(&a.credits).then_with(|| a.id.cmp(&b.id)));
        accounts.truncate(limit.max(0) as usize);
        Ok(accounts)
    }

    async fn get_ad_stats(&self, account_id: &str) -> Result<Option<AdStatRecord>, WalletError> {
        match self.existing_cell(account_id).await {
            Some(cell) => Ok(cell.lock().await.ad_stats.clone()),
            None => Ok(None),
        }
    }

    async fn replace_link_code(&self, record: &LinkCodeRecord) -> Result<(), WalletError> {
        let mut identity = self.identity.lock().await;
        identity
            .link_codes
            .retain(|_, code| code.external_id != record.external_id);
        identity
            .link_codes
            .insert(record.code.clone(), record.clone());
        Ok(())
    }

    async fn get_link_code(&self, code: &str) -> Result<Option<LinkCodeRecord>, WalletError> {
        Ok(self.identity.lock().await.link_codes.get(code).cloned())
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
        let mut identity = self.identity.lock().await;

        let record = match identity.link_codes.get(code) {
            Some(record) if record.external_id == external_id => record.clone(),
            _ => return Ok(ClaimOutcome::Rejected),
        };
        if record.is_expired(now) {
            identity.link_codes.remove(code);
            return Ok(ClaimOutcome::Rejected);
        }

        let mut unmerged: Vec<PendingCreditEntry> = identity
            .pending_entries
            .get(external_id)
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| e.merged_at.is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        unmerged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let claim = LinkClaim::new(external_id, &record.display_name, unmerged);

        // Run the merge plan before touching identity state so an error
        // leaves the code and pending record in place.
        let merged = if !claim.entries.is_empty() {
            let cell = self.cell(account_id).await;
            let mut cell = cell.lock().await;
            let snapshot = cell.snapshot(account_id, entry_id);
            let outcome = match plan(&claim, &snapshot)? {
                TxDecision::Skip(reason) => TxOutcome::Skipped {
                    reason,
                    account: snapshot.account,
                },
                TxDecision::Apply(write) => {
                    cell.apply(&write);
                    TxOutcome::Committed(write)
                }
            };
            Some(outcome)
        } else {
            None
        };

        identity.link_codes.remove(code);
        identity.pending.remove(external_id);
        if let Some(entries) = identity.pending_entries.get_mut(external_id) {
            for drained in &claim.entries {
                if let Some(entry) = entries.get_mut(&drained.id) {
                    entry.merged_at = Some(now);
                }
            }
        }
        identity.links.insert(
            external_id.to_string(),
            ExternalLinkRecord {
                external_id: external_id.to_string(),
                account_id: account_id.to_string(),
                display_name: record.display_name,
                linked_at: now,
            },
        );
        debug!("External identity {} linked to account {}", external_id, account_id);

        Ok(ClaimOutcome::Linked { claim, merged })
    }

    async fn get_external_link(
        &self,
        external_id: &str,
    ) -> Result<Option<ExternalLinkRecord>, WalletError> {
        Ok(self.identity.lock().await.links.get(external_id).cloned())
    }

    async fn get_pending(
        &self,
        external_id: &str,
    ) -> Result<Option<PendingCreditRecord>, WalletError> {
        Ok(self.identity.lock().await.pending.get(external_id).cloned())
    }

    async fn resolve_or_accrue(
        &self,
        external_id: &str,
        entry_id: &str,
        accrual: Option<&PendingCreditEntry>,
    ) -> Result<ExternalResolution, WalletError> {
        let mut identity = self.identity.lock().await;

        let already_pending = identity
            .pending_entries
            .get(external_id)
            .is_some_and(|entries| entries.contains_key(entry_id));

        if let Some(link) = identity.links.get(external_id) {
            return Ok(ExternalResolution::Linked {
                account_id: link.account_id.clone(),
                already_pending,
            });
        }

        let Some(entry) = accrual else {
            return Ok(ExternalResolution::NotLinked {
                pending_total: identity.pending_total(external_id),
            });
        };
        if already_pending {
            return Ok(ExternalResolution::DuplicatePending {
                pending_total: identity.pending_total(external_id),
            });
        }
        if let Some(activity) = entry.activity_id.as_deref() {
            let seen = identity.pending_entries.get(external_id).is_some_and(|entries| {
                entries
                    .values()
                    .any(|e| e.activity_id.as_deref() == Some(activity))
            });
            if seen {
                return Ok(ExternalResolution::ActivityPending {
                    pending_total: identity.pending_total(external_id),
                });
            }
        }

        identity
            .pending_entries
            .entry(external_id.to_string())
            .or_default()
            .insert(entry.id.clone(), entry.clone());
        let pending = identity
            .pending
            .entry(external_id.to_string())
            .or_insert_with(|| PendingCreditRecord {
                external_id: external_id.to_string(),
                amount: 0,
                impact: 0.0,
                updated_at: entry.created_at,
            });
        pending.amount += entry.amount;
        pending.impact += entry.impact_delta;
        pending.updated_at = entry.created_at;

        Ok(ExternalResolution::Accrued {
            pending_total: pending.amount,
        })
    }

    async fn delete_expired_link_codes(&self, now: DateTime<Utc>) -> Result<u64, WalletError> {
        let mut identity = self.identity.lock().await;
        let before = identity.link_codes.len();
        identity.link_codes.retain(|_, code| !code.is_expired(now));
        Ok((before - identity.link_codes.len()) as u64)
    }

    async fn ledger_totals(&self) -> Result<Vec<LedgerTotals>, WalletError> {
        let mut totals = Vec::new();
        for cell in self.all_cells().await {
            let cell = cell.lock().await;
            if let Some(account) = &cell.account {
                totals.push(LedgerTotals {
                    account_id: account.id.clone(),
                    balance: account.credits,
                    ledger_sum: cell.entries.iter().map(|e| e.amount).sum(),
                });
            }
        }
        totals.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(totals)
    }

    async fn record_reconciliation(&self, log: &ReconciliationLog) -> Result<(), WalletError> {
        self.reconciliation_logs.lock().await.push(log.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::error::SkipReason;
    use chrono::Duration;

    fn entry(account_id: &str, id: &str, amount: i64) -> LedgerEntryRecord {
        LedgerEntryRecord {
            id: id.to_string(),
            account_id: account_id.to_string(),
            amount,
            kind: EntryKind::Earn,
            description: "test".to_string(),
            activity_id: None,
            impact_delta: 0.0,
            origin: Origin::Web,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    fn credit(amount: i64) -> impl Fn(&AccountSnapshot) -> Result<TxDecision, WalletError> {
        move |snapshot: &AccountSnapshot| {
            if snapshot.entry_exists {
                return Ok(TxDecision::Skip(SkipReason::Duplicate));
            }
            let mut account = snapshot
                .account
                .clone()
                .unwrap_or_else(|| AccountRecord::new(&snapshot.account_id, Utc::now()));
            account.credits += amount;
            Ok(TxDecision::Apply(AccountWrite {
                account,
                entry: entry(&snapshot.account_id, "e1", amount),
                ad_stats: None,
                new_badges: Vec::new(),
            }))
        }
    }

    #[tokio::test]
    async fn test_account_tx_applies_once() {
        let store = MemoryStore::new();
        let plan = credit(10);

        let first = store.run_account_tx("acct1", "e1", &plan).await.unwrap();
        assert!(matches!(first, TxOutcome::Committed(_)));

        let second = store.run_account_tx("acct1", "e1", &plan).await.unwrap();
        assert!(matches!(
            second,
            TxOutcome::Skipped { reason: SkipReason::Duplicate, .. }
        ));

        let account = store.get_account("acct1").await.unwrap().unwrap();
        assert_eq!(account.credits, 10);
        assert!(store.entry_exists("acct1", "e1").await.unwrap());
        assert_eq!(store.get_history("acct1", 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_plan_leaves_no_account() {
        let store = MemoryStore::new();
        let plan = |_: &AccountSnapshot| -> Result<TxDecision, WalletError> {
            Err(WalletError::invalid("nope"))
        };

        let result = store.run_account_tx("ghost", "e1", &plan).await;
        assert!(result.is_err());
        assert!(store.get_account("ghost").await.unwrap().is_none());
        assert!(store.top_accounts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_link_code_keeps_one_per_identity() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for code in ["AAAAAA", "BBBBBB"] {
            store
                .replace_link_code(&LinkCodeRecord {
                    code: code.to_string(),
                    external_id: "tg1".to_string(),
                    display_name: "Alice".to_string(),
                    expires_at: now + Duration::minutes(10),
                    created_at: now,
                })
                .await
                .unwrap();
        }

        assert!(store.get_link_code("AAAAAA").await.unwrap().is_none());
        assert!(store.get_link_code("BBBBBB").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_accrual_is_deduplicated() {
        let store = MemoryStore::new();
        let accrual = PendingCreditEntry {
            id: "p1".to_string(),
            external_id: "tg1".to_string(),
            amount: 15,
            description: "scan".to_string(),
            activity_id: Some("quiz-1".to_string()),
            impact_delta: 1.5,
            created_at: Utc::now(),
            merged_at: None,
        };

        let first = store.resolve_or_accrue("tg1", "p1", Some(&accrual)).await.unwrap();
        assert_eq!(first, ExternalResolution::Accrued { pending_total: 15 });

        let second = store.resolve_or_accrue("tg1", "p1", Some(&accrual)).await.unwrap();
        assert_eq!(second, ExternalResolution::DuplicatePending { pending_total: 15 });

        let same_activity = PendingCreditEntry {
            id: "p2".to_string(),
            ..accrual.clone()
        };
        let third = store
            .resolve_or_accrue("tg1", "p2", Some(&same_activity))
            .await
            .unwrap();
        assert_eq!(third, ExternalResolution::ActivityPending { pending_total: 15 });

        let pending = store.get_pending("tg1").await.unwrap().unwrap();
        assert_eq!(pending.amount, 15);
        assert_eq!(pending.impact, 1.5);
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired_codes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (code, external, ttl) in [("OLD111", "tg1", -1), ("NEW222", "tg2", 10)] {
            store
                .replace_link_code(&LinkCodeRecord {
                    code: code.to_string(),
                    external_id: external.to_string(),
                    display_name: String::new(),
                    expires_at: now + Duration::minutes(ttl),
                    created_at: now,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.delete_expired_link_codes(now).await.unwrap(), 1);
        assert!(store.get_link_code("NEW222").await.unwrap().is_some());
    }
}
