//! # Ledger Auditor Service
//!
//! Background housekeeping for the wallet:
//!
//! ```text
//! LedgerAuditor (background task)
//!              │
//!              ├── Every RECONCILIATION_INTERVAL: balance vs SUM(ledger)
//!              │
//!              └── Every LINK_SWEEP_INTERVAL: delete expired link codes
//! ```
//!
//! ## Reconciliation
//!
//! Every balance change goes through a ledger entry in the same
//! transaction, so `credits == SUM(amount)` must hold for every account.
//! A mismatch means something wrote around the engine. It is logged and
//! recorded in `reconciliation_logs`; the balance is left alone for a
//! human to inspect.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{CreditStore, ReconciliationLog};

use super::error::WalletError;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub accounts_checked: usize,
    pub discrepancies: usize,
}

/// The Ledger Auditor service.
///
/// ## Usage
///
/// ```rust,ignore
/// let auditor = LedgerAuditor::new(store, config);
///
/// // Start auditing (runs forever)
/// tokio::spawn(async move {
///     auditor.start().await;
/// });
/// ```
#[derive(Clone)]
pub struct LedgerAuditor {
    store: Arc<dyn CreditStore>,
    config: AppConfig,
}

impl LedgerAuditor {
    pub fn new(store: Arc<dyn CreditStore>, config: AppConfig) -> Self {
        Self { store, config }
    }

    /// Start the audit loop.
    ///
    /// | Check | Interval |
    /// |-------|----------|
    /// | Reconciliation | `RECONCILIATION_INTERVAL` (default: 300s) |
    /// | Link code sweep | `LINK_SWEEP_INTERVAL` (default: 60s) |
    pub async fn start(&self) {
        info!(
            "Starting ledger auditor (reconcile every {}s, sweep every {}s)",
            self.config.reconciliation_interval, self.config.link_sweep_interval
        );

        let mut reconcile_ticker =
            interval(Duration::from_secs(self.config.reconciliation_interval.max(1)));
        let mut sweep_ticker = interval(Duration::from_secs(self.config.link_sweep_interval.max(1)));

        loop {
            tokio::select! {
                _ = reconcile_ticker.tick() => {
                    if let Err(e) = self.reconcile_all().await {
                        error!("Reconciliation failed: {}", e);
                    }
                }

                _ = sweep_ticker.tick() => {
                    if let Err(e) = self.sweep_link_codes(Utc::now()).await {
                        error!("Link code sweep failed: {}", e);
                    }
                }
            }
        }
    }

    /// Compare every account's balance with its ledger sum.
    pub async fn reconcile_all(&self) -> Result<AuditReport, WalletError> {
        debug!("Starting ledger reconciliation");

        let totals = self.store.ledger_totals().await?;
        let mut report = AuditReport {
            accounts_checked: totals.len(),
            discrepancies: 0,
        };

        for total in totals {
            let difference = total.balance - total.ledger_sum;
            if difference == 0 {
                continue;
            }

            error!(
                "Balance discrepancy for {}: balance={}, ledger={}, diff={}",
                total.account_id, total.balance, total.ledger_sum, difference
            );
            report.discrepancies += 1;

            let log = ReconciliationLog {
                id: Uuid::new_v4(),
                account_id: total.account_id.clone(),
                expected_balance: total.ledger_sum,
                actual_balance: total.balance,
                difference,
                notes: Some("Balance left unchanged pending review".to_string()),
                created_at: Utc::now(),
            };
            self.store.record_reconciliation(&log).await?;
        }

        info!(
            "Reconciliation complete: checked {} accounts, found {} discrepancies",
            report.accounts_checked, report.discrepancies
        );
        Ok(report)
    }

    /// Delete link codes that expired before `now`.
    pub async fn sweep_link_codes(&self, now: DateTime<Utc>) -> Result<u64, WalletError> {
        let deleted = self.store.delete_expired_link_codes(now).await?;
        if deleted > 0 {
            info!("Swept {} expired link codes", deleted);
        }
        Ok(deleted)
    }
}
