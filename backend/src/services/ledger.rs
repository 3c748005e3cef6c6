//! # Wallet Engine
//!
//! The WalletEngine is the central service for balance-affecting
//! operations. It owns every business rule of an award or redemption and
//! hands the store a pure plan to run inside the account's transaction.
//!
//! ## Flow Example: Award
//!
//! ```text
//! 1. Caller sends award(accountId, ..., idempotencyKey)
//!                ↓
//! 2. entry id = sha256(idempotencyKey)
//!                ↓
//! 3. Pre-check: entry already in ledger? ──yes──► duplicate, no write
//!                ↓
//! 4. Account transaction (row lock)
//!      a. entry exists?             → Skip(duplicate)
//!      b. activity already done?    → Skip(activity_completed)
//!      c. ad watch? limiter decides the amount or rejects
//!      d. balance, impact, activities, badges, entry, ad stats
//!                ↓
//! 5. Commit, return the new wallet
//! ```
//!
//! The pre-check only saves a transaction for the common retry case.
//! The check inside the transaction is the one that holds under races.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::store::{AccountSnapshot, AccountWrite, TxDecision, TxOutcome};
use crate::db::{
    AccountRecord, AdStatRecord, CreditStore, EntryKind, LedgerEntryRecord, Origin,
};
use crate::utils::{derive_entry_id, reference_date, truncate_string, validate_id};

use super::ad_limiter::{self, AdPolicy};
use super::badges;
use super::error::{Reason, SkipReason, WalletError};

/// How the award amount is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// The caller's amount is used as is.
    #[default]
    Standard,
    /// The ad-watch limiter decides the amount.
    AdWatch,
}

/// A validated award.
#[derive(Debug, Clone, PartialEq)]
pub struct AwardCommand {
    pub account_id: String,

    /// Ignored for ad watches.
    pub amount: i64,

    pub description: String,
    pub activity_id: Option<String>,
    pub impact_delta: f64,
    pub origin: Origin,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
    pub action_kind: ActionKind,
}

/// A validated redemption. `amount` is negative.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeemCommand {
    pub account_id: String,
    pub amount: i64,
    pub description: String,
    pub origin: Origin,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
}

/// Result of an award or redemption.
#[derive(Debug, Clone, PartialEq)]
pub struct AwardOutcome {
    /// `true` when nothing was written.
    pub duplicate: bool,

    /// Why nothing was written.
    pub skip_reason: Option<SkipReason>,

    /// Wallet after the call.
    pub account: AccountRecord,

    /// The created entry, absent for duplicates.
    pub entry: Option<LedgerEntryRecord>,

    pub new_badges: Vec<String>,

    /// Ad-stat record after an ad watch.
    pub ad_stats: Option<AdStatRecord>,
}

impl AwardOutcome {
    fn skipped(reason: SkipReason, account: AccountRecord) -> Self {
        Self {
            duplicate: true,
            skip_reason: Some(reason),
            account,
            entry: None,
            new_badges: Vec::new(),
            ad_stats: None,
        }
    }

    pub(crate) fn from_tx(outcome: TxOutcome, account_id: &str, now: DateTime<Utc>) -> Self {
        match outcome {
            TxOutcome::Skipped { reason, account } => Self::skipped(
                reason,
                account.unwrap_or_else(|| AccountRecord::new(account_id, now)),
            ),
            TxOutcome::Committed(write) => Self {
                duplicate: false,
                skip_reason: None,
                account: write.account,
                entry: Some(write.entry),
                new_badges: write.new_badges,
                ad_stats: write.ad_stats,
            },
        }
    }

    /// Amount actually credited or debited by this call.
    pub fn applied_amount(&self) -> i64 {
        self.entry.as_ref().map(|e| e.amount).unwrap_or(0)
    }
}

/// The wallet service.
///
/// ## Usage
///
/// ```rust,ignore
/// let engine = WalletEngine::new(store, config);
/// let outcome = engine.award(command).await?;
/// println!("Balance: {}", outcome.account.credits);
/// ```
#[derive(Clone)]
pub struct WalletEngine {
    store: Arc<dyn CreditStore>,
    config: AppConfig,
}

impl WalletEngine {
    pub fn new(store: Arc<dyn CreditStore>, config: AppConfig) -> Self {
        Self { store, config }
    }

    // ==========================================
    // READS
    // ==========================================

    /// Current wallet. Unknown accounts read as an empty wallet.
    pub async fn get_balance(&self, account_id: &str) -> Result<AccountRecord, WalletError> {
        validate_id("accountId", account_id).map_err(WalletError::InvalidArgument)?;
        debug!("Fetching wallet: {}", account_id);

        Ok(self
            .store
            .get_account(account_id)
            .await?
            .unwrap_or_else(|| AccountRecord::new(account_id, Utc::now())))
    }

    // ==========================================
    // MUTATIONS
    // ==========================================

    /// Award credits exactly once per idempotency key.
    pub async fn award(&self, command: AwardCommand) -> Result<AwardOutcome, WalletError> {
        self.award_at(command, Utc::now()).await
    }

    /// [`award`](Self::award) with an explicit clock.
    pub async fn award_at(
        &self,
        command: AwardCommand,
        now: DateTime<Utc>,
    ) -> Result<AwardOutcome, WalletError> {
        validate_award(&command)?;
        let entry_id = derive_entry_id(&command.idempotency_key);

        if let Some(outcome) = self
            .precheck(&command.account_id, &entry_id, now)
            .await?
        {
            return Ok(outcome);
        }

        let today = reference_date(now, &self.config.reference_offset);
        let policy = &self.config.ad_policy;
        let plan = |snapshot: &AccountSnapshot| {
            plan_award(&command, &entry_id, today, now, policy, snapshot)
        };

        let result = self
            .store
            .run_account_tx(&command.account_id, &entry_id, &plan)
            .await;
        let outcome = self.finish(result, &command.account_id, &entry_id, now)?;

        if let Some(entry) = &outcome.entry {
            info!(
                "Awarded {} credits to {} ({:?}, origin {}), balance {}",
                entry.amount,
                command.account_id,
                command.action_kind,
                command.origin,
                outcome.account.credits
            );
        }
        Ok(outcome)
    }

    /// Debit credits. The balance never goes below zero.
    pub async fn redeem(&self, command: RedeemCommand) -> Result<AwardOutcome, WalletError> {
        self.redeem_at(command, Utc::now()).await
    }

    /// [`redeem`](Self::redeem) with an explicit clock.
    pub async fn redeem_at(
        &self,
        command: RedeemCommand,
        now: DateTime<Utc>,
    ) -> Result<AwardOutcome, WalletError> {
        validate_redeem(&command)?;
        let entry_id = derive_entry_id(&command.idempotency_key);

        if let Some(outcome) = self
            .precheck(&command.account_id, &entry_id, now)
            .await?
        {
            return Ok(outcome);
        }

        let plan = |snapshot: &AccountSnapshot| plan_redeem(&command, &entry_id, now, snapshot);
        let result = self
            .store
            .run_account_tx(&command.account_id, &entry_id, &plan)
            .await;
        let outcome = self.finish(result, &command.account_id, &entry_id, now)?;

        if outcome.entry.is_some() {
            info!(
                "Redeemed {} credits from {}, balance {}",
                -command.amount, command.account_id, outcome.account.credits
            );
        }
        Ok(outcome)
    }

    /// Lock-free duplicate check before opening a transaction.
    async fn precheck(
        &self,
        account_id: &str,
        entry_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AwardOutcome>, WalletError> {
        if !self.store.entry_exists(account_id, entry_id).await? {
            return Ok(None);
        }
        debug!(
            "Duplicate entry {} for {} (pre-check)",
            truncate_string(entry_id, 19),
            account_id
        );
        let account = self
            .store
            .get_account(account_id)
            .await?
            .unwrap_or_else(|| AccountRecord::new(account_id, now));
        Ok(Some(AwardOutcome::skipped(SkipReason::Duplicate, account)))
    }

    fn finish(
        &self,
        result: Result<TxOutcome, WalletError>,
        account_id: &str,
        entry_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AwardOutcome, WalletError> {
        match result {
            Ok(outcome) => {
                let outcome = AwardOutcome::from_tx(outcome, account_id, now);
                if let Some(reason) = outcome.skip_reason {
                    debug!(
                        "Skipped entry {} for {}: {}",
                        truncate_string(entry_id, 19),
                        account_id,
                        reason.as_str()
                    );
                }
                Ok(outcome)
            }
            Err(WalletError::FailedPrecondition(reason)) => {
                warn!("Rejected for {}: {}", account_id, reason.as_str());
                Err(WalletError::FailedPrecondition(reason))
            }
            Err(e) => Err(e),
        }
    }
}

// ==========================================
// VALIDATION
// ==========================================

fn validate_common(account_id: &str, description: &str, idempotency_key: &str) -> Result<(), WalletError> {
    validate_id("accountId", account_id).map_err(WalletError::InvalidArgument)?;
    if description.trim().is_empty() {
        return Err(WalletError::invalid("description is required"));
    }
    if idempotency_key.trim().is_empty() {
        return Err(WalletError::invalid("idempotencyKey is required"));
    }
    Ok(())
}

fn validate_award(command: &AwardCommand) -> Result<(), WalletError> {
    validate_common(&command.account_id, &command.description, &command.idempotency_key)?;
    if command.action_kind == ActionKind::Standard {
        if command.amount == 0 {
            return Err(WalletError::invalid("award amount must not be zero"));
        }
        if command.amount < 0 {
            return Err(WalletError::invalid("award amount must be positive, use redeem"));
        }
    }
    if !command.impact_delta.is_finite() {
        return Err(WalletError::invalid("impactDelta must be a finite number"));
    }
    if let Some(activity_id) = &command.activity_id {
        validate_id("activityId", activity_id).map_err(WalletError::InvalidArgument)?;
    }
    Ok(())
}

fn validate_redeem(command: &RedeemCommand) -> Result<(), WalletError> {
    validate_common(&command.account_id, &command.description, &command.idempotency_key)?;
    if command.amount >= 0 {
        return Err(WalletError::invalid("redeem amount must be negative"));
    }
    Ok(())
}

// ==========================================
// PLANS
// ==========================================

/// Apply a credit to `account` and build the ledger entry for it.
///
/// Shared by awards and link merges.
pub(crate) fn credit_account(
    mut account: AccountRecord,
    entry: LedgerEntryRecord,
    ad_stats: Option<AdStatRecord>,
) -> Result<AccountWrite, WalletError> {
    account.credits = account
        .credits
        .checked_add(entry.amount)
        .ok_or_else(|| WalletError::invalid("balance overflow"))?;
    account.impact += entry.impact_delta;
    if let Some(activity_id) = &entry.activity_id {
        account.completed_activities.push(activity_id.clone());
    }
    account.updated_at = entry.created_at;

    let new_badges = badges::newly_earned(&account);
    account.badges.extend(new_badges.iter().cloned());

    Ok(AccountWrite {
        account,
        entry,
        ad_stats,
        new_badges,
    })
}

fn plan_award(
    command: &AwardCommand,
    entry_id: &str,
    today: NaiveDate,
    now: DateTime<Utc>,
    policy: &AdPolicy,
    snapshot: &AccountSnapshot,
) -> Result<TxDecision, WalletError> {
    if snapshot.entry_exists {
        return Ok(TxDecision::Skip(SkipReason::Duplicate));
    }

    let account = snapshot
        .account
        .clone()
        .unwrap_or_else(|| AccountRecord::new(&snapshot.account_id, now));

    if let Some(activity_id) = &command.activity_id {
        if account.has_completed(activity_id) {
            return Ok(TxDecision::Skip(SkipReason::ActivityCompleted));
        }
    }

    let (amount, ad_stats) = match command.action_kind {
        ActionKind::Standard => (command.amount, None),
        ActionKind::AdWatch => {
            let grant = ad_limiter::evaluate(
                snapshot.ad_stats.as_ref(),
                &snapshot.account_id,
                today,
                now,
                policy,
            )
            .map_err(WalletError::FailedPrecondition)?;
            (grant.reward, Some(grant.record))
        }
    };
    if amount == 0 {
        return Err(WalletError::invalid("award amount must not be zero"));
    }

    let entry = LedgerEntryRecord {
        id: entry_id.to_string(),
        account_id: snapshot.account_id.clone(),
        amount,
        kind: EntryKind::Earn,
        description: command.description.clone(),
        activity_id: command.activity_id.clone(),
        impact_delta: command.impact_delta,
        origin: command.origin,
        metadata: command.metadata.clone(),
        created_at: now,
    };

    credit_account(account, entry, ad_stats).map(TxDecision::Apply)
}

fn plan_redeem(
    command: &RedeemCommand,
    entry_id: &str,
    now: DateTime<Utc>,
    snapshot: &AccountSnapshot,
) -> Result<TxDecision, WalletError> {
    if snapshot.entry_exists {
        return Ok(TxDecision::Skip(SkipReason::Duplicate));
    }

    let mut account = snapshot
        .account
        .clone()
        .unwrap_or_else(|| AccountRecord::new(&snapshot.account_id, now));

    let remaining = account.credits + command.amount;
    if remaining < 0 {
        return Err(WalletError::FailedPrecondition(Reason::InsufficientCredits));
    }
    account.credits = remaining;
    account.updated_at = now;

    let entry = LedgerEntryRecord {
        id: entry_id.to_string(),
        account_id: snapshot.account_id.clone(),
        amount: command.amount,
        kind: EntryKind::Redeem,
        description: command.description.clone(),
        activity_id: None,
        impact_delta: 0.0,
        origin: command.origin,
        metadata: command.metadata.clone(),
        created_at: now,
    };

    Ok(TxDecision::Apply(AccountWrite {
        account,
        entry,
        ad_stats: None,
        new_badges: Vec::new(),
    }))
}
