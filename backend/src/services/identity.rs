//! # Identity Resolver
//!
//! Maps messaging-channel identities onto wallet accounts.
//!
//! ## Linking Flow
//!
//! ```text
//! Bot:  createLinkCode("tg123", "Alice") ──► code "K7PQ2M", 10 min
//!                                                    │
//! Web:  linkWithCode("acct1", "K7PQ2M") ◄────────────┘
//!         one store transaction:
//!           consume code → drain pending credits → write link
//!           → system merge entry on acct1 (if anything was pending)
//! ```
//!
//! Until the link exists, `awardByExternalId` accrues credits into a
//! pending record. Accruals are deduplicated by entry id and by activity
//! in a pending ledger that outlives the merge, so a retry after linking
//! is still a duplicate. The merge marks drained activities completed on
//! the account and skips those the account already completed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::store::{AccountSnapshot, ClaimOutcome, ExternalResolution, LinkClaim, TxDecision, TxOutcome};
use crate::db::{
    AccountRecord, CreditStore, EntryKind, ExternalLinkRecord, LedgerEntryRecord, LinkCodeRecord,
    Origin, PendingCreditEntry,
};
use crate::utils::{derive_entry_id, generate_link_code, validate_id};

use super::error::{Reason, SkipReason, WalletError};
use super::ledger::{credit_account, ActionKind, AwardCommand, AwardOutcome, WalletEngine};

/// Reason returned when an external identity has no linked account.
pub const NOT_LINKED_REASON: &str = "telegram_not_linked";

/// Description of the ledger entry created by a link merge.
const MERGE_DESCRIPTION: &str = "Merged pending credits from linked Telegram account";

/// Attempts at drawing a link code nobody else holds.
const CODE_ATTEMPTS: usize = 5;

/// An award arriving from the messaging channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalAwardCommand {
    pub external_id: String,
    /// Ignored for ad watches.
    pub amount: i64,
    pub description: String,
    pub activity_id: Option<String>,
    pub impact_delta: f64,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
    pub action_kind: ActionKind,
}

impl ExternalAwardCommand {
    fn for_account(&self, account_id: &str) -> AwardCommand {
        AwardCommand {
            account_id: account_id.to_string(),
            amount: self.amount,
            description: self.description.clone(),
            activity_id: self.activity_id.clone(),
            impact_delta: self.impact_delta,
            origin: Origin::Messaging,
            idempotency_key: self.idempotency_key.clone(),
            metadata: self.metadata.clone(),
            action_kind: self.action_kind,
        }
    }
}

/// Result of `link_with_code`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOutcome {
    pub external_id: String,
    pub display_name: String,
    pub account_id: String,
    /// Credits moved from the pending record into the account.
    pub merged_credits: i64,
    pub account: AccountRecord,
    pub merge_entry: Option<LedgerEntryRecord>,
    pub new_badges: Vec<String>,
}

/// Result of `award_by_external_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalAwardOutcome {
    /// `false` when the identity is not linked.
    pub ok: bool,
    pub reason: Option<&'static str>,
    pub duplicate: bool,
    /// Account the identity resolved to.
    pub account_id: Option<String>,
    pub credited_amount: Option<i64>,
    pub wallet: Option<AccountRecord>,
    /// Entry written on the linked account.
    pub entry: Option<LedgerEntryRecord>,
    pub new_badges: Vec<String>,
    /// Unclaimed total when unlinked.
    pub pending_credits: Option<i64>,
}

impl ExternalAwardOutcome {
    fn not_linked(pending_total: i64, duplicate: bool) -> Self {
        Self {
            ok: false,
            reason: Some(NOT_LINKED_REASON),
            duplicate,
            account_id: None,
            credited_amount: None,
            wallet: None,
            entry: None,
            new_badges: Vec::new(),
            pending_credits: Some(pending_total),
        }
    }

    fn activity_pending(pending_total: i64) -> Self {
        Self {
            reason: Some(SkipReason::ActivityCompleted.as_str()),
            ..Self::not_linked(pending_total, true)
        }
    }

    fn linked(account_id: &str, outcome: AwardOutcome) -> Self {
        Self {
            ok: true,
            reason: outcome.skip_reason.map(|r| r.as_str()),
            duplicate: outcome.duplicate,
            account_id: Some(account_id.to_string()),
            credited_amount: Some(outcome.applied_amount()),
            wallet: Some(outcome.account),
            entry: outcome.entry,
            new_badges: outcome.new_badges,
            pending_credits: None,
        }
    }
}

/// The identity service.
#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn CreditStore>,
    engine: WalletEngine,
    config: AppConfig,
}

impl IdentityService {
    pub fn new(store: Arc<dyn CreditStore>, engine: WalletEngine, config: AppConfig) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    /// Linked account of an external identity, if any.
    pub async fn resolve(&self, external_id: &str) -> Result<Option<ExternalLinkRecord>, WalletError> {
        validate_id("externalId", external_id).map_err(WalletError::InvalidArgument)?;
        self.store.get_external_link(external_id).await
    }

    // ==========================================
    // LINK CODES
    // ==========================================

    /// Issue a link code, replacing any outstanding code of the identity.
    pub async fn create_link_code(
        &self,
        external_id: &str,
        display_name: &str,
    ) -> Result<LinkCodeRecord, WalletError> {
        self.create_link_code_at(external_id, display_name, Utc::now())
            .await
    }

    pub async fn create_link_code_at(
        &self,
        external_id: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<LinkCodeRecord, WalletError> {
        validate_id("externalId", external_id).map_err(WalletError::InvalidArgument)?;

        let mut free_code = None;
        for _ in 0..CODE_ATTEMPTS {
            let candidate = generate_link_code(self.config.link_code_length);
            match self.store.get_link_code(&candidate).await? {
                Some(existing) if existing.external_id != external_id => continue,
                _ => {
                    free_code = Some(candidate);
                    break;
                }
            }
        }
        let Some(code) = free_code else {
            warn!("No free link code for {} after {} attempts", external_id, CODE_ATTEMPTS);
            return Err(WalletError::Internal(format!(
                "no free link code after {} attempts",
                CODE_ATTEMPTS
            )));
        };

        let record = LinkCodeRecord {
            code,
            external_id: external_id.to_string(),
            display_name: display_name.trim().to_string(),
            expires_at: now + self.config.link_code_ttl,
            created_at: now,
        };
        self.store.replace_link_code(&record).await?;

        info!(
            "Issued link code for {} (expires {})",
            external_id,
            record.expires_at.to_rfc3339()
        );
        Ok(record)
    }

    /// Link the identity behind `code` to `account_id` and merge its
    /// pending credits.
    pub async fn link_with_code(&self, account_id: &str, code: &str) -> Result<LinkOutcome, WalletError> {
        self.link_with_code_at(account_id, code, Utc::now()).await
    }

    pub async fn link_with_code_at(
        &self,
        account_id: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<LinkOutcome, WalletError> {
        validate_id("accountId", account_id).map_err(WalletError::InvalidArgument)?;
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() {
            return Err(WalletError::invalid("code is required"));
        }

        let Some(record) = self.store.get_link_code(&code).await? else {
            warn!("Link attempt by {} with unknown code", account_id);
            return Err(WalletError::FailedPrecondition(Reason::InvalidOrExpired));
        };

        let entry_id = derive_entry_id(&format!("link-merge:{}:{}", record.external_id, code));
        let plan = |claim: &LinkClaim, snapshot: &AccountSnapshot| plan_merge(claim, &code, &entry_id, now, snapshot);

        let outcome = self
            .store
            .claim_link_code(&code, &record.external_id, account_id, &entry_id, now, &plan)
            .await?;

        let (claim, merged) = match outcome {
            ClaimOutcome::Rejected => {
                warn!("Link code for {} rejected (used or expired)", record.external_id);
                return Err(WalletError::FailedPrecondition(Reason::InvalidOrExpired));
            }
            ClaimOutcome::Linked { claim, merged } => (claim, merged),
        };

        let (merged_credits, account, merge_entry, new_badges) = match merged {
            Some(TxOutcome::Committed(write)) => {
                (write.entry.amount, write.account, Some(write.entry), write.new_badges)
            }
            Some(TxOutcome::Skipped { account, .. }) => (
                0,
                account.unwrap_or_else(|| AccountRecord::new(account_id, now)),
                None,
                Vec::new(),
            ),
            None => (0, self.engine.get_balance(account_id).await?, None, Vec::new()),
        };

        info!(
            "Linked {} to {}, merged {} pending credits",
            claim.external_id, account_id, merged_credits
        );
        Ok(LinkOutcome {
            external_id: claim.external_id,
            display_name: claim.display_name,
            account_id: account_id.to_string(),
            merged_credits,
            account,
            merge_entry,
            new_badges,
        })
    }

    // ==========================================
    // EXTERNAL AWARDS
    // ==========================================

    /// Award by messaging identity; accrue as pending while unlinked.
    pub async fn award_by_external_id(
        &self,
        command: ExternalAwardCommand,
    ) -> Result<ExternalAwardOutcome, WalletError> {
        self.award_by_external_id_at(command, Utc::now()).await
    }

    pub async fn award_by_external_id_at(
        &self,
        command: ExternalAwardCommand,
        now: DateTime<Utc>,
    ) -> Result<ExternalAwardOutcome, WalletError> {
        validate_id("externalId", &command.external_id).map_err(WalletError::InvalidArgument)?;
        if command.idempotency_key.trim().is_empty() {
            return Err(WalletError::invalid("idempotencyKey is required"));
        }
        if command.description.trim().is_empty() {
            return Err(WalletError::invalid("description is required"));
        }
        if command.action_kind == ActionKind::Standard && command.amount <= 0 {
            return Err(WalletError::invalid("award amount must be positive"));
        }

        let entry_id = derive_entry_id(&command.idempotency_key);

        // Ad limits are per account, so unlinked ad watches earn nothing
        let accrual = match command.action_kind {
            ActionKind::AdWatch => None,
            ActionKind::Standard => Some(PendingCreditEntry {
                id: entry_id.clone(),
                external_id: command.external_id.clone(),
                amount: command.amount,
                description: command.description.clone(),
                activity_id: command.activity_id.clone(),
                impact_delta: command.impact_delta,
                created_at: now,
                merged_at: None,
            }),
        };

        let resolution = self
            .store
            .resolve_or_accrue(&command.external_id, &entry_id, accrual.as_ref())
            .await?;

        match resolution {
            ExternalResolution::Linked {
                account_id,
                already_pending: true,
            } => {
                debug!(
                    "Entry for {} was credited before linking, skipping",
                    command.external_id
                );
                let wallet = self.engine.get_balance(&account_id).await?;
                Ok(ExternalAwardOutcome::linked(
                    &account_id,
                    AwardOutcome {
                        duplicate: true,
                        skip_reason: Some(SkipReason::Duplicate),
                        account: wallet,
                        entry: None,
                        new_badges: Vec::new(),
                        ad_stats: None,
                    },
                ))
            }
            ExternalResolution::Linked { account_id, .. } => {
                let outcome = self
                    .engine
                    .award_at(command.for_account(&account_id), now)
                    .await?;
                Ok(ExternalAwardOutcome::linked(&account_id, outcome))
            }
            ExternalResolution::Accrued { pending_total } => {
                info!(
                    "Accrued {} pending credits for unlinked {} (total {})",
                    command.amount, command.external_id, pending_total
                );
                Ok(ExternalAwardOutcome::not_linked(pending_total, false))
            }
            ExternalResolution::DuplicatePending { pending_total } => {
                debug!("Duplicate pending accrual for {}", command.external_id);
                Ok(ExternalAwardOutcome::not_linked(pending_total, true))
            }
            ExternalResolution::ActivityPending { pending_total } => {
                debug!(
                    "Activity {:?} already pending for {}",
                    command.activity_id, command.external_id
                );
                Ok(ExternalAwardOutcome::activity_pending(pending_total))
            }
            ExternalResolution::NotLinked { pending_total } => {
                Ok(ExternalAwardOutcome::not_linked(pending_total, false))
            }
        }
    }
}

fn plan_merge(
    claim: &LinkClaim,
    code: &str,
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

    let mut amount = 0i64;
    let mut impact = 0.0;
    let mut activities: Vec<String> = Vec::new();
    for pending in &claim.entries {
        if let Some(activity) = &pending.activity_id {
            if account.has_completed(activity) || activities.contains(activity) {
                debug!(
                    "Activity {} already completed on {}, not merged",
                    activity, snapshot.account_id
                );
                continue;
            }
            activities.push(activity.clone());
        }
        amount = amount
            .checked_add(pending.amount)
            .ok_or_else(|| WalletError::invalid("balance overflow"))?;
        impact += pending.impact_delta;
    }

    if amount <= 0 {
        return Ok(TxDecision::Skip(SkipReason::ActivityCompleted));
    }
    account.completed_activities.extend(activities.iter().cloned());

    let entry = LedgerEntryRecord {
        id: entry_id.to_string(),
        account_id: snapshot.account_id.clone(),
        amount,
        kind: EntryKind::Earn,
        description: MERGE_DESCRIPTION.to_string(),
        activity_id: None,
        impact_delta: impact,
        origin: Origin::System,
        metadata: json!({
            "externalId": claim.external_id,
            "linkCode": code,
            "activityIds": activities,
        }),
        created_at: now,
    };

    credit_account(account, entry, None).map(TxDecision::Apply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::services::ledger::tests::award_cmd;
    use chrono::Duration;

    fn service() -> (Arc<MemoryStore>, WalletEngine, IdentityService) {
        let store = Arc::new(MemoryStore::new());
        let config = AppConfig::in_memory();
        let engine = WalletEngine::new(store.clone(), config.clone());
        let identity = IdentityService::new(store.clone(), engine.clone(), config);
        (store, engine, identity)
    }

    fn external(amount: i64, key: &str) -> ExternalAwardCommand {
        ExternalAwardCommand {
            external_id: "tg123".to_string(),
            amount,
            description: "Scanned waste".to_string(),
            activity_id: None,
            impact_delta: 0.0,
            idempotency_key: key.to_string(),
            metadata: serde_json::Value::Null,
            action_kind: ActionKind::Standard,
        }
    }

    #[tokio::test]
    async fn test_unlinked_award_accrues_pending() {
        let (store, _, identity) = service();

        let outcome = identity.award_by_external_id(external(30, "msg:1")).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.reason, Some(NOT_LINKED_REASON));
        assert_eq!(outcome.pending_credits, Some(30));

        let retry = identity.award_by_external_id(external(30, "msg:1")).await.unwrap();
        assert!(retry.duplicate);
        assert_eq!(store.get_pending("tg123").await.unwrap().unwrap().amount, 30);
    }

    #[tokio::test]
    async fn test_link_merges_pending_exactly_once() {
        let (store, engine, identity) = service();
        engine.award(award_cmd("acct1", 55, "seed")).await.unwrap();
        identity.award_by_external_id(external(30, "msg:1")).await.unwrap();

        let code = identity.create_link_code("tg123", "Alice").await.unwrap();
        assert_eq!(code.code.len(), 6);

        let linked = identity.link_with_code("acct1", &code.code).await.unwrap();
        assert_eq!(linked.merged_credits, 30);
        assert_eq!(linked.account.credits, 85);
        assert_eq!(linked.display_name, "Alice");
        let entry = linked.merge_entry.unwrap();
        assert_eq!(entry.origin, Origin::System);
        assert_eq!(
            entry.id,
            derive_entry_id(&format!("link-merge:tg123:{}", code.code))
        );
        assert!(store.get_pending("tg123").await.unwrap().is_none());

        let again = identity.link_with_code("acct1", &code.code).await;
        assert_eq!(
            again,
            Err(WalletError::FailedPrecondition(Reason::InvalidOrExpired))
        );
        assert_eq!(engine.get_balance("acct1").await.unwrap().credits, 85);
    }

    #[tokio::test]
    async fn test_link_without_pending_writes_no_entry() {
        let (store, _, identity) = service();
        let code = identity.create_link_code("tg123", "Alice").await.unwrap();

        let linked = identity.link_with_code("acct1", &code.code.to_lowercase()).await.unwrap();
        assert_eq!(linked.merged_credits, 0);
        assert!(linked.merge_entry.is_none());
        assert!(store.get_history("acct1", 50).await.unwrap().is_empty());

        let link = identity.resolve("tg123").await.unwrap().unwrap();
        assert_eq!(link.account_id, "acct1");
    }

    #[tokio::test]
    async fn test_expired_code_is_rejected() {
        let (_, _, identity) = service();
        let issued_at = Utc::now() - Duration::minutes(11);
        let code = identity
            .create_link_code_at("tg123", "Alice", issued_at)
            .await
            .unwrap();

        let result = identity.link_with_code("acct1", &code.code).await;
        assert_eq!(
            result,
            Err(WalletError::FailedPrecondition(Reason::InvalidOrExpired))
        );
        assert!(identity.resolve("tg123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_code_replaces_old_one() {
        let (_, _, identity) = service();
        let first = identity.create_link_code("tg123", "Alice").await.unwrap();
        let second = identity.create_link_code("tg123", "Alice").await.unwrap();

        if first.code != second.code {
            let result = identity.link_with_code("acct1", &first.code).await;
            assert!(result.is_err());
        }
        assert!(identity.link_with_code("acct1", &second.code).await.is_ok());
    }

    #[tokio::test]
    async fn test_linked_award_goes_to_account() {
        let (_, engine, identity) = service();
        let code = identity.create_link_code("tg123", "Alice").await.unwrap();
        identity.link_with_code("acct1", &code.code).await.unwrap();

        let outcome = identity.award_by_external_id(external(20, "msg:2")).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.credited_amount, Some(20));
        assert_eq!(outcome.account_id.as_deref(), Some("acct1"));
        assert_eq!(outcome.wallet.unwrap().credits, 20);

        let history = engine.get_balance("acct1").await.unwrap();
        assert_eq!(history.credits, 20);
    }

    #[tokio::test]
    async fn test_pending_entry_is_not_credited_again_after_link() {
        let (_, engine, identity) = service();
        identity.award_by_external_id(external(30, "msg:1")).await.unwrap();
        let code = identity.create_link_code("tg123", "Alice").await.unwrap();
        identity.link_with_code("acct1", &code.code).await.unwrap();

        let retry = identity.award_by_external_id(external(30, "msg:1")).await.unwrap();
        assert!(retry.ok);
        assert!(retry.duplicate);
        assert_eq!(engine.get_balance("acct1").await.unwrap().credits, 30);
    }

    #[tokio::test]
    async fn test_unlinked_ad_watch_does_not_accrue() {
        let (store, _, identity) = service();
        let mut command = external(0, "ad:1");
        command.action_kind = ActionKind::AdWatch;

        let outcome = identity.award_by_external_id(command).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.pending_credits, Some(0));
        assert!(store.get_pending("tg123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_activity_is_credited_once() {
        let (store, engine, identity) = service();
        let mut quiz = external(30, "msg:a");
        quiz.activity_id = Some("quiz-1".to_string());
        quiz.impact_delta = 2.0;

        let first = identity.award_by_external_id(quiz.clone()).await.unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.pending_credits, Some(30));

        quiz.idempotency_key = "msg:b".to_string();
        let second = identity.award_by_external_id(quiz.clone()).await.unwrap();
        assert!(!second.ok);
        assert!(second.duplicate);
        assert_eq!(second.reason, Some("activity_completed"));
        assert_eq!(second.pending_credits, Some(30));

        let code = identity.create_link_code("tg123", "Alice").await.unwrap();
        let linked = identity.link_with_code("acct1", &code.code).await.unwrap();
        assert_eq!(linked.merged_credits, 30);
        assert_eq!(linked.account.completed_activities, vec!["quiz-1"]);

        quiz.idempotency_key = "msg:c".to_string();
        let after = identity.award_by_external_id(quiz).await.unwrap();
        assert!(after.ok);
        assert!(after.duplicate);
        assert_eq!(after.reason, Some("activity_completed"));
        assert_eq!(after.credited_amount, Some(0));

        assert_eq!(engine.get_balance("acct1").await.unwrap().credits, 30);
        assert!(store.get_pending("tg123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_skips_activity_completed_on_account() {
        let (_, engine, identity) = service();
        let mut web = award_cmd("acct1", 10, "web:quiz");
        web.activity_id = Some("quiz-1".to_string());
        engine.award(web).await.unwrap();

        let mut quiz = external(30, "msg:a");
        quiz.activity_id = Some("quiz-1".to_string());
        identity.award_by_external_id(quiz).await.unwrap();
        identity.award_by_external_id(external(5, "msg:b")).await.unwrap();

        let code = identity.create_link_code("tg123", "Alice").await.unwrap();
        let linked = identity.link_with_code("acct1", &code.code).await.unwrap();
        assert_eq!(linked.merged_credits, 5);
        assert_eq!(linked.account.credits, 15);
        assert_eq!(linked.account.completed_activities, vec!["quiz-1"]);
        let entry = linked.merge_entry.unwrap();
        assert_eq!(entry.metadata["activityIds"], json!([]));
    }

    #[tokio::test]
    async fn test_merge_of_only_completed_activities_writes_no_entry() {
        let (store, engine, identity) = service();
        let mut web = award_cmd("acct1", 10, "web:quiz");
        web.activity_id = Some("quiz-1".to_string());
        engine.award(web).await.unwrap();

        let mut quiz = external(30, "msg:a");
        quiz.activity_id = Some("quiz-1".to_string());
        identity.award_by_external_id(quiz).await.unwrap();

        let code = identity.create_link_code("tg123", "Alice").await.unwrap();
        let linked = identity.link_with_code("acct1", &code.code).await.unwrap();
        assert_eq!(linked.merged_credits, 0);
        assert!(linked.merge_entry.is_none());
        assert_eq!(linked.account.credits, 10);
        assert!(store.get_pending("tg123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_impact_carries_into_merge() {
        let (store, _, identity) = service();
        for key in ["msg:1", "msg:2"] {
            let mut command = external(10, key);
            command.impact_delta = 2.0;
            identity.award_by_external_id(command).await.unwrap();
        }
        assert_eq!(store.get_pending("tg123").await.unwrap().unwrap().impact, 4.0);

        let code = identity.create_link_code("tg123", "Alice").await.unwrap();
        let linked = identity.link_with_code("acct1", &code.code).await.unwrap();
        assert_eq!(linked.merged_credits, 20);
        assert_eq!(linked.merge_entry.unwrap().impact_delta, 4.0);
        assert_eq!(linked.account.impact, 4.0);
    }

    #[tokio::test]
    async fn test_external_award_requires_description() {
        let (store, _, identity) = service();
        let mut command = external(30, "msg:1");
        command.description = "   ".to_string();

        let result = identity.award_by_external_id(command).await;
        assert!(matches!(result, Err(WalletError::InvalidArgument(_))));
        assert!(store.get_pending("tg123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_link_code_space_exhausted_is_internal_error() {
        let store = Arc::new(MemoryStore::new());
        let mut config = AppConfig::in_memory();
        config.link_code_length = 1;
        let engine = WalletEngine::new(store.clone(), config.clone());
        let identity = IdentityService::new(store.clone(), engine, config);

        let now = Utc::now();
        for (i, c) in "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().enumerate() {
            store
                .replace_link_code(&LinkCodeRecord {
                    code: c.to_string(),
                    external_id: format!("tg-other-{}", i),
                    display_name: String::new(),
                    expires_at: now + Duration::minutes(10),
                    created_at: now,
                })
                .await
                .unwrap();
        }

        let result = identity.create_link_code("tg123", "Alice").await;
        assert!(matches!(result, Err(WalletError::Internal(_))));
        let held = store.get_link_code("A").await.unwrap().unwrap();
        assert_eq!(held.external_id, "tg-other-0");
    }

    #[tokio::test]
    async fn test_relink_moves_identity() {
        let (_, _, identity) = service();
        let code = identity.create_link_code("tg123", "Alice").await.unwrap();
        identity.link_with_code("acct1", &code.code).await.unwrap();

        let code = identity.create_link_code("tg123", "Alice").await.unwrap();
        identity.link_with_code("acct2", &code.code).await.unwrap();

        let link = identity.resolve("tg123").await.unwrap().unwrap();
        assert_eq!(link.account_id, "acct2");
    }
}
