//! # API Request Models
//!
//! Structures for incoming API request bodies.
//! Each struct represents the expected JSON body for an endpoint and
//! has a `validate()` that turns it into a typed service command, so
//! nothing loosely typed reaches the wallet engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db::Origin;
use crate::services::identity::ExternalAwardCommand;
use crate::services::telegram_auth::field_to_string;
use crate::services::{ActionKind, AwardCommand, RedeemCommand, WalletError};

fn required(field: &str, value: &str) -> Result<(), WalletError> {
    if value.trim().is_empty() {
        return Err(WalletError::invalid(format!("{} is required", field)));
    }
    Ok(())
}

fn standard_amount(kind: ActionKind, amount: Option<i64>) -> Result<i64, WalletError> {
    match (kind, amount) {
        (ActionKind::AdWatch, _) => Ok(0),
        (ActionKind::Standard, None) => Err(WalletError::invalid("amount is required")),
        (ActionKind::Standard, Some(0)) => Err(WalletError::invalid("amount must not be zero")),
        (ActionKind::Standard, Some(a)) if a < 0 => Err(WalletError::invalid(
            "amount must be positive, use /wallet/redeem for debits",
        )),
        (ActionKind::Standard, Some(a)) => Ok(a),
    }
}

/// Request to award credits.
///
/// ## Example JSON
///
/// ```json
/// {
///     "accountId": "acct1",
///     "amount": 15,
///     "description": "Sorted plastic bottle",
///     "impactDelta": 0.4,
///     "origin": "web",
///     "idempotencyKey": "scan:8f2c:acct1"
/// }
/// ```
///
/// For `"actionKind": "ad_watch"` the amount is ignored and the ad-watch
/// limiter decides the reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardRequest {
    pub account_id: String,

    /// Credits to add. Required unless `actionKind` is `ad_watch`.
    pub amount: Option<i64>,

    pub description: String,

    /// One-off activity; pays out at most once per account.
    pub activity_id: Option<String>,

    pub impact_delta: Option<f64>,

    pub origin: Origin,

    /// Unique per logical action. Retries must reuse it.
    pub idempotency_key: String,

    pub metadata: Option<serde_json::Value>,

    #[serde(default)]
    pub action_kind: ActionKind,
}

impl AwardRequest {
    pub fn validate(self) -> Result<AwardCommand, WalletError> {
        required("accountId", &self.account_id)?;
        required("description", &self.description)?;
        required("idempotencyKey", &self.idempotency_key)?;
        let amount = standard_amount(self.action_kind, self.amount)?;

        Ok(AwardCommand {
            account_id: self.account_id,
            amount,
            description: self.description,
            activity_id: self.activity_id.filter(|a| !a.is_empty()),
            impact_delta: self.impact_delta.unwrap_or(0.0),
            origin: self.origin,
            idempotency_key: self.idempotency_key,
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
            action_kind: self.action_kind,
        })
    }
}

/// Request to redeem credits.
///
/// ## Example JSON
///
/// ```json
/// {
///     "accountId": "acct1",
///     "amount": -50,
///     "description": "Coffee voucher",
///     "idempotencyKey": "redeem:voucher-17:acct1"
/// }
/// ```
///
/// `amount` is negative: a redemption is a debit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemRequest {
    pub account_id: String,
    pub amount: i64,
    pub description: String,
    pub idempotency_key: String,

    /// Defaults to `web`.
    pub origin: Option<Origin>,

    pub metadata: Option<serde_json::Value>,
}

impl RedeemRequest {
    pub fn validate(self) -> Result<RedeemCommand, WalletError> {
        required("accountId", &self.account_id)?;
        required("description", &self.description)?;
        required("idempotencyKey", &self.idempotency_key)?;
        if self.amount >= 0 {
            return Err(WalletError::invalid("amount must be negative"));
        }

        Ok(RedeemCommand {
            account_id: self.account_id,
            amount: self.amount,
            description: self.description,
            origin: self.origin.unwrap_or(Origin::Web),
            idempotency_key: self.idempotency_key,
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
        })
    }
}

/// Request to issue a link code for a messaging identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkCodeRequest {
    pub external_id: String,
    pub display_name: Option<String>,
}

impl CreateLinkCodeRequest {
    pub fn validate(&self) -> Result<(), WalletError> {
        required("externalId", &self.external_id)
    }
}

/// Request to link the caller's account using a code.
///
/// ## Example JSON
///
/// ```json
/// {
///     "accountId": "acct1",
///     "code": "K7PQ2M"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkWithCodeRequest {
    pub account_id: String,
    pub code: String,
}

impl LinkWithCodeRequest {
    pub fn validate(&self) -> Result<(), WalletError> {
        required("accountId", &self.account_id)?;
        required("code", &self.code)
    }
}

/// Request to award credits to a messaging identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAwardRequest {
    pub external_id: String,
    pub amount: Option<i64>,
    pub description: String,
    pub activity_id: Option<String>,
    pub impact_delta: Option<f64>,
    pub idempotency_key: String,
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub action_kind: ActionKind,
}

impl ExternalAwardRequest {
    pub fn validate(self) -> Result<ExternalAwardCommand, WalletError> {
        required("externalId", &self.external_id)?;
        required("description", &self.description)?;
        required("idempotencyKey", &self.idempotency_key)?;
        let amount = standard_amount(self.action_kind, self.amount)?;

        Ok(ExternalAwardCommand {
            external_id: self.external_id,
            amount,
            description: self.description,
            activity_id: self.activity_id.filter(|a| !a.is_empty()),
            impact_delta: self.impact_delta.unwrap_or(0.0),
            idempotency_key: self.idempotency_key,
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
            action_kind: self.action_kind,
        })
    }
}

/// Telegram login widget payload, passed through as signed.
///
/// ```json
/// { "id": 42, "first_name": "Alice", "auth_date": 1710000000, "hash": "..." }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelegramLoginRequest {
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl TelegramLoginRequest {
    /// Fields as the strings Telegram signed.
    pub fn signed_fields(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(key, value)| (key.clone(), field_to_string(value)))
            .collect()
    }
}

/// Query parameters for the leaderboard.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardQuery {
    /// Number of accounts (default: 10, max: 100).
    pub limit: Option<i64>,
}

/// Inbound webhook event.
///
/// Every variant ends up in the same award primitives as the direct
/// endpoints, keyed by `event:{eventId}` so redelivery is a duplicate.
///
/// ## Example JSON
///
/// ```json
/// {
///     "type": "scan_completed",
///     "eventId": "evt_91c2",
///     "accountId": "acct1",
///     "category": "plastic",
///     "credits": 15,
///     "impactDelta": 0.4
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A classified waste scan.
    #[serde(rename_all = "camelCase")]
    ScanCompleted {
        event_id: String,
        account_id: Option<String>,
        external_id: Option<String>,
        category: String,
        credits: i64,
        impact_delta: Option<f64>,
    },

    /// A finished ad view.
    #[serde(rename_all = "camelCase")]
    AdWatched {
        event_id: String,
        account_id: Option<String>,
        external_id: Option<String>,
    },

    /// A one-off activity such as a quiz.
    #[serde(rename_all = "camelCase")]
    ActivityCompleted {
        event_id: String,
        account_id: String,
        activity_id: String,
        credits: i64,
        description: Option<String>,
        impact_delta: Option<f64>,
    },

    /// Credits for a messaging identity.
    #[serde(rename_all = "camelCase")]
    ExternalAward {
        event_id: String,
        external_id: String,
        credits: i64,
        description: String,
    },
}

/// Where a validated event goes.
#[derive(Debug, Clone, PartialEq)]
pub enum EventAction {
    Award(AwardCommand),
    External(ExternalAwardCommand),
}

/// Pending award fields shared by the event variants.
struct EventAward {
    key: String,
    amount: i64,
    description: String,
    activity_id: Option<String>,
    impact_delta: f64,
    kind: ActionKind,
    metadata: serde_json::Value,
}

impl EventAward {
    fn for_account(self, account_id: String) -> EventAction {
        EventAction::Award(AwardCommand {
            account_id,
            amount: self.amount,
            description: self.description,
            activity_id: self.activity_id,
            impact_delta: self.impact_delta,
            origin: Origin::System,
            idempotency_key: self.key,
            metadata: self.metadata,
            action_kind: self.kind,
        })
    }

    fn for_external(self, external_id: String) -> EventAction {
        EventAction::External(ExternalAwardCommand {
            external_id,
            amount: self.amount,
            description: self.description,
            activity_id: self.activity_id,
            impact_delta: self.impact_delta,
            idempotency_key: self.key,
            metadata: self.metadata,
            action_kind: self.kind,
        })
    }

    fn route(
        self,
        account_id: Option<String>,
        external_id: Option<String>,
    ) -> Result<EventAction, WalletError> {
        match (account_id, external_id) {
            (Some(account_id), None) => Ok(self.for_account(account_id)),
            (None, Some(external_id)) => Ok(self.for_external(external_id)),
            _ => Err(WalletError::invalid(
                "exactly one of accountId or externalId is required",
            )),
        }
    }
}

impl InboundEvent {
    pub fn event_id(&self) -> &str {
        match self {
            InboundEvent::ScanCompleted { event_id, .. }
            | InboundEvent::AdWatched { event_id, .. }
            | InboundEvent::ActivityCompleted { event_id, .. }
            | InboundEvent::ExternalAward { event_id, .. } => event_id,
        }
    }

    pub fn validate(self) -> Result<EventAction, WalletError> {
        required("eventId", self.event_id())?;
        let key = format!("event:{}", self.event_id());

        match self {
            InboundEvent::ScanCompleted {
                event_id,
                account_id,
                external_id,
                category,
                credits,
                impact_delta,
            } => {
                required("category", &category)?;
                EventAward {
                    key,
                    amount: standard_amount(ActionKind::Standard, Some(credits))?,
                    description: format!("Sorted {} waste", category),
                    activity_id: None,
                    impact_delta: impact_delta.unwrap_or(0.0),
                    kind: ActionKind::Standard,
                    metadata: serde_json::json!({ "eventId": event_id, "category": category }),
                }
                .route(account_id, external_id)
            }
            InboundEvent::AdWatched {
                event_id,
                account_id,
                external_id,
            } => EventAward {
                key,
                amount: 0,
                description: "Watched an ad".to_string(),
                activity_id: None,
                impact_delta: 0.0,
                kind: ActionKind::AdWatch,
                metadata: serde_json::json!({ "eventId": event_id }),
            }
            .route(account_id, external_id),
            InboundEvent::ActivityCompleted {
                event_id,
                account_id,
                activity_id,
                credits,
                description,
                impact_delta,
            } => {
                required("activityId", &activity_id)?;
                Ok(EventAward {
                    key,
                    amount: standard_amount(ActionKind::Standard, Some(credits))?,
                    description: description
                        .filter(|d| !d.trim().is_empty())
                        .unwrap_or_else(|| format!("Completed {}", activity_id)),
                    activity_id: Some(activity_id),
                    impact_delta: impact_delta.unwrap_or(0.0),
                    kind: ActionKind::Standard,
                    metadata: serde_json::json!({ "eventId": event_id }),
                }
                .for_account(account_id))
            }
            InboundEvent::ExternalAward {
                event_id,
                external_id,
                credits,
                description,
            } => {
                required("description", &description)?;
                Ok(EventAward {
                    key,
                    amount: standard_amount(ActionKind::Standard, Some(credits))?,
                    description,
                    activity_id: None,
                    impact_delta: 0.0,
                    kind: ActionKind::Standard,
                    metadata: serde_json::json!({ "eventId": event_id }),
                }
                .for_external(external_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_award_request_defaults() {
        let request: AwardRequest = serde_json::from_value(json!({
            "accountId": "acct1",
            "amount": 15,
            "description": "Sorted bottle",
            "origin": "web",
            "idempotencyKey": "k1"
        }))
        .unwrap();

        let command = request.validate().unwrap();
        assert_eq!(command.action_kind, ActionKind::Standard);
        assert_eq!(command.impact_delta, 0.0);
        assert_eq!(command.origin, Origin::Web);
    }

    #[test]
    fn test_unknown_origin_is_rejected_at_parse() {
        let parsed = serde_json::from_value::<AwardRequest>(json!({
            "accountId": "acct1",
            "amount": 15,
            "description": "x",
            "origin": "carrier_pigeon",
            "idempotencyKey": "k1"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_ad_watch_ignores_amount() {
        let request: AwardRequest = serde_json::from_value(json!({
            "accountId": "acct1",
            "description": "Watched an ad",
            "origin": "messaging",
            "idempotencyKey": "ad:1",
            "actionKind": "ad_watch"
        }))
        .unwrap();
        assert_eq!(request.validate().unwrap().amount, 0);
    }

    #[test]
    fn test_award_amount_rules() {
        assert!(standard_amount(ActionKind::Standard, None).is_err());
        assert!(standard_amount(ActionKind::Standard, Some(0)).is_err());
        assert!(standard_amount(ActionKind::Standard, Some(-3)).is_err());
        assert_eq!(standard_amount(ActionKind::Standard, Some(3)).unwrap(), 3);
        assert_eq!(standard_amount(ActionKind::AdWatch, Some(-3)).unwrap(), 0);
    }

    #[test]
    fn test_redeem_must_be_negative() {
        let request = RedeemRequest {
            account_id: "acct1".to_string(),
            amount: 50,
            description: "voucher".to_string(),
            idempotency_key: "r1".to_string(),
            origin: None,
            metadata: None,
        };
        assert!(matches!(
            request.validate(),
            Err(WalletError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_scan_event_routes_by_target() {
        let event: InboundEvent = serde_json::from_value(json!({
            "type": "scan_completed",
            "eventId": "evt_1",
            "externalId": "tg123",
            "category": "plastic",
            "credits": 15
        }))
        .unwrap();

        match event.validate().unwrap() {
            EventAction::External(command) => {
                assert_eq!(command.external_id, "tg123");
                assert_eq!(command.idempotency_key, "event:evt_1");
                assert_eq!(command.amount, 15);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_event_needs_exactly_one_target() {
        let event: InboundEvent = serde_json::from_value(json!({
            "type": "ad_watched",
            "eventId": "evt_2",
            "accountId": "acct1",
            "externalId": "tg123"
        }))
        .unwrap();
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_activity_event() {
        let event: InboundEvent = serde_json::from_value(json!({
            "type": "activity_completed",
            "eventId": "evt_3",
            "accountId": "acct1",
            "activityId": "quiz-1",
            "credits": 20
        }))
        .unwrap();

        match event.validate().unwrap() {
            EventAction::Award(command) => {
                assert_eq!(command.activity_id.as_deref(), Some("quiz-1"));
                assert_eq!(command.description, "Completed quiz-1");
                assert_eq!(command.origin, Origin::System);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_telegram_fields_are_stringified() {
        let request: TelegramLoginRequest = serde_json::from_value(json!({
            "id": 42,
            "first_name": "Alice",
            "auth_date": 1710000000,
            "hash": "abc"
        }))
        .unwrap();

        let fields = request.signed_fields();
        assert_eq!(fields["id"], "42");
        assert_eq!(fields["auth_date"], "1710000000");
    }
}
