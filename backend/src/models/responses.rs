//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{AccountRecord, AdStatRecord, EntryKind, LedgerEntryRecord, LinkCodeRecord, Origin};
use crate::services::identity::{ExternalAwardOutcome, LinkOutcome};
use crate::services::{AwardOutcome, WalletError};

/// Standard API response wrapper.
///
/// All API responses follow this format:
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "FAILED_PRECONDITION",
///         "reason": "insufficient_credits",
///         "message": "Not enough credits for this redemption"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Whether the request was successful.
    pub success: bool,

    /// Response data (null on error).
    pub data: Option<T>,

    /// Error information (null on success).
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(code: &str, reason: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

impl ApiResponse<()> {
    pub fn from_error(e: &WalletError) -> Self {
        let message = match e {
            WalletError::FailedPrecondition(reason) => reason.message().to_string(),
            WalletError::InvalidArgument(m)
            | WalletError::PermissionDenied(m)
            | WalletError::Internal(m) => m.clone(),
        };
        Self::error(e.code(), e.reason(), &message)
    }
}

/// API error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Category (e.g., "FAILED_PRECONDITION").
    pub code: String,

    /// Stable machine-readable reason (e.g., "session_cooldown").
    pub reason: String,

    /// Human-readable error message.
    pub message: String,
}

/// Compact wallet view returned by mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub account_id: String,
    pub credits: i64,
    pub impact: f64,
    pub completed_activities_count: usize,
    pub badges: Vec<String>,
}

impl From<&AccountRecord> for WalletSnapshot {
    fn from(account: &AccountRecord) -> Self {
        Self {
            account_id: account.id.clone(),
            credits: account.credits,
            impact: account.impact,
            completed_activities_count: account.completed_activities.len(),
            badges: account.badges.clone(),
        }
    }
}

/// Full wallet.
///
/// Returned by `GET /wallet/{account}`
///
/// ## Example Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "accountId": "acct1",
///         "credits": 55,
///         "impact": 1.2,
///         "completedActivities": ["quiz-1"],
///         "badges": ["eco_starter"]
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub account_id: String,
    pub credits: i64,
    pub impact: f64,
    pub completed_activities: Vec<String>,
    pub badges: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<AccountRecord> for BalanceResponse {
    fn from(account: AccountRecord) -> Self {
        Self {
            account_id: account.id,
            credits: account.credits,
            impact: account.impact,
            completed_activities: account.completed_activities,
            badges: account.badges,
            updated_at: account.updated_at,
        }
    }
}

/// One ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryResponse {
    pub id: String,
    pub amount: i64,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub origin: Origin,
    pub activity_id: Option<String>,
}

impl From<LedgerEntryRecord> for EntryResponse {
    fn from(entry: LedgerEntryRecord) -> Self {
        Self {
            id: entry.id,
            amount: entry.amount,
            description: entry.description,
            timestamp: entry.created_at,
            kind: entry.kind,
            origin: entry.origin,
            activity_id: entry.activity_id,
        }
    }
}

/// Today's ad counters after an ad watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdStatsResponse {
    pub date: NaiveDate,
    pub total_ads_watched: i32,
    pub current_session_ads: i32,
    pub sessions_completed: i32,
    pub points_earned: i64,
    pub last_session_end_time: Option<DateTime<Utc>>,
}

impl From<AdStatRecord> for AdStatsResponse {
    fn from(stats: AdStatRecord) -> Self {
        Self {
            date: stats.stat_date,
            total_ads_watched: stats.total_ads_watched,
            current_session_ads: stats.current_session_ads,
            sessions_completed: stats.sessions_completed,
            points_earned: stats.points_earned,
            last_session_end_time: stats.last_session_end,
        }
    }
}

/// Result of an award or redemption.
///
/// ## Example Response
///
/// ```json
/// {
///     "ok": true,
///     "duplicate": false,
///     "wallet": { "accountId": "acct1", "credits": 10, "impact": 0.0,
///                 "completedActivitiesCount": 0, "badges": [] },
///     "entry": { "id": "9f86d0...", "amount": 10, "kind": "earn", ... },
///     "newBadges": []
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardResponse {
    pub ok: bool,
    pub duplicate: bool,

    /// `duplicate` or `activity_completed` when skipped.
    pub reason: Option<String>,

    pub wallet: WalletSnapshot,
    pub entry: Option<EntryResponse>,
    pub new_badges: Vec<String>,
    pub ad_stats: Option<AdStatsResponse>,
}

impl From<AwardOutcome> for AwardResponse {
    fn from(outcome: AwardOutcome) -> Self {
        Self {
            ok: true,
            duplicate: outcome.duplicate,
            reason: outcome.skip_reason.map(|r| r.as_str().to_string()),
            wallet: WalletSnapshot::from(&outcome.account),
            entry: outcome.entry.map(EntryResponse::from),
            new_badges: outcome.new_badges,
            ad_stats: outcome.ad_stats.map(AdStatsResponse::from),
        }
    }
}

/// Issued link code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCodeResponse {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl From<LinkCodeRecord> for LinkCodeResponse {
    fn from(record: LinkCodeRecord) -> Self {
        Self {
            code: record.code,
            expires_at: record.expires_at,
        }
    }
}

/// Result of a link claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResponse {
    pub ok: bool,
    pub merged_credits: i64,
    pub external_id: String,
    pub display_name: String,
    pub wallet: WalletSnapshot,
    pub new_badges: Vec<String>,
}

impl From<LinkOutcome> for LinkResponse {
    fn from(outcome: LinkOutcome) -> Self {
        Self {
            ok: true,
            merged_credits: outcome.merged_credits,
            external_id: outcome.external_id,
            display_name: outcome.display_name,
            wallet: WalletSnapshot::from(&outcome.account),
            new_badges: outcome.new_badges,
        }
    }
}

/// Result of an award by messaging identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAwardResponse {
    pub ok: bool,

    /// `telegram_not_linked` when there is no linked account.
    pub reason: Option<String>,

    pub duplicate: bool,
    pub credited_amount: Option<i64>,
    pub wallet: Option<WalletSnapshot>,
    pub new_badges: Vec<String>,

    /// Unclaimed credits while unlinked.
    pub pending_credits: Option<i64>,
}

impl From<ExternalAwardOutcome> for ExternalAwardResponse {
    fn from(outcome: ExternalAwardOutcome) -> Self {
        Self {
            ok: outcome.ok,
            reason: outcome.reason.map(str::to_string),
            duplicate: outcome.duplicate,
            credited_amount: outcome.credited_amount,
            wallet: outcome.wallet.as_ref().map(WalletSnapshot::from),
            new_badges: outcome.new_badges,
            pending_credits: outcome.pending_credits,
        }
    }
}

/// One leaderboard row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntryResponse {
    /// 1-based position.
    pub rank: usize,
    pub account_id: String,
    pub credits: i64,
    pub impact: f64,
    pub badges: Vec<String>,
}

/// Verified Telegram login.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramLoginResponse {
    pub external_id: String,
    pub display_name: String,
    pub username: Option<String>,

    /// Wallet account the identity is linked to, if any.
    pub linked_account_id: Option<String>,
}

/// Result of an inbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventResponse {
    Award(AwardResponse),
    External(ExternalAwardResponse),
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall status ("healthy" or "unhealthy").
    pub status: String,

    /// Storage backend in use.
    pub storage: String,

    /// Storage reachable.
    pub storage_ok: bool,

    /// Backend version.
    pub version: String,

    /// Current server time.
    pub timestamp: DateTime<Utc>,
}
