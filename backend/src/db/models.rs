//! # Database Models
//!
//! This module defines the data structures that map to database tables.
//! Each struct represents a row in a table.
//!
//! ## Table Overview
//!
//! | Table | Description |
//! |-------|-------------|
//! | `accounts` | Wallet balance, impact, completed activities, badges |
//! | `ledger_entries` | Immutable award/redeem entries |
//! | `ad_stats` | Daily ad-watch counters, one row per account |
//! | `external_links` | Messaging identity -> account |
//! | `pending_credits` | Unclaimed credits of unlinked identities |
//! | `pending_credit_entries` | Idempotency ledger for pending credits |
//! | `link_codes` | One-time link codes |
//! | `reconciliation_logs` | Balance vs ledger audit trail |
//!
//! ## Relationship Diagram
//!
//! ```text
//! ┌─────────────┐       ┌──────────────────┐
//! │  accounts   │──────<│  ledger_entries  │
//! │             │       │                  │
//! │ id (PK)     │       │ account_id (FK)  │
//! │ credits     │       │ id (sha256 key)  │
//! │ ...         │       │ amount           │
//! └─────────────┘       └──────────────────┘
//!        │
//!        ├──────────────┐
//!        ▼              ▼
//! ┌──────────────┐  ┌──────────────────┐     ┌──────────────────┐
//! │  ad_stats    │  │  external_links  │>────│ pending_credits  │
//! │ account (PK) │  │ external_id (PK) │     │ external_id (PK) │
//! └──────────────┘  └──────────────────┘     └──────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user's wallet.
///
/// ## Note on Types
///
/// Credits are `i64` because PostgreSQL has no unsigned integers.
/// The balance never goes below zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Internal account id (primary key).
    pub id: String,

    /// Spendable credit balance.
    pub credits: i64,

    /// Cumulative environmental impact score.
    pub impact: f64,

    /// One-off activities that already paid out.
    pub completed_activities: Vec<String>,

    /// Earned badge ids.
    pub badges: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountRecord {
    /// A zero-balance account, not yet persisted.
    pub fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            credits: 0,
            impact: 0.0,
            completed_activities: Vec::new(),
            badges: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_completed(&self, activity_id: &str) -> bool {
        self.completed_activities.iter().any(|a| a == activity_id)
    }
}

/// Direction of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Earn,
    Redeem,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Earn => "earn",
            EntryKind::Redeem => "redeem",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earn" => Ok(EntryKind::Earn),
            "redeem" => Ok(EntryKind::Redeem),
            other => Err(format!("unknown entry kind: {}", other)),
        }
    }
}

/// Channel that originated a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Web,
    Messaging,
    Admin,
    System,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Web => "web",
            Origin::Messaging => "messaging",
            Origin::Admin => "admin",
            Origin::System => "system",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Origin::Web),
            "messaging" => Ok(Origin::Messaging),
            "admin" => Ok(Origin::Admin),
            "system" => Ok(Origin::System),
            other => Err(format!("unknown origin: {}", other)),
        }
    }
}

/// One accepted award or redemption. Never updated or deleted.
///
/// ## Example
///
/// Watching the first ad of the day:
/// ```text
/// LedgerEntryRecord {
///     id: "9f86d081884c7d65...",   // sha256("ad:msg-42:acct1")
///     account_id: "acct1",
///     amount: 10,
///     kind: Earn,
///     description: "Watched an ad",
///     origin: Messaging,
///     ...
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntryRecord {
    /// Hex SHA-256 of the caller's idempotency key.
    pub id: String,

    /// Owning account.
    pub account_id: String,

    /// Signed amount: positive for earn, negative for redeem.
    pub amount: i64,

    pub kind: EntryKind,

    pub description: String,

    pub activity_id: Option<String>,

    pub impact_delta: f64,

    pub origin: Origin,

    /// Free-form caller metadata.
    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

/// Daily ad-watch counters for one account.
///
/// A record whose `stat_date` is not "today" in the reference timezone
/// is read as all zeros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdStatRecord {
    pub account_id: String,

    /// Calendar day in the reference timezone.
    pub stat_date: NaiveDate,

    pub total_ads_watched: i32,

    /// Ads in the current uninterrupted session.
    pub current_session_ads: i32,

    pub sessions_completed: i32,

    /// When the last full session ended; the cooldown runs from here.
    pub last_session_end: Option<DateTime<Utc>>,

    pub points_earned: i64,

    pub updated_at: DateTime<Utc>,
}

impl AdStatRecord {
    /// A zeroed record for `date`.
    pub fn fresh(account_id: &str, date: NaiveDate) -> Self {
        Self {
            account_id: account_id.to_string(),
            stat_date: date,
            total_ads_watched: 0,
            current_session_ads: 0,
            sessions_completed: 0,
            last_session_end: None,
            points_earned: 0,
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Credits earned by a messaging identity before it was linked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCreditRecord {
    pub external_id: String,
    pub amount: i64,
    pub impact: f64,
    pub updated_at: DateTime<Utc>,
}

/// One accrual into a pending record, deduplicated by entry id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCreditEntry {
    /// Hex SHA-256 of the caller's idempotency key.
    pub id: String,
    pub external_id: String,
    pub amount: i64,
    pub description: String,
    pub activity_id: Option<String>,
    pub impact_delta: f64,
    pub created_at: DateTime<Utc>,
    /// Set when a link claim folded this entry into the account.
    pub merged_at: Option<DateTime<Utc>>,
}

/// A one-time code binding an external identity to a link attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCodeRecord {
    pub code: String,
    pub external_id: String,
    pub display_name: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl LinkCodeRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Messaging identity linked to an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLinkRecord {
    pub external_id: String,
    pub account_id: String,
    pub display_name: String,
    pub linked_at: DateTime<Utc>,
}

/// Balance against ledger sum for one account.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTotals {
    pub account_id: String,
    pub balance: i64,
    pub ledger_sum: i64,
}

/// Reconciliation log entry.
///
/// Written whenever an account's balance disagrees with the sum of its
/// ledger entries. The balance is left untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationLog {
    /// Unique log ID.
    pub id: Uuid,

    pub account_id: String,

    /// Sum of the account's ledger entries.
    pub expected_balance: i64,

    /// Balance stored on the account row.
    pub actual_balance: i64,

    /// Difference (actual - expected).
    pub difference: i64,

    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
}
