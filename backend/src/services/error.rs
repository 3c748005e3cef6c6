//! # Wallet Errors
//!
//! The small, fixed error taxonomy every wallet operation returns.
//!
//! | Variant | Meaning | Retry? |
//! |---------|---------|--------|
//! | `InvalidArgument` | Malformed or missing field | Never, fix the request |
//! | `FailedPrecondition` | Business rule rejected the call | Later, not immediately |
//! | `PermissionDenied` | Signature or secret check failed | No |
//! | `Internal` | Storage or transaction failure | Yes, same idempotency key |
//!
//! Duplicates are not errors. They come back as a successful outcome
//! tagged with a [`SkipReason`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable reason attached to `FailedPrecondition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// A redemption would take the balance below zero.
    InsufficientCredits,
    /// The daily ad-watch count cap is exhausted.
    MaxAdsReached,
    /// The daily ad-point cap is exhausted.
    MaxAdPointsReached,
    /// A session just finished and the cooldown has not elapsed.
    SessionCooldown,
    /// The link code does not exist, was already used, or expired.
    InvalidOrExpired,
}

impl Reason {
    /// Stable wire string for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::InsufficientCredits => "insufficient_credits",
            Reason::MaxAdsReached => "max_ads_reached",
            Reason::MaxAdPointsReached => "max_ad_points_reached",
            Reason::SessionCooldown => "session_cooldown",
            Reason::InvalidOrExpired => "invalid_or_expired",
        }
    }

    /// Human text for the reason.
    pub fn message(&self) -> &'static str {
        match self {
            Reason::InsufficientCredits => "Not enough credits for this redemption",
            Reason::MaxAdsReached => "Daily ad limit reached",
            Reason::MaxAdPointsReached => "Daily ad reward limit reached",
            Reason::SessionCooldown => "Ad session finished, wait for the cooldown",
            Reason::InvalidOrExpired => "Link code is invalid or expired",
        }
    }
}

/// Why a mutation was skipped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// An entry with the same idempotency key already exists.
    Duplicate,
    /// The activity id is already in the completed set.
    ActivityCompleted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Duplicate => "duplicate",
            SkipReason::ActivityCompleted => "activity_completed",
        }
    }
}

/// Errors surfaced by wallet, identity and reader services.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WalletError {
    /// Malformed or missing request data.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A business rule rejected the operation given current state.
    #[error("{}", .0.message())]
    FailedPrecondition(Reason),

    /// Identity or signature verification failed.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Storage or transaction failure. Safe to retry.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Upper-case category code used in the API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::InvalidArgument(_) => "INVALID_ARGUMENT",
            WalletError::FailedPrecondition(_) => "FAILED_PRECONDITION",
            WalletError::PermissionDenied(_) => "PERMISSION_DENIED",
            WalletError::Internal(_) => "INTERNAL",
        }
    }

    /// Stable reason string for the caller to switch on.
    pub fn reason(&self) -> &'static str {
        match self {
            WalletError::InvalidArgument(_) => "invalid_argument",
            WalletError::FailedPrecondition(reason) => reason.as_str(),
            WalletError::PermissionDenied(_) => "permission_denied",
            WalletError::Internal(_) => "internal",
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        WalletError::InvalidArgument(message.into())
    }
}

impl From<crate::db::DatabaseError> for WalletError {
    fn from(e: crate::db::DatabaseError) -> Self {
        WalletError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(Reason::InsufficientCredits.as_str(), "insufficient_credits");
        assert_eq!(Reason::SessionCooldown.as_str(), "session_cooldown");
        assert_eq!(
            WalletError::FailedPrecondition(Reason::MaxAdPointsReached).reason(),
            "max_ad_points_reached"
        );
        assert_eq!(SkipReason::ActivityCompleted.as_str(), "activity_completed");
    }

    #[test]
    fn test_reason_serializes_as_wire_string() {
        let json = serde_json::to_string(&Reason::InvalidOrExpired).unwrap();
        assert_eq!(json, "\"invalid_or_expired\"");
    }
}
