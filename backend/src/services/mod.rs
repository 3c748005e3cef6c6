//! # Services Module
//!
//! This module contains the business logic of the Eco-Credit wallet.
//! Each service handles a specific domain.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `WalletEngine` | Idempotent awards and redemptions |
//! | `ad_limiter` | Ad-watch reward schedule, caps and cooldown (pure) |
//! | `IdentityService` | Link codes, pending credits, external awards |
//! | `WalletReader` | Leaderboard and history |
//! | `LedgerAuditor` | Balance reconciliation, link code sweep |
//! | `telegram_auth` | Login payload verification (pure) |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                            │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                   IdentityService                         │   │
//! │  │  • create_link_code()  • link_with_code()                 │   │
//! │  │  • award_by_external_id()                                 │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                              │                                   │
//! │                              ▼                                   │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                    WalletEngine                           │   │
//! │  │  • award()  • redeem()  • get_balance()                   │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │         │                    │                    │             │
//! │         ▼                    ▼                    ▼             │
//! │  ┌────────────┐      ┌────────────┐       ┌────────────┐       │
//! │  │ ad_limiter │      │   badges   │       │CreditStore │       │
//! │  └────────────┘      └────────────┘       └────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod ad_limiter;
pub mod badges;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod ledger_auditor;
pub mod reader;
pub mod telegram_auth;

pub use error::{Reason, SkipReason, WalletError};
pub use identity::IdentityService;
pub use ledger::{ActionKind, AwardCommand, AwardOutcome, RedeemCommand, WalletEngine};
pub use ledger_auditor::LedgerAuditor;
pub use reader::WalletReader;
