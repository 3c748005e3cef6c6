//! # REST API Module
//!
//! This module defines all HTTP endpoints for the Eco-Credits wallet.
//!
//! ## Endpoint Overview
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/wallet/:account` | Wallet balance, impact, badges |
//! | GET | `/wallet/:account/history` | Last 50 ledger entries |
//! | POST | `/wallet/award` | Award credits (idempotent) |
//! | POST | `/wallet/redeem` | Redeem credits (idempotent) |
//! | GET | `/leaderboard` | Top accounts by balance |
//! | POST | `/link/code` | Issue a link code for a Telegram identity |
//! | POST | `/link/claim` | Link an account and merge pending credits |
//! | POST | `/external/award` | Award by Telegram identity |
//! | POST | `/auth/telegram` | Verify a Telegram login payload |
//! | POST | `/events` | Inbound webhook events |
//! | GET | `/health` | Health check |
//!
//! ## Request/Response Format
//!
//! All requests and responses use camelCase JSON:
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "FAILED_PRECONDITION",
//!         "reason": "session_cooldown",
//!         "message": "..."
//!     }
//! }
//! ```

pub mod routes;
pub mod handlers;

pub use routes::configure_routes;
