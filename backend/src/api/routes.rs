//! # API Route Configuration
//!
//! This module sets up all the HTTP routes for the API.

use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health                   GET  - Health check
/// ├── /wallet
/// │   ├── /award                POST - Award credits
/// │   ├── /redeem               POST - Redeem credits
/// │   ├── /:account             GET  - Wallet
/// │   └── /:account/history     GET  - Ledger history
/// ├── /leaderboard              GET  - Top accounts
/// ├── /link
/// │   ├── /code                 POST - Issue link code
/// │   └── /claim                POST - Link with code
/// ├── /external/award           POST - Award by messaging identity
/// ├── /auth/telegram            POST - Verify Telegram login
/// └── /events                   POST - Inbound webhook events
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        .app_data(handlers::json_config())

        // Root endpoint - API information
        .route("/", web::get().to(handlers::api_info))

        // Health check endpoint
        .route("/health", web::get().to(handlers::health_check))

        // Wallet endpoints
        .service(
            web::scope("/wallet")
                .route("/award", web::post().to(handlers::award))
                .route("/redeem", web::post().to(handlers::redeem))
                .route("/{account}", web::get().to(handlers::get_balance))
                .route("/{account}/history", web::get().to(handlers::get_history)),
        )

        .route("/leaderboard", web::get().to(handlers::get_leaderboard))

        // Identity linking
        .service(
            web::scope("/link")
                .route("/code", web::post().to(handlers::create_link_code))
                .route("/claim", web::post().to(handlers::link_with_code)),
        )

        .route("/external/award", web::post().to(handlers::award_by_external_id))
        .route("/auth/telegram", web::post().to(handlers::telegram_login))

        // Inbound webhook events
        .route("/events", web::post().to(handlers::handle_event));
}
