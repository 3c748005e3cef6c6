//! # API Request Handlers
//!
//! This module contains the handler functions for each API endpoint.
//! Each handler:
//! 1. Extracts request data
//! 2. Validates it into a typed command
//! 3. Calls the appropriate service
//! 4. Returns a formatted response and pushes WebSocket updates
//!
//! ## Error Handling
//!
//! All errors are returned in the JSON envelope:
//!
//! ```json
//! {
//!     "success": false,
//!     "error": {
//!         "code": "FAILED_PRECONDITION",
//!         "reason": "insufficient_credits",
//!         "message": "Not enough credits for this redemption"
//!     }
//! }
//! ```
//!
//! | Error | Status |
//! |-------|--------|
//! | `InvalidArgument` | 400 |
//! | `PermissionDenied` | 403 |
//! | `FailedPrecondition` | 409 |
//! | `Internal` | 500 |

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::db::{AccountRecord, LedgerEntryRecord};
use crate::models::{
    ApiResponse, AwardRequest, AwardResponse, BalanceResponse, CreateLinkCodeRequest,
    EntryResponse, EventAction, EventResponse, ExternalAwardRequest, ExternalAwardResponse,
    HealthResponse, InboundEvent, LeaderboardEntryResponse, LeaderboardQuery, LinkCodeResponse,
    LinkResponse, LinkWithCodeRequest, RedeemRequest, TelegramLoginRequest,
    TelegramLoginResponse,
};
use crate::services::identity::ExternalAwardOutcome;
use crate::services::telegram_auth::verify_login;
use crate::services::{AwardOutcome, WalletError};
use crate::websocket::{AccountLinkedData, WalletUpdatedData, WsEventType};
use crate::AppState;

/// Header carrying the shared secret on `/events`.
pub const WEBHOOK_SECRET_HEADER: &str = "X-Webhook-Secret";

/// Map a service error onto its HTTP status and envelope.
pub fn error_response(e: &WalletError) -> HttpResponse {
    let status = match e {
        WalletError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        WalletError::FailedPrecondition(_) => StatusCode::CONFLICT,
        WalletError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        WalletError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    match e {
        WalletError::Internal(_) => error!("Request failed: {}", e),
        _ => warn!("Request rejected: {}", e),
    }

    HttpResponse::build(status).json(ApiResponse::<()>::from_error(e))
}

/// Envelope malformed JSON bodies like any other invalid argument.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::BadRequest().json(ApiResponse::<()>::error(
            "INVALID_ARGUMENT",
            "invalid_argument",
            &err.to_string(),
        ));
        actix_web::error::InternalError::from_response(err, response).into()
    })
}

// ==========================================
// WEBSOCKET NOTIFICATIONS
// ==========================================

async fn notify_wallet(
    state: &AppState,
    account: &AccountRecord,
    entry: Option<&LedgerEntryRecord>,
    new_badges: &[String],
) {
    let Some(entry) = entry else {
        return;
    };

    let data = WalletUpdatedData {
        account_id: account.id.clone(),
        credits: account.credits,
        impact: account.impact,
        delta: entry.amount,
        entry_id: entry.id.clone(),
        kind: entry.kind,
        new_badges: new_badges.to_vec(),
    };
    if let Err(e) = state
        .ws_registry
        .send_to_account(&account.id, WsEventType::WalletUpdated, data)
        .await
    {
        warn!("Failed to push wallet update for {}: {}", account.id, e);
    }
}

async fn notify_award(state: &AppState, outcome: &AwardOutcome) {
    notify_wallet(
        state,
        &outcome.account,
        outcome.entry.as_ref(),
        &outcome.new_badges,
    )
    .await;
}

async fn notify_external(state: &AppState, outcome: &ExternalAwardOutcome) {
    if let Some(account) = &outcome.wallet {
        notify_wallet(state, account, outcome.entry.as_ref(), &outcome.new_badges).await;
    }
}

// ==========================================
// INFO & HEALTH
// ==========================================

/// API information endpoint (root).
///
/// `GET /`
pub async fn api_info() -> HttpResponse {
    let info = json!({
        "name": "Eco-Credits Wallet API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Ledger-backed wallet for eco-credits",
        "endpoints": {
            "health": { "method": "GET", "path": "/health" },
            "wallet": {
                "balance": { "method": "GET", "path": "/wallet/{account}" },
                "history": { "method": "GET", "path": "/wallet/{account}/history" },
                "award": { "method": "POST", "path": "/wallet/award" },
                "redeem": { "method": "POST", "path": "/wallet/redeem" }
            },
            "leaderboard": { "method": "GET", "path": "/leaderboard?limit=" },
            "link": {
                "code": { "method": "POST", "path": "/link/code" },
                "claim": { "method": "POST", "path": "/link/claim" }
            },
            "external": { "method": "POST", "path": "/external/award" },
            "auth": { "method": "POST", "path": "/auth/telegram" },
            "events": { "method": "POST", "path": "/events" },
            "websocket": { "method": "GET", "path": "/ws/{account}" }
        }
    });

    HttpResponse::Ok().json(ApiResponse::success(info))
}

/// Health check endpoint.
///
/// `GET /health`
///
/// ```bash
/// curl http://127.0.0.1:8080/health
/// ```
pub async fn health_check(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let storage_ok = state.store.ping().await;

    let response = HealthResponse {
        status: if storage_ok { "healthy" } else { "unhealthy" }.to_string(),
        storage: state.config.storage_backend.as_str().to_string(),
        storage_ok,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };

    let status_code = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    HttpResponse::build(status_code).json(ApiResponse::success(response))
}

// ==========================================
// WALLET
// ==========================================

/// Get the wallet of an account.
///
/// `GET /wallet/{account}`
///
/// Unknown accounts read as an empty wallet.
pub async fn get_balance(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> HttpResponse {
    let account_id = path.into_inner();
    debug!("Balance request for {}", account_id);

    match state.engine.get_balance(&account_id).await {
        Ok(account) => HttpResponse::Ok().json(ApiResponse::success(BalanceResponse::from(account))),
        Err(e) => error_response(&e),
    }
}

/// Get the most recent ledger entries of an account.
///
/// `GET /wallet/{account}/history`
pub async fn get_history(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> HttpResponse {
    let account_id = path.into_inner();

    match state.reader.history(&account_id).await {
        Ok(entries) => {
            let entries: Vec<EntryResponse> = entries.into_iter().map(EntryResponse::from).collect();
            HttpResponse::Ok().json(ApiResponse::success(entries))
        }
        Err(e) => error_response(&e),
    }
}

/// Award credits.
///
/// `POST /wallet/award`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/wallet/award \
///   -H "Content-Type: application/json" \
///   -d '{
///     "accountId": "acct1",
///     "amount": 15,
///     "description": "Sorted plastic bottle",
///     "origin": "web",
///     "idempotencyKey": "scan:8f2c:acct1"
///   }'
/// ```
///
/// A repeated `idempotencyKey` returns 200 with `"duplicate": true`.
pub async fn award(
    state: web::Data<Arc<AppState>>,
    body: web::Json<AwardRequest>,
) -> HttpResponse {
    let command = match body.into_inner().validate() {
        Ok(command) => command,
        Err(e) => return error_response(&e),
    };
    info!(
        "Award request: {} credits for {} ({:?})",
        command.amount, command.account_id, command.action_kind
    );

    match state.engine.award(command).await {
        Ok(outcome) => {
            notify_award(&state, &outcome).await;
            HttpResponse::Ok().json(ApiResponse::success(AwardResponse::from(outcome)))
        }
        Err(e) => error_response(&e),
    }
}

/// Redeem credits.
///
/// `POST /wallet/redeem`
///
/// `amount` is negative. Overdrawing returns 409 `insufficient_credits`.
pub async fn redeem(
    state: web::Data<Arc<AppState>>,
    body: web::Json<RedeemRequest>,
) -> HttpResponse {
    let command = match body.into_inner().validate() {
        Ok(command) => command,
        Err(e) => return error_response(&e),
    };
    info!(
        "Redeem request: {} credits for {}",
        command.amount, command.account_id
    );

    match state.engine.redeem(command).await {
        Ok(outcome) => {
            notify_award(&state, &outcome).await;
            HttpResponse::Ok().json(ApiResponse::success(AwardResponse::from(outcome)))
        }
        Err(e) => error_response(&e),
    }
}

/// Top accounts by balance.
///
/// `GET /leaderboard?limit=10`
pub async fn get_leaderboard(
    state: web::Data<Arc<AppState>>,
    query: web::Query<LeaderboardQuery>,
) -> HttpResponse {
    match state.reader.leaderboard(query.limit).await {
        Ok(accounts) => {
            let rows: Vec<LeaderboardEntryResponse> = accounts
                .into_iter()
                .enumerate()
                .map(|(i, account)| LeaderboardEntryResponse {
                    rank: i + 1,
                    account_id: account.id,
                    credits: account.credits,
                    impact: account.impact,
                    badges: account.badges,
                })
                .collect();
            HttpResponse::Ok().json(ApiResponse::success(rows))
        }
        Err(e) => error_response(&e),
    }
}

// ==========================================
// IDENTITY
// ==========================================

/// Issue a link code for a messaging identity.
///
/// `POST /link/code`
///
/// ```json
/// { "externalId": "tg_42", "displayName": "Alice" }
/// ```
pub async fn create_link_code(
    state: web::Data<Arc<AppState>>,
    body: web::Json<CreateLinkCodeRequest>,
) -> HttpResponse {
    if let Err(e) = body.validate() {
        return error_response(&e);
    }
    let display_name = body
        .display_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(body.external_id.as_str());

    match state
        .identity
        .create_link_code(&body.external_id, display_name)
        .await
    {
        Ok(record) => HttpResponse::Ok().json(ApiResponse::success(LinkCodeResponse::from(record))),
        Err(e) => error_response(&e),
    }
}

/// Link an account using a code and merge pending credits.
///
/// `POST /link/claim`
///
/// Unknown, expired or used codes return 409 `invalid_or_expired`.
pub async fn link_with_code(
    state: web::Data<Arc<AppState>>,
    body: web::Json<LinkWithCodeRequest>,
) -> HttpResponse {
    if let Err(e) = body.validate() {
        return error_response(&e);
    }
    info!("Link claim by {}", body.account_id);

    match state.identity.link_with_code(&body.account_id, &body.code).await {
        Ok(outcome) => {
            notify_wallet(
                &state,
                &outcome.account,
                outcome.merge_entry.as_ref(),
                &outcome.new_badges,
            )
            .await;

            let linked = AccountLinkedData {
                account_id: outcome.account_id.clone(),
                external_id: outcome.external_id.clone(),
                display_name: outcome.display_name.clone(),
                merged_credits: outcome.merged_credits,
            };
            if let Err(e) = state
                .ws_registry
                .send_to_account(&outcome.account_id, WsEventType::AccountLinked, linked)
                .await
            {
                warn!("Failed to push link event: {}", e);
            }

            HttpResponse::Ok().json(ApiResponse::success(LinkResponse::from(outcome)))
        }
        Err(e) => error_response(&e),
    }
}

/// Award credits to a messaging identity.
///
/// `POST /external/award`
///
/// An unlinked identity gets 200 with `"ok": false` and
/// `"reason": "telegram_not_linked"`; the credits wait as pending.
pub async fn award_by_external_id(
    state: web::Data<Arc<AppState>>,
    body: web::Json<ExternalAwardRequest>,
) -> HttpResponse {
    let command = match body.into_inner().validate() {
        Ok(command) => command,
        Err(e) => return error_response(&e),
    };
    info!("External award request for {}", command.external_id);

    match state.identity.award_by_external_id(command).await {
        Ok(outcome) => {
            notify_external(&state, &outcome).await;
            HttpResponse::Ok().json(ApiResponse::success(ExternalAwardResponse::from(outcome)))
        }
        Err(e) => error_response(&e),
    }
}

/// Verify a Telegram login widget payload.
///
/// `POST /auth/telegram`
pub async fn telegram_login(
    state: web::Data<Arc<AppState>>,
    body: web::Json<TelegramLoginRequest>,
) -> HttpResponse {
    let identity = match verify_login(
        &body.signed_fields(),
        &state.config.telegram_bot_token,
        state.config.auth_max_age,
        Utc::now(),
    ) {
        Ok(identity) => identity,
        Err(e) => return error_response(&e),
    };
    info!("Telegram login verified for {}", identity.id);

    match state.identity.resolve(&identity.id).await {
        Ok(link) => HttpResponse::Ok().json(ApiResponse::success(TelegramLoginResponse {
            display_name: identity.display_name(),
            external_id: identity.id,
            username: identity.username,
            linked_account_id: link.map(|l| l.account_id),
        })),
        Err(e) => error_response(&e),
    }
}

// ==========================================
// INBOUND EVENTS
// ==========================================

fn check_webhook_secret(req: &HttpRequest, expected: Option<&str>) -> Result<(), WalletError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let provided = req
        .headers()
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(WalletError::PermissionDenied(
            "missing or wrong webhook secret".to_string(),
        ))
    }
}

/// Inbound webhook event.
///
/// `POST /events`
///
/// Redelivering an event is a duplicate, never a second credit.
pub async fn handle_event(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    body: web::Json<InboundEvent>,
) -> HttpResponse {
    if let Err(e) = check_webhook_secret(&req, state.config.webhook_secret.as_deref()) {
        return error_response(&e);
    }

    let event = body.into_inner();
    info!("Inbound event {}", event.event_id());

    let action = match event.validate() {
        Ok(action) => action,
        Err(e) => return error_response(&e),
    };

    match action {
        EventAction::Award(command) => match state.engine.award(command).await {
            Ok(outcome) => {
                notify_award(&state, &outcome).await;
                HttpResponse::Ok().json(ApiResponse::success(EventResponse::Award(
                    AwardResponse::from(outcome),
                )))
            }
            Err(e) => error_response(&e),
        },
        EventAction::External(command) => {
            match state.identity.award_by_external_id(command).await {
                Ok(outcome) => {
                    notify_external(&state, &outcome).await;
                    HttpResponse::Ok().json(ApiResponse::success(EventResponse::External(
                        ExternalAwardResponse::from(outcome),
                    )))
                }
                Err(e) => error_response(&e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use actix_web::{test, App};
    use serde_json::Value;

    use super::*;
    use crate::api::configure_routes;
    use crate::config::AppConfig;
    use crate::db::MemoryStore;
    use crate::services::telegram_auth::sign_fields;

    fn state(config: AppConfig) -> Arc<AppState> {
        Arc::new(AppState::new(Arc::new(MemoryStore::new()), config))
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .configure(configure_routes),
            )
            .await
        };
    }

    fn award_body(account: &str, amount: i64, key: &str) -> Value {
        json!({
            "accountId": account,
            "amount": amount,
            "description": "Sorted plastic bottle",
            "origin": "web",
            "idempotencyKey": key
        })
    }

    #[actix_web::test]
    async fn test_award_then_duplicate() {
        let state = state(AppConfig::in_memory());
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/wallet/award")
            .set_json(award_body("acct1", 10, "k1"))
            .to_request();
        let first: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(first["success"], true);
        assert_eq!(first["data"]["duplicate"], false);
        assert_eq!(first["data"]["wallet"]["credits"], 10);

        let req = test::TestRequest::post()
            .uri("/wallet/award")
            .set_json(award_body("acct1", 10, "k1"))
            .to_request();
        let second: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(second["data"]["duplicate"], true);
        assert_eq!(second["data"]["reason"], "duplicate");
        assert_eq!(second["data"]["wallet"]["credits"], 10);

        let req = test::TestRequest::get().uri("/wallet/acct1/history").to_request();
        let history: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(history["data"].as_array().map(Vec::len), Some(1));
    }

    #[actix_web::test]
    async fn test_validation_maps_to_400() {
        let state = state(AppConfig::in_memory());
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/wallet/award")
            .set_json(award_body("acct1", -5, "k1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "INVALID_ARGUMENT");

        let mut bad_origin = award_body("acct1", 5, "k2");
        bad_origin["origin"] = json!("carrier_pigeon");
        let req = test::TestRequest::post()
            .uri("/wallet/award")
            .set_json(bad_origin)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_overdraw_maps_to_409() {
        let state = state(AppConfig::in_memory());
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/wallet/award")
            .set_json(award_body("acct1", 10, "k1"))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::post()
            .uri("/wallet/redeem")
            .set_json(json!({
                "accountId": "acct1",
                "amount": -50,
                "description": "Coffee voucher",
                "idempotencyKey": "r1"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["reason"], "insufficient_credits");

        let req = test::TestRequest::get().uri("/wallet/acct1").to_request();
        let wallet: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(wallet["data"]["credits"], 10);
    }

    #[actix_web::test]
    async fn test_pending_credits_merge_on_link() {
        let state = state(AppConfig::in_memory());
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/external/award")
            .set_json(json!({
                "externalId": "tg_42",
                "amount": 30,
                "description": "Scan via bot",
                "idempotencyKey": "bot:1"
            }))
            .to_request();
        let pending: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(pending["data"]["ok"], false);
        assert_eq!(pending["data"]["reason"], "telegram_not_linked");
        assert_eq!(pending["data"]["pendingCredits"], 30);

        let req = test::TestRequest::post()
            .uri("/link/code")
            .set_json(json!({ "externalId": "tg_42", "displayName": "Alice" }))
            .to_request();
        let code: Value = test::call_and_read_body_json(&app, req).await;
        let code = code["data"]["code"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri("/link/claim")
            .set_json(json!({ "accountId": "acct1", "code": code }))
            .to_request();
        let linked: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(linked["data"]["mergedCredits"], 30);
        assert_eq!(linked["data"]["wallet"]["credits"], 30);

        // Reusing the code fails
        let req = test::TestRequest::post()
            .uri("/link/claim")
            .set_json(json!({ "accountId": "acct2", "code": code }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn test_events_require_secret_and_dedupe() {
        let mut config = AppConfig::in_memory();
        config.webhook_secret = Some("s3cret".to_string());
        let state = state(config);
        let app = app!(state);

        let event = json!({
            "type": "scan_completed",
            "eventId": "evt_1",
            "accountId": "acct1",
            "category": "plastic",
            "credits": 15
        });

        let req = test::TestRequest::post()
            .uri("/events")
            .set_json(event.clone())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        for expected_duplicate in [false, true] {
            let req = test::TestRequest::post()
                .uri("/events")
                .insert_header((WEBHOOK_SECRET_HEADER, "s3cret"))
                .set_json(event.clone())
                .to_request();
            let body: Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["data"]["duplicate"], expected_duplicate);
            assert_eq!(body["data"]["wallet"]["credits"], 15);
        }
    }

    #[actix_web::test]
    async fn test_telegram_login() {
        let mut config = AppConfig::in_memory();
        config.telegram_bot_token = "123:abc".to_string();
        let state = state(config);
        let app = app!(state);

        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), "42".to_string());
        fields.insert("first_name".to_string(), "Alice".to_string());
        fields.insert("auth_date".to_string(), Utc::now().timestamp().to_string());
        let hash = sign_fields(&fields, "123:abc").unwrap();

        let req = test::TestRequest::post()
            .uri("/auth/telegram")
            .set_json(json!({
                "id": 42,
                "first_name": "Alice",
                "auth_date": fields["auth_date"].parse::<i64>().unwrap(),
                "hash": hash
            }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["externalId"], "42");
        assert_eq!(body["data"]["displayName"], "Alice");
        assert_eq!(body["data"]["linkedAccountId"], Value::Null);

        let req = test::TestRequest::post()
            .uri("/auth/telegram")
            .set_json(json!({
                "id": 42,
                "first_name": "Mallory",
                "auth_date": fields["auth_date"].parse::<i64>().unwrap(),
                "hash": hash
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_leaderboard_and_health() {
        let state = state(AppConfig::in_memory());
        let app = app!(state);

        for (account, amount) in [("alice", 50), ("bob", 30)] {
            let req = test::TestRequest::post()
                .uri("/wallet/award")
                .set_json(award_body(account, amount, account))
                .to_request();
            test::call_service(&app, req).await;
        }

        let req = test::TestRequest::get().uri("/leaderboard?limit=1").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"][0]["rank"], 1);
        assert_eq!(body["data"][0]["accountId"], "alice");
        assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["status"], "healthy");
        assert_eq!(body["data"]["storage"], "memory");
    }
}
