//! # Eco-Credits Wallet Backend Service
//!
//! This is the main entry point for the backend service that keeps the
//! Eco-Credits wallet. It provides:
//!
//! - REST API for awards, redemptions, history and the leaderboard
//! - Telegram identity linking with pending-credit merge
//! - WebSocket connections for live wallet updates
//! - Background ledger audit and link code sweep
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BACKEND SERVICE                          │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  REST API   │  │  WebSocket  │  │   Background Services   │  │
//! │  │  (Actix)    │  │  Server     │  │  • Ledger Auditor       │  │
//! │  │  /wallet    │  │  /ws        │  │  • Link Code Sweep      │  │
//! │  │  /link      │  │             │  │                         │  │
//! │  │  /events    │  │             │  │                         │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! │         │                │                     │                │
//! │         └────────────────┴─────────────────────┘                │
//! │                          │                                      │
//! │  ┌───────────────────────┴───────────────────────────────────┐  │
//! │  │                    SERVICE LAYER                          │  │
//! │  │  WalletEngine · AdLimiter · IdentityService · Reader      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                          │                                      │
//! │                   ┌──────┴──────┐                               │
//! │                   │ CreditStore │  PostgreSQL or in-memory      │
//! │                   └─────────────┘                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! 1. Set up PostgreSQL and create the database (or set `STORAGE_BACKEND=memory`)
//! 2. Put the configuration in `.env`
//! 3. Start the server: `cargo run`; the schema is created on startup

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod api;
mod config;
mod db;
mod models;
mod services;
mod utils;
mod websocket;

use config::{AppConfig, StorageBackend};
use db::{CreditStore, Database, MemoryStore};
use services::{IdentityService, LedgerAuditor, WalletEngine, WalletReader};
use websocket::WsRegistry;

/// Application state shared across all handlers.
pub struct AppState {
    /// Wallet storage (PostgreSQL or in-memory)
    pub store: Arc<dyn CreditStore>,

    /// Awards and redemptions
    pub engine: WalletEngine,

    /// Telegram linking and pending credits
    pub identity: IdentityService,

    /// Leaderboard and history
    pub reader: WalletReader,

    /// Application configuration
    pub config: AppConfig,

    /// WebSocket connection registry for live updates
    pub ws_registry: WsRegistry,
}

impl AppState {
    pub fn new(store: Arc<dyn CreditStore>, config: AppConfig) -> Self {
        let engine = WalletEngine::new(store.clone(), config.clone());
        let identity = IdentityService::new(store.clone(), engine.clone(), config.clone());
        let reader = WalletReader::new(store.clone(), config.clone());

        Self {
            store,
            engine,
            identity,
            reader,
            config,
            ws_registry: WsRegistry::new(),
        }
    }
}

async fn open_store(config: &AppConfig) -> std::io::Result<Arc<dyn CreditStore>> {
    match config.storage_backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage; state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| std::io::Error::other("DATABASE_URL is required"))?;

            let db = Database::connect(url, config.database_pool_size, config.tx_max_retries)
                .await
                .map_err(std::io::Error::other)?;
            info!("Database connected");

            db.run_migrations().await.map_err(std::io::Error::other)?;
            info!("Database migrations complete");

            Ok(Arc::new(db))
        }
    }
}

/// Main entry point for the backend service.
///
/// 1. Loads configuration from environment
/// 2. Opens the configured store
/// 3. Starts the ledger auditor
/// 4. Launches the HTTP server
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    // =========================================
    // STEP 1: Initialize Logging
    // =========================================
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(std::io::Error::other)?;

    info!("🌱 Starting Eco-Credits Wallet Backend Service");

    // =========================================
    // STEP 2: Load Configuration
    // =========================================
    let config = AppConfig::from_env().map_err(std::io::Error::other)?;

    info!("📋 Configuration loaded");
    info!("   Storage: {}", config.storage_backend.as_str());
    info!("   Reference offset: {}", config.reference_offset);

    // =========================================
    // STEP 3: Open Storage & Services
    // =========================================
    let store = open_store(&config).await?;
    let app_state = Arc::new(AppState::new(store.clone(), config.clone()));

    info!("🔧 Services initialized");

    // =========================================
    // STEP 4: Start Background Services
    // =========================================
    let auditor = LedgerAuditor::new(store, config.clone());
    tokio::spawn(async move {
        auditor.start().await;
    });

    info!("📊 Ledger auditor started");

    // =========================================
    // STEP 5: Start HTTP Server
    // =========================================
    let server_host = config.server_host.clone();
    let server_port = config.server_port;

    info!("🌐 Starting HTTP server on {}:{}", server_host, server_port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .configure(api::configure_routes)
            .configure(websocket::configure_routes)
    })
    .bind(format!("{}:{}", server_host, server_port))?
    .run()
    .await
}
