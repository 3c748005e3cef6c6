//! # Database Module
//!
//! This module handles all storage for the Eco-Credit wallet.
//! PostgreSQL holds:
//!
//! - Accounts (balance, impact, completed activities, badges)
//! - The immutable ledger of awards and redemptions
//! - Daily ad-watch counters
//! - Messaging identity links, pending credits and link codes
//! - Reconciliation logs (for auditing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      STORAGE LAYER                               │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                 CreditStore (trait)                        │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │               │                               │                  │
//! │               ▼                               ▼                  │
//! │  ┌──────────────────────────┐     ┌──────────────────────────┐  │
//! │  │ Database                 │     │ MemoryStore              │  │
//! │  │ (deadpool-postgres)      │     │ (per-account mutexes)    │  │
//! │  └──────────────────────────┘     └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

use deadpool_postgres::{Config, Pool, Runtime};
use thiserror::Error;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config as TokioConfig, NoTls};
use tracing::{error, info, warn};

/// Schema applied at startup. Every statement is `IF NOT EXISTS`.
const INITIAL_SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to connect to the database
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryError(#[from] tokio_postgres::Error),

    /// Migration failed
    #[error("Migration failed: {0}")]
    MigrationError(String),

    /// A stored value could not be decoded
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl DatabaseError {
    /// Whether the failure was a write conflict worth retrying.
    ///
    /// PostgreSQL error codes:
    /// 40001 = serialization_failure
    /// 40P01 = deadlock_detected
    pub fn is_retryable(&self) -> bool {
        match self {
            DatabaseError::QueryError(e) => matches!(
                e.code(),
                Some(code) if *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::T_R_DEADLOCK_DETECTED
            ),
            _ => false,
        }
    }
}

/// Database connection wrapper.
///
/// Wraps the connection pool. The `CreditStore` implementation for
/// this type lives in [`store`].
///
/// ## Usage
///
/// ```rust,ignore
/// let db = Database::connect("postgres://...", 10, 3).await?;
/// db.run_migrations().await?;
/// ```
#[derive(Clone)]
pub struct Database {
    /// The connection pool
    pool: Pool,

    /// Attempts per transaction before a conflict is surfaced.
    max_retries: u32,
}

impl Database {
    /// Connect to the PostgreSQL database.
    ///
    /// ## Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    /// * `pool_size` - Maximum pooled connections
    /// * `max_retries` - Attempts per conflicting transaction
    ///
    /// ## Returns
    ///
    /// * `Ok(Database)` - Connected successfully
    /// * `Err(DatabaseError)` - Connection failed
    pub async fn connect(
        database_url: &str,
        pool_size: usize,
        max_retries: u32,
    ) -> Result<Self, DatabaseError> {
        info!("Connecting to database...");

        // Parse the connection string using tokio_postgres::Config
        let tokio_config = database_url
            .parse::<TokioConfig>()
            .map_err(|e| DatabaseError::ConfigError(format!("Invalid database URL: {}", e)))?;

        // Convert to deadpool config
        let mut config = Config::new();

        if let Some(dbname) = tokio_config.get_dbname() {
            config.dbname = Some(dbname.to_string());
        }
        if let Some(user) = tokio_config.get_user() {
            config.user = Some(user.to_string());
        }
        if let Some(password) = tokio_config.get_password() {
            config.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(tokio_postgres::config::Host::Tcp(host)) = tokio_config.get_hosts().first() {
            config.host = Some(host.clone());
        }
        if let Some(port) = tokio_config.get_ports().first() {
            config.port = Some(*port);
        }

        config.pool = Some(deadpool_postgres::PoolConfig {
            max_size: pool_size,
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        // Test connection
        let client = pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        client
            .query("SELECT 1", &[])
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        info!("Database connection established");

        Ok(Self {
            pool,
            max_retries: max_retries.max(1),
        })
    }

    /// Run database migrations.
    ///
    /// The schema is compiled into the binary and every statement is
    /// idempotent, so this runs on each startup.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        info!("Running database migrations...");

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        // Drop full-line comments; batch_execute handles the rest
        let cleaned_sql: String = INITIAL_SCHEMA
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        info!("Executing migration SQL ({} bytes)...", cleaned_sql.len());

        match client.batch_execute(&cleaned_sql).await {
            Ok(_) => {
                info!("Migrations completed successfully");
                Ok(())
            }
            Err(e) => {
                let error_code = e.code().cloned();
                let detail = e
                    .as_db_error()
                    .and_then(|db_err| db_err.detail())
                    .unwrap_or("No detail available")
                    .to_string();

                error!("Migration execution error: {}", e);
                error!("  Detail: {}", detail);

                // 42P07 = duplicate_table, 42710 = duplicate_object
                let is_duplicate_error = error_code
                    .as_ref()
                    .map(|code| *code == SqlState::DUPLICATE_TABLE || *code == SqlState::DUPLICATE_OBJECT)
                    .unwrap_or(false);

                if is_duplicate_error {
                    warn!(
                        "Some database objects already exist (code: {:?}). Treating migrations as applied.",
                        error_code.map(|c| c.code().to_string())
                    );
                    Ok(())
                } else {
                    Err(DatabaseError::MigrationError(format!(
                        "{} (code: {:?}, detail: {})",
                        e,
                        error_code.map(|c| c.code().to_string()),
                        detail
                    )))
                }
            }
        }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Attempts per transaction before a conflict is surfaced.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

// Re-export commonly used items
pub use memory::MemoryStore;
pub use models::*;
pub use store::CreditStore;
