//! # Leaderboard & History Reader
//!
//! Read-only projections over the wallet store.

use std::sync::Arc;

use tracing::debug;

use crate::config::AppConfig;
use crate::db::{AccountRecord, CreditStore, LedgerEntryRecord};
use crate::utils::validate_id;

use super::error::WalletError;

/// Largest leaderboard a caller may ask for.
pub const MAX_LEADERBOARD: i64 = 100;

#[derive(Clone)]
pub struct WalletReader {
    store: Arc<dyn CreditStore>,
    config: AppConfig,
}

impl WalletReader {
    pub fn new(store: Arc<dyn CreditStore>, config: AppConfig) -> Self {
        Self { store, config }
    }

    /// Accounts by balance, highest first. Ties go to the smaller id.
    pub async fn leaderboard(&self, limit: Option<i64>) -> Result<Vec<AccountRecord>, WalletError> {
        let limit = limit
            .unwrap_or(self.config.leaderboard_limit)
            .clamp(1, MAX_LEADERBOARD);
        debug!("Fetching leaderboard (limit {})", limit);
        self.store.top_accounts(limit).await
    }

    /// Most recent ledger entries of an account, newest first.
    pub async fn history(&self, account_id: &str) -> Result<Vec<LedgerEntryRecord>, WalletError> {
        validate_id("accountId", account_id).map_err(WalletError::InvalidArgument)?;
        debug!("Fetching history for {}", account_id);
        self.store
            .get_history(account_id, self.config.history_limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger::tests::{award_cmd, engine};
    use crate::db::MemoryStore;
    use chrono::{Duration, Utc};

    fn reader(store: Arc<MemoryStore>) -> WalletReader {
        WalletReader::new(store, AppConfig::in_memory())
    }

    #[tokio::test]
    async fn test_leaderboard_order_and_limit() {
        let (store, engine) = engine();
        engine.award(award_cmd("carol", 30, "c")).await.unwrap();
        engine.award(award_cmd("alice", 50, "a")).await.unwrap();
        engine.award(award_cmd("bob", 30, "b")).await.unwrap();
        let reader = reader(store);

        let top: Vec<String> = reader
            .leaderboard(None)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(top, vec!["alice", "bob", "carol"]);

        assert_eq!(reader.leaderboard(Some(1)).await.unwrap().len(), 1);
        assert_eq!(reader.leaderboard(Some(0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_capped() {
        let (store, engine) = engine();
        let start = Utc::now();
        for i in 0..55 {
            engine
                .award_at(
                    award_cmd("acct1", 1, &format!("k{}", i)),
                    start + Duration::seconds(i),
                )
                .await
                .unwrap();
        }
        let reader = reader(store);

        let history = reader.history("acct1").await.unwrap();
        assert_eq!(history.len(), 50);
        assert!(history[0].created_at > history[1].created_at);
        assert_eq!(history[0].created_at, start + Duration::seconds(54));
    }

    #[tokio::test]
    async fn test_empty_history() {
        let (store, _engine) = engine();
        let reader = reader(store);
        assert!(reader.history("nobody").await.unwrap().is_empty());
        assert!(reader.history("").await.is_err());
    }
}
