//! Service wiring
//!
//! Builds every ledger component over one store from a [`LedgerConfig`]:
//! the store's lock bound comes from `lock_timeout_ms` and the engine's retry
//! budget from the `retry` section.

use std::sync::Arc;

use tracing::info;

use crate::account::{AccountRepository, UserRepository};
use crate::config::LedgerConfig;
use crate::currency::CurrencyRegistry;
use crate::db::Database;
use crate::error::LedgerError;
use crate::funding::FundingService;
use crate::ledger::TransactionLedger;
use crate::store::{LedgerStore, MemoryStore, PgStore};
use crate::transfer::TransferEngine;

pub struct LedgerServices<S: LedgerStore> {
    pub store: Arc<S>,
    pub currencies: Arc<CurrencyRegistry<S>>,
    pub users: Arc<UserRepository<S>>,
    pub accounts: Arc<AccountRepository<S>>,
    pub ledger: Arc<TransactionLedger<S>>,
    pub funding: Arc<FundingService<S>>,
    pub engine: Arc<TransferEngine<S>>,
}

impl<S: LedgerStore> LedgerServices<S> {
    pub fn new(store: Arc<S>, config: &LedgerConfig) -> Self {
        let currencies = Arc::new(CurrencyRegistry::new(store.clone()));
        let accounts = Arc::new(AccountRepository::new(store.clone(), currencies.clone()));
        let ledger = Arc::new(TransactionLedger::new(store.clone()));
        let funding = Arc::new(FundingService::new(
            store.clone(),
            accounts.clone(),
            ledger.clone(),
        ));
        let engine = TransferEngine::new(
            store.clone(),
            currencies.clone(),
            accounts.clone(),
            ledger.clone(),
        )
        .with_retry_policy(config.retry.policy());

        Self {
            users: Arc::new(UserRepository::new(store.clone())),
            store,
            currencies,
            accounts,
            ledger,
            funding,
            engine: Arc::new(engine),
        }
    }
}

impl LedgerServices<MemoryStore> {
    pub fn in_memory(config: &LedgerConfig) -> Self {
        let store = Arc::new(MemoryStore::with_lock_timeout(config.lock_timeout()));
        Self::new(store, config)
    }
}

impl LedgerServices<PgStore> {
    /// Connect to `postgres_url` and check the database answers
    pub async fn connect(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let url = config
            .postgres_url
            .as_deref()
            .ok_or_else(|| LedgerError::Config("postgres_url is not configured".into()))?;

        let db = Database::connect(url, &config.pool).await?;
        db.health_check().await?;
        info!(
            max_connections = config.pool.max_connections,
            lock_timeout_ms = config.lock_timeout_ms,
            "Ledger store connected"
        );

        let store = Arc::new(PgStore::new(db.pool().clone(), config.lock_timeout()));
        Ok(Self::new(store, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::models::CurrencyCode;
    use crate::store::StoreTx;
    use crate::transfer::TransferRequest;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn config(lock_timeout_ms: u64, max_attempts: u32) -> LedgerConfig {
        LedgerConfig {
            lock_timeout_ms,
            retry: RetryConfig {
                max_attempts,
                base_delay_ms: 5,
                max_delay_ms: 20,
            },
            ..LedgerConfig::default()
        }
    }

    #[test]
    fn test_engine_takes_retry_policy_from_config() {
        let services = LedgerServices::in_memory(&config(100, 7));
        let policy = services.engine.retry_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.base_delay, Duration::from_millis(5));
        assert_eq!(policy.max_delay, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_configured_retry_budget_governs_execute_with_retry() {
        // 50ms lock bound, one attempt only: a held row lock exhausts it.
        let services = LedgerServices::in_memory(&config(50, 1));
        services.currencies.ensure_defaults().await.unwrap();

        let mut ids = Vec::new();
        for email in ["a@example.com", "b@example.com"] {
            let user = services.users.create(email, "hash").await.unwrap();
            let account = services.accounts.open(user.id, CurrencyCode::Usd).await.unwrap();
            services.funding.deposit(account.id, dec!(10.00)).await.unwrap();
            ids.push(account.id);
        }

        let mut holder = services.store.begin().await.unwrap();
        holder.lock_account(ids[0]).await.unwrap();

        let req = TransferRequest::new(ids[0], ids[1], dec!(1.00));
        let err = services.engine.execute_with_retry(req).await.unwrap_err();
        assert_eq!(err, LedgerError::Timeout);
        holder.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_requires_postgres_url() {
        let err = LedgerServices::connect(&LedgerConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
