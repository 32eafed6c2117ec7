//! Currency Registry
//!
//! Resolves currency codes to active currencies and checks that two accounts
//! can exchange funds. There is no conversion: a transfer is only possible
//! between accounts of the same currency.
//!
//! Currencies are cached by code and id. Registry writes update the cache;
//! changes made by other processes become visible after [`CurrencyRegistry::refresh`].

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::core_types::CurrencyId;
use crate::error::LedgerError;
use crate::models::{Account, Currency, CurrencyCode};
use crate::store::{LedgerStore, NewCurrency, StoreTx};

pub struct CurrencyRegistry<S: LedgerStore> {
    store: Arc<S>,
    by_code: DashMap<CurrencyCode, Currency>,
    by_id: DashMap<CurrencyId, Currency>,
}

impl<S: LedgerStore> CurrencyRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            by_code: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    fn cache(&self, currency: &Currency) {
        self.by_code.insert(currency.code, currency.clone());
        self.by_id.insert(currency.id, currency.clone());
    }

    /// Return the active currency for `code`.
    ///
    /// # Errors
    /// * `UnknownCurrency` - code is not registered
    /// * `CurrencyInactive` - registered but disabled
    pub async fn resolve(&self, code: CurrencyCode) -> Result<Currency, LedgerError> {
        let cached = self.by_code.get(&code).map(|c| c.clone());
        let currency = match cached {
            Some(c) => c,
            None => {
                let c = self
                    .store
                    .get_currency_by_code(code)
                    .await?
                    .ok_or_else(|| LedgerError::UnknownCurrency(code.to_string()))?;
                self.cache(&c);
                c
            }
        };

        if !currency.is_active {
            return Err(LedgerError::CurrencyInactive(code.to_string()));
        }
        Ok(currency)
    }

    /// Resolve a textual code such as `"USD"` or `"usd"`
    pub async fn resolve_str(&self, code: &str) -> Result<Currency, LedgerError> {
        self.resolve(CurrencyCode::parse(code)?).await
    }

    /// Look up a currency by id regardless of its active flag
    pub async fn by_id(&self, id: CurrencyId) -> Result<Currency, LedgerError> {
        if let Some(c) = self.by_id.get(&id) {
            return Ok(c.clone());
        }
        let c = self
            .store
            .get_currency(id)
            .await?
            .ok_or_else(|| LedgerError::UnknownCurrency(id.to_string()))?;
        self.cache(&c);
        Ok(c)
    }

    /// Fail with `CurrencyMismatch` unless both accounts hold the same,
    /// active currency.
    pub async fn assert_compatible(
        &self,
        from: &Account,
        to: &Account,
    ) -> Result<Currency, LedgerError> {
        let from_currency = self.by_id(from.currency_id).await?;
        if from.currency_id != to.currency_id {
            let to_currency = self.by_id(to.currency_id).await?;
            return Err(LedgerError::CurrencyMismatch {
                from: from.id,
                from_currency: from_currency.code.to_string(),
                to: to.id,
                to_currency: to_currency.code.to_string(),
            });
        }
        if !from_currency.is_active {
            return Err(LedgerError::CurrencyInactive(from_currency.code.to_string()));
        }
        Ok(from_currency)
    }

    /// Register a new currency (`DuplicateCurrency` if the code exists)
    pub async fn register(&self, code: CurrencyCode, name: &str) -> Result<Currency, LedgerError> {
        let mut tx = self.store.begin().await?;
        let currency = tx
            .insert_currency(NewCurrency {
                code,
                name: name.trim().to_string(),
            })
            .await?;
        tx.commit().await?;

        info!(code = %currency.code, id = currency.id, "Currency registered");
        self.cache(&currency);
        Ok(currency)
    }

    pub async fn set_active(&self, code: CurrencyCode, active: bool) -> Result<Currency, LedgerError> {
        let mut tx = self.store.begin().await?;
        let currency = tx.set_currency_active(code, active).await?;
        tx.commit().await?;

        info!(code = %code, active, "Currency status changed");
        self.cache(&currency);
        Ok(currency)
    }

    /// Register every supported currency that is missing from the store
    pub async fn ensure_defaults(&self) -> Result<Vec<Currency>, LedgerError> {
        for code in CurrencyCode::ALL {
            if self.store.get_currency_by_code(*code).await?.is_some() {
                continue;
            }
            match self.register(*code, code.default_name()).await {
                // Another process registered it first
                Ok(_) | Err(LedgerError::DuplicateCurrency(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.refresh().await
    }

    /// Reload the cache from the store
    pub async fn refresh(&self) -> Result<Vec<Currency>, LedgerError> {
        let currencies = self.store.list_currencies().await?;
        self.by_code.clear();
        self.by_id.clear();
        for c in &currencies {
            self.cache(c);
        }
        Ok(currencies)
    }

    pub async fn list(&self) -> Result<Vec<Currency>, LedgerError> {
        self.store.list_currencies().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountStatus;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn account(id: i64, currency_id: CurrencyId) -> Account {
        Account {
            id,
            user_id: id,
            currency_id,
            balance: dec!(0.00),
            status: AccountStatus::Active,
        }
    }

    async fn registry() -> CurrencyRegistry<MemoryStore> {
        let registry = CurrencyRegistry::new(Arc::new(MemoryStore::new()));
        registry.ensure_defaults().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_ensure_defaults_is_idempotent() {
        let registry = registry().await;
        let again = registry.ensure_defaults().await.unwrap();
        assert_eq!(again.len(), 3);

        let rub = registry.resolve(CurrencyCode::Rub).await.unwrap();
        assert_eq!(rub.name, "Russian Ruble");
        assert_eq!(
            registry.register(CurrencyCode::Rub, "Ruble").await,
            Err(LedgerError::DuplicateCurrency("rub".into()))
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_and_inactive() {
        let registry = CurrencyRegistry::new(Arc::new(MemoryStore::new()));
        assert_eq!(
            registry.resolve(CurrencyCode::Eur).await,
            Err(LedgerError::UnknownCurrency("eur".into()))
        );
        assert_eq!(
            registry.resolve_str("gbp").await,
            Err(LedgerError::UnknownCurrency("gbp".into()))
        );

        registry.register(CurrencyCode::Eur, "Euro").await.unwrap();
        assert!(registry.resolve_str("EUR").await.is_ok());

        registry.set_active(CurrencyCode::Eur, false).await.unwrap();
        assert_eq!(
            registry.resolve(CurrencyCode::Eur).await,
            Err(LedgerError::CurrencyInactive("eur".into()))
        );
    }

    #[tokio::test]
    async fn test_assert_compatible() {
        let registry = registry().await;
        let usd = registry.resolve(CurrencyCode::Usd).await.unwrap();
        let eur = registry.resolve(CurrencyCode::Eur).await.unwrap();

        let a = account(1, usd.id);
        let b = account(2, usd.id);
        let c = account(3, eur.id);

        assert_eq!(registry.assert_compatible(&a, &b).await.unwrap().code, CurrencyCode::Usd);

        let err = registry.assert_compatible(&a, &c).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::CurrencyMismatch {
                from: 1,
                from_currency: "usd".into(),
                to: 3,
                to_currency: "eur".into(),
            }
        );

        registry.set_active(CurrencyCode::Usd, false).await.unwrap();
        assert_eq!(
            registry.assert_compatible(&a, &b).await,
            Err(LedgerError::CurrencyInactive("usd".into()))
        );
    }
}
