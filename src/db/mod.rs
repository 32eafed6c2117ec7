//! Database connection management

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::PoolConfig;
use crate::error::LedgerError;

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(database_url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Extension trait for column access that logs decode failures
pub trait SafeRow {
    /// Read a column, logging and converting a decode failure into `LedgerError::Store`
    fn column<'r, T>(&'r self, column: &str) -> Result<T, LedgerError>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>;

    /// Read a text column and parse it into a closed enum
    fn enum_column<T>(&self, column: &str) -> Result<T, LedgerError>
    where
        T: std::str::FromStr<Err = LedgerError>,
    {
        let raw: String = self.column(column)?;
        raw.parse()
    }
}

impl SafeRow for sqlx::postgres::PgRow {
    fn column<'r, T>(&'r self, column: &str) -> Result<T, LedgerError>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        use sqlx::Row;
        self.try_get(column).map_err(|e| {
            tracing::error!("Failed to read column '{}': {}", column, e);
            LedgerError::Store(format!("column '{column}': {e}"))
        })
    }
}
