//! PostgreSQL storage implementation
//!
//! PostgreSQL is suitable for production deployments with high availability requirements.

mod clients;

use crate::errors::StorageError;
use crate::storage::traits::Result;

pub use clients::{PostgresClientStore, PostgresClientTransaction};

impl PostgresClientStore {
    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(format!("Migration failed: {}", e)))?;
        Ok(())
    }

    /// Make client ids unique across every tenant instead of per tenant.
    pub async fn enforce_unique_client_ids_across_tenants(&self) -> Result<()> {
        let sql = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON oauth_consumer_apps(consumer_key)",
            clients::GLOBAL_CONSUMER_KEY_CONSTRAINT
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}
