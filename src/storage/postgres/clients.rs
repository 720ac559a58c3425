//! PostgreSQL implementation of client application storage

use crate::errors::{CONSUMER_KEY_CONSTRAINT, StorageError};
use crate::storage::traits::*;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::{Row, Transaction};
use std::collections::BTreeSet;

/// Index whose presence makes client ids unique across tenants
pub(crate) const GLOBAL_CONSUMER_KEY_CONSTRAINT: &str = "consumer_key_global_constraint";

/// PostgreSQL implementation of client application storage
#[derive(Clone)]
pub struct PostgresClientStore {
    pub(super) pool: PgPool,
}

impl PostgresClientStore {
    /// Create a new PostgreSQL client store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StorageError::DatabaseError(format!("Failed to get {}: {}", name, e)))
}

/// Convert a PostgreSQL row to a client record
fn row_to_record(row: &PgRow) -> Result<ClientRecord> {
    Ok(ClientRecord {
        id: column(row, "id")?,
        consumer_key: column(row, "consumer_key")?,
        consumer_secret: column(row, "consumer_secret")?,
        username: column(row, "username")?,
        user_domain: column(row, "user_domain")?,
        tenant_id: column(row, "tenant_id")?,
        app_name: column(row, "app_name")?,
        oauth_version: column(row, "oauth_version")?,
        callback_url: column(row, "callback_url")?,
        grant_types: column(row, "grant_types")?,
        pkce_mandatory: column(row, "pkce_mandatory")?,
        pkce_support_plain: column(row, "pkce_support_plain")?,
        user_access_token_expire_time: column(row, "user_access_token_expire_time")?,
        app_access_token_expire_time: column(row, "app_access_token_expire_time")?,
        refresh_token_expire_time: column(row, "refresh_token_expire_time")?,
        id_token_expire_time: column(row, "id_token_expire_time")?,
        app_state: column(row, "app_state")?,
    })
}

fn rows_to_properties(rows: &[PgRow]) -> Result<Vec<PropertyRow>> {
    rows.iter()
        .map(|row| {
            Ok(PropertyRow::new(
                column::<String>(row, "property_key")?,
                column(row, "property_value")?,
            ))
        })
        .collect()
}

fn owner_clause(owner: &OwnerFilter) -> &'static str {
    if owner.case_sensitive {
        "tenant_id = $1 AND UPPER(user_domain) = UPPER($2) AND username = $3"
    } else {
        "tenant_id = $1 AND UPPER(user_domain) = UPPER($2) AND LOWER(username) = LOWER($3)"
    }
}

#[async_trait]
impl ClientStore for PostgresClientStore {
    async fn begin(&self) -> Result<Box<dyn ClientTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionFailed(e.to_string()))?;
        Ok(Box::new(PostgresClientTransaction { tx }))
    }

    async fn get_client(&self, consumer_key: &str, tenant_id: i64) -> Result<Option<ClientRecord>> {
        let row = sqlx::query(
            "SELECT * FROM oauth_consumer_apps WHERE consumer_key = $1 AND tenant_id = $2",
        )
        .bind(consumer_key)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn find_clients_by_consumer_key(&self, consumer_key: &str) -> Result<Vec<ClientRecord>> {
        let rows =
            sqlx::query("SELECT * FROM oauth_consumer_apps WHERE consumer_key = $1 ORDER BY id")
                .bind(consumer_key)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }

    async fn find_client_by_name(
        &self,
        app_name: &str,
        tenant_id: i64,
    ) -> Result<Option<ClientRecord>> {
        let row = sqlx::query(
            "SELECT * FROM oauth_consumer_apps WHERE app_name = $1 AND tenant_id = $2 ORDER BY id LIMIT 1",
        )
        .bind(app_name)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn find_clients_by_owner(&self, owner: &OwnerFilter) -> Result<Vec<ClientRecord>> {
        let sql = format!(
            "SELECT * FROM oauth_consumer_apps WHERE {} ORDER BY id",
            owner_clause(owner)
        );
        let rows = sqlx::query(&sql)
            .bind(owner.tenant_id)
            .bind(&owner.user_domain)
            .bind(&owner.username)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }

    async fn client_name_exists(&self, owner: &OwnerFilter, app_name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) AS count FROM oauth_consumer_apps WHERE {} AND app_name = $4",
            owner_clause(owner)
        );
        let row = sqlx::query(&sql)
            .bind(owner.tenant_id)
            .bind(&owner.user_domain)
            .bind(&owner.username)
            .bind(app_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(column::<i64>(&row, "count")? > 0)
    }

    async fn client_exists(&self, consumer_key: &str, tenant_id: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM oauth_consumer_apps WHERE consumer_key = $1 AND tenant_id = $2",
        )
        .bind(consumer_key)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(column::<i64>(&row, "count")? > 0)
    }

    async fn client_state(&self, consumer_key: &str, tenant_id: i64) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT app_state FROM oauth_consumer_apps WHERE consumer_key = $1 AND tenant_id = $2",
        )
        .bind(consumer_key)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        row.as_ref().map(|row| column(row, "app_state")).transpose()
    }

    async fn scope_validators(&self, app_id: i64) -> Result<BTreeSet<String>> {
        let rows =
            sqlx::query("SELECT scope_validator FROM oauth_scope_validators WHERE app_id = $1")
                .bind(app_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter()
            .map(|row| column(row, "scope_validator"))
            .collect()
    }

    async fn access_token_claims(&self, app_id: i64) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT claim_uri FROM oauth_access_token_claims WHERE app_id = $1")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter().map(|row| column(row, "claim_uri")).collect()
    }

    async fn properties(&self, consumer_key: &str, tenant_id: i64) -> Result<Vec<PropertyRow>> {
        let rows = sqlx::query(
            "SELECT property_key, property_value FROM oidc_properties WHERE consumer_key = $1 AND tenant_id = $2 ORDER BY id",
        )
        .bind(consumer_key)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows_to_properties(&rows)
    }

    async fn service_provider_links(
        &self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT service_provider FROM sp_inbound_auth WHERE consumer_key = $1 AND tenant_id = $2 ORDER BY id",
        )
        .bind(consumer_key)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter()
            .map(|row| column(row, "service_provider"))
            .collect()
    }

    async fn client_ids_unique_across_tenants(&self) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM pg_indexes WHERE indexname = $1")
            .bind(GLOBAL_CONSUMER_KEY_CONSTRAINT)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(column::<i64>(&row, "count")? > 0)
    }
}

/// Write transaction over a PostgreSQL connection
pub struct PostgresClientTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ClientTransaction for PostgresClientTransaction {
    async fn insert_client(&mut self, record: &ClientRecord) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO oauth_consumer_apps (
                consumer_key, consumer_secret, username, user_domain, tenant_id, app_name,
                oauth_version, callback_url, grant_types, pkce_mandatory, pkce_support_plain,
                user_access_token_expire_time, app_access_token_expire_time,
                refresh_token_expire_time, id_token_expire_time, app_state
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id
            "#,
        )
        .bind(&record.consumer_key)
        .bind(&record.consumer_secret)
        .bind(&record.username)
        .bind(&record.user_domain)
        .bind(record.tenant_id)
        .bind(&record.app_name)
        .bind(&record.oauth_version)
        .bind(&record.callback_url)
        .bind(&record.grant_types)
        .bind(record.pkce_mandatory)
        .bind(record.pkce_support_plain)
        .bind(record.user_access_token_expire_time)
        .bind(record.app_access_token_expire_time)
        .bind(record.refresh_token_expire_time)
        .bind(record.id_token_expire_time)
        .bind(&record.app_state)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StorageError::ConstraintViolation(format!(
                    "{} violated: {}",
                    CONSUMER_KEY_CONSTRAINT,
                    db.message()
                ))
            }
            _ => StorageError::DatabaseError(e.to_string()),
        })?;

        column(&row, "id")
    }

    async fn update_client(&mut self, record: &ClientRecord, update_owner: bool) -> Result<u64> {
        let sql = if update_owner {
            r#"
            UPDATE oauth_consumer_apps SET
                app_name = $1, callback_url = $2, grant_types = $3, pkce_mandatory = $4,
                pkce_support_plain = $5, user_access_token_expire_time = $6,
                app_access_token_expire_time = $7, refresh_token_expire_time = $8,
                id_token_expire_time = $9, username = $12, user_domain = $13
            WHERE consumer_key = $10 AND tenant_id = $11
            "#
        } else {
            r#"
            UPDATE oauth_consumer_apps SET
                app_name = $1, callback_url = $2, grant_types = $3, pkce_mandatory = $4,
                pkce_support_plain = $5, user_access_token_expire_time = $6,
                app_access_token_expire_time = $7, refresh_token_expire_time = $8,
                id_token_expire_time = $9
            WHERE consumer_key = $10 AND tenant_id = $11
            "#
        };

        let mut query = sqlx::query(sql)
            .bind(&record.app_name)
            .bind(&record.callback_url)
            .bind(&record.grant_types)
            .bind(record.pkce_mandatory)
            .bind(record.pkce_support_plain)
            .bind(record.user_access_token_expire_time)
            .bind(record.app_access_token_expire_time)
            .bind(record.refresh_token_expire_time)
            .bind(record.id_token_expire_time)
            .bind(&record.consumer_key)
            .bind(record.tenant_id);
        if update_owner {
            query = query.bind(&record.username).bind(&record.user_domain);
        }

        let result = query
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn rename_client(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        app_name: &str,
        owner: Option<(&str, &str)>,
    ) -> Result<u64> {
        let result = match owner {
            Some((username, user_domain)) => sqlx::query(
                "UPDATE oauth_consumer_apps SET app_name = $1, username = $2, user_domain = $3 WHERE consumer_key = $4 AND tenant_id = $5",
            )
            .bind(app_name)
            .bind(username)
            .bind(user_domain)
            .bind(consumer_key)
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await,
            None => sqlx::query(
                "UPDATE oauth_consumer_apps SET app_name = $1 WHERE consumer_key = $2 AND tenant_id = $3",
            )
            .bind(app_name)
            .bind(consumer_key)
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await,
        }
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn update_state(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        state: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE oauth_consumer_apps SET app_state = $1 WHERE consumer_key = $2 AND tenant_id = $3",
        )
        .bind(state)
        .bind(consumer_key)
        .bind(tenant_id)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn replace_scope_validators(
        &mut self,
        app_id: i64,
        validators: &BTreeSet<String>,
    ) -> Result<()> {
        sqlx::query("DELETE FROM oauth_scope_validators WHERE app_id = $1")
            .bind(app_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        for validator in validators {
            sqlx::query(
                "INSERT INTO oauth_scope_validators (app_id, scope_validator) VALUES ($1, $2)",
            )
            .bind(app_id)
            .bind(validator)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        }
        Ok(())
    }

    async fn replace_access_token_claims(
        &mut self,
        app_id: i64,
        claims: &BTreeSet<String>,
    ) -> Result<()> {
        sqlx::query("DELETE FROM oauth_access_token_claims WHERE app_id = $1")
            .bind(app_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        for claim in claims {
            sqlx::query("INSERT INTO oauth_access_token_claims (app_id, claim_uri) VALUES ($1, $2)")
                .bind(app_id)
                .bind(claim)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        }
        Ok(())
    }

    async fn properties(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<Vec<PropertyRow>> {
        let rows = sqlx::query(
            "SELECT property_key, property_value FROM oidc_properties WHERE consumer_key = $1 AND tenant_id = $2 ORDER BY id",
        )
        .bind(consumer_key)
        .bind(tenant_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows_to_properties(&rows)
    }

    async fn apply_property_batches(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        batches: &PropertyBatches,
    ) -> Result<()> {
        for row in &batches.deletes {
            sqlx::query(
                "DELETE FROM oidc_properties WHERE consumer_key = $1 AND tenant_id = $2 AND property_key = $3 AND property_value IS NOT DISTINCT FROM $4",
            )
            .bind(consumer_key)
            .bind(tenant_id)
            .bind(&row.key)
            .bind(&row.value)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        }

        for row in &batches.updates {
            sqlx::query(
                "UPDATE oidc_properties SET property_value = $1 WHERE consumer_key = $2 AND tenant_id = $3 AND property_key = $4",
            )
            .bind(&row.value)
            .bind(consumer_key)
            .bind(tenant_id)
            .bind(&row.key)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        }

        for row in &batches.inserts {
            sqlx::query(
                "INSERT INTO oidc_properties (tenant_id, consumer_key, property_key, property_value) VALUES ($1, $2, $3, $4)",
            )
            .bind(tenant_id)
            .bind(consumer_key)
            .bind(&row.key)
            .bind(&row.value)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        }

        Ok(())
    }

    async fn delete_properties(&mut self, consumer_key: &str, tenant_id: i64) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM oidc_properties WHERE consumer_key = $1 AND tenant_id = $2")
                .bind(consumer_key)
                .bind(tenant_id)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn delete_client(&mut self, consumer_key: &str, tenant_id: i64) -> Result<u64> {
        // Validators and claims cascade through their foreign keys.
        let result = sqlx::query(
            "DELETE FROM oauth_consumer_apps WHERE consumer_key = $1 AND tenant_id = $2",
        )
        .bind(consumer_key)
        .bind(tenant_id)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn link_service_provider(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        service_provider: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sp_inbound_auth (tenant_id, consumer_key, service_provider) VALUES ($1, $2, $3)",
        )
        .bind(tenant_id)
        .bind(consumer_key)
        .bind(service_provider)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn delete_service_provider_links(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM sp_inbound_auth WHERE consumer_key = $1 AND tenant_id = $2")
                .bind(consumer_key)
                .bind(tenant_id)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn consumer_keys_for_tenant(&mut self, tenant_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT consumer_key FROM oauth_consumer_apps WHERE tenant_id = $1 ORDER BY id",
        )
        .bind(tenant_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter().map(|row| column(row, "consumer_key")).collect()
    }

    async fn delete_tenant_clients(&mut self, tenant_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM oauth_consumer_apps WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn delete_tenant_properties(&mut self, tenant_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM oidc_properties WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| StorageError::TransactionFailed(format!("Commit failed: {}", e)))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StorageError::TransactionFailed(format!("Rollback failed: {}", e)))
    }
}
