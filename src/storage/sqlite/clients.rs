//! SQLite implementation of client application storage

use crate::errors::{CONSUMER_KEY_CONSTRAINT, StorageError};
use crate::storage::traits::*;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{Row, Transaction};
use std::collections::BTreeSet;

/// Index whose presence makes client ids unique across tenants
pub(crate) const GLOBAL_CONSUMER_KEY_CONSTRAINT: &str = "consumer_key_global_constraint";

/// SQLite implementation of client application storage
#[derive(Clone)]
pub struct SqliteClientStore {
    pub(super) pool: SqlitePool,
}

impl SqliteClientStore {
    /// Create a new SQLite client store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StorageError::DatabaseError(format!("Failed to get {}: {}", name, e)))
}

/// Convert a SQLite row to a client record
fn row_to_record(row: &SqliteRow) -> Result<ClientRecord> {
    let pkce_mandatory: i64 = column(row, "pkce_mandatory")?;
    let pkce_support_plain: i64 = column(row, "pkce_support_plain")?;

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
        pkce_mandatory: pkce_mandatory != 0,
        pkce_support_plain: pkce_support_plain != 0,
        user_access_token_expire_time: column(row, "user_access_token_expire_time")?,
        app_access_token_expire_time: column(row, "app_access_token_expire_time")?,
        refresh_token_expire_time: column(row, "refresh_token_expire_time")?,
        id_token_expire_time: column(row, "id_token_expire_time")?,
        app_state: column(row, "app_state")?,
    })
}

fn rows_to_properties(rows: &[SqliteRow]) -> Result<Vec<PropertyRow>> {
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
        "tenant_id = ? AND UPPER(user_domain) = UPPER(?) AND username = ?"
    } else {
        "tenant_id = ? AND UPPER(user_domain) = UPPER(?) AND LOWER(username) = LOWER(?)"
    }
}

#[async_trait]
impl ClientStore for SqliteClientStore {
    async fn begin(&self) -> Result<Box<dyn ClientTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionFailed(e.to_string()))?;
        Ok(Box::new(SqliteClientTransaction { tx }))
    }

    async fn get_client(&self, consumer_key: &str, tenant_id: i64) -> Result<Option<ClientRecord>> {
        let row = sqlx::query(
            "SELECT * FROM oauth_consumer_apps WHERE consumer_key = ? AND tenant_id = ?",
        )
        .bind(consumer_key)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn find_clients_by_consumer_key(&self, consumer_key: &str) -> Result<Vec<ClientRecord>> {
        let rows = sqlx::query("SELECT * FROM oauth_consumer_apps WHERE consumer_key = ? ORDER BY id")
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
            "SELECT * FROM oauth_consumer_apps WHERE app_name = ? AND tenant_id = ? ORDER BY id LIMIT 1",
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
            "SELECT COUNT(*) AS count FROM oauth_consumer_apps WHERE {} AND app_name = ?",
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
            "SELECT COUNT(*) AS count FROM oauth_consumer_apps WHERE consumer_key = ? AND tenant_id = ?",
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
            "SELECT app_state FROM oauth_consumer_apps WHERE consumer_key = ? AND tenant_id = ?",
        )
        .bind(consumer_key)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        row.as_ref().map(|row| column(row, "app_state")).transpose()
    }

    async fn scope_validators(&self, app_id: i64) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT scope_validator FROM oauth_scope_validators WHERE app_id = ?")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter()
            .map(|row| column(row, "scope_validator"))
            .collect()
    }

    async fn access_token_claims(&self, app_id: i64) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT claim_uri FROM oauth_access_token_claims WHERE app_id = ?")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter().map(|row| column(row, "claim_uri")).collect()
    }

    async fn properties(&self, consumer_key: &str, tenant_id: i64) -> Result<Vec<PropertyRow>> {
        let rows = sqlx::query(
            "SELECT property_key, property_value FROM oidc_properties WHERE consumer_key = ? AND tenant_id = ? ORDER BY id",
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
            "SELECT service_provider FROM sp_inbound_auth WHERE consumer_key = ? AND tenant_id = ? ORDER BY id",
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
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'index' AND name = ?",
        )
        .bind(GLOBAL_CONSUMER_KEY_CONSTRAINT)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(column::<i64>(&row, "count")? > 0)
    }
}

/// Write transaction over a SQLite connection
pub struct SqliteClientTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl ClientTransaction for SqliteClientTransaction {
    async fn insert_client(&mut self, record: &ClientRecord) -> Result<i64> {
        let created_at = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO oauth_consumer_apps (
                consumer_key, consumer_secret, username, user_domain, tenant_id, app_name,
                oauth_version, callback_url, grant_types, pkce_mandatory, pkce_support_plain,
                user_access_token_expire_time, app_access_token_expire_time,
                refresh_token_expire_time, id_token_expire_time, app_state, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .bind(if record.pkce_mandatory { 1i64 } else { 0i64 })
        .bind(if record.pkce_support_plain { 1i64 } else { 0i64 })
        .bind(record.user_access_token_expire_time)
        .bind(record.app_access_token_expire_time)
        .bind(record.refresh_token_expire_time)
        .bind(record.id_token_expire_time)
        .bind(&record.app_state)
        .bind(&created_at)
        .execute(&mut *self.tx)
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

        Ok(result.last_insert_rowid())
    }

    async fn update_client(&mut self, record: &ClientRecord, update_owner: bool) -> Result<u64> {
        let owner_columns = if update_owner {
            ", username = ?, user_domain = ?"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE oauth_consumer_apps SET
                app_name = ?, callback_url = ?, grant_types = ?, pkce_mandatory = ?,
                pkce_support_plain = ?, user_access_token_expire_time = ?,
                app_access_token_expire_time = ?, refresh_token_expire_time = ?,
                id_token_expire_time = ?{}
            WHERE consumer_key = ? AND tenant_id = ?
            "#,
            owner_columns
        );

        let mut query = sqlx::query(&sql)
            .bind(&record.app_name)
            .bind(&record.callback_url)
            .bind(&record.grant_types)
            .bind(if record.pkce_mandatory { 1i64 } else { 0i64 })
            .bind(if record.pkce_support_plain { 1i64 } else { 0i64 })
            .bind(record.user_access_token_expire_time)
            .bind(record.app_access_token_expire_time)
            .bind(record.refresh_token_expire_time)
            .bind(record.id_token_expire_time);
        if update_owner {
            query = query.bind(&record.username).bind(&record.user_domain);
        }

        let result = query
            .bind(&record.consumer_key)
            .bind(record.tenant_id)
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
                "UPDATE oauth_consumer_apps SET app_name = ?, username = ?, user_domain = ? WHERE consumer_key = ? AND tenant_id = ?",
            )
            .bind(app_name)
            .bind(username)
            .bind(user_domain)
            .bind(consumer_key)
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await,
            None => sqlx::query(
                "UPDATE oauth_consumer_apps SET app_name = ? WHERE consumer_key = ? AND tenant_id = ?",
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
            "UPDATE oauth_consumer_apps SET app_state = ? WHERE consumer_key = ? AND tenant_id = ?",
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
        sqlx::query("DELETE FROM oauth_scope_validators WHERE app_id = ?")
            .bind(app_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        for validator in validators {
            sqlx::query("INSERT INTO oauth_scope_validators (app_id, scope_validator) VALUES (?, ?)")
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
        sqlx::query("DELETE FROM oauth_access_token_claims WHERE app_id = ?")
            .bind(app_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        for claim in claims {
            sqlx::query("INSERT INTO oauth_access_token_claims (app_id, claim_uri) VALUES (?, ?)")
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
            "SELECT property_key, property_value FROM oidc_properties WHERE consumer_key = ? AND tenant_id = ? ORDER BY id",
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
                "DELETE FROM oidc_properties WHERE consumer_key = ? AND tenant_id = ? AND property_key = ? AND property_value IS ?",
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
                "UPDATE oidc_properties SET property_value = ? WHERE consumer_key = ? AND tenant_id = ? AND property_key = ?",
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
                "INSERT INTO oidc_properties (tenant_id, consumer_key, property_key, property_value) VALUES (?, ?, ?, ?)",
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
        let result = sqlx::query("DELETE FROM oidc_properties WHERE consumer_key = ? AND tenant_id = ?")
            .bind(consumer_key)
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn delete_client(&mut self, consumer_key: &str, tenant_id: i64) -> Result<u64> {
        for table in ["oauth_scope_validators", "oauth_access_token_claims"] {
            let sql = format!(
                "DELETE FROM {} WHERE app_id IN (SELECT id FROM oauth_consumer_apps WHERE consumer_key = ? AND tenant_id = ?)",
                table
            );
            sqlx::query(&sql)
                .bind(consumer_key)
                .bind(tenant_id)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        }

        let result =
            sqlx::query("DELETE FROM oauth_consumer_apps WHERE consumer_key = ? AND tenant_id = ?")
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
            "INSERT INTO sp_inbound_auth (tenant_id, consumer_key, service_provider) VALUES (?, ?, ?)",
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
        let result = sqlx::query("DELETE FROM sp_inbound_auth WHERE consumer_key = ? AND tenant_id = ?")
            .bind(consumer_key)
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn consumer_keys_for_tenant(&mut self, tenant_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT consumer_key FROM oauth_consumer_apps WHERE tenant_id = ? ORDER BY id")
            .bind(tenant_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter().map(|row| column(row, "consumer_key")).collect()
    }

    async fn delete_tenant_clients(&mut self, tenant_id: i64) -> Result<u64> {
        for table in ["oauth_scope_validators", "oauth_access_token_claims"] {
            let sql = format!(
                "DELETE FROM {} WHERE app_id IN (SELECT id FROM oauth_consumer_apps WHERE tenant_id = ?)",
                table
            );
            sqlx::query(&sql)
                .bind(tenant_id)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        }

        let result = sqlx::query("DELETE FROM oauth_consumer_apps WHERE tenant_id = ?")
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn delete_tenant_properties(&mut self, tenant_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM oidc_properties WHERE tenant_id = ?")
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
