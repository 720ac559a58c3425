//! Storage trait definitions for client applications and their OIDC properties.
//!
//! Reads go straight to the store. Every multi-step write runs inside a
//! [`ClientTransaction`] obtained from [`ClientStore::begin`], which is either
//! committed or rolled back as a unit.

use crate::errors::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type Result<T> = std::result::Result<T, StorageError>;

/// A client application row as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Store-generated identifier. Ignored on insert.
    pub id: i64,
    /// Processed client id
    pub consumer_key: String,
    /// Processed client secret
    pub consumer_secret: Option<String>,
    pub username: String,
    pub user_domain: String,
    pub tenant_id: i64,
    pub app_name: String,
    pub oauth_version: String,
    pub callback_url: Option<String>,
    pub grant_types: Option<String>,
    pub pkce_mandatory: bool,
    pub pkce_support_plain: bool,
    pub user_access_token_expire_time: i64,
    pub app_access_token_expire_time: i64,
    pub refresh_token_expire_time: i64,
    pub id_token_expire_time: i64,
    pub app_state: String,
}

/// Owner columns used to find applications of a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerFilter {
    pub username: String,
    pub user_domain: String,
    pub tenant_id: i64,
    /// Compare usernames exactly instead of case-insensitively
    pub case_sensitive: bool,
}

impl OwnerFilter {
    /// Whether a stored row belongs to this owner.
    pub fn matches(&self, record: &ClientRecord) -> bool {
        record.tenant_id == self.tenant_id
            && record.user_domain.eq_ignore_ascii_case(&self.user_domain)
            && if self.case_sensitive {
                record.username == self.username
            } else {
                record.username.to_lowercase() == self.username.to_lowercase()
            }
    }
}

/// One row of the flat OIDC property table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyRow {
    pub key: String,
    pub value: Option<String>,
}

impl PropertyRow {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Property writes computed by reconciliation and applied together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyBatches {
    pub inserts: Vec<PropertyRow>,
    /// Rows whose value replaces the stored value of the same key
    pub updates: Vec<PropertyRow>,
    /// Rows removed by exact key and value
    pub deletes: Vec<PropertyRow>,
}

impl PropertyBatches {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// Read access to client applications
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Open a write transaction
    async fn begin(&self) -> Result<Box<dyn ClientTransaction>>;

    async fn get_client(&self, consumer_key: &str, tenant_id: i64) -> Result<Option<ClientRecord>>;

    /// Rows with this consumer key in every tenant
    async fn find_clients_by_consumer_key(&self, consumer_key: &str) -> Result<Vec<ClientRecord>>;

    async fn find_client_by_name(&self, app_name: &str, tenant_id: i64)
    -> Result<Option<ClientRecord>>;

    async fn find_clients_by_owner(&self, owner: &OwnerFilter) -> Result<Vec<ClientRecord>>;

    /// Whether the owner already has an application with this name
    async fn client_name_exists(&self, owner: &OwnerFilter, app_name: &str) -> Result<bool>;

    async fn client_exists(&self, consumer_key: &str, tenant_id: i64) -> Result<bool>;

    async fn client_state(&self, consumer_key: &str, tenant_id: i64) -> Result<Option<String>>;

    async fn scope_validators(&self, app_id: i64) -> Result<BTreeSet<String>>;

    async fn access_token_claims(&self, app_id: i64) -> Result<BTreeSet<String>>;

    async fn properties(&self, consumer_key: &str, tenant_id: i64) -> Result<Vec<PropertyRow>>;

    /// Service provider names linked to the client
    async fn service_provider_links(&self, consumer_key: &str, tenant_id: i64)
    -> Result<Vec<String>>;

    /// Whether client ids are unique across all tenants rather than per tenant
    async fn client_ids_unique_across_tenants(&self) -> Result<bool>;
}

/// Write access to client applications inside one atomic unit
#[async_trait]
pub trait ClientTransaction: Send {
    /// Insert a client row and return its generated id.
    ///
    /// A conflicting consumer key fails with [`StorageError::ConstraintViolation`]
    /// or an error whose message names the consumer key constraint.
    async fn insert_client(&mut self, record: &ClientRecord) -> Result<i64>;

    /// Update the mutable columns of the row matching the record's consumer
    /// key and tenant. Owner columns change only when `update_owner` is set.
    async fn update_client(&mut self, record: &ClientRecord, update_owner: bool) -> Result<u64>;

    /// Rename the application, optionally transferring ownership.
    async fn rename_client(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        app_name: &str,
        owner: Option<(&str, &str)>,
    ) -> Result<u64>;

    async fn update_state(&mut self, consumer_key: &str, tenant_id: i64, state: &str)
    -> Result<u64>;

    async fn replace_scope_validators(
        &mut self,
        app_id: i64,
        validators: &BTreeSet<String>,
    ) -> Result<()>;

    async fn replace_access_token_claims(
        &mut self,
        app_id: i64,
        claims: &BTreeSet<String>,
    ) -> Result<()>;

    /// Properties as seen from inside the transaction
    async fn properties(&mut self, consumer_key: &str, tenant_id: i64)
    -> Result<Vec<PropertyRow>>;

    async fn apply_property_batches(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        batches: &PropertyBatches,
    ) -> Result<()>;

    async fn delete_properties(&mut self, consumer_key: &str, tenant_id: i64) -> Result<u64>;

    /// Delete the client row together with its scope validators and claims.
    async fn delete_client(&mut self, consumer_key: &str, tenant_id: i64) -> Result<u64>;

    async fn link_service_provider(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        service_provider: &str,
    ) -> Result<()>;

    async fn delete_service_provider_links(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<u64>;

    async fn consumer_keys_for_tenant(&mut self, tenant_id: i64) -> Result<Vec<String>>;

    /// Delete every client row of the tenant with its validators and claims.
    async fn delete_tenant_clients(&mut self, tenant_id: i64) -> Result<u64>;

    async fn delete_tenant_properties(&mut self, tenant_id: i64) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(username: &str, domain: &str, tenant_id: i64) -> ClientRecord {
        ClientRecord {
            id: 1,
            consumer_key: "key".to_string(),
            consumer_secret: None,
            username: username.to_string(),
            user_domain: domain.to_string(),
            tenant_id,
            app_name: "app".to_string(),
            oauth_version: "OAuth-2.0".to_string(),
            callback_url: None,
            grant_types: None,
            pkce_mandatory: false,
            pkce_support_plain: false,
            user_access_token_expire_time: 0,
            app_access_token_expire_time: 0,
            refresh_token_expire_time: 0,
            id_token_expire_time: 0,
            app_state: "ACTIVE".to_string(),
        }
    }

    #[test]
    fn test_owner_filter_case_handling() {
        let mut filter = OwnerFilter {
            username: "alice".to_string(),
            user_domain: "PRIMARY".to_string(),
            tenant_id: 1,
            case_sensitive: false,
        };
        assert!(filter.matches(&record("Alice", "primary", 1)));
        assert!(!filter.matches(&record("Alice", "PRIMARY", 2)));

        filter.case_sensitive = true;
        assert!(!filter.matches(&record("Alice", "PRIMARY", 1)));
        assert!(filter.matches(&record("alice", "PRIMARY", 1)));
    }

    #[test]
    fn test_property_batches_len() {
        let batches = PropertyBatches {
            inserts: vec![PropertyRow::new("audience", Some("a".to_string()))],
            updates: vec![],
            deletes: vec![PropertyRow::new("audience", Some("b".to_string()))],
        };
        assert_eq!(batches.len(), 2);
        assert!(!batches.is_empty());
        assert!(PropertyBatches::default().is_empty());
    }
}
