//! In-memory client application storage
//!
//! Transactions hold the store lock for their whole lifetime and work on a
//! copy of the state, which replaces the shared state on commit.

use crate::errors::{CONSUMER_KEY_CONSTRAINT, StorageError};
use crate::storage::traits::*;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredProperty {
    tenant_id: i64,
    consumer_key: String,
    key: String,
    value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServiceProviderLink {
    tenant_id: i64,
    consumer_key: String,
    service_provider: String,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    clients: BTreeMap<i64, ClientRecord>,
    scope_validators: BTreeMap<i64, BTreeSet<String>>,
    access_token_claims: BTreeMap<i64, BTreeSet<String>>,
    properties: Vec<StoredProperty>,
    service_provider_links: Vec<ServiceProviderLink>,
}

impl MemoryState {
    fn find(&self, consumer_key: &str, tenant_id: i64) -> Option<&ClientRecord> {
        self.clients
            .values()
            .find(|c| c.consumer_key == consumer_key && c.tenant_id == tenant_id)
    }

    fn find_id(&self, consumer_key: &str, tenant_id: i64) -> Option<i64> {
        self.find(consumer_key, tenant_id).map(|c| c.id)
    }

    fn properties_of(&self, consumer_key: &str, tenant_id: i64) -> Vec<PropertyRow> {
        self.properties
            .iter()
            .filter(|p| p.consumer_key == consumer_key && p.tenant_id == tenant_id)
            .map(|p| PropertyRow::new(p.key.clone(), p.value.clone()))
            .collect()
    }

    fn remove_client(&mut self, id: i64) {
        self.clients.remove(&id);
        self.scope_validators.remove(&id);
        self.access_token_claims.remove(&id);
    }
}

/// In-memory implementation of client application storage
#[derive(Clone, Default)]
pub struct MemoryClientStore {
    state: Arc<Mutex<MemoryState>>,
    unique_across_tenants: bool,
}

impl MemoryClientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce client id uniqueness across every tenant.
    pub fn with_unique_client_ids_across_tenants(mut self) -> Self {
        self.unique_across_tenants = true;
        self
    }

    /// Number of stored property rows of a tenant
    pub async fn property_count(&self, tenant_id: i64) -> usize {
        let state = self.state.lock().await;
        state
            .properties
            .iter()
            .filter(|p| p.tenant_id == tenant_id)
            .count()
    }

    /// Number of stored client rows of a tenant
    pub async fn client_count(&self, tenant_id: i64) -> usize {
        let state = self.state.lock().await;
        state
            .clients
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .count()
    }
}

#[async_trait]
impl ClientStore for MemoryClientStore {
    async fn begin(&self) -> Result<Box<dyn ClientTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryClientTransaction {
            guard,
            working,
            unique_across_tenants: self.unique_across_tenants,
        }))
    }

    async fn get_client(&self, consumer_key: &str, tenant_id: i64) -> Result<Option<ClientRecord>> {
        let state = self.state.lock().await;
        Ok(state.find(consumer_key, tenant_id).cloned())
    }

    async fn find_clients_by_consumer_key(&self, consumer_key: &str) -> Result<Vec<ClientRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .values()
            .filter(|c| c.consumer_key == consumer_key)
            .cloned()
            .collect())
    }

    async fn find_client_by_name(
        &self,
        app_name: &str,
        tenant_id: i64,
    ) -> Result<Option<ClientRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .values()
            .find(|c| c.app_name == app_name && c.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_clients_by_owner(&self, owner: &OwnerFilter) -> Result<Vec<ClientRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .values()
            .filter(|c| owner.matches(c))
            .cloned()
            .collect())
    }

    async fn client_name_exists(&self, owner: &OwnerFilter, app_name: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .values()
            .any(|c| owner.matches(c) && c.app_name == app_name))
    }

    async fn client_exists(&self, consumer_key: &str, tenant_id: i64) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.find(consumer_key, tenant_id).is_some())
    }

    async fn client_state(&self, consumer_key: &str, tenant_id: i64) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .find(consumer_key, tenant_id)
            .map(|c| c.app_state.clone()))
    }

    async fn scope_validators(&self, app_id: i64) -> Result<BTreeSet<String>> {
        let state = self.state.lock().await;
        Ok(state
            .scope_validators
            .get(&app_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn access_token_claims(&self, app_id: i64) -> Result<BTreeSet<String>> {
        let state = self.state.lock().await;
        Ok(state
            .access_token_claims
            .get(&app_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn properties(&self, consumer_key: &str, tenant_id: i64) -> Result<Vec<PropertyRow>> {
        let state = self.state.lock().await;
        Ok(state.properties_of(consumer_key, tenant_id))
    }

    async fn service_provider_links(
        &self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .service_provider_links
            .iter()
            .filter(|l| l.consumer_key == consumer_key && l.tenant_id == tenant_id)
            .map(|l| l.service_provider.clone())
            .collect())
    }

    async fn client_ids_unique_across_tenants(&self) -> Result<bool> {
        Ok(self.unique_across_tenants)
    }
}

/// Write transaction over the in-memory state
pub struct MemoryClientTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    unique_across_tenants: bool,
}

#[async_trait]
impl ClientTransaction for MemoryClientTransaction {
    async fn insert_client(&mut self, record: &ClientRecord) -> Result<i64> {
        let conflict = self.working.clients.values().any(|c| {
            c.consumer_key == record.consumer_key
                && (self.unique_across_tenants || c.tenant_id == record.tenant_id)
        });
        if conflict {
            return Err(StorageError::ConstraintViolation(format!(
                "{} violated for consumer key {}",
                CONSUMER_KEY_CONSTRAINT, record.consumer_key
            )));
        }

        self.working.next_id += 1;
        let id = self.working.next_id;
        let mut stored = record.clone();
        stored.id = id;
        self.working.clients.insert(id, stored);
        Ok(id)
    }

    async fn update_client(&mut self, record: &ClientRecord, update_owner: bool) -> Result<u64> {
        let Some(id) = self.working.find_id(&record.consumer_key, record.tenant_id) else {
            return Ok(0);
        };
        if let Some(stored) = self.working.clients.get_mut(&id) {
            stored.app_name = record.app_name.clone();
            stored.callback_url = record.callback_url.clone();
            stored.grant_types = record.grant_types.clone();
            stored.pkce_mandatory = record.pkce_mandatory;
            stored.pkce_support_plain = record.pkce_support_plain;
            stored.user_access_token_expire_time = record.user_access_token_expire_time;
            stored.app_access_token_expire_time = record.app_access_token_expire_time;
            stored.refresh_token_expire_time = record.refresh_token_expire_time;
            stored.id_token_expire_time = record.id_token_expire_time;
            if update_owner {
                stored.username = record.username.clone();
                stored.user_domain = record.user_domain.clone();
            }
        }
        Ok(1)
    }

    async fn rename_client(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        app_name: &str,
        owner: Option<(&str, &str)>,
    ) -> Result<u64> {
        let Some(id) = self.working.find_id(consumer_key, tenant_id) else {
            return Ok(0);
        };
        if let Some(stored) = self.working.clients.get_mut(&id) {
            stored.app_name = app_name.to_string();
            if let Some((username, user_domain)) = owner {
                stored.username = username.to_string();
                stored.user_domain = user_domain.to_string();
            }
        }
        Ok(1)
    }

    async fn update_state(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        state: &str,
    ) -> Result<u64> {
        let Some(id) = self.working.find_id(consumer_key, tenant_id) else {
            return Ok(0);
        };
        if let Some(stored) = self.working.clients.get_mut(&id) {
            stored.app_state = state.to_string();
        }
        Ok(1)
    }

    async fn replace_scope_validators(
        &mut self,
        app_id: i64,
        validators: &BTreeSet<String>,
    ) -> Result<()> {
        if validators.is_empty() {
            self.working.scope_validators.remove(&app_id);
        } else {
            self.working
                .scope_validators
                .insert(app_id, validators.clone());
        }
        Ok(())
    }

    async fn replace_access_token_claims(
        &mut self,
        app_id: i64,
        claims: &BTreeSet<String>,
    ) -> Result<()> {
        if claims.is_empty() {
            self.working.access_token_claims.remove(&app_id);
        } else {
            self.working
                .access_token_claims
                .insert(app_id, claims.clone());
        }
        Ok(())
    }

    async fn properties(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<Vec<PropertyRow>> {
        Ok(self.working.properties_of(consumer_key, tenant_id))
    }

    async fn apply_property_batches(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        batches: &PropertyBatches,
    ) -> Result<()> {
        let owned_by = |p: &StoredProperty| p.consumer_key == consumer_key && p.tenant_id == tenant_id;

        for row in &batches.deletes {
            self.working
                .properties
                .retain(|p| !(owned_by(p) && p.key == row.key && p.value == row.value));
        }
        for row in &batches.updates {
            for stored in self
                .working
                .properties
                .iter_mut()
                .filter(|p| p.consumer_key == consumer_key && p.tenant_id == tenant_id)
                .filter(|p| p.key == row.key)
            {
                stored.value = row.value.clone();
            }
        }
        for row in &batches.inserts {
            self.working.properties.push(StoredProperty {
                tenant_id,
                consumer_key: consumer_key.to_string(),
                key: row.key.clone(),
                value: row.value.clone(),
            });
        }
        Ok(())
    }

    async fn delete_properties(&mut self, consumer_key: &str, tenant_id: i64) -> Result<u64> {
        let before = self.working.properties.len();
        self.working
            .properties
            .retain(|p| !(p.consumer_key == consumer_key && p.tenant_id == tenant_id));
        Ok((before - self.working.properties.len()) as u64)
    }

    async fn delete_client(&mut self, consumer_key: &str, tenant_id: i64) -> Result<u64> {
        match self.working.find_id(consumer_key, tenant_id) {
            Some(id) => {
                self.working.remove_client(id);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn link_service_provider(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        service_provider: &str,
    ) -> Result<()> {
        self.working.service_provider_links.push(ServiceProviderLink {
            tenant_id,
            consumer_key: consumer_key.to_string(),
            service_provider: service_provider.to_string(),
        });
        Ok(())
    }

    async fn delete_service_provider_links(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<u64> {
        let before = self.working.service_provider_links.len();
        self.working
            .service_provider_links
            .retain(|l| !(l.consumer_key == consumer_key && l.tenant_id == tenant_id));
        Ok((before - self.working.service_provider_links.len()) as u64)
    }

    async fn consumer_keys_for_tenant(&mut self, tenant_id: i64) -> Result<Vec<String>> {
        Ok(self
            .working
            .clients
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .map(|c| c.consumer_key.clone())
            .collect())
    }

    async fn delete_tenant_clients(&mut self, tenant_id: i64) -> Result<u64> {
        let ids: Vec<i64> = self
            .working
            .clients
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .map(|c| c.id)
            .collect();
        for id in &ids {
            self.working.remove_client(*id);
        }
        Ok(ids.len() as u64)
    }

    async fn delete_tenant_properties(&mut self, tenant_id: i64) -> Result<u64> {
        let before = self.working.properties.len();
        self.working.properties.retain(|p| p.tenant_id != tenant_id);
        Ok((before - self.working.properties.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryClientTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(consumer_key: &str, tenant_id: i64) -> ClientRecord {
        ClientRecord {
            id: 0,
            consumer_key: consumer_key.to_string(),
            consumer_secret: Some("secret".to_string()),
            username: "alice".to_string(),
            user_domain: "PRIMARY".to_string(),
            tenant_id,
            app_name: format!("app-{}", consumer_key),
            oauth_version: "OAuth-2.0".to_string(),
            callback_url: None,
            grant_types: Some("authorization_code".to_string()),
            pkce_mandatory: false,
            pkce_support_plain: false,
            user_access_token_expire_time: 0,
            app_access_token_expire_time: 0,
            refresh_token_expire_time: 0,
            id_token_expire_time: 0,
            app_state: "ACTIVE".to_string(),
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryClientStore::new();

        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_client(&record("key-1", 1)).await.unwrap();
        tx.apply_property_batches(
            "key-1",
            1,
            &PropertyBatches {
                inserts: vec![PropertyRow::new("audience", Some("api".to_string()))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let stored = store.get_client("key-1", 1).await.unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(store.properties("key-1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryClientStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_client(&record("key-1", 1)).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get_client("key-1", 1).await.unwrap().is_none());
        assert_eq!(store.client_count(1).await, 0);
    }

    #[tokio::test]
    async fn test_consumer_key_uniqueness_scope() {
        let store = MemoryClientStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_client(&record("key-1", 1)).await.unwrap();
        tx.insert_client(&record("key-1", 2)).await.unwrap();
        let duplicate = tx.insert_client(&record("key-1", 1)).await;
        assert!(matches!(duplicate, Err(StorageError::ConstraintViolation(_))));
        tx.rollback().await.unwrap();

        let store = MemoryClientStore::new().with_unique_client_ids_across_tenants();
        let mut tx = store.begin().await.unwrap();
        tx.insert_client(&record("key-1", 1)).await.unwrap();
        let duplicate = tx.insert_client(&record("key-1", 2)).await;
        assert!(duplicate.unwrap_err().is_duplicate_client());
        assert!(store.client_ids_unique_across_tenants().await.unwrap());
    }

    #[tokio::test]
    async fn test_property_batches() {
        let store = MemoryClientStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.apply_property_batches(
            "key-1",
            1,
            &PropertyBatches {
                inserts: vec![
                    PropertyRow::new("audience", Some("a".to_string())),
                    PropertyRow::new("audience", Some("b".to_string())),
                    PropertyRow::new("subject_type", Some("public".to_string())),
                ],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.apply_property_batches(
            "key-1",
            1,
            &PropertyBatches {
                inserts: vec![],
                updates: vec![PropertyRow::new("subject_type", Some("pairwise".to_string()))],
                deletes: vec![PropertyRow::new("audience", Some("a".to_string()))],
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut rows = store.properties("key-1", 1).await.unwrap();
        rows.sort();
        assert_eq!(
            rows,
            vec![
                PropertyRow::new("audience", Some("b".to_string())),
                PropertyRow::new("subject_type", Some("pairwise".to_string())),
            ]
        );
    }
}
