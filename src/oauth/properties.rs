//! OIDC property persistence and reconciliation.

use crate::errors::RegistryError;
use crate::storage::rollback_transaction;
use crate::storage::traits::{self, ClientStore, ClientTransaction, PropertyBatches, PropertyRow};
use std::collections::BTreeSet;
use std::sync::Arc;

pub use crate::oauth::oidc_properties::*;

/// Compute the writes that turn `current` into `desired`.
///
/// Single-valued keys missing from the store are inserted when the desired
/// value is present, and updated when the stored value differs. Audiences are
/// reconciled as sets: `desired - current` is inserted and `current - desired`
/// deleted. Unchanged values produce no writes, so planning against the
/// result of a previous plan yields empty batches.
pub fn plan_reconciliation(
    current: &PropertyMap,
    desired: &PropertyMap,
    audience_enabled: bool,
) -> PropertyBatches {
    let mut batches = PropertyBatches::default();

    for key in PropertyKey::ALL {
        if key.is_multi_valued() {
            if !audience_enabled {
                continue;
            }
            let values = |map: &PropertyMap| -> BTreeSet<String> {
                map.get(&key)
                    .map(|values| values.iter().flatten().cloned().collect())
                    .unwrap_or_default()
            };
            let current_values = values(current);
            let desired_values = values(desired);

            for added in desired_values.difference(&current_values) {
                batches
                    .inserts
                    .push(PropertyRow::new(key.as_str(), Some(added.clone())));
            }
            for removed in current_values.difference(&desired_values) {
                batches
                    .deletes
                    .push(PropertyRow::new(key.as_str(), Some(removed.clone())));
            }
            continue;
        }

        let Some(desired_values) = desired.get(&key) else {
            continue;
        };
        let desired_value = desired_values.first().cloned().flatten();

        match current.get(&key) {
            None => {
                if desired_value.is_some() {
                    batches
                        .inserts
                        .push(PropertyRow::new(key.as_str(), desired_value));
                }
            }
            Some(current_values) => {
                let current_value = current_values.first().cloned().flatten();
                if current_value != desired_value {
                    batches
                        .updates
                        .push(PropertyRow::new(key.as_str(), desired_value));
                }
            }
        }
    }

    batches
}

/// Reads and reconciles the OIDC properties of client applications
#[derive(Clone)]
pub struct PropertyStore {
    store: Arc<dyn ClientStore>,
    audience_enabled: bool,
}

impl PropertyStore {
    pub fn new(store: Arc<dyn ClientStore>, audience_enabled: bool) -> Self {
        Self {
            store,
            audience_enabled,
        }
    }

    pub fn audience_enabled(&self) -> bool {
        self.audience_enabled
    }

    /// Load the properties of a client by its processed client id.
    pub async fn load_properties(
        &self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<OidcProperties, RegistryError> {
        let rows = self
            .store
            .properties(consumer_key, tenant_id)
            .await
            .map_err(|e| RegistryError::store("Failed to load OIDC properties", e))?;
        Ok(OidcProperties::from_property_map(
            &property_map_from_rows(&rows),
            self.audience_enabled,
        ))
    }

    /// Stored audience values of a client, regardless of the audience feature toggle.
    pub async fn audiences(
        &self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<BTreeSet<String>, RegistryError> {
        let rows = self
            .store
            .properties(consumer_key, tenant_id)
            .await
            .map_err(|e| RegistryError::store("Failed to load OIDC audiences", e))?;
        Ok(rows
            .into_iter()
            .filter(|row| row.key == PropertyKey::Audience.as_str())
            .filter_map(|row| row.value)
            .collect())
    }

    /// Reconcile stored properties with `desired` in a transaction of its own.
    ///
    /// Returns the applied writes.
    pub async fn reconcile_properties(
        &self,
        consumer_key: &str,
        tenant_id: i64,
        desired: &OidcProperties,
    ) -> Result<PropertyBatches, RegistryError> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| RegistryError::store("Failed to open transaction", e))?;

        match self
            .reconcile_in(tx.as_mut(), consumer_key, tenant_id, desired)
            .await
        {
            Ok(batches) => {
                tx.commit()
                    .await
                    .map_err(|e| RegistryError::store("Failed to commit OIDC properties", e))?;
                Ok(batches)
            }
            Err(e) => {
                rollback_transaction(tx, "reconcile_properties").await;
                Err(RegistryError::store("Failed to reconcile OIDC properties", e))
            }
        }
    }

    /// Reconcile inside a transaction owned by the caller.
    pub async fn reconcile_in(
        &self,
        tx: &mut dyn ClientTransaction,
        consumer_key: &str,
        tenant_id: i64,
        desired: &OidcProperties,
    ) -> traits::Result<PropertyBatches> {
        let current = property_map_from_rows(&tx.properties(consumer_key, tenant_id).await?);
        let desired = desired
            .clone()
            .normalized()
            .to_property_map(self.audience_enabled);

        let batches = plan_reconciliation(&current, &desired, self.audience_enabled);
        if !batches.is_empty() {
            tx.apply_property_batches(consumer_key, tenant_id, &batches)
                .await?;
        }

        tracing::debug!(
            consumer_key,
            tenant_id,
            inserts = batches.inserts.len(),
            updates = batches.updates.len(),
            deletes = batches.deletes.len(),
            "reconciled OIDC properties"
        );
        Ok(batches)
    }

    /// Delete every property row of a client.
    pub async fn remove_properties(
        &self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<u64, RegistryError> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| RegistryError::store("Failed to open transaction", e))?;

        match tx.delete_properties(consumer_key, tenant_id).await {
            Ok(removed) => {
                tx.commit()
                    .await
                    .map_err(|e| RegistryError::store("Failed to commit property removal", e))?;
                Ok(removed)
            }
            Err(e) => {
                rollback_transaction(tx, "remove_properties").await;
                Err(RegistryError::store("Failed to remove OIDC properties", e))
            }
        }
    }
}
