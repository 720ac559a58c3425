//! Client Registry Integration Tests
//!
//! These tests exercise the registry end to end over the in-memory store:
//! registration, lookup, update, tenant isolation, transactional rollback and
//! access token validation against registered clients.

use async_trait::async_trait;
use http::HeaderMap;
use oidc_registry::config::RegistrySettings;
use oidc_registry::errors::{RegistryError, StorageError, ValidationError};
use oidc_registry::oauth::{
    AppOwner, ClientApplication, ClientRegistry, HashingSecretProcessor, IntrospectedToken,
    MemoryTokenIntrospector, PlainTextSecretProcessor, SecretProcessor, StaticTenancy,
    TenantContext, TokenBinding, TokenValidator, TransportContext,
};
use oidc_registry::storage::traits::*;
use oidc_registry::storage::MemoryClientStore;
use std::collections::BTreeSet;
use std::sync::Arc;

const ROOT: &str = "carbon.super";
const ROOT_ID: i64 = -1234;
const ACME: &str = "acme.com";
const ACME_ID: i64 = 1;

fn tenancy() -> Arc<StaticTenancy> {
    Arc::new(
        StaticTenancy::new()
            .with_tenant(ROOT, ROOT_ID)
            .with_tenant(ACME, ACME_ID)
            .with_user(ROOT, "PRIMARY", "admin")
            .with_user(ACME, "PRIMARY", "admin")
            .with_user(ACME, "PRIMARY", "carol"),
    )
}

fn registry(store: Arc<dyn ClientStore>, secrets: Arc<dyn SecretProcessor>) -> ClientRegistry {
    let tenancy = tenancy();
    ClientRegistry::new(
        store,
        secrets,
        tenancy.clone(),
        tenancy,
        RegistrySettings::default(),
    )
}

fn application(name: &str, tenant_domain: &str) -> ClientApplication {
    let mut app = ClientApplication::new(name, AppOwner::new("admin", "PRIMARY", tenant_domain));
    app.callback_url = Some("https://rp.example.com/callback".to_string());
    app.oidc.audiences = ["api://orders".to_string()].into();
    app.oidc.subject_type = Some("public".to_string());
    app
}

#[tokio::test]
async fn test_register_lookup_update_remove() {
    let store = Arc::new(MemoryClientStore::new());
    let registry = registry(store.clone(), Arc::new(PlainTextSecretProcessor));
    let ctx = TenantContext::new(ROOT);

    // Step 1: Register
    let registered = registry.register(application("Orders", ROOT), &ctx).await.unwrap();
    let client_id = registered.client_id.clone();

    // Step 2: Lookups agree
    let by_id = registry.lookup(&client_id, ROOT_ID).await.unwrap();
    let by_name = registry.lookup_by_name("Orders", &ctx).await.unwrap();
    assert_eq!(by_id, registered);
    assert_eq!(by_name, registered);
    assert!(registry.is_duplicate_client_id(&client_id, ROOT_ID).await.unwrap());
    assert!(!registry.is_duplicate_client_id(&client_id, ACME_ID).await.unwrap());

    // Step 3: Update audiences and callback
    let mut changed = by_id.clone();
    changed.callback_url = Some("https://rp.example.com/v2/callback".to_string());
    changed.oidc.audiences = ["api://billing".to_string(), "api://orders".to_string()].into();
    let updated = registry.update(&changed, &ctx).await.unwrap();
    assert_eq!(updated.oidc.audiences.len(), 2);
    assert_eq!(
        updated.callback_url.as_deref(),
        Some("https://rp.example.com/v2/callback")
    );

    // Step 4: Remove
    registry.remove(&client_id, ROOT_ID).await.unwrap();
    assert!(matches!(
        registry.lookup(&client_id, ROOT_ID).await,
        Err(RegistryError::InvalidClient(_))
    ));
    assert_eq!(store.property_count(ROOT_ID).await, 0);
}

#[tokio::test]
async fn test_same_client_id_in_two_tenants() {
    let store = Arc::new(MemoryClientStore::new());
    let registry = registry(store.clone(), Arc::new(PlainTextSecretProcessor));

    let mut root_app = application("Orders", ROOT);
    root_app.client_id = "shared-client".to_string();
    registry
        .register(root_app, &TenantContext::new(ROOT))
        .await
        .unwrap();

    let mut acme_app = application("Orders", ACME);
    acme_app.client_id = "shared-client".to_string();
    registry
        .register(acme_app, &TenantContext::new(ACME))
        .await
        .unwrap();

    let all = registry
        .lookup_all_for_consumer_key("shared-client")
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(!registry.client_id_unique_across_tenants().await.unwrap());
}

#[tokio::test]
async fn test_client_ids_unique_across_tenants() {
    let store = Arc::new(MemoryClientStore::new().with_unique_client_ids_across_tenants());
    let registry = registry(store, Arc::new(PlainTextSecretProcessor));

    let mut root_app = application("Orders", ROOT);
    root_app.client_id = "shared-client".to_string();
    registry
        .register(root_app, &TenantContext::new(ROOT))
        .await
        .unwrap();

    assert!(registry.client_id_unique_across_tenants().await.unwrap());
    assert!(
        registry
            .is_duplicate_client_id("shared-client", ACME_ID)
            .await
            .unwrap()
    );

    let mut acme_app = application("Orders", ACME);
    acme_app.client_id = "shared-client".to_string();
    let result = registry.register(acme_app, &TenantContext::new(ACME)).await;
    assert!(matches!(result, Err(RegistryError::DuplicateClient(_))));
}

#[tokio::test]
async fn test_concurrent_registration_of_same_client_id() {
    let store = Arc::new(MemoryClientStore::new());
    let registry = Arc::new(registry(store.clone(), Arc::new(PlainTextSecretProcessor)));

    let attempts = (0..4).map(|i| {
        let registry = registry.clone();
        async move {
            let mut app = application(&format!("Orders {}", i), ROOT);
            app.client_id = "racing-client".to_string();
            registry.register(app, &TenantContext::new(ROOT)).await
        }
    });
    let results = futures::future::join_all(attempts).await;

    let registered = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(RegistryError::DuplicateClient(_))))
        .count();
    assert_eq!(registered, 1);
    assert_eq!(duplicates, 3);
    assert_eq!(store.client_count(ROOT_ID).await, 1);
}

#[tokio::test]
async fn test_hashed_secrets() {
    let registry = registry(
        Arc::new(MemoryClientStore::new()),
        Arc::new(HashingSecretProcessor),
    );

    let registered = registry
        .register(application("Orders", ROOT), &TenantContext::new(ROOT))
        .await
        .unwrap();
    let raw_secret = registered.client_secret.clone().unwrap();

    let fetched = registry
        .lookup(&registered.client_id, ROOT_ID)
        .await
        .unwrap();
    let stored_secret = fetched.client_secret.unwrap();
    assert_ne!(stored_secret, raw_secret);
    assert_eq!(stored_secret.len(), 64);
}

#[tokio::test]
async fn test_tenant_purge_is_isolated() {
    let store = Arc::new(MemoryClientStore::new());
    let registry = registry(store.clone(), Arc::new(PlainTextSecretProcessor));

    for name in ["Orders", "Billing"] {
        let registered = registry
            .register(application(name, ACME), &TenantContext::new(ACME))
            .await
            .unwrap();
        registry
            .link_service_provider(&registered.client_id, ACME_ID, name)
            .await
            .unwrap();
    }
    let survivor = registry
        .register(application("Orders", ROOT), &TenantContext::new(ROOT))
        .await
        .unwrap();

    let purge = registry.remove_all_for_tenant(ACME_ID).await.unwrap();
    assert_eq!(purge.clients, 2);
    assert_eq!(purge.service_provider_links, 2);
    assert!(purge.properties > 0);

    assert_eq!(store.client_count(ACME_ID).await, 0);
    assert_eq!(store.property_count(ACME_ID).await, 0);
    assert!(registry.lookup(&survivor.client_id, ROOT_ID).await.is_ok());
    assert!(store.property_count(ROOT_ID).await > 0);

    let again = registry.remove_all_for_tenant(ACME_ID).await.unwrap();
    assert_eq!(again.clients, 0);
}

#[tokio::test]
async fn test_owner_transfer_requires_existing_user() {
    let registry = registry(
        Arc::new(MemoryClientStore::new()),
        Arc::new(PlainTextSecretProcessor),
    );
    let ctx = TenantContext::new(ACME);
    let registered = registry.register(application("Orders", ACME), &ctx).await.unwrap();

    let mut to_ghost = registered.clone();
    to_ghost.owner = AppOwner::new("ghost", "PRIMARY", ACME);
    assert_eq!(
        registry.update(&to_ghost, &ctx).await.unwrap().owner.username,
        "admin"
    );

    let mut to_carol = registered.clone();
    to_carol.owner = AppOwner::new("carol", "PRIMARY", ACME);
    assert_eq!(
        registry.update(&to_carol, &ctx).await.unwrap().owner.username,
        "carol"
    );

    let carol_apps = registry.lookup_all_for_user("carol", ACME_ID).await.unwrap();
    assert_eq!(carol_apps.len(), 1);
    assert!(
        registry
            .lookup_all_for_user("admin", ACME_ID)
            .await
            .unwrap()
            .is_empty()
    );
}

/// Store whose transactions fail when writing OIDC properties
struct FailingPropertyStore {
    inner: MemoryClientStore,
}

struct FailingPropertyTransaction {
    inner: Box<dyn ClientTransaction>,
}

#[async_trait]
impl ClientStore for FailingPropertyStore {
    async fn begin(&self) -> Result<Box<dyn ClientTransaction>> {
        Ok(Box::new(FailingPropertyTransaction {
            inner: self.inner.begin().await?,
        }))
    }

    async fn get_client(&self, consumer_key: &str, tenant_id: i64) -> Result<Option<ClientRecord>> {
        self.inner.get_client(consumer_key, tenant_id).await
    }

    async fn find_clients_by_consumer_key(&self, consumer_key: &str) -> Result<Vec<ClientRecord>> {
        self.inner.find_clients_by_consumer_key(consumer_key).await
    }

    async fn find_client_by_name(
        &self,
        app_name: &str,
        tenant_id: i64,
    ) -> Result<Option<ClientRecord>> {
        self.inner.find_client_by_name(app_name, tenant_id).await
    }

    async fn find_clients_by_owner(&self, owner: &OwnerFilter) -> Result<Vec<ClientRecord>> {
        self.inner.find_clients_by_owner(owner).await
    }

    async fn client_name_exists(&self, owner: &OwnerFilter, app_name: &str) -> Result<bool> {
        self.inner.client_name_exists(owner, app_name).await
    }

    async fn client_exists(&self, consumer_key: &str, tenant_id: i64) -> Result<bool> {
        self.inner.client_exists(consumer_key, tenant_id).await
    }

    async fn client_state(&self, consumer_key: &str, tenant_id: i64) -> Result<Option<String>> {
        self.inner.client_state(consumer_key, tenant_id).await
    }

    async fn scope_validators(&self, app_id: i64) -> Result<BTreeSet<String>> {
        self.inner.scope_validators(app_id).await
    }

    async fn access_token_claims(&self, app_id: i64) -> Result<BTreeSet<String>> {
        self.inner.access_token_claims(app_id).await
    }

    async fn properties(&self, consumer_key: &str, tenant_id: i64) -> Result<Vec<PropertyRow>> {
        self.inner.properties(consumer_key, tenant_id).await
    }

    async fn service_provider_links(
        &self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<Vec<String>> {
        self.inner.service_provider_links(consumer_key, tenant_id).await
    }

    async fn client_ids_unique_across_tenants(&self) -> Result<bool> {
        self.inner.client_ids_unique_across_tenants().await
    }
}

#[async_trait]
impl ClientTransaction for FailingPropertyTransaction {
    async fn insert_client(&mut self, record: &ClientRecord) -> Result<i64> {
        self.inner.insert_client(record).await
    }

    async fn update_client(&mut self, record: &ClientRecord, update_owner: bool) -> Result<u64> {
        self.inner.update_client(record, update_owner).await
    }

    async fn rename_client(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        app_name: &str,
        owner: Option<(&str, &str)>,
    ) -> Result<u64> {
        self.inner
            .rename_client(consumer_key, tenant_id, app_name, owner)
            .await
    }

    async fn update_state(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        state: &str,
    ) -> Result<u64> {
        self.inner.update_state(consumer_key, tenant_id, state).await
    }

    async fn replace_scope_validators(
        &mut self,
        app_id: i64,
        validators: &BTreeSet<String>,
    ) -> Result<()> {
        self.inner.replace_scope_validators(app_id, validators).await
    }

    async fn replace_access_token_claims(
        &mut self,
        app_id: i64,
        claims: &BTreeSet<String>,
    ) -> Result<()> {
        self.inner.replace_access_token_claims(app_id, claims).await
    }

    async fn properties(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<Vec<PropertyRow>> {
        self.inner.properties(consumer_key, tenant_id).await
    }

    async fn apply_property_batches(
        &mut self,
        _consumer_key: &str,
        _tenant_id: i64,
        _batches: &PropertyBatches,
    ) -> Result<()> {
        Err(StorageError::DatabaseError("disk I/O error".to_string()))
    }

    async fn delete_properties(&mut self, consumer_key: &str, tenant_id: i64) -> Result<u64> {
        self.inner.delete_properties(consumer_key, tenant_id).await
    }

    async fn delete_client(&mut self, consumer_key: &str, tenant_id: i64) -> Result<u64> {
        self.inner.delete_client(consumer_key, tenant_id).await
    }

    async fn link_service_provider(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
        service_provider: &str,
    ) -> Result<()> {
        self.inner
            .link_service_provider(consumer_key, tenant_id, service_provider)
            .await
    }

    async fn delete_service_provider_links(
        &mut self,
        consumer_key: &str,
        tenant_id: i64,
    ) -> Result<u64> {
        self.inner
            .delete_service_provider_links(consumer_key, tenant_id)
            .await
    }

    async fn consumer_keys_for_tenant(&mut self, tenant_id: i64) -> Result<Vec<String>> {
        self.inner.consumer_keys_for_tenant(tenant_id).await
    }

    async fn delete_tenant_clients(&mut self, tenant_id: i64) -> Result<u64> {
        self.inner.delete_tenant_clients(tenant_id).await
    }

    async fn delete_tenant_properties(&mut self, tenant_id: i64) -> Result<u64> {
        self.inner.delete_tenant_properties(tenant_id).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn test_failed_property_write_rolls_back_registration() {
    let memory = MemoryClientStore::new();
    let failing = Arc::new(FailingPropertyStore {
        inner: memory.clone(),
    });
    let registry = registry(failing, Arc::new(PlainTextSecretProcessor));

    let result = registry
        .register(application("Orders", ROOT), &TenantContext::new(ROOT))
        .await;
    assert!(matches!(
        result,
        Err(RegistryError::StoreUnavailable { .. })
    ));

    assert_eq!(memory.client_count(ROOT_ID).await, 0);
    assert_eq!(memory.property_count(ROOT_ID).await, 0);
}

#[tokio::test]
async fn test_validate_bound_token_from_headers() {
    let registry = Arc::new(registry(
        Arc::new(MemoryClientStore::new()),
        Arc::new(PlainTextSecretProcessor),
    ));
    let mut app = application("Orders", ACME);
    app.oidc.token_binding_type = Some("certificate".to_string());
    app.oidc.token_binding_validation = true;
    let registered = registry
        .register(app, &TenantContext::new(ACME))
        .await
        .unwrap();

    let introspector = Arc::new(MemoryTokenIntrospector::new());
    introspector
        .insert(
            IntrospectedToken::active("token-1", &registered.client_id, ["openid", "email"])
                .with_authorized_user(oidc_registry::oauth::AuthorizedUser {
                    username: "carol".to_string(),
                    user_store_domain: "PRIMARY".to_string(),
                    tenant_domain: ACME.to_string(),
                })
                .with_token_binding(TokenBinding {
                    binding_type: "certificate".to_string(),
                    binding_reference: TokenBinding::reference_for("client-cert"),
                }),
        )
        .await;
    let validator = TokenValidator::new(introspector, registry.clone());

    let mut headers = HeaderMap::new();
    headers.insert("x-token-binding", "client-cert".parse().unwrap());
    let transport = TransportContext::from_headers(&headers, "x-token-binding");
    let result = validator.validate("token-1", Some(&transport)).await.unwrap();
    assert!(result.valid);
    assert_eq!(result.authorized_user.username, "carol");

    let mut headers = HeaderMap::new();
    headers.insert("x-token-binding", "stolen-cert".parse().unwrap());
    let transport = TransportContext::from_headers(&headers, "x-token-binding");
    assert!(matches!(
        validator.validate("token-1", Some(&transport)).await,
        Err(ValidationError::InvalidRequest(_))
    ));

    // Deactivated clients still resolve, only the token matters here.
    registry
        .update_state(&registered.client_id, ACME_ID, "INACTIVE")
        .await
        .unwrap();
    assert!(validator.validate("token-1", None).await.is_ok());
}

#[tokio::test]
async fn test_validator_uses_app_resident_tenant() {
    let registry = Arc::new(registry(
        Arc::new(MemoryClientStore::new()),
        Arc::new(PlainTextSecretProcessor),
    ));
    let registered = registry
        .register(application("Orders", ROOT), &TenantContext::new(ROOT))
        .await
        .unwrap();

    let introspector = Arc::new(MemoryTokenIntrospector::new());
    introspector
        .insert(
            IntrospectedToken::active("token-1", &registered.client_id, ["openid"])
                .with_authorized_user(oidc_registry::oauth::AuthorizedUser {
                    username: "carol".to_string(),
                    user_store_domain: "PRIMARY".to_string(),
                    tenant_domain: ACME.to_string(),
                }),
        )
        .await;

    let in_user_tenant = TokenValidator::new(introspector.clone(), registry.clone());
    assert!(matches!(
        in_user_tenant.validate("token-1", None).await,
        Err(ValidationError::Registry(RegistryError::InvalidClient(_)))
    ));

    let in_resident_tenant = TokenValidator::new(introspector, registry)
        .with_app_resident_tenant(Some(ROOT.to_string()));
    assert!(in_resident_tenant.validate("token-1", None).await.is_ok());
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use oidc_registry::storage::SqliteClientStore;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_sqlite_registry_round_trip() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteClientStore::new(pool);
        store.migrate().await.unwrap();
        let registry = registry(Arc::new(store), Arc::new(PlainTextSecretProcessor));
        let ctx = TenantContext::new(ACME);

        let registered = registry.register(application("Orders", ACME), &ctx).await.unwrap();
        let fetched = registry
            .lookup(&registered.client_id, ACME_ID)
            .await
            .unwrap();
        assert_eq!(fetched, registered);

        let duplicate = registry.register(application("Orders", ACME), &ctx).await;
        assert!(matches!(duplicate, Err(RegistryError::DuplicateClient(_))));

        let mut changed = fetched.clone();
        changed.oidc.audiences = ["api://billing".to_string()].into();
        let updated = registry.update(&changed, &ctx).await.unwrap();
        assert_eq!(
            updated.oidc.audiences.into_iter().collect::<Vec<_>>(),
            vec!["api://billing".to_string()]
        );

        let purge = registry.remove_all_for_tenant(ACME_ID).await.unwrap();
        assert_eq!(purge.clients, 1);
        assert!(matches!(
            registry.lookup(&registered.client_id, ACME_ID).await,
            Err(RegistryError::InvalidClient(_))
        ));
    }
}
