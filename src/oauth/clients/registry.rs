//! Client application registry.
//!
//! Owns the lifecycle of OAuth2 client applications: registration with
//! duplicate detection, lookups that resolve templated callbacks, guarded
//! updates, and per-client or per-tenant removal. Every multi-step write runs
//! in a single store transaction.

use crate::config::RegistrySettings;
use crate::errors::{RegistryError, StorageError, TenantError};
use crate::oauth::clients::callback::FirstPartyApp;
use crate::oauth::properties::{EffectiveHybridFlow, PropertyStore};
use crate::oauth::secret::SecretProcessor;
use crate::oauth::tenancy::{TenantResolver, UserDirectory};
use crate::oauth::types::*;
use crate::storage::rollback_transaction;
use crate::storage::traits::{ClientRecord, ClientStore, ClientTransaction, OwnerFilter};
use std::collections::BTreeSet;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, RegistryError>;

const CLIENT_ID_GENERATION_ATTEMPTS: usize = 10;

/// Rows removed by a tenant-wide purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TenantPurge {
    pub clients: u64,
    pub properties: u64,
    pub service_provider_links: u64,
}

/// OAuth2 client application registry
pub struct ClientRegistry {
    store: Arc<dyn ClientStore>,
    properties: PropertyStore,
    secrets: Arc<dyn SecretProcessor>,
    tenants: Arc<dyn TenantResolver>,
    users: Arc<dyn UserDirectory>,
    settings: RegistrySettings,
}

impl ClientRegistry {
    pub fn new(
        store: Arc<dyn ClientStore>,
        secrets: Arc<dyn SecretProcessor>,
        tenants: Arc<dyn TenantResolver>,
        users: Arc<dyn UserDirectory>,
        settings: RegistrySettings,
    ) -> Self {
        let properties = PropertyStore::new(store.clone(), settings.audience_enabled);
        Self {
            store,
            properties,
            secrets,
            tenants,
            users,
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    /// Tenant id of a tenant domain
    pub async fn tenant_id(&self, tenant_domain: &str) -> Result<i64> {
        Ok(self.tenants.tenant_id(tenant_domain).await?)
    }

    /// Register a new client application.
    ///
    /// Generates a client id and secret when none are given. The returned
    /// application carries the store id and the raw credentials.
    pub async fn register(
        &self,
        app: ClientApplication,
        ctx: &TenantContext,
    ) -> Result<ClientApplication> {
        let mut app = app;
        let tenant_domain = self.context_tenant_domain(ctx).await?;
        let tenant_id = self.tenants.tenant_id(&tenant_domain).await?;
        app.owner.tenant_domain = tenant_domain;
        if app.owner.user_store_domain.trim().is_empty() {
            app.owner.user_store_domain = PRIMARY_USER_STORE_DOMAIN.to_string();
        }

        if self
            .is_duplicate_application_name(&app.owner, tenant_id, &app.application_name)
            .await?
        {
            return Err(RegistryError::DuplicateClient(format!(
                "An application named {} already exists for {}",
                app.application_name,
                app.owner.qualified_username()
            )));
        }

        if app.client_id.trim().is_empty() {
            app.client_id = self.generate_unique_client_id(tenant_id).await?;
        }
        let client_secret = app
            .client_secret
            .take()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(generate_token);

        let consumer_key = self.secrets.process_client_id(&app.client_id)?;
        let consumer_secret = self.secrets.process_client_secret(&client_secret)?;
        app.client_secret = Some(client_secret);
        if app.oauth_version.trim().is_empty() {
            app.oauth_version = DEFAULT_OAUTH_VERSION.to_string();
        }
        if app.state.trim().is_empty() {
            app.state = APP_STATE_ACTIVE.to_string();
        }
        app.oidc = app.oidc.normalized();
        if !self.settings.audience_enabled {
            app.oidc.audiences.clear();
        }

        let callback_url = self.template_callback(&app, tenant_id, true).await?;
        let record =
            self.to_record(&app, consumer_key, Some(consumer_secret), tenant_id, callback_url)?;

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| RegistryError::store("Failed to open transaction", e))?;

        let id = match self.insert_client(tx.as_mut(), &record, &app).await {
            Ok(id) => id,
            Err(e) => {
                rollback_transaction(tx, "register").await;
                return Err(Self::registration_error(&app.client_id, e));
            }
        };
        tx.commit()
            .await
            .map_err(|e| Self::registration_error(&app.client_id, e))?;

        tracing::info!(
            client_id = %app.client_id,
            tenant_id,
            application_name = %app.application_name,
            "registered client application"
        );

        app.id = Some(id);
        Ok(app)
    }

    async fn insert_client(
        &self,
        tx: &mut dyn ClientTransaction,
        record: &ClientRecord,
        app: &ClientApplication,
    ) -> std::result::Result<i64, StorageError> {
        let id = tx.insert_client(record).await?;
        if !app.scope_validators.is_empty() {
            tx.replace_scope_validators(id, &app.scope_validators)
                .await?;
        }
        if !app.access_token_claims.is_empty() {
            tx.replace_access_token_claims(id, &app.access_token_claims)
                .await?;
        }
        self.properties
            .reconcile_in(tx, &record.consumer_key, record.tenant_id, &app.oidc)
            .await?;
        Ok(id)
    }

    fn registration_error(client_id: &str, error: StorageError) -> RegistryError {
        if error.is_duplicate_client() {
            RegistryError::DuplicateClient(format!(
                "An application with client id {} already exists",
                client_id
            ))
        } else {
            RegistryError::store("Failed to register client application", error)
        }
    }

    /// Fetch the application with this client id in a tenant.
    pub async fn lookup(&self, client_id: &str, tenant_id: i64) -> Result<ClientApplication> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        let record = self
            .store
            .get_client(&consumer_key, tenant_id)
            .await
            .map_err(|e| RegistryError::store("Failed to fetch client application", e))?
            .ok_or_else(|| {
                RegistryError::InvalidClient(format!(
                    "Cannot find an application associated with the client id {}",
                    client_id
                ))
            })?;
        self.hydrate(record).await
    }

    /// Fetch an application by name in the context tenant.
    pub async fn lookup_by_name(
        &self,
        application_name: &str,
        ctx: &TenantContext,
    ) -> Result<ClientApplication> {
        let tenant_domain = self.context_tenant_domain(ctx).await?;
        let tenant_id = self.tenants.tenant_id(&tenant_domain).await?;
        let record = self
            .store
            .find_client_by_name(application_name, tenant_id)
            .await
            .map_err(|e| RegistryError::store("Failed to fetch client application", e))?
            .ok_or_else(|| {
                RegistryError::AppNotFound(format!(
                    "Cannot find an application named {} in {}",
                    application_name, tenant_domain
                ))
            })?;
        self.hydrate(record).await
    }

    /// Fetch the applications with this client id across all tenants.
    pub async fn lookup_all_for_consumer_key(
        &self,
        client_id: &str,
    ) -> Result<Vec<ClientApplication>> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        let records = self
            .store
            .find_clients_by_consumer_key(&consumer_key)
            .await
            .map_err(|e| RegistryError::store("Failed to fetch client applications", e))?;
        if records.is_empty() {
            return Err(RegistryError::InvalidClient(format!(
                "Cannot find an application associated with the client id {}",
                client_id
            )));
        }
        self.hydrate_all(records).await
    }

    /// Applications owned by a user. The username may carry a `DOMAIN/` prefix.
    ///
    /// An unknown tenant owns no applications and yields an empty list.
    pub async fn lookup_all_for_user(
        &self,
        username: &str,
        tenant_id: i64,
    ) -> Result<Vec<ClientApplication>> {
        let tenant_domain = match self.tenants.tenant_domain(tenant_id).await {
            Ok(tenant_domain) => tenant_domain,
            Err(TenantError::UnknownTenantId(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let owner = AppOwner::from_qualified(username, &tenant_domain);
        let filter = self.owner_filter(&owner, tenant_id).await?;
        let records = self
            .store
            .find_clients_by_owner(&filter)
            .await
            .map_err(|e| RegistryError::store("Failed to fetch user applications", e))?;
        self.hydrate_all(records).await
    }

    /// Update an existing application.
    ///
    /// Ownership moves to `app.owner` only when that user exists in the tenant
    /// and is not the system user. Otherwise the remaining fields are updated
    /// and the current owner is kept.
    pub async fn update(
        &self,
        app: &ClientApplication,
        ctx: &TenantContext,
    ) -> Result<ClientApplication> {
        let tenant_domain = self.context_tenant_domain(ctx).await?;
        let tenant_id = self.tenants.tenant_id(&tenant_domain).await?;
        let consumer_key = self.secrets.process_client_id(&app.client_id)?;

        let existing = self
            .store
            .get_client(&consumer_key, tenant_id)
            .await
            .map_err(|e| RegistryError::store("Failed to fetch client application", e))?
            .ok_or_else(|| {
                RegistryError::InvalidClient(format!(
                    "Cannot find an application associated with the client id {}",
                    app.client_id
                ))
            })?;

        let update_owner = self
            .owner_update_allowed(Some(&app.owner), &tenant_domain)
            .await?;
        if !update_owner {
            tracing::info!(
                client_id = %app.client_id,
                owner = %app.owner.qualified_username(),
                "owner is not a valid user, keeping the current application owner"
            );
        }

        let callback_url = self.template_callback(app, tenant_id, false).await?;
        let mut record = self.to_record(
            app,
            consumer_key,
            existing.consumer_secret.clone(),
            tenant_id,
            callback_url,
        )?;
        record.id = existing.id;
        if record.user_domain.trim().is_empty() {
            record.user_domain = PRIMARY_USER_STORE_DOMAIN.to_string();
        }

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| RegistryError::store("Failed to open transaction", e))?;

        if let Err(e) = self.write_update(tx.as_mut(), &record, app, update_owner).await {
            rollback_transaction(tx, "update").await;
            return Err(RegistryError::store("Failed to update client application", e));
        }
        tx.commit()
            .await
            .map_err(|e| RegistryError::store("Failed to commit client application update", e))?;

        tracing::info!(client_id = %app.client_id, tenant_id, "updated client application");
        self.lookup(&app.client_id, tenant_id).await
    }

    async fn write_update(
        &self,
        tx: &mut dyn ClientTransaction,
        record: &ClientRecord,
        app: &ClientApplication,
        update_owner: bool,
    ) -> std::result::Result<(), StorageError> {
        tx.update_client(record, update_owner).await?;
        tx.replace_scope_validators(record.id, &app.scope_validators)
            .await?;
        tx.replace_access_token_claims(record.id, &app.access_token_claims)
            .await?;
        self.properties
            .reconcile_in(tx, &record.consumer_key, record.tenant_id, &app.oidc)
            .await?;
        Ok(())
    }

    /// Rename an application.
    pub async fn update_application_name(
        &self,
        application_name: &str,
        client_id: &str,
        tenant_id: i64,
    ) -> Result<()> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        self.rename(&consumer_key, client_id, tenant_id, application_name, None)
            .await
    }

    /// Apply a service provider's name, and its owner when that owner is a
    /// valid user, to the linked application.
    pub async fn update_from_service_provider(
        &self,
        service_provider: &ServiceProvider,
        client_id: &str,
    ) -> Result<()> {
        let tenant_id = self
            .tenants
            .tenant_id(&service_provider.tenant_domain)
            .await?;
        let consumer_key = self.secrets.process_client_id(client_id)?;
        let update_owner = self
            .owner_update_allowed(
                service_provider.owner.as_ref(),
                &service_provider.tenant_domain,
            )
            .await?;

        let owner = service_provider
            .owner
            .as_ref()
            .filter(|_| update_owner)
            .map(|o| (o.username.as_str(), o.user_store_domain.as_str()));
        self.rename(
            &consumer_key,
            client_id,
            tenant_id,
            &service_provider.name,
            owner,
        )
        .await
    }

    async fn rename(
        &self,
        consumer_key: &str,
        client_id: &str,
        tenant_id: i64,
        application_name: &str,
        owner: Option<(&str, &str)>,
    ) -> Result<()> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| RegistryError::store("Failed to open transaction", e))?;

        match tx
            .rename_client(consumer_key, tenant_id, application_name, owner)
            .await
        {
            Ok(0) => {
                rollback_transaction(tx, "rename").await;
                Err(RegistryError::InvalidClient(format!(
                    "Cannot find an application associated with the client id {}",
                    client_id
                )))
            }
            Ok(_) => tx
                .commit()
                .await
                .map_err(|e| RegistryError::store("Failed to commit application rename", e)),
            Err(e) => {
                rollback_transaction(tx, "rename").await;
                Err(RegistryError::store("Failed to rename client application", e))
            }
        }
    }

    /// Change the lifecycle state of an application.
    pub async fn update_state(&self, client_id: &str, tenant_id: i64, state: &str) -> Result<()> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| RegistryError::store("Failed to open transaction", e))?;

        match tx.update_state(&consumer_key, tenant_id, state).await {
            Ok(0) => {
                rollback_transaction(tx, "update_state").await;
                Err(RegistryError::InvalidClient(format!(
                    "Cannot find an application associated with the client id {}",
                    client_id
                )))
            }
            Ok(_) => {
                tx.commit()
                    .await
                    .map_err(|e| RegistryError::store("Failed to commit state change", e))?;
                tracing::info!(client_id, tenant_id, state, "updated application state");
                Ok(())
            }
            Err(e) => {
                rollback_transaction(tx, "update_state").await;
                Err(RegistryError::store("Failed to update application state", e))
            }
        }
    }

    /// Lifecycle state of an application, if it exists.
    pub async fn get_state(&self, client_id: &str, tenant_id: i64) -> Result<Option<String>> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        self.store
            .client_state(&consumer_key, tenant_id)
            .await
            .map_err(|e| RegistryError::store("Failed to fetch application state", e))
    }

    /// Remove an application with its OIDC properties and service provider links.
    ///
    /// Removing an unknown client id is not an error.
    pub async fn remove(&self, client_id: &str, tenant_id: i64) -> Result<()> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| RegistryError::store("Failed to open transaction", e))?;

        let removed = async {
            tx.delete_service_provider_links(&consumer_key, tenant_id)
                .await?;
            tx.delete_properties(&consumer_key, tenant_id).await?;
            tx.delete_client(&consumer_key, tenant_id).await
        }
        .await;

        match removed {
            Ok(rows) => {
                tx.commit()
                    .await
                    .map_err(|e| RegistryError::store("Failed to commit client removal", e))?;
                tracing::info!(client_id, tenant_id, removed = rows, "removed client application");
                Ok(())
            }
            Err(e) => {
                rollback_transaction(tx, "remove").await;
                Err(RegistryError::store("Failed to remove client application", e))
            }
        }
    }

    /// Remove every application of a tenant together with their OIDC
    /// properties and service provider links.
    pub async fn remove_all_for_tenant(&self, tenant_id: i64) -> Result<TenantPurge> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| RegistryError::store("Failed to open transaction", e))?;

        let purged = async {
            let mut purge = TenantPurge::default();
            for consumer_key in tx.consumer_keys_for_tenant(tenant_id).await? {
                purge.service_provider_links += tx
                    .delete_service_provider_links(&consumer_key, tenant_id)
                    .await?;
            }
            purge.clients = tx.delete_tenant_clients(tenant_id).await?;
            purge.properties = tx.delete_tenant_properties(tenant_id).await?;
            Ok::<_, StorageError>(purge)
        }
        .await;

        match purged {
            Ok(purge) => {
                tx.commit()
                    .await
                    .map_err(|e| RegistryError::store("Failed to commit tenant removal", e))?;
                tracing::info!(
                    tenant_id,
                    clients = purge.clients,
                    properties = purge.properties,
                    service_provider_links = purge.service_provider_links,
                    "removed tenant client applications"
                );
                Ok(purge)
            }
            Err(e) => {
                rollback_transaction(tx, "remove_all_for_tenant").await;
                Err(RegistryError::store(
                    "Failed to remove tenant client applications",
                    e,
                ))
            }
        }
    }

    /// Associate an application with a service provider.
    pub async fn link_service_provider(
        &self,
        client_id: &str,
        tenant_id: i64,
        service_provider: &str,
    ) -> Result<()> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| RegistryError::store("Failed to open transaction", e))?;

        match tx
            .link_service_provider(&consumer_key, tenant_id, service_provider)
            .await
        {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| RegistryError::store("Failed to commit service provider link", e)),
            Err(e) => {
                rollback_transaction(tx, "link_service_provider").await;
                Err(RegistryError::store("Failed to link service provider", e))
            }
        }
    }

    /// Service providers linked to an application
    pub async fn service_provider_links(
        &self,
        client_id: &str,
        tenant_id: i64,
    ) -> Result<Vec<String>> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        self.store
            .service_provider_links(&consumer_key, tenant_id)
            .await
            .map_err(|e| RegistryError::store("Failed to fetch service provider links", e))
    }

    /// Whether the client id is taken, in this tenant or in any tenant when
    /// client ids are unique across tenants.
    pub async fn is_duplicate_client_id(&self, client_id: &str, tenant_id: i64) -> Result<bool> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        let store_error = |e| RegistryError::store("Failed to check client id", e);

        if self
            .store
            .client_ids_unique_across_tenants()
            .await
            .map_err(store_error)?
        {
            let records = self
                .store
                .find_clients_by_consumer_key(&consumer_key)
                .await
                .map_err(store_error)?;
            return Ok(!records.is_empty());
        }
        self.store
            .client_exists(&consumer_key, tenant_id)
            .await
            .map_err(store_error)
    }

    /// Whether the owner already has an application with this name.
    pub async fn is_duplicate_application_name(
        &self,
        owner: &AppOwner,
        tenant_id: i64,
        application_name: &str,
    ) -> Result<bool> {
        let filter = self.owner_filter(owner, tenant_id).await?;
        self.store
            .client_name_exists(&filter, application_name)
            .await
            .map_err(|e| RegistryError::store("Failed to check application name", e))
    }

    /// Audiences stored for an application.
    pub async fn oidc_audiences(&self, client_id: &str, tenant_id: i64) -> Result<BTreeSet<String>> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        self.properties.audiences(&consumer_key, tenant_id).await
    }

    /// Delete every OIDC property of an application.
    pub async fn remove_oidc_properties(&self, client_id: &str, tenant_id: i64) -> Result<u64> {
        let consumer_key = self.secrets.process_client_id(client_id)?;
        self.properties
            .remove_properties(&consumer_key, tenant_id)
            .await
    }

    pub async fn client_id_unique_across_tenants(&self) -> Result<bool> {
        self.store
            .client_ids_unique_across_tenants()
            .await
            .map_err(|e| RegistryError::store("Failed to inspect client id constraint", e))
    }

    /// Hybrid flow setting of an application after server defaults apply.
    pub fn effective_hybrid_flow(&self, app: &ClientApplication) -> EffectiveHybridFlow {
        app.oidc
            .hybrid_flow
            .resolve(&self.settings.hybrid_response_types)
    }

    /// Token lifetimes of an application after server defaults apply.
    pub fn effective_expiry(&self, app: &ClientApplication) -> TokenExpiry {
        app.expiry.effective(&self.settings.default_expiry)
    }

    async fn context_tenant_domain(&self, ctx: &TenantContext) -> Result<String> {
        match ctx
            .application_resident_organization_id
            .as_deref()
            .filter(|id| !id.is_empty())
        {
            Some(organization_id) => Ok(self.tenants.resolve_tenant_domain(organization_id).await?),
            None => Ok(ctx.tenant_domain.clone()),
        }
    }

    async fn owner_filter(&self, owner: &AppOwner, tenant_id: i64) -> Result<OwnerFilter> {
        let case_sensitive = self
            .users
            .is_username_case_sensitive(tenant_id, &owner.username)
            .await?;
        let user_domain = if owner.user_store_domain.trim().is_empty() {
            PRIMARY_USER_STORE_DOMAIN.to_string()
        } else {
            owner.user_store_domain.clone()
        };
        Ok(OwnerFilter {
            username: owner.username.clone(),
            user_domain,
            tenant_id,
            case_sensitive,
        })
    }

    async fn owner_update_allowed(
        &self,
        owner: Option<&AppOwner>,
        tenant_domain: &str,
    ) -> Result<bool> {
        let Some(owner) = owner else {
            return Ok(false);
        };
        if owner.username.is_empty() || owner.username == self.settings.system_username {
            return Ok(false);
        }
        let user_store_domain = if owner.user_store_domain.trim().is_empty() {
            PRIMARY_USER_STORE_DOMAIN
        } else {
            owner.user_store_domain.as_str()
        };
        Ok(self
            .users
            .user_exists(tenant_domain, user_store_domain, &owner.username)
            .await?)
    }

    async fn generate_unique_client_id(&self, tenant_id: i64) -> Result<String> {
        for _ in 0..CLIENT_ID_GENERATION_ATTEMPTS {
            let client_id = generate_client_id();
            if !self.is_duplicate_client_id(&client_id, tenant_id).await? {
                return Ok(client_id);
            }
        }
        Err(RegistryError::ConfigurationError(
            "Unable to generate a unique client id".to_string(),
        ))
    }

    /// Callback to persist. First-party callbacks get an origin placeholder;
    /// at registration only in root organizations.
    async fn template_callback(
        &self,
        app: &ClientApplication,
        tenant_id: i64,
        root_only: bool,
    ) -> Result<Option<String>> {
        let Some(callback) = app.callback_url.as_deref() else {
            return Ok(None);
        };
        let Some(first_party) = FirstPartyApp::detect(&app.application_name, &self.settings) else {
            return Ok(Some(callback.to_string()));
        };
        if root_only && !self.tenants.is_root_organization(tenant_id).await? {
            return Ok(Some(callback.to_string()));
        }
        Ok(Some(first_party.template_callback(callback)))
    }

    /// Callback to return. Placeholders are filled, and for root
    /// organizations a configured live callback wins over the stored one.
    async fn resolve_callback(
        &self,
        application_name: &str,
        stored: Option<String>,
        tenant_id: i64,
        tenant_domain: &str,
    ) -> Result<Option<String>> {
        let Some(first_party) = FirstPartyApp::detect(application_name, &self.settings) else {
            return Ok(stored);
        };
        let mut callback = stored.map(|c| first_party.resolve_callback(&c, &self.settings));
        if self.tenants.is_root_organization(tenant_id).await? {
            if let Some(live) = first_party.server_callback(&self.settings, tenant_domain) {
                callback = Some(live);
            }
        }
        Ok(callback)
    }

    fn to_record(
        &self,
        app: &ClientApplication,
        consumer_key: String,
        consumer_secret: Option<String>,
        tenant_id: i64,
        callback_url: Option<String>,
    ) -> Result<ClientRecord> {
        Ok(ClientRecord {
            id: app.id.unwrap_or_default(),
            consumer_key,
            consumer_secret,
            username: app.owner.username.clone(),
            user_domain: app.owner.user_store_domain.clone(),
            tenant_id,
            app_name: app.application_name.clone(),
            oauth_version: if app.oauth_version.is_empty() {
                DEFAULT_OAUTH_VERSION.to_string()
            } else {
                app.oauth_version.clone()
            },
            callback_url,
            grant_types: app.grant_types.to_stored(),
            pkce_mandatory: app.pkce.mandatory,
            pkce_support_plain: app.pkce.support_plain,
            user_access_token_expire_time: expiry_seconds(
                app.expiry.user_access_token,
                "user_access_token",
            )?,
            app_access_token_expire_time: expiry_seconds(
                app.expiry.application_access_token,
                "application_access_token",
            )?,
            refresh_token_expire_time: expiry_seconds(app.expiry.refresh_token, "refresh_token")?,
            id_token_expire_time: expiry_seconds(app.expiry.id_token, "id_token")?,
            app_state: if app.state.is_empty() {
                APP_STATE_ACTIVE.to_string()
            } else {
                app.state.clone()
            },
        })
    }

    async fn hydrate_all(&self, records: Vec<ClientRecord>) -> Result<Vec<ClientApplication>> {
        let mut apps = Vec::with_capacity(records.len());
        for record in records {
            apps.push(self.hydrate(record).await?);
        }
        Ok(apps)
    }

    async fn hydrate(&self, record: ClientRecord) -> Result<ClientApplication> {
        let tenant_domain = self.tenants.tenant_domain(record.tenant_id).await?;
        let client_id = self.secrets.unprocess_client_id(&record.consumer_key)?;
        let client_secret = match record.consumer_secret {
            Some(stored) if self.secrets.is_reversible() => {
                Some(self.secrets.unprocess_client_secret(&stored)?)
            }
            stored => stored,
        };

        let scope_validators = self
            .store
            .scope_validators(record.id)
            .await
            .map_err(|e| RegistryError::store("Failed to fetch scope validators", e))?;
        let access_token_claims = self
            .store
            .access_token_claims(record.id)
            .await
            .map_err(|e| RegistryError::store("Failed to fetch access token claims", e))?;
        let oidc = self
            .properties
            .load_properties(&record.consumer_key, record.tenant_id)
            .await?;
        let callback_url = self
            .resolve_callback(
                &record.app_name,
                record.callback_url,
                record.tenant_id,
                &tenant_domain,
            )
            .await?;

        let seconds = |value: i64| u64::try_from(value).unwrap_or_default();
        Ok(ClientApplication {
            id: Some(record.id),
            client_id,
            client_secret,
            owner: AppOwner::new(record.username, record.user_domain, tenant_domain),
            application_name: record.app_name,
            oauth_version: record.oauth_version,
            callback_url,
            grant_types: record
                .grant_types
                .as_deref()
                .map(GrantTypes::parse)
                .unwrap_or_default(),
            pkce: PkcePolicy {
                mandatory: record.pkce_mandatory,
                support_plain: record.pkce_support_plain,
            },
            expiry: TokenExpiry {
                user_access_token: seconds(record.user_access_token_expire_time),
                application_access_token: seconds(record.app_access_token_expire_time),
                refresh_token: seconds(record.refresh_token_expire_time),
                id_token: seconds(record.id_token_expire_time),
            },
            state: record.app_state,
            scope_validators,
            access_token_claims,
            oidc,
        })
    }
}

/// Expiry in the signed column form the store keeps.
fn expiry_seconds(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| {
        RegistryError::ConfigurationError(format!(
            "{} expiry of {} seconds cannot be stored",
            field, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::properties::HybridFlow;
    use crate::oauth::secret::{HashingSecretProcessor, PlainTextSecretProcessor};
    use crate::oauth::tenancy::StaticTenancy;
    use crate::storage::MemoryClientStore;

    const ROOT: &str = "carbon.super";
    const ROOT_ID: i64 = -1234;

    fn tenancy() -> Arc<StaticTenancy> {
        Arc::new(
            StaticTenancy::new()
                .with_tenant(ROOT, ROOT_ID)
                .with_tenant("acme.com", 1)
                .with_sub_organization("team.acme.com", 2, "org-team")
                .with_user(ROOT, "PRIMARY", "admin")
                .with_user(ROOT, "PRIMARY", "bob"),
        )
    }

    fn registry_with(
        store: Arc<MemoryClientStore>,
        secrets: Arc<dyn SecretProcessor>,
        settings: RegistrySettings,
    ) -> ClientRegistry {
        let tenancy = tenancy();
        ClientRegistry::new(store, secrets, tenancy.clone(), tenancy, settings)
    }

    fn registry() -> (ClientRegistry, Arc<MemoryClientStore>) {
        let store = Arc::new(MemoryClientStore::new());
        (
            registry_with(
                store.clone(),
                Arc::new(PlainTextSecretProcessor),
                RegistrySettings::default(),
            ),
            store,
        )
    }

    fn application(name: &str) -> ClientApplication {
        let mut app = ClientApplication::new(name, AppOwner::new("admin", "PRIMARY", ROOT));
        app.callback_url = Some("https://rp.example.com/callback".to_string());
        app.grant_types = GrantTypes::parse("authorization_code,refresh_token");
        app.scope_validators = ["Role based scope validator".to_string()].into();
        app.access_token_claims = ["email".to_string(), "groups".to_string()].into();
        app.oidc.audiences = ["api://orders".to_string()].into();
        app
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let (registry, _) = registry();
        let ctx = TenantContext::new(ROOT);

        let registered = registry.register(application("Orders"), &ctx).await.unwrap();
        assert!(registered.id.is_some());
        assert!(!registered.client_id.is_empty());
        assert!(registered.client_secret.is_some());

        let fetched = registry.lookup(&registered.client_id, ROOT_ID).await.unwrap();
        assert_eq!(fetched, registered);
    }

    #[tokio::test]
    async fn test_register_returns_stored_defaults() {
        let (registry, _) = registry();
        let ctx = TenantContext::new(ROOT);

        let mut app = application("Orders");
        app.state = String::new();
        app.oauth_version = String::new();
        let registered = registry.register(app, &ctx).await.unwrap();
        assert_eq!(registered.state, APP_STATE_ACTIVE);
        assert_eq!(registered.oauth_version, DEFAULT_OAUTH_VERSION);

        let fetched = registry.lookup(&registered.client_id, ROOT_ID).await.unwrap();
        assert_eq!(fetched, registered);
    }

    #[tokio::test]
    async fn test_register_without_audiences() {
        let settings = RegistrySettings {
            audience_enabled: false,
            ..Default::default()
        };
        let registry = registry_with(
            Arc::new(MemoryClientStore::new()),
            Arc::new(PlainTextSecretProcessor),
            settings,
        );

        let registered = registry
            .register(application("Orders"), &TenantContext::new(ROOT))
            .await
            .unwrap();
        assert!(registered.oidc.audiences.is_empty());

        let fetched = registry.lookup(&registered.client_id, ROOT_ID).await.unwrap();
        assert_eq!(fetched, registered);
    }

    #[tokio::test]
    async fn test_register_rejects_unstorable_expiry() {
        let (registry, store) = registry();

        let mut app = application("Orders");
        app.expiry.refresh_token = u64::MAX;
        let result = registry.register(app, &TenantContext::new(ROOT)).await;
        assert!(matches!(result, Err(RegistryError::ConfigurationError(_))));
        assert_eq!(store.client_count(ROOT_ID).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_application_name() {
        let (registry, _) = registry();
        let ctx = TenantContext::new(ROOT);

        registry.register(application("Orders"), &ctx).await.unwrap();

        let mut same_owner_other_case = application("Orders");
        same_owner_other_case.owner.username = "ADMIN".to_string();
        let result = registry.register(same_owner_other_case, &ctx).await;
        assert!(matches!(result, Err(RegistryError::DuplicateClient(_))));

        assert!(registry.register(application("Billing"), &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_client_id_from_store_constraint() {
        let (registry, store) = registry();
        let ctx = TenantContext::new(ROOT);

        let mut first = application("Orders");
        first.client_id = "fixed-client".to_string();
        registry.register(first, &ctx).await.unwrap();

        let mut second = application("Billing");
        second.client_id = "fixed-client".to_string();
        let result = registry.register(second, &ctx).await;
        assert!(matches!(result, Err(RegistryError::DuplicateClient(_))));
        assert_eq!(store.client_count(ROOT_ID).await, 1);
    }

    #[tokio::test]
    async fn test_lookup_missing_client() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.lookup("missing", ROOT_ID).await,
            Err(RegistryError::InvalidClient(_))
        ));
        assert!(matches!(
            registry
                .lookup_by_name("missing", &TenantContext::new(ROOT))
                .await,
            Err(RegistryError::AppNotFound(_))
        ));
        assert!(matches!(
            registry.lookup_all_for_consumer_key("missing").await,
            Err(RegistryError::InvalidClient(_))
        ));
        assert!(
            registry
                .lookup_all_for_user("nobody", ROOT_ID)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_hashed_secret_is_not_returned() {
        let store = Arc::new(MemoryClientStore::new());
        let registry = registry_with(
            store,
            Arc::new(HashingSecretProcessor),
            RegistrySettings::default(),
        );

        let mut app = application("Orders");
        app.client_secret = Some("raw-secret".to_string());
        let registered = registry
            .register(app, &TenantContext::new(ROOT))
            .await
            .unwrap();
        assert_eq!(registered.client_secret.as_deref(), Some("raw-secret"));

        let fetched = registry.lookup(&registered.client_id, ROOT_ID).await.unwrap();
        assert_eq!(
            fetched.client_secret,
            Some(crate::oauth::secret::sha256_hex("raw-secret"))
        );
    }

    #[tokio::test]
    async fn test_first_party_callback_templating() {
        let store = Arc::new(MemoryClientStore::new());
        let settings = RegistrySettings {
            console_origin: Some("https://console.example.com".to_string()),
            ..Default::default()
        };
        let registry = registry_with(store.clone(), Arc::new(PlainTextSecretProcessor), settings);

        let mut console = application("Console");
        console.callback_url = Some("https://localhost:9443/console".to_string());
        let registered = registry
            .register(console, &TenantContext::new(ROOT))
            .await
            .unwrap();

        let consumer_key = registered.client_id.clone();
        let stored = store.get_client(&consumer_key, ROOT_ID).await.unwrap().unwrap();
        assert_eq!(
            stored.callback_url.as_deref(),
            Some("{{console.origin}}/console")
        );

        let fetched = registry.lookup(&registered.client_id, ROOT_ID).await.unwrap();
        assert_eq!(
            fetched.callback_url.as_deref(),
            Some("https://console.example.com/console")
        );
    }

    #[tokio::test]
    async fn test_root_callback_from_server_config() {
        let store = Arc::new(MemoryClientStore::new());
        let settings = RegistrySettings {
            my_account_callback_url: Some("https://idp.example.com/t/{tenant_domain}/myaccount".to_string()),
            ..Default::default()
        };
        let registry = registry_with(store.clone(), Arc::new(PlainTextSecretProcessor), settings);

        let mut my_account = application("My Account");
        my_account.callback_url = Some("https://stale.example.com/myaccount".to_string());
        let registered = registry
            .register(my_account, &TenantContext::new(ROOT))
            .await
            .unwrap();

        let fetched = registry.lookup(&registered.client_id, ROOT_ID).await.unwrap();
        assert_eq!(
            fetched.callback_url.as_deref(),
            Some("https://idp.example.com/t/carbon.super/myaccount")
        );
    }

    #[tokio::test]
    async fn test_sub_organization_callback_not_templated_on_register() {
        let (registry, store) = registry();
        let ctx = TenantContext::new(ROOT).with_resident_organization("org-team");

        let mut console = application("Console");
        console.callback_url = Some("https://localhost:9443/console".to_string());
        let registered = registry.register(console, &ctx).await.unwrap();
        assert_eq!(registered.owner.tenant_domain, "team.acme.com");

        let stored = store
            .get_client(&registered.client_id, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.callback_url.as_deref(),
            Some("https://localhost:9443/console")
        );
    }

    #[tokio::test]
    async fn test_update_owner_guard() {
        let (registry, _) = registry();
        let ctx = TenantContext::new(ROOT);
        let registered = registry.register(application("Orders"), &ctx).await.unwrap();

        let mut unknown_owner = registered.clone();
        unknown_owner.owner.username = "mallory".to_string();
        unknown_owner.callback_url = Some("https://rp.example.com/v2/callback".to_string());
        let updated = registry.update(&unknown_owner, &ctx).await.unwrap();
        assert_eq!(updated.owner.username, "admin");
        assert_eq!(
            updated.callback_url.as_deref(),
            Some("https://rp.example.com/v2/callback")
        );

        let mut system_owner = registered.clone();
        system_owner.owner.username = "system.user".to_string();
        let updated = registry.update(&system_owner, &ctx).await.unwrap();
        assert_eq!(updated.owner.username, "admin");

        let mut valid_owner = registered.clone();
        valid_owner.owner.username = "bob".to_string();
        let updated = registry.update(&valid_owner, &ctx).await.unwrap();
        assert_eq!(updated.owner.username, "bob");
    }

    #[tokio::test]
    async fn test_update_replaces_validators_claims_and_properties() {
        let (registry, _) = registry();
        let ctx = TenantContext::new(ROOT);
        let registered = registry.register(application("Orders"), &ctx).await.unwrap();

        let mut changed = registered.clone();
        changed.scope_validators.clear();
        changed.access_token_claims = ["email".to_string()].into();
        changed.oidc.audiences = ["api://billing".to_string()].into();
        changed.oidc.hybrid_flow = HybridFlow {
            enabled: Some(false),
            response_type: None,
        };
        let updated = registry.update(&changed, &ctx).await.unwrap();

        assert!(updated.scope_validators.is_empty());
        assert_eq!(updated.access_token_claims.len(), 1);
        assert_eq!(
            registry
                .oidc_audiences(&registered.client_id, ROOT_ID)
                .await
                .unwrap()
                .into_iter()
                .collect::<Vec<_>>(),
            vec!["api://billing".to_string()]
        );
        assert_eq!(updated.oidc.hybrid_flow.enabled, Some(false));
    }

    #[tokio::test]
    async fn test_update_missing_client() {
        let (registry, _) = registry();
        let mut app = application("Orders");
        app.client_id = "missing".to_string();
        assert!(matches!(
            registry.update(&app, &TenantContext::new(ROOT)).await,
            Err(RegistryError::InvalidClient(_))
        ));
    }

    #[tokio::test]
    async fn test_state_and_rename() {
        let (registry, _) = registry();
        let registered = registry
            .register(application("Orders"), &TenantContext::new(ROOT))
            .await
            .unwrap();
        let client_id = registered.client_id.as_str();

        assert_eq!(
            registry.get_state(client_id, ROOT_ID).await.unwrap().as_deref(),
            Some(APP_STATE_ACTIVE)
        );
        registry
            .update_state(client_id, ROOT_ID, APP_STATE_INACTIVE)
            .await
            .unwrap();
        assert_eq!(
            registry.get_state(client_id, ROOT_ID).await.unwrap().as_deref(),
            Some(APP_STATE_INACTIVE)
        );
        assert!(matches!(
            registry.update_state("missing", ROOT_ID, APP_STATE_ACTIVE).await,
            Err(RegistryError::InvalidClient(_))
        ));

        registry
            .update_application_name("Orders v2", client_id, ROOT_ID)
            .await
            .unwrap();
        let fetched = registry
            .lookup_by_name("Orders v2", &TenantContext::new(ROOT))
            .await
            .unwrap();
        assert_eq!(fetched.client_id, client_id);

        registry
            .update_from_service_provider(
                &ServiceProvider {
                    name: "Orders v3".to_string(),
                    owner: Some(AppOwner::new("bob", "PRIMARY", ROOT)),
                    tenant_domain: ROOT.to_string(),
                },
                client_id,
            )
            .await
            .unwrap();
        let fetched = registry.lookup(client_id, ROOT_ID).await.unwrap();
        assert_eq!(fetched.application_name, "Orders v3");
        assert_eq!(fetched.owner.username, "bob");
    }

    #[tokio::test]
    async fn test_lookup_all_for_user() {
        let (registry, _) = registry();
        let ctx = TenantContext::new(ROOT);
        registry.register(application("Orders"), &ctx).await.unwrap();
        registry.register(application("Billing"), &ctx).await.unwrap();

        let apps = registry
            .lookup_all_for_user("PRIMARY/Admin", ROOT_ID)
            .await
            .unwrap();
        assert_eq!(apps.len(), 2);

        let unknown_tenant = registry.lookup_all_for_user("admin", 4242).await.unwrap();
        assert!(unknown_tenant.is_empty());
    }

    #[tokio::test]
    async fn test_remove_client() {
        let (registry, store) = registry();
        let registered = registry
            .register(application("Orders"), &TenantContext::new(ROOT))
            .await
            .unwrap();
        registry
            .link_service_provider(&registered.client_id, ROOT_ID, "Orders")
            .await
            .unwrap();

        registry.remove(&registered.client_id, ROOT_ID).await.unwrap();
        assert!(matches!(
            registry.lookup(&registered.client_id, ROOT_ID).await,
            Err(RegistryError::InvalidClient(_))
        ));
        assert_eq!(store.property_count(ROOT_ID).await, 0);
        assert!(
            registry
                .service_provider_links(&registered.client_id, ROOT_ID)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(registry.remove("missing", ROOT_ID).await.is_ok());
    }

    #[tokio::test]
    async fn test_effective_settings() {
        let store = Arc::new(MemoryClientStore::new());
        let settings = RegistrySettings {
            hybrid_response_types: vec!["code id_token".to_string()],
            ..Default::default()
        };
        let registry = registry_with(store, Arc::new(PlainTextSecretProcessor), settings);

        let app = application("Orders");
        let hybrid = registry.effective_hybrid_flow(&app);
        assert!(hybrid.enabled);
        assert_eq!(hybrid.response_type.as_deref(), Some("code id_token"));
        assert_eq!(registry.effective_expiry(&app).refresh_token, 86400);
    }
}
