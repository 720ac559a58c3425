//! Tenant, organization and user directory collaborators.

use crate::errors::{ConfigError, TenantError};
use async_trait::async_trait;
use std::collections::HashSet;

pub type Result<T> = std::result::Result<T, TenantError>;

/// Resolves tenants and organizations
#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// Tenant domain an organization lives in
    async fn resolve_tenant_domain(&self, organization_id: &str) -> Result<String>;

    async fn tenant_id(&self, tenant_domain: &str) -> Result<i64>;

    async fn tenant_domain(&self, tenant_id: i64) -> Result<String>;

    /// Whether the tenant is a top-level organization rather than a sub-organization
    async fn is_root_organization(&self, tenant_id: i64) -> Result<bool>;
}

/// Answers questions about users
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(
        &self,
        tenant_domain: &str,
        user_store_domain: &str,
        username: &str,
    ) -> Result<bool>;

    /// Whether usernames of the user's store compare case-sensitively
    async fn is_username_case_sensitive(&self, tenant_id: i64, username: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct TenantEntry {
    domain: String,
    id: i64,
    organization_id: Option<String>,
    root: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UserEntry {
    tenant_domain: String,
    user_store_domain: String,
    username: String,
}

/// In-process tenant table and user directory
#[derive(Debug, Clone, Default)]
pub struct StaticTenancy {
    tenants: Vec<TenantEntry>,
    users: HashSet<UserEntry>,
    case_sensitive_tenants: HashSet<i64>,
}

impl StaticTenancy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a top-level tenant.
    pub fn with_tenant(mut self, domain: impl Into<String>, id: i64) -> Self {
        self.tenants.push(TenantEntry {
            domain: domain.into(),
            id,
            organization_id: None,
            root: true,
        });
        self
    }

    /// Add a sub-organization, resolvable through its organization id.
    pub fn with_sub_organization(
        mut self,
        domain: impl Into<String>,
        id: i64,
        organization_id: impl Into<String>,
    ) -> Self {
        self.tenants.push(TenantEntry {
            domain: domain.into(),
            id,
            organization_id: Some(organization_id.into()),
            root: false,
        });
        self
    }

    pub fn with_user(
        mut self,
        tenant_domain: impl Into<String>,
        user_store_domain: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        self.users.insert(UserEntry {
            tenant_domain: tenant_domain.into(),
            user_store_domain: user_store_domain.into().to_uppercase(),
            username: username.into(),
        });
        self
    }

    pub fn with_case_sensitive_usernames(mut self, tenant_id: i64) -> Self {
        self.case_sensitive_tenants.insert(tenant_id);
        self
    }

    /// Parse a `domain=id[:organization]` list separated by commas.
    ///
    /// Entries carrying an organization id are sub-organizations.
    pub fn parse(value: &str) -> std::result::Result<Self, ConfigError> {
        let mut tenancy = Self::new();
        for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (domain, rest) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidTenantMapping(entry.to_string()))?;
            let (id, organization) = match rest.split_once(':') {
                Some((id, organization)) => (id, Some(organization)),
                None => (rest, None),
            };
            let id = id
                .trim()
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidTenantMapping(entry.to_string()))?;
            tenancy = match organization {
                Some(organization) if !organization.trim().is_empty() => {
                    tenancy.with_sub_organization(domain.trim(), id, organization.trim())
                }
                _ => tenancy.with_tenant(domain.trim(), id),
            };
        }
        Ok(tenancy)
    }

    fn entry_by_id(&self, tenant_id: i64) -> Result<&TenantEntry> {
        self.tenants
            .iter()
            .find(|t| t.id == tenant_id)
            .ok_or(TenantError::UnknownTenantId(tenant_id))
    }
}

#[async_trait]
impl TenantResolver for StaticTenancy {
    async fn resolve_tenant_domain(&self, organization_id: &str) -> Result<String> {
        self.tenants
            .iter()
            .find(|t| t.organization_id.as_deref() == Some(organization_id))
            .map(|t| t.domain.clone())
            .ok_or_else(|| TenantError::UnknownOrganization(organization_id.to_string()))
    }

    async fn tenant_id(&self, tenant_domain: &str) -> Result<i64> {
        self.tenants
            .iter()
            .find(|t| t.domain.eq_ignore_ascii_case(tenant_domain))
            .map(|t| t.id)
            .ok_or_else(|| TenantError::UnknownTenantDomain(tenant_domain.to_string()))
    }

    async fn tenant_domain(&self, tenant_id: i64) -> Result<String> {
        self.entry_by_id(tenant_id).map(|t| t.domain.clone())
    }

    async fn is_root_organization(&self, tenant_id: i64) -> Result<bool> {
        self.entry_by_id(tenant_id).map(|t| t.root)
    }
}

#[async_trait]
impl UserDirectory for StaticTenancy {
    async fn user_exists(
        &self,
        tenant_domain: &str,
        user_store_domain: &str,
        username: &str,
    ) -> Result<bool> {
        let tenant_id = self.tenant_id(tenant_domain).await?;
        let case_sensitive = self.case_sensitive_tenants.contains(&tenant_id);
        Ok(self.users.iter().any(|user| {
            user.tenant_domain.eq_ignore_ascii_case(tenant_domain)
                && user.user_store_domain.eq_ignore_ascii_case(user_store_domain)
                && if case_sensitive {
                    user.username == username
                } else {
                    user.username.eq_ignore_ascii_case(username)
                }
        }))
    }

    async fn is_username_case_sensitive(&self, tenant_id: i64, _username: &str) -> Result<bool> {
        Ok(self.case_sensitive_tenants.contains(&tenant_id))
    }
}
