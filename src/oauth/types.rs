//! Client application and token types shared by the registry and validator.

use crate::oauth::properties::OidcProperties;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// OAuth version recorded for newly registered applications
pub const DEFAULT_OAUTH_VERSION: &str = "OAuth-2.0";

/// Lifecycle state of an application that may obtain tokens
pub const APP_STATE_ACTIVE: &str = "ACTIVE";

/// Lifecycle state of a disabled application
pub const APP_STATE_INACTIVE: &str = "INACTIVE";

/// User store domain assumed when a username carries no domain prefix
pub const PRIMARY_USER_STORE_DOMAIN: &str = "PRIMARY";

/// Scope required by every OIDC protected resource
pub const OPENID_SCOPE: &str = "openid";

/// Owner of a client application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppOwner {
    pub username: String,
    pub user_store_domain: String,
    pub tenant_domain: String,
}

impl AppOwner {
    pub fn new(
        username: impl Into<String>,
        user_store_domain: impl Into<String>,
        tenant_domain: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            user_store_domain: user_store_domain.into(),
            tenant_domain: tenant_domain.into(),
        }
    }

    /// Split a `DOMAIN/username` string into an owner.
    ///
    /// Names without a domain prefix belong to the primary user store.
    pub fn from_qualified(qualified: &str, tenant_domain: &str) -> Self {
        match qualified.split_once('/') {
            Some((domain, username)) if !domain.is_empty() => {
                Self::new(username, domain.to_uppercase(), tenant_domain)
            }
            _ => Self::new(qualified, PRIMARY_USER_STORE_DOMAIN, tenant_domain),
        }
    }

    /// Username prefixed with its user store domain
    pub fn qualified_username(&self) -> String {
        format!("{}/{}", self.user_store_domain, self.username)
    }
}

/// PKCE requirements for the authorization code flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkcePolicy {
    pub mandatory: bool,
    pub support_plain: bool,
}

/// Token lifetimes in seconds, where zero means the server default applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenExpiry {
    pub user_access_token: u64,
    pub application_access_token: u64,
    pub refresh_token: u64,
    pub id_token: u64,
}

impl TokenExpiry {
    /// Replace every zero lifetime with the matching server default.
    pub fn effective(&self, defaults: &TokenExpiry) -> TokenExpiry {
        let pick = |value: u64, default: u64| if value == 0 { default } else { value };
        TokenExpiry {
            user_access_token: pick(self.user_access_token, defaults.user_access_token),
            application_access_token: pick(
                self.application_access_token,
                defaults.application_access_token,
            ),
            refresh_token: pick(self.refresh_token, defaults.refresh_token),
            id_token: pick(self.id_token, defaults.id_token),
        }
    }
}

/// Ordered, duplicate-free list of grant type names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantTypes(Vec<String>);

impl GrantTypes {
    /// Parse a stored grant type list. Commas and whitespace both separate entries.
    pub fn parse(value: &str) -> Self {
        value
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Comma-joined form written to the store
    pub fn to_stored(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.join(","))
        }
    }

    pub fn contains(&self, grant_type: &str) -> bool {
        self.0.iter().any(|g| g == grant_type)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for GrantTypes {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut grant_types: Vec<String> = Vec::new();
        for grant_type in iter {
            let grant_type = grant_type.into();
            if !grant_types.contains(&grant_type) {
                grant_types.push(grant_type);
            }
        }
        Self(grant_types)
    }
}

impl fmt::Display for GrantTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// A confidential OAuth2 client application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientApplication {
    /// Store-generated identifier, absent until registered
    pub id: Option<i64>,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub owner: AppOwner,
    pub application_name: String,
    pub oauth_version: String,
    pub callback_url: Option<String>,
    pub grant_types: GrantTypes,
    pub pkce: PkcePolicy,
    pub expiry: TokenExpiry,
    pub state: String,
    pub scope_validators: BTreeSet<String>,
    pub access_token_claims: BTreeSet<String>,
    pub oidc: OidcProperties,
}

impl ClientApplication {
    /// Create an unregistered application with default settings.
    ///
    /// An empty client id asks the registry to generate one.
    pub fn new(application_name: impl Into<String>, owner: AppOwner) -> Self {
        Self {
            id: None,
            client_id: String::new(),
            client_secret: None,
            owner,
            application_name: application_name.into(),
            oauth_version: DEFAULT_OAUTH_VERSION.to_string(),
            callback_url: None,
            grant_types: GrantTypes::default(),
            pkce: PkcePolicy::default(),
            expiry: TokenExpiry::default(),
            state: APP_STATE_ACTIVE.to_string(),
            scope_validators: BTreeSet::new(),
            access_token_claims: BTreeSet::new(),
            oidc: OidcProperties::default(),
        }
    }
}

/// Tenant context of a registry call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_domain: String,
    /// Organization the application resides in, when it differs from the
    /// tenant the request was made in
    pub application_resident_organization_id: Option<String>,
}

impl TenantContext {
    pub fn new(tenant_domain: impl Into<String>) -> Self {
        Self {
            tenant_domain: tenant_domain.into(),
            application_resident_organization_id: None,
        }
    }

    pub fn with_resident_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.application_resident_organization_id = Some(organization_id.into());
        self
    }
}

/// Service provider view of an application, used for rename and owner transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProvider {
    pub name: String,
    pub owner: Option<AppOwner>,
    pub tenant_domain: String,
}

/// The user a token was issued to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub username: String,
    #[serde(default = "primary_user_store_domain")]
    pub user_store_domain: String,
    pub tenant_domain: String,
}

fn primary_user_store_domain() -> String {
    PRIMARY_USER_STORE_DOMAIN.to_string()
}

/// Binding between a token and the channel it was issued over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBinding {
    pub binding_type: String,
    pub binding_reference: String,
}

impl TokenBinding {
    /// Derive the binding reference stored with a token from the raw channel value.
    pub fn reference_for(presented: &str) -> String {
        crate::oauth::secret::sha256_hex(presented)
    }

    /// Whether a value presented over the transport matches this binding.
    pub fn matches(&self, presented: &str) -> bool {
        self.binding_reference == Self::reference_for(presented)
    }
}

/// Generate a secure random secret
pub fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.r#gen();
    base64::prelude::BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a client ID
pub fn generate_client_id() -> String {
    Uuid::new_v4().to_string()
}
