//! Environment-based configuration for the registry, validator and admin tooling.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::oauth::secret::{HashingSecretProcessor, PlainTextSecretProcessor, SecretProcessor};
use crate::oauth::tenancy::StaticTenancy;
use crate::oauth::types::TokenExpiry;

/// Placeholder in logout page URLs replaced with the server origin
pub const ORIGIN_PLACEHOLDER: &str = "{origin}";

/// HTTP client timeout configuration
#[derive(Clone, Debug)]
pub struct HttpClientTimeout(Duration);

/// Lifetime applied to a token type when a client leaves it at zero
#[derive(Clone, Copy, Debug)]
pub struct DefaultTokenExpiration(u64);

/// On/off setting parsed from true/false/1/0/yes/no/on/off
#[derive(Clone, Copy, Debug)]
pub struct Toggle(bool);

/// Server-wide hybrid flow response types, comma separated
#[derive(Clone, Debug, Default)]
pub struct HybridResponseTypes(Vec<String>);

/// Origin URL such as `https://idp.example.com`
#[derive(Clone, Debug)]
pub struct ServerOrigin(String);

/// Tenants and organizations known to this process
#[derive(Clone, Debug)]
pub struct TenantMappings(StaticTenancy);

/// Transform applied to stored client credentials
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretProcessorKind {
    PlainText,
    Hashing,
}

impl SecretProcessorKind {
    pub fn build(&self) -> Arc<dyn SecretProcessor> {
        match self {
            SecretProcessorKind::PlainText => Arc::new(PlainTextSecretProcessor),
            SecretProcessorKind::Hashing => Arc::new(HashingSecretProcessor),
        }
    }
}

/// Settings consumed by the client registry
#[derive(Clone, Debug)]
pub struct RegistrySettings {
    /// Persist and read the multi-valued audience property
    pub audience_enabled: bool,
    /// Response types used when a client never chose a hybrid flow setting
    pub hybrid_response_types: Vec<String>,
    /// Reserved account that never becomes an application owner
    pub system_username: String,
    pub server_origin: String,
    pub console_app_name: String,
    pub my_account_app_name: String,
    /// Origin substituted into console callbacks, defaults to the server origin
    pub console_origin: Option<String>,
    /// Origin substituted into my-account callbacks, defaults to the server origin
    pub my_account_origin: Option<String>,
    /// Live console callback for root organizations. `{tenant_domain}` is substituted.
    pub console_callback_url: Option<String>,
    /// Live my-account callback for root organizations. `{tenant_domain}` is substituted.
    pub my_account_callback_url: Option<String>,
    pub default_expiry: TokenExpiry,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            audience_enabled: true,
            hybrid_response_types: Vec::new(),
            system_username: "system.user".to_string(),
            server_origin: "https://localhost:9443".to_string(),
            console_app_name: "Console".to_string(),
            my_account_app_name: "My Account".to_string(),
            console_origin: None,
            my_account_origin: None,
            console_callback_url: None,
            my_account_callback_url: None,
            default_expiry: TokenExpiry {
                user_access_token: 3600,
                application_access_token: 3600,
                refresh_token: 86400,
                id_token: 3600,
            },
        }
    }
}

/// Remote token introspection endpoint and its client credentials
#[derive(Clone, Debug)]
pub struct IntrospectionSettings {
    pub endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    /// Tenant of authorized users whose introspection response names none
    pub default_tenant_domain: String,
}

/// OIDC session management page locations
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OidcSessionConfig {
    pub logout_consent_page_url: Option<String>,
    pub logout_page_url: Option<String>,
    pub logout_consent_page_url_v2: Option<String>,
    pub logout_page_url_v2: Option<String>,
    pub handle_already_logged_out_sessions_gracefully: bool,
}

impl OidcSessionConfig {
    /// Replace the origin placeholder in every page URL.
    pub fn with_origin(mut self, origin: &str) -> Self {
        let fill = |url: Option<String>| url.map(|u| u.replace(ORIGIN_PLACEHOLDER, origin));
        self.logout_consent_page_url = fill(self.logout_consent_page_url);
        self.logout_page_url = fill(self.logout_page_url);
        self.logout_consent_page_url_v2 = fill(self.logout_consent_page_url_v2);
        self.logout_page_url_v2 = fill(self.logout_page_url_v2);
        self
    }

    /// Logout consent page, preferring the v2 page when asked for and configured.
    pub fn logout_consent_page(&self, v2: bool) -> Option<&str> {
        if v2 && self.logout_consent_page_url_v2.is_some() {
            return self.logout_consent_page_url_v2.as_deref();
        }
        self.logout_consent_page_url.as_deref()
    }

    /// Logout page, preferring the v2 page when asked for and configured.
    pub fn logout_page(&self, v2: bool) -> Option<&str> {
        if v2 && self.logout_page_url_v2.is_some() {
            return self.logout_page_url_v2.as_deref();
        }
        self.logout_page_url.as_deref()
    }
}

/// Main application configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub version: String,
    pub storage_backend: String,
    pub database_url: Option<String>,
    pub http_client_timeout: HttpClientTimeout,
    pub secret_processor: SecretProcessorKind,
    pub tenants: TenantMappings,
    pub app_resident_tenant_domain: Option<String>,
    pub token_binding_header: String,
    pub introspection: Option<IntrospectionSettings>,
    pub registry: RegistrySettings,
    pub oidc_session: OidcSessionConfig,
}

impl Config {
    /// Create a new configuration from environment variables
    pub fn new() -> Result<Self> {
        let storage_backend = default_env("STORAGE_BACKEND", "sqlite");
        let database_url = optional_env("DATABASE_URL");
        let http_client_timeout: HttpClientTimeout =
            default_env("HTTP_CLIENT_TIMEOUT", "10s").try_into()?;
        let secret_processor: SecretProcessorKind =
            default_env("SECRET_PROCESSOR", "plaintext").try_into()?;
        let tenants: TenantMappings = default_env("TENANTS", "carbon.super=-1234").try_into()?;
        let app_resident_tenant_domain =
            optional_env("APP_RESIDENT_TENANT_DOMAIN").filter(|s| !s.is_empty());
        let token_binding_header = default_env("TOKEN_BINDING_HEADER", "x-token-binding");

        let server_origin: ServerOrigin =
            default_env("SERVER_ORIGIN", "https://localhost:9443").try_into()?;
        let audience_enabled: Toggle = default_env("OIDC_AUDIENCE_ENABLED", "true").try_into()?;
        let hybrid_response_types: HybridResponseTypes =
            optional_env("HYBRID_RESPONSE_TYPES").try_into()?;
        let user_access_token: DefaultTokenExpiration =
            default_env("DEFAULT_USER_ACCESS_TOKEN_EXPIRATION", "1h").try_into()?;
        let application_access_token: DefaultTokenExpiration =
            default_env("DEFAULT_APPLICATION_ACCESS_TOKEN_EXPIRATION", "1h").try_into()?;
        let refresh_token: DefaultTokenExpiration =
            default_env("DEFAULT_REFRESH_TOKEN_EXPIRATION", "1d").try_into()?;
        let id_token: DefaultTokenExpiration =
            default_env("DEFAULT_ID_TOKEN_EXPIRATION", "1h").try_into()?;

        let registry = RegistrySettings {
            audience_enabled: *audience_enabled.as_ref(),
            hybrid_response_types: hybrid_response_types.as_ref().clone(),
            system_username: default_env("SYSTEM_USERNAME", "system.user"),
            server_origin: server_origin.as_ref().clone(),
            console_app_name: default_env("CONSOLE_APP_NAME", "Console"),
            my_account_app_name: default_env("MY_ACCOUNT_APP_NAME", "My Account"),
            console_origin: non_blank_env("CONSOLE_ORIGIN"),
            my_account_origin: non_blank_env("MY_ACCOUNT_ORIGIN"),
            console_callback_url: non_blank_env("CONSOLE_CALLBACK_URL"),
            my_account_callback_url: non_blank_env("MY_ACCOUNT_CALLBACK_URL"),
            default_expiry: TokenExpiry {
                user_access_token: *user_access_token.as_ref(),
                application_access_token: *application_access_token.as_ref(),
                refresh_token: *refresh_token.as_ref(),
                id_token: *id_token.as_ref(),
            },
        };

        let introspection = match optional_env("INTROSPECTION_ENDPOINT").filter(|s| !s.is_empty())
        {
            Some(endpoint) => {
                url::Url::parse(&endpoint)
                    .map_err(|e| ConfigError::InvalidUrl(endpoint.clone(), e.to_string()))?;
                Some(IntrospectionSettings {
                    endpoint,
                    client_id: require_env("INTROSPECTION_CLIENT_ID")?,
                    client_secret: require_env("INTROSPECTION_CLIENT_SECRET")?,
                    default_tenant_domain: default_env(
                        "INTROSPECTION_DEFAULT_TENANT_DOMAIN",
                        "carbon.super",
                    ),
                })
            }
            None => None,
        };

        let graceful: Toggle = default_env(
            "OIDC_HANDLE_ALREADY_LOGGED_OUT_SESSIONS_GRACEFULLY",
            "false",
        )
        .try_into()?;
        let oidc_session = OidcSessionConfig {
            logout_consent_page_url: non_blank_env("OIDC_LOGOUT_CONSENT_PAGE_URL"),
            logout_page_url: non_blank_env("OIDC_LOGOUT_PAGE_URL"),
            logout_consent_page_url_v2: non_blank_env("OIDC_LOGOUT_CONSENT_PAGE_URL_V2"),
            logout_page_url_v2: non_blank_env("OIDC_LOGOUT_PAGE_URL_V2"),
            handle_already_logged_out_sessions_gracefully: *graceful.as_ref(),
        }
        .with_origin(server_origin.as_ref());

        Ok(Self {
            version: version()?,
            storage_backend,
            database_url,
            http_client_timeout,
            secret_processor,
            tenants,
            app_resident_tenant_domain,
            token_binding_header,
            introspection,
            registry,
            oidc_session,
        })
    }
}

/// Get application version from build environment
pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(ConfigError::VersionNotSet.into())
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ConfigError::EnvVarRequired(name.to_string()).into())
}

pub(crate) fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn non_blank_env(name: &str) -> Option<String> {
    optional_env(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_env(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default_value.to_string())
}

impl TryFrom<String> for HttpClientTimeout {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Ok(Self(Duration::from_secs(10)));
        }
        duration_str::parse(&value)
            .map(Self)
            .map_err(|e| ConfigError::DurationParsingFailed(value, e.to_string()))
    }
}

impl AsRef<Duration> for HttpClientTimeout {
    fn as_ref(&self) -> &Duration {
        &self.0
    }
}

impl TryFrom<String> for DefaultTokenExpiration {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let duration = duration_str::parse(&value)
            .map_err(|e| ConfigError::DurationParsingFailed(value, e.to_string()))?;
        Ok(Self(duration.as_secs()))
    }
}

impl AsRef<u64> for DefaultTokenExpiration {
    fn as_ref(&self) -> &u64 {
        &self.0
    }
}

impl TryFrom<String> for Toggle {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Self(true)),
            "false" | "0" | "no" | "off" => Ok(Self(false)),
            _ => Err(ConfigError::BoolParsingFailed(value).into()),
        }
    }
}

impl AsRef<bool> for Toggle {
    fn as_ref(&self) -> &bool {
        &self.0
    }
}

impl TryFrom<Option<String>> for HybridResponseTypes {
    type Error = anyhow::Error;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        let value = value.unwrap_or_default();
        Ok(Self(
            value
                .split(',')
                .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
                .filter(|s| !s.is_empty())
                .collect(),
        ))
    }
}

impl TryFrom<String> for HybridResponseTypes {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(Some(value))
    }
}

impl AsRef<Vec<String>> for HybridResponseTypes {
    fn as_ref(&self) -> &Vec<String> {
        &self.0
    }
}

impl TryFrom<String> for ServerOrigin {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let url = url::Url::parse(&value)
            .map_err(|e| ConfigError::InvalidUrl(value.clone(), e.to_string()))?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(ConfigError::InvalidUrl(value, "URL has no origin".to_string()).into());
        }
        Ok(Self(origin.ascii_serialization()))
    }
}

impl AsRef<String> for ServerOrigin {
    fn as_ref(&self) -> &String {
        &self.0
    }
}

impl TryFrom<String> for SecretProcessorKind {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "plaintext" | "" => Ok(SecretProcessorKind::PlainText),
            "hashing" | "sha256" => Ok(SecretProcessorKind::Hashing),
            _ => Err(ConfigError::UnknownSecretProcessor(value).into()),
        }
    }
}

impl TryFrom<String> for TenantMappings {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(StaticTenancy::parse(&value)?))
    }
}

impl AsRef<StaticTenancy> for TenantMappings {
    fn as_ref(&self) -> &StaticTenancy {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_parsing() {
        for value in ["true", "1", "YES", "on"] {
            assert!(*Toggle::try_from(value.to_string()).unwrap().as_ref());
        }
        for value in ["false", "0", "no", "Off"] {
            assert!(!*Toggle::try_from(value.to_string()).unwrap().as_ref());
        }
        assert!(Toggle::try_from("maybe".to_string()).is_err());
    }

    #[test]
    fn test_duration_settings() {
        let timeout = HttpClientTimeout::try_from("5s".to_string()).unwrap();
        assert_eq!(*timeout.as_ref(), Duration::from_secs(5));
        let timeout = HttpClientTimeout::try_from(String::new()).unwrap();
        assert_eq!(*timeout.as_ref(), Duration::from_secs(10));
        assert!(HttpClientTimeout::try_from("soon".to_string()).is_err());

        let expiration = DefaultTokenExpiration::try_from("1h".to_string()).unwrap();
        assert_eq!(*expiration.as_ref(), 3600);
    }

    #[test]
    fn test_hybrid_response_types() {
        let types = HybridResponseTypes::try_from(Some(
            "code id_token, code  token,,".to_string(),
        ))
        .unwrap();
        assert_eq!(
            types.as_ref(),
            &vec!["code id_token".to_string(), "code token".to_string()]
        );
        let types = HybridResponseTypes::try_from(None).unwrap();
        assert!(types.as_ref().is_empty());
    }

    #[test]
    fn test_server_origin() {
        let origin = ServerOrigin::try_from("https://idp.example.com:9443/console".to_string())
            .unwrap();
        assert_eq!(origin.as_ref(), "https://idp.example.com:9443");
        assert!(ServerOrigin::try_from("not a url".to_string()).is_err());
    }

    #[test]
    fn test_secret_processor_kind() {
        let kind = SecretProcessorKind::try_from("Hashing".to_string()).unwrap();
        assert_eq!(kind, SecretProcessorKind::Hashing);
        assert!(!kind.build().is_reversible());
        assert!(SecretProcessorKind::try_from("rot13".to_string()).is_err());
    }

    #[test]
    fn test_oidc_session_config() {
        let config = OidcSessionConfig {
            logout_consent_page_url: Some("{origin}/authenticationendpoint/oauth2_logout_consent.do".to_string()),
            logout_page_url: Some("{origin}/authenticationendpoint/oauth2_logout.do".to_string()),
            logout_consent_page_url_v2: None,
            logout_page_url_v2: Some("{origin}/logout/v2".to_string()),
            handle_already_logged_out_sessions_gracefully: true,
        }
        .with_origin("https://idp.example.com");

        assert_eq!(
            config.logout_consent_page(true),
            Some("https://idp.example.com/authenticationendpoint/oauth2_logout_consent.do")
        );
        assert_eq!(config.logout_page(true), Some("https://idp.example.com/logout/v2"));
        assert_eq!(
            config.logout_page(false),
            Some("https://idp.example.com/authenticationendpoint/oauth2_logout.do")
        );
        assert!(config.handle_already_logged_out_sessions_gracefully);
    }
}
