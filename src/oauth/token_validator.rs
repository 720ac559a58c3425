//! OIDC access token validation.
//!
//! A token is accepted when introspection reports it active, it carries the
//! `openid` scope, it names both an authorized user and a registered client,
//! and it satisfies the client's token binding policy when transport data is
//! supplied.

use crate::errors::ValidationError;
use crate::oauth::clients::ClientRegistry;
use crate::oauth::introspection::TokenIntrospector;
use crate::oauth::types::{AuthorizedUser, OPENID_SCOPE, TokenBinding};
use http::HeaderMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Request data outside the token itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportContext {
    /// Raw token binding value presented with the request
    pub presented_binding: Option<String>,
}

impl TransportContext {
    pub fn new(presented_binding: Option<String>) -> Self {
        Self { presented_binding }
    }

    /// Read the presented binding from a request header.
    pub fn from_headers(headers: &HeaderMap, header_name: &str) -> Self {
        let presented_binding = headers
            .get(header_name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Self { presented_binding }
    }
}

/// Echo of the validated token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContextToken {
    pub token_type: String,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub scopes: BTreeSet<String>,
    pub authorized_user: AuthorizedUser,
    pub token_binding: Option<TokenBinding>,
    pub consumer_key: String,
    pub authorization_context_token: AuthorizationContextToken,
}

pub struct TokenValidator {
    introspector: Arc<dyn TokenIntrospector>,
    registry: Arc<ClientRegistry>,
    app_resident_tenant_domain: Option<String>,
}

impl TokenValidator {
    pub fn new(introspector: Arc<dyn TokenIntrospector>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            introspector,
            registry,
            app_resident_tenant_domain: None,
        }
    }

    /// Look up owning clients in this tenant instead of the user's tenant.
    pub fn with_app_resident_tenant(mut self, tenant_domain: Option<String>) -> Self {
        self.app_resident_tenant_domain = tenant_domain.filter(|d| !d.is_empty());
        self
    }

    /// Validate an access token presented to an OIDC protected resource.
    ///
    /// With a transport context and a client that enables binding validation,
    /// the token must carry a binding matching the presented value. A token
    /// issued without a binding is rejected in that case. Without a transport
    /// context, or for clients that do not validate bindings, bindings are
    /// not checked.
    pub async fn validate(
        &self,
        token: &str,
        transport: Option<&TransportContext>,
    ) -> Result<ValidationResult, ValidationError> {
        let introspected = self.introspector.introspect(token).await?;
        if !introspected.active {
            tracing::debug!("inactive access token presented");
            return Err(ValidationError::InvalidToken(
                "Access token validation failed".to_string(),
            ));
        }

        if !introspected.scopes.contains(OPENID_SCOPE) {
            return Err(ValidationError::InsufficientScope(format!(
                "Access token does not have the {} scope",
                OPENID_SCOPE
            )));
        }

        let authorized_user = introspected.authorized_user.ok_or_else(|| {
            ValidationError::InvalidToken("Access token has no authorized user".to_string())
        })?;
        let consumer_key = introspected.consumer_key.ok_or_else(|| {
            ValidationError::InvalidToken("Access token has no client".to_string())
        })?;

        let tenant_domain = self
            .app_resident_tenant_domain
            .as_deref()
            .unwrap_or(&authorized_user.tenant_domain);
        let tenant_id = self.registry.tenant_id(tenant_domain).await?;
        let client = self.registry.lookup(&consumer_key, tenant_id).await?;

        if let Some(transport) = transport {
            if client.oidc.token_binding_validation {
                let bound = match (
                    introspected.token_binding.as_ref(),
                    transport.presented_binding.as_deref(),
                ) {
                    (Some(binding), Some(presented)) => binding.matches(presented),
                    _ => false,
                };
                if !bound {
                    tracing::info!(
                        client_id = %consumer_key,
                        "token binding validation failed"
                    );
                    return Err(ValidationError::InvalidRequest(
                        "Valid token binding value not present in the request.".to_string(),
                    ));
                }
            }
        }

        Ok(ValidationResult {
            valid: true,
            scopes: introspected.scopes,
            authorized_user,
            token_binding: introspected.token_binding,
            consumer_key,
            authorization_context_token: AuthorizationContextToken {
                token_type: "bearer".to_string(),
                identifier: introspected.identifier,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistrySettings;
    use crate::errors::RegistryError;
    use crate::oauth::introspection::{IntrospectedToken, MemoryTokenIntrospector};
    use crate::oauth::secret::PlainTextSecretProcessor;
    use crate::oauth::tenancy::StaticTenancy;
    use crate::oauth::types::{AppOwner, ClientApplication, TenantContext};
    use crate::storage::MemoryClientStore;

    struct Fixture {
        introspector: Arc<MemoryTokenIntrospector>,
        validator: TokenValidator,
        client_id: String,
    }

    fn user() -> AuthorizedUser {
        AuthorizedUser {
            username: "alice".to_string(),
            user_store_domain: "PRIMARY".to_string(),
            tenant_domain: "acme.com".to_string(),
        }
    }

    async fn fixture(binding_validation: bool) -> Fixture {
        let tenancy = Arc::new(StaticTenancy::new().with_tenant("acme.com", 1));
        let registry = Arc::new(ClientRegistry::new(
            Arc::new(MemoryClientStore::new()),
            Arc::new(PlainTextSecretProcessor),
            tenancy.clone(),
            tenancy,
            RegistrySettings::default(),
        ));

        let mut app = ClientApplication::new("Orders", AppOwner::new("admin", "PRIMARY", "acme.com"));
        if binding_validation {
            app.oidc.token_binding_type = Some("certificate".to_string());
            app.oidc.token_binding_validation = true;
        }
        let registered = registry
            .register(app, &TenantContext::new("acme.com"))
            .await
            .unwrap();

        let introspector = Arc::new(MemoryTokenIntrospector::new());
        Fixture {
            validator: TokenValidator::new(introspector.clone(), registry),
            introspector,
            client_id: registered.client_id,
        }
    }

    #[tokio::test]
    async fn test_valid_token() {
        let f = fixture(false).await;
        f.introspector
            .insert(
                IntrospectedToken::active("token-1", &f.client_id, ["openid", "profile"])
                    .with_authorized_user(user()),
            )
            .await;

        let result = f.validator.validate("token-1", None).await.unwrap();
        assert!(result.valid);
        assert_eq!(result.consumer_key, f.client_id);
        assert_eq!(result.authorized_user, user());
        assert_eq!(result.authorization_context_token.token_type, "bearer");
        assert_eq!(result.authorization_context_token.identifier, "token-1");
    }

    #[tokio::test]
    async fn test_inactive_token() {
        let f = fixture(false).await;
        let result = f.validator.validate("unknown", None).await;
        assert!(
            matches!(result, Err(ValidationError::InvalidToken(message)) if message == "Access token validation failed")
        );
    }

    #[tokio::test]
    async fn test_missing_openid_scope() {
        let f = fixture(false).await;
        f.introspector
            .insert(
                IntrospectedToken::active("token-1", &f.client_id, ["profile"])
                    .with_authorized_user(user()),
            )
            .await;
        assert!(matches!(
            f.validator.validate("token-1", None).await,
            Err(ValidationError::InsufficientScope(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_user_and_client() {
        let f = fixture(false).await;
        f.introspector
            .insert(IntrospectedToken::active("no-user", &f.client_id, ["openid"]))
            .await;
        assert!(matches!(
            f.validator.validate("no-user", None).await,
            Err(ValidationError::InvalidToken(_))
        ));

        f.introspector
            .insert(
                IntrospectedToken::active("other-client", "missing", ["openid"])
                    .with_authorized_user(user()),
            )
            .await;
        assert!(matches!(
            f.validator.validate("other-client", None).await,
            Err(ValidationError::Registry(RegistryError::InvalidClient(_)))
        ));
    }

    #[tokio::test]
    async fn test_token_binding_validation() {
        let f = fixture(true).await;
        let binding = TokenBinding {
            binding_type: "certificate".to_string(),
            binding_reference: TokenBinding::reference_for("thumbprint"),
        };
        f.introspector
            .insert(
                IntrospectedToken::active("token-1", &f.client_id, ["openid"])
                    .with_authorized_user(user())
                    .with_token_binding(binding),
            )
            .await;
        f.introspector
            .insert(
                IntrospectedToken::active("unbound", &f.client_id, ["openid"])
                    .with_authorized_user(user()),
            )
            .await;

        let matching = TransportContext::new(Some("thumbprint".to_string()));
        assert!(f.validator.validate("token-1", Some(&matching)).await.is_ok());

        let wrong = TransportContext::new(Some("other".to_string()));
        assert!(matches!(
            f.validator.validate("token-1", Some(&wrong)).await,
            Err(ValidationError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.validator
                .validate("token-1", Some(&TransportContext::default()))
                .await,
            Err(ValidationError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.validator.validate("unbound", Some(&matching)).await,
            Err(ValidationError::InvalidRequest(_))
        ));

        assert!(f.validator.validate("unbound", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unbound_token_for_client_without_binding_validation() {
        let f = fixture(false).await;
        f.introspector
            .insert(
                IntrospectedToken::active("unbound", &f.client_id, ["openid"])
                    .with_authorized_user(user()),
            )
            .await;

        let presented = TransportContext::new(Some("thumbprint".to_string()));
        let result = f
            .validator
            .validate("unbound", Some(&presented))
            .await
            .unwrap();
        assert!(result.valid);
        assert!(result.token_binding.is_none());
    }

    #[test]
    fn test_transport_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-token-binding", "thumbprint".parse().unwrap());
        let context = TransportContext::from_headers(&headers, "x-token-binding");
        assert_eq!(context.presented_binding.as_deref(), Some("thumbprint"));

        let context = TransportContext::from_headers(&HeaderMap::new(), "x-token-binding");
        assert!(context.presented_binding.is_none());
    }
}
