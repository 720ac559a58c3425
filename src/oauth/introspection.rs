//! Access token introspection.
//!
//! [`RemoteTokenIntrospector`] speaks RFC 7662 to an authorization server.
//! [`MemoryTokenIntrospector`] answers from tokens registered in-process.

use crate::errors::IntrospectionError;
use crate::oauth::types::{AuthorizedUser, PRIMARY_USER_STORE_DOMAIN, TokenBinding};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;

pub type Result<T> = std::result::Result<T, IntrospectionError>;

/// What the authorization server knows about an access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectedToken {
    pub identifier: String,
    pub active: bool,
    pub scopes: BTreeSet<String>,
    pub authorized_user: Option<AuthorizedUser>,
    /// Client id the token was issued to
    pub consumer_key: Option<String>,
    pub token_binding: Option<TokenBinding>,
}

impl IntrospectedToken {
    pub fn inactive(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            active: false,
            scopes: BTreeSet::new(),
            authorized_user: None,
            consumer_key: None,
            token_binding: None,
        }
    }

    /// An active token issued to `consumer_key`.
    pub fn active(
        identifier: impl Into<String>,
        consumer_key: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            active: true,
            scopes: scopes.into_iter().map(Into::into).collect(),
            authorized_user: None,
            consumer_key: Some(consumer_key.into()),
            token_binding: None,
        }
    }

    pub fn with_authorized_user(mut self, user: AuthorizedUser) -> Self {
        self.authorized_user = Some(user);
        self
    }

    pub fn with_token_binding(mut self, binding: TokenBinding) -> Self {
        self.token_binding = Some(binding);
        self
    }
}

#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<IntrospectedToken>;
}

/// Tokens registered in-process. Unknown tokens are inactive.
#[derive(Default)]
pub struct MemoryTokenIntrospector {
    tokens: RwLock<HashMap<String, IntrospectedToken>>,
}

impl MemoryTokenIntrospector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: IntrospectedToken) {
        let mut tokens = self.tokens.write().await;
        tokens.insert(token.identifier.clone(), token);
    }

    pub async fn revoke(&self, identifier: &str) -> bool {
        let mut tokens = self.tokens.write().await;
        tokens.remove(identifier).is_some()
    }
}

#[async_trait]
impl TokenIntrospector for MemoryTokenIntrospector {
    async fn introspect(&self, token: &str) -> Result<IntrospectedToken> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .get(token)
            .cloned()
            .unwrap_or_else(|| IntrospectedToken::inactive(token)))
    }
}

/// RFC 7662 introspection response
#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    scope: Option<String>,
    username: Option<String>,
    client_id: Option<String>,
    tenant_domain: Option<String>,
    user_store_domain: Option<String>,
    cnf: Option<ConfirmationClaim>,
}

#[derive(Debug, Deserialize)]
struct ConfirmationClaim {
    binding_type: String,
    binding_reference: String,
}

impl IntrospectionResponse {
    /// Users without a `tenant_domain` claim belong to `default_tenant_domain`.
    fn into_token(
        self,
        identifier: &str,
        default_tenant_domain: Option<&str>,
    ) -> IntrospectedToken {
        if !self.active {
            return IntrospectedToken::inactive(identifier);
        }

        let tenant_domain = self
            .tenant_domain
            .filter(|d| !d.is_empty())
            .or_else(|| default_tenant_domain.map(str::to_string));
        let authorized_user = match (self.username, tenant_domain) {
            (Some(username), Some(tenant_domain)) if !username.is_empty() => Some(AuthorizedUser {
                username,
                user_store_domain: self
                    .user_store_domain
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| PRIMARY_USER_STORE_DOMAIN.to_string()),
                tenant_domain,
            }),
            _ => None,
        };

        IntrospectedToken {
            identifier: identifier.to_string(),
            active: true,
            scopes: self
                .scope
                .as_deref()
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            authorized_user,
            consumer_key: self.client_id.filter(|c| !c.is_empty()),
            token_binding: self.cnf.map(|cnf| TokenBinding {
                binding_type: cnf.binding_type,
                binding_reference: cnf.binding_reference,
            }),
        }
    }
}

/// Introspects tokens against a remote RFC 7662 endpoint
pub struct RemoteTokenIntrospector {
    http_client: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
    default_tenant_domain: Option<String>,
}

impl RemoteTokenIntrospector {
    pub fn new(
        http_client: reqwest::Client,
        endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            default_tenant_domain: None,
        }
    }

    /// Tenant assigned to authorized users when the response carries no `tenant_domain`.
    pub fn with_default_tenant_domain(mut self, tenant_domain: impl Into<String>) -> Self {
        self.default_tenant_domain = Some(tenant_domain.into()).filter(|d| !d.is_empty());
        self
    }

    /// Build an introspector with its own HTTP client.
    pub fn with_timeout(
        timeout: Duration,
        endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IntrospectionError::RequestFailed(e.to_string()))?;
        Ok(Self::new(http_client, endpoint, client_id, client_secret))
    }
}

#[async_trait]
impl TokenIntrospector for RemoteTokenIntrospector {
    async fn introspect(&self, token: &str) -> Result<IntrospectedToken> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token), ("token_type_hint", "access_token")])
            .send()
            .await
            .map_err(|e| IntrospectionError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, endpoint = %self.endpoint, "introspection endpoint rejected request");
            return Err(IntrospectionError::RequestFailed(format!(
                "introspection endpoint returned {}",
                status
            )));
        }

        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| IntrospectionError::InvalidResponse(e.to_string()))?;
        Ok(body.into_token(token, self.default_tenant_domain.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_introspector() {
        let introspector = MemoryTokenIntrospector::new();
        introspector
            .insert(IntrospectedToken::active("token-1", "client-1", ["openid"]))
            .await;

        let token = introspector.introspect("token-1").await.unwrap();
        assert!(token.active);
        assert!(token.scopes.contains("openid"));

        assert!(!introspector.introspect("unknown").await.unwrap().active);

        assert!(introspector.revoke("token-1").await);
        assert!(!introspector.introspect("token-1").await.unwrap().active);
    }

    #[test]
    fn test_parse_introspection_response() {
        let body = serde_json::json!({
            "active": true,
            "scope": "openid profile",
            "username": "alice",
            "client_id": "client-1",
            "tenant_domain": "acme.com",
            "cnf": {"binding_type": "certificate", "binding_reference": "abc"}
        });
        let response: IntrospectionResponse = serde_json::from_value(body).unwrap();
        let token = response.into_token("token-1", None);

        assert!(token.active);
        assert_eq!(token.scopes.len(), 2);
        assert_eq!(token.consumer_key.as_deref(), Some("client-1"));
        let user = token.authorized_user.unwrap();
        assert_eq!(user.user_store_domain, "PRIMARY");
        assert_eq!(user.tenant_domain, "acme.com");
        assert_eq!(token.token_binding.unwrap().binding_reference, "abc");
    }

    #[test]
    fn test_inactive_response_discards_claims() {
        let body = serde_json::json!({"active": false, "client_id": "client-1"});
        let response: IntrospectionResponse = serde_json::from_value(body).unwrap();
        let token = response.into_token("token-1", Some("acme.com"));
        assert!(!token.active);
        assert!(token.consumer_key.is_none());
    }

    #[test]
    fn test_missing_tenant_domain_uses_default() {
        let body = serde_json::json!({
            "active": true,
            "scope": "openid",
            "username": "alice",
            "client_id": "client-1"
        });

        let response: IntrospectionResponse = serde_json::from_value(body.clone()).unwrap();
        let user = response
            .into_token("token-1", Some("carbon.super"))
            .authorized_user
            .unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.tenant_domain, "carbon.super");

        let response: IntrospectionResponse = serde_json::from_value(body).unwrap();
        assert!(response.into_token("token-1", None).authorized_user.is_none());
    }
}
