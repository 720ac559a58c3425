//! Typed OIDC client properties and their flat key/value encoding.
//!
//! Each client carries a sparse set of OIDC settings persisted as rows of
//! `(client, tenant, key, value)`. Callers work with [`OidcProperties`]; the
//! [`PropertyMap`] form exists only at the store boundary.

use crate::storage::traits::PropertyRow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Subject token lifetime applied when none, or a non-positive one, is configured
pub const DEFAULT_SUBJECT_TOKEN_EXPIRY_SECS: i64 = 180;

/// Token binding type value meaning "no binding"
pub const TOKEN_BINDING_TYPE_NONE: &str = "NONE";

/// Known OIDC property keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKey {
    Audience,
    RequestObjectSigned,
    IdTokenEncrypted,
    IdTokenEncryptionAlgorithm,
    IdTokenEncryptionMethod,
    BackChannelLogoutUrl,
    FrontChannelLogoutUrl,
    TokenType,
    BypassClientCredentials,
    RenewRefreshToken,
    TokenBindingType,
    TokenRevocationWithIdpSessionTermination,
    TokenBindingValidation,
    TokenEndpointAuthMethod,
    TokenEndpointAllowReusePrivateKeyJwt,
    TokenEndpointAuthSigningAlgorithm,
    SectorIdentifierUri,
    IdTokenSignatureAlgorithm,
    RequestObjectSignatureAlgorithm,
    RequestObjectEncryptionAlgorithm,
    RequestObjectEncryptionMethod,
    TlsClientAuthSubjectDn,
    RequirePushedAuthorizationRequests,
    TlsClientCertificateBoundAccessTokens,
    SubjectType,
    FapiConformant,
    SubjectTokenEnabled,
    SubjectTokenExpiryTime,
    HybridFlowEnabled,
    HybridFlowResponseType,
}

impl PropertyKey {
    pub const ALL: [PropertyKey; 30] = [
        PropertyKey::Audience,
        PropertyKey::RequestObjectSigned,
        PropertyKey::IdTokenEncrypted,
        PropertyKey::IdTokenEncryptionAlgorithm,
        PropertyKey::IdTokenEncryptionMethod,
        PropertyKey::BackChannelLogoutUrl,
        PropertyKey::FrontChannelLogoutUrl,
        PropertyKey::TokenType,
        PropertyKey::BypassClientCredentials,
        PropertyKey::RenewRefreshToken,
        PropertyKey::TokenBindingType,
        PropertyKey::TokenRevocationWithIdpSessionTermination,
        PropertyKey::TokenBindingValidation,
        PropertyKey::TokenEndpointAuthMethod,
        PropertyKey::TokenEndpointAllowReusePrivateKeyJwt,
        PropertyKey::TokenEndpointAuthSigningAlgorithm,
        PropertyKey::SectorIdentifierUri,
        PropertyKey::IdTokenSignatureAlgorithm,
        PropertyKey::RequestObjectSignatureAlgorithm,
        PropertyKey::RequestObjectEncryptionAlgorithm,
        PropertyKey::RequestObjectEncryptionMethod,
        PropertyKey::TlsClientAuthSubjectDn,
        PropertyKey::RequirePushedAuthorizationRequests,
        PropertyKey::TlsClientCertificateBoundAccessTokens,
        PropertyKey::SubjectType,
        PropertyKey::FapiConformant,
        PropertyKey::SubjectTokenEnabled,
        PropertyKey::SubjectTokenExpiryTime,
        PropertyKey::HybridFlowEnabled,
        PropertyKey::HybridFlowResponseType,
    ];

    /// Name stored in the property table
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKey::Audience => "audience",
            PropertyKey::RequestObjectSigned => "request_object_signed",
            PropertyKey::IdTokenEncrypted => "id_token_encrypted",
            PropertyKey::IdTokenEncryptionAlgorithm => "id_token_encryption_algorithm",
            PropertyKey::IdTokenEncryptionMethod => "id_token_encryption_method",
            PropertyKey::BackChannelLogoutUrl => "back_channel_logout_url",
            PropertyKey::FrontChannelLogoutUrl => "front_channel_logout_url",
            PropertyKey::TokenType => "token_type",
            PropertyKey::BypassClientCredentials => "bypass_client_credentials",
            PropertyKey::RenewRefreshToken => "renew_refresh_token",
            PropertyKey::TokenBindingType => "token_binding_type",
            PropertyKey::TokenRevocationWithIdpSessionTermination => {
                "token_revocation_with_idp_session_termination"
            }
            PropertyKey::TokenBindingValidation => "token_binding_validation",
            PropertyKey::TokenEndpointAuthMethod => "token_endpoint_auth_method",
            PropertyKey::TokenEndpointAllowReusePrivateKeyJwt => {
                "token_endpoint_allow_reuse_private_key_jwt"
            }
            PropertyKey::TokenEndpointAuthSigningAlgorithm => {
                "token_endpoint_auth_signing_algorithm"
            }
            PropertyKey::SectorIdentifierUri => "sector_identifier_uri",
            PropertyKey::IdTokenSignatureAlgorithm => "id_token_signature_algorithm",
            PropertyKey::RequestObjectSignatureAlgorithm => "request_object_signature_algorithm",
            PropertyKey::RequestObjectEncryptionAlgorithm => "request_object_encryption_algorithm",
            PropertyKey::RequestObjectEncryptionMethod => "request_object_encryption_method",
            PropertyKey::TlsClientAuthSubjectDn => "tls_client_auth_subject_dn",
            PropertyKey::RequirePushedAuthorizationRequests => {
                "require_pushed_authorization_requests"
            }
            PropertyKey::TlsClientCertificateBoundAccessTokens => {
                "tls_client_certificate_bound_access_tokens"
            }
            PropertyKey::SubjectType => "subject_type",
            PropertyKey::FapiConformant => "fapi_conformant",
            PropertyKey::SubjectTokenEnabled => "subject_token_enabled",
            PropertyKey::SubjectTokenExpiryTime => "subject_token_expiry_time",
            PropertyKey::HybridFlowEnabled => "hybrid_flow_enabled",
            PropertyKey::HybridFlowResponseType => "hybrid_flow_response_type",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == value)
    }

    /// Only the audience holds more than one value per client
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, PropertyKey::Audience)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Property values grouped by key, as read from or written to the store
pub type PropertyMap = BTreeMap<PropertyKey, Vec<Option<String>>>;

/// Group stored rows by key. Rows with unknown keys are skipped.
pub fn property_map_from_rows(rows: &[PropertyRow]) -> PropertyMap {
    let mut map = PropertyMap::new();
    for row in rows {
        match PropertyKey::parse(&row.key) {
            Some(key) => map.entry(key).or_default().push(row.value.clone()),
            None => tracing::debug!(key = %row.key, "ignoring unknown OIDC property"),
        }
    }
    map
}

/// Hybrid flow setting where "unset" defers to the server configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridFlow {
    /// `None` when the client never chose, which is distinct from `Some(false)`
    pub enabled: Option<bool>,
    pub response_type: Option<String>,
}

/// Hybrid flow setting after server defaults have been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveHybridFlow {
    pub enabled: bool,
    pub response_type: Option<String>,
}

impl HybridFlow {
    /// Resolve against the server's configured hybrid response types.
    ///
    /// An unset flag enables the flow exactly when the server lists at least
    /// one response type, and then offers all of them.
    pub fn resolve(&self, server_response_types: &[String]) -> EffectiveHybridFlow {
        match self.enabled {
            Some(enabled) => EffectiveHybridFlow {
                enabled,
                response_type: self.response_type.clone(),
            },
            None if server_response_types.is_empty() => EffectiveHybridFlow {
                enabled: false,
                response_type: None,
            },
            None => EffectiveHybridFlow {
                enabled: true,
                response_type: Some(server_response_types.join(",")),
            },
        }
    }
}

/// OIDC settings of a client application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcProperties {
    pub audiences: BTreeSet<String>,
    pub request_object_signed: bool,
    pub id_token_encrypted: bool,
    pub id_token_encryption_algorithm: Option<String>,
    pub id_token_encryption_method: Option<String>,
    pub back_channel_logout_url: Option<String>,
    pub front_channel_logout_url: Option<String>,
    pub token_type: Option<String>,
    pub bypass_client_credentials: bool,
    /// `None` defers to the server's refresh token renewal setting
    pub renew_refresh_token: Option<bool>,
    pub token_binding_type: Option<String>,
    /// Only meaningful with a token binding type
    pub token_revocation_with_idp_session_termination: bool,
    /// Only meaningful with a token binding type
    pub token_binding_validation: bool,
    pub token_endpoint_auth_method: Option<String>,
    pub token_endpoint_allow_reuse_private_key_jwt: Option<bool>,
    pub token_endpoint_auth_signing_algorithm: Option<String>,
    pub sector_identifier_uri: Option<String>,
    pub id_token_signature_algorithm: Option<String>,
    pub request_object_signature_algorithm: Option<String>,
    pub request_object_encryption_algorithm: Option<String>,
    pub request_object_encryption_method: Option<String>,
    pub tls_client_auth_subject_dn: Option<String>,
    pub require_pushed_authorization_requests: bool,
    pub tls_client_certificate_bound_access_tokens: bool,
    pub subject_type: Option<String>,
    pub fapi_conformant: bool,
    pub subject_token_enabled: bool,
    pub subject_token_expiry_time: i64,
    pub hybrid_flow: HybridFlow,
}

impl Default for OidcProperties {
    fn default() -> Self {
        Self {
            audiences: BTreeSet::new(),
            request_object_signed: false,
            id_token_encrypted: false,
            id_token_encryption_algorithm: None,
            id_token_encryption_method: None,
            back_channel_logout_url: None,
            front_channel_logout_url: None,
            token_type: None,
            bypass_client_credentials: false,
            renew_refresh_token: None,
            token_binding_type: None,
            token_revocation_with_idp_session_termination: false,
            token_binding_validation: false,
            token_endpoint_auth_method: None,
            token_endpoint_allow_reuse_private_key_jwt: None,
            token_endpoint_auth_signing_algorithm: None,
            sector_identifier_uri: None,
            id_token_signature_algorithm: None,
            request_object_signature_algorithm: None,
            request_object_encryption_algorithm: None,
            request_object_encryption_method: None,
            tls_client_auth_subject_dn: None,
            require_pushed_authorization_requests: false,
            tls_client_certificate_bound_access_tokens: false,
            subject_type: None,
            fapi_conformant: false,
            subject_token_enabled: false,
            subject_token_expiry_time: DEFAULT_SUBJECT_TOKEN_EXPIRY_SECS,
            hybrid_flow: HybridFlow::default(),
        }
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn first(map: &PropertyMap, key: PropertyKey) -> Option<String> {
    clean(map.get(&key).and_then(|values| values.first().cloned().flatten()))
}

fn flag(map: &PropertyMap, key: PropertyKey) -> bool {
    first(map, key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn tri_state(map: &PropertyMap, key: PropertyKey) -> Option<bool> {
    first(map, key).map(|v| v.eq_ignore_ascii_case("true"))
}

impl OidcProperties {
    /// Apply the invariants every persisted property set satisfies.
    ///
    /// A `NONE` binding type means no binding, and without a binding the
    /// dependent validation and revocation flags are always off.
    pub fn normalized(mut self) -> Self {
        self.audiences = self
            .audiences
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        self.token_binding_type = clean(self.token_binding_type)
            .filter(|t| !t.eq_ignore_ascii_case(TOKEN_BINDING_TYPE_NONE));
        if self.token_binding_type.is_none() {
            self.token_binding_validation = false;
            self.token_revocation_with_idp_session_termination = false;
        }

        if self.subject_token_expiry_time <= 0 {
            self.subject_token_expiry_time = DEFAULT_SUBJECT_TOKEN_EXPIRY_SECS;
        }

        self.id_token_encryption_algorithm = clean(self.id_token_encryption_algorithm);
        self.id_token_encryption_method = clean(self.id_token_encryption_method);
        self.back_channel_logout_url = clean(self.back_channel_logout_url);
        self.front_channel_logout_url = clean(self.front_channel_logout_url);
        self.token_type = clean(self.token_type);
        self.token_endpoint_auth_method = clean(self.token_endpoint_auth_method);
        self.token_endpoint_auth_signing_algorithm =
            clean(self.token_endpoint_auth_signing_algorithm);
        self.sector_identifier_uri = clean(self.sector_identifier_uri);
        self.id_token_signature_algorithm = clean(self.id_token_signature_algorithm);
        self.request_object_signature_algorithm = clean(self.request_object_signature_algorithm);
        self.request_object_encryption_algorithm = clean(self.request_object_encryption_algorithm);
        self.request_object_encryption_method = clean(self.request_object_encryption_method);
        self.tls_client_auth_subject_dn = clean(self.tls_client_auth_subject_dn);
        self.subject_type = clean(self.subject_type);
        self.hybrid_flow.response_type = clean(self.hybrid_flow.response_type);
        self
    }

    /// Decode the stored property map. Audiences are read only when the
    /// audience feature is enabled.
    pub fn from_property_map(map: &PropertyMap, audience_enabled: bool) -> Self {
        let audiences = if audience_enabled {
            map.get(&PropertyKey::Audience)
                .map(|values| values.iter().filter_map(|v| clean(v.clone())).collect())
                .unwrap_or_default()
        } else {
            BTreeSet::new()
        };

        let subject_token_expiry_time = first(map, PropertyKey::SubjectTokenExpiryTime)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_SUBJECT_TOKEN_EXPIRY_SECS);

        Self {
            audiences,
            request_object_signed: flag(map, PropertyKey::RequestObjectSigned),
            id_token_encrypted: flag(map, PropertyKey::IdTokenEncrypted),
            id_token_encryption_algorithm: first(map, PropertyKey::IdTokenEncryptionAlgorithm),
            id_token_encryption_method: first(map, PropertyKey::IdTokenEncryptionMethod),
            back_channel_logout_url: first(map, PropertyKey::BackChannelLogoutUrl),
            front_channel_logout_url: first(map, PropertyKey::FrontChannelLogoutUrl),
            token_type: first(map, PropertyKey::TokenType),
            bypass_client_credentials: flag(map, PropertyKey::BypassClientCredentials),
            renew_refresh_token: tri_state(map, PropertyKey::RenewRefreshToken),
            token_binding_type: first(map, PropertyKey::TokenBindingType),
            token_revocation_with_idp_session_termination: flag(
                map,
                PropertyKey::TokenRevocationWithIdpSessionTermination,
            ),
            token_binding_validation: flag(map, PropertyKey::TokenBindingValidation),
            token_endpoint_auth_method: first(map, PropertyKey::TokenEndpointAuthMethod),
            token_endpoint_allow_reuse_private_key_jwt: tri_state(
                map,
                PropertyKey::TokenEndpointAllowReusePrivateKeyJwt,
            ),
            token_endpoint_auth_signing_algorithm: first(
                map,
                PropertyKey::TokenEndpointAuthSigningAlgorithm,
            ),
            sector_identifier_uri: first(map, PropertyKey::SectorIdentifierUri),
            id_token_signature_algorithm: first(map, PropertyKey::IdTokenSignatureAlgorithm),
            request_object_signature_algorithm: first(
                map,
                PropertyKey::RequestObjectSignatureAlgorithm,
            ),
            request_object_encryption_algorithm: first(
                map,
                PropertyKey::RequestObjectEncryptionAlgorithm,
            ),
            request_object_encryption_method: first(
                map,
                PropertyKey::RequestObjectEncryptionMethod,
            ),
            tls_client_auth_subject_dn: first(map, PropertyKey::TlsClientAuthSubjectDn),
            require_pushed_authorization_requests: flag(
                map,
                PropertyKey::RequirePushedAuthorizationRequests,
            ),
            tls_client_certificate_bound_access_tokens: flag(
                map,
                PropertyKey::TlsClientCertificateBoundAccessTokens,
            ),
            subject_type: first(map, PropertyKey::SubjectType),
            fapi_conformant: flag(map, PropertyKey::FapiConformant),
            subject_token_enabled: flag(map, PropertyKey::SubjectTokenEnabled),
            subject_token_expiry_time,
            hybrid_flow: HybridFlow {
                enabled: tri_state(map, PropertyKey::HybridFlowEnabled),
                response_type: first(map, PropertyKey::HybridFlowResponseType),
            },
        }
        .normalized()
    }

    /// Encode into the stored property map.
    ///
    /// Every single-valued key is present. Absent values and unset tri-state
    /// flags encode as `None` so they are never written as new rows.
    pub fn to_property_map(&self, audience_enabled: bool) -> PropertyMap {
        let mut map = PropertyMap::new();
        let bool_value = |value: bool| Some(value.to_string());
        let mut put = |key: PropertyKey, value: Option<String>| {
            map.insert(key, vec![value]);
        };

        put(PropertyKey::RequestObjectSigned, bool_value(self.request_object_signed));
        put(PropertyKey::IdTokenEncrypted, bool_value(self.id_token_encrypted));
        put(
            PropertyKey::IdTokenEncryptionAlgorithm,
            self.id_token_encryption_algorithm.clone(),
        );
        put(
            PropertyKey::IdTokenEncryptionMethod,
            self.id_token_encryption_method.clone(),
        );
        put(
            PropertyKey::BackChannelLogoutUrl,
            self.back_channel_logout_url.clone(),
        );
        put(
            PropertyKey::FrontChannelLogoutUrl,
            self.front_channel_logout_url.clone(),
        );
        put(PropertyKey::TokenType, self.token_type.clone());
        put(
            PropertyKey::BypassClientCredentials,
            bool_value(self.bypass_client_credentials),
        );
        put(
            PropertyKey::RenewRefreshToken,
            self.renew_refresh_token.map(|v| v.to_string()),
        );
        put(PropertyKey::TokenBindingType, self.token_binding_type.clone());
        put(
            PropertyKey::TokenRevocationWithIdpSessionTermination,
            bool_value(self.token_revocation_with_idp_session_termination),
        );
        put(
            PropertyKey::TokenBindingValidation,
            bool_value(self.token_binding_validation),
        );
        put(
            PropertyKey::TokenEndpointAuthMethod,
            self.token_endpoint_auth_method.clone(),
        );
        put(
            PropertyKey::TokenEndpointAllowReusePrivateKeyJwt,
            self.token_endpoint_allow_reuse_private_key_jwt
                .map(|v| v.to_string()),
        );
        put(
            PropertyKey::TokenEndpointAuthSigningAlgorithm,
            self.token_endpoint_auth_signing_algorithm.clone(),
        );
        put(
            PropertyKey::SectorIdentifierUri,
            self.sector_identifier_uri.clone(),
        );
        put(
            PropertyKey::IdTokenSignatureAlgorithm,
            self.id_token_signature_algorithm.clone(),
        );
        put(
            PropertyKey::RequestObjectSignatureAlgorithm,
            self.request_object_signature_algorithm.clone(),
        );
        put(
            PropertyKey::RequestObjectEncryptionAlgorithm,
            self.request_object_encryption_algorithm.clone(),
        );
        put(
            PropertyKey::RequestObjectEncryptionMethod,
            self.request_object_encryption_method.clone(),
        );
        put(
            PropertyKey::TlsClientAuthSubjectDn,
            self.tls_client_auth_subject_dn.clone(),
        );
        put(
            PropertyKey::RequirePushedAuthorizationRequests,
            bool_value(self.require_pushed_authorization_requests),
        );
        put(
            PropertyKey::TlsClientCertificateBoundAccessTokens,
            bool_value(self.tls_client_certificate_bound_access_tokens),
        );
        put(PropertyKey::SubjectType, self.subject_type.clone());
        put(PropertyKey::FapiConformant, bool_value(self.fapi_conformant));
        put(
            PropertyKey::SubjectTokenEnabled,
            bool_value(self.subject_token_enabled),
        );
        put(
            PropertyKey::SubjectTokenExpiryTime,
            Some(self.subject_token_expiry_time.to_string()),
        );
        put(
            PropertyKey::HybridFlowEnabled,
            self.hybrid_flow.enabled.map(|v| v.to_string()),
        );
        put(
            PropertyKey::HybridFlowResponseType,
            self.hybrid_flow.response_type.clone(),
        );

        if audience_enabled {
            map.insert(
                PropertyKey::Audience,
                self.audiences.iter().cloned().map(Some).collect(),
            );
        }
        map
    }
}
