//! OAuth2 client registry, OIDC properties and access token validation.

pub mod clients;
pub mod introspection;
pub mod oidc_properties;
pub mod properties;
pub mod secret;
pub mod tenancy;
pub mod token_validator;
pub mod types;

// Re-export frequently used items from each module
pub use clients::{ClientRegistry, FirstPartyApp, TenantPurge};
pub use introspection::{
    IntrospectedToken, MemoryTokenIntrospector, RemoteTokenIntrospector, TokenIntrospector,
};
pub use properties::{HybridFlow, OidcProperties, PropertyKey, PropertyStore};
pub use secret::{HashingSecretProcessor, PlainTextSecretProcessor, SecretProcessor};
pub use tenancy::{StaticTenancy, TenantResolver, UserDirectory};
pub use token_validator::{TokenValidator, TransportContext, ValidationResult};
pub use types::{
    AppOwner, AuthorizedUser, ClientApplication, GrantTypes, PkcePolicy, ServiceProvider,
    TenantContext, TokenBinding, TokenExpiry,
};
