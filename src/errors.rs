//! Standardized error types following the `error-oidcreg-<domain>-<number>` format.

use thiserror::Error;

/// Configuration errors that occur during application startup
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when a required environment variable is not set
    #[error("error-oidcreg-config-1 {0} must be set")]
    EnvVarRequired(String),

    /// Error when version information is not available
    #[error("error-oidcreg-config-2 One of GIT_HASH or CARGO_PKG_VERSION must be set")]
    VersionNotSet,

    /// Error when duration string cannot be parsed
    #[error("error-oidcreg-config-3 Failed to parse duration '{0}': {1}")]
    DurationParsingFailed(String, String),

    /// Error when boolean string cannot be parsed
    #[error(
        "error-oidcreg-config-4 Failed to parse boolean '{0}': expected true/false/1/0/yes/no/on/off"
    )]
    BoolParsingFailed(String),

    /// Error when a URL setting cannot be parsed
    #[error("error-oidcreg-config-5 Invalid URL '{0}': {1}")]
    InvalidUrl(String, String),

    /// Error when a tenant mapping entry is malformed
    #[error("error-oidcreg-config-6 Invalid tenant mapping '{0}': expected domain=id[:organization]")]
    InvalidTenantMapping(String),

    /// Error when the secret processor name is not recognized
    #[error("error-oidcreg-config-7 Unknown secret processor '{0}': expected plaintext or hashing")]
    UnknownSecretProcessor(String),
}

/// Database/storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Error when database connection fails
    #[error("error-oidcreg-storage-1 Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Error when database operation fails
    #[error("error-oidcreg-storage-2 Database error: {0}")]
    DatabaseError(String),

    /// Error when data validation fails
    #[error("error-oidcreg-storage-3 Invalid data: {0}")]
    InvalidData(String),

    /// Error when requested resource is not found
    #[error("error-oidcreg-storage-4 Not found: {0}")]
    NotFound(String),

    /// Error when a uniqueness constraint rejects a write
    #[error("error-oidcreg-storage-5 Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Error when a transaction cannot be committed or rolled back
    #[error("error-oidcreg-storage-6 Transaction failed: {0}")]
    TransactionFailed(String),
}

/// Name of the unique index over (consumer_key, tenant_id).
pub const CONSUMER_KEY_CONSTRAINT: &str = "consumer_key_constraint";

impl StorageError {
    /// Whether this error signals a uniqueness violation on the client id.
    ///
    /// Some backends surface the violation as a typed error, others only
    /// through the constraint name embedded in a driver message.
    pub fn is_duplicate_client(&self) -> bool {
        match self {
            StorageError::ConstraintViolation(_) => true,
            StorageError::DatabaseError(message) => message
                .to_ascii_lowercase()
                .contains(CONSUMER_KEY_CONSTRAINT),
            _ => false,
        }
    }
}

/// Client id and secret post-processing errors
#[derive(Debug, Error)]
pub enum SecretError {
    /// Error when a value cannot be transformed into its stored form
    #[error("error-oidcreg-secret-1 Secret processing failed: {0}")]
    ProcessingFailed(String),

    /// Error when the stored form cannot be turned back into the raw value
    #[error("error-oidcreg-secret-2 Stored value cannot be reversed by the {0} processor")]
    Irreversible(String),
}

/// Tenant, organization and user directory errors
#[derive(Debug, Error)]
pub enum TenantError {
    /// Organization id has no tenant
    #[error("error-oidcreg-tenant-1 Unknown organization: {0}")]
    UnknownOrganization(String),

    /// Tenant domain has no id
    #[error("error-oidcreg-tenant-2 Unknown tenant domain: {0}")]
    UnknownTenantDomain(String),

    /// Tenant id has no domain
    #[error("error-oidcreg-tenant-3 Unknown tenant id: {0}")]
    UnknownTenantId(i64),
}

/// Client registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An application with the same owner and name, or the same client id, already exists
    #[error("error-oidcreg-registry-1 Duplicate client: {0}")]
    DuplicateClient(String),

    /// No application matches the client id
    #[error("error-oidcreg-registry-2 Invalid client: {0}")]
    InvalidClient(String),

    /// No application matches the name
    #[error("error-oidcreg-registry-3 Application not found: {0}")]
    AppNotFound(String),

    /// Persistence layer failure
    #[error("error-oidcreg-registry-4 Store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        #[source]
        source: StorageError,
    },

    /// Client id or secret post-processing failure
    #[error("error-oidcreg-registry-5 Configuration error: {0}")]
    ConfigurationError(String),

    /// Tenant or user directory failure
    #[error("error-oidcreg-registry-6 Tenant resolution failed: {0}")]
    TenantResolution(#[from] TenantError),
}

impl RegistryError {
    /// Wrap a storage failure with a description of the failed operation.
    pub fn store(message: impl Into<String>, source: StorageError) -> Self {
        RegistryError::StoreUnavailable {
            message: message.into(),
            source,
        }
    }
}

impl From<SecretError> for RegistryError {
    fn from(value: SecretError) -> Self {
        RegistryError::ConfigurationError(value.to_string())
    }
}

/// Token introspection transport errors
#[derive(Debug, Error)]
pub enum IntrospectionError {
    /// Error when the introspection endpoint cannot be reached
    #[error("error-oidcreg-introspection-1 Introspection request failed: {0}")]
    RequestFailed(String),

    /// Error when the introspection response cannot be understood
    #[error("error-oidcreg-introspection-2 Invalid introspection response: {0}")]
    InvalidResponse(String),
}

/// Access token validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Token is inactive, unknown, or has no authorized user
    #[error("error-oidcreg-validation-1 Invalid token: {0}")]
    InvalidToken(String),

    /// Token lacks a required scope
    #[error("error-oidcreg-validation-2 Insufficient scope: {0}")]
    InsufficientScope(String),

    /// Request does not satisfy the client's binding policy
    #[error("error-oidcreg-validation-3 Invalid request: {0}")]
    InvalidRequest(String),

    /// Introspection capability failed
    #[error("error-oidcreg-validation-4 {0}")]
    Introspection(#[from] IntrospectionError),

    /// Owning client lookup failed
    #[error("error-oidcreg-validation-5 {0}")]
    Registry(#[from] RegistryError),
}
