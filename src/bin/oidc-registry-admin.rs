//! OIDC Client Registry Administration CLI
//!
//! A command-line interface for operating on the client application registry
//! directly against its store. It covers the full client lifecycle and lets
//! operators check access tokens against registered clients.
//!
//! ## Features
//!
//! - **Registration**: Register client applications with generated or supplied credentials
//! - **Lookup**: Fetch an application by client id or name, or list a user's applications
//! - **Lifecycle**: Activate and deactivate applications, remove one or all of a tenant's
//! - **Token Validation**: Validate an access token through the configured introspection endpoint
//! - **Session Pages**: Print the resolved OIDC logout page configuration
//!
//! ## Usage Examples
//!
//! ### Register an application
//! ```bash
//! oidc-registry-admin register \
//!   --tenant-domain carbon.super \
//!   --name "Orders" \
//!   --owner "PRIMARY/admin" \
//!   --callback-url "https://rp.example.com/callback" \
//!   --grant-type authorization_code \
//!   --grant-type refresh_token \
//!   --audience api://orders
//! ```
//!
//! ### Fetch and list applications
//! ```bash
//! oidc-registry-admin get --tenant-domain carbon.super --client-id "client_id_here"
//! oidc-registry-admin get --tenant-domain carbon.super --name "Orders"
//! oidc-registry-admin list --tenant-domain carbon.super --owner admin
//! ```
//!
//! ### Deactivate and remove
//! ```bash
//! oidc-registry-admin set-state --tenant-domain carbon.super --client-id "client_id_here" --state inactive
//! oidc-registry-admin delete --tenant-domain carbon.super --client-id "client_id_here"
//! oidc-registry-admin purge-tenant --tenant-domain acme.com
//! ```
//!
//! ## Environment Variables
//!
//! The store, tenants and registry behavior come from the same environment as the
//! library configuration, most notably:
//!
//! - `STORAGE_BACKEND`: `memory`, `sqlite` or `postgres`
//! - `DATABASE_URL`: Connection string for the selected backend
//! - `TENANTS`: Tenant table as `domain=id[:organization]` entries
//! - `SECRET_PROCESSOR`: `plaintext` or `hashing`
//! - `INTROSPECTION_ENDPOINT`, `INTROSPECTION_CLIENT_ID`, `INTROSPECTION_CLIENT_SECRET`:
//!   Required by `validate`
//! - `INTROSPECTION_DEFAULT_TENANT_DOMAIN`: Tenant of introspected users whose
//!   response names none (default `carbon.super`)
//!
//! Exit codes:
//! - 0: Success
//! - 1: Configuration or store error
//! - 2: Registry rejected the request (duplicate, unknown client or application)
//! - 3: Token validation failed

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use oidc_registry::config::Config;
use oidc_registry::errors::{RegistryError, ValidationError};
use oidc_registry::oauth::types::{APP_STATE_ACTIVE, APP_STATE_INACTIVE};
use oidc_registry::oauth::{
    AppOwner, ClientApplication, ClientRegistry, GrantTypes, PkcePolicy, RemoteTokenIntrospector,
    TenantContext, TokenValidator, TransportContext,
};
use oidc_registry::storage::{create_storage_backend, parse_storage_backend};
use serde::Serialize;
use std::process;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

/// Main CLI application structure
#[derive(Parser)]
#[command(
    name = "oidc-registry-admin",
    about = "OIDC Client Registry Administration CLI",
    long_about = "Manage OAuth2/OIDC client applications stored in the client registry and \
                  validate access tokens against them.",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Output format
    #[arg(
        long,
        value_enum,
        default_value = "json-pretty",
        help = "Output format for results"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Output format options
#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    /// Compact JSON output
    Json,
    /// Pretty-printed JSON output
    JsonPretty,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Register a new client application
    Register(RegisterArgs),
    /// Get an existing client application
    Get(GetArgs),
    /// List applications of a user or of a client id across tenants
    List(ListArgs),
    /// Activate or deactivate a client application
    SetState(SetStateArgs),
    /// Remove a client application
    Delete(ClientArgs),
    /// Remove every client application of a tenant
    PurgeTenant(TenantArgs),
    /// Validate an OIDC access token
    Validate(ValidateArgs),
    /// Print the OIDC session page configuration
    SessionConfig,
}

#[derive(Args)]
struct TenantArgs {
    /// Tenant domain the command operates in
    #[arg(long, default_value = "carbon.super")]
    tenant_domain: String,
}

#[derive(Args)]
struct ClientArgs {
    #[command(flatten)]
    tenant: TenantArgs,

    /// Client id of the application
    #[arg(long)]
    client_id: String,
}

/// Arguments for client registration
#[derive(Args)]
struct RegisterArgs {
    #[command(flatten)]
    tenant: TenantArgs,

    /// Organization the application resides in
    #[arg(long)]
    organization_id: Option<String>,

    /// Application name
    #[arg(long)]
    name: String,

    /// Owner as `username` or `DOMAIN/username`
    #[arg(long)]
    owner: String,

    /// Client id to use instead of a generated one
    #[arg(long)]
    client_id: Option<String>,

    /// Client secret to use instead of a generated one
    #[arg(long)]
    client_secret: Option<String>,

    /// Callback URL or `regexp=(...)` pattern
    #[arg(long)]
    callback_url: Option<String>,

    /// Grant type (can be specified multiple times)
    #[arg(long = "grant-type")]
    grant_types: Vec<String>,

    /// Require PKCE for the authorization code flow
    #[arg(long)]
    pkce_mandatory: bool,

    /// Allow the plain PKCE challenge method
    #[arg(long)]
    pkce_support_plain: bool,

    /// Token audience (can be specified multiple times)
    #[arg(long = "audience")]
    audiences: Vec<String>,
}

/// Arguments for client retrieval
#[derive(Args)]
struct GetArgs {
    #[command(flatten)]
    tenant: TenantArgs,

    /// Client id of the application
    #[arg(long, conflicts_with = "name", required_unless_present = "name")]
    client_id: Option<String>,

    /// Name of the application
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args)]
struct ListArgs {
    #[command(flatten)]
    tenant: TenantArgs,

    /// Owner as `username` or `DOMAIN/username`
    #[arg(long, conflicts_with = "client_id", required_unless_present = "client_id")]
    owner: Option<String>,

    /// Client id to find in every tenant
    #[arg(long)]
    client_id: Option<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum AppState {
    Active,
    Inactive,
}

impl AppState {
    fn as_str(&self) -> &'static str {
        match self {
            AppState::Active => APP_STATE_ACTIVE,
            AppState::Inactive => APP_STATE_INACTIVE,
        }
    }
}

#[derive(Args)]
struct SetStateArgs {
    #[command(flatten)]
    client: ClientArgs,

    #[arg(long, value_enum)]
    state: AppState,
}

#[derive(Args)]
struct ValidateArgs {
    /// Access token to validate
    #[arg(long)]
    token: String,

    /// Token binding value presented with the token
    #[arg(long)]
    binding: Option<String>,
}

/// Command failures grouped by exit code
enum CommandError {
    Config(anyhow::Error),
    Registry(RegistryError),
    Validation(ValidationError),
}

impl From<anyhow::Error> for CommandError {
    fn from(value: anyhow::Error) -> Self {
        CommandError::Config(value)
    }
}

impl From<RegistryError> for CommandError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::StoreUnavailable { .. } | RegistryError::ConfigurationError(_) => {
                CommandError::Config(value.into())
            }
            other => CommandError::Registry(other),
        }
    }
}

impl From<ValidationError> for CommandError {
    fn from(value: ValidationError) -> Self {
        CommandError::Validation(value)
    }
}

struct AdminContext {
    config: Config,
    registry: Arc<ClientRegistry>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "oidc_registry=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let output = match run(cli.command).await {
        Ok(output) => output,
        Err(CommandError::Config(error)) => {
            eprintln!("Error: {:#}", error);
            process::exit(1);
        }
        Err(CommandError::Registry(error)) => {
            eprintln!("Error: {}", error);
            process::exit(2);
        }
        Err(CommandError::Validation(error)) => {
            eprintln!("Error: {}", error);
            process::exit(3);
        }
    };

    let rendered = match cli.format {
        OutputFormat::Json => serde_json::to_string(&output),
        OutputFormat::JsonPretty => serde_json::to_string_pretty(&output),
    };
    match rendered {
        Ok(rendered) => println!("{}", rendered),
        Err(error) => {
            eprintln!("Error: failed to render output: {}", error);
            process::exit(1);
        }
    }
}

async fn build_context() -> Result<AdminContext> {
    let config = Config::new()?;
    tracing::debug!(version = %config.version, backend = %config.storage_backend, "starting");

    let backend = parse_storage_backend(&config.storage_backend, config.database_url.as_deref())?;
    let store = create_storage_backend(backend)
        .await
        .context("Failed to open client store")?;

    let tenancy = Arc::new(config.tenants.as_ref().clone());
    let registry = Arc::new(ClientRegistry::new(
        store,
        config.secret_processor.build(),
        tenancy.clone(),
        tenancy,
        config.registry.clone(),
    ));

    Ok(AdminContext { config, registry })
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).context("Failed to serialize output")
}

fn session_config() -> Result<serde_json::Value> {
    let config = Config::new()?;
    let session = &config.oidc_session;
    Ok(serde_json::json!({
        "logout_consent_page_url": session.logout_consent_page(false),
        "logout_page_url": session.logout_page(false),
        "logout_consent_page_url_v2": session.logout_consent_page(true),
        "logout_page_url_v2": session.logout_page(true),
        "handle_already_logged_out_sessions_gracefully":
            session.handle_already_logged_out_sessions_gracefully,
    }))
}

async fn run(command: Commands) -> std::result::Result<serde_json::Value, CommandError> {
    if let Commands::SessionConfig = command {
        return Ok(session_config()?);
    }

    let ctx = build_context().await?;
    let registry = ctx.registry.as_ref();

    match command {
        Commands::Register(args) => {
            let owner = AppOwner::from_qualified(&args.owner, &args.tenant.tenant_domain);
            let mut app = ClientApplication::new(args.name, owner);
            app.client_id = args.client_id.unwrap_or_default();
            app.client_secret = args.client_secret;
            app.callback_url = args.callback_url;
            app.grant_types = GrantTypes::parse(&args.grant_types.join(","));
            app.pkce = PkcePolicy {
                mandatory: args.pkce_mandatory,
                support_plain: args.pkce_support_plain,
            };
            app.oidc.audiences = args.audiences.into_iter().collect();

            let mut tenant = TenantContext::new(args.tenant.tenant_domain);
            if let Some(organization_id) = args.organization_id {
                tenant = tenant.with_resident_organization(organization_id);
            }

            let registered = registry.register(app, &tenant).await?;
            Ok(to_json(&registered)?)
        }
        Commands::Get(args) => {
            let app = match (args.client_id, args.name) {
                (Some(client_id), _) => {
                    let tenant_id = registry.tenant_id(&args.tenant.tenant_domain).await?;
                    registry.lookup(&client_id, tenant_id).await?
                }
                (None, Some(name)) => {
                    registry
                        .lookup_by_name(&name, &TenantContext::new(args.tenant.tenant_domain))
                        .await?
                }
                (None, None) => return Err(anyhow!("--client-id or --name is required").into()),
            };
            Ok(to_json(&app)?)
        }
        Commands::List(args) => {
            let apps = match (args.owner, args.client_id) {
                (Some(owner), _) => {
                    let tenant_id = registry.tenant_id(&args.tenant.tenant_domain).await?;
                    registry.lookup_all_for_user(&owner, tenant_id).await?
                }
                (None, Some(client_id)) => registry.lookup_all_for_consumer_key(&client_id).await?,
                (None, None) => {
                    return Err(anyhow!("--owner or --client-id is required").into());
                }
            };
            Ok(to_json(&apps)?)
        }
        Commands::SetState(args) => {
            let tenant_id = registry
                .tenant_id(&args.client.tenant.tenant_domain)
                .await?;
            registry
                .update_state(&args.client.client_id, tenant_id, args.state.as_str())
                .await?;
            Ok(serde_json::json!({
                "client_id": args.client.client_id,
                "state": args.state.as_str(),
            }))
        }
        Commands::Delete(args) => {
            let tenant_id = registry.tenant_id(&args.tenant.tenant_domain).await?;
            registry.remove(&args.client_id, tenant_id).await?;
            Ok(serde_json::json!({ "client_id": args.client_id, "removed": true }))
        }
        Commands::PurgeTenant(args) => {
            let tenant_id = registry.tenant_id(&args.tenant_domain).await?;
            let purge = registry.remove_all_for_tenant(tenant_id).await?;
            Ok(serde_json::json!({
                "tenant_domain": args.tenant_domain,
                "clients": purge.clients,
                "properties": purge.properties,
                "service_provider_links": purge.service_provider_links,
            }))
        }
        Commands::Validate(args) => {
            let settings = ctx
                .config
                .introspection
                .as_ref()
                .ok_or_else(|| anyhow!("INTROSPECTION_ENDPOINT must be set to validate tokens"))?;
            let introspector = RemoteTokenIntrospector::with_timeout(
                *ctx.config.http_client_timeout.as_ref(),
                settings.endpoint.clone(),
                settings.client_id.clone(),
                settings.client_secret.clone(),
            )
            .map_err(ValidationError::from)?
            .with_default_tenant_domain(settings.default_tenant_domain.clone());
            let validator = TokenValidator::new(Arc::new(introspector), ctx.registry.clone())
                .with_app_resident_tenant(ctx.config.app_resident_tenant_domain.clone());

            let transport = args.binding.map(|binding| TransportContext::new(Some(binding)));
            let result = validator.validate(&args.token, transport.as_ref()).await?;
            Ok(serde_json::json!({
                "valid": result.valid,
                "scopes": result.scopes,
                "authorized_user": result.authorized_user,
                "consumer_key": result.consumer_key,
                "token_binding": result.token_binding,
            }))
        }
        Commands::SessionConfig => Ok(session_config()?),
    }
}
