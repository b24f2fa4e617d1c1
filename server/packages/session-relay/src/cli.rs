use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use session_relay_callback_token::{CallbackTokenSigner, TokenError};
use session_relay_sandbox_lifecycle::{
    HttpSandboxControl, InMemorySessionStore, LifecycleConfig, SandboxLifecycle,
};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bundles::StaticBundleSource;
use crate::config::{CoordinatorConfig, DEFAULT_AGENT_COMMAND, DEFAULT_PROMPT_DIR};
use crate::coordinator::{CoordinatorRegistry, RelayServices};
use crate::router::{build_router, AppState, AuthConfig};
use crate::secrets::StaticSecretStore;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2468;
const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_BRIDGE_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_SLEEP_AFTER_SECS: u64 = 2 * 60;
const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 60;
const DEFAULT_COORDINATOR_IDLE_SECS: u64 = 10 * 60;

#[derive(Parser, Debug)]
#[command(name = "session-relay", bin_name = "session-relay")]
#[command(about = "Relays chat sessions into remote agent sandboxes", version)]
#[command(arg_required_else_help = true)]
pub struct SessionRelayCli {
    #[command(subcommand)]
    command: Command,

    /// Operator token required on client routes.
    #[arg(long, short = 't', global = true, env = "SESSION_RELAY_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the session relay HTTP server.
    Server(ServerArgs),
    /// Mint a callback token for an execution, for manual testing.
    SignToken(SignTokenArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST, env = "SESSION_RELAY_HOST")]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT, env = "SESSION_RELAY_PORT")]
    port: u16,

    #[arg(long, env = "SESSION_RELAY_CALLBACK_SECRET", hide_env_values = true)]
    callback_secret: String,

    /// Base URL agents use to reach this server. Defaults to the listen address.
    #[arg(long, env = "SESSION_RELAY_PUBLIC_URL")]
    public_url: Option<String>,

    #[arg(long, env = "SESSION_RELAY_SANDBOX_URL")]
    sandbox_url: String,

    #[arg(long, env = "SESSION_RELAY_SANDBOX_TOKEN", hide_env_values = true)]
    sandbox_token: Option<String>,

    #[arg(long, default_value = DEFAULT_AGENT_COMMAND, env = "SESSION_RELAY_AGENT_COMMAND")]
    agent_command: String,

    #[arg(long, default_value = DEFAULT_PROMPT_DIR, env = "SESSION_RELAY_PROMPT_DIR")]
    prompt_dir: String,

    #[arg(long, env = "SESSION_RELAY_SECRETS_FILE")]
    secrets_file: Option<PathBuf>,

    #[arg(long, env = "SESSION_RELAY_BUNDLES_FILE")]
    bundles_file: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_SESSION_TTL_SECS, env = "SESSION_RELAY_SESSION_TTL_SECS")]
    session_ttl_secs: u64,

    #[arg(long, default_value_t = DEFAULT_BRIDGE_TIMEOUT_SECS, env = "SESSION_RELAY_BRIDGE_TIMEOUT_SECS")]
    bridge_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_SLEEP_AFTER_SECS, env = "SESSION_RELAY_SLEEP_AFTER_SECS")]
    sleep_after_secs: u64,

    /// Deadline of non-streaming sandbox calls.
    #[arg(long, default_value_t = DEFAULT_SANDBOX_TIMEOUT_SECS, env = "SESSION_RELAY_SANDBOX_TIMEOUT_SECS")]
    sandbox_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_COORDINATOR_IDLE_SECS, env = "SESSION_RELAY_COORDINATOR_IDLE_SECS")]
    coordinator_idle_secs: u64,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct SignTokenArgs {
    #[arg(long, env = "SESSION_RELAY_CALLBACK_SECRET", hide_env_values = true)]
    callback_secret: String,

    #[arg(long)]
    session_id: String,

    #[arg(long)]
    execution_id: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("failed to read {}: {source}", .path.display())]
    ConfigFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_session_relay() -> Result<(), CliError> {
    let SessionRelayCli { command, token } = SessionRelayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    match &command {
        Command::Server(args) => run_server(token, args),
        Command::SignToken(args) => sign_token(args),
    }
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

fn sign_token(args: &SignTokenArgs) -> Result<(), CliError> {
    let signer = CallbackTokenSigner::new(args.callback_secret.clone());
    let token = signer.sign(&args.execution_id, &args.session_id)?;
    println!("{token}");
    Ok(())
}

fn build_services(server: &ServerArgs) -> Result<RelayServices, CliError> {
    let control = HttpSandboxControl::new(&server.sandbox_url, server.sandbox_token.clone())
        .map_err(|err| CliError::InvalidUrl {
            url: server.sandbox_url.clone(),
            message: err.to_string(),
        })?
        .with_request_timeout(Duration::from_secs(server.sandbox_timeout_secs));
    let store = InMemorySessionStore::new(Duration::from_secs(server.session_ttl_secs));
    let lifecycle = SandboxLifecycle::new(
        Arc::new(control),
        Arc::new(store),
        LifecycleConfig {
            sleep_after: Duration::from_secs(server.sleep_after_secs),
            ..LifecycleConfig::default()
        },
    );

    let secrets = match &server.secrets_file {
        Some(path) => StaticSecretStore::from_file(path).map_err(|source| CliError::ConfigFile {
            path: path.clone(),
            source,
        })?,
        None => StaticSecretStore::default(),
    };
    let bundles = match &server.bundles_file {
        Some(path) => StaticBundleSource::from_file(path).map_err(|source| CliError::ConfigFile {
            path: path.clone(),
            source,
        })?,
        None => StaticBundleSource::default(),
    };

    let callback_base_url = match &server.public_url {
        Some(public_url) => {
            url::Url::parse(public_url).map_err(|err| CliError::InvalidUrl {
                url: public_url.clone(),
                message: err.to_string(),
            })?;
            public_url.clone()
        }
        None => format!("http://{}:{}", display_host(&server.host), server.port),
    };

    Ok(RelayServices {
        lifecycle,
        secrets: Arc::new(secrets),
        bundles: Arc::new(bundles),
        signer: CallbackTokenSigner::new(server.callback_secret.clone()),
        config: CoordinatorConfig {
            callback_base_url,
            agent_command: server.agent_command.clone(),
            prompt_dir: server.prompt_dir.clone(),
            bridge_timeout: Duration::from_secs(server.bridge_timeout_secs),
            idle_timeout: Duration::from_secs(server.coordinator_idle_secs),
            ..CoordinatorConfig::default()
        },
    })
}

fn display_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "::" => "localhost",
        other => other,
    }
}

fn run_server(token: Option<String>, server: &ServerArgs) -> Result<(), CliError> {
    let auth = match token {
        Some(token) => AuthConfig::with_token(token),
        None => AuthConfig::disabled(),
    };

    let services = build_services(server)?;
    let callback_base_url = services.config.callback_base_url.clone();
    let state = AppState::new(auth, CoordinatorRegistry::new(services));
    let cors = build_cors_layer(server)?;
    let router = build_router(state).layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, callback_base_url = %callback_base_url, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
